//! Process supervisor for the capture pipeline
//!
//! Spawns the stream fetcher and the transcoder as a pipe chain, keeps their
//! stderr streams drained into the log, and launches the playback client
//! once the relay is listening.

use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::debug;

/// Fixed read size for chunks pulled from the transcoder's stdout.
pub const CHUNK_SIZE: usize = 4096;

/// Error type for pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Process creation failed for an executable that was resolved
    #[error("Failed to spawn {tool}: {source}")]
    Spawn {
        tool: &'static str,
        source: std::io::Error,
    },

    /// A spawned child did not expose an expected standard-stream pipe
    #[error("{tool} did not expose a {stream} pipe")]
    MissingPipe {
        tool: &'static str,
        stream: &'static str,
    },
}

/// Handles to the two upstream processes, wired stdout-to-stdin.
///
/// Owned exclusively by the supervisor; the transcoder's stdout and both
/// stderr handles are taken out of here by the daemon during startup.
#[derive(Debug)]
pub struct Pipeline {
    pub fetcher: Child,
    pub transcoder: Child,
}

/// Build the fetcher command: emit the best available stream to stdout,
/// keep its own logging on stderr at error level only.
pub fn build_fetcher_command(path: &Path, url: &str, quality: &str) -> Command {
    let mut cmd = Command::new(path);
    cmd.arg("--stdout");
    cmd.arg("--loglevel").arg("error");
    cmd.arg(url);
    cmd.arg(quality);
    configure_background(&mut cmd);
    cmd
}

/// Build the transcoder command: raw media on stdin, video stripped, audio
/// encoded to AAC at a fixed bitrate and sample rate, ADTS frames on stdout.
pub fn build_transcoder_command(path: &Path, bitrate_kbps: u32, sample_rate_hz: u32) -> Command {
    let mut cmd = Command::new(path);
    cmd.arg("-loglevel").arg("info");
    cmd.arg("-i").arg("pipe:0");
    cmd.arg("-vn");
    cmd.arg("-c:a").arg("aac");
    cmd.arg("-b:a").arg(format!("{}k", bitrate_kbps));
    cmd.arg("-ar").arg(sample_rate_hz.to_string());
    cmd.arg("-f").arg("adts");
    cmd.arg("-");
    configure_background(&mut cmd);
    cmd
}

/// Build the player command: the relay URL is its only argument.
pub fn build_player_command(path: &Path, audio_url: &str) -> Command {
    let mut cmd = Command::new(path);
    cmd.arg(audio_url);
    configure_background(&mut cmd);
    cmd
}

/// Keep children off the desktop on Windows (CREATE_NO_WINDOW).
#[cfg(windows)]
fn configure_background(cmd: &mut Command) {
    cmd.creation_flags(0x0800_0000);
}

#[cfg(not(windows))]
fn configure_background(_cmd: &mut Command) {}

/// Spawn the fetcher and transcoder connected as a pipe chain.
///
/// The fetcher's stdout handle is moved into the transcoder's stdin during
/// wiring, so once this returns the supervisor holds no copy of that pipe's
/// write end. Keeping a copy open would stop the transcoder's stdin from
/// ever reaching EOF when the fetcher exits, wedging the whole chain.
pub fn spawn_pipeline(
    mut fetcher_cmd: Command,
    mut transcoder_cmd: Command,
) -> Result<Pipeline, PipelineError> {
    let mut fetcher = fetcher_cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| PipelineError::Spawn {
            tool: "fetcher",
            source,
        })?;

    let fetcher_out = fetcher.stdout.take().ok_or(PipelineError::MissingPipe {
        tool: "fetcher",
        stream: "stdout",
    })?;
    let fetcher_out: Stdio = fetcher_out
        .try_into()
        .map_err(|source| PipelineError::Spawn {
            tool: "transcoder",
            source,
        })?;

    let transcoder = transcoder_cmd
        .stdin(fetcher_out)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| PipelineError::Spawn {
            tool: "transcoder",
            source,
        })?;

    Ok(Pipeline {
        fetcher,
        transcoder,
    })
}

/// Launch the playback client. Only called after the relay listener is
/// bound, so the URL it receives is already serving.
pub fn launch_player(mut cmd: Command) -> Result<Child, PipelineError> {
    cmd.kill_on_drop(true)
        .spawn()
        .map_err(|source| PipelineError::Spawn {
            tool: "player",
            source,
        })
}

/// Continuously drain a child's stderr into the log.
///
/// The transcoder writes progress reports to stderr and blocks once that
/// pipe fills, so its drain must run for the lifetime of the process.
pub fn spawn_stderr_drain(tool: &'static str, stderr: ChildStderr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(tool, "{}", line);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::OsStr;
    use std::path::PathBuf;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2)
            .any(|pair| pair[0] == flag && pair[1] == value)
    }

    /// Helper to check if args contain a standalone flag
    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    // *For any* room URL and quality, the fetcher command SHALL direct the
    // stream to stdout, quiet its own logging, and name the URL and quality
    // as positional arguments in that order.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_fetcher_command_completeness(
            room_id in "[0-9]{1,9}",
            quality in prop::sample::select(vec!["best", "worst", "720p", "audio_only"]),
        ) {
            let url = format!("https://live.bilibili.com/{}", room_id);
            let cmd = build_fetcher_command(&PathBuf::from("streamlink"), &url, quality);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.as_std().get_program(), OsStr::new("streamlink"));
            prop_assert!(has_flag(&args, "--stdout"));
            prop_assert!(has_flag_with_value(&args, "--loglevel", "error"));

            // URL then quality, in order, at the end of the argv
            let len = args.len();
            prop_assert!(len >= 2);
            prop_assert_eq!(args[len - 2].as_str(), url.as_str());
            prop_assert_eq!(args[len - 1].as_str(), quality);
        }

        #[test]
        fn prop_transcoder_command_completeness(
            bitrate in 32u32..512,
            sample_rate in prop::sample::select(vec![22_050u32, 44_100, 48_000]),
        ) {
            let cmd = build_transcoder_command(&PathBuf::from("ffmpeg"), bitrate, sample_rate);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.as_std().get_program(), OsStr::new("ffmpeg"));

            // Raw media arrives on stdin
            prop_assert!(has_flag_with_value(&args, "-i", "pipe:0"));

            // Video stripped, AAC at the configured bitrate and sample rate
            prop_assert!(has_flag(&args, "-vn"));
            prop_assert!(has_flag_with_value(&args, "-c:a", "aac"));
            let expected_bitrate = format!("{}k", bitrate);
            prop_assert!(has_flag_with_value(&args, "-b:a", &expected_bitrate));
            prop_assert!(has_flag_with_value(&args, "-ar", &sample_rate.to_string()));

            // ADTS frames on stdout
            prop_assert!(has_flag_with_value(&args, "-f", "adts"));
            prop_assert_eq!(args.last().map(String::as_str), Some("-"));
        }
    }

    #[test]
    fn test_player_command_gets_relay_url_as_only_arg() {
        let cmd = build_player_command(
            &PathBuf::from("mpv"),
            "http://127.0.0.1:8765/audio.aac",
        );
        let args = get_command_args(&cmd);
        assert_eq!(args, vec!["http://127.0.0.1:8765/audio.aac"]);
    }

    #[tokio::test]
    async fn test_spawn_failure_names_the_stage() {
        let fetcher_cmd = Command::new("/nonexistent/fetcher-tool-xyz");
        let transcoder_cmd = Command::new("/nonexistent/transcoder-tool-xyz");

        let err = spawn_pipeline(fetcher_cmd, transcoder_cmd).unwrap_err();
        match err {
            PipelineError::Spawn { tool, .. } => assert_eq!(tool, "fetcher"),
            other => panic!("expected Spawn, got {:?}", other),
        }
    }

    // Regression: after wiring, the supervisor must hold no fetcher stdout
    // handle, and the transcoder must see EOF once the fetcher exits. If
    // the write end leaked, read_to_end below would hang forever.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_wiring_closes_supervisor_write_end() {
        use std::time::Duration;
        use tokio::io::AsyncReadExt;

        let mut fetcher_cmd = Command::new("echo");
        fetcher_cmd.arg("adts-bytes");
        let transcoder_cmd = Command::new("cat");

        let mut pipeline = spawn_pipeline(fetcher_cmd, transcoder_cmd).unwrap();
        assert!(pipeline.fetcher.stdout.is_none());

        let mut out = pipeline.transcoder.stdout.take().unwrap();
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), out.read_to_end(&mut buf))
            .await
            .expect("transcoder stdout never reached EOF")
            .unwrap();
        assert_eq!(buf, b"adts-bytes\n");

        pipeline.fetcher.wait().await.unwrap();
        pipeline.transcoder.wait().await.unwrap();
    }

    // The transcoder's output must arrive unmodified through the chain.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipeline_relays_fetcher_bytes_in_order() {
        use tokio::io::AsyncReadExt;

        let mut fetcher_cmd = Command::new("printf");
        fetcher_cmd.arg("abc123xyz");
        let transcoder_cmd = Command::new("cat");

        let mut pipeline = spawn_pipeline(fetcher_cmd, transcoder_cmd).unwrap();
        let mut out = pipeline.transcoder.stdout.take().unwrap();
        let mut buf = Vec::new();
        out.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"abc123xyz");

        pipeline.fetcher.wait().await.unwrap();
        pipeline.transcoder.wait().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_drain_consumes_lines() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo progress line >&2");
        cmd.stderr(Stdio::piped());
        let mut child = cmd.spawn().unwrap();

        let stderr = child.stderr.take().unwrap();
        let drain = spawn_stderr_drain("transcoder", stderr);

        child.wait().await.unwrap();
        drain.await.unwrap();
    }
}
