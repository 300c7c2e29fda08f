//! CLI entry point for the Bilibili audio relay
//!
//! Parses command line arguments, initializes logging, and runs a relay
//! session until the player closes or a signal arrives.

use bili_audio_relay::{RelayConfig, RelayDaemon};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Configuration file looked up when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Bilibili audio relay - streams a live room's audio to a local player
#[derive(Parser, Debug)]
#[command(name = "bili-audio-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (defaults to config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Live room id (overrides the config file)
    #[arg(short, long)]
    room: Option<String>,

    /// Relay HTTP port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,
}

/// Where the configuration comes from.
#[derive(Debug, PartialEq)]
enum ConfigSource {
    File(PathBuf),
    Defaults,
}

/// Pick the configuration source. An explicitly passed path that does not
/// exist is an error; the fallback path is only used when present, since
/// running without a file is fine when the room id comes from the CLI or env.
fn select_config_source(
    explicit: Option<PathBuf>,
    fallback: &Path,
) -> Result<ConfigSource, PathBuf> {
    match explicit {
        Some(path) if path.is_file() => Ok(ConfigSource::File(path)),
        Some(path) => Err(path),
        None if fallback.is_file() => Ok(ConfigSource::File(fallback.to_path_buf())),
        None => Ok(ConfigSource::Defaults),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let source = match select_config_source(args.config, Path::new(DEFAULT_CONFIG_PATH)) {
        Ok(source) => source,
        Err(path) => {
            error!("config file not found: {}", path.display());
            return ExitCode::FAILURE;
        }
    };

    let mut config = match source {
        ConfigSource::File(path) => match RelayConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        ConfigSource::Defaults => {
            let mut config = RelayConfig::default();
            config.apply_env_overrides();
            config
        }
    };

    if let Some(room) = args.room {
        config.stream.room_id = room;
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }

    let daemon = match RelayDaemon::with_config(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        room = %daemon.config.stream.room_id,
        url = %daemon.config.http.audio_url(),
        "relay starting"
    );

    daemon.install_signal_handlers();

    match daemon.run().await {
        Ok(reason) => {
            info!(?reason, "exited");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("daemon error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_explicit_config_path_is_used_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        File::create(&path).unwrap();

        let source = select_config_source(Some(path.clone()), Path::new("config.toml")).unwrap();
        assert_eq!(source, ConfigSource::File(path));
    }

    // An explicitly passed path that does not exist must be reported, not
    // silently replaced with defaults.
    #[test]
    fn test_missing_explicit_config_path_is_an_error() {
        let bogus = PathBuf::from("/nonexistent/relay.toml");
        let err = select_config_source(Some(bogus.clone()), Path::new("config.toml")).unwrap_err();
        assert_eq!(err, bogus);
    }

    #[test]
    fn test_absent_fallback_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("config.toml");

        let source = select_config_source(None, &fallback).unwrap();
        assert_eq!(source, ConfigSource::Defaults);
    }

    #[test]
    fn test_present_fallback_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("config.toml");
        File::create(&fallback).unwrap();

        let source = select_config_source(None, &fallback).unwrap();
        assert_eq!(source, ConfigSource::File(fallback));
    }
}
