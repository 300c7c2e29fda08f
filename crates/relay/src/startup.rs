//! Startup checks for the audio relay daemon
//!
//! Resolves the three external programs (stream fetcher, transcoder, player)
//! before any child process is spawned, so a missing dependency is reported
//! by name instead of surfacing later as a raw spawn failure.

use bili_audio_relay_config::RelayConfig;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the stream-fetching tool
pub const FETCHER_BIN: &str = "streamlink";

/// Name of the transcoder
pub const TRANSCODER_BIN: &str = "ffmpeg";

/// Name of the playback client
#[cfg(windows)]
pub const PLAYER_BIN: &str = "PotPlayerMini64";

/// Name of the playback client
#[cfg(not(windows))]
pub const PLAYER_BIN: &str = "mpv";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    /// A required external executable could not be located
    #[error("Required executable '{0}' not found on PATH or alongside the program")]
    DependencyMissing(String),

    /// An explicitly configured tool path does not exist
    #[error("Configured path for '{tool}' does not exist: {path}")]
    ToolPathInvalid { tool: String, path: PathBuf },

    /// Configuration is missing a required value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Resolved locations of the three external programs
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPaths {
    pub fetcher: PathBuf,
    pub transcoder: PathBuf,
    pub player: PathBuf,
}

/// Directories searched after PATH: the program's own directory and a
/// `tools/` subdirectory next to it.
fn exe_adjacent_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            dirs.push(dir.to_path_buf());
            dirs.push(dir.join("tools"));
        }
    }
    dirs
}

/// Resolve one tool by name: PATH first, then the extra directories.
pub fn resolve_tool(name: &str, extra_dirs: &[PathBuf]) -> Result<PathBuf, StartupError> {
    if let Ok(path) = which::which(name) {
        return Ok(path);
    }

    for dir in extra_dirs {
        for candidate in [dir.join(name), dir.join(format!("{name}.exe"))] {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(StartupError::DependencyMissing(name.to_string()))
}

/// Resolve a tool, honoring an explicit config override first.
///
/// An override that points at a missing file is its own error; silently
/// falling back to PATH would hide a misconfiguration.
fn resolve_with_override(
    name: &str,
    override_path: Option<&PathBuf>,
    extra_dirs: &[PathBuf],
) -> Result<PathBuf, StartupError> {
    if let Some(path) = override_path {
        if path.is_file() {
            return Ok(path.clone());
        }
        return Err(StartupError::ToolPathInvalid {
            tool: name.to_string(),
            path: path.clone(),
        });
    }

    resolve_tool(name, extra_dirs)
}

/// Resolve all three tools from config overrides, PATH, and the
/// exe-adjacent search directories.
pub fn resolve_tools(cfg: &RelayConfig) -> Result<ToolPaths, StartupError> {
    let extra = exe_adjacent_dirs();
    Ok(ToolPaths {
        fetcher: resolve_with_override(FETCHER_BIN, cfg.tools.fetcher.as_ref(), &extra)?,
        transcoder: resolve_with_override(TRANSCODER_BIN, cfg.tools.transcoder.as_ref(), &extra)?,
        player: resolve_with_override(PLAYER_BIN, cfg.tools.player.as_ref(), &extra)?,
    })
}

/// Run all startup checks in order: config validation, then tool resolution.
///
/// Fails before anything is spawned, naming the specific missing piece.
pub fn run_startup_checks(cfg: &RelayConfig) -> Result<ToolPaths, StartupError> {
    cfg.validate()
        .map_err(|e| StartupError::InvalidConfig(e.to_string()))?;
    resolve_tools(cfg)
}
