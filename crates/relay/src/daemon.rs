//! Daemon orchestration and monitor loop
//!
//! Owns the whole session: spawns the capture pipeline, fills the preload
//! buffer, starts the relay server, launches the playback client, and then
//! watches process liveness until something ends the session.

use crate::pipeline::{self, Pipeline, PipelineError};
use crate::preload;
use crate::server::{self, ServerError, ServerState};
use crate::shutdown::{terminate_child, ShutdownCoordinator};
use crate::startup::{run_startup_checks, StartupError, ToolPaths};
use bili_audio_relay_config::{ConfigError, RelayConfig};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tracing::{error, info, warn};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Pipeline process error
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Relay server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The playback client closed: the normal way a session ends.
    PlayerClosed,
    /// The fetcher or transcoder died; the relay has no data source.
    UpstreamExited,
    /// Interrupt/terminate signal or an internal shutdown request.
    Signal,
}

/// Daemon state containing all runtime components
#[derive(Debug)]
pub struct RelayDaemon {
    /// Configuration loaded from file and environment
    pub config: RelayConfig,
    /// Resolved locations of the external tools
    pub tools: ToolPaths,
    /// Shared shutdown signal and lifecycle state
    coordinator: ShutdownCoordinator,
}

impl RelayDaemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file
    /// 2. Apply environment overrides
    /// 3. Validate required values (room id)
    /// 4. Resolve the fetcher, transcoder, and player executables
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = RelayConfig::load(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: RelayConfig) -> Result<Self, DaemonError> {
        let tools = run_startup_checks(&config)?;
        Ok(Self {
            config,
            tools,
            coordinator: ShutdownCoordinator::new(),
        })
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when the external tools are not installed.
    pub fn new_without_checks(config: RelayConfig, tools: ToolPaths) -> Self {
        Self {
            config,
            tools,
            coordinator: ShutdownCoordinator::new(),
        }
    }

    /// Get a clone of the shutdown coordinator
    pub fn coordinator(&self) -> ShutdownCoordinator {
        self.coordinator.clone()
    }

    /// Install interrupt/terminate handlers that set the shutdown signal
    /// instead of exiting, so cleanup stays orderly.
    pub fn install_signal_handlers(&self) {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            if wait_for_signal().await.is_ok() {
                info!("interrupt received, shutting down");
                coordinator.begin_shutdown();
            }
        });
    }

    /// Run the full session.
    ///
    /// Sequencing: pipeline spawn -> stderr drains -> preload fill -> bind
    /// listener -> serve -> launch player -> monitor. The preload snapshot
    /// is fully published before the listener exists, so no connection can
    /// observe a half-filled buffer. Returns the reason the session ended;
    /// fatal startup failures tear down anything already spawned first.
    pub async fn run(&self) -> Result<ExitReason, DaemonError> {
        let token = self.coordinator.token();
        let grace = Duration::from_secs(self.config.relay.grace_period_secs);

        info!(room = %self.config.stream.room_id, "starting capture pipeline");
        let fetcher_cmd = pipeline::build_fetcher_command(
            &self.tools.fetcher,
            &self.config.stream.url(),
            &self.config.stream.quality,
        );
        let transcoder_cmd = pipeline::build_transcoder_command(
            &self.tools.transcoder,
            self.config.audio.bitrate_kbps,
            self.config.audio.sample_rate_hz,
        );

        let mut pl = pipeline::spawn_pipeline(fetcher_cmd, transcoder_cmd)?;

        // Log-only stderr drains. The transcoder's must run continuously or
        // it stalls once the pipe fills.
        if let Some(stderr) = pl.fetcher.stderr.take() {
            pipeline::spawn_stderr_drain("fetcher", stderr);
        }
        if let Some(stderr) = pl.transcoder.stderr.take() {
            pipeline::spawn_stderr_drain("transcoder", stderr);
        }

        let Some(mut transcoder_out) = pl.transcoder.stdout.take() else {
            self.coordinator.begin_shutdown();
            self.teardown(&mut pl, None, grace).await;
            self.coordinator.finish();
            return Err(PipelineError::MissingPipe {
                tool: "transcoder",
                stream: "stdout",
            }
            .into());
        };

        // Warmup: the fill routine is the only reader of the transcoder's
        // stdout until it completes; the pump takes over afterwards.
        info!(secs = self.config.relay.preload_secs, "preloading audio");
        let warmup = Duration::from_secs(self.config.relay.preload_secs);
        let preload_buffer = preload::new_preload_buffer();
        match preload::fill(&mut transcoder_out, warmup, &token).await {
            Ok(bytes) => preload::publish(&preload_buffer, bytes),
            Err(e) => {
                error!("preload read failed: {}", e);
                self.coordinator.begin_shutdown();
            }
        }

        if token.is_cancelled() {
            self.teardown(&mut pl, None, grace).await;
            self.coordinator.finish();
            return Ok(ExitReason::Signal);
        }

        let live_tx = server::live_channel();
        server::spawn_stream_pump(transcoder_out, live_tx.clone(), token.clone());

        // The listener must exist before the player is pointed at it.
        let listener = match server::bind_relay(self.config.http.port).await {
            Ok(listener) => listener,
            Err(e) => {
                self.coordinator.begin_shutdown();
                self.teardown(&mut pl, None, grace).await;
                self.coordinator.finish();
                return Err(e.into());
            }
        };

        let state = ServerState::new(preload_buffer, live_tx, token.clone());
        let server_task = tokio::spawn(server::run_relay_server(listener, state));

        let audio_url = self.config.http.audio_url();
        let player_cmd = pipeline::build_player_command(&self.tools.player, &audio_url);
        let mut player = match pipeline::launch_player(player_cmd) {
            Ok(player) => {
                info!(url = %audio_url, "player launched");
                player
            }
            Err(e) => {
                self.coordinator.begin_shutdown();
                self.teardown(&mut pl, None, grace).await;
                self.coordinator.finish();
                return Err(e.into());
            }
        };

        let reason = self.monitor(&mut pl, &mut player).await;

        // Ordered cleanup: the signal is already set, so the server stops
        // accepting; then the children are terminated fetcher, transcoder,
        // player. Each step logs failures and moves on.
        self.teardown(&mut pl, Some(&mut player), grace).await;
        match server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("relay server error during shutdown: {}", e),
            Err(e) => warn!("relay server task failed: {}", e),
        }
        self.coordinator.finish();

        info!(?reason, "session ended");
        Ok(reason)
    }

    /// Watch process liveness until the first exit trigger.
    ///
    /// Polls the player (exit means the user is done) and both upstream
    /// processes (exit means the relay lost its source) every poll interval,
    /// and observes the shutdown signal between polls. Always sets the
    /// shutdown signal before returning.
    pub async fn monitor(&self, pipeline: &mut Pipeline, player: &mut Child) -> ExitReason {
        let token = self.coordinator.token();
        let poll = Duration::from_millis(self.config.relay.poll_interval_ms.max(1));

        let reason = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break ExitReason::Signal,
                _ = tokio::time::sleep(poll) => {}
            }

            if let Ok(Some(status)) = player.try_wait() {
                info!(%status, "player closed");
                break ExitReason::PlayerClosed;
            }
            if let Ok(Some(status)) = pipeline.transcoder.try_wait() {
                warn!(%status, "transcoder exited unexpectedly");
                break ExitReason::UpstreamExited;
            }
            if let Ok(Some(status)) = pipeline.fetcher.try_wait() {
                warn!(%status, "fetcher exited unexpectedly");
                break ExitReason::UpstreamExited;
            }
        };

        self.coordinator.begin_shutdown();
        reason
    }

    /// Terminate every child that exists, in pipeline order. Best effort
    /// throughout; see `terminate_child`.
    async fn teardown(&self, pipeline: &mut Pipeline, player: Option<&mut Child>, grace: Duration) {
        terminate_child("fetcher", &mut pipeline.fetcher, grace).await;
        terminate_child("transcoder", &mut pipeline.transcoder, grace).await;
        if let Some(player) = player {
            terminate_child("player", player, grace).await;
        }
    }
}

/// Wait for an interrupt or terminate signal from the operating system.
#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
