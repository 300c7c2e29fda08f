//! Bilibili live audio relay
//!
//! Chains an external stream fetcher and transcoder into a pipe chain,
//! buffers the first seconds of transcoded audio, and relays the live AAC
//! stream over a loopback HTTP endpoint to a local playback client.

pub mod daemon;
pub mod pipeline;
pub mod preload;
pub mod server;
pub mod shutdown;
pub mod startup;

pub use bili_audio_relay_config as config;
pub use bili_audio_relay_config::RelayConfig;
pub use daemon::{DaemonError, ExitReason, RelayDaemon};
pub use pipeline::{
    build_fetcher_command, build_player_command, build_transcoder_command, launch_player,
    spawn_pipeline, spawn_stderr_drain, Pipeline, PipelineError, CHUNK_SIZE,
};
pub use preload::{new_preload_buffer, PreloadBuffer};
pub use server::{
    bind_relay, create_relay_router, live_channel, run_relay_server, spawn_stream_pump,
    ServerError, ServerState,
};
pub use shutdown::{terminate_child, LifecycleState, ShutdownCoordinator};
pub use startup::{resolve_tool, resolve_tools, run_startup_checks, StartupError, ToolPaths};
