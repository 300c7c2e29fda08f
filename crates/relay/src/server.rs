//! Streaming relay HTTP server
//!
//! Serves the transcoded audio to the local playback client. Each accepted
//! connection first replays the frozen preload snapshot, then joins the live
//! stream of transcoder output.
//!
//! A single pump task is the only reader of the transcoder's stdout once the
//! preload phase hands it over; connections subscribe to its fan-out channel,
//! so concurrent clients never race reads on the same pipe.

use crate::pipeline::CHUNK_SIZE;
use crate::preload::{self, PreloadBuffer};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the live fan-out channel, in chunks (about 1 MiB of audio).
const LIVE_CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur when running the relay server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Relay server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Create the live fan-out channel the pump writes into.
pub fn live_channel() -> broadcast::Sender<Bytes> {
    broadcast::channel(LIVE_CHANNEL_CAPACITY).0
}

/// Shared state passed to all request handlers.
#[derive(Clone)]
pub struct ServerState {
    /// Frozen warmup snapshot, replayed at the head of every response.
    preload: PreloadBuffer,
    /// Sender side of the live fan-out; handlers subscribe on accept.
    live_tx: broadcast::Sender<Bytes>,
    /// Shutdown signal ending every open response body.
    shutdown: CancellationToken,
}

impl ServerState {
    pub fn new(
        preload: PreloadBuffer,
        live_tx: broadcast::Sender<Bytes>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            preload,
            live_tx,
            shutdown,
        }
    }
}

/// Spawn the pump: the single reader of the transcoder's stdout after the
/// preload phase. Reads fixed-size chunks and fans them out to every
/// subscriber. Ends on transcoder EOF, a read error, or shutdown.
pub fn spawn_stream_pump<R>(
    mut stdout: R,
    live_tx: broadcast::Sender<Bytes>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                read = stdout.read(&mut chunk) => match read {
                    Ok(0) => {
                        info!("transcoder output reached end of stream");
                        break;
                    }
                    Ok(n) => {
                        // A send error only means nobody is listening yet.
                        let _ = live_tx.send(Bytes::copy_from_slice(&chunk[..n]));
                    }
                    Err(e) => {
                        warn!("error reading transcoder output: {}", e);
                        break;
                    }
                },
            }
        }
    })
}

/// Handler for the accepted paths: `/` and `/audio.aac`.
///
/// Emits the audio headers, then a body of the preload snapshot followed by
/// live chunks. The body ends when the shutdown signal fires, the pump
/// closes the channel, or the client disconnects; hyper drops the stream on
/// disconnect, so a broken pipe never escalates past this connection.
async fn stream_audio(State(state): State<ServerState>) -> Response {
    let snapshot = preload::snapshot(&state.preload);
    debug!(preload_bytes = snapshot.len(), "starting relay response");

    let live = BroadcastStream::new(state.live_tx.subscribe()).filter_map(|result| async move {
        match result {
            Ok(bytes) => Some(Ok::<_, std::io::Error>(bytes)),
            // A lagging client skips ahead rather than stalling the pump.
            Err(_) => None,
        }
    });

    let head = futures::stream::iter(
        (!snapshot.is_empty()).then(|| Ok::<_, std::io::Error>(Bytes::from(snapshot))),
    );
    let body = Body::from_stream(
        head.chain(live)
            .take_until(state.shutdown.clone().cancelled_owned()),
    );

    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("audio/aac")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::ACCEPT_RANGES, HeaderValue::from_static("none")),
        ],
        body,
    )
        .into_response()
}

/// Any path other than the two accepted ones: 404, no body.
async fn not_found(uri: Uri) -> StatusCode {
    warn!(%uri, "rejected unknown path");
    StatusCode::NOT_FOUND
}

/// Creates the axum Router with the relay endpoints.
pub fn create_relay_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(stream_audio))
        .route("/audio.aac", get(stream_audio))
        .fallback(not_found)
        .with_state(state)
}

/// Bind the relay listener on the loopback address.
///
/// Binding is a separate step so the player is only launched once the
/// listener is confirmed to exist.
pub async fn bind_relay(port: u16) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    info!("relay listening on http://{}", addr);
    Ok(listener)
}

/// Serve until the shutdown signal fires; no new connections are accepted
/// afterwards.
pub async fn run_relay_server(
    listener: TcpListener,
    state: ServerState,
) -> Result<(), ServerError> {
    let shutdown = state.shutdown.clone();
    let app = create_relay_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
