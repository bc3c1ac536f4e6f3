//! WebSocket control-connection transport
//!
//! The connection is split into a [`FrameWriter`], shared by every task that
//! produces outbound frames, and a [`FrameReader`] owned by the dispatch loop.
//! The writer's mutex is the single serialized write path: it also guards the
//! closed flag, so "is closed" and "write frame" are checked atomically.

use crate::TunnelError;
use futures::{Sink, SinkExt, Stream, StreamExt};
use outray_proto::ClientMessage;
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type FrameSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Upper bound on the close handshake when the relay stops reading
pub const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Open the control connection to the relay
pub async fn connect(
    url: &str,
    timeout: Duration,
) -> Result<(FrameWriter, FrameReader), TunnelError> {
    init_crypto_provider();
    debug!("Connecting to relay at {}", url);

    let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| {
            TunnelError::ConnectionError(format!("timed out connecting to {}", url))
        })?
        .map_err(|e| TunnelError::ConnectionError(format!("failed to connect to {}: {}", url, e)))?;

    debug!("Control connection established");

    let (sink, source) = ws_stream.split();
    Ok((FrameWriter::new(sink), FrameReader::new(source)))
}

struct WriterState {
    sink: Option<FrameSink>,
    closed: bool,
}

/// Serialized outbound half of the control connection
#[derive(Clone)]
pub struct FrameWriter {
    state: Arc<Mutex<WriterState>>,
}

impl FrameWriter {
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<Message, Error = WsError> + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(WriterState {
                sink: Some(Box::pin(sink)),
                closed: false,
            })),
        }
    }

    /// Send one frame; fails with [`TunnelError::Closed`] once the writer is closed
    pub async fn send(&self, message: &ClientMessage) -> Result<(), TunnelError> {
        let text = message.to_json()?;
        trace!("Sending {} frame ({} bytes)", message.kind(), text.len());
        self.send_raw(Message::Text(text)).await
    }

    /// WebSocket-level ping used as the session heartbeat
    pub async fn ping(&self) -> Result<(), TunnelError> {
        self.send_raw(Message::Ping(Vec::new())).await
    }

    async fn send_raw(&self, message: Message) -> Result<(), TunnelError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TunnelError::Closed);
        }
        let sink = state.sink.as_mut().ok_or(TunnelError::Closed)?;
        sink.send(message).await?;
        Ok(())
    }

    /// Flip the closed flag and close the socket.
    ///
    /// Returns `true` only for the call that actually performed the close.
    /// The close handshake is abandoned after [`WRITER_CLOSE_TIMEOUT`].
    pub async fn close(&self) -> bool {
        let sink = {
            let mut state = self.state.lock().await;
            if state.closed {
                return false;
            }
            state.closed = true;
            state.sink.take()
        };

        if let Some(mut sink) = sink {
            match tokio::time::timeout(WRITER_CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Error closing control connection: {}", e),
                Err(_) => debug!("Relay did not complete the close handshake, dropping connection"),
            }
        }
        true
    }
}

/// Inbound half of the control connection, owned by the dispatch loop
pub struct FrameReader {
    source: FrameSource,
}

impl FrameReader {
    pub fn new<S>(source: S) -> Self
    where
        S: Stream<Item = Result<Message, WsError>> + Send + 'static,
    {
        Self {
            source: Box::pin(source),
        }
    }

    /// Read the next text frame.
    ///
    /// Returns `Ok(None)` when the relay closed the connection with a normal
    /// close code; any other end of the connection is an error.
    pub async fn next_frame(&mut self) -> Result<Option<String>, TunnelError> {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(Some(frame)))) if frame.code == CloseCode::Normal => {
                    debug!("Relay closed the control connection");
                    return Ok(None);
                }
                Some(Ok(Message::Close(frame))) => {
                    let detail = frame
                        .map(|f| format!("{} {}", f.code, f.reason))
                        .unwrap_or_else(|| "no status".to_string());
                    return Err(TunnelError::ConnectionError(format!(
                        "relay closed the connection abnormally ({})",
                        detail
                    )));
                }
                Some(Ok(Message::Binary(data))) => {
                    trace!("Ignoring {} byte binary frame", data.len());
                }
                // Pings are answered by tungstenite on the next read/write
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(TunnelError::ConnectionError(
                        "control connection ended without a close frame".to_string(),
                    ))
                }
            }
        }
    }
}
