//! One control-connection lifetime
//!
//! A [`Session`] owns the transport writer, the stream table and every task
//! spawned while the connection is up. It is created per connection attempt
//! and torn down unconditionally when the attempt ends.

use crate::config::TunnelConfig;
use crate::dispatcher;
use crate::http_proxy::HttpProxy;
use crate::stream_table::StreamTable;
use crate::transport::{self, FrameReader, FrameWriter};
use crate::TunnelError;
use outray_proto::ClientMessage;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long teardown waits for session tasks to wind down
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// State shared by the dispatcher and every relay task of a session
pub(crate) struct SessionContext {
    pub(crate) config: Arc<TunnelConfig>,
    pub(crate) writer: FrameWriter,
    pub(crate) streams: StreamTable,
    pub(crate) http: Option<Arc<HttpProxy>>,
    pub(crate) tasks: TaskTracker,
    pub(crate) shutdown: CancellationToken,
}

impl SessionContext {
    /// Spawn a session-owned task that is dropped at teardown
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    /// Report a non-fatal error to the log and the error callback
    pub(crate) fn report(&self, err: TunnelError) {
        warn!("{}", err);
        self.config.callbacks.notify_error(&err);
    }
}

#[derive(Clone)]
pub struct Session {
    ctx: Arc<SessionContext>,
}

impl Session {
    pub(crate) fn new(
        config: Arc<TunnelConfig>,
        http: Option<Arc<HttpProxy>>,
        writer: FrameWriter,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            ctx: Arc::new(SessionContext {
                config,
                writer,
                streams: StreamTable::new(),
                http,
                tasks: TaskTracker::new(),
                shutdown: parent.child_token(),
            }),
        }
    }

    /// Connect to the relay, send the handshake and start the heartbeat
    pub(crate) async fn open(
        config: Arc<TunnelConfig>,
        http: Option<Arc<HttpProxy>>,
        parent: &CancellationToken,
    ) -> Result<(Self, FrameReader), TunnelError> {
        let (writer, reader) =
            transport::connect(&config.server_url, config.timeouts.connect).await?;
        let session = Self::new(config, http, writer, parent);

        let handshake = ClientMessage::OpenTunnel(session.ctx.config.handshake());
        if let Err(e) = session.ctx.writer.send(&handshake).await {
            session.close().await;
            return Err(e);
        }
        debug!(
            "Sent handshake (protocol: {}, port: {})",
            session.ctx.config.protocol,
            session.ctx.config.local_port.unwrap_or(0)
        );

        session.start_heartbeat();
        Ok((session, reader))
    }

    fn start_heartbeat(&self) {
        let writer = self.ctx.writer.clone();
        let period = self.ctx.config.timeouts.heartbeat;

        self.ctx.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if let Err(e) = writer.ping().await {
                    debug!("Heartbeat stopped: {}", e);
                    break;
                }
            }
        });
    }

    /// Run the dispatch loop until the relay closes or the transport fails
    pub(crate) async fn run(&self, reader: FrameReader) -> Result<(), TunnelError> {
        dispatcher::run(self.ctx.clone(), reader).await
    }

    /// Send a frame on this session's control connection
    pub(crate) async fn send(&self, message: &ClientMessage) -> Result<(), TunnelError> {
        self.ctx.writer.send(message).await
    }

    pub fn active_streams(&self) -> usize {
        self.ctx.streams.len()
    }

    pub(crate) fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.ctx, &other.ctx)
    }

    /// Tear the session down. Safe to call more than once.
    pub async fn close(&self) {
        // Cancel first so tasks blocked on the writer release it
        self.ctx.shutdown.cancel();

        let first = self.ctx.writer.close().await;
        let streams = self.ctx.streams.close_all();
        self.ctx.tasks.close();

        if first {
            info!("Session closed ({} active streams)", streams);
        }

        if tokio::time::timeout(CLOSE_GRACE_PERIOD, self.ctx.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "{} session tasks still running after {:?}",
                self.ctx.tasks.len(),
                CLOSE_GRACE_PERIOD
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::channel_transport;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_tungstenite::tungstenite::Message;

    fn config() -> Arc<TunnelConfig> {
        Arc::new(TunnelConfig::builder().api_key("k").build().unwrap())
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_sends() {
        let (writer, _reader, mut out, _in) = channel_transport();
        let session = Session::new(config(), None, writer, &CancellationToken::new());

        session.close().await;
        session.close().await;

        assert!(session.context().shutdown.is_cancelled());
        assert!(matches!(
            session.send(&ClientMessage::UdpResponse {
                packet_id: "p".into(),
                data: vec![1],
            })
            .await,
            Err(TunnelError::Closed)
        ));
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_cancels_spawned_tasks() {
        let (writer, _reader, _out, _in) = channel_transport();
        let session = Session::new(config(), None, writer, &CancellationToken::new());

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        session.context().spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
        });

        session.close().await;
        assert!(session.context().tasks.is_empty());
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sends_pings() {
        let (writer, _reader, mut out, _in) = channel_transport();
        let config = Arc::new(
            TunnelConfig::builder()
                .api_key("k")
                .timeouts(crate::Timeouts {
                    heartbeat: Duration::from_secs(1),
                    ..Default::default()
                })
                .build()
                .unwrap(),
        );
        let session = Session::new(config, None, writer, &CancellationToken::new());
        session.start_heartbeat();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        session.close().await;

        let mut pings = 0;
        while let Some(msg) = out.next().await {
            if matches!(msg, Message::Ping(_)) {
                pings += 1;
            }
        }
        assert_eq!(pings, 2);
    }
}
