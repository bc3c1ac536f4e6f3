//! Tunnel client: the reconnecting session driver

use crate::config::TunnelConfig;
use crate::http_proxy::HttpProxy;
use crate::reconnect::ReconnectManager;
use crate::session::Session;
use crate::TunnelError;
use outray_proto::{ClientMessage, OutgoingResponse};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Client for one Outray tunnel.
///
/// [`connect`](TunnelClient::connect) keeps a control connection to the relay
/// open until it is cancelled or [`close`](TunnelClient::close) is called,
/// reconnecting with exponential backoff after failures.
pub struct TunnelClient {
    config: Arc<TunnelConfig>,
    http: Option<Arc<HttpProxy>>,
    active: Mutex<Option<Session>>,
    run_token: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl TunnelClient {
    pub fn new(config: TunnelConfig) -> Self {
        // The local HTTP pool outlives individual sessions
        let http = config
            .local_target()
            .filter(|_| config.proxies_http())
            .map(|target| Arc::new(HttpProxy::new(target, config.timeouts.http)));

        Self {
            config: Arc::new(config),
            http,
            active: Mutex::new(None),
            run_token: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Run the connect/retry loop until `cancel` fires or the client is closed.
    ///
    /// Cancellation is not an error: the call returns `Ok(())` once the current
    /// session has been torn down.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let token = cancel.child_token();
        *lock(&self.run_token) = Some(token.clone());
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let mut backoff = ReconnectManager::new(self.config.reconnect.clone());

        info!("Connecting to {}", self.config.server_url);

        while !token.is_cancelled() {
            match self.connect_once(&token).await {
                Ok(()) => {
                    if token.is_cancelled() {
                        break;
                    }
                    info!("Relay closed the connection, reconnecting");
                    backoff.reset();
                }
                Err(e) => {
                    if token.is_cancelled() {
                        break;
                    }
                    warn!(
                        "Connection error: {}. Retrying in {:?}...",
                        e,
                        backoff.current_backoff()
                    );
                    self.config.callbacks.notify_error(&e);

                    if backoff.wait(&token).await.is_err() {
                        break;
                    }
                }
            }
        }

        debug!("Connect loop stopped");
        Ok(())
    }

    /// One connection attempt: handshake, dispatch until the session ends, teardown
    async fn connect_once(&self, token: &CancellationToken) -> Result<(), TunnelError> {
        let opened = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            opened = Session::open(self.config.clone(), self.http.clone(), token) => opened,
        };
        let (session, reader) = opened?;
        *lock(&self.active) = Some(session.clone());

        // close() may have run between open and registration
        let result = if self.shutdown.is_cancelled() {
            Ok(())
        } else {
            tokio::select! {
                _ = token.cancelled() => Ok(()),
                result = session.run(reader) => result,
            }
        };

        {
            let mut active = lock(&self.active);
            if active.as_ref().is_some_and(|s| s.same_as(&session)) {
                *active = None;
            }
        }
        session.close().await;
        result
    }

    /// Send a response frame for `request_id` on the current connection
    pub async fn send_response(
        &self,
        request_id: &str,
        mut response: OutgoingResponse,
    ) -> Result<(), TunnelError> {
        let session = lock(&self.active).clone().ok_or(TunnelError::Closed)?;
        response.request_id = request_id.to_string();
        session.send(&ClientMessage::Response(response)).await
    }

    /// Stop reconnecting and tear down the current session. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(token) = lock(&self.run_token).as_ref() {
            token.cancel();
        }

        let session = lock(&self.active).take();
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(http) = &self.http {
            http.clear_pool().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of TCP streams open on the current session
    pub fn active_streams(&self) -> usize {
        lock(&self.active)
            .as_ref()
            .map(Session::active_streams)
            .unwrap_or(0)
    }
}
