//! Client configuration

use crate::callbacks::Callbacks;
use crate::reconnect::ReconnectConfig;
use crate::TunnelError;
use outray_proto::{IncomingRequest, OpenTunnel, OutgoingResponse, TunnelProtocol, DEFAULT_SERVER_URL};
use std::sync::Arc;
use std::time::Duration;

/// Fixed timeouts applied by the session and relay handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Relay WebSocket handshake and local TCP dial
    pub connect: Duration,
    /// Full round trip to the local HTTP service
    pub http: Duration,
    /// Wait for the single reply datagram from the local UDP service
    pub udp_read: Duration,
    /// Period of the WebSocket ping heartbeat
    pub heartbeat: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            http: Duration::from_secs(30),
            udp_read: Duration::from_secs(5),
            heartbeat: Duration::from_secs(30),
        }
    }
}

/// Tunnel configuration.
///
/// Built once through [`TunnelConfig::builder`]; the client keeps it behind an
/// `Arc` and never mutates it.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub server_url: String,
    pub api_key: String,
    pub protocol: TunnelProtocol,
    pub local_host: String,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub subdomain: Option<String>,
    pub custom_domain: Option<String>,
    pub force_takeover: bool,
    pub reconnect: ReconnectConfig,
    pub timeouts: Timeouts,
    pub callbacks: Callbacks,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_key: String::new(),
            protocol: TunnelProtocol::Http,
            local_host: "localhost".to_string(),
            local_port: None,
            remote_port: None,
            subdomain: None,
            custom_domain: None,
            force_takeover: false,
            reconnect: ReconnectConfig::default(),
            timeouts: Timeouts::default(),
            callbacks: Callbacks::default(),
        }
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Handshake frame announcing this tunnel to the relay
    pub fn handshake(&self) -> OpenTunnel {
        OpenTunnel {
            api_key: self.api_key.clone(),
            protocol: self.protocol,
            port: self.local_port.unwrap_or(0),
            remote_port: self.remote_port,
            subdomain: self.subdomain.clone(),
            custom_domain: self.custom_domain.clone(),
            force_takeover: self.force_takeover,
        }
    }

    /// `host:port` of the local service, if a port is configured
    pub fn local_target(&self) -> Option<String> {
        self.local_port
            .map(|port| format!("{}:{}", self.local_host, port))
    }

    /// Whether unhandled HTTP requests are proxied to the local port
    pub fn proxies_http(&self) -> bool {
        self.protocol == TunnelProtocol::Http && self.local_port.is_some()
    }
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl TunnelConfigBuilder {
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.config.server_url = url.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = key.into();
        self
    }

    pub fn protocol(mut self, protocol: TunnelProtocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = Some(port);
        self
    }

    pub fn remote_port(mut self, port: u16) -> Self {
        self.config.remote_port = Some(port);
        self
    }

    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.config.subdomain = Some(subdomain.into());
        self
    }

    pub fn custom_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.custom_domain = Some(domain.into());
        self
    }

    pub fn force_takeover(mut self, enabled: bool) -> Self {
        self.config.force_takeover = enabled;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.config.callbacks.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_request<F>(mut self, f: F) -> Self
    where
        F: Fn(IncomingRequest) -> OutgoingResponse + Send + Sync + 'static,
    {
        self.config.callbacks.on_request = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&TunnelError) + Send + Sync + 'static,
    {
        self.config.callbacks.on_error = Some(Arc::new(f));
        self
    }

    /// Append a request middleware; middleware runs in registration order
    pub fn request_middleware<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut IncomingRequest) -> Option<OutgoingResponse> + Send + Sync + 'static,
    {
        self.config.callbacks.request_middleware.push(Arc::new(f));
        self
    }

    /// Append a response middleware; middleware runs in registration order
    pub fn response_middleware<F>(mut self, f: F) -> Self
    where
        F: Fn(&IncomingRequest, &mut OutgoingResponse) + Send + Sync + 'static,
    {
        self.config.callbacks.response_middleware.push(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<TunnelConfig, TunnelError> {
        let config = self.config;

        if config.api_key.is_empty() {
            return Err(TunnelError::ConfigError("api_key is required".to_string()));
        }

        let url = url::Url::parse(&config.server_url).map_err(|e| {
            TunnelError::ConfigError(format!("invalid server_url '{}': {}", config.server_url, e))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TunnelError::ConfigError(format!(
                "server_url must use ws:// or wss://, got '{}'",
                url.scheme()
            )));
        }

        if config.local_port == Some(0) {
            return Err(TunnelError::ConfigError(
                "local_port must be non-zero".to_string(),
            ));
        }
        if config.protocol != TunnelProtocol::Http && config.local_port.is_none() {
            return Err(TunnelError::ConfigError(format!(
                "local_port is required for {} tunnels",
                config.protocol
            )));
        }

        if config.reconnect.initial_backoff.is_zero()
            || config.reconnect.initial_backoff > config.reconnect.max_backoff
        {
            return Err(TunnelError::ConfigError(
                "reconnect backoff must satisfy 0 < initial <= max".to_string(),
            ));
        }

        Ok(config)
    }
}
