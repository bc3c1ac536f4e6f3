//! Outray tunnel client
//!
//! Keeps one WebSocket control connection to the Outray relay and multiplexes
//! relayed HTTP requests, TCP streams and UDP datagrams over it to a local
//! service.
//!
//! ```no_run
//! use outray_client::{TunnelClient, TunnelConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), outray_client::TunnelError> {
//! let config = TunnelConfig::builder()
//!     .api_key("your-api-key")
//!     .local_port(3000)
//!     .on_open(|url| println!("Tunnel ready at {}", url))
//!     .build()?;
//!
//! let client = TunnelClient::new(config);
//! client.connect(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
pub mod client;
pub mod config;
pub mod error;
pub mod http_proxy;
pub mod reconnect;
pub mod stream_table;
pub mod transport;

mod dispatcher;
mod session;
mod tcp_relay;
mod udp_relay;

pub use callbacks::{
    Callbacks, ErrorCallback, OpenCallback, RequestHandler, RequestMiddleware, ResponseMiddleware,
};
pub use client::TunnelClient;
pub use config::{Timeouts, TunnelConfig, TunnelConfigBuilder};
pub use error::TunnelError;
pub use http_proxy::{HttpProxy, ProxyError};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};

pub use outray_proto::{
    ClientMessage, IncomingRequest, OpenTunnel, OutgoingResponse, ServerMessage, TunnelProtocol,
    UdpPacket, DEFAULT_SERVER_URL,
};
