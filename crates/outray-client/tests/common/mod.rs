//! In-process mock relay for integration tests
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use outray_client::{ClientMessage, OpenTunnel, ServerMessage};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("outray_client=debug")
        .try_init();
}

/// WebSocket server standing in for the Outray relay
pub struct MockRelay {
    listener: TcpListener,
    pub url: String,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        Self { listener, url }
    }

    /// Accept the next client connection
    pub async fn accept(&self) -> RelayConn {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("client did not connect in time")
            .unwrap();
        let ws = accept_async(stream).await.unwrap();
        RelayConn { ws }
    }

    /// Accept a connection and consume its handshake
    pub async fn accept_tunnel(&self) -> (RelayConn, OpenTunnel) {
        let mut conn = self.accept().await;
        let handshake = conn.expect_handshake().await;
        (conn, handshake)
    }
}

/// One accepted control connection, seen from the relay side
pub struct RelayConn {
    ws: WebSocketStream<TcpStream>,
}

impl RelayConn {
    pub async fn send(&mut self, message: &ServerMessage) {
        self.send_raw(&message.to_json().unwrap()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Next client frame, or `None` once the client closed the connection
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        while let Some(msg) = self.ws.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(ClientMessage::from_json(&text).unwrap()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ClientMessage> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Next client frame; panics if none arrives within the step timeout
    pub async fn expect(&mut self) -> ClientMessage {
        self.recv_timeout(STEP_TIMEOUT)
            .await
            .expect("expected a frame from the client")
    }

    pub async fn expect_handshake(&mut self) -> OpenTunnel {
        match self.expect().await {
            ClientMessage::OpenTunnel(open) => open,
            other => panic!("Expected open_tunnel, got {:?}", other),
        }
    }

    /// Wait until the client side has closed the connection
    pub async fn expect_closed(&mut self) {
        let frame = tokio::time::timeout(STEP_TIMEOUT, self.recv())
            .await
            .expect("connection was not closed in time");
        assert!(frame.is_none(), "unexpected frame after close: {:?}", frame);
    }

    pub async fn close_normal(mut self) {
        let _ = self
            .ws
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await;
    }

    /// Drop the TCP connection without a close handshake
    pub fn abort(self) {
        drop(self);
    }
}
