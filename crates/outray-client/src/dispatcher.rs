//! Inbound frame dispatch
//!
//! Reads frames until the relay closes the connection or the transport
//! fails, routing each one to its handler. Request, TCP connection and UDP
//! frames are handled on session-owned tasks; `tcp_data` is delivered inline
//! so bytes for one stream keep their order. Delivery never waits: a stream
//! whose buffer is full is closed instead of stalling every other frame.

use crate::session::SessionContext;
use crate::transport::FrameReader;
use crate::{tcp_relay, udp_relay, TunnelError};
use bytes::Bytes;
use outray_proto::{ClientMessage, IncomingRequest, OutgoingResponse, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace, warn};

pub(crate) async fn run(ctx: Arc<SessionContext>, mut reader: FrameReader) -> Result<(), TunnelError> {
    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => return Ok(()),
            frame = reader.next_frame() => frame?,
        };

        match frame {
            Some(text) => dispatch(&ctx, &text).await,
            None => return Ok(()),
        }
    }
}

async fn dispatch(ctx: &Arc<SessionContext>, text: &str) {
    let message = match ServerMessage::decode(text) {
        Ok(Some(message)) => message,
        Ok(None) => {
            debug!("Ignoring frame of unknown type");
            return;
        }
        Err(e) => {
            warn!("Skipping malformed frame: {}", e);
            return;
        }
    };

    trace!("Received {} frame", message.kind());

    match message {
        ServerMessage::TunnelOpened { url } => {
            info!("Tunnel opened at {}", url);
            ctx.config.callbacks.notify_open(&url);
        }
        ServerMessage::Request(request) => {
            let task_ctx = ctx.clone();
            ctx.spawn(respond(task_ctx, request));
        }
        ServerMessage::TcpConnection { connection_id } => {
            let task_ctx = ctx.clone();
            ctx.spawn(tcp_relay::relay(task_ctx, connection_id));
        }
        ServerMessage::TcpData {
            connection_id,
            data,
        } => {
            deliver_tcp_data(ctx, &connection_id, data);
        }
        ServerMessage::UdpData(packet) => {
            let task_ctx = ctx.clone();
            ctx.spawn(udp_relay::relay(task_ctx, packet));
        }
        ServerMessage::Error { message } => {
            ctx.report(TunnelError::Relay(message));
        }
    }
}

fn deliver_tcp_data(ctx: &SessionContext, connection_id: &str, data: Vec<u8>) {
    let Some((serial, sender)) = ctx.streams.route(connection_id) else {
        trace!("Dropping data for unknown stream {}", connection_id);
        return;
    };

    match sender.try_send(Bytes::from(data)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            if ctx.streams.remove(connection_id, serial) {
                ctx.report(TunnelError::LocalServiceError(format!(
                    "stream {} is not draining, closing it",
                    connection_id
                )));
            }
        }
        Err(TrySendError::Closed(_)) => {
            trace!("Stream {} closed before data was delivered", connection_id);
        }
    }
}

/// Produce and send the response for one relayed HTTP request
async fn respond(ctx: Arc<SessionContext>, mut request: IncomingRequest) {
    let callbacks = &ctx.config.callbacks;

    let response = match callbacks.apply_request_middleware(&mut request) {
        Some(early) => Some(early),
        None => produce_response(&ctx, &request).await,
    };

    let Some(mut response) = response else {
        debug!(
            "No handler or local port for request {}, not responding",
            request.request_id
        );
        return;
    };

    callbacks.apply_response_middleware(&request, &mut response);
    response.request_id = request.request_id.clone();

    match ctx.writer.send(&ClientMessage::Response(response)).await {
        Ok(()) => {}
        Err(TunnelError::Closed) => {
            debug!("Session closed before response to {} was sent", request.request_id);
        }
        Err(e) => ctx.report(e),
    }
}

async fn produce_response(ctx: &SessionContext, request: &IncomingRequest) -> Option<OutgoingResponse> {
    let callbacks = &ctx.config.callbacks;
    if callbacks.has_request_handler() {
        return callbacks.handle_request(request.clone()).map(|result| {
            result.unwrap_or_else(|e| {
                ctx.report(e);
                OutgoingResponse::text(500, "Internal Server Error")
            })
        });
    }

    if ctx.config.proxies_http() {
        if let Some(http) = &ctx.http {
            return Some(http.forward_safe(request).await);
        }
    }
    None
}
