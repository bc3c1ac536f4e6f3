//! UDP datagram relay
//!
//! Every inbound datagram gets a fresh local socket, one write and at most
//! one reply read under the UDP deadline. Failures are reported and the
//! packet is dropped without a `udp_response`.

use crate::session::SessionContext;
use crate::TunnelError;
use outray_proto::{ClientMessage, UdpPacket};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Large enough for any UDP payload
const UDP_READ_BUFFER: usize = 65535;

pub(crate) async fn relay(ctx: Arc<SessionContext>, packet: UdpPacket) {
    trace!(
        "UDP packet {} from {}:{} ({} bytes)",
        packet.packet_id,
        packet.source_address,
        packet.source_port,
        packet.data.len()
    );

    let reply = match exchange(&ctx, &packet).await {
        Ok(reply) => reply,
        Err(e) => {
            ctx.report(e);
            return;
        }
    };

    let frame = ClientMessage::UdpResponse {
        packet_id: packet.packet_id,
        data: reply,
    };
    if let Err(e) = ctx.writer.send(&frame).await {
        debug!("Dropping UDP reply: {}", e);
    }
}

async fn exchange(ctx: &SessionContext, packet: &UdpPacket) -> Result<Vec<u8>, TunnelError> {
    let target = ctx.config.local_target().ok_or_else(|| {
        TunnelError::LocalServiceError("no local port configured for UDP".to_string())
    })?;
    let local_error = |what: &str, e: std::io::Error| {
        TunnelError::LocalServiceError(format!(
            "UDP packet {}: {} {}: {}",
            packet.packet_id, what, target, e
        ))
    };

    let addrs = lookup_host(&target)
        .await
        .map_err(|e| local_error("failed to resolve", e))?;
    let addr = preferred_address(addrs).ok_or_else(|| {
        TunnelError::LocalServiceError(format!("no address found for {}", target))
    })?;

    let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| local_error("failed to bind socket for", e))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| local_error("failed to connect to", e))?;
    socket
        .send(&packet.data)
        .await
        .map_err(|e| local_error("failed to send to", e))?;

    let deadline = ctx.config.timeouts.udp_read;
    let mut buf = vec![0u8; UDP_READ_BUFFER];
    let n = timeout(deadline, socket.recv(&mut buf))
        .await
        .map_err(|_| {
            TunnelError::LocalServiceError(format!(
                "UDP packet {}: no reply from {} within {:?}",
                packet.packet_id, target, deadline
            ))
        })?
        .map_err(|e| local_error("failed to read from", e))?;

    buf.truncate(n);
    Ok(buf)
}

/// First IPv4 address, else the first address. A service bound to
/// 127.0.0.1 never answers datagrams sent to `::1`.
fn preferred_address(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddr> {
    let mut fallback = None;
    for addr in addrs {
        if addr.is_ipv4() {
            return Some(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback
}
