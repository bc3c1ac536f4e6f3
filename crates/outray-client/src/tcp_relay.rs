//! TCP stream relay
//!
//! Each relayed stream goes `dialing -> relaying -> closed`. The read side
//! runs on the task that handled `tcp_connection`; writes from the relay are
//! fed through the stream table channel to a companion write task.

use crate::session::SessionContext;
use crate::TunnelError;
use bytes::Bytes;
use outray_proto::ClientMessage;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Bytes read from the local socket per outbound `tcp_data` frame
const TCP_READ_BUFFER: usize = 4096;

pub(crate) async fn relay(ctx: Arc<SessionContext>, connection_id: String) {
    let Some(target) = ctx.config.local_target() else {
        ctx.report(TunnelError::LocalServiceError(format!(
            "no local port configured for stream {}",
            connection_id
        )));
        return;
    };

    let stream = match timeout(ctx.config.timeouts.connect, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            ctx.report(TunnelError::LocalServiceError(format!(
                "failed to connect to {} for stream {}: {}",
                target, connection_id, e
            )));
            return;
        }
        Err(_) => {
            ctx.report(TunnelError::LocalServiceError(format!(
                "timed out connecting to {} for stream {}",
                target, connection_id
            )));
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    info!("Stream {} connected to {}", connection_id, target);

    let registration = ctx.streams.register(&connection_id, &ctx.shutdown);
    let cancel = registration.cancel;
    let (mut read_half, write_half) = stream.into_split();

    let write_task = ctx.tasks.spawn(write_local(
        connection_id.clone(),
        write_half,
        registration.receiver,
        cancel.clone(),
    ));

    let mut buf = vec![0u8; TCP_READ_BUFFER];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Local service closed stream {}", connection_id);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("Read error on stream {}: {}", connection_id, e);
                    break;
                }
            },
        };

        let frame = ClientMessage::TcpData {
            connection_id: connection_id.clone(),
            data: buf[..n].to_vec(),
        };
        if let Err(e) = ctx.writer.send(&frame).await {
            debug!("Stopping stream {}: {}", connection_id, e);
            break;
        }
    }

    ctx.streams.remove(&connection_id, registration.serial);
    cancel.cancel();
    let _ = write_task.await;

    info!("Stream {} closed", connection_id);
}

/// Drain relay data into the local socket until the stream is cancelled
async fn write_local(
    connection_id: String,
    mut write_half: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = receiver.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        // A peer that stops reading must not pin this task past cancellation
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = write_half.write_all(&chunk) => written,
        };
        if let Err(e) = written {
            debug!("Write error on stream {}: {}", connection_id, e);
            cancel.cancel();
            break;
        }
    }

    let _ = write_half.shutdown().await;
}
