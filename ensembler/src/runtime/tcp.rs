use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::cancel::CancelToken;
use crate::error::ProtocolError;
use crate::protocol::{read_frame, write_frame, Frame};
use crate::telemetry;

use super::evaluator::EvaluatorHandle;
use super::link::PeerSender;

/// Accept peers on `listener` until `cancel` fires, bridging each socket to
/// the evaluator behind `handle`.
pub async fn serve_tcp(
    listener: TcpListener,
    handle: EvaluatorHandle,
    cancel: CancelToken,
) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "accepting peers");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(addr = %local, "listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, addr, handle).await {
                        tracing::debug!(peer = %addr, "connection closed: {err}");
                    }
                });
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: EvaluatorHandle,
) -> Result<(), ProtocolError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    bridge(reader, writer, addr.to_string(), handle).await
}

/// Pump frames between one byte stream and the evaluator.
///
/// Frames before the first `CONNECT` are discarded; the claimed identity of
/// that `CONNECT` names the link for the rest of the connection.
pub async fn bridge<R, W>(
    mut reader: R,
    mut writer: W,
    label: String,
    handle: EvaluatorHandle,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let max_frame_bytes = handle.max_frame_bytes();

    let connect = loop {
        match read_frame(&mut reader, max_frame_bytes).await? {
            None => return Ok(()),
            Some(frame @ Frame::Connect { .. }) => break frame,
            Some(other) => {
                telemetry::record_protocol_error(
                    &label,
                    &ProtocolError::NotConnected(label.clone()),
                );
                tracing::debug!(
                    peer = %label,
                    frame = other.kind(),
                    "discarded frame before CONNECT"
                );
            }
        }
    };
    let Frame::Connect { identity, .. } = &connect else {
        return Ok(());
    };

    let mut link = handle.attach(identity.clone());
    let sender = link.sender();
    sender.send(connect)?;

    let mut read_task = tokio::spawn(pump_reads(reader, sender, max_frame_bytes));

    let result = loop {
        tokio::select! {
            frame = link.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = write_frame(&mut writer, &frame, max_frame_bytes).await {
                        break Err(err);
                    }
                }
                None => break Ok(()),
            },
            joined = &mut read_task => {
                break joined.unwrap_or(Err(ProtocolError::Closed));
            }
        }
    };
    read_task.abort();
    result
}

async fn pump_reads<R>(
    mut reader: R,
    sender: PeerSender,
    max_frame_bytes: usize,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader, max_frame_bytes).await {
            Ok(Some(frame)) => sender.send(frame)?,
            Ok(None) => return Ok(()),
            // The length prefix was intact, so the stream is still in sync.
            Err(err @ ProtocolError::Malformed(_)) => {
                telemetry::record_protocol_error(sender.identity(), &err);
            }
            Err(err) => return Err(err),
        }
    }
}
