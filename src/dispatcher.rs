//! Dispatcher
//!
//! The long-lived task that owns the read half of the transport. It pulls
//! one frame at a time off the wire, discards heartbeats (the receive
//! clock is already touched by the `FrameReader`), routes channel frames
//! to the channel multiplexer, and handles the two connection-level
//! methods it must recognize: `Connection.Close` and `Connection.Close-Ok`.
//! Everything else is treated as out of scope and logged.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};

use crate::channel::ChannelTable;
use crate::codec::FrameType;
use crate::method::{self, CLASS_CONNECTION, CONNECTION_CLOSE, CONNECTION_CLOSE_OK};
use crate::state::ConnectionState;
use crate::transport::{FrameReader, WriteSerializer};

/// Why the dispatcher loop stopped, so `Connection` can decide whether an
/// `on_error` hook fires: a peer-initiated or self-initiated close that
/// completed the handshake is not an error, an unexpected transport loss
/// is, and carries a human-readable reason the hook can turn into a cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The peer sent `Connection.Close`; we replied `Close-Ok`.
    PeerClosed { reply_code: u16, reply_text: String },
    /// We sent `Connection.Close` and the peer replied `Close-Ok`.
    LocalCloseConfirmed,
    /// The transport was cut, or a frame failed to parse, before a close
    /// handshake completed.
    TransportClosed { reason: String },
}

/// Runs until the transport is closed from either side. `state_rx` lets
/// the loop notice a locally-initiated close (state becomes `Closing`)
/// even while blocked waiting on `next_frame`; `state_tx` is updated to
/// `Closed` once the loop is about to return.
pub async fn run<R, W>(
    mut reader: FrameReader<R>,
    writer: Arc<WriteSerializer<W>>,
    channels: Arc<Mutex<ChannelTable>>,
    state_tx: watch::Sender<ConnectionState>,
    mut state_rx: watch::Receiver<ConnectionState>,
) -> DispatchOutcome
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = reader.next_frame() => frame,
            _ = state_rx.changed() => {
                if *state_rx.borrow() == ConnectionState::Closed {
                    return DispatchOutcome::LocalCloseConfirmed;
                }
                continue;
            }
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::debug!("transport closed without a close handshake");
                channels
                    .lock()
                    .await
                    .cascade_close(0, "connection transport closed");
                let _ = state_tx.send(ConnectionState::Closed);
                return DispatchOutcome::TransportClosed {
                    reason: "transport closed without a close handshake".to_string(),
                };
            }
            Err(err) => {
                log::warn!("frame decode error, closing connection: {err}");
                channels.lock().await.cascade_close(0, "frame decode error");
                let _ = state_tx.send(ConnectionState::Closed);
                return DispatchOutcome::TransportClosed {
                    reason: err.to_string(),
                };
            }
        };

        if frame.frame_type == FrameType::Heartbeat {
            continue;
        }

        if frame.channel != 0 {
            if !channels.lock().await.route(frame.channel, frame) {
                log::debug!("dropped frame for unknown or closing channel");
            }
            continue;
        }

        if frame.frame_type != FrameType::Method {
            log::warn!("non-method frame on channel 0, ignoring");
            continue;
        }

        let (class_id, method_id, args) = match method::split_header(&frame.payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("malformed connection method: {err}");
                continue;
            }
        };

        if class_id != CLASS_CONNECTION {
            log::warn!("unexpected class {class_id} on channel 0, ignoring");
            continue;
        }

        match method_id {
            CONNECTION_CLOSE => {
                let close = match method::Close::decode(args) {
                    Ok(close) => close,
                    Err(err) => {
                        log::warn!("malformed Connection.Close: {err}");
                        continue;
                    }
                };
                log::info!(
                    "peer closed connection: {} ({})",
                    close.reply_text,
                    close.reply_code
                );
                channels
                    .lock()
                    .await
                    .cascade_close(close.reply_code, &close.reply_text);
                let _ = writer
                    .write_frame(&crate::codec::Frame::method(
                        0,
                        method::CloseOk::encode(CLASS_CONNECTION),
                    ))
                    .await;
                let _ = state_tx.send(ConnectionState::Closed);
                return DispatchOutcome::PeerClosed {
                    reply_code: close.reply_code,
                    reply_text: close.reply_text,
                };
            }
            CONNECTION_CLOSE_OK => {
                let _ = state_tx.send(ConnectionState::Closed);
                return DispatchOutcome::LocalCloseConfirmed;
            }
            other => {
                log::warn!("unrecognized connection method {other}, ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::HeartbeatClocks;
    use crate::method::CloseOk;
    use std::sync::Arc as StdArc;
    use tokio::sync::mpsc;

    fn new_transport() -> (
        FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        StdArc<WriteSerializer<tokio::io::WriteHalf<tokio::io::DuplexStream>>>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
    ) {
        let (client, server) = tokio::io::duplex(8192);
        let clocks = StdArc::new(HeartbeatClocks::new());
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let reader = FrameReader::new(server_read, clocks.clone());
        let writer = StdArc::new(WriteSerializer::new(server_write, clocks));
        (reader, writer, client_write, client_read)
    }

    #[tokio::test]
    async fn peer_close_triggers_cascade_and_close_ok_reply() {
        let (reader, writer, client_write, mut client_read) = new_transport();
        let channels = StdArc::new(Mutex::new(ChannelTable::new(0)));
        let id = channels.lock().await.allocate().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channels.lock().await.insert(id, tx);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);
        let client_writer = WriteSerializer::new(client_write, StdArc::new(HeartbeatClocks::new()));

        let close = method::Close {
            reply_code: 320,
            reply_text: "CONNECTION_FORCED".into(),
            class_id: 0,
            method_id: 0,
        };
        client_writer
            .write_frame(&crate::codec::Frame::method(0, close.encode().unwrap()))
            .await
            .unwrap();

        let outcome = run(reader, writer, channels.clone(), state_tx, state_rx).await;
        assert_eq!(
            outcome,
            DispatchOutcome::PeerClosed {
                reply_code: 320,
                reply_text: "CONNECTION_FORCED".into()
            }
        );

        match rx.recv().await.unwrap() {
            crate::channel::ChannelEvent::ConnectionClosed { reply_code, .. } => {
                assert_eq!(reply_code, 320)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut client_read, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf[0], FrameType::Method as u8);
    }

    #[tokio::test]
    async fn close_ok_reply_ends_the_loop_cleanly() {
        let (reader, writer, client_write, _client_read) = new_transport();
        let channels = StdArc::new(Mutex::new(ChannelTable::new(0)));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closing);
        let client_writer = WriteSerializer::new(client_write, StdArc::new(HeartbeatClocks::new()));

        client_writer
            .write_frame(&crate::codec::Frame::method(
                0,
                CloseOk::encode(CLASS_CONNECTION),
            ))
            .await
            .unwrap();

        let outcome = run(reader, writer, channels, state_tx, state_rx).await;
        assert_eq!(outcome, DispatchOutcome::LocalCloseConfirmed);
    }

    #[tokio::test]
    async fn unexpected_eof_cascades_and_reports_abnormal() {
        let (reader, writer, client_write, client_read) = new_transport();
        let channels = StdArc::new(Mutex::new(ChannelTable::new(0)));
        let id = channels.lock().await.allocate().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channels.lock().await.insert(id, tx);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);

        // Both halves of the client-side duplex must go away: the read
        // half and write half returned by `tokio::io::split` are backed
        // by the same shared stream, so dropping only one leaves the
        // server side readable forever.
        drop(client_write);
        drop(client_read);

        let outcome = run(reader, writer, channels, state_tx, state_rx).await;
        assert!(matches!(outcome, DispatchOutcome::TransportClosed { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            crate::channel::ChannelEvent::ConnectionClosed { .. }
        ));
    }
}
