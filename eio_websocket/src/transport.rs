//! The framed transport proper.

use std::fmt;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use eio_core::error::{PacketError, TransportError};
use eio_core::packet::Packet;
use eio_core::socket::Socket;
use eio_core::transport::{Transport, TransportKind};
use eio_core::OUTBOX_CAPACITY;

/// Framed transport for one session, bound to a single upgraded
/// connection for its whole life.
pub struct WebSocketTransport {
    outbox_tx: mpsc::Sender<Packet>,
    outbox_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    write_timeout: Duration,
    cancel: CancellationToken,
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Create a transport. `cancel` should be a child of the session's
    /// token so a closing session unblocks both loops.
    #[must_use]
    pub fn new(write_timeout: Duration, cancel: CancellationToken) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        Self {
            outbox_tx,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            write_timeout,
            cancel,
        }
    }

    /// Drive the connection to completion: a spawned writer draining the
    /// outbox, and the reader decoding frames into the session inbox on
    /// this task. Returns when the connection or the session ends, with
    /// the session closed either way.
    pub async fn run(&self, ws: WebSocket, socket: Arc<Socket>) {
        let Some(mut outbox) = self.outbox_rx.lock().take() else {
            return;
        };
        let (mut sink, mut stream) = ws.split();

        let writer_cancel = self.cancel.clone();
        let writer_sid = socket.id().to_owned();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    packet = outbox.recv() => {
                        let Some(packet) = packet else { break };
                        let frame = match encode_frame(&packet) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(sid = %writer_sid, error = %e, "dropping unencodable packet");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(frame).await {
                            debug!(sid = %writer_sid, error = %e, "frame write failed");
                            break;
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                frame = stream.next() => match frame {
                    None => {
                        socket.close_with_reason("connection reset").await;
                        break;
                    }
                    Some(Err(e)) => {
                        socket.close_with_reason(&e.to_string()).await;
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match Packet::decode_string(text.as_str().as_bytes()) {
                            Ok(packet) => {
                                // a full inbox suspends here, pushing back
                                // on the connection's reader
                                if socket.ingest(packet).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                socket.close_with_reason(&e.to_string()).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match Packet::decode_base64(&data) {
                            Ok(packet) => {
                                if socket.ingest(packet).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                socket.close_with_reason(&e.to_string()).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        socket.close().await;
                        break;
                    }
                    // ping and pong frames are answered by the stack
                    Some(Ok(_)) => {}
                },
            }
        }

        self.cancel.cancel();
        let _ = writer.await;
        socket.close().await;
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    fn write(&self, packet: Packet) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Closed);
            }
            match tokio::time::timeout(self.write_timeout, self.outbox_tx.send(packet)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(TransportError::Closed),
                Err(_) => Err(TransportError::OutboxFull),
            }
        }
        .boxed()
    }

    fn flush(&self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }

    fn upgrade_to(&self, successor: TransportKind) -> BoxFuture<'_, ()> {
        // the framed transport is never the older leg of an upgrade
        debug!(successor = %successor, "upgrade hook on framed transport");
        async {}.boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        self.cancel.cancel();
        async { Ok(()) }.boxed()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Map a packet onto its frame: text frames for text packets, binary
/// frames (base64 form) for byte-payload packets.
fn encode_frame(packet: &Packet) -> Result<Message, PacketError> {
    if packet.is_binary() {
        Ok(Message::Binary(packet.encode_base64().into()))
    } else {
        let bytes = packet.encode_string()?;
        let text = String::from_utf8(bytes).map_err(|e| PacketError::from(e.utf8_error()))?;
        Ok(Message::Text(text.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eio_core::packet::PacketType;
    use testresult::TestResult;

    #[test]
    fn text_packets_become_text_frames() -> TestResult {
        let frame = encode_frame(&Packet::message("hello"))?;
        match frame {
            Message::Text(text) => assert_eq!(text.as_str(), "4hello"),
            other => panic!("expected text frame, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn binary_packets_become_binary_frames() -> TestResult {
        let frame = encode_frame(&Packet::message_binary(&b"hello"[..]))?;
        match frame {
            Message::Binary(data) => assert_eq!(&data[..], b"b4aGVsbG8="),
            other => panic!("expected binary frame, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() -> TestResult {
        let transport =
            WebSocketTransport::new(Duration::from_millis(50), CancellationToken::new());
        transport.write(Packet::message("ok")).await?;

        transport.close().await?;
        assert!(matches!(
            transport.write(Packet::message("late")).await,
            Err(TransportError::Closed)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn write_times_out_when_outbox_is_full() -> TestResult {
        let transport =
            WebSocketTransport::new(Duration::from_millis(50), CancellationToken::new());
        for i in 0..OUTBOX_CAPACITY {
            transport.write(Packet::message(format!("{i}"))).await?;
        }
        assert!(matches!(
            transport.write(Packet::message("overflow")).await,
            Err(TransportError::OutboxFull)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn queued_packets_keep_fifo_order() -> TestResult {
        let transport =
            WebSocketTransport::new(Duration::from_millis(50), CancellationToken::new());
        transport.write(Packet::message("first")).await?;
        transport
            .write(Packet::new(PacketType::Pong, "second", false))
            .await?;

        let mut outbox = transport.outbox_rx.lock().take().expect("outbox available");
        assert_eq!(outbox.recv().await.expect("first packet").data(), b"first");
        assert_eq!(outbox.recv().await.expect("second packet").data(), b"second");
        Ok(())
    }
}
