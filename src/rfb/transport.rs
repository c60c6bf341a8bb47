//! The transport seam: a duplex message-oriented byte channel.
//!
//! The session controller owns a [`TransportHandle`] and never touches
//! the socket. Dropping the handle detaches both directions without a
//! close handshake, which is how a controller discards a transport whose
//! close event must not be observed (user-initiated teardown).

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::rfb::types::RfbError;

/// Inbound transport notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One WebSocket frame's payload. Frame boundaries carry no
    /// protocol meaning.
    Message(Vec<u8>),
    /// The transport closed; `code` follows RFC 6455.
    Closed { code: u16, reason: String },
    /// A transport-level fault. Always followed by `Closed`.
    Error(String),
}

/// Outbound instructions to the transport pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    /// Send one binary frame.
    Send(Vec<u8>),
    /// Close with a code and reason, then stop pumping.
    Close { code: u16, reason: String },
}

/// An open transport: commands in, events out.
pub struct TransportHandle {
    pub tx: mpsc::Sender<WireCommand>,
    pub rx: mpsc::Receiver<TransportEvent>,
}

/// Opens transports. The production implementation is [`WsConnector`];
/// tests substitute their own.
pub trait Connect: Send + Sync + 'static {
    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<TransportHandle, RfbError>> + Send;
}

/// `tokio-tungstenite` backed connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connect for WsConnector {
    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<TransportHandle, RfbError>> + Send {
        let endpoint = endpoint.to_string();
        async move {
            let (ws, _response) = connect_async(endpoint.as_str())
                .await
                .map_err(|e| RfbError::transport(format!("WebSocket connect failed: {}", e)))?;
            debug!("WebSocket connected to {}", endpoint);

            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            let (event_tx, event_rx) = mpsc::channel(256);
            tokio::spawn(pump(ws, cmd_rx, event_tx));

            Ok(TransportHandle {
                tx: cmd_tx,
                rx: event_rx,
            })
        }
    }
}

/// Bidirectional pump between the socket and the session's channels.
///
/// Ends when the peer closes, the socket faults, or the session drops
/// its handle.
async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut cmd_rx: mpsc::Receiver<WireCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(WireCommand::Send(bytes)) => {
                    if let Err(e) = write.send(Message::Binary(bytes)).await {
                        warn!("WebSocket send failed: {}", e);
                        let _ = event_tx
                            .send(TransportEvent::Error(e.to_string()))
                            .await;
                        let _ = event_tx
                            .send(TransportEvent::Closed {
                                code: 1006,
                                reason: e.to_string(),
                            })
                            .await;
                        break;
                    }
                }
                Some(WireCommand::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = write.send(Message::Close(Some(frame))).await;
                    break;
                }
                // Handle dropped: detach without a close handshake.
                None => break,
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    if event_tx.send(TransportEvent::Message(bytes)).await.is_err() {
                        break;
                    }
                }
                // The protocol never uses text frames; tolerate them as
                // raw bytes.
                Some(Ok(Message::Text(text))) => {
                    if event_tx
                        .send(TransportEvent::Message(text.into_bytes()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                // Pongs are generated by tungstenite itself.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((1005, String::new()));
                    let _ = event_tx.send(TransportEvent::Closed { code, reason }).await;
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket read failed: {}", e);
                    let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                    let _ = event_tx
                        .send(TransportEvent::Closed {
                            code: 1006,
                            reason: e.to_string(),
                        })
                        .await;
                    break;
                }
                None => {
                    let _ = event_tx
                        .send(TransportEvent::Closed {
                            code: 1006,
                            reason: "stream ended".into(),
                        })
                        .await;
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_carries_commands_and_events() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        let mut handle = TransportHandle {
            tx: cmd_tx,
            rx: event_rx,
        };

        handle
            .tx
            .send(WireCommand::Send(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(cmd_rx.recv().await, Some(WireCommand::Send(vec![1, 2, 3])));

        event_tx
            .send(TransportEvent::Message(vec![9]))
            .await
            .unwrap();
        assert_eq!(handle.rx.recv().await, Some(TransportEvent::Message(vec![9])));
    }

    #[tokio::test]
    async fn dropping_handle_detaches_sender() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WireCommand>(8);
        let (_event_tx, event_rx) = mpsc::channel(8);
        let handle = TransportHandle {
            tx: cmd_tx,
            rx: event_rx,
        };

        drop(handle);
        assert_eq!(cmd_rx.recv().await, None);
    }

    #[test]
    fn close_command_holds_code_and_reason() {
        let cmd = WireCommand::Close {
            code: 1000,
            reason: "bye".into(),
        };
        assert_eq!(
            cmd,
            WireCommand::Close {
                code: 1000,
                reason: "bye".into()
            }
        );
    }
}
