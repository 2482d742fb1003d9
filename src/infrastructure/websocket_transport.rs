// WebSocket transport for the live event channel
use crate::application::event_transport::{EventTransport, TransportChannel, TransportError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl EventTransport for WebSocketTransport {
    async fn open(&self, endpoint: &Url) -> Result<TransportChannel, TransportError> {
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(endpoint.to_string()))?
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(ws_stream, outbound_rx, inbound_tx));

        Ok(TransportChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Shuttle frames between the socket and the channel queues until either side
/// goes away. Dropping `inbound` on exit signals the close to the reader.
async fn pump(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<String>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text)).await {
                        debug!("WebSocket send failed: {}", e);
                        break;
                    }
                }
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
            message = ws_receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(text).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if inbound.send(text).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => debug!("Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket receive failed: {}", e);
                    break;
                }
            },
        }
    }

    debug!("WebSocket pump stopped");
}
