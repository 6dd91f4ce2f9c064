//! # WebSocket Signaling Transport
//!
//! The production [`SignalingTransport`]/[`SignalingTransportFactory`] pair:
//! a `tokio-tungstenite` WebSocket connection to the relay, split into a
//! writer task and a reader task so `send`/`recv` never block on each other
//! (spec.md §5's "no suspension point holds a lock").

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::wire::SignalingFrame;

use super::{SignalingTransport, SignalingTransportFactory, TransportError};

/// Builds [`WebSocketSignalingTransport`]s against a real relay URL.
#[derive(Debug, Clone, Default)]
pub struct WebSocketSignalingFactory;

impl WebSocketSignalingFactory {
    /// A factory with no special configuration.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SignalingTransportFactory for WebSocketSignalingFactory {
    async fn connect(&self, url: &str) -> Result<Box<dyn SignalingTransport>, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "signaling websocket write failed, closing writer task");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalingFrame>();
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalingFrame>(&text) {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed signaling frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        debug!(error = %e, "signaling websocket read error");
                        break;
                    }
                }
            }
        });

        Ok(Box::new(WebSocketSignalingTransport {
            out_tx,
            in_rx: AsyncMutex::new(in_rx),
        }))
    }
}

/// A connected WebSocket link to the signaling relay. `send` enqueues onto
/// the writer task's channel and returns immediately; `recv` dequeues from
/// the reader task's channel.
pub struct WebSocketSignalingTransport {
    out_tx: mpsc::UnboundedSender<Message>,
    in_rx: AsyncMutex<mpsc::UnboundedReceiver<SignalingFrame>>,
}

#[async_trait]
impl SignalingTransport for WebSocketSignalingTransport {
    async fn send(&self, frame: SignalingFrame) -> Result<(), TransportError> {
        let text = serde_json::to_string(&frame).map_err(|e| TransportError::Io(e.to_string()))?;
        self.out_tx
            .send(Message::Text(text))
            .map_err(|_| TransportError::Closed("signaling writer task ended".to_string()))
    }

    async fn recv(&self) -> Option<SignalingFrame> {
        self.in_rx.lock().await.recv().await
    }

    async fn close(&self) {
        let _ = self.out_tx.send(Message::Close(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_is_cheaply_cloneable() {
        let a = WebSocketSignalingFactory::new();
        let _b = a.clone();
    }
}
