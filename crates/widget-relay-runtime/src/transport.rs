//! Transport seam
//!
//! A [`Transport`] opens one [`Link`] to the relay endpoint per connection
//! attempt. Links are plain channel pairs: text frames to send and text
//! frames received. The link is closed when its incoming side ends, and
//! dropping the outgoing sender closes it from our end.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};
use url::Url;
use widget_relay_core::{RelayError, RelayResult};

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// One open connection to the relay
#[derive(Debug)]
pub struct Link {
    /// Frames to send; dropping it closes the link
    pub outgoing: mpsc::UnboundedSender<String>,
    /// Frames received; `None` once the link is closed
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Create a link and the far ends of its two channels
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
    ) {
        let (outgoing, far_rx) = mpsc::unbounded_channel();
        let (far_tx, incoming) = mpsc::unbounded_channel();
        (Self { outgoing, incoming }, far_rx, far_tx)
    }
}

/// Opens links to a relay endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a link; failures become status transitions upstream
    async fn connect(&self, url: &Url) -> RelayResult<Link>;

    /// Transport identifier for logs
    fn name(&self) -> &'static str;
}

// ----------------------------------------------------------------------------
// WebSocket Transport
// ----------------------------------------------------------------------------

/// WebSocket transport backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> RelayResult<Link> {
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::transport(format!("WebSocket connect failed: {}", e)))?;

        let (link, mut to_send, received) = Link::pair();
        let (mut write, mut read) = stream.split();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = to_send.recv() => match frame {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                debug!("WebSocket send failed: {}", e);
                                break;
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    message = read.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if received.send(text).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => {
                                if received.send(text).is_err() {
                                    break;
                                }
                            }
                            Err(_) => trace!("Ignoring non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("WebSocket read failed: {}", e);
                            break;
                        }
                    },
                }
            }
            debug!("WebSocket link closed");
        });

        Ok(link)
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}
