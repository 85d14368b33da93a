//! Hub socket plumbing. The bridge only sees a pair of text channels, so the
//! reconnect and dispatch logic can run against an in-memory hub in tests.

use crate::mcp::error::McpError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;
use url::Url;

/// Text frames to and from an open hub socket.
///
/// Dropping `outbound` closes the socket. `inbound` yields `None` once the
/// socket is gone.
pub struct HubChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn open(&self, url: &Url) -> Result<HubChannel, McpError>;
}

pub struct WebSocketConnector;

#[async_trait]
impl HubConnector for WebSocketConnector {
    async fn open(&self, url: &Url) -> Result<HubChannel, McpError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(map_handshake_error)?;
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut egress = tokio::spawn(async move {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        debug!(error = %err, "Hub socket write failed");
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            let mut ingest = tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => continue,
                        },
                        Ok(Message::Close(frame)) => {
                            debug!(?frame, "Hub closed the socket");
                            break;
                        }
                        Ok(_) => continue,
                        Err(err) => {
                            debug!(error = %err, "Hub socket read failed");
                            break;
                        }
                    };
                    if inbound_tx.send(text).is_err() {
                        break;
                    }
                }
            });

            tokio::select! {
                _ = &mut ingest => egress.abort(),
                _ = &mut egress => ingest.abort(),
            }
        });

        Ok(HubChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

fn map_handshake_error(err: tungstenite::Error) -> McpError {
    match &err {
        tungstenite::Error::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            McpError::UnauthorizedOrTimeout(format!("hub rejected the token ({})", response.status()))
        }
        _ => McpError::Bridge(format!("Hub connection failed: {err}")),
    }
}
