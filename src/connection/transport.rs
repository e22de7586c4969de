//! Transport seam. A connector opens one socket and hands back a pair of
//! channels; everything above it only sees text frames.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::debug;

use crate::error::TransportError;

/// Inbound event from an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Remote side closed cleanly
    Closed(Option<String>),
    /// Socket failure; the transport is unusable afterwards
    Error(String),
}

/// Channels of one open transport. Dropping `outbound` closes the socket.
#[derive(Debug)]
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<TransportHandle, TransportError>;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportHandle, TransportError> {
        let (stream, _response) = match timeout(self.connect_timeout, connect_async(url)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_) => return Err(TransportError::Timeout),
        };

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        let writer_events = in_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    let _ = writer_events.send(Frame::Error(e.to_string()));
                    return;
                }
            }
            // Owner dropped the handle.
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => Frame::Text(text),
                    Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                        Ok(text) => Frame::Text(text),
                        Err(_) => {
                            debug!("Dropping non-UTF8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(close)) => {
                        let _ = in_tx.send(Frame::Closed(close.map(|c| c.reason.to_string())));
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(Frame::Error(e.to_string()));
                        return;
                    }
                };
                if in_tx.send(frame).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(Frame::Closed(None));
        });

        Ok(TransportHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
