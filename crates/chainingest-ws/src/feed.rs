//! `WsBlockFeed` — live [`BlockFeed`] over a WebSocket connection.
//!
//! # Usage
//! ```no_run
//! use chainingest_ws::WsBlockFeed;
//! use std::sync::Arc;
//!
//! let feed = Arc::new(
//!     WsBlockFeed::new().with_subscribe_message(r#"{"method":"subscribe_blocks"}"#),
//! );
//! ```
//!
//! Accepted frames, each carrying one JSON-encoded block:
//! - the block itself: `{"number":..., "id":..., ...}`
//! - wrapped: `{"block": {...}}`
//! - a JSON-RPC notification: `{"method":"...", "params":{"result":{...}}}`
//!
//! Anything else that parses as JSON (subscription acks, heartbeats) is
//! skipped.

use async_trait::async_trait;
use chainingest_core::error::FeedError;
use chainingest_core::source::{BlockFeed, BlockStream};
use chainingest_core::types::Block;
use futures::{channel::mpsc, SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Frames buffered between the socket task and the live source.
const FRAME_BUFFER: usize = 512;

#[derive(Debug, Clone, Default)]
pub struct WsBlockFeed {
    /// Sent right after connecting, if set.
    subscribe_message: Option<String>,
}

impl WsBlockFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text frame sent once connected to start the block subscription.
    pub fn with_subscribe_message(mut self, message: impl Into<String>) -> Self {
        self.subscribe_message = Some(message.into());
        self
    }
}

#[async_trait]
impl BlockFeed for WsBlockFeed {
    async fn subscribe(&self, address: &str) -> Result<BlockStream, FeedError> {
        info!("Connecting to block feed: {}", address);
        let (ws, _) = connect_async(address)
            .await
            .map_err(|e| FeedError::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        info!("Block feed connected: {}", address);

        let (mut write, mut read) = ws.split();
        if let Some(message) = &self.subscribe_message {
            write
                .send(Message::Text(message.clone()))
                .await
                .map_err(|e| FeedError::ConnectionFailed {
                    address: address.to_string(),
                    reason: format!("subscribe message not sent: {e}"),
                })?;
        }

        let (mut tx, rx) = mpsc::channel::<Result<Block, FeedError>>(FRAME_BUFFER);
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Err(e) => {
                        warn!("Block feed error: {}", e);
                        let _ = tx.send(Err(FeedError::Closed)).await;
                        return;
                    }
                    Ok(Message::Text(text)) => {
                        debug!("Feed frame: {}", text.chars().take(120).collect::<String>());
                        if let Some(parsed) = parse_block_message(&text) {
                            let fatal = parsed.is_err();
                            if tx.send(parsed).await.is_err() || fatal {
                                return;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) => {
                        info!("Block feed closed by server");
                        return;
                    }
                    Ok(_) => {}
                }
            }
        });

        Ok(rx.boxed())
    }
}

/// Extract a block from one text frame.
///
/// Returns `None` for frames that carry no block and a decode error for
/// frames that are not JSON or whose block is malformed.
pub fn parse_block_message(text: &str) -> Option<Result<Block, FeedError>> {
    let v: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Some(Err(FeedError::Decode(e.to_string()))),
    };

    let candidate = if v.get("method").is_some() {
        v.get("params")?.get("result")?.clone()
    } else if let Some(block) = v.get("block") {
        block.clone()
    } else if v.get("number").is_some() {
        v
    } else {
        return None;
    };

    Some(serde_json::from_value::<Block>(candidate).map_err(|e| FeedError::Decode(e.to_string())))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
