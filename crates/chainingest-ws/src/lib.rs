//! chainingest-ws — WebSocket live block feed.
//!
//! [`WsBlockFeed`] implements [`BlockFeed`](chainingest_core::BlockFeed): one
//! `subscribe` call opens one connection and yields blocks parsed from JSON
//! text frames. Reconnecting is left to the live source.

pub mod feed;

pub use feed::{parse_block_message, WsBlockFeed};
