//! Block fixtures shared by the unit tests of this crate.

use chrono::{TimeZone, Utc};

use chainingest_core::types::{Block, Protocol};

/// `b{from}..=b{to}`, each declaring its parent irreversible.
pub fn chain(from: u64, to: u64) -> Vec<Block> {
    (from..=to)
        .map(|n| Block {
            number: n,
            id: format!("b{n}"),
            parent_id: format!("b{}", n.saturating_sub(1)),
            parent_num: n.saturating_sub(1),
            lib_num: n.saturating_sub(1),
            timestamp: Utc.timestamp_opt(1_700_000_000 + n as i64, 0).unwrap(),
            protocol: Protocol::Evm,
            payload: vec![],
        })
        .collect()
}
