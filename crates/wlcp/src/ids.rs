// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snowflake id generator.
//!
//! ```text
//!  63      22         12          0
//!  ┌───────┬──────────┬───────────┐
//!  │ 41 ms │ 10 node  │ 12 seq    │
//!  └───────┴──────────┴───────────┘
//! ```
//!
//! Timestamps count milliseconds since [`EPOCH_MS`].

use std::sync::Mutex;

use chrono::Utc;

/// 2010-11-04T01:42:54.657Z
pub const EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;
const MAX_NODE: i64 = (1 << NODE_BITS) - 1;
const MAX_SEQ: i64 = (1 << SEQ_BITS) - 1;

/// The node id does not fit in the node field.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("snowflake id misconfigured: node {0} outside 0..={MAX_NODE}")]
pub struct InvalidNode(pub i64);

/// Generates unique, roughly time-ordered 64-bit ids for one node.
#[derive(Debug)]
pub struct IdGenerator {
    node: i64,
    state: Mutex<(i64, i64)>,
}

impl IdGenerator {
    pub fn new(node: i64) -> Result<Self, InvalidNode> {
        if !(0..=MAX_NODE).contains(&node) {
            return Err(InvalidNode(node));
        }
        Ok(Self {
            node,
            state: Mutex::new((0, 0)),
        })
    }

    pub fn node(&self) -> i64 {
        self.node
    }

    /// Next id. Spins into the next millisecond when the sequence is exhausted.
    pub fn generate(&self) -> i64 {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (last_ms, seq) = *state;

        let mut now = Utc::now().timestamp_millis() - EPOCH_MS;
        // never go backwards, even if the wall clock does
        if now < last_ms {
            now = last_ms;
        }

        let next_seq = if now == last_ms {
            let next = (seq + 1) & MAX_SEQ;
            if next == 0 {
                while now <= last_ms {
                    std::hint::spin_loop();
                    now = Utc::now().timestamp_millis() - EPOCH_MS;
                }
            }
            next
        } else {
            0
        };

        *state = (now, next_seq);
        (now << (NODE_BITS + SEQ_BITS)) | (self.node << SEQ_BITS) | next_seq
    }

    /// Node field of an id produced by any generator.
    pub fn node_of(id: i64) -> i64 {
        (id >> SEQ_BITS) & MAX_NODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_rejects_out_of_range_node() {
        assert!(IdGenerator::new(1024).is_err());
        assert!(IdGenerator::new(-1).is_err());
        assert!(IdGenerator::new(1023).is_ok());
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let generator = IdGenerator::new(7).unwrap();
        let mut seen = HashSet::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.generate();
            assert!(id > last);
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn test_node_is_encoded() {
        let generator = IdGenerator::new(513).unwrap();
        let id = generator.generate();
        assert_eq!(IdGenerator::node_of(id), 513);
        assert!(id > 0);
    }
}
