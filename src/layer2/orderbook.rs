// Order Book Differ - Pure Rust Implementation
// Price-keyed comparison of two snapshots, used to suppress duplicate rows

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::core::types::PriceLevel;

#[derive(Debug, Error, PartialEq)]
pub enum SnapshotError {
    #[error("Order book payload is missing side '{0}'")]
    MissingSide(&'static str),
    #[error("Invalid price level on side '{side}': {reason}")]
    InvalidLevel { side: &'static str, reason: String },
}

// ============================================================================
// Snapshot
// ============================================================================

/// Full bid/ask listing decoded from an orderbook payload (`b` / `a` arrays
/// of `[price, size]` pairs)
#[derive(Debug, Clone, PartialEq)]
pub struct OrderbookSnapshot {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderbookSnapshot {
    pub fn new(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self { bids, asks }
    }

    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, SnapshotError> {
        Ok(Self {
            bids: decode_side(payload, "b")?,
            asks: decode_side(payload, "a")?,
        })
    }
}

fn decode_side(payload: &serde_json::Value, side: &'static str) -> Result<Vec<PriceLevel>, SnapshotError> {
    let levels = payload
        .get(side)
        .and_then(|v| v.as_array())
        .ok_or(SnapshotError::MissingSide(side))?;

    levels.iter().map(|raw| decode_level(raw, side)).collect()
}

fn decode_level(raw: &serde_json::Value, side: &'static str) -> Result<PriceLevel, SnapshotError> {
    let invalid = |reason: String| SnapshotError::InvalidLevel { side, reason };

    let pair = raw
        .as_array()
        .filter(|p| p.len() >= 2)
        .ok_or_else(|| invalid(format!("expected [price, size], got {}", raw)))?;

    let price = match &pair[0] {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => return Err(invalid(format!("price {}", other))),
    };

    let size = match &pair[1] {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| invalid(format!("size '{}'", s)))?,
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| invalid(format!("size {}", n)))?,
        other => return Err(invalid(format!("size {}", other))),
    };

    Ok(PriceLevel { price, size })
}

// ============================================================================
// Diff
// ============================================================================

/// Per-side comparison result
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SideDiff {
    pub added: Vec<PriceLevel>,
    pub removed: Vec<PriceLevel>,
    pub updated: Vec<PriceLevel>,
}

impl SideDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.updated.len()
    }
}

impl fmt::Display for SideDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SideDiff(added={}, removed={}, updated={})",
            self.added.len(), self.removed.len(), self.updated.len()
        )
    }
}

/// Diff of both sides of two snapshots of the same symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BookDiff {
    pub bids: SideDiff,
    pub asks: SideDiff,
}

impl BookDiff {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Collapse a side into unique prices, keeping first-seen order and
/// last-seen size.
fn collapse(side: &[PriceLevel]) -> (Vec<&str>, HashMap<&str, f64>) {
    let mut order = Vec::with_capacity(side.len());
    let mut sizes = HashMap::with_capacity(side.len());
    for level in side {
        if sizes.insert(level.price.as_str(), level.size).is_none() {
            order.push(level.price.as_str());
        }
    }
    (order, sizes)
}

/// Compare one side of two snapshots.
///
/// `added` and `updated` follow the new side's order, `removed` follows the
/// previous side's order.
pub fn diff_side(previous: &[PriceLevel], new: &[PriceLevel]) -> SideDiff {
    let (prev_order, prev_sizes) = collapse(previous);
    let (new_order, new_sizes) = collapse(new);

    let mut diff = SideDiff::default();

    for price in new_order {
        let size = new_sizes[price];
        match prev_sizes.get(price) {
            None => diff.added.push(PriceLevel::new(price, size)),
            Some(&old) if old != size => diff.updated.push(PriceLevel::new(price, size)),
            Some(_) => {}
        }
    }

    for price in prev_order {
        if !new_sizes.contains_key(price) {
            diff.removed.push(PriceLevel::new(price, prev_sizes[price]));
        }
    }

    diff
}

pub fn diff_snapshots(previous: &OrderbookSnapshot, new: &OrderbookSnapshot) -> BookDiff {
    BookDiff {
        bids: diff_side(&previous.bids, &new.bids),
        asks: diff_side(&previous.asks, &new.asks),
    }
}
