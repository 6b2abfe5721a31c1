//! Change detection against the last-synced snapshot
//!
//! The snapshot store remembers the checksum every product had when it was
//! last pushed. Classification is a pure lookup, so a rerun over an
//! unchanged feed does zero remote writes.

use crate::models::{SnapshotEntry, UnifiedProduct};
use std::collections::BTreeMap;

/// What the remote catalog needs for one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaAction {
    /// Never seen before, create it remotely
    Create,
    /// Seen before and changed since, update in place
    Update { remote_id: i64 },
    /// Checksum matches the last push, skip entirely
    Unchanged { remote_id: i64 },
}

/// Classify a product against the snapshot of its supplier's last run.
pub fn classify(
    product: &UnifiedProduct,
    snapshot: &BTreeMap<String, SnapshotEntry>,
) -> DeltaAction {
    match snapshot.get(&product.sku) {
        None => DeltaAction::Create,
        Some(entry) if entry.checksum == product.checksum() => DeltaAction::Unchanged {
            remote_id: entry.remote_id,
        },
        Some(entry) => DeltaAction::Update {
            remote_id: entry.remote_id,
        },
    }
}
