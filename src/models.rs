//! Canonical data model shared across the sync pipeline
//!
//! A `RawRecord` is whatever a source adapter can extract from one supplier
//! record; the mapper turns it into a `UnifiedProduct`, which is the only
//! shape the rest of the pipeline knows about.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// One record as produced by a source adapter, before canonical mapping.
///
/// Field names inside the maps are supplier-specific; the mapper knows which
/// keys to look for. Ordered maps keep adapter output deterministic.
#[derive(Debug, Clone, Default)]
pub struct RawRecord {
    /// The supplier's own reference for this product
    pub supplier_ref: String,
    /// Flat single-language fields (name, price_1, stock, ...)
    pub fields: BTreeMap<String, String>,
    /// Per-language field maps, keyed by language code
    pub localized: BTreeMap<String, BTreeMap<String, String>>,
    /// Variant rows (color/size/sku per row)
    pub variants: Vec<BTreeMap<String, String>>,
    /// Source image URLs in feed order
    pub images: Vec<String>,
    /// Raw category path, root first
    pub category_path: Vec<String>,
}

/// A normalized product, independent of the source format.
///
/// Identity is (supplier, sku). Everything that participates in delta
/// detection is hashed by [`UnifiedProduct::checksum`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedProduct {
    pub supplier: String,
    pub sku: String,
    pub title: String,
    /// Per-language descriptions, keyed by language code
    pub descriptions: BTreeMap<String, String>,
    /// Category path, root first
    pub category_path: Vec<String>,
    /// Price in minor currency units (cents)
    pub price_cents: i64,
    pub currency: String,
    pub stock_quantity: u32,
    /// Free-form attributes (color, size, tier prices, ...)
    pub attributes: BTreeMap<String, Vec<String>>,
    /// Source image URLs in feed order
    pub image_urls: Vec<String>,
}

impl UnifiedProduct {
    /// Deterministic hash of all syncable fields.
    ///
    /// Stable across runs for identical input; changes whenever any syncable
    /// field changes. Fields are written into the hasher with length-prefixed
    /// separators so adjacent values cannot collide.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        let mut put = |s: &str| {
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        };

        put(&self.supplier);
        put(&self.sku);
        put(&self.title);
        for (lang, text) in &self.descriptions {
            put(lang);
            put(text);
        }
        for segment in &self.category_path {
            put(segment);
        }
        put(&self.price_cents.to_string());
        put(&self.currency);
        put(&self.stock_quantity.to_string());
        for (key, values) in &self.attributes {
            put(key);
            for value in values {
                put(value);
            }
        }
        for url in &self.image_urls {
            put(url);
        }

        format!("{:x}", hasher.finalize())
    }
}

/// Last-synced state for one (supplier, sku), persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub supplier: String,
    pub sku: String,
    /// Checksum at the last successful upsert
    pub checksum: String,
    /// Identifier assigned by the remote catalog
    pub remote_id: i64,
}

/// Outcome counters for one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Running,
    Completed,
    Aborted,
}

/// One recorded per-item failure.
#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub sku: String,
    pub message: String,
}

/// A single sync run, owned and mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    /// Run id: timestamp + supplier code
    pub id: String,
    pub supplier: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub state: RunState,
    pub counters: RunCounters,
    pub errors: Vec<ItemError>,
}

impl SyncRun {
    pub fn start(supplier: &str) -> Self {
        let started_at = chrono::Utc::now().to_rfc3339();
        Self {
            id: format!("{}_{}", started_at, supplier),
            supplier: supplier.to_string(),
            started_at,
            finished_at: None,
            state: RunState::Running,
            counters: RunCounters::default(),
            errors: Vec::new(),
        }
    }

    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// A transformed image payload ready for delivery. Ephemeral; lives only for
/// the duration of one product's pipeline invocation.
#[derive(Debug, Clone)]
pub struct StagedImage {
    pub source_url: String,
    pub bytes: Vec<u8>,
    /// "jpeg" or "png" after transformation
    pub format: &'static str,
    pub filename: String,
    /// SHA-256 of the transformed bytes, used by the delivery cache
    pub checksum: String,
}
