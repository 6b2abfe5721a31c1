//! Supplier profiles and run options
//!
//! Profiles are loaded from a JSON file holding one entry per supplier. The
//! profile fully describes where a feed lives, how to read it, and how hard
//! we are allowed to hit the remote API.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How a supplier delivers its catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedFormat {
    /// Multi-file XML feed: a large product file plus side files for stock
    /// and price tiers, joined by product ref.
    XmlFeed {
        dir: PathBuf,
        product_file: String,
        stock_file: Option<String>,
        price_file: Option<String>,
    },
    /// Single multilingual CSV masterfile, one row per (product, language).
    CsvMasterfile { path: PathBuf },
}

fn default_concurrency() -> usize {
    4
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_abort_threshold() -> u32 {
    25
}

fn default_max_retries() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    15_000
}

/// Retry policy for retryable remote errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetrySettings {
    /// Exponential backoff delay for the given attempt (1-based), capped.
    pub fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let exp = self.initial_backoff_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        std::time::Duration::from_millis(exp.min(self.max_backoff_ms))
    }
}

/// Per-supplier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplierProfile {
    /// Short supplier code, also the SKU prefix (e.g. "MKTO", "BIC")
    pub code: String,
    pub name: String,
    pub format: FeedFormat,
    /// Language picked for single-language fields
    #[serde(default)]
    pub preferred_language: Option<String>,
    /// Fallback order when the preferred language is missing
    #[serde(default)]
    pub language_fallbacks: Vec<String>,
    /// Root category the supplier's paths are grafted under (configured per
    /// supplier, e.g. "Hotel Supplies")
    #[serde(default)]
    pub category_root: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Consecutive per-item failures that abort the run
    #[serde(default = "default_abort_threshold")]
    pub abort_after_consecutive_failures: u32,
}

/// Remote catalog endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Per-call timeout in seconds
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_remote_timeout_secs() -> u64 {
    30
}

/// Top-level configuration file: remote endpoint + supplier profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub remote: RemoteSettings,
    pub suppliers: Vec<SupplierProfile>,
}

impl SyncConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Find a supplier profile by code (case-insensitive).
    pub fn supplier(&self, code: &str) -> Option<&SupplierProfile> {
        self.suppliers
            .iter()
            .find(|s| s.code.eq_ignore_ascii_case(code))
    }
}

/// What one invocation should do.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after this many records (demo/testing)
    pub limit: Option<usize>,
    /// Map, reconcile and classify, but make no remote calls
    pub dry_run: bool,
    /// Only re-deliver images for already synced products
    pub images_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_minimal_config() {
        let json = r#"{
            "remote": {
                "base_url": "https://shop.example.com/wp-json/wc/v3",
                "consumer_key": "ck_x",
                "consumer_secret": "cs_y"
            },
            "suppliers": [{
                "code": "BIC",
                "name": "BIC Graphic",
                "format": { "kind": "csv_masterfile", "path": "/data/bic.csv" },
                "preferred_language": "it",
                "language_fallbacks": ["en"]
            }]
        }"#;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.suppliers.len(), 1);

        let bic = config.supplier("bic").unwrap();
        assert_eq!(bic.concurrency, 4);
        assert_eq!(bic.requests_per_second, 5);
        assert_eq!(bic.abort_after_consecutive_failures, 25);
        assert!(matches!(bic.format, FeedFormat::CsvMasterfile { .. }));
    }

    #[test]
    fn unknown_supplier_is_none() {
        let config = SyncConfig {
            remote: RemoteSettings {
                base_url: "x".into(),
                consumer_key: "k".into(),
                consumer_secret: "s".into(),
                timeout_secs: 30,
            },
            suppliers: vec![],
        };
        assert!(config.supplier("MKTO").is_none());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetrySettings {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        assert_eq!(retry.backoff_delay(1).as_millis(), 100);
        assert_eq!(retry.backoff_delay(2).as_millis(), 200);
        assert_eq!(retry.backoff_delay(3).as_millis(), 400);
        assert_eq!(retry.backoff_delay(6).as_millis(), 1000);
    }
}
