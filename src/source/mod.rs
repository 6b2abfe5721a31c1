//! Source adapters: one per supplier feed format
//!
//! An adapter streams `RawRecord`s out of a supplier feed. Adapters are
//! finite and not restartable; reopen via [`open_adapter`] for another pass.
//! Individual malformed records are skipped and counted, not fatal.

pub mod csv_masterfile;
pub mod xml_feed;

use crate::config::{FeedFormat, SupplierProfile};
use crate::error::SourceError;
use crate::models::RawRecord;

pub use csv_masterfile::CsvMasterfileAdapter;
pub use xml_feed::XmlFeedAdapter;

/// A lazy, finite sequence of raw supplier records.
pub trait SourceAdapter {
    /// Pull the next record. `None` means the feed is exhausted.
    fn next_record(&mut self) -> Option<Result<RawRecord, SourceError>>;

    /// Number of malformed records skipped so far.
    fn skipped(&self) -> u64;
}

/// Open the adapter matching the profile's feed format.
///
/// Adding a supplier format means adding a variant here and one adapter
/// module, nothing else.
pub fn open_adapter(profile: &SupplierProfile) -> Result<Box<dyn SourceAdapter + Send>, SourceError> {
    match &profile.format {
        FeedFormat::XmlFeed {
            dir,
            product_file,
            stock_file,
            price_file,
        } => Ok(Box::new(XmlFeedAdapter::open(
            dir,
            product_file,
            stock_file.as_deref(),
            price_file.as_deref(),
        )?)),
        FeedFormat::CsvMasterfile { path } => {
            Ok(Box::new(CsvMasterfileAdapter::open(path)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use std::path::PathBuf;

    fn csv_profile(path: PathBuf) -> SupplierProfile {
        SupplierProfile {
            code: "BIC".into(),
            name: "BIC".into(),
            format: FeedFormat::CsvMasterfile { path },
            preferred_language: Some("it".into()),
            language_fallbacks: vec!["en".into()],
            category_root: None,
            concurrency: 4,
            requests_per_second: 5,
            retry: RetrySettings::default(),
            abort_after_consecutive_failures: 25,
        }
    }

    #[test]
    fn registry_rejects_missing_csv() {
        let profile = csv_profile(PathBuf::from("/nonexistent/feed.csv"));
        let result = open_adapter(&profile);
        assert!(matches!(result, Err(SourceError::MissingFile(_))));
    }
}
