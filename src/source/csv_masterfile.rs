//! Streaming adapter for multilingual CSV masterfiles
//!
//! One row per (product, language); rows for a product are contiguous in the
//! file. The adapter buffers exactly one product's language rows and emits a
//! `RawRecord` when the product code changes, so memory stays bounded no
//! matter how large the masterfile is. Inactive rows are filtered out;
//! malformed rows are skipped and counted.

use crate::error::SourceError;
use crate::models::RawRecord;
use csv::StringRecord;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

/// Streaming adapter over one CSV masterfile.
pub struct CsvMasterfileAdapter {
    reader: csv::Reader<File>,
    headers: StringRecord,
    /// Record currently being accumulated across language rows
    pending: Option<RawRecord>,
    skipped: u64,
    done: bool,
}

impl CsvMasterfileAdapter {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::MissingFile(path.display().to_string()));
        }
        let mut reader = csv::Reader::from_path(path).map_err(csv_to_source)?;
        let headers = reader.headers().map_err(csv_to_source)?.clone();
        log::info!("Opened CSV masterfile {}", path.display());
        Ok(Self {
            reader,
            headers,
            pending: None,
            skipped: 0,
            done: false,
        })
    }

    fn row_to_map(&self, row: &StringRecord) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .zip(row.iter())
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(key, value)| (key.to_string(), value.trim().to_string()))
            .collect()
    }

    /// Fold one language row into the pending record.
    fn absorb_row(pending: &mut RawRecord, row: &BTreeMap<String, String>) {
        let language = row.get("language").cloned().unwrap_or_default();

        let mut texts = BTreeMap::new();
        for (from, to) in [
            ("name", "name"),
            ("description", "description"),
            ("benefits", "short_description"),
        ] {
            if let Some(value) = row.get(from) {
                texts.insert(to.to_string(), value.clone());
            }
        }
        pending.localized.insert(language, texts);

        // Language-independent columns, taken from the first row that has them
        if !pending.fields.contains_key("currency") {
            if let Some(currency) = row.get("price.currency") {
                pending.fields.insert("currency".into(), currency.clone());
            }
        }
        if !pending.fields.contains_key("price_1") {
            for i in 1..=10 {
                if let Some(price) = row.get(&format!("price.{}", i)) {
                    pending.fields.insert(format!("price_{}", i), price.clone());
                    if let Some(qty) = row.get(&format!("minQty.{}", i)) {
                        pending.fields.insert(format!("qty_{}", i), qty.clone());
                    }
                }
            }
        }
        if !pending.fields.contains_key("brand") {
            if let Some(brand) = row.get("brand") {
                pending.fields.insert("brand".into(), brand.clone());
                pending.category_path = vec![brand.clone()];
            }
        }
        if pending.images.is_empty() {
            for key in ["listImage", "imprintTemplate"] {
                if let Some(url) = row.get(key) {
                    if !pending.images.iter().any(|u| u == url) {
                        pending.images.push(url.clone());
                    }
                }
            }
        }
    }
}

impl super::SourceAdapter for CsvMasterfileAdapter {
    fn next_record(&mut self) -> Option<Result<RawRecord, SourceError>> {
        if self.done {
            return None;
        }

        let mut row = StringRecord::new();
        loop {
            match self.reader.read_record(&mut row) {
                Ok(true) => {}
                Ok(false) => {
                    self.done = true;
                    return self.pending.take().map(Ok);
                }
                Err(e) => {
                    // One unreadable line; the reader stays usable
                    self.skipped += 1;
                    log::warn!("Skipping malformed CSV row: {}", e);
                    continue;
                }
            }

            let map = self.row_to_map(&row);
            let Some(code) = map.get("productCode").cloned() else {
                self.skipped += 1;
                continue;
            };
            if map.get("active").map(String::as_str) != Some("1") {
                continue;
            }

            match &mut self.pending {
                Some(pending) if pending.supplier_ref == code => {
                    Self::absorb_row(pending, &map);
                }
                Some(_) => {
                    // Product boundary: emit the finished record, start the next
                    let mut next = RawRecord {
                        supplier_ref: code,
                        ..RawRecord::default()
                    };
                    Self::absorb_row(&mut next, &map);
                    let finished = self.pending.replace(next);
                    return finished.map(Ok);
                }
                None => {
                    let mut next = RawRecord {
                        supplier_ref: code,
                        ..RawRecord::default()
                    };
                    Self::absorb_row(&mut next, &map);
                    self.pending = Some(next);
                }
            }
        }
    }

    fn skipped(&self) -> u64 {
        self.skipped
    }
}

fn csv_to_source(e: csv::Error) -> SourceError {
    match e.into_kind() {
        csv::ErrorKind::Io(io) => SourceError::Io(io),
        other => SourceError::MalformedRecord(format!("{:?}", other)),
    }
}
