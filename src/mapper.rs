//! Canonical mapping from raw supplier records to unified products
//!
//! Pure functions only: no I/O, no clock, no globals. Whatever quirks a
//! supplier format has must already be flattened onto canonical field keys
//! by its adapter; the mapper resolves languages, variants and numbers.

use crate::config::SupplierProfile;
use crate::error::MappingError;
use crate::models::{RawRecord, UnifiedProduct};
use std::collections::BTreeMap;

/// Map one raw record into a unified product.
///
/// Per-record failures (missing name, unparsable price or stock) are skips
/// for the caller, never fatal.
pub fn map_record(
    record: &RawRecord,
    profile: &SupplierProfile,
) -> Result<UnifiedProduct, MappingError> {
    if record.supplier_ref.trim().is_empty() {
        return Err(MappingError::MissingRequiredField("supplier_ref"));
    }

    let primary = primary_language_fields(record, profile);

    let title = primary
        .and_then(|fields| fields.get("name"))
        .or_else(|| record.fields.get("name"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(MappingError::MissingRequiredField("name"))?;

    let mut descriptions: BTreeMap<String, String> = BTreeMap::new();
    for (lang, fields) in &record.localized {
        if let Some(text) = fields.get("description") {
            descriptions.insert(lang.clone(), text.clone());
        }
    }
    if descriptions.is_empty() {
        if let Some(text) = record.fields.get("description") {
            let lang = profile.preferred_language.clone().unwrap_or_default();
            descriptions.insert(lang, text.clone());
        }
    }

    let price_cents = match record.fields.get("price_1") {
        Some(raw) => parse_price_cents(raw)?,
        None => 0,
    };
    let currency = record
        .fields
        .get("currency")
        .cloned()
        .unwrap_or_else(|| "EUR".to_string());

    let stock_quantity = match record.fields.get("stock") {
        Some(raw) => parse_stock(raw)?,
        None => 0,
    };

    let mut attributes = collect_variant_attributes(record);
    collect_price_tiers(record, &mut attributes);
    if let Some(brand) = record.fields.get("brand") {
        attributes.insert("brand".into(), vec![brand.clone()]);
    }

    Ok(UnifiedProduct {
        supplier: profile.code.clone(),
        sku: derive_sku(record, profile),
        title,
        descriptions,
        category_path: record.category_path.clone(),
        price_cents,
        currency,
        stock_quantity,
        attributes,
        image_urls: record.images.clone(),
    })
}

/// Pick the language block: preferred, then fallbacks in order, then any.
fn primary_language_fields<'a>(
    record: &'a RawRecord,
    profile: &SupplierProfile,
) -> Option<&'a BTreeMap<String, String>> {
    if record.localized.is_empty() {
        return None;
    }
    if let Some(preferred) = &profile.preferred_language {
        if let Some(fields) = record.localized.get(preferred) {
            return Some(fields);
        }
    }
    for fallback in &profile.language_fallbacks {
        if let Some(fields) = record.localized.get(fallback) {
            return Some(fields);
        }
    }
    record.localized.values().next()
}

/// Supplier-prefixed SKU, namespaced so numeric codes from different
/// suppliers can never collide.
fn derive_sku(record: &RawRecord, profile: &SupplierProfile) -> String {
    format!("{}_{}", profile.code, record.supplier_ref.trim())
}

/// Collapse variant rows into attribute sets (color, size, variant_sku).
///
/// Values keep first-seen order and are deduplicated; variant SKUs are
/// sorted so the lowest code is first and the result is deterministic.
fn collect_variant_attributes(record: &RawRecord) -> BTreeMap<String, Vec<String>> {
    let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for variant in &record.variants {
        for key in ["color", "size", "variant_sku", "gtin"] {
            if let Some(value) = variant.get(key).filter(|v| !v.trim().is_empty()) {
                let values = attributes.entry(key.to_string()).or_default();
                if !values.iter().any(|v| v == value) {
                    values.push(value.clone());
                }
            }
        }
    }
    if let Some(skus) = attributes.get_mut("variant_sku") {
        skus.sort();
    }
    attributes
}

/// Preserve quantity price tiers beyond the base tier as attributes.
fn collect_price_tiers(record: &RawRecord, attributes: &mut BTreeMap<String, Vec<String>>) {
    let mut tiers = Vec::new();
    for i in 2.. {
        let Some(price) = record.fields.get(&format!("price_{}", i)) else {
            break;
        };
        let qty = record
            .fields
            .get(&format!("qty_{}", i))
            .map(String::as_str)
            .unwrap_or("1");
        tiers.push(format!("{}:{}", qty, price.replace(',', ".")));
    }
    if !tiers.is_empty() {
        attributes.insert("price_tiers".into(), tiers);
    }
}

/// Parse a price string into minor units. Accepts "4.50" and "4,50".
fn parse_price_cents(raw: &str) -> Result<i64, MappingError> {
    let cleaned = raw.trim().replace(',', ".");
    let value: f64 = cleaned
        .parse()
        .map_err(|_| MappingError::InvalidPrice(raw.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(MappingError::InvalidPrice(raw.to_string()));
    }
    Ok((value * 100.0).round() as i64)
}

fn parse_stock(raw: &str) -> Result<u32, MappingError> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| MappingError::InvalidStock(raw.to_string()))?;
    u32::try_from(value).map_err(|_| MappingError::InvalidStock(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedFormat, RetrySettings};
    use std::path::PathBuf;

    fn profile(preferred: &str, fallbacks: &[&str]) -> SupplierProfile {
        SupplierProfile {
            code: "BIC".into(),
            name: "BIC".into(),
            format: FeedFormat::CsvMasterfile {
                path: PathBuf::from("unused.csv"),
            },
            preferred_language: Some(preferred.into()),
            language_fallbacks: fallbacks.iter().map(|s| s.to_string()).collect(),
            category_root: None,
            concurrency: 4,
            requests_per_second: 5,
            retry: RetrySettings::default(),
            abort_after_consecutive_failures: 25,
        }
    }

    fn record_with_languages(langs: &[(&str, &str)]) -> RawRecord {
        let mut record = RawRecord {
            supplier_ref: "P100".into(),
            ..RawRecord::default()
        };
        for (lang, name) in langs {
            record.localized.insert(
                lang.to_string(),
                BTreeMap::from([
                    ("name".to_string(), name.to_string()),
                    ("description".to_string(), format!("{} desc", name)),
                ]),
            );
        }
        record
    }

    #[test]
    fn picks_preferred_language() {
        let record = record_with_languages(&[("en", "Blue pen"), ("it", "Penna blu")]);
        let product = map_record(&record, &profile("it", &["en"])).unwrap();
        assert_eq!(product.title, "Penna blu");
        // All languages kept in descriptions
        assert_eq!(product.descriptions.len(), 2);
    }

    #[test]
    fn falls_back_in_configured_order() {
        let record = record_with_languages(&[("en", "Blue pen"), ("de", "Blauer Stift")]);
        let product = map_record(&record, &profile("it", &["en", "de"])).unwrap();
        assert_eq!(product.title, "Blue pen");
    }

    #[test]
    fn falls_back_to_any_language() {
        let record = record_with_languages(&[("de", "Blauer Stift")]);
        let product = map_record(&record, &profile("it", &["en"])).unwrap();
        assert_eq!(product.title, "Blauer Stift");
    }

    #[test]
    fn missing_name_is_a_mapping_error() {
        let record = RawRecord {
            supplier_ref: "P1".into(),
            ..RawRecord::default()
        };
        assert_eq!(
            map_record(&record, &profile("it", &[])),
            Err(MappingError::MissingRequiredField("name"))
        );
    }

    #[test]
    fn sku_is_supplier_prefixed() {
        let mut record = record_with_languages(&[("it", "Penna")]);
        record.supplier_ref = " 2040 ".into();
        let product = map_record(&record, &profile("it", &[])).unwrap();
        assert_eq!(product.sku, "BIC_2040");
    }

    #[test]
    fn parses_comma_decimal_prices() {
        let mut record = record_with_languages(&[("it", "Penna")]);
        record.fields.insert("price_1".into(), "4,50".into());
        let product = map_record(&record, &profile("it", &[])).unwrap();
        assert_eq!(product.price_cents, 450);
    }

    #[test]
    fn invalid_price_and_stock_are_errors() {
        let mut record = record_with_languages(&[("it", "Penna")]);
        record.fields.insert("price_1".into(), "n/a".into());
        assert!(matches!(
            map_record(&record, &profile("it", &[])),
            Err(MappingError::InvalidPrice(_))
        ));

        let mut record = record_with_languages(&[("it", "Penna")]);
        record.fields.insert("stock".into(), "-5".into());
        assert!(matches!(
            map_record(&record, &profile("it", &[])),
            Err(MappingError::InvalidStock(_))
        ));
    }

    #[test]
    fn variants_collapse_into_sorted_attributes() {
        let mut record = record_with_languages(&[("it", "Borraccia")]);
        record.variants = vec![
            BTreeMap::from([
                ("variant_sku".to_string(), "2040-R".to_string()),
                ("color".to_string(), "Red".to_string()),
            ]),
            BTreeMap::from([
                ("variant_sku".to_string(), "2040-B".to_string()),
                ("color".to_string(), "Blue".to_string()),
            ]),
            BTreeMap::from([
                ("variant_sku".to_string(), "2040-B".to_string()),
                ("color".to_string(), "Blue".to_string()),
            ]),
        ];
        let product = map_record(&record, &profile("it", &[])).unwrap();
        // Lowest variant code first, duplicates removed
        assert_eq!(product.attributes["variant_sku"], vec!["2040-B", "2040-R"]);
        assert_eq!(product.attributes["color"], vec!["Red", "Blue"]);
    }

    #[test]
    fn price_tiers_are_preserved_as_attributes() {
        let mut record = record_with_languages(&[("it", "Penna")]);
        record.fields.insert("price_1".into(), "0,45".into());
        record.fields.insert("qty_2".into(), "250".into());
        record.fields.insert("price_2".into(), "0,39".into());
        let product = map_record(&record, &profile("it", &[])).unwrap();
        assert_eq!(product.price_cents, 45);
        assert_eq!(product.attributes["price_tiers"], vec!["250:0.39"]);
    }

    #[test]
    fn mapping_is_deterministic() {
        let record = record_with_languages(&[("it", "Penna"), ("en", "Pen")]);
        let p = profile("it", &["en"]);
        let a = map_record(&record, &p).unwrap();
        let b = map_record(&record, &p).unwrap();
        assert_eq!(a.checksum(), b.checksum());
    }
}
