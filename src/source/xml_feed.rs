//! Streaming adapter for multi-file XML feeds
//!
//! The product file is large (tens of thousands of records) and is streamed
//! element by element; only the current `<product>` subtree is held in
//! memory. Stock and price tiers live in separate files keyed by the shared
//! product ref; those side files carry one small fact per product, so they
//! are folded into compact per-ref lookups at open time and joined during
//! iteration.
//!
//! Adapters emit canonical field keys ("name", "description", "stock",
//! "price_1"/"qty_1", ...) so the mapper never sees supplier tag names.

use crate::error::SourceError;
use crate::models::RawRecord;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Maximum nesting depth accepted inside one product element.
const MAX_ELEMENT_DEPTH: usize = 16;

/// One parsed XML subtree. Bounded: a single product and its children.
#[derive(Debug, Default)]
struct Elem {
    name: String,
    text: String,
    children: Vec<Elem>,
}

impl Elem {
    fn child(&self, name: &str) -> Option<&Elem> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str()).filter(|t| !t.is_empty())
    }
}

/// Streaming adapter over a supplier's XML feed directory.
pub struct XmlFeedAdapter {
    reader: Reader<BufReader<File>>,
    buf: Vec<u8>,
    stock_by_ref: HashMap<String, u32>,
    tiers_by_ref: HashMap<String, Vec<(u32, String)>>,
    skipped: u64,
    done: bool,
}

impl XmlFeedAdapter {
    /// Open the feed. Missing files listed in the profile are fatal.
    pub fn open(
        dir: &Path,
        product_file: &str,
        stock_file: Option<&str>,
        price_file: Option<&str>,
    ) -> Result<Self, SourceError> {
        let product_path = require_file(dir, product_file)?;

        let stock_by_ref = match stock_file {
            Some(name) => parse_stock_file(&require_file(dir, name)?)?,
            None => HashMap::new(),
        };
        let tiers_by_ref = match price_file {
            Some(name) => parse_price_file(&require_file(dir, name)?)?,
            None => HashMap::new(),
        };

        log::info!(
            "Opened XML feed {} ({} stock refs, {} price refs)",
            product_path.display(),
            stock_by_ref.len(),
            tiers_by_ref.len()
        );

        Ok(Self {
            reader: open_reader(&product_path)?,
            buf: Vec::with_capacity(4096),
            stock_by_ref,
            tiers_by_ref,
            skipped: 0,
            done: false,
        })
    }

    fn read_next_product(&mut self) -> Result<Option<Elem>, SourceError> {
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(start)) if start.name().as_ref() == b"product" => {
                    match read_subtree(&mut self.reader, "product", 0) {
                        Ok(elem) => return Ok(Some(elem)),
                        Err(e) => {
                            // One broken element; the reader stays usable and
                            // the scan resumes at the next product
                            self.skipped += 1;
                            log::warn!("Skipping malformed product element: {}", e);
                        }
                    }
                }
                Ok(Event::Eof) => return Ok(None),
                Ok(_) => continue,
                Err(e) => {
                    return Err(SourceError::MalformedRecord(format!(
                        "XML error at byte {}: {}",
                        self.reader.buffer_position(),
                        e
                    )))
                }
            }
        }
    }

    fn record_from_elem(&self, elem: &Elem) -> Option<RawRecord> {
        let supplier_ref = elem.child_text("ref")?.to_string();

        let mut record = RawRecord {
            supplier_ref: supplier_ref.clone(),
            ..RawRecord::default()
        };

        // Flat leaf fields, renamed onto canonical keys where known
        for child in &elem.children {
            if !child.children.is_empty() || child.text.is_empty() {
                continue;
            }
            let key = match child.name.as_str() {
                "ref" => continue,
                "extendedinfo" => "description",
                "otherinfo" => "short_description",
                other => other,
            };
            record.fields.insert(key.to_string(), child.text.clone());
        }

        // Main image first, gallery after, deduplicated
        if let Some(main) = elem.child_text("imagemain") {
            record.images.push(main.to_string());
        }
        if let Some(images) = elem.child("images") {
            for image in images.children.iter().filter(|c| c.name == "image") {
                if let Some(url) = image.child_text("imagemax") {
                    if !record.images.iter().any(|u| u == url) {
                        record.images.push(url.to_string());
                    }
                }
            }
        }

        // category_name_1 .. category_name_5, root first
        if let Some(categories) = elem.child("categories") {
            for i in 1..=5 {
                if let Some(name) = categories.child_text(&format!("category_name_{}", i)) {
                    record.category_path.push(name.to_string());
                }
            }
        }

        if let Some(variants) = elem.child("variants") {
            for variant in variants.children.iter().filter(|c| c.name == "variant") {
                let mut row = BTreeMap::new();
                for leaf in variant.children.iter().filter(|c| c.children.is_empty()) {
                    let key = match leaf.name.as_str() {
                        "refct" => "variant_sku",
                        "colour" => "color",
                        "matnr" => "gtin",
                        other => other,
                    };
                    if !leaf.text.is_empty() {
                        row.insert(key.to_string(), leaf.text.clone());
                    }
                }
                if !row.is_empty() {
                    record.variants.push(row);
                }
            }
        }

        // Join side files by ref
        if let Some(stock) = self.stock_by_ref.get(&supplier_ref) {
            record.fields.insert("stock".into(), stock.to_string());
        }
        if let Some(tiers) = self.tiers_by_ref.get(&supplier_ref) {
            for (i, (qty, price)) in tiers.iter().enumerate() {
                record.fields.insert(format!("qty_{}", i + 1), qty.to_string());
                record.fields.insert(format!("price_{}", i + 1), price.clone());
            }
        }

        Some(record)
    }
}

impl super::SourceAdapter for XmlFeedAdapter {
    fn next_record(&mut self) -> Option<Result<RawRecord, SourceError>> {
        if self.done {
            return None;
        }
        loop {
            match self.read_next_product() {
                Ok(Some(elem)) => match self.record_from_elem(&elem) {
                    Some(record) => return Some(Ok(record)),
                    None => {
                        // Product without a ref cannot be joined or synced
                        self.skipped += 1;
                        log::warn!("Skipping product element without <ref>");
                    }
                },
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }

    fn skipped(&self) -> u64 {
        self.skipped
    }
}

fn require_file(dir: &Path, name: &str) -> Result<PathBuf, SourceError> {
    let path = dir.join(name);
    if !path.exists() {
        return Err(SourceError::MissingFile(path.display().to_string()));
    }
    Ok(path)
}

fn open_reader(path: &Path) -> Result<Reader<BufReader<File>>, SourceError> {
    let file = File::open(path)?;
    let mut reader = Reader::from_reader(BufReader::new(file));
    reader.config_mut().trim_text(true);
    // read_subtree matches end tags itself so a mismatch stays scoped to one
    // product element instead of poisoning the reader
    reader.config_mut().check_end_names = false;
    Ok(reader)
}

/// Read one element subtree after its Start event has been consumed.
fn read_subtree(
    reader: &mut Reader<BufReader<File>>,
    name: &str,
    depth: usize,
) -> Result<Elem, SourceError> {
    if depth > MAX_ELEMENT_DEPTH {
        return Err(SourceError::MalformedRecord(format!(
            "element <{}> nested deeper than {}",
            name, MAX_ELEMENT_DEPTH
        )));
    }

    let mut elem = Elem {
        name: name.to_string(),
        ..Elem::default()
    };
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                let child_name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                elem.children.push(read_subtree(reader, &child_name, depth + 1)?);
            }
            Ok(Event::Empty(start)) => {
                elem.children.push(Elem {
                    name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    ..Elem::default()
                });
            }
            Ok(Event::Text(text)) => {
                let decoded = text
                    .unescape()
                    .map_err(|e| SourceError::MalformedRecord(e.to_string()))?;
                elem.text.push_str(decoded.trim());
            }
            Ok(Event::CData(data)) => {
                elem.text.push_str(String::from_utf8_lossy(&data).trim());
            }
            Ok(Event::End(end)) if end.name().as_ref() == elem.name.as_bytes() => {
                return Ok(elem);
            }
            Ok(Event::End(end)) => {
                return Err(SourceError::MalformedRecord(format!(
                    "unexpected </{}> inside <{}>",
                    String::from_utf8_lossy(end.name().as_ref()),
                    elem.name
                )));
            }
            Ok(Event::Eof) => {
                return Err(SourceError::MalformedRecord(format!(
                    "EOF inside <{}>",
                    elem.name
                )));
            }
            Ok(_) => continue,
            Err(e) => return Err(SourceError::MalformedRecord(e.to_string())),
        }
    }
}

/// Fold the stock side file into ref -> total quantity.
///
/// Stock rows repeat per variant; quantities are summed per product ref.
fn parse_stock_file(path: &Path) -> Result<HashMap<String, u32>, SourceError> {
    let mut reader = open_reader(path)?;
    let mut totals: HashMap<String, u32> = HashMap::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) if start.name().as_ref() == b"product" => {
                let elem = read_subtree(&mut reader, "product", 0)?;
                let Some(supplier_ref) = elem.child_text("ref") else {
                    continue;
                };
                let quantity = elem
                    .child("infostocks")
                    .into_iter()
                    .flat_map(|stocks| stocks.children.iter())
                    .filter(|c| c.name == "infostock")
                    .filter_map(|c| c.child_text("stock"))
                    .filter_map(|t| t.parse::<u32>().ok())
                    .sum::<u32>();
                *totals.entry(supplier_ref.to_string()).or_insert(0) += quantity;
            }
            Ok(Event::Eof) => break,
            Ok(_) => continue,
            Err(e) => return Err(SourceError::MalformedRecord(e.to_string())),
        }
    }

    Ok(totals)
}

/// Fold the price side file into ref -> ordered (min quantity, price) tiers.
fn parse_price_file(path: &Path) -> Result<HashMap<String, Vec<(u32, String)>>, SourceError> {
    let mut reader = open_reader(path)?;
    let mut tiers: HashMap<String, Vec<(u32, String)>> = HashMap::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) if start.name().as_ref() == b"product" => {
                let elem = read_subtree(&mut reader, "product", 0)?;
                let Some(supplier_ref) = elem.child_text("ref") else {
                    continue;
                };
                let mut product_tiers = Vec::new();
                for i in 1..=4 {
                    let Some(price) = elem.child_text(&format!("price{}", i)) else {
                        continue;
                    };
                    // First tier sections look like "-50"; that means qty 1
                    let qty = elem
                        .child_text(&format!("section{}", i))
                        .filter(|s| !s.starts_with('-'))
                        .and_then(|s| s.parse::<u32>().ok())
                        .unwrap_or(1);
                    product_tiers.push((qty, price.to_string()));
                }
                if !product_tiers.is_empty() {
                    product_tiers.sort_by_key(|(qty, _)| *qty);
                    tiers.insert(supplier_ref.to_string(), product_tiers);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => continue,
            Err(e) => return Err(SourceError::MalformedRecord(e.to_string())),
        }
    }

    Ok(tiers)
}
