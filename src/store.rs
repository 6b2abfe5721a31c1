//! Local state store for sync runs
//!
//! Uses parameterized queries exclusively (no SQL string concatenation).
//! Every write is a single atomic statement, so a killed run never leaves a
//! half-written row. Holds the per-supplier snapshot, the mirrored category
//! tree, the delivered-image cache and the run log.

use crate::category::CategoryNode;
use crate::models::{RunState, SnapshotEntry, SyncRun};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

/// Result type for store operations
pub type DbResult<T> = rusqlite::Result<T>;

/// Initialize the store schema
///
/// Creates tables if they don't exist:
/// - `snapshot`: last-synced checksum and remote id per (supplier, sku)
/// - `categories`: mirror of the remote category tree
/// - `delivered_images`: which transformed images the remote already pulled
/// - `sync_runs`: one row per run with final counters
pub fn init_schema(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS snapshot (
            supplier TEXT NOT NULL,
            sku TEXT NOT NULL,
            checksum TEXT NOT NULL,
            remote_id INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (supplier, sku)
        );

        CREATE TABLE IF NOT EXISTS categories (
            key TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            parent_key TEXT,
            remote_id INTEGER
        );

        CREATE TABLE IF NOT EXISTS delivered_images (
            sku TEXT NOT NULL,
            source_url TEXT NOT NULL,
            checksum TEXT NOT NULL,
            delivered_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (sku, source_url)
        );

        CREATE TABLE IF NOT EXISTS sync_runs (
            id TEXT PRIMARY KEY,
            supplier TEXT NOT NULL,
            state TEXT NOT NULL,
            processed INTEGER NOT NULL,
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            unchanged INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            errors TEXT NOT NULL DEFAULT '[]',
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_snapshot_supplier ON snapshot(supplier);
        CREATE INDEX IF NOT EXISTS idx_sync_runs_supplier ON sync_runs(supplier);
        ",
    )?;

    log::info!("Store schema initialized");
    Ok(())
}

/// Load the full snapshot for one supplier, keyed by sku.
pub fn load_snapshot(conn: &Connection, supplier: &str) -> DbResult<BTreeMap<String, SnapshotEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT supplier, sku, checksum, remote_id FROM snapshot WHERE supplier = ?1",
    )?;

    let entries: DbResult<Vec<SnapshotEntry>> = stmt
        .query_map(params![supplier], |row| {
            Ok(SnapshotEntry {
                supplier: row.get(0)?,
                sku: row.get(1)?,
                checksum: row.get(2)?,
                remote_id: row.get(3)?,
            })
        })?
        .collect();

    Ok(entries?
        .into_iter()
        .map(|e| (e.sku.clone(), e))
        .collect())
}

/// Record the post-upsert state of one product.
pub fn save_snapshot_entry(conn: &Connection, entry: &SnapshotEntry) -> DbResult<()> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO snapshot (supplier, sku, checksum, remote_id, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))",
    )?
    .execute(params![
        &entry.supplier,
        &entry.sku,
        &entry.checksum,
        entry.remote_id,
    ])?;
    Ok(())
}

/// Load the persisted category tree mirror.
pub fn load_category_tree(conn: &Connection) -> DbResult<Vec<CategoryNode>> {
    let mut stmt =
        conn.prepare_cached("SELECT key, name, parent_key, remote_id FROM categories")?;
    let nodes: DbResult<Vec<CategoryNode>> = stmt
        .query_map([], |row| {
            Ok(CategoryNode {
                key: row.get(0)?,
                name: row.get(1)?,
                parent_key: row.get(2)?,
                remote_id: row.get(3)?,
            })
        })?
        .collect();
    nodes
}

/// Persist one category node, replacing any previous state for its key.
pub fn persist_category_node(conn: &Connection, node: &CategoryNode) -> DbResult<()> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO categories (key, name, parent_key, remote_id)
         VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![
        &node.key,
        &node.name,
        &node.parent_key,
        node.remote_id,
    ])?;
    Ok(())
}

/// True if this exact transformed image was already pulled by the remote.
pub fn image_delivered(
    conn: &Connection,
    sku: &str,
    source_url: &str,
    checksum: &str,
) -> DbResult<bool> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT checksum FROM delivered_images WHERE sku = ?1 AND source_url = ?2",
            params![sku, source_url],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stored.as_deref() == Some(checksum))
}

/// Remember a delivered image so reruns skip it until the source changes.
pub fn mark_image_delivered(
    conn: &Connection,
    sku: &str,
    source_url: &str,
    checksum: &str,
) -> DbResult<()> {
    conn.prepare_cached(
        "INSERT OR REPLACE INTO delivered_images (sku, source_url, checksum, delivered_at)
         VALUES (?1, ?2, ?3, datetime('now'))",
    )?
    .execute(params![sku, source_url, checksum])?;
    Ok(())
}

/// Drop the delivered-image cache, forcing full re-delivery next run.
pub fn clear_image_cache(conn: &Connection) -> DbResult<usize> {
    let removed = conn.execute("DELETE FROM delivered_images", [])?;
    log::info!("Cleared {} delivered-image entries", removed);
    Ok(removed)
}

/// Insert or update the row for one run. The full per-item error list is
/// kept here; the console summary only shows a sample.
pub fn record_run(conn: &Connection, run: &SyncRun) -> DbResult<()> {
    let state = match run.state {
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Aborted => "aborted",
    };
    let errors = serde_json::to_string(&run.errors).unwrap_or_else(|_| "[]".to_string());
    conn.prepare_cached(
        "INSERT OR REPLACE INTO sync_runs
         (id, supplier, state, processed, created, updated, unchanged, failed, errors, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?
    .execute(params![
        &run.id,
        &run.supplier,
        state,
        run.counters.processed,
        run.counters.created,
        run.counters.updated,
        run.counters.unchanged,
        run.counters.failed,
        errors,
        &run.started_at,
        &run.finished_at,
    ])?;
    Ok(())
}

/// Count of snapshot rows for one supplier.
pub fn snapshot_count(conn: &Connection, supplier: &str) -> DbResult<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM snapshot WHERE supplier = ?1",
        params![supplier],
        |row| row.get(0),
    )
}
