//! Catalog Sync - supplier catalog to remote shop synchronization
//!
//! Streams supplier feeds (multi-file XML, multilingual CSV), maps them onto
//! a canonical product model, and pushes only what changed to a remote
//! WooCommerce-style catalog, with category reconciliation and image
//! delivery over an ephemeral pull host.

pub mod category;
pub mod config;
pub mod delta;
pub mod error;
pub mod images;
pub mod mapper;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod remote;
pub mod source;
pub mod store;

pub use config::{RunOptions, SyncConfig};
pub use error::{Result, SyncError};
pub use models::{SyncRun, UnifiedProduct};
pub use orchestrator::SyncEngine;
