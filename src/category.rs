//! Remote category tree reconciliation
//!
//! The remote catalog organizes products in a category tree; supplier feeds
//! ship bare name paths. This module keeps an in-memory mirror of the remote
//! tree, keyed by a normalized path so that paths differing only in case or
//! stray whitespace unify onto one node. Nodes missing remotely are reported
//! parent-first so the caller can create them in an order the remote accepts.

use std::collections::BTreeMap;

/// One known category, mirrored from the remote tree or pending creation.
#[derive(Debug, Clone)]
pub struct CategoryNode {
    /// Normalized full path, e.g. "hotel supplies/bathroom/soap"
    pub key: String,
    /// Display name of this segment, first spelling seen wins
    pub name: String,
    pub parent_key: Option<String>,
    /// Remote identifier once the node exists remotely
    pub remote_id: Option<i64>,
}

/// In-memory mirror of the remote category tree.
#[derive(Debug, Default)]
pub struct CategoryTree {
    nodes: BTreeMap<String, CategoryNode>,
}

/// Lowercase and collapse internal whitespace so "Bath  Room" and
/// "bath room" land on the same node.
fn normalize_segment(segment: &str) -> String {
    segment
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl CategoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the mirror from persisted nodes.
    pub fn from_nodes(nodes: impl IntoIterator<Item = CategoryNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.key.clone(), n)).collect(),
        }
    }

    /// Register a category path, grafted under the supplier's root when one
    /// is configured. Empty segments are dropped. Returns the node keys along
    /// the path, root first; an empty result means the product stays
    /// uncategorized.
    pub fn ensure_path(&mut self, root: Option<&str>, segments: &[String]) -> Vec<String> {
        let mut display: Vec<&str> = Vec::new();
        if let Some(root) = root {
            if !root.trim().is_empty() {
                display.push(root);
            }
        }
        display.extend(segments.iter().map(String::as_str).filter(|s| !s.trim().is_empty()));

        let mut keys = Vec::with_capacity(display.len());
        let mut parent_key: Option<String> = None;
        for segment in display {
            let normalized = normalize_segment(segment);
            let key = match &parent_key {
                Some(parent) => format!("{}/{}", parent, normalized),
                None => normalized,
            };
            self.nodes.entry(key.clone()).or_insert_with(|| CategoryNode {
                key: key.clone(),
                name: segment.trim().to_string(),
                parent_key: parent_key.clone(),
                remote_id: None,
            });
            parent_key = Some(key.clone());
            keys.push(key);
        }
        keys
    }

    /// Keys along a path that do not exist remotely yet, parent-first.
    pub fn pending_along(&self, keys: &[String]) -> Vec<String> {
        keys.iter()
            .filter(|key| {
                self.nodes
                    .get(*key)
                    .is_some_and(|node| node.remote_id.is_none())
            })
            .cloned()
            .collect()
    }

    pub fn node(&self, key: &str) -> Option<&CategoryNode> {
        self.nodes.get(key)
    }

    /// Remote id of a node's parent, `None` for top-level nodes.
    pub fn parent_remote_id(&self, key: &str) -> Option<i64> {
        self.nodes
            .get(key)
            .and_then(|node| node.parent_key.as_deref())
            .and_then(|parent| self.nodes.get(parent))
            .and_then(|parent| parent.remote_id)
    }

    /// Record that a node now exists remotely. The first assignment wins;
    /// a remote id is never overwritten.
    pub fn set_remote_id(&mut self, key: &str, remote_id: i64) {
        if let Some(node) = self.nodes.get_mut(key) {
            if node.remote_id.is_none() {
                node.remote_id = Some(remote_id);
            } else {
                log::warn!("Category {} already has a remote id, keeping it", key);
            }
        }
    }

    /// Remote id of the last node on the path, if created.
    pub fn leaf_remote_id(&self, keys: &[String]) -> Option<i64> {
        keys.last()
            .and_then(|key| self.nodes.get(key))
            .and_then(|node| node.remote_id)
    }

    /// All nodes, for persistence.
    pub fn nodes(&self) -> impl Iterator<Item = &CategoryNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
