//! Storage abstraction layer for RevDB
//!
//! The engine keeps every revision tree in memory and writes through a
//! [`RevisionStore`]. Each outermost transaction hands the store one
//! [`WriteBatch`], which must be applied atomically.

use crate::rev_tree::RevNode;
use crate::revision::RevisionId;
use std::collections::{BTreeSet, HashMap};

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by storage backends
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// A revision row as persisted
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRevision {
    pub doc_id: String,
    pub node: RevNode,
}

/// Everything a store holds, as returned by [`RevisionStore::load`]
#[derive(Debug, Clone, Default)]
pub struct StoredState {
    pub revisions: Vec<StoredRevision>,
    pub pruned: Vec<(String, RevisionId)>,
    pub last_sequence: u64,
    pub max_rev_tree_depth: Option<u32>,
    pub uuid: Option<String>,
    pub created_at: Option<String>,
}

/// Database identity written once on first open
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub uuid: String,
    pub created_at: String,
}

/// Changes made by one outermost transaction
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub revisions: Vec<StoredRevision>,
    /// Ids removed from a tree by compaction
    pub pruned: Vec<(String, RevisionId)>,
    pub last_sequence: Option<u64>,
    pub max_rev_tree_depth: Option<u32>,
    pub identity: Option<Identity>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
            && self.pruned.is_empty()
            && self.last_sequence.is_none()
            && self.max_rev_tree_depth.is_none()
            && self.identity.is_none()
    }
}

/// Persistent revision storage interface
///
/// Implementations only need single-writer semantics; the engine serializes
/// every call.
pub trait RevisionStore: Send {
    /// Read the whole persisted state.
    fn load(&mut self) -> Result<StoredState>;

    /// Apply a batch atomically: either every change lands or none does.
    fn commit(&mut self, batch: &WriteBatch) -> Result<()>;

    /// Release backend resources.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Revision store that keeps rows in memory
#[derive(Debug, Default)]
pub struct MemoryRevisionStore {
    revisions: HashMap<(String, RevisionId), RevNode>,
    pruned: BTreeSet<(String, RevisionId)>,
    last_sequence: u64,
    max_rev_tree_depth: Option<u32>,
    identity: Option<Identity>,
}

impl MemoryRevisionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RevisionStore for MemoryRevisionStore {
    fn load(&mut self) -> Result<StoredState> {
        let mut revisions: Vec<StoredRevision> = self
            .revisions
            .iter()
            .map(|((doc_id, _), node)| StoredRevision {
                doc_id: doc_id.clone(),
                node: node.clone(),
            })
            .collect();
        revisions.sort_by(|a, b| (&a.doc_id, &a.node.rev_id).cmp(&(&b.doc_id, &b.node.rev_id)));
        Ok(StoredState {
            revisions,
            pruned: self.pruned.iter().cloned().collect(),
            last_sequence: self.last_sequence,
            max_rev_tree_depth: self.max_rev_tree_depth,
            uuid: self.identity.as_ref().map(|i| i.uuid.clone()),
            created_at: self.identity.as_ref().map(|i| i.created_at.clone()),
        })
    }

    fn commit(&mut self, batch: &WriteBatch) -> Result<()> {
        for row in &batch.revisions {
            self.revisions
                .insert((row.doc_id.clone(), row.node.rev_id.clone()), row.node.clone());
        }
        for (doc_id, rev_id) in &batch.pruned {
            let key = (doc_id.clone(), rev_id.clone());
            self.revisions.remove(&key);
            self.pruned.insert(key);
        }
        if let Some(seq) = batch.last_sequence {
            self.last_sequence = seq;
        }
        if let Some(depth) = batch.max_rev_tree_depth {
            self.max_rev_tree_depth = Some(depth);
        }
        if let Some(identity) = &batch.identity {
            self.identity = Some(identity.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> RevisionId {
        RevisionId::parse(s).unwrap()
    }

    #[test]
    fn test_memory_store_commit_and_load() {
        let mut store = MemoryRevisionStore::new();
        let mut batch = WriteBatch::default();
        assert!(batch.is_empty());
        batch.revisions.push(StoredRevision {
            doc_id: "doc".into(),
            node: RevNode::stub(rid("1-aa"), None),
        });
        batch.revisions.push(StoredRevision {
            doc_id: "doc".into(),
            node: RevNode::stub(rid("2-bb"), Some(rid("1-aa"))),
        });
        batch.last_sequence = Some(2);
        store.commit(&batch).unwrap();

        let mut prune = WriteBatch::default();
        prune.pruned.push(("doc".into(), rid("1-aa")));
        prune.max_rev_tree_depth = Some(1);
        store.commit(&prune).unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.revisions.len(), 1);
        assert_eq!(state.revisions[0].node.rev_id, rid("2-bb"));
        assert_eq!(state.pruned, vec![("doc".to_string(), rid("1-aa"))]);
        assert_eq!(state.last_sequence, 2);
        assert_eq!(state.max_rev_tree_depth, Some(1));
        assert!(state.uuid.is_none());
    }
}
