//! Compaction: tree pruning and attachment garbage collection

use crate::attachments::{AttachmentStore, BlobKey};
use crate::error::Result;
use crate::store::{DocumentStore, Writer};
use std::collections::HashSet;

/// Outcome of [`crate::Database::compact`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub documents_pruned: usize,
    pub revisions_pruned: usize,
    /// Zero when compaction ran inside an enclosing transaction; collection
    /// then happens at the outer commit.
    pub attachments_removed: usize,
}

/// Prune all trees in the current write scope.
pub(crate) fn prune(writer: &mut Writer<'_>) -> CompactionStats {
    let (documents_pruned, revisions_pruned) = writer.prune_all();
    CompactionStats {
        documents_pruned,
        revisions_pruned,
        attachments_removed: 0,
    }
}

/// Digests referenced by any retained revision
pub(crate) fn referenced_blobs(store: &DocumentStore) -> HashSet<BlobKey> {
    store
        .trees()
        .flat_map(|tree| tree.nodes())
        .flat_map(|node| node.attachments.values().map(|info| info.digest))
        .collect()
}

/// Delete every blob no retained revision references.
pub(crate) fn collect_garbage(store: &DocumentStore, blobs: &AttachmentStore) -> Result<usize> {
    let referenced = referenced_blobs(store);
    let mut removed = 0;
    for key in blobs.keys()? {
        if !referenced.contains(&key) && blobs.remove(&key)? {
            tracing::debug!("Removed unreferenced attachment {}", key);
            removed += 1;
        }
    }
    Ok(removed)
}
