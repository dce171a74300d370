//! Per-document revision tree
//!
//! Nodes live in an arena keyed by [`RevisionId`] with parent back-links, so
//! the tree has no owning references between nodes. Ids removed by pruning
//! are remembered in `pruned` so that a later insert of the same ancestor is
//! recognized as already seen.

use crate::attachments::AttachmentInfo;
use crate::revision::{Revision, RevisionId};
use crate::value::Map;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// One revision held in a tree
#[derive(Debug, Clone, PartialEq)]
pub struct RevNode {
    pub rev_id: RevisionId,
    pub parent: Option<RevisionId>,
    pub deleted: bool,
    /// `None` for ancestor stubs inserted without a body
    pub sequence: Option<u64>,
    pub body: Option<Arc<Map>>,
    pub attachments: Arc<BTreeMap<String, AttachmentInfo>>,
}

impl RevNode {
    /// History stub carrying only an id and its parent link
    pub fn stub(rev_id: RevisionId, parent: Option<RevisionId>) -> Self {
        Self {
            rev_id,
            parent,
            deleted: false,
            sequence: None,
            body: None,
            attachments: Arc::new(BTreeMap::new()),
        }
    }

    pub fn is_stub(&self) -> bool {
        self.body.is_none()
    }

    pub fn to_revision(&self, doc_id: &str) -> Revision {
        Revision {
            doc_id: doc_id.to_string(),
            rev_id: self.rev_id.clone(),
            parent: self.parent.clone(),
            deleted: self.deleted,
            sequence: self.sequence,
            body: self.body.clone(),
            attachments: Arc::clone(&self.attachments),
        }
    }
}

/// Winner order: live beats deleted, then higher generation, then greater digest.
fn winner_order(a: &RevNode, b: &RevNode) -> Ordering {
    (!a.deleted)
        .cmp(&!b.deleted)
        .then_with(|| a.rev_id.cmp(&b.rev_id))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevisionTree {
    nodes: HashMap<RevisionId, RevNode>,
    pruned: BTreeSet<RevisionId>,
}

impl RevisionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, id: &RevisionId) -> Option<&RevNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &RevisionId) -> bool {
        self.nodes.contains_key(id)
    }

    /// True if the id is present or was pruned earlier.
    pub fn knows(&self, id: &RevisionId) -> bool {
        self.contains(id) || self.is_pruned(id)
    }

    pub fn is_pruned(&self, id: &RevisionId) -> bool {
        self.pruned.contains(id)
    }

    pub fn pruned(&self) -> impl Iterator<Item = &RevisionId> {
        self.pruned.iter()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &RevNode> {
        self.nodes.values()
    }

    /// Insert a node. Returns false (and leaves the tree untouched) when the
    /// id is already known.
    pub fn insert(&mut self, node: RevNode) -> bool {
        if self.knows(&node.rev_id) {
            return false;
        }
        self.nodes.insert(node.rev_id.clone(), node);
        true
    }

    /// Record an id as pruned without a node, used when loading from storage.
    pub(crate) fn mark_pruned(&mut self, id: RevisionId) {
        self.nodes.remove(&id);
        self.pruned.insert(id);
    }

    /// Ids named as a parent by some node
    fn parent_ids(&self) -> HashSet<&RevisionId> {
        self.nodes.values().filter_map(|n| n.parent.as_ref()).collect()
    }

    /// Nodes no other node names as its parent
    pub fn leaves(&self) -> Vec<&RevNode> {
        let parents = self.parent_ids();
        self.nodes
            .values()
            .filter(|n| !parents.contains(&n.rev_id))
            .collect()
    }

    pub fn is_leaf(&self, id: &RevisionId) -> bool {
        self.contains(id) && !self.nodes.values().any(|n| n.parent.as_ref() == Some(id))
    }

    /// The current revision of the document
    pub fn winner(&self) -> Option<&RevNode> {
        self.leaves().into_iter().max_by(|a, b| winner_order(a, b))
    }

    /// Live leaves, winner first. A tree whose leaves are all deleted
    /// reports just its winning tombstone.
    pub fn conflicting_leaves(&self) -> Vec<&RevNode> {
        let mut live: Vec<&RevNode> = self.leaves().into_iter().filter(|n| !n.deleted).collect();
        if live.is_empty() {
            return self.winner().into_iter().collect();
        }
        live.sort_by(|a, b| winner_order(b, a));
        live
    }

    /// Two or more live leaves share the highest live generation.
    pub fn is_in_conflict(&self) -> bool {
        let live: Vec<&RevNode> = self.leaves().into_iter().filter(|n| !n.deleted).collect();
        let Some(top) = live.iter().map(|n| n.rev_id.generation()).max() else {
            return false;
        };
        live.iter().filter(|n| n.rev_id.generation() == top).count() >= 2
    }

    /// Walk from `id` back through retained ancestors, newest first.
    pub fn history(&self, id: &RevisionId) -> Vec<&RevNode> {
        let mut out = Vec::new();
        let mut cursor = self.nodes.get(id);
        while let Some(node) = cursor {
            out.push(node);
            cursor = node.parent.as_ref().and_then(|p| self.nodes.get(p));
        }
        out
    }

    /// Remove every non-leaf node whose generation is at least `depth` below
    /// the winner. Removed ids move to the pruned set and are returned.
    pub fn prune_to_depth(&mut self, depth: u32) -> Vec<RevisionId> {
        let Some(winner_generation) = self.winner().map(|w| w.rev_id.generation()) else {
            return Vec::new();
        };
        let cutoff = winner_generation.saturating_sub(depth);
        if cutoff == 0 {
            return Vec::new();
        }
        let leaves: HashSet<RevisionId> = self.leaves().into_iter().map(|n| n.rev_id.clone()).collect();
        let doomed: Vec<RevisionId> = self
            .nodes
            .keys()
            .filter(|id| id.generation() <= cutoff && !leaves.contains(*id))
            .cloned()
            .collect();
        for id in &doomed {
            self.mark_pruned(id.clone());
        }
        doomed
    }

    /// Whether [`Self::prune_to_depth`] would remove anything.
    pub fn needs_pruning(&self, depth: u32) -> bool {
        let Some(winner_generation) = self.winner().map(|w| w.rev_id.generation()) else {
            return false;
        };
        let cutoff = winner_generation.saturating_sub(depth);
        if cutoff == 0 {
            return false;
        }
        let parents = self.parent_ids();
        self.nodes
            .keys()
            .any(|id| id.generation() <= cutoff && parents.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> RevisionId {
        RevisionId::parse(s).unwrap()
    }

    fn node(id: &str, parent: Option<&str>, deleted: bool) -> RevNode {
        RevNode {
            rev_id: rid(id),
            parent: parent.map(rid),
            deleted,
            sequence: Some(1),
            body: Some(Arc::new(Map::new())),
            attachments: Arc::new(BTreeMap::new()),
        }
    }

    fn chain(len: u32) -> RevisionTree {
        let mut tree = RevisionTree::new();
        let mut parent: Option<String> = None;
        for generation in 1..=len {
            let id = format!("{}-{:04x}", generation, generation);
            tree.insert(node(&id, parent.as_deref(), false));
            parent = Some(id);
        }
        tree
    }

    #[test]
    fn test_winner_highest_generation() {
        let mut tree = RevisionTree::new();
        tree.insert(node("1-aa", None, false));
        tree.insert(node("2-bb", Some("1-aa"), false));
        tree.insert(node("2-cc", Some("1-aa"), false));
        tree.insert(node("3-00", Some("2-bb"), false));
        assert_eq!(tree.winner().unwrap().rev_id, rid("3-00"));
        assert!(!tree.is_in_conflict());
        assert_eq!(tree.conflicting_leaves().len(), 2);
    }

    #[test]
    fn test_winner_tie_break_greatest_digest() {
        let mut tree = RevisionTree::new();
        tree.insert(node("1-1111", None, false));
        tree.insert(node("1-ffff", None, false));
        assert_eq!(tree.winner().unwrap().rev_id, rid("1-ffff"));
        assert!(tree.is_in_conflict());
        let leaves: Vec<_> = tree.conflicting_leaves().iter().map(|n| n.rev_id.clone()).collect();
        assert_eq!(leaves, vec![rid("1-ffff"), rid("1-1111")]);
    }

    #[test]
    fn test_live_leaf_beats_deleted_leaf() {
        let mut tree = RevisionTree::new();
        tree.insert(node("1-1111", None, false));
        tree.insert(node("1-ffff", None, true));
        assert_eq!(tree.winner().unwrap().rev_id, rid("1-1111"));
        assert!(!tree.is_in_conflict());
        assert_eq!(tree.conflicting_leaves().len(), 1);
        assert_eq!(tree.leaves().len(), 2);
    }

    #[test]
    fn test_all_deleted_reports_tombstone() {
        let mut tree = RevisionTree::new();
        tree.insert(node("1-aa", None, false));
        tree.insert(node("2-bb", Some("1-aa"), true));
        let winner = tree.winner().unwrap();
        assert!(winner.deleted);
        assert_eq!(tree.conflicting_leaves().len(), 1);
    }

    #[test]
    fn test_insert_known_is_noop() {
        let mut tree = chain(3);
        assert!(!tree.insert(node("2-0002", Some("1-0001"), false)));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_history_walks_parents() {
        let tree = chain(4);
        let history: Vec<u32> = tree
            .history(&rid("4-0004"))
            .iter()
            .map(|n| n.rev_id.generation())
            .collect();
        assert_eq!(history, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_prune_to_depth() {
        let mut tree = chain(10);
        assert!(tree.needs_pruning(2));
        let removed = tree.prune_to_depth(2);
        assert_eq!(removed.len(), 8);
        assert_eq!(tree.history(&rid("10-000a")).len(), 2);
        assert!(tree.knows(&rid("1-0001")));
        assert!(tree.is_pruned(&rid("1-0001")));
        assert!(!tree.contains(&rid("1-0001")));
        assert!(!tree.insert(node("1-0001", None, false)));
        assert!(!tree.needs_pruning(2));
    }

    #[test]
    fn test_prune_keeps_conflicting_leaves() {
        let mut tree = chain(6);
        tree.insert(node("2-zz", Some("1-0001"), false));
        tree.prune_to_depth(2);
        assert!(tree.contains(&rid("2-zz")));
        assert!(tree.is_leaf(&rid("2-zz")));
        assert_eq!(tree.winner().unwrap().rev_id, rid("6-0006"));
    }

    #[test]
    fn test_old_leaves_alone_do_not_need_pruning() {
        let mut tree = chain(6);
        tree.insert(node("2-zz", Some("1-0001"), false));
        tree.prune_to_depth(2);
        // 2-zz stays below the cutoff but is a leaf
        assert!(!tree.needs_pruning(2));

        let mut long = chain(500);
        assert!(long.needs_pruning(100));
        assert_eq!(long.prune_to_depth(100).len(), 400);
        assert!(!long.needs_pruning(100));
    }

    #[test]
    fn test_prune_unbounded_depth_is_noop() {
        let mut tree = chain(5);
        assert!(tree.prune_to_depth(u32::MAX).is_empty());
        assert_eq!(tree.len(), 5);
    }
}
