//! Document store: revision trees, sequence assignment and inserts
//!
//! Committed state is a map of shared, immutable trees. A write scope keeps a
//! copy-on-write overlay of the trees it touched plus the storage batch and
//! the change events it produced; the overlay replaces the committed trees
//! when the outermost scope commits and is dropped on rollback.

use crate::attachments::{AttachmentInfo, AttachmentStore};
use crate::canonical::revision_digest;
use crate::changes::{ChangeEvent, ChangeSource};
use crate::error::{Error, Result};
use crate::rev_tree::{RevNode, RevisionTree};
use crate::revision::{Revision, RevisionId};
use crate::storage::{StoredRevision, StoredState, WriteBatch};
use crate::value::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Top-level keys carried by document helpers and never stored in a body
pub const RESERVED_KEYS: [&str; 3] = ["_id", "_rev", "_deleted"];

/// Committed documents
#[derive(Debug, Default, Clone)]
pub(crate) struct DocumentStore {
    docs: HashMap<String, Arc<RevisionTree>>,
    last_sequence: u64,
    max_rev_tree_depth: u32,
}

impl DocumentStore {
    pub fn new(max_rev_tree_depth: u32) -> Self {
        Self {
            docs: HashMap::new(),
            last_sequence: 0,
            max_rev_tree_depth,
        }
    }

    /// Rebuild trees from persisted rows.
    pub fn from_stored(state: StoredState, default_depth: u32) -> Self {
        let mut trees: HashMap<String, RevisionTree> = HashMap::new();
        for row in state.revisions {
            trees.entry(row.doc_id).or_default().insert(row.node);
        }
        for (doc_id, rev_id) in state.pruned {
            trees.entry(doc_id).or_default().mark_pruned(rev_id);
        }
        Self {
            docs: trees
                .into_iter()
                .filter(|(_, tree)| !tree.is_empty())
                .map(|(doc_id, tree)| (doc_id, Arc::new(tree)))
                .collect(),
            last_sequence: state.last_sequence,
            max_rev_tree_depth: state.max_rev_tree_depth.unwrap_or(default_depth),
        }
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn max_rev_tree_depth(&self) -> u32 {
        self.max_rev_tree_depth
    }

    pub fn trees(&self) -> impl Iterator<Item = &RevisionTree> {
        self.docs.values().map(|tree| tree.as_ref())
    }

    /// Install a committed scope's changes.
    pub fn apply(&mut self, scope: WriteScope) {
        let pending = scope.pending;
        self.docs.extend(pending.overlay);
        self.last_sequence = pending.last_sequence;
        self.max_rev_tree_depth = pending.max_rev_tree_depth;
    }
}

/// Uncommitted document state of a write scope
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    overlay: HashMap<String, Arc<RevisionTree>>,
    last_sequence: u64,
    max_rev_tree_depth: u32,
}

/// Pending state of the open (possibly nested) write transaction
#[derive(Debug)]
pub(crate) struct WriteScope {
    pub depth: u32,
    /// Set when a nested scope ended unsuccessfully
    pub failed: bool,
    pending: Pending,
    batch: WriteBatch,
    events: Vec<ChangeEvent>,
    gc_requested: bool,
}

impl WriteScope {
    pub fn new(committed: &DocumentStore) -> Self {
        Self {
            depth: 1,
            failed: false,
            pending: Pending {
                overlay: HashMap::new(),
                last_sequence: committed.last_sequence,
                max_rev_tree_depth: committed.max_rev_tree_depth,
            },
            batch: WriteBatch::default(),
            events: Vec::new(),
            gc_requested: false,
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn gc_requested(&self) -> bool {
        self.gc_requested
    }

    pub fn pending(&self) -> &Pending {
        &self.pending
    }

    /// Split off the storage batch and events, leaving the scope ready to
    /// be applied.
    pub fn take_outputs(&mut self, committed_sequence: u64) -> (WriteBatch, Vec<ChangeEvent>) {
        let mut batch = std::mem::take(&mut self.batch);
        if self.pending.last_sequence != committed_sequence {
            batch.last_sequence = Some(self.pending.last_sequence);
        }
        (batch, std::mem::take(&mut self.events))
    }
}

/// Read access that sees the caller's own uncommitted writes
#[derive(Clone, Copy)]
pub(crate) struct ReadView<'a> {
    committed: &'a DocumentStore,
    scope: Option<&'a Pending>,
}

impl<'a> ReadView<'a> {
    pub fn new(committed: &'a DocumentStore, scope: Option<&'a Pending>) -> Self {
        Self { committed, scope }
    }

    pub fn tree(self, doc_id: &str) -> Option<&'a RevisionTree> {
        self.scope
            .and_then(|s| s.overlay.get(doc_id))
            .or_else(|| self.committed.docs.get(doc_id))
            .map(|tree| tree.as_ref())
    }

    pub fn docs(self) -> impl Iterator<Item = (&'a str, &'a RevisionTree)> {
        let overlay = self.scope.map(|s| &s.overlay);
        let pending = overlay
            .into_iter()
            .flat_map(|o| o.iter().map(|(id, tree)| (id.as_str(), tree.as_ref())));
        let committed = self
            .committed
            .docs
            .iter()
            .filter(move |(id, _)| overlay.is_none_or(|o| !o.contains_key(id.as_str())))
            .map(|(id, tree)| (id.as_str(), tree.as_ref()));
        pending.chain(committed)
    }

    pub fn last_sequence(self) -> u64 {
        self.scope.map_or(self.committed.last_sequence, |s| s.last_sequence)
    }

    pub fn max_rev_tree_depth(self) -> u32 {
        self.scope
            .map_or(self.committed.max_rev_tree_depth, |s| s.max_rev_tree_depth)
    }
}

/// A new revision requested through `put_properties`
#[derive(Debug, Clone)]
pub(crate) struct NewRevision {
    pub doc_id: String,
    pub parent: Option<RevisionId>,
    pub properties: Map,
    pub deleted: bool,
    /// `None` keeps the parent's attachments
    pub attachments: Option<BTreeMap<String, AttachmentInfo>>,
}

/// Strip reserved keys and check the rest of a body.
pub(crate) fn clean_properties(doc_id: &str, mut properties: Map) -> Result<Map> {
    if let Some(id) = properties.remove("_id") {
        if id.as_str() != Some(doc_id) {
            return Err(Error::validation(format!(
                "_id {:?} does not match document '{}'",
                id, doc_id
            )));
        }
    }
    for key in RESERVED_KEYS {
        properties.remove(key);
    }
    if let Some(key) = properties.keys().find(|k| k.starts_with('_')) {
        return Err(Error::validation(format!("reserved property name '{}'", key)));
    }
    properties.values().try_for_each(Value::validate)?;
    Ok(properties)
}

fn check_doc_id(doc_id: &str) -> Result<()> {
    if doc_id.is_empty() {
        return Err(Error::validation("document id must not be empty"));
    }
    Ok(())
}

/// Mutating access for the thread that owns the write scope
pub(crate) struct Writer<'a> {
    committed: &'a DocumentStore,
    scope: &'a mut WriteScope,
    blobs: &'a AttachmentStore,
}

impl<'a> Writer<'a> {
    pub fn new(committed: &'a DocumentStore, scope: &'a mut WriteScope, blobs: &'a AttachmentStore) -> Self {
        Self {
            committed,
            scope,
            blobs,
        }
    }

    pub fn view(&self) -> ReadView<'_> {
        ReadView::new(self.committed, Some(&self.scope.pending))
    }

    fn tree(&self, doc_id: &str) -> Option<&RevisionTree> {
        self.scope
            .pending
            .overlay
            .get(doc_id)
            .or_else(|| self.committed.docs.get(doc_id))
            .map(|tree| tree.as_ref())
    }

    fn tree_mut(&mut self, doc_id: &str) -> &mut RevisionTree {
        let committed = self.committed;
        let entry = self
            .scope
            .pending
            .overlay
            .entry(doc_id.to_string())
            .or_insert_with(|| committed.docs.get(doc_id).cloned().unwrap_or_default());
        Arc::make_mut(entry)
    }

    fn next_sequence(&mut self) -> u64 {
        self.scope.pending.last_sequence += 1;
        self.scope.pending.last_sequence
    }

    fn check_attachments(
        &self,
        doc_id: &str,
        generation: u32,
        attachments: &mut BTreeMap<String, AttachmentInfo>,
    ) -> Result<()> {
        for info in attachments.values_mut() {
            if !self.blobs.contains(&info.digest)? {
                return Err(Error::AttachmentMissing {
                    doc_id: doc_id.to_string(),
                    digest: info.digest.to_string(),
                });
            }
            if info.revpos == 0 {
                info.revpos = generation;
            }
        }
        Ok(())
    }

    fn record(&mut self, doc_id: &str, node: RevNode, source: Option<ChangeSource>) {
        let tree = self.tree_mut(doc_id);
        let sequence = node.sequence;
        let rev_id = node.rev_id.clone();
        tree.insert(node.clone());
        let winning_rev_id = tree.winner().map(|w| w.rev_id.clone()).unwrap_or_else(|| rev_id.clone());
        let in_conflict = tree.is_in_conflict();
        self.scope.batch.revisions.push(StoredRevision {
            doc_id: doc_id.to_string(),
            node,
        });
        if let (Some(sequence), Some(source)) = (sequence, source) {
            tracing::debug!("Added revision {} of '{}' at sequence {}", rev_id, doc_id, sequence);
            self.scope.events.push(ChangeEvent {
                doc_id: doc_id.to_string(),
                rev_id,
                sequence,
                source,
                winning_rev_id,
                in_conflict,
            });
        }
    }

    /// Add a child of the current winner.
    pub fn put_revision(&mut self, request: NewRevision) -> Result<Revision> {
        let NewRevision {
            doc_id,
            parent,
            properties,
            deleted,
            attachments,
        } = request;
        check_doc_id(&doc_id)?;
        let properties = clean_properties(&doc_id, properties)?;

        let winner = self.tree(&doc_id).and_then(|tree| tree.winner()).cloned();
        let conflict = |current: Option<&RevNode>| Error::Conflict {
            doc_id: doc_id.clone(),
            parent: parent.as_ref().map(RevisionId::to_string),
            current: current.map(|w| w.rev_id.to_string()),
        };
        let parent_node = match (&parent, &winner) {
            (None, None) => None,
            (None, Some(w)) if w.deleted => Some(w.clone()),
            (Some(p), Some(w)) if *p == w.rev_id => Some(w.clone()),
            (_, current) => return Err(conflict(current.as_ref())),
        };
        if deleted && parent_node.as_ref().is_none_or(|p| p.deleted) {
            return Err(Error::not_found(format!("document '{}' does not exist", doc_id)));
        }

        let generation = parent_node.as_ref().map_or(1, |p| p.rev_id.generation() + 1);
        let mut attachments = if deleted {
            BTreeMap::new()
        } else {
            match attachments {
                Some(explicit) => explicit,
                None => parent_node
                    .as_ref()
                    .filter(|p| !p.deleted)
                    .map(|p| (*p.attachments).clone())
                    .unwrap_or_default(),
            }
        };
        self.check_attachments(&doc_id, generation, &mut attachments)?;

        let parent_id = parent_node.map(|p| p.rev_id);
        let digest = revision_digest(parent_id.as_ref(), deleted, &properties, &attachments)?;
        let rev_id = RevisionId::new(generation, digest)?;
        if self.tree(&doc_id).is_some_and(|tree| tree.knows(&rev_id)) {
            return Err(Error::Conflict {
                doc_id,
                parent: parent_id.map(|p| p.to_string()),
                current: Some(rev_id.to_string()),
            });
        }

        let node = RevNode {
            rev_id,
            parent: parent_id,
            deleted,
            sequence: Some(self.next_sequence()),
            body: Some(Arc::new(properties)),
            attachments: Arc::new(attachments),
        };
        let revision = node.to_revision(&doc_id);
        self.record(&doc_id, node, Some(ChangeSource::Local));
        Ok(revision)
    }

    /// Merge a revision and its ancestry without the winner check.
    ///
    /// Returns `None` when the revision is already known.
    pub fn force_insert(
        &mut self,
        revision: &Revision,
        history: &[RevisionId],
        source: ChangeSource,
    ) -> Result<Option<Revision>> {
        let doc_id = revision.doc_id.as_str();
        check_doc_id(doc_id)?;
        let own_history = [revision.rev_id.clone()];
        let history = if history.is_empty() { &own_history[..] } else { history };
        if history[0] != revision.rev_id {
            return Err(Error::validation(format!(
                "history of '{}' starts at {} instead of {}",
                doc_id, history[0], revision.rev_id
            )));
        }
        let head_generation = revision.rev_id.generation();
        for (offset, id) in history.iter().enumerate() {
            if u64::from(id.generation()) + offset as u64 != u64::from(head_generation) {
                return Err(Error::validation(format!(
                    "history of '{}' skips a generation at {}",
                    doc_id, id
                )));
            }
        }

        if self.tree(doc_id).is_some_and(|tree| tree.knows(&revision.rev_id)) {
            return Ok(None);
        }

        let body = match &revision.body {
            Some(body) => clean_properties(doc_id, (**body).clone())?,
            None => Map::new(),
        };
        let anchor = self
            .tree(doc_id)
            .and_then(|tree| history.iter().position(|id| tree.knows(id)));
        let missing = match anchor {
            Some(index) => index,
            None => {
                if history[history.len() - 1].generation() != 1 {
                    return Err(Error::validation(format!(
                        "history of {} in '{}' does not reach a known revision or the root",
                        revision.rev_id, doc_id
                    )));
                }
                history.len()
            }
        };

        let mut attachments = if revision.deleted {
            BTreeMap::new()
        } else {
            (*revision.attachments).clone()
        };
        self.check_attachments(doc_id, head_generation, &mut attachments)?;

        for index in (1..missing).rev() {
            let stub = RevNode::stub(history[index].clone(), history.get(index + 1).cloned());
            self.record(doc_id, stub, None);
        }
        let head = RevNode {
            rev_id: revision.rev_id.clone(),
            parent: history.get(1).cloned(),
            deleted: revision.deleted,
            sequence: Some(self.next_sequence()),
            body: Some(Arc::new(body)),
            attachments: Arc::new(attachments),
        };
        let inserted = head.to_revision(doc_id);
        self.record(doc_id, head, Some(source));
        Ok(Some(inserted))
    }

    /// Prune every tree to the configured depth.
    ///
    /// Returns `(documents pruned, revisions pruned)` and asks the commit to
    /// collect unreferenced attachments.
    pub fn prune_all(&mut self) -> (usize, usize) {
        let depth = self.scope.pending.max_rev_tree_depth;
        let targets: Vec<String> = self
            .view()
            .docs()
            .filter(|(_, tree)| tree.needs_pruning(depth))
            .map(|(id, _)| id.to_string())
            .collect();
        let mut revisions = 0;
        for doc_id in &targets {
            let removed = self.tree_mut(doc_id).prune_to_depth(depth);
            revisions += removed.len();
            self.scope
                .batch
                .pruned
                .extend(removed.into_iter().map(|rev_id| (doc_id.clone(), rev_id)));
        }
        self.scope.gc_requested = true;
        (targets.len(), revisions)
    }

    pub fn set_max_rev_tree_depth(&mut self, depth: u32) {
        self.scope.pending.max_rev_tree_depth = depth;
        self.scope.batch.max_rev_tree_depth = Some(depth);
    }
}
