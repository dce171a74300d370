//! Database handle
//!
//! [`Database`] is a cheap, cloneable handle over one open database. Reads
//! observe the last committed state, except on the thread that holds an open
//! transaction, which also sees its own pending writes. A read works on a
//! snapshot and holds no lock while caller code (filters, listeners) runs.

use crate::attachments::{Attachment, AttachmentStore, BlobCipher, BlobKey, BlobStore, DiskBlobStore, MemoryBlobStore};
use crate::changes::{
    collect_changes, ChangeListener, ChangeNotifier, ChangeSource, ChangeStream, ChangesFilter, ChangesOptions,
    ListenerToken,
};
use crate::compactor::{self, CompactionStats};
use crate::config::{database_name_from_path, DatabaseConfig};
use crate::document::{Document, DocumentState};
use crate::error::{Error, Result};
use crate::revision::{Revision, RevisionId};
use crate::sqlite_store::SqliteRevisionStore;
use crate::storage::{Identity, MemoryRevisionStore, RevisionStore, StorageError, WriteBatch};
use crate::store::{DocumentStore, NewRevision, Pending, ReadView, WriteScope, Writer};
use crate::transaction::{CommitReport, ScopeGuard};
use crate::value::Map;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// SQLite file holding revisions, inside the database directory
pub const REVISIONS_FILE: &str = "revisions.sqlite";
/// Attachment blob directory, inside the database directory
pub const ATTACHMENTS_DIR: &str = "attachments";

pub(crate) struct Shared {
    pub config: DatabaseConfig,
    pub name: String,
    pub uuid: String,
    pub committed: RwLock<Arc<DocumentStore>>,
    pub writer: ReentrantMutex<RefCell<Option<WriteScope>>>,
    pub notifier: Arc<ChangeNotifier>,
    pub revisions: Mutex<Option<Box<dyn RevisionStore>>>,
    pub blobs: AttachmentStore,
    pub documents: Mutex<LruCache<String, Arc<DocumentState>>>,
    pub closed: AtomicBool,
}

/// An open database
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.shared.name)
            .field("path", &self.shared.config.path)
            .finish()
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Database {
    /// Open (or create) a database as configured.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        Self::open_inner(config, None)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(DatabaseConfig::in_memory())
    }

    /// Open with attachment encryption.
    pub fn open_with_cipher(config: DatabaseConfig, cipher: Arc<dyn BlobCipher>) -> Result<Self> {
        Self::open_inner(config, Some(cipher))
    }

    fn open_inner(config: DatabaseConfig, cipher: Option<Arc<dyn BlobCipher>>) -> Result<Self> {
        let (revisions, blobs): (Box<dyn RevisionStore>, Box<dyn BlobStore>) = match &config.path {
            None => (
                Box::new(MemoryRevisionStore::new()),
                Box::new(MemoryBlobStore::new()),
            ),
            Some(dir) => {
                fs::create_dir_all(dir).map_err(StorageError::from)?;
                (
                    Box::new(SqliteRevisionStore::open(dir.join(REVISIONS_FILE), config.compress_threshold)?),
                    Box::new(DiskBlobStore::open(dir.join(ATTACHMENTS_DIR))?),
                )
            }
        };
        Self::with_backends(config, revisions, blobs, cipher)
    }

    /// Open over explicit storage backends.
    pub fn with_backends(
        config: DatabaseConfig,
        mut revisions: Box<dyn RevisionStore>,
        blobs: Box<dyn BlobStore>,
        cipher: Option<Arc<dyn BlobCipher>>,
    ) -> Result<Self> {
        let state = revisions.load()?;
        let uuid = match &state.uuid {
            Some(uuid) => uuid.clone(),
            None => {
                let identity = Identity {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                };
                revisions.commit(&WriteBatch {
                    identity: Some(identity.clone()),
                    ..WriteBatch::default()
                })?;
                identity.uuid
            }
        };
        let committed = DocumentStore::from_stored(state, config.max_rev_tree_depth);
        let name = config
            .path
            .as_deref()
            .map(database_name_from_path)
            .unwrap_or_else(|| "memory".to_string());
        let capacity = NonZeroUsize::new(config.document_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        info!(
            "Opened database '{}' ({} documents, last sequence {})",
            name,
            committed.trees().count(),
            committed.last_sequence()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                name,
                uuid,
                committed: RwLock::new(Arc::new(committed)),
                writer: ReentrantMutex::new(RefCell::new(None)),
                notifier: Arc::new(ChangeNotifier::new()),
                revisions: Mutex::new(Some(revisions)),
                blobs: AttachmentStore::new(blobs, cipher),
                documents: Mutex::new(LruCache::new(capacity)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.shared.config.path.as_deref()
    }

    /// Identifier generated when the database was created
    pub fn uuid(&self) -> &str {
        &self.shared.uuid
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(ReadView<'_>) -> T) -> Result<T> {
        self.ensure_open()?;
        let committed: Arc<DocumentStore> = self.shared.committed.read_recursive().clone();
        let pending = self.pending_snapshot();
        Ok(f(ReadView::new(&committed, pending.as_ref())))
    }

    /// Copy of the current thread's uncommitted state. Other threads'
    /// transactions are never visible and never waited on.
    fn pending_snapshot(&self) -> Option<Pending> {
        if !self.shared.writer.is_owned_by_current_thread() {
            return None;
        }
        let guard = self.shared.writer.lock();
        let slot = guard.try_borrow().ok()?;
        slot.as_ref().map(|scope| scope.pending().clone())
    }

    fn write_scoped<T>(&self, op: impl FnOnce(&mut Writer<'_>) -> Result<T>) -> Result<(T, CommitReport)> {
        let scope = ScopeGuard::begin(&self.shared)?;
        let result = scope.with_writer(op);
        let report = scope.end(true);
        let value = result?;
        Ok((value, report?))
    }

    fn write<T>(&self, op: impl FnOnce(&mut Writer<'_>) -> Result<T>) -> Result<T> {
        self.write_scoped(op).map(|(value, _)| value)
    }

    // ==================== Documents ====================

    fn document_handle(&self, doc_id: &str) -> Document {
        let mut cache = self.shared.documents.lock();
        let state = match cache.get(doc_id) {
            Some(state) => Arc::clone(state),
            None => {
                let state = Arc::new(DocumentState::new(doc_id));
                cache.put(doc_id.to_string(), Arc::clone(&state));
                state
            }
        };
        Document::new(self.clone(), state)
    }

    /// New document handle with a generated id; nothing is stored until a
    /// revision is saved.
    pub fn create_document(&self) -> Result<Document> {
        self.ensure_open()?;
        Ok(self.document_handle(&uuid::Uuid::new_v4().to_string()))
    }

    /// Handle for a document id, whether or not it exists yet
    pub fn document(&self, doc_id: &str) -> Result<Document> {
        self.ensure_open()?;
        if doc_id.is_empty() {
            return Err(Error::validation("document id must not be empty"));
        }
        Ok(self.document_handle(doc_id))
    }

    /// Handle for an existing document
    pub fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let exists = self.read(|view| view.tree(doc_id).is_some_and(|tree| !tree.is_empty()))?;
        Ok(exists.then(|| self.document_handle(doc_id)))
    }

    /// Cached handle, without touching storage or the LRU order
    pub fn cached_document(&self, doc_id: &str) -> Option<Document> {
        let state = self.shared.documents.lock().peek(doc_id).cloned()?;
        Some(Document::new(self.clone(), state))
    }

    /// Documents whose current revision is not deleted
    pub fn document_count(&self) -> Result<usize> {
        self.read(|view| {
            view.docs()
                .filter(|(_, tree)| tree.winner().is_some_and(|w| !w.deleted))
                .count()
        })
    }

    pub fn last_sequence(&self) -> Result<u64> {
        self.read(|view| view.last_sequence())
    }

    /// Save a new revision as a child of `parent`, which must be the current
    /// revision (or `None` for a new or deleted document).
    pub fn put_properties(
        &self,
        doc_id: &str,
        parent: Option<&RevisionId>,
        properties: Map,
        deleted: bool,
    ) -> Result<Revision> {
        self.write(|w| {
            w.put_revision(NewRevision {
                doc_id: doc_id.to_string(),
                parent: parent.cloned(),
                properties,
                deleted,
                attachments: None,
            })
        })
    }

    pub(crate) fn put_with_attachments(
        &self,
        doc_id: &str,
        parent: Option<&RevisionId>,
        properties: Map,
        attachments: BTreeMap<String, crate::attachments::AttachmentInfo>,
    ) -> Result<Revision> {
        self.write(|w| {
            w.put_revision(NewRevision {
                doc_id: doc_id.to_string(),
                parent: parent.cloned(),
                properties,
                deleted: false,
                attachments: Some(attachments),
            })
        })
    }

    /// Merge a revision with its history, skipping the current-revision
    /// check. `history` runs from `revision` back toward the root; `source`
    /// names the replica it came from. Returns false if the revision was
    /// already known.
    pub fn force_insert(&self, revision: &Revision, history: &[RevisionId], source: Option<&str>) -> Result<bool> {
        let source = match source {
            Some(name) => ChangeSource::External(name.to_string()),
            None => ChangeSource::Local,
        };
        let inserted = self.write(|w| w.force_insert(revision, history, source))?;
        Ok(inserted.is_some())
    }

    // ==================== Queries ====================

    /// Revisions with a sequence above `since`, in sequence order.
    pub fn changes_since(
        &self,
        since: u64,
        options: &ChangesOptions,
        filter: Option<ChangesFilter<'_>>,
        params: Option<&Map>,
    ) -> Result<Vec<Revision>> {
        self.read(|view| collect_changes(view.docs(), since, options, filter, params))
    }

    pub fn current_revision(&self, doc_id: &str) -> Result<Option<Revision>> {
        self.read(|view| {
            view.tree(doc_id)
                .and_then(|tree| tree.winner())
                .map(|node| node.to_revision(doc_id))
        })
    }

    pub fn get_revision(&self, doc_id: &str, rev_id: &RevisionId) -> Result<Revision> {
        self.read(|view| {
            view.tree(doc_id)
                .and_then(|tree| tree.get(rev_id))
                .map(|node| node.to_revision(doc_id))
        })?
        .ok_or_else(|| Error::not_found(format!("revision {} of '{}'", rev_id, doc_id)))
    }

    /// Retained ancestry of a revision, newest first
    pub fn revision_history(&self, doc_id: &str, rev_id: &RevisionId) -> Result<Vec<Revision>> {
        let history = self.read(|view| {
            view.tree(doc_id)
                .map(|tree| {
                    tree.history(rev_id)
                        .into_iter()
                        .map(|node| node.to_revision(doc_id))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        })?;
        if history.is_empty() {
            return Err(Error::not_found(format!("revision {} of '{}'", rev_id, doc_id)));
        }
        Ok(history)
    }

    /// Live leaves, current revision first
    pub fn conflicting_revisions(&self, doc_id: &str) -> Result<Vec<Revision>> {
        self.tree_query(doc_id, |tree| tree.conflicting_leaves())
    }

    /// Every leaf, deleted ones included, current revision first
    pub fn leaf_revisions(&self, doc_id: &str) -> Result<Vec<Revision>> {
        self.tree_query(doc_id, |tree| {
            let mut leaves = tree.leaves();
            let winner = tree.winner().map(|w| w.rev_id.clone());
            leaves.sort_by(|a, b| {
                (Some(&b.rev_id) == winner.as_ref())
                    .cmp(&(Some(&a.rev_id) == winner.as_ref()))
                    .then_with(|| b.rev_id.cmp(&a.rev_id))
            });
            leaves
        })
    }

    /// Every retained revision, stubs included, oldest first
    pub fn all_revisions(&self, doc_id: &str) -> Result<Vec<Revision>> {
        self.tree_query(doc_id, |tree| {
            let mut nodes: Vec<_> = tree.nodes().collect();
            nodes.sort_by(|a, b| a.rev_id.cmp(&b.rev_id));
            nodes
        })
    }

    fn tree_query(
        &self,
        doc_id: &str,
        select: impl FnOnce(&crate::rev_tree::RevisionTree) -> Vec<&crate::rev_tree::RevNode>,
    ) -> Result<Vec<Revision>> {
        self.read(|view| {
            view.tree(doc_id)
                .map(|tree| {
                    select(tree)
                        .into_iter()
                        .map(|node| node.to_revision(doc_id))
                        .collect::<Vec<_>>()
                })
        })?
        .ok_or_else(|| Error::not_found(format!("document '{}'", doc_id)))
    }

    // ==================== Maintenance ====================

    pub fn max_rev_tree_depth(&self) -> Result<u32> {
        self.read(|view| view.max_rev_tree_depth())
    }

    /// Set how many revisions compaction keeps behind each winner.
    pub fn set_max_rev_tree_depth(&self, depth: u32) -> Result<()> {
        if depth == 0 {
            return Err(Error::validation("max revision tree depth must be at least 1"));
        }
        self.write(|w| {
            w.set_max_rev_tree_depth(depth);
            Ok(())
        })
    }

    /// Prune revision trees and delete unreferenced attachments.
    pub fn compact(&self) -> Result<CompactionStats> {
        let (mut stats, report) = self.write_scoped(|w| Ok(compactor::prune(w)))?;
        stats.attachments_removed = report.attachments_removed;
        info!(
            "Compacted '{}': {} revisions pruned from {} documents, {} attachments removed",
            self.shared.name, stats.revisions_pruned, stats.documents_pruned, stats.attachments_removed
        );
        Ok(stats)
    }

    // ==================== Transactions ====================

    /// Run `task` in a transaction. Returning false rolls back every change
    /// made inside it, including those of nested transactions. Returns
    /// whether the task succeeded and, for the outermost transaction, was
    /// committed.
    pub fn run_in_transaction(&self, task: impl FnOnce() -> bool) -> Result<bool> {
        let scope = ScopeGuard::begin(&self.shared)?;
        let ok = task();
        let report = scope.end(ok)?;
        Ok(ok && report.committed)
    }

    /// Like [`Self::run_in_transaction`], with `Err` as the rollback signal.
    pub fn in_transaction<T>(&self, task: impl FnOnce() -> Result<T>) -> Result<T> {
        let scope = ScopeGuard::begin(&self.shared)?;
        match task() {
            Ok(value) => {
                scope.end(true)?;
                Ok(value)
            }
            Err(e) => {
                scope.end(false)?;
                Err(e)
            }
        }
    }

    /// Whether the current thread has an open transaction
    pub fn in_transaction_scope(&self) -> bool {
        if !self.shared.writer.is_owned_by_current_thread() {
            return false;
        }
        let guard = self.shared.writer.lock();
        let in_scope = guard.try_borrow().map_or(true, |slot| slot.is_some());
        in_scope
    }

    // ==================== Change listeners ====================

    pub fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerToken {
        self.shared.notifier.add(listener)
    }

    pub fn remove_change_listener(&self, token: ListenerToken) -> bool {
        self.shared.notifier.remove(token)
    }

    /// Unregister a listener by the `Arc` it was added with.
    pub fn remove_change_listener_instance(&self, listener: &Arc<dyn ChangeListener>) -> bool {
        self.shared.notifier.remove_listener(listener)
    }

    /// Async stream of committed change batches
    pub fn change_stream(&self) -> ChangeStream {
        ChangeStream::register(&self.shared.notifier)
    }

    // ==================== Attachments ====================

    /// Store attachment content and return its key, for use with
    /// [`crate::Revision::with_attachments`] before a `force_insert`.
    ///
    /// Until a revision references it, the blob may be collected by any
    /// compaction that commits. Install and insert within one
    /// [`Self::in_transaction`] to rule that out.
    pub fn install_attachment(&self, content: &[u8]) -> Result<BlobKey> {
        self.ensure_open()?;
        Ok(self.shared.blobs.store(content)?)
    }

    pub(crate) fn read_blob(&self, key: &BlobKey) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        Ok(self.shared.blobs.read(key)?)
    }

    /// Load a named attachment of a saved revision.
    pub fn get_attachment(&self, revision: &Revision, name: &str) -> Result<Attachment> {
        let info = revision.attachment_info(name).ok_or_else(|| {
            Error::not_found(format!("attachment '{}' of {} in '{}'", name, revision.rev_id(), revision.doc_id()))
        })?;
        let content = self
            .read_blob(&info.digest)?
            .ok_or_else(|| Error::AttachmentMissing {
                doc_id: revision.doc_id().to_string(),
                digest: info.digest.to_string(),
            })?;
        Ok(Attachment {
            info: info.clone(),
            content,
            doc_id: Some(revision.doc_id().to_string()),
            rev_id: Some(revision.rev_id().clone()),
            path: self.shared.blobs.content_path(&info.digest),
        })
    }

    /// Number of stored attachment blobs
    pub fn attachment_count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.shared.blobs.keys()?.len())
    }

    // ==================== Lifecycle ====================

    /// Close the database. Every later operation on any clone of this
    /// handle fails with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if self.in_transaction_scope() {
            return Err(Error::validation("cannot close a database inside a transaction"));
        }
        let timeout = self.shared.config.write_timeout();
        let _guard = self.shared.writer.try_lock_for(timeout).ok_or(Error::Busy(timeout))?;
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let store = self.shared.revisions.lock().take();
        self.shared.documents.lock().clear();
        self.shared.notifier.clear();
        *self.shared.committed.write() = Arc::new(DocumentStore::new(self.shared.config.max_rev_tree_depth));
        if let Some(mut store) = store {
            store.close()?;
        }
        info!("Closed database '{}'", self.shared.name);
        Ok(())
    }
}
