//! Change events, listener registry and the change feed
//!
//! Listeners are held per database instance. Delivery is synchronous on the
//! committing thread: one [`ChangeBatch`] per outermost commit, or per
//! mutation when no transaction is open.

use crate::rev_tree::RevisionTree;
use crate::revision::{Revision, RevisionId};
use crate::value::Map;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where a change came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeSource {
    Local,
    /// Merged from another replica, identified by its source string
    External(String),
}

impl ChangeSource {
    pub fn is_external(&self) -> bool {
        matches!(self, ChangeSource::External(_))
    }
}

/// One committed revision
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub doc_id: String,
    pub rev_id: RevisionId,
    pub sequence: u64,
    pub source: ChangeSource,
    /// Winner of the document right after this revision was added
    pub winning_rev_id: RevisionId,
    pub in_conflict: bool,
}

/// Events delivered together, in sequence order
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub events: Vec<ChangeEvent>,
    /// Every event came from an external source
    pub external: bool,
}

impl ChangeBatch {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        let external = !events.is_empty() && events.iter().all(|e| e.source.is_external());
        Self { events, external }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_external(&self) -> bool {
        self.external
    }
}

/// Receives committed change batches
pub trait ChangeListener: Send + Sync {
    fn changed(&self, batch: &ChangeBatch);
}

impl<F> ChangeListener for F
where
    F: Fn(&ChangeBatch) + Send + Sync,
{
    fn changed(&self, batch: &ChangeBatch) {
        self(batch)
    }
}

/// Handle identifying one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

type Registration = (ListenerToken, Arc<dyn ChangeListener>);

/// Per-database listener registry
#[derive(Default)]
pub struct ChangeNotifier {
    listeners: Mutex<Vec<Registration>>,
    next_token: AtomicU64,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Registering the same `Arc` again returns the
    /// existing token.
    pub fn add(&self, listener: Arc<dyn ChangeListener>) -> ListenerToken {
        let mut listeners = self.listeners.lock();
        if let Some((token, _)) = listeners
            .iter()
            .find(|(_, existing)| std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(&listener)))
        {
            return *token;
        }
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        listeners.push((token, listener));
        token
    }

    pub fn remove(&self, token: ListenerToken) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(t, _)| *t != token);
        listeners.len() != before
    }

    /// Unregister by listener identity rather than token.
    pub fn remove_listener(&self, listener: &Arc<dyn ChangeListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(_, existing)| !std::ptr::addr_eq(Arc::as_ptr(existing), Arc::as_ptr(listener)));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Call every listener with the batch. Empty batches are dropped.
    pub fn deliver(&self, batch: ChangeBatch) {
        if batch.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn ChangeListener>> =
            self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect();
        tracing::debug!(
            "Delivering {} change events to {} listeners",
            batch.len(),
            listeners.len()
        );
        for listener in listeners {
            listener.changed(&batch);
        }
    }
}

/// Options for [`crate::Database::changes_since`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangesOptions {
    /// Report every leaf instead of only each document's winner
    pub include_conflicts: bool,
    pub include_docs: bool,
    pub limit: Option<usize>,
}

/// Per-revision filter; the second argument carries caller parameters.
pub type ChangesFilter<'a> = &'a dyn Fn(&Revision, Option<&Map>) -> bool;

/// Build a change feed over a set of trees.
pub(crate) fn collect_changes<'a>(
    docs: impl Iterator<Item = (&'a str, &'a RevisionTree)>,
    since: u64,
    options: &ChangesOptions,
    filter: Option<ChangesFilter<'_>>,
    params: Option<&Map>,
) -> Vec<Revision> {
    let mut out = Vec::new();
    for (doc_id, tree) in docs {
        let candidates = if options.include_conflicts {
            tree.leaves()
        } else {
            tree.winner().into_iter().collect()
        };
        for node in candidates {
            if !node.sequence.is_some_and(|seq| seq > since) {
                continue;
            }
            let revision = node.to_revision(doc_id);
            if let Some(filter) = filter {
                if !filter(&revision, params) {
                    continue;
                }
            }
            out.push(if options.include_docs {
                revision
            } else {
                revision.without_body()
            });
        }
    }
    out.sort_by_key(|rev| rev.sequence);
    if let Some(limit) = options.limit {
        out.truncate(limit);
    }
    out
}

struct ChannelListener(mpsc::UnboundedSender<ChangeBatch>);

impl ChangeListener for ChannelListener {
    fn changed(&self, batch: &ChangeBatch) {
        let _ = self.0.send(batch.clone());
    }
}

/// Async view of committed change batches; unregisters on drop.
pub struct ChangeStream {
    receiver: mpsc::UnboundedReceiver<ChangeBatch>,
    notifier: Arc<ChangeNotifier>,
    token: ListenerToken,
}

impl ChangeStream {
    pub(crate) fn register(notifier: &Arc<ChangeNotifier>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = notifier.add(Arc::new(ChannelListener(sender)));
        Self {
            receiver,
            notifier: Arc::clone(notifier),
            token,
        }
    }

    /// Wait for the next batch.
    pub async fn next(&mut self) -> Option<ChangeBatch> {
        self.receiver.recv().await
    }

    /// Take a batch if one is already queued.
    pub fn try_next(&mut self) -> Option<ChangeBatch> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.notifier.remove(self.token);
    }
}
