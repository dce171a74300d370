//! Nestable write scopes
//!
//! A single reentrant lock serializes writers. The first scope a thread opens
//! creates the pending [`WriteScope`]; nested scopes only bump its depth.
//! When the outermost scope ends successfully the storage batch is committed,
//! the overlay becomes the committed state and the collected events are
//! delivered as one batch, all before the lock is released.

use crate::changes::ChangeBatch;
use crate::compactor;
use crate::database::Shared;
use crate::error::{Error, Result};
use crate::store::{WriteScope, Writer};
use parking_lot::ReentrantMutexGuard;
use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// What ending a scope did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CommitReport {
    /// For the outermost scope, whether its changes were committed; for a
    /// nested scope, the success flag it ended with.
    pub committed: bool,
    pub attachments_removed: usize,
}

/// One open scope on the current thread
pub(crate) struct ScopeGuard<'a> {
    shared: &'a Shared,
    guard: ReentrantMutexGuard<'a, RefCell<Option<WriteScope>>>,
    finished: bool,
}

impl<'a> ScopeGuard<'a> {
    pub fn begin(shared: &'a Shared) -> Result<Self> {
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let timeout = shared.config.write_timeout();
        let guard = shared
            .writer
            .try_lock_for(timeout)
            .ok_or(Error::Busy(timeout))?;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        {
            let mut slot = guard.borrow_mut();
            match slot.as_mut() {
                Some(scope) => scope.depth += 1,
                None => *slot = Some(WriteScope::new(&shared.committed.read_recursive())),
            }
        }
        Ok(Self {
            shared,
            guard,
            finished: false,
        })
    }

    /// Run a mutation against the pending state.
    pub fn with_writer<T>(&self, op: impl FnOnce(&mut Writer<'_>) -> Result<T>) -> Result<T> {
        let committed = self.shared.committed.read_recursive();
        let mut slot = self.guard.borrow_mut();
        let scope = slot.as_mut().ok_or(Error::Closed)?;
        let mut writer = Writer::new(&committed, scope, &self.shared.blobs);
        op(&mut writer)
    }

    /// End the scope; `ok == false` rolls back the whole transaction.
    pub fn end(mut self, ok: bool) -> Result<CommitReport> {
        self.finish(ok)
    }

    fn finish(&mut self, ok: bool) -> Result<CommitReport> {
        self.finished = true;
        let mut scope = {
            let mut slot = self.guard.borrow_mut();
            let Some(scope) = slot.as_mut() else {
                return Ok(CommitReport::default());
            };
            if scope.depth > 1 {
                scope.depth -= 1;
                scope.failed |= !ok;
                return Ok(CommitReport {
                    committed: ok,
                    attachments_removed: 0,
                });
            }
            match slot.take() {
                Some(scope) => scope,
                None => return Ok(CommitReport::default()),
            }
        };

        if !ok || scope.failed {
            warn!(
                "Rolling back transaction; discarding {} change events",
                scope.event_count()
            );
            return Ok(CommitReport::default());
        }

        let committed_sequence = self.shared.committed.read_recursive().last_sequence();
        let (batch, events) = scope.take_outputs(committed_sequence);
        if !batch.is_empty() {
            let mut revisions = self.shared.revisions.lock();
            let store = revisions.as_mut().ok_or(Error::Closed)?;
            if let Err(e) = store.commit(&batch) {
                warn!("Storage commit failed, rolling back transaction: {}", e);
                return Err(e.into());
            }
        }

        let gc_requested = scope.gc_requested();
        Arc::make_mut(&mut self.shared.committed.write()).apply(scope);
        let gc = if gc_requested {
            compactor::collect_garbage(&self.shared.committed.read_recursive(), &self.shared.blobs)
        } else {
            Ok(0)
        };

        debug!("Committed transaction with {} change events", events.len());
        self.shared.notifier.deliver(ChangeBatch::new(events));
        Ok(CommitReport {
            committed: true,
            attachments_removed: gc?,
        })
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish(false);
        }
    }
}
