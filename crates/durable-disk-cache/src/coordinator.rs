//! Per-key creation tasks
//!
//! Every in-flight creation owns one slot in a [`TaskTable`], keyed by the
//! cache key, so there is never more than one live writer per key. A slot
//! carries:
//!
//! - a cancel signal the creation routine is raced against, and which the
//!   routine itself can observe through a [`CancelSignal`];
//! - a "stopped" signal fired once the routine has returned or been dropped;
//! - the shared outcome that any number of callers can await.
//!
//! Retiring a slot means cancelling it and waiting for "stopped". Blocking
//! work the routine handed off may still be running after that, so every
//! task stages to a path derived from its own id and the retiring side only
//! ever cleans up that path. The task's own commit step re-checks ownership
//! under the cache lock, so a retired task finishes as
//! [`DiskCacheError::Cancelled`] without touching the cache.

use crate::error::{DiskCacheError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};

/// Outcome of a creation: the committed content path, `None` when the
/// routine declined (or the entry was evicted straight away), or an error.
pub type CreationOutcome = Result<Option<PathBuf>>;

/// Awaitable handle to an in-flight creation. Clones share the outcome.
#[derive(Clone)]
pub struct CreationTask {
    key: String,
    id: u64,
    outcome: Shared<BoxFuture<'static, CreationOutcome>>,
}

impl CreationTask {
    /// The (transformed) key being created
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identifier unique within the process
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for CreationTask {
    type Output = CreationOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().outcome.poll_unpin(cx)
    }
}

impl std::fmt::Debug for CreationTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreationTask")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

/// Cancellation as seen from inside a creation routine.
///
/// The routine's future is dropped on cancellation, but work it moved to
/// other threads is not. Such work should check [`CancelSignal::is_cancelled`]
/// between steps and stop early.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Whether the creation was cancelled or its owner went away
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once the creation is cancelled
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Bookkeeping for one in-flight creation
pub(crate) struct TaskSlot {
    id: u64,
    cancel: watch::Sender<bool>,
    stopped: Option<oneshot::Receiver<()>>,
    task: CreationTask,
}

impl TaskSlot {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn task(&self) -> &CreationTask {
        &self.task
    }

    /// Cancel the routine and wait until it can no longer run
    pub(crate) async fn cancel_and_wait(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(stopped) = self.stopped.take() {
            let _ = stopped.await;
        }
    }
}

/// Spawn a creation. The routine built by `make_routine` runs until it
/// finishes or the slot is cancelled; `finish` then receives its result
/// (`None` when cancelled) and produces the outcome shared with every waiter.
pub(crate) fn launch<M, R, F>(key: String, id: u64, make_routine: M, finish: F) -> TaskSlot
where
    M: FnOnce(CancelSignal) -> R,
    R: Future<Output = Result<bool>> + Send + 'static,
    F: FnOnce(Option<Result<bool>>) -> BoxFuture<'static, CreationOutcome> + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let (stopped_tx, stopped_rx) = oneshot::channel();
    let routine = make_routine(CancelSignal {
        rx: cancel_rx.clone(),
    });

    let handle = tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => None,
            result = routine => Some(result),
        };
        let _ = stopped_tx.send(());
        finish(result).await
    });

    let outcome = async move {
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(DiskCacheError::from(e)),
        }
    }
    .boxed()
    .shared();

    TaskSlot {
        id,
        cancel: cancel_tx,
        stopped: Some(stopped_rx),
        task: CreationTask { key, id, outcome },
    }
}

/// Task ids stay unique across cache instances sharing a process, so a
/// writer left over from a closed instance never shares a staging path with
/// one from a reopened instance.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Table of in-flight creations, at most one per key
#[derive(Default)]
pub(crate) struct TaskTable {
    slots: HashMap<String, TaskSlot>,
}

impl TaskTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> u64 {
        NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn get(&self, key: &str) -> Option<&TaskSlot> {
        self.slots.get(key)
    }

    /// Register a slot. The caller must have retired any previous slot.
    pub(crate) fn insert(&mut self, key: String, slot: TaskSlot) {
        let previous = self.slots.insert(key, slot);
        debug_assert!(previous.is_none(), "previous task was not retired");
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<TaskSlot> {
        self.slots.remove(key)
    }

    /// Whether `id` still owns `key`
    pub(crate) fn is_current(&self, key: &str, id: u64) -> bool {
        self.slots.get(key).map(|slot| slot.id == id).unwrap_or(false)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<(String, TaskSlot)> {
        self.slots.drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
