use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// A unit of work: one object key, plus how many times processing it has failed so far
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Task {
    pub key: String,
    pub failures: usize,
}

impl Task {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            failures: 0,
        }
    }
}

/// FIFO queue of keys with joinable-queue accounting.
///
/// Every [`Self::push`] adds one unfinished item and every [`Self::ack`] retires one.  A worker
/// that fails to process an item pushes it back and then acks the item it popped, so the
/// unfinished count never reaches zero while a failed item is waiting for another attempt.
/// [`Self::join`] resolves once the unfinished count is zero.
///
/// Clones are handles to the same queue.
#[derive(Clone, Default)]
pub(crate) struct WorkQueue {
    inner: Arc<WorkQueueInner>,
}

#[derive(Default)]
struct WorkQueueInner {
    state: Mutex<QueueState>,

    /// Signalled when an item is pushed, and when the queue becomes drained so that idle
    /// consumers can exit without waiting for their fetch timeout
    item_available: Notify,

    drained: Notify,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<Task>,
    unfinished: usize,
}

impl WorkQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, task: Task) {
        {
            let mut state = self.lock();
            state.items.push_back(task);
            state.unfinished += 1;
        }

        self.inner.item_available.notify_one();
    }

    pub(crate) fn push_key(&self, key: impl Into<String>) {
        self.push(Task::new(key))
    }

    /// Pop the next item, waiting at most `timeout` for one to become available.
    ///
    /// Returns `None` if the timeout elapses, or right away if the queue is drained.  A timeout is
    /// not an error; callers should check [`Self::is_drained`] and try again if it isn't.
    pub(crate) async fn pop(&self, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.inner.item_available.notified();
            tokio::pin!(notified);

            // Register interest before checking the state so a push or drain that happens in
            // between isn't missed
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(task) = state.items.pop_front() {
                    return Some(task);
                }

                if state.unfinished == 0 {
                    return None;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Mark one previously popped item as finished
    pub(crate) fn ack(&self) {
        let drained = {
            let mut state = self.lock();

            if state.unfinished == 0 {
                warn!("ack called more times than there were items pushed to the queue");
                return;
            }

            state.unfinished -= 1;
            state.unfinished == 0
        };

        if drained {
            self.inner.drained.notify_waiters();
            self.inner.item_available.notify_waiters();
        }
    }

    /// Wait until every item ever pushed has been acked
    pub(crate) async fn join(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_drained() {
                return;
            }

            notified.await;
        }
    }

    /// Number of items waiting in the queue, not counting items being processed right now
    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// `true` once every item ever pushed has been acked
    pub(crate) fn is_drained(&self) -> bool {
        self.lock().unfinished == 0
    }

    /// Keys of all waiting items, in queue order
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.lock().items.iter().map(|task| task.key.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();

        f.debug_struct("WorkQueue")
            .field("len", &state.items.len())
            .field("unfinished", &state.unfinished)
            .finish()
    }
}
