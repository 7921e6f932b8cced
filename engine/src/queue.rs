//! Work queue serializing readers and writers.
//!
//! Every reader and writer is an item in a FIFO queue. Only the head item
//! runs; the next one starts after the head's future has completed. A driver
//! task walks the queue in a loop (never by recursive continuation), yielding
//! to the runtime between items.
//!
//! # Sub-actions
//!
//! A running item may call another reader/writer without queueing behind
//! itself by wrapping the call in [`Action::sub_action`]. The nested
//! `read`/`write` must be *issued synchronously* inside the closure passed to
//! `sub_action`: the grant is consumed by the first enqueue on the same queue
//! and the same thread, and revoked as soon as the closure returns. Calls from
//! other threads never see it. A nested call issued after an `.await` is an
//! ordinary enqueue, and awaiting it from the head deadlocks the queue.
//!
//! Requires a tokio runtime.

use crate::{error::Result, Error};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, warn};

/// Identifier of a queue item.
pub type ActionId = u64;

/// Type-erased queued work.
trait QueuedWork: Send {
    fn run(self: Box<Self>, action: Action) -> BoxFuture<'static, ()>;
    fn abort(self: Box<Self>, error: Error);
}

struct Job<F, T> {
    work: F,
    sender: oneshot::Sender<Result<T>>,
}

impl<F, T> QueuedWork for Job<F, T>
where
    F: FnOnce(Action) -> BoxFuture<'static, Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>, action: Action) -> BoxFuture<'static, ()> {
        let Job { work, sender } = *self;
        Box::pin(async move {
            let result = work(action).await;
            let _ = sender.send(result);
        })
    }

    fn abort(self: Box<Self>, error: Error) {
        let _ = self.sender.send(Err(error));
    }
}

struct QueueItem {
    id: ActionId,
    is_writer: bool,
    description: Option<String>,
    work: Option<Box<dyn QueuedWork>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubActionGrant {
    /// Address of the granting queue's shared state
    queue: usize,
    id: ActionId,
    is_writer: bool,
}

thread_local! {
    /// Grant issued by a `sub_action` call running on this thread.
    static SUB_ACTION_GRANT: Cell<Option<SubActionGrant>> = const { Cell::new(None) };
}

/// Puts back the grant that was in place before a `sub_action` call, even if
/// its closure panics.
struct GrantScope {
    outer: Option<SubActionGrant>,
}

impl Drop for GrantScope {
    fn drop(&mut self) {
        SUB_ACTION_GRANT.with(|slot| slot.set(self.outer));
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    next_id: ActionId,
}

struct QueueInner {
    state: Mutex<QueueState>,
    warn_on_contention: bool,
}

/// FIFO queue of readers and writers.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

fn kind(is_writer: bool) -> &'static str {
    if is_writer {
        "writer"
    } else {
        "reader"
    }
}

impl WorkQueue {
    pub fn new(warn_on_contention: bool) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                warn_on_contention,
            }),
        }
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Take this thread's sub-action grant if it was issued by this queue.
    fn take_grant(&self) -> Option<SubActionGrant> {
        SUB_ACTION_GRANT.with(|slot| match slot.get() {
            Some(grant) if grant.queue == self.key() => slot.take(),
            _ => None,
        })
    }

    /// Number of queued items, the running one included.
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_writer_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .items
            .front()
            .is_some_and(|item| item.is_writer)
    }

    /// Queue `work`. The returned future resolves with the work's result.
    ///
    /// The item is queued when this function is called, not when the future
    /// is first polled. If a sub-action grant is pending, the work skips the
    /// line and runs as part of the granting item instead.
    pub fn enqueue<T, F, Fut>(
        &self,
        description: Option<&str>,
        is_writer: bool,
        work: F,
    ) -> BoxFuture<'static, Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(Action) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(grant) = self.take_grant() {
            if is_writer && !grant.is_writer {
                return Box::pin(async {
                    Err(Error::QueueViolation(
                        "cannot call a writer from within a reader".into(),
                    ))
                });
            }
            let action = Action {
                id: grant.id,
                is_writer,
                queue: self.clone(),
            };
            return Box::pin(work(action));
        }

        let mut state = self.inner.state.lock();

        if self.inner.warn_on_contention {
            if let Some(current) = state.items.front() {
                warn!(
                    enqueued = kind(is_writer),
                    description = description.unwrap_or("unnamed"),
                    current = kind(current.is_writer),
                    current_description = current.description.as_deref().unwrap_or("unnamed"),
                    queue_length = state.items.len(),
                    "work can't be performed yet because other readers/writers are queued; \
                     if the current one never finishes, a nested call is missing sub_action()"
                );
            }
        }

        let (sender, receiver) = oneshot::channel();
        let job = Job {
            work: move |action: Action| -> BoxFuture<'static, Result<T>> { Box::pin(work(action)) },
            sender,
        };

        let id = state.next_id;
        state.next_id += 1;
        state.items.push_back(QueueItem {
            id,
            is_writer,
            description: description.map(str::to_string),
            work: Some(Box::new(job)),
        });

        if state.items.len() == 1 {
            tokio::spawn(drive(self.clone()));
        }
        drop(state);

        let description = description.unwrap_or("unnamed").to_string();
        Box::pin(async move {
            receiver.await.unwrap_or_else(|_| {
                Err(Error::QueueViolation(format!(
                    "{} '{}' did not complete",
                    kind(is_writer),
                    description
                )))
            })
        })
    }

    fn is_head(&self, id: ActionId) -> bool {
        self.inner.state.lock().items.front().map(|item| item.id) == Some(id)
    }

    /// Reject every queued item except the running one with [`Error::Aborted`].
    fn abort_pending(&self) -> usize {
        let aborted: Vec<QueueItem> = {
            let mut state = self.inner.state.lock();
            if state.items.len() <= 1 {
                return 0;
            }
            state.items.drain(1..).collect()
        };

        let count = aborted.len();
        for item in aborted {
            if let Some(work) = item.work {
                work.abort(Error::Aborted);
            }
        }
        count
    }
}

/// Trampoline: run the head, pop it, yield, repeat until the queue is empty.
async fn drive(queue: WorkQueue) {
    loop {
        let head = {
            let mut state = queue.inner.state.lock();
            match state.items.front_mut() {
                Some(item) => (item.id, item.is_writer, item.work.take()),
                None => return,
            }
        };

        if let (id, is_writer, Some(work)) = head {
            let action = Action {
                id,
                is_writer,
                queue: queue.clone(),
            };
            if let Err(err) = tokio::spawn(work.run(action)).await {
                error!(action_id = id, error = %err, "queued {} failed to complete", kind(is_writer));
            }
        }

        {
            let mut state = queue.inner.state.lock();
            state.items.pop_front();
            if state.items.is_empty() {
                return;
            }
        }

        tokio::task::yield_now().await;
    }
}

/// Handle given to a running reader or writer.
#[derive(Clone)]
pub struct Action {
    id: ActionId,
    is_writer: bool,
    queue: WorkQueue,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("is_writer", &self.is_writer)
            .finish()
    }
}

impl Action {
    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn is_writer(&self) -> bool {
        self.is_writer
    }

    /// Whether this action is still the queue head.
    pub fn is_current(&self) -> bool {
        self.queue.is_head(self.id)
    }

    /// Fail unless this is the running writer.
    pub fn ensure_writer(&self) -> Result<()> {
        if !self.is_writer {
            return Err(Error::QueueViolation(
                "mutations can only be performed inside a writer".into(),
            ));
        }
        if !self.is_current() {
            return Err(Error::QueueViolation(
                "this writer has already settled or isn't running yet".into(),
            ));
        }
        Ok(())
    }

    /// Fail unless this is the running reader or writer.
    pub fn ensure_current(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Error::QueueViolation(
                "this reader/writer has already settled or isn't running yet".into(),
            ))
        }
    }

    /// Call another reader/writer from this one without queueing behind it.
    ///
    /// `work` must issue the nested `read`/`write` call before returning; see
    /// the module docs.
    pub fn sub_action<F, Fut>(&self, work: F) -> Fut
    where
        F: FnOnce() -> Fut,
    {
        let grant = SubActionGrant {
            queue: self.queue.key(),
            id: self.id,
            is_writer: self.is_writer,
        };
        let _scope = GrantScope {
            outer: SUB_ACTION_GRANT.with(|slot| slot.replace(Some(grant))),
        };

        let future = work();

        if let Some(grant) = SUB_ACTION_GRANT.with(Cell::take) {
            warn!(
                action_id = grant.id,
                "sub_action() closure returned without calling a reader/writer; \
                 the nested call will be queued normally"
            );
        }

        future
    }

    /// Reject all queued work behind this writer. Returns how many items were aborted.
    pub fn abort_pending_work(&self) -> Result<usize> {
        self.ensure_writer()?;
        Ok(self.queue.abort_pending())
    }
}
