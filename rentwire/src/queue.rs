//! Outbound operation queue.
//!
//! Every outbound operation goes through the [`OutboundQueue`]. A flusher
//! task ([`spawn_flusher`]) drains it in strict FIFO order whenever the
//! connection is [`Connected`](ConnectionState::Connected). While the
//! connection is down, operations accumulate and are flushed on the next
//! connected transition.
//!
//! A failed dispatch stops the flush and puts the operation back at the
//! front, so the operations behind it keep their order. The flusher tries
//! again after [`RETRY_DELAY`] even if nothing new is queued. Operations
//! the transport can never carry (they do not encode into one frame) are
//! dropped and reported as [`ConnectionEvent::DispatchFailed`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use rentwire_proto::message::ConversationId;
use rentwire_proto::op::{ClientOp, OperationKind};

use crate::bus::EventBus;
use crate::event::{ConnectionEvent, ConnectionState, SyncEvent};
use crate::transport::TransportError;

/// Pause before a failed flush is retried while the link stays up.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Sends one operation over the live connection.
pub trait Dispatch: Send + Sync + 'static {
    /// Dispatch `op`, failing with [`TransportError::NotConnected`] when no
    /// connection is live.
    fn dispatch(
        &self,
        op: &ClientOp,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}

/// An operation waiting to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedOperation {
    /// The operation itself.
    pub op: ClientOp,
    /// When it was first queued.
    pub enqueued_at: Instant,
}

impl QueuedOperation {
    /// Classification of the queued operation.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.op.kind()
    }
}

/// FIFO buffer of outbound operations. No deduplication.
#[derive(Default)]
pub struct OutboundQueue {
    ops: Mutex<VecDeque<QueuedOperation>>,
    notify: Notify,
}

impl OutboundQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `op` and wakes the flusher. If the connection is live the
    /// flusher dispatches it right away.
    pub fn enqueue_or_send(&self, op: ClientOp) {
        tracing::trace!(op = %op, "operation queued");
        self.ops.lock().push_back(QueuedOperation {
            op,
            enqueued_at: Instant::now(),
        });
        self.notify.notify_one();
    }

    /// Places `ops` ahead of everything queued, keeping their relative order.
    pub fn push_front_batch(&self, ops: Vec<ClientOp>) {
        if ops.is_empty() {
            return;
        }
        let now = Instant::now();
        {
            let mut queue = self.ops.lock();
            for op in ops.into_iter().rev() {
                queue.push_front(QueuedOperation {
                    op,
                    enqueued_at: now,
                });
            }
        }
        self.notify.notify_one();
    }

    /// Drops every queued operation scoped to `conversation`. Returns how
    /// many were removed.
    pub fn purge(&self, conversation: &ConversationId) -> usize {
        let mut queue = self.ops.lock();
        let before = queue.len();
        queue.retain(|queued| queued.op.conversation_id() != Some(conversation));
        let removed = before - queue.len();
        if removed > 0 {
            tracing::debug!(conversation = %conversation, removed, "purged queued operations");
        }
        removed
    }

    /// Keeps only the queued operations for which `keep` returns `true`.
    pub fn retain(&self, mut keep: impl FnMut(&ClientOp) -> bool) {
        self.ops.lock().retain(|queued| keep(&queued.op));
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Snapshot of the queued operations, front first.
    #[must_use]
    pub fn pending(&self) -> Vec<ClientOp> {
        self.ops.lock().iter().map(|q| q.op.clone()).collect()
    }

    /// Drops everything.
    pub fn clear(&self) {
        self.ops.lock().clear();
    }

    fn pop_front(&self) -> Option<QueuedOperation> {
        self.ops.lock().pop_front()
    }

    fn requeue_front(&self, queued: QueuedOperation) {
        self.ops.lock().push_front(queued);
    }
}

/// How a flush pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flush {
    /// Queue empty or connection gone.
    Done,
    /// A dispatch failed and the operation went back to the front.
    Failed,
}

/// Spawns the task that drains `queue` through `dispatcher` while `state`
/// reads connected. Dropped operations are reported on `bus`.
///
/// The task ends when the state channel closes; abort the handle to stop
/// it earlier.
pub fn spawn_flusher<D: Dispatch>(
    queue: Arc<OutboundQueue>,
    dispatcher: Arc<D>,
    mut state: watch::Receiver<ConnectionState>,
    bus: EventBus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if state.wait_for(|s| s.is_connected()).await.is_err() {
                return;
            }
            let outcome = flush(&queue, dispatcher.as_ref(), &state, &bus).await;
            let retry = async {
                if outcome == Flush::Failed {
                    tokio::time::sleep(RETRY_DELAY).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                () = queue.notify.notified() => {}
                () = retry => {
                    tracing::debug!(pending = queue.len(), "retrying failed flush");
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

/// Dispatches queued operations in order until the queue is empty, the
/// connection leaves `Connected`, or a dispatch fails.
async fn flush<D: Dispatch>(
    queue: &OutboundQueue,
    dispatcher: &D,
    state: &watch::Receiver<ConnectionState>,
    bus: &EventBus,
) -> Flush {
    let mut sent = 0usize;
    let mut outcome = Flush::Done;
    while state.borrow().is_connected() {
        let Some(queued) = queue.pop_front() else {
            break;
        };
        match dispatcher.dispatch(&queued.op).await {
            Ok(()) => sent += 1,
            Err(err) if err.is_permanent() => {
                tracing::warn!(op = %queued.op, err = %err, "operation cannot be sent, dropped");
                bus.publish(SyncEvent::Connection(ConnectionEvent::DispatchFailed {
                    operation: queued.op.to_string(),
                    error: err.to_string(),
                }));
            }
            Err(err) => {
                tracing::warn!(
                    op = %queued.op,
                    err = %err,
                    queued_for_ms = queued.enqueued_at.elapsed().as_millis(),
                    "dispatch failed, operation re-queued"
                );
                queue.requeue_front(queued);
                outcome = Flush::Failed;
                break;
            }
        }
    }
    if sent > 0 {
        tracing::debug!(sent, remaining = queue.len(), "queue flushed");
    }
    outcome
}
