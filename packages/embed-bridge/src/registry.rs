//! Cancellation and async operation registry
//!
//! Every in-flight asynchronous call and streaming sequence is registered
//! under an id that is unique for the lifetime of its engine. Cancellation is
//! cooperative: the native computation keeps running, but its result is
//! discarded and the waiter resolves with
//! [`BridgeError::OperationCancelled`] instead.
//!
//! ## Race rule
//!
//! An operation resolves through a single `oneshot::Sender` kept behind a
//! mutex. Native completion and cancellation both try to take it; whichever
//! gets there first decides the terminal state, and the loser is a no-op. The
//! waiter therefore observes exactly one outcome.

use crate::error::{BridgeError, Result};
use crate::sync_bridge::Response;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Identity of a registered operation
pub type OperationId = u64;

/// Lifecycle of an asynchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Completed,
    Cancelled,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationState::Pending)
    }
}

/// Anything the registry can cancel
pub(crate) trait Cancellable: Send + Sync {
    /// Request cancellation. Returns true if this call moved the entry to a
    /// terminal state; repeated or late calls return false.
    fn cancel(&self) -> bool;

    fn state(&self) -> OperationState;
}

/// Table of in-flight operations for one engine
pub struct OperationRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<OperationId, Arc<dyn Cancellable>>>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn allocate_id(&self) -> OperationId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, id: OperationId, entry: Arc<dyn Cancellable>) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(id, entry);
    }

    pub(crate) fn deregister(&self, id: OperationId) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(&id);
    }

    /// Cancel a registered operation.
    ///
    /// Idempotent: unknown, finished and already-cancelled ids are ignored.
    /// Returns true if this call cancelled a pending operation.
    pub fn cancel(&self, id: OperationId) -> bool {
        // Clone out of the lock so cancel() never runs under it
        let entry = {
            let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.get(&id).cloned()
        };
        match entry {
            Some(entry) => {
                let cancelled = entry.cancel();
                if cancelled {
                    tracing::debug!(operation_id = id, "operation cancelled");
                }
                cancelled
            }
            None => false,
        }
    }

    /// Cancel and deregister every operation; returns how many were still
    /// pending. Handles and streams drained here deregister as a no-op later.
    pub fn drain(&self) -> usize {
        let entries: Vec<Arc<dyn Cancellable>> = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.drain().map(|(_, entry)| entry).collect()
        };
        let cancelled = entries.iter().filter(|entry| entry.cancel()).count();
        if cancelled > 0 {
            tracing::debug!(cancelled, "force-cancelled registered operations");
        }
        cancelled
    }

    /// State of a registered operation, if it is still registered
    pub fn state(&self, id: OperationId) -> Option<OperationState> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.get(&id).map(|entry| entry.state())
    }

    /// Number of registered operations
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct SlotInner {
    state: OperationState,
    sender: Option<oneshot::Sender<Result<Response>>>,
}

/// Shared resolution point of one async operation
pub(crate) struct OperationSlot {
    operation: &'static str,
    cancel_flag: AtomicBool,
    inner: Mutex<SlotInner>,
}

impl OperationSlot {
    pub(crate) fn new(
        operation: &'static str,
    ) -> (Arc<Self>, oneshot::Receiver<Result<Response>>) {
        let (sender, receiver) = oneshot::channel();
        let slot = Arc::new(Self {
            operation,
            cancel_flag: AtomicBool::new(false),
            inner: Mutex::new(SlotInner {
                state: OperationState::Pending,
                sender: Some(sender),
            }),
        });
        (slot, receiver)
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::Acquire)
    }

    /// Deliver the native outcome. Returns false if cancellation already won,
    /// in which case the outcome is dropped.
    pub(crate) fn resolve(&self, outcome: Result<Response>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.state.is_terminal() || self.is_cancel_requested() {
            return false;
        }
        inner.state = if outcome.is_ok() {
            OperationState::Completed
        } else {
            OperationState::Failed
        };
        if let Some(sender) = inner.sender.take() {
            // The waiter may have gone away; the outcome is then simply dropped
            let _ = sender.send(outcome);
        }
        true
    }
}

impl Cancellable for OperationSlot {
    fn cancel(&self) -> bool {
        self.cancel_flag.store(true, Ordering::Release);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = OperationState::Cancelled;
        if let Some(sender) = inner.sender.take() {
            let _ = sender.send(Err(BridgeError::cancelled(self.operation)));
        }
        true
    }

    fn state(&self) -> OperationState {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).state
    }
}

/// Caller-visible token for one in-flight asynchronous native call
///
/// Dropping the handle without waiting cancels the operation and removes it
/// from the registry.
pub struct AsyncOperationHandle {
    id: OperationId,
    slot: Arc<OperationSlot>,
    receiver: Option<oneshot::Receiver<Result<Response>>>,
    registry: Arc<OperationRegistry>,
}

impl AsyncOperationHandle {
    pub(crate) fn new(
        id: OperationId,
        slot: Arc<OperationSlot>,
        receiver: oneshot::Receiver<Result<Response>>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            id,
            slot,
            receiver: Some(receiver),
            registry,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn state(&self) -> OperationState {
        self.slot.state()
    }

    /// Whether cancel() has been requested, even if completion won the race
    pub fn is_cancel_requested(&self) -> bool {
        self.slot.is_cancel_requested()
    }

    /// Request cancellation. Safe to call any number of times, including after
    /// completion, where it does nothing.
    pub fn cancel(&self) -> bool {
        self.slot.cancel()
    }

    /// Wait for the terminal outcome.
    ///
    /// Resolves early with [`BridgeError::OperationCancelled`] if the operation
    /// is cancelled before the native call finishes.
    pub async fn wait(mut self) -> Result<Response> {
        let Some(receiver) = self.receiver.take() else {
            return Err(BridgeError::cancelled(self.slot.operation));
        };
        let outcome = receiver.await.unwrap_or_else(|_| {
            Err(BridgeError::engine_call_failed(
                self.slot.operation,
                "worker exited without delivering a result",
            ))
        });
        self.registry.deregister(self.id);
        outcome
    }
}

impl Drop for AsyncOperationHandle {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            // Abandoned before wait(): nobody will consume the result
            self.slot.cancel();
        }
        self.registry.deregister(self.id);
    }
}

impl std::fmt::Debug for AsyncOperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOperationHandle")
            .field("id", &self.id)
            .field("operation", &self.slot.operation)
            .field("state", &self.state())
            .finish()
    }
}
