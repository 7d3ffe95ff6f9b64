//! Pending invocations of one connection, keyed by correlation id
//!
//! Completion is a two-step ownership transfer: an entry is removed from the
//! map under the lock, and only the remover completes it, after the lock is
//! released. `resolve`, `deregister` and `cancel_all` therefore race only for
//! the removal, and an invocation is completed at most once.

use crate::errors::{CloseReason, InvocationError};
use crate::member::MemberId;
use crate::routing::ChannelTarget;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub type InvocationResult = Result<Bytes, InvocationError>;

struct PendingEntry {
    target: ChannelTarget,
    retryable: bool,
    deadline: Option<Instant>,
    tx: oneshot::Sender<InvocationResult>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<u64, PendingEntry>,
    /// Set by `cancel_all`; later registrations fail immediately
    closed: Option<String>,
}

/// Snapshot of one pending entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingInfo {
    pub correlation_id: u64,
    pub target: ChannelTarget,
    pub retryable: bool,
    pub deadline: Option<Instant>,
}

/// Pending invocations of one connection (Layer 3)
pub struct InvocationRegistry {
    /// Member every invocation here is addressed to
    member: MemberId,
    /// Next correlation id; ids are never reused within a connection
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
}

impl InvocationRegistry {
    pub fn new(member: MemberId) -> Self {
        Self {
            member,
            next_id: AtomicU64::new(1),
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a correlation id and store a pending entry for it.
    ///
    /// Fails with `TargetDisconnected` once the registry has been cancelled.
    ///
    /// # Arguments
    /// * `target` - Channel the request goes out on
    /// * `retryable` - Whether the caller may resend after a disconnect
    /// * `deadline` - When the caller stops waiting, if bounded
    ///
    /// # Returns
    /// The caller's handle; dropping it unresolved removes the entry
    pub fn register(
        self: &Arc<Self>,
        target: ChannelTarget,
        retryable: bool,
        deadline: Option<Instant>,
    ) -> Result<Invocation, InvocationError> {
        let (tx, rx) = oneshot::channel();
        let correlation_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.lock();
            if let Some(reason) = &state.closed {
                return Err(InvocationError::TargetDisconnected {
                    member: self.member,
                    reason: reason.clone(),
                });
            }
            state.entries.insert(
                correlation_id,
                PendingEntry { target, retryable, deadline, tx },
            );
        }

        Ok(Invocation {
            correlation_id,
            target,
            started: Instant::now(),
            registry: Arc::clone(self),
            rx,
        })
    }

    /// Complete the entry for `correlation_id` if it is still pending.
    ///
    /// Returns false for unknown, already resolved or cancelled ids, which is
    /// how late and duplicate responses are discarded.
    pub fn resolve(&self, correlation_id: u64, result: InvocationResult) -> bool {
        let entry = self.lock().entries.remove(&correlation_id);
        match entry {
            Some(entry) => {
                let _ = entry.tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the entry without completing it. Returns whether it was pending.
    pub fn deregister(&self, correlation_id: u64) -> bool {
        self.lock().entries.remove(&correlation_id).is_some()
    }

    /// Fail every pending entry with `TargetDisconnected` and refuse new ones.
    ///
    /// Returns the number of entries this call completed.
    pub fn cancel_all(&self, reason: &CloseReason) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(InvocationError::TargetDisconnected {
                member: self.member,
                reason: reason.to_string(),
            }));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Number of entries waiting on the given channel
    pub fn pending_on(&self, target: ChannelTarget) -> usize {
        self.lock().entries.values().filter(|e| e.target == target).count()
    }

    /// Entries still waiting, in correlation id order
    pub fn pending(&self) -> Vec<PendingInfo> {
        let mut pending: Vec<PendingInfo> = self
            .lock()
            .entries
            .iter()
            .map(|(id, e)| PendingInfo {
                correlation_id: *id,
                target: e.target,
                retryable: e.retryable,
                deadline: e.deadline,
            })
            .collect();
        pending.sort_by_key(|p| p.correlation_id);
        pending
    }
}

/// Caller-side handle of one registered invocation.
///
/// Dropping an unresolved handle removes its registry entry.
pub struct Invocation {
    correlation_id: u64,
    target: ChannelTarget,
    started: Instant,
    registry: Arc<InvocationRegistry>,
    rx: oneshot::Receiver<InvocationResult>,
}

impl Invocation {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn target(&self) -> ChannelTarget {
        self.target
    }

    /// Wait for the terminal result
    pub async fn wait(mut self) -> InvocationResult {
        let received = (&mut self.rx).await;
        self.flatten(received)
    }

    /// Wait for the terminal result, giving up at `deadline`
    pub async fn wait_until(mut self, deadline: Instant) -> InvocationResult {
        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(received) => self.flatten(received),
            Err(_) => {
                if self.registry.deregister(self.correlation_id) {
                    Err(InvocationError::Timeout { elapsed: self.started.elapsed() })
                } else {
                    // Claimed concurrently; its completion is on the way
                    let received = (&mut self.rx).await;
                    self.flatten(received)
                }
            }
        }
    }

    fn flatten(&self, received: Result<InvocationResult, oneshot::error::RecvError>) -> InvocationResult {
        received.unwrap_or_else(|_| {
            Err(InvocationError::TargetDisconnected {
                member: self.registry.member,
                reason: "invocation abandoned".to_string(),
            })
        })
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        self.registry.deregister(self.correlation_id);
    }
}
