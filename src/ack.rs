//! Ack registry (component F): correlates replies to waiting senders and
//! resolves the timeout-vs-late-arrival race. This is the hardest invariant
//! in the system — see §4.F. Grounded on
//! `original_source/src/protocol.c` (`register_ack_waiter`,
//! `handle_ack_message`) and `event_framework.h` for the one-shot-event
//! shape.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::pool::FreeListPool;
use crate::status::Status;
use crate::util::VmPayload;
use crate::wire::{AckOutcome, InternalHeader};

/// A one-shot signal with timeout, the Rust analogue of the source's
/// semaphore-backed `event_t`.
struct OneShotEvent {
    signaled: Mutex<bool>,
    cvar: Condvar,
}

impl OneShotEvent {
    fn new() -> OneShotEvent {
        OneShotEvent { signaled: Mutex::new(false), cvar: Condvar::new() }
    }

    fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cvar.notify_one();
    }

    /// Returns `true` if signaled before `timeout` elapsed.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if *signaled {
            return true;
        }
        let result = self.cvar.wait_for(&mut signaled, timeout);
        *signaled && !result.timed_out()
    }
}

struct Waiter {
    correlation_id: u64,
    event: OneShotEvent,
    received: AtomicBool,
    cancelled: AtomicBool,
    reply: Mutex<Option<(InternalHeader, VmPayload)>>,
}

impl Waiter {
    fn new(correlation_id: u64) -> Waiter {
        Waiter {
            correlation_id,
            event: OneShotEvent::new(),
            received: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            reply: Mutex::new(None),
        }
    }
}

/// The outcome of waiting on a registered waiter.
pub struct AckReply {
    pub status: Status,
    pub header: InternalHeader,
    pub user: VmPayload,
}

pub struct AckRegistry {
    pool: FreeListPool<Arc<Waiter>>,
    next_correlation_id: AtomicU64,
}

impl AckRegistry {
    pub fn new(capacity: usize) -> AckRegistry {
        AckRegistry { pool: FreeListPool::new(capacity), next_correlation_id: AtomicU64::new(1) }
    }

    /// Allocate a waiter slot and a fresh correlation id. Returns `None` if
    /// the pool is full ("busy/internal" at the call site, per §4.F).
    pub fn register(&self) -> Option<(u64, usize)> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let waiter = Arc::new(Waiter::new(correlation_id));
        let slot = self.pool.push(waiter)?;
        Some((correlation_id, slot))
    }

    /// Release a waiter without waiting on it — used when send fails after
    /// registration, per §4.F's failure-mode contract.
    pub fn release(&self, slot: usize) {
        self.pool.pop(slot);
    }

    /// Block on the waiter's event up to `timeout`. On success, re-checks
    /// `received && !cancelled` under the registry's per-slot access (the
    /// pool's own lock serializes this) before extracting the payload and
    /// freeing the slot. On timeout, sets `cancelled` and — if a late ack
    /// raced in in the meantime — takes ownership of (and the caller must
    /// drop, releasing) its payload.
    pub fn wait(&self, slot: usize, timeout: Duration) -> Option<AckReply> {
        let waiter = self.pool.with(slot, Arc::clone)?;
        let signaled = waiter.event.wait_timeout(timeout);

        let outcome = if signaled {
            // Success path: re-check under the same invariants the ack
            // handler used to set them.
            if waiter.received.load(Ordering::Acquire) && !waiter.cancelled.load(Ordering::Acquire) {
                waiter.reply.lock().take().map(|(header, user)| AckReply {
                    status: Status::from_raw(header.status),
                    header,
                    user,
                })
            } else {
                None
            }
        } else {
            // Timeout path: declare cancellation. If a late ack raced in
            // and already stored a reply, we now own it and must release
            // it (dropping the `VmPayload` does that automatically).
            waiter.cancelled.store(true, Ordering::Release);
            if waiter.received.load(Ordering::Acquire) {
                if let Some((_header, payload)) = waiter.reply.lock().take() {
                    drop(payload);
                }
            }
            None
        };

        self.pool.pop(slot);
        outcome
    }

    /// Fast-path match on receive: look the waiter up by `correlation_slot`
    /// first, falling back to a linear scan only if that slot is stale
    /// (out of range, vacant, or holding a different correlation id).
    pub fn resolve(&self, header: InternalHeader, user: VmPayload) -> AckOutcome {
        let slot = header.correlation_slot.max(0) as usize;
        let fast_path_matches = self
            .pool
            .with(slot, |w| w.correlation_id == header.correlation_id)
            .unwrap_or(false);

        let resolved_slot = if fast_path_matches {
            Some(slot)
        } else {
            self.pool.find(|w| w.correlation_id == header.correlation_id)
        };

        let Some(slot) = resolved_slot else {
            return AckOutcome::Rejected;
        };

        let accepted = self
            .pool
            .with(slot, |waiter| {
                if waiter.cancelled.load(Ordering::Acquire) {
                    return false;
                }
                *waiter.reply.lock() = Some((header, user));
                waiter.received.store(true, Ordering::Release);
                waiter.event.signal();
                true
            })
            .unwrap_or(false);

        if accepted {
            AckOutcome::Accepted
        } else {
            AckOutcome::Rejected
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}
