//! Wire protocol (component E): the fixed-layout internal header, `send`,
//! and the receive loop that dispatches acks to the registry and everything
//! else to a role-specific handler. Grounded on
//! `original_source/src/protocol.c`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Sender};
use tracing::{debug, trace, warn};

use crate::kernel::port::PortId;
use crate::kernel::{message, KernelResult};
use crate::msgid::{MsgFlag, MsgId};
use crate::status::Status;
use crate::util::{Deadline, VmPayload};

/// Fixed-layout header carried in OOL region 1 (§3). 40 bytes, manually
/// packed/unpacked rather than serialized through `serde`/`bincode`: this is
/// a kernel-ABI-shaped struct, not an application value.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalHeader {
    pub client_id: u32,
    pub client_slot: i32,
    pub correlation_id: u64,
    pub correlation_slot: i32,
    pub status: i32,
    pub user_payload_deadline: Deadline,
    /// Size in bytes of the region named by a `SHARE`-flagged message's
    /// capability descriptor. Zero and unused otherwise.
    pub capability_size: u64,
}

pub const HEADER_LEN: usize = 40;

impl InternalHeader {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.client_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.client_slot.to_le_bytes());
        out[8..16].copy_from_slice(&self.correlation_id.to_le_bytes());
        out[16..20].copy_from_slice(&self.correlation_slot.to_le_bytes());
        out[20..24].copy_from_slice(&self.status.to_le_bytes());
        out[24..32].copy_from_slice(&self.user_payload_deadline.to_le_bytes());
        out[32..40].copy_from_slice(&self.capability_size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<InternalHeader> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(InternalHeader {
            client_id: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            client_slot: i32::from_le_bytes(bytes[4..8].try_into().ok()?),
            correlation_id: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            correlation_slot: i32::from_le_bytes(bytes[16..20].try_into().ok()?),
            status: i32::from_le_bytes(bytes[20..24].try_into().ok()?),
            user_payload_deadline: u64::from_le_bytes(bytes[24..32].try_into().ok()?),
            capability_size: u64::from_le_bytes(bytes[32..40].try_into().ok()?),
        })
    }
}

/// A successfully decoded, still-live message handed to a receive-loop
/// handler. `header`/`user` are `None` only for native (non-magic) kernel
/// notifications.
pub struct Received {
    pub msg_id: MsgId,
    pub remote_port: PortId,
    pub reply_port: Option<PortId>,
    /// A transferred capability's send right, carried as a port descriptor
    /// distinct from `reply_port` (§6). `None` unless the message is
    /// `SHARE`-flagged.
    pub capability: Option<PortId>,
    pub header: Option<InternalHeader>,
    pub user: Option<VmPayload>,
}

/// Build and send a complex message carrying `header`/`user_bytes` as the
/// two OOL regions, bounded by `timeout` (§4.E, ≈100 ms in practice).
/// `capability`, when set, rides as a `COPY_SEND` port descriptor in place of
/// the second OOL region (§6); `reply_port`, when set, is attached via the
/// message's local-port slot and is never consumed by `capability`.
pub fn send(
    dest: PortId,
    reply_port: Option<PortId>,
    capability: Option<PortId>,
    id: MsgId,
    header: InternalHeader,
    user_bytes: &[u8],
    timeout: Duration,
) -> Status {
    let header_bytes = header.to_bytes();
    match message::send(dest, reply_port, capability, id.raw(), &header_bytes, user_bytes, timeout) {
        Ok(()) => Status::SUCCESS,
        Err(crate::kernel::KernelError::SendTimedOut) => Status::TIMEOUT,
        Err(e) => {
            warn!(error = %e, "send failed");
            Status::SEND_FAILED
        }
    }
}

/// The role-specific dispatch decision for a non-ack message: `true` means
/// the handler claimed both OOL regions (the loop must not release them),
/// `false` means the loop must release them after the call returns.
pub type Handler<'a> = dyn FnMut(Received) -> bool + 'a;

/// Outcome of trying to hand an ack off to the registry.
pub enum AckOutcome {
    /// The registry took ownership of the payload; the loop must not
    /// release it.
    Accepted,
    /// No matching waiter (stale or already cancelled); the loop releases
    /// the payload itself.
    Rejected,
}

/// Block on `port` with a short receive-poll timeout (§4.E, ≈1 s) so the
/// loop notices `running` going false promptly. For each message: classify
/// native vs ours, validate descriptor shape, then route to the ack
/// registry or to `handler` per the ownership-claim protocol.
pub fn receive_loop(
    port: PortId,
    running: &AtomicBool,
    poll_timeout: Duration,
    mut on_ack: impl FnMut(InternalHeader, VmPayload) -> AckOutcome,
    mut handler: impl FnMut(Received) -> bool,
) {
    while running.load(Ordering::Acquire) {
        let raw = match message::receive(port, poll_timeout) {
            Ok(None) => continue,
            Ok(Some(raw)) => raw,
            Err(e) => {
                warn!(error = %e, "receive failed");
                continue;
            }
        };

        let id = MsgId::from_raw(raw.msg_id);
        if !id.is_ours() {
            trace!(msg_id = raw.msg_id, "native kernel notification");
            handler(Received {
                msg_id: id,
                remote_port: raw.remote_port,
                reply_port: raw.local_port,
                capability: None,
                header: None,
                user: None,
            });
            continue;
        }

        let header = match InternalHeader::from_bytes(raw.header.as_slice()) {
            Some(h) => h,
            None => {
                debug!(msg_id = raw.msg_id, "malformed header, discarding");
                continue;
            }
        };

        if id.has(MsgFlag::IsAck) {
            match on_ack(header, raw.user) {
                AckOutcome::Accepted => {
                    trace!(correlation_id = header.correlation_id, "ack accepted by registry");
                    // Registry now owns `raw.user`'s bytes (moved in above);
                    // `raw.header` is still ours to release.
                }
                AckOutcome::Rejected => {
                    debug!(correlation_id = header.correlation_id, "ack had no matching waiter");
                }
            }
            continue;
        }

        let claimed = handler(Received {
            msg_id: id,
            remote_port: raw.remote_port,
            reply_port: raw.local_port,
            capability: raw.capability,
            header: Some(header),
            user: Some(raw.user),
        });
        if claimed {
            trace!(msg_id = raw.msg_id, "handler claimed OOL regions");
        } else {
            trace!(msg_id = raw.msg_id, "loop releasing OOL regions");
        }
        // `raw.header` (the local binding here, via `raw.header.as_slice()`
        // above) still lives on the stack as a `VmPayload` and is released
        // by its own `Drop` regardless of the claim outcome; only the user
        // payload's ownership forks on `claimed`, and that fork happened by
        // moving it into `Received.user` above — if the handler wants to
        // keep it, it must move it out of the `Received` value itself.
    }
}

/// A FIFO single-worker executor: one dedicated thread draining an unbounded
/// channel of boxed work items, guaranteeing per-client (or per-client-
/// runtime) serialization of user callbacks. Grounded on the dispatch-queue
/// shape implied throughout `original_source/src/server.c` and `client.c`.
pub struct SerialQueue {
    sender: Sender<Box<dyn FnOnce() + Send>>,
    worker: Option<JoinHandle<()>>,
}

/// A cloneable handle used by the resource tracker to drain and stop a
/// queue without owning it outright.
#[derive(Clone)]
pub struct SerialQueueHandle {
    inner: Arc<std::sync::Mutex<Option<SerialQueue>>>,
}

impl SerialQueue {
    pub fn new(debug_name: impl Into<String>) -> SerialQueue {
        let debug_name = debug_name.into();
        let (sender, receiver) = unbounded::<Box<dyn FnOnce() + Send>>();
        let worker = std::thread::Builder::new()
            .name(format!("serial-queue-{debug_name}"))
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .expect("failed to spawn serial queue worker");
        SerialQueue { sender, worker: Some(worker) }
    }

    /// Enqueue a work item. Runs strictly after every previously enqueued
    /// item and before every subsequent one.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(job));
    }

    pub fn into_handle(self) -> SerialQueueHandle {
        SerialQueueHandle { inner: Arc::new(std::sync::Mutex::new(Some(self))) }
    }
}

impl SerialQueueHandle {
    /// Synchronously drain all queued work, then stop the worker thread.
    /// Safe to call more than once; the second call is a no-op.
    pub fn drain_and_stop(&self) {
        let mut slot = self.inner.lock().expect("serial queue handle lock poisoned");
        if let Some(queue) = slot.take() {
            drop(queue.sender);
            if let Some(worker) = queue.worker {
                let _ = worker.join();
            }
        }
    }

    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(queue) = self.inner.lock().expect("serial queue handle lock poisoned").as_ref() {
            queue.dispatch(job);
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn header_round_trips_through_bytes() {
        let h = InternalHeader {
            client_id: 7,
            client_slot: 3,
            correlation_id: 99,
            correlation_slot: 2,
            status: Status::SUCCESS.code(),
            user_payload_deadline: 123_456,
            capability_size: 0,
        };
        let bytes = h.to_bytes();
        let back = InternalHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back.client_id, 7);
        assert_eq!(back.correlation_id, 99);
        assert_eq!(back.user_payload_deadline, 123_456);
    }

    #[test]
    fn short_buffer_fails_to_decode() {
        assert!(InternalHeader::from_bytes(&[0u8; 4]).is_none());
    }

    #[test]
    fn serial_queue_runs_jobs_in_fifo_order() {
        let queue = SerialQueue::new("test").into_handle();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicU32::new(0));
        for i in 0..5 {
            let order = order.clone();
            let counter = counter.clone();
            queue.dispatch(move || {
                // Busy-touch a shared counter to make out-of-order execution
                // (if it happened) visible.
                counter.fetch_add(1, Ordering::SeqCst);
                order.lock().unwrap().push(i);
            });
        }
        queue.drain_and_stop();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn drain_and_stop_is_idempotent() {
        let queue = SerialQueue::new("test2").into_handle();
        queue.dispatch(|| {});
        queue.drain_and_stop();
        queue.drain_and_stop();
    }
}
