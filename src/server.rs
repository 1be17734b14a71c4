//! Server runtime (component H): bootstrap-register a service name, accept
//! connecting clients onto a bounded table with per-client serial dispatch,
//! broadcast, and propagate client death. Grounded on
//! `original_source/src/server.c`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ack::AckRegistry;
use crate::config::ServerConfig;
use crate::kernel::port::{self, PortId};
use crate::kernel::{bootstrap, KernelError};
use crate::msgid::{MsgFlag, MsgId, TYPE_CONNECT};
use crate::resources::{Resource, ResourceTracker};
use crate::slotpool::IndexedSlotPool;
use crate::status::Status;
use crate::util::{self, HeapPayload, VmPayload};
use crate::wire::{self, InternalHeader, Received, SerialQueue, SerialQueueHandle};

const SENTINEL_SLOT: i32 = -1;

/// An opaque reference to a connected client, valid only while that exact
/// client (by id) remains connected; a stale handle from a disconnected
/// client is rejected rather than silently aliasing whatever client now
/// occupies the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    slot: usize,
    client_id: u32,
}

struct ClientRecord {
    client_id: u32,
    /// Send right to the client's local port; also the destination for
    /// server-initiated sends and acks.
    port: PortId,
    queue: SerialQueueHandle,
}

/// The capability set a server dispatches connect/disconnect/message events
/// to. All fields optional.
#[derive(Default)]
pub struct ServerCallbacks {
    pub on_client_connected: Option<Box<dyn Fn(ClientHandle) + Send + Sync>>,
    pub on_client_disconnected: Option<Box<dyn Fn(ClientHandle) + Send + Sync>>,
    pub on_message: Option<Box<dyn Fn(ClientHandle, u8, &[u8]) + Send + Sync>>,
    pub on_message_with_reply:
        Option<Box<dyn Fn(ClientHandle, Option<PortId>, u8, &[u8]) -> (HeapPayload, Status) + Send + Sync>>,
}

impl ServerCallbacks {
    pub fn new() -> ServerCallbacks {
        ServerCallbacks::default()
    }

    pub fn with_on_client_connected(mut self, f: impl Fn(ClientHandle) + Send + Sync + 'static) -> ServerCallbacks {
        self.on_client_connected = Some(Box::new(f));
        self
    }

    pub fn with_on_client_disconnected(
        mut self,
        f: impl Fn(ClientHandle) + Send + Sync + 'static,
    ) -> ServerCallbacks {
        self.on_client_disconnected = Some(Box::new(f));
        self
    }

    pub fn with_on_message(mut self, f: impl Fn(ClientHandle, u8, &[u8]) + Send + Sync + 'static) -> ServerCallbacks {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn with_on_message_with_reply(
        mut self,
        f: impl Fn(ClientHandle, Option<PortId>, u8, &[u8]) -> (HeapPayload, Status) + Send + Sync + 'static,
    ) -> ServerCallbacks {
        self.on_message_with_reply = Some(Box::new(f));
        self
    }
}

pub struct Server {
    config: ServerConfig,
    callbacks: ServerCallbacks,
    service_port: PortId,
    running: AtomicBool,
    clients: IndexedSlotPool<ClientRecord>,
    next_client_id: AtomicU32,
    ack_registry: AckRegistry,
    resources: ResourceTracker,
}

impl Server {
    /// Bootstrap check-in `service_name` and build the client table. Does
    /// not start serving; call [`Server::run`] for that.
    pub fn create(
        service_name: &str,
        config: ServerConfig,
        callbacks: ServerCallbacks,
    ) -> Result<Arc<Server>, Status> {
        let service_port = bootstrap::check_in(service_name).map_err(map_kernel_error)?;
        let resources = ResourceTracker::new();
        resources.add(Resource::Port(service_port), "server-service-port");
        let max_clients = config.max_clients;
        let ack_pool_capacity = config.ack_pool_capacity;
        Ok(Arc::new(Server {
            config,
            callbacks,
            service_port,
            running: AtomicBool::new(true),
            clients: IndexedSlotPool::new(max_clients),
            next_client_id: AtomicU32::new(1),
            ack_registry: AckRegistry::new(ack_pool_capacity),
            resources,
        }))
    }

    /// Run the receive loop on the calling thread until [`Server::stop`] is
    /// called from another thread.
    pub fn run(self: &Arc<Server>) {
        let service_port = self.service_port;
        wire::receive_loop(
            service_port,
            &self.running,
            self.config.receive_poll_timeout,
            |header, user| self.ack_registry.resolve(header, user),
            |received: Received| self.dispatch(received),
        );
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn client_count(&self) -> usize {
        self.clients.active_count()
    }

    pub fn max_clients(&self) -> usize {
        self.clients.capacity()
    }

    pub fn send(&self, handle: ClientHandle, msg_type: u8, bytes: &[u8]) -> Status {
        let Some(port) = self.client_port(handle) else {
            return Status::NOT_CONNECTED;
        };
        let header = InternalHeader {
            client_id: 0,
            client_slot: SENTINEL_SLOT,
            correlation_id: 0,
            correlation_slot: SENTINEL_SLOT,
            status: 0,
            user_payload_deadline: 0,
            capability_size: 0,
        };
        wire::send(port, None, None, MsgId::make_user(msg_type), header, bytes, self.config.send_timeout)
    }

    pub fn send_with_reply(
        &self,
        handle: ClientHandle,
        msg_type: u8,
        bytes: &[u8],
        timeout: Duration,
    ) -> (Status, HeapPayload) {
        let Some(port) = self.client_port(handle) else {
            return (Status::NOT_CONNECTED, Vec::new());
        };
        let Some((correlation_id, slot)) = self.ack_registry.register() else {
            return (Status::INTERNAL, Vec::new());
        };
        let header = InternalHeader {
            client_id: 0,
            client_slot: SENTINEL_SLOT,
            correlation_id,
            correlation_slot: slot as i32,
            status: 0,
            user_payload_deadline: util::calc_deadline(timeout),
            capability_size: 0,
        };
        let id = MsgId::make_user(msg_type).set(MsgFlag::WantAck);
        let send_status =
            wire::send(port, Some(self.service_port), None, id, header, bytes, self.config.send_timeout);
        if !send_status.is_success() {
            self.ack_registry.release(slot);
            return (send_status, Vec::new());
        }
        match self.ack_registry.wait(slot, timeout) {
            Some(reply) => (reply.status, reply.user.to_heap()),
            None => (Status::TIMEOUT, Vec::new()),
        }
    }

    /// Send to every currently connected client, snapshotting the active
    /// set before sending so no client-table lock is held across the I/O.
    /// Returns the last non-success status observed, if any.
    pub fn broadcast(&self, msg_type: u8, bytes: &[u8]) -> Status {
        let ports = self.clients.snapshot(|record| record.port);
        let header = InternalHeader {
            client_id: 0,
            client_slot: SENTINEL_SLOT,
            correlation_id: 0,
            correlation_slot: SENTINEL_SLOT,
            status: 0,
            user_payload_deadline: 0,
            capability_size: 0,
        };
        let id = MsgId::make_user(msg_type);
        let mut last_failure = Status::SUCCESS;
        for port in ports {
            let status = wire::send(port, None, None, id, header, bytes, self.config.send_timeout);
            if !status.is_success() {
                warn!(code = status.code(), "broadcast send failed for one client");
                last_failure = status;
            }
        }
        last_failure
    }

    /// Forcibly disconnect a client: run its disconnect callback, drain its
    /// serial queue, remove it from the table, and release its port.
    pub fn disconnect_client(self: &Arc<Server>, handle: ClientHandle) -> Status {
        let matches = self
            .clients
            .with(handle.slot, |record| record.client_id == handle.client_id)
            .unwrap_or(false);
        if !matches {
            return Status::NOT_CONNECTED;
        }
        self.teardown_client(handle);
        Status::SUCCESS
    }

    /// Stop accepting new work and tear down every remaining client. Does
    /// not join anything: [`Server::run`] must already have returned on its
    /// own thread before calling this.
    pub fn destroy(self: Arc<Server>) {
        self.running.store(false, Ordering::Release);
        for slot in 0..self.clients.capacity() {
            let Some(client_id) = self.clients.with(slot, |record| record.client_id) else {
                continue;
            };
            self.teardown_client(ClientHandle { slot, client_id });
        }
        self.resources.cleanup_all();
    }

    fn client_port(&self, handle: ClientHandle) -> Option<PortId> {
        self.clients
            .with(handle.slot, |record| (record.client_id == handle.client_id).then_some(record.port))
            .flatten()
    }

    fn teardown_client(self: &Arc<Server>, handle: ClientHandle) {
        let queue = self.clients.with(handle.slot, |record| record.queue.clone());
        if let Some(queue) = queue {
            let server = Arc::clone(self);
            queue.dispatch(move || {
                if let Some(cb) = server.callbacks.on_client_disconnected.as_ref() {
                    cb(handle);
                }
            });
            queue.drain_and_stop();
        }
        let port = self.clients.with(handle.slot, |record| record.port);
        self.clients.remove(handle.slot);
        if let Some(mut port) = port {
            port::release_tracked(&mut port, "server-client-port");
        }
    }

    /// Look up a message's sending client by `client_slot`, re-verifying
    /// `client_id` against the slot's current occupant in case of reuse.
    fn lookup_sender(&self, header: &InternalHeader) -> Option<ClientHandle> {
        if header.client_slot < 0 {
            return None;
        }
        let slot = header.client_slot as usize;
        self.clients
            .with(slot, |record| (record.client_id == header.client_id).then_some(()))
            .flatten()
            .map(|()| ClientHandle { slot, client_id: header.client_id })
    }

    fn dispatch(self: &Arc<Server>, received: Received) -> bool {
        if !received.msg_id.is_ours() {
            self.handle_death_notification(received.remote_port);
            return false;
        }

        let Some(header) = received.header else {
            return false;
        };
        let Some(user) = received.user else {
            return false;
        };

        if received.msg_id.is_internal() && received.msg_id.type_of() == TYPE_CONNECT {
            self.handle_connect(received.reply_port, header);
            return true;
        }

        let Some(handle) = self.lookup_sender(&header) else {
            debug!("message from unknown client slot, dropping");
            return false;
        };

        let msg_type = received.msg_id.type_of();
        let want_ack = received.msg_id.has(MsgFlag::WantAck);
        let reply_port = received.reply_port;
        let capability = received.capability;
        let queue = self.clients.with(handle.slot, |record| record.queue.clone());
        let Some(queue) = queue else {
            return false;
        };
        let server = Arc::clone(self);
        queue.dispatch(move || {
            server.handle_queued_message(handle, msg_type, want_ack, reply_port, capability, header, user)
        });
        true
    }

    fn handle_connect(self: &Arc<Server>, reply_port: Option<PortId>, header: InternalHeader) {
        let Some(reply_port) = reply_port else {
            warn!("connect request carried no reply port, ignoring");
            return;
        };

        if self.clients.find(|record| record.port == reply_port).is_some() {
            self.ack_connect(reply_port, header, Status::INTERNAL, 0, SENTINEL_SLOT);
            return;
        }

        let Some(slot) = self.clients.find_free() else {
            self.ack_connect(reply_port, header, Status::CLIENT_FULL, 0, SENTINEL_SLOT);
            return;
        };

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let queue = SerialQueue::new(format!("server-client-{client_id}")).into_handle();
        self.clients.set(slot, ClientRecord { client_id, port: reply_port, queue: queue.clone() });

        if let Err(e) = port::request_dead_name_notification(reply_port, self.service_port) {
            warn!(error = %e, client_id, "failed to arm dead-name notification for new client");
            self.clients.remove(slot);
            queue.drain_and_stop();
            self.ack_connect(reply_port, header, Status::INTERNAL, 0, SENTINEL_SLOT);
            let mut reply_port = reply_port;
            port::release_tracked(&mut reply_port, "server-client-port-rollback");
            return;
        }

        self.ack_connect(reply_port, header, Status::SUCCESS, client_id, slot as i32);
        info!(client_id, slot, "client connected");

        let handle = ClientHandle { slot, client_id };
        let server = Arc::clone(self);
        queue.dispatch(move || {
            if !server.running.load(Ordering::Acquire) {
                return;
            }
            if let Some(cb) = server.callbacks.on_client_connected.as_ref() {
                cb(handle);
            }
        });
    }

    fn ack_connect(&self, reply_port: PortId, header: InternalHeader, status: Status, client_id: u32, client_slot: i32) {
        let ack_header = InternalHeader {
            client_id,
            client_slot,
            correlation_id: header.correlation_id,
            correlation_slot: header.correlation_slot,
            status: status.code(),
            user_payload_deadline: 0,
            capability_size: 0,
        };
        let id = MsgId::make_internal(TYPE_CONNECT).set(MsgFlag::IsAck);
        wire::send(reply_port, None, None, id, ack_header, &[], self.config.send_timeout);
    }

    fn handle_death_notification(self: &Arc<Server>, dead_port: PortId) {
        let Some(slot) = self.clients.find(|record| record.port == dead_port) else {
            return;
        };
        let Some(client_id) = self.clients.with(slot, |record| record.client_id) else {
            return;
        };
        debug!(slot, client_id, "client port died");
        self.teardown_client(ClientHandle { slot, client_id });
    }

    fn handle_queued_message(
        &self,
        handle: ClientHandle,
        msg_type: u8,
        want_ack: bool,
        reply_port: Option<PortId>,
        capability: Option<PortId>,
        header: InternalHeader,
        user: VmPayload,
    ) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if util::is_deadline_expired(header.user_payload_deadline, self.config.reply_safety_margin) {
            if want_ack {
                if let Some(reply_to) = reply_port {
                    self.ack_user_message(reply_to, msg_type, header, Status::TIMEOUT, &[]);
                }
            }
            return;
        }

        // A `SHARE`-flagged message carries its region size in the header,
        // not as OOL bytes (the second descriptor slot is a port descriptor
        // instead); synthesize the bytes a capability-aware handler expects.
        let capability_size_bytes = header.capability_size.to_le_bytes();
        let bytes = if capability.is_some() { &capability_size_bytes[..] } else { user.as_slice() };

        if want_ack {
            let (reply_bytes, status) = match self.callbacks.on_message_with_reply.as_ref() {
                Some(cb) => cb(handle, capability, msg_type, bytes),
                None => {
                    warn!(msg_type, "no reply handler registered for reply-bearing message");
                    (Vec::new(), Status::INTERNAL)
                }
            };
            if let Some(reply_to) = reply_port {
                self.ack_user_message(reply_to, msg_type, header, status, &reply_bytes);
            }
        } else if let Some(cb) = self.callbacks.on_message.as_ref() {
            cb(handle, msg_type, bytes);
        }
        // `user` drops here, releasing the OOL region exactly once.
    }

    fn ack_user_message(&self, reply_to: PortId, msg_type: u8, header: InternalHeader, status: Status, bytes: &[u8]) {
        let ack_header = InternalHeader {
            client_id: 0,
            client_slot: SENTINEL_SLOT,
            correlation_id: header.correlation_id,
            correlation_slot: header.correlation_slot,
            status: status.code(),
            user_payload_deadline: 0,
            capability_size: 0,
        };
        let id = MsgId::make_user(msg_type).set(MsgFlag::IsAck);
        wire::send(reply_to, None, None, id, ack_header, bytes, self.config.send_timeout);
    }
}

fn map_kernel_error(err: KernelError) -> Status {
    warn!(error = %err, "server create failed");
    Status::INTERNAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_handle_equality_is_by_slot_and_id() {
        let a = ClientHandle { slot: 0, client_id: 1 };
        let b = ClientHandle { slot: 0, client_id: 1 };
        let c = ClientHandle { slot: 0, client_id: 2 };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
