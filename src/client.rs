//! Client runtime (component G): connect to a named service, exchange
//! one-way and reply-bearing messages, tear down cleanly on disconnect or
//! server death. Grounded on `original_source/src/client.c`.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ack::AckRegistry;
use crate::config::ClientConfig;
use crate::kernel::port::{self, PortId};
use crate::kernel::{bootstrap, KernelError};
use crate::msgid::{MsgFlag, MsgId, TYPE_CONNECT};
use crate::resources::{Resource, ResourceTracker};
use crate::shmem::SharedMemoryHandle;
use crate::status::Status;
use crate::util::{self, HeapPayload};
use crate::wire::{self, InternalHeader, Received, SerialQueue};

const SENTINEL_SLOT: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Created,
    Connecting,
    Connected,
    Disconnecting,
    Destroyed,
}

/// The capability set a client runtime dispatches incoming events to. All
/// fields are optional; an absent callback means "do nothing".
#[derive(Default)]
pub struct ClientCallbacks {
    pub on_connected: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_disconnected: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_message: Option<Box<dyn Fn(u8, &[u8]) + Send + Sync>>,
    pub on_message_with_reply: Option<Box<dyn Fn(u8, &[u8]) -> (HeapPayload, Status) + Send + Sync>>,
}

impl ClientCallbacks {
    pub fn new() -> ClientCallbacks {
        ClientCallbacks::default()
    }

    pub fn with_on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> ClientCallbacks {
        self.on_connected = Some(Box::new(f));
        self
    }

    pub fn with_on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> ClientCallbacks {
        self.on_disconnected = Some(Box::new(f));
        self
    }

    pub fn with_on_message(mut self, f: impl Fn(u8, &[u8]) + Send + Sync + 'static) -> ClientCallbacks {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn with_on_message_with_reply(
        mut self,
        f: impl Fn(u8, &[u8]) -> (HeapPayload, Status) + Send + Sync + 'static,
    ) -> ClientCallbacks {
        self.on_message_with_reply = Some(Box::new(f));
        self
    }
}

/// A connected (or connecting/disconnected) client runtime. Create with
/// [`Client::create`], then [`Client::connect`].
pub struct Client {
    config: ClientConfig,
    callbacks: ClientCallbacks,
    state: StdMutex<ClientState>,
    running: AtomicBool,
    local_port: StdMutex<PortId>,
    server_port: StdMutex<PortId>,
    client_id: AtomicU32,
    client_slot: AtomicI32,
    ack_registry: AckRegistry,
    queue: wire::SerialQueueHandle,
    resources: ResourceTracker,
    receiver: StdMutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn create(config: ClientConfig, callbacks: ClientCallbacks) -> Arc<Client> {
        let ack_pool_capacity = config.ack_pool_capacity;
        Arc::new(Client {
            config,
            callbacks,
            state: StdMutex::new(ClientState::Created),
            running: AtomicBool::new(false),
            local_port: StdMutex::new(PortId::null()),
            server_port: StdMutex::new(PortId::null()),
            client_id: AtomicU32::new(0),
            client_slot: AtomicI32::new(SENTINEL_SLOT),
            ack_registry: AckRegistry::new(ack_pool_capacity),
            queue: SerialQueue::new("client").into_handle(),
            resources: ResourceTracker::new(),
            receiver: StdMutex::new(None),
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.state.lock().expect("client state lock poisoned") == ClientState::Connected
    }

    /// Bootstrap-look-up `service_name`, perform the connect handshake, and
    /// start the receiver thread. On any failure the client returns to
    /// `created`, with every resource acquired along the way released.
    pub fn connect(self: &Arc<Client>, service_name: &str, timeout: Duration) -> Status {
        {
            let mut state = self.state.lock().expect("client state lock poisoned");
            if *state != ClientState::Created {
                return Status::INTERNAL;
            }
            *state = ClientState::Connecting;
        }

        match self.connect_inner(service_name, timeout) {
            Ok(status) => status,
            Err(status) => {
                *self.state.lock().expect("client state lock poisoned") = ClientState::Created;
                status
            }
        }
    }

    fn connect_inner(self: &Arc<Client>, service_name: &str, timeout: Duration) -> Result<Status, Status> {
        let server_port = bootstrap::look_up(service_name).map_err(map_kernel_error)?;
        self.resources.add(Resource::Port(server_port), "client-server-port");
        *self.server_port.lock().expect("client server_port lock poisoned") = server_port;

        let local_port = port::allocate_receive().map_err(map_kernel_error)?;
        self.resources.add(Resource::Port(local_port), "client-local-port");
        port::insert_make_send(local_port).map_err(map_kernel_error)?;
        *self.local_port.lock().expect("client local_port lock poisoned") = local_port;

        port::request_dead_name_notification(server_port, local_port).map_err(map_kernel_error)?;

        self.running.store(true, Ordering::Release);
        let receiver_self = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("client-receiver".to_string())
            .spawn(move || receiver_self.receive_loop())
            .expect("failed to spawn client receiver thread");
        *self.receiver.lock().expect("client receiver lock poisoned") = Some(handle);

        let (correlation_id, slot) = self
            .ack_registry
            .register()
            .ok_or(Status::INTERNAL)?;

        let header = InternalHeader {
            client_id: 0,
            client_slot: SENTINEL_SLOT,
            correlation_id,
            correlation_slot: slot as i32,
            status: 0,
            user_payload_deadline: 0,
            capability_size: 0,
        };
        let id = MsgId::make_internal(TYPE_CONNECT).set(MsgFlag::WantAck);
        let send_status =
            wire::send(server_port, Some(local_port), None, id, header, &[], self.config.send_timeout);
        if !send_status.is_success() {
            self.ack_registry.release(slot);
            return Ok(send_status);
        }

        let reply = self.ack_registry.wait(slot, timeout);
        let Some(reply) = reply else {
            return Ok(Status::TIMEOUT);
        };

        if !reply.status.is_success() {
            return Ok(reply.status);
        }

        self.client_id.store(reply.header.client_id, Ordering::Release);
        self.client_slot.store(reply.header.client_slot, Ordering::Release);
        *self.state.lock().expect("client state lock poisoned") = ClientState::Connected;
        info!(client_id = reply.header.client_id, "connected");

        if let Some(cb) = self.callbacks.on_connected.as_ref() {
            cb();
        }
        Ok(Status::SUCCESS)
    }

    pub fn send(&self, msg_type: u8, bytes: &[u8]) -> Status {
        if !self.is_connected() {
            return Status::NOT_CONNECTED;
        }
        let header = InternalHeader {
            client_id: self.client_id.load(Ordering::Acquire),
            client_slot: self.client_slot.load(Ordering::Acquire),
            correlation_id: 0,
            correlation_slot: SENTINEL_SLOT,
            status: 0,
            user_payload_deadline: 0,
            capability_size: 0,
        };
        let id = MsgId::make_user(msg_type);
        wire::send(self.server_port(), None, None, id, header, bytes, self.config.send_timeout)
    }

    pub fn send_with_reply(&self, msg_type: u8, bytes: &[u8], timeout: Duration) -> (Status, HeapPayload) {
        if !self.is_connected() {
            return (Status::NOT_CONNECTED, Vec::new());
        }
        let Some((correlation_id, slot)) = self.ack_registry.register() else {
            return (Status::INTERNAL, Vec::new());
        };
        let header = InternalHeader {
            client_id: self.client_id.load(Ordering::Acquire),
            client_slot: self.client_slot.load(Ordering::Acquire),
            correlation_id,
            correlation_slot: slot as i32,
            status: 0,
            user_payload_deadline: util::calc_deadline(timeout),
            capability_size: 0,
        };
        let id = MsgId::make_user(msg_type).set(MsgFlag::WantAck);
        let send_status = wire::send(
            self.server_port(),
            Some(self.local_reply_port()),
            None,
            id,
            header,
            bytes,
            self.config.send_timeout,
        );
        if !send_status.is_success() {
            self.ack_registry.release(slot);
            return (send_status, Vec::new());
        }
        match self.ack_registry.wait(slot, timeout) {
            Some(reply) => (reply.status, reply.user.to_heap()),
            None => (Status::TIMEOUT, Vec::new()),
        }
    }

    /// Transfer a shared-memory capability to the server, tagging the
    /// message with the `SHARE` flag. The capability rides a `COPY_SEND`
    /// port descriptor in the message body (§6) — the local-port slot is
    /// left free, since this variant carries no reply channel. The region's
    /// byte size travels in the header, not as OOL bytes.
    pub fn send_with_capability(&self, shmem: &SharedMemoryHandle, msg_type: u8) -> Status {
        if !self.is_connected() {
            return Status::NOT_CONNECTED;
        }
        let header = InternalHeader {
            client_id: self.client_id.load(Ordering::Acquire),
            client_slot: self.client_slot.load(Ordering::Acquire),
            correlation_id: 0,
            correlation_slot: SENTINEL_SLOT,
            status: 0,
            user_payload_deadline: 0,
            capability_size: shmem.size() as u64,
        };
        let id = MsgId::make_user(msg_type).set(MsgFlag::Share);
        wire::send(self.server_port(), None, Some(shmem.port()), id, header, &[], self.config.send_timeout)
    }

    /// As [`Client::send_with_capability`], but also attaches this client's
    /// reply channel via the local-port slot and waits for an ack — the
    /// capability travels separately as a port descriptor, so it never
    /// displaces the reply channel.
    pub fn send_with_capability_and_reply(
        &self,
        shmem: &SharedMemoryHandle,
        msg_type: u8,
        timeout: Duration,
    ) -> (Status, HeapPayload) {
        if !self.is_connected() {
            return (Status::NOT_CONNECTED, Vec::new());
        }
        let Some((correlation_id, slot)) = self.ack_registry.register() else {
            return (Status::INTERNAL, Vec::new());
        };
        let header = InternalHeader {
            client_id: self.client_id.load(Ordering::Acquire),
            client_slot: self.client_slot.load(Ordering::Acquire),
            correlation_id,
            correlation_slot: slot as i32,
            status: 0,
            user_payload_deadline: util::calc_deadline(timeout),
            capability_size: shmem.size() as u64,
        };
        let id = MsgId::make_user(msg_type).set(MsgFlag::WantAck).set(MsgFlag::Share);
        let send_status = wire::send(
            self.server_port(),
            Some(self.local_reply_port()),
            Some(shmem.port()),
            id,
            header,
            &[],
            self.config.send_timeout,
        );
        if !send_status.is_success() {
            self.ack_registry.release(slot);
            return (send_status, Vec::new());
        }
        match self.ack_registry.wait(slot, timeout) {
            Some(reply) => (reply.status, reply.user.to_heap()),
            None => (Status::TIMEOUT, Vec::new()),
        }
    }

    /// Stop the receiver and mark the client no longer connected. The
    /// receiver thread itself exits on its next poll; join it in
    /// [`Client::destroy`].
    pub fn disconnect(&self) -> Status {
        let mut state = self.state.lock().expect("client state lock poisoned");
        if *state != ClientState::Connected {
            return Status::NOT_CONNECTED;
        }
        *state = ClientState::Disconnecting;
        drop(state);
        self.running.store(false, Ordering::Release);
        if let Some(cb) = self.callbacks.on_disconnected.as_ref() {
            cb();
        }
        Status::SUCCESS
    }

    /// Join the receiver thread, drain the user callback queue, and release
    /// every tracked resource. Consumes the runtime.
    pub fn destroy(self: Arc<Client>) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.receiver.lock().expect("client receiver lock poisoned").take() {
            let _ = handle.join();
        }
        self.queue.drain_and_stop();
        self.resources.cleanup_all();
        *self.state.lock().expect("client state lock poisoned") = ClientState::Destroyed;
    }

    fn server_port(&self) -> PortId {
        *self.server_port.lock().expect("client server_port lock poisoned")
    }

    fn local_reply_port(&self) -> PortId {
        *self.local_port.lock().expect("client local_port lock poisoned")
    }

    fn receive_loop(self: Arc<Client>) {
        let port = self.local_reply_port();
        let poll_timeout = self.config.receive_poll_timeout;

        wire::receive_loop(
            port,
            &self.running,
            poll_timeout,
            |header, user| self.ack_registry.resolve(header, user),
            |received: Received| self.dispatch(received),
        );
    }

    /// Handle one message delivered to the receiver thread: a death
    /// notification for the server's port, or a server-initiated user
    /// message. User-facing work is handed to the client's serial queue so
    /// the receiver thread never blocks on callback execution; returns
    /// `true` (claimed) whenever the queue took ownership of the OOL user
    /// payload, `false` when there was nothing to claim.
    fn dispatch(self: &Arc<Client>, received: Received) -> bool {
        if !received.msg_id.is_ours() {
            debug!("server port died, disconnecting");
            self.running.store(false, Ordering::Release);
            *self.state.lock().expect("client state lock poisoned") = ClientState::Disconnecting;
            if let Some(cb) = self.callbacks.on_disconnected.as_ref() {
                cb();
            }
            return false;
        }

        let Some(header) = received.header else {
            return false;
        };
        let Some(user) = received.user else {
            return false;
        };

        let msg_type = received.msg_id.type_of();
        let want_ack = received.msg_id.has(MsgFlag::WantAck);
        let reply_port = received.reply_port;
        let client = Arc::clone(self);
        self.queue.dispatch(move || client.handle_queued_message(msg_type, want_ack, reply_port, header, user));
        true
    }

    fn handle_queued_message(
        &self,
        msg_type: u8,
        want_ack: bool,
        reply_port: Option<PortId>,
        header: InternalHeader,
        user: util::VmPayload,
    ) {
        if want_ack {
            let (reply_bytes, status) = match self.callbacks.on_message_with_reply.as_ref() {
                Some(cb) => cb(msg_type, user.as_slice()),
                None => {
                    warn!(msg_type, "no reply handler registered for reply-bearing message");
                    (Vec::new(), Status::INTERNAL)
                }
            };
            if let Some(reply_to) = reply_port {
                let ack_header = InternalHeader {
                    client_id: self.client_id.load(Ordering::Acquire),
                    client_slot: self.client_slot.load(Ordering::Acquire),
                    correlation_id: header.correlation_id,
                    correlation_slot: header.correlation_slot,
                    status: status.code(),
                    user_payload_deadline: 0,
                    capability_size: 0,
                };
                let ack_id = MsgId::make_user(msg_type).set(MsgFlag::IsAck);
                wire::send(reply_to, None, None, ack_id, ack_header, &reply_bytes, self.config.send_timeout);
            }
        } else if let Some(cb) = self.callbacks.on_message.as_ref() {
            cb(msg_type, user.as_slice());
        }
        // `user` drops here, releasing the OOL region exactly once.
    }
}

fn map_kernel_error(err: KernelError) -> Status {
    warn!(error = %err, "client connect failed");
    match err {
        KernelError::BootstrapLookup { .. } => Status::NOT_CONNECTED,
        _ => Status::INTERNAL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_is_not_connected() {
        let client = Client::create(ClientConfig::default(), ClientCallbacks::new());
        assert!(!client.is_connected());
    }

    #[test]
    fn send_before_connect_is_not_connected() {
        let client = Client::create(ClientConfig::default(), ClientCallbacks::new());
        assert_eq!(client.send(1, b"hi"), Status::NOT_CONNECTED);
    }

    #[test]
    fn send_with_reply_before_connect_is_not_connected() {
        let client = Client::create(ClientConfig::default(), ClientCallbacks::new());
        let (status, bytes) = client.send_with_reply(1, b"hi", Duration::from_millis(10));
        assert_eq!(status, Status::NOT_CONNECTED);
        assert!(bytes.is_empty());
    }
}
