//! # mach-ipc-fabric
//!
//! A bidirectional, reply-capable, multi-client IPC framework built on macOS
//! Mach kernel primitives: capability-based message ports, out-of-line
//! memory descriptors, port-death notifications, and the bootstrap name
//! service.

pub mod ack;
pub mod client;
pub mod config;
pub mod kernel;
pub mod logging;
pub mod msgid;
pub mod pool;
pub mod resources;
pub mod server;
pub mod shmem;
pub mod slotpool;
pub mod status;
pub mod util;
pub mod wire;

pub use client::{Client, ClientCallbacks};
pub use config::{ClientConfig, ServerConfig};
pub use server::{ClientHandle, Server, ServerCallbacks};
pub use shmem::SharedMemoryHandle;
pub use status::Status;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tunables, mirrored by [`ClientConfig::default`] and
/// [`ServerConfig::default`].
pub mod defaults {
    use std::time::Duration;

    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
    pub const SEND_TIMEOUT: Duration = Duration::from_millis(100);
    pub const RECEIVE_POLL_TIMEOUT: Duration = Duration::from_millis(1_000);
    pub const CLIENT_ACK_POOL_CAPACITY: usize = 64;
    pub const SERVER_ACK_POOL_CAPACITY: usize = 128;
    pub const MAX_CLIENTS: usize = 32;
    pub const REPLY_SAFETY_MARGIN: Duration = Duration::from_millis(10);
}
