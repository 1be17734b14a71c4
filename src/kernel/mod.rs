//! Kernel binding (component K, supplemental): the concrete Rust face of the
//! fixed collaborator named in the purpose section — port allocation,
//! send/receive, OOL descriptors, dead-name notifications, bootstrap
//! lookup/check-in, memory-entry creation, VM map/deallocate.
//!
//! Every other module in this crate operates on the safe types defined here
//! (`PortId`, `KernelError`, `OwnedMessage`) and never touches `mach2`
//! directly. This module is the only place raw pointers and FFI types
//! appear; each `unsafe` block is scoped to a single kernel call.

pub mod bootstrap;
pub mod memory;
pub mod message;
pub mod port;

use thiserror::Error;

/// Names the fallible kernel operations this crate depends on, each carrying
/// the raw return code the platform gave back.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("port allocate failed: {0}")]
    PortAllocate(i32),
    #[error("port insert right failed: {0}")]
    PortInsertRight(i32),
    #[error("port deallocate failed: {0}")]
    PortDeallocate(i32),
    #[error("port destruct failed: {0}")]
    PortDestruct(i32),
    #[error("dead-name notification request failed: {0}")]
    RequestNotification(i32),
    #[error("bootstrap check-in failed for {name:?}: {code}")]
    BootstrapCheckIn { name: String, code: i32 },
    #[error("bootstrap look-up failed for {name:?}: {code}")]
    BootstrapLookup { name: String, code: i32 },
    #[error("message send failed: {0}")]
    MessageSend(i32),
    #[error("message send timed out")]
    SendTimedOut,
    #[error("message receive failed: {0}")]
    MessageReceive(i32),
    #[error("message receive timed out")]
    ReceiveTimedOut,
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),
    #[error("vm allocate failed: {0}")]
    VmAllocate(i32),
    #[error("vm deallocate failed: {0}")]
    VmDeallocate(i32),
    #[error("memory entry create failed: {0}")]
    MemoryEntryCreate(i32),
    #[error("vm map failed: {0}")]
    VmMap(i32),
}

pub type KernelResult<T> = Result<T, KernelError>;
