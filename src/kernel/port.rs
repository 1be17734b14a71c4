//! Port allocation, right insertion, deallocation/destruct, and port-type
//! query. Grounded on `original_source/src/resources.c`'s `cleanup_port` and
//! the reference Mach-IPC binding's port wrapper style.

#![cfg(target_os = "macos")]

use mach2::kern_return::{kern_return_t, KERN_INVALID_RIGHT, KERN_SUCCESS};
use mach2::mach_port::{self, mach_port_deallocate, mach_port_type};
use mach2::port::{mach_port_name_t, MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE};
use mach2::traps::mach_task_self;
use tracing::{debug, warn};

use super::{KernelError, KernelResult};

/// A raw Mach port name plus a record of which right we believe we hold,
/// used to choose the correct release call at teardown time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortId {
    name: mach_port_name_t,
    pub right: PortRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRight {
    Receive,
    Send,
}

impl PortId {
    pub const fn null() -> PortId {
        PortId { name: MACH_PORT_NULL, right: PortRight::Send }
    }

    pub fn is_null(self) -> bool {
        self.name == MACH_PORT_NULL
    }

    pub fn raw(self) -> mach_port_name_t {
        self.name
    }

    /// Wrap a bare port name returned by a kernel call, recording which
    /// right the caller knows it holds.
    pub fn from_raw(name: mach_port_name_t, right: PortRight) -> PortId {
        PortId { name, right }
    }
}

/// Allocate a receive right in this task.
pub fn allocate_receive() -> KernelResult<PortId> {
    let mut name: mach_port_name_t = MACH_PORT_NULL;
    // SAFETY: `mach_task_self()` is always valid within this process; `name`
    // is an out-param the kernel fills in on success.
    let kr: kern_return_t =
        unsafe { mach_port::mach_port_allocate(mach_task_self(), MACH_PORT_RIGHT_RECEIVE, &mut name) };
    if kr != KERN_SUCCESS {
        return Err(KernelError::PortAllocate(kr));
    }
    Ok(PortId { name, right: PortRight::Receive })
}

/// Insert a `MAKE_SEND` right derived from an owned receive right, so the
/// port can be handed to a peer as a reply channel.
pub fn insert_make_send(port: PortId) -> KernelResult<()> {
    use mach2::message::MACH_MSG_TYPE_MAKE_SEND;
    // SAFETY: `port.name` names a receive right we hold in this task.
    let kr: kern_return_t = unsafe {
        mach_port::mach_port_insert_right(mach_task_self(), port.name, port.name, MACH_MSG_TYPE_MAKE_SEND)
    };
    if kr != KERN_SUCCESS {
        return Err(KernelError::PortInsertRight(kr));
    }
    Ok(())
}

/// Ask the kernel to notify `notify_port` (a receive right we hold) with a
/// `MACH_NOTIFY_DEAD_NAME` message when `watched` becomes a dead name. Used
/// both by clients (watching the server's port) and servers (watching each
/// connected client's port). The previous-notification send right the
/// kernel hands back, if any, is dropped immediately; nothing in this
/// protocol reuses it.
pub fn request_dead_name_notification(watched: PortId, notify_port: PortId) -> KernelResult<()> {
    use mach2::message::MACH_MSG_TYPE_MAKE_SEND_ONCE;
    use mach2::notify::MACH_NOTIFY_DEAD_NAME;

    let mut previous: mach_port_name_t = MACH_PORT_NULL;
    // SAFETY: `watched.name` is a send right we hold (or a port whose death
    // we can legally observe); `notify_port.name` is a receive right we hold
    // to receive the notification on.
    let kr = unsafe {
        mach_port::mach_port_request_notification(
            mach_task_self(),
            watched.name,
            MACH_NOTIFY_DEAD_NAME,
            0,
            notify_port.name,
            MACH_MSG_TYPE_MAKE_SEND_ONCE,
            &mut previous,
        )
    };
    if kr != KERN_SUCCESS {
        return Err(KernelError::RequestNotification(kr));
    }
    if previous != MACH_PORT_NULL {
        // SAFETY: a send-once right the kernel is handing back to us,
        // unrelated to any right this crate tracks elsewhere.
        unsafe {
            let _ = mach_port_deallocate(mach_task_self(), previous);
        }
    }
    Ok(())
}

/// Query whether `name` currently carries a receive right in this task.
pub fn has_receive_right(name: mach_port_name_t) -> bool {
    let mut port_type: mach2::port::mach_port_type_t = 0;
    // SAFETY: read-only query against a port name in this task.
    let kr = unsafe { mach_port_type(mach_task_self(), name, &mut port_type) };
    kr == KERN_SUCCESS && port_type & mach2::port::MACH_PORT_TYPE_RECEIVE != 0
}

/// Release a port by the right recorded in `port`, tolerating
/// `KERN_INVALID_RIGHT` (already cleaned up — benign during shutdown).
/// Mirrors `resources.c`'s `cleanup_port`.
pub fn release_tracked(port: &mut PortId, debug_name: &str) {
    if port.is_null() {
        return;
    }
    let kr = match port.right {
        PortRight::Receive => {
            // SAFETY: `destruct` is valid for a port we believe is a
            // receive right in this task; `KERN_INVALID_RIGHT` below covers
            // the case where it no longer is.
            unsafe { mach_port::mach_port_destruct(mach_task_self(), port.name, 0, 0) }
        }
        PortRight::Send => {
            // SAFETY: deallocating one reference to a send right we hold.
            unsafe { mach_port_deallocate(mach_task_self(), port.name) }
        }
    };
    match kr {
        KERN_SUCCESS => debug!(name = debug_name, "released port"),
        KERN_INVALID_RIGHT => debug!(name = debug_name, "port already released"),
        other => warn!(name = debug_name, code = other, "port release failed"),
    }
    port.name = MACH_PORT_NULL;
}
