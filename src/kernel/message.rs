//! Build and send/receive the two-OOL-descriptor complex message that
//! carries every protocol and user message. Grounded on
//! `original_source/src/protocol.c` (`protocol_send_message`,
//! `protocol_receive_loop`) and the reference Mach-IPC binding's `msg!`/
//! `kern!` macro style for wrapping individual syscalls.

#![cfg(target_os = "macos")]

use std::ffi::c_void;
use std::time::Duration;

use mach2::kern_return::KERN_SUCCESS;
use mach2::message::{
    self, mach_msg_bits_t, mach_msg_body_t, mach_msg_header_t, mach_msg_id_t, mach_msg_option_t,
    mach_msg_size_t, mach_msg_type_name_t, MACH_MSGH_BITS_COMPLEX, MACH_MSG_TIMEOUT_NONE,
    MACH_MSG_TYPE_COPY_SEND, MACH_MSG_TYPE_MAKE_SEND, MACH_RCV_MSG, MACH_RCV_TIMEOUT,
    MACH_RCV_TIMED_OUT, MACH_SEND_MSG, MACH_SEND_TIMED_OUT, MACH_SEND_TIMEOUT,
};
use mach2::notify::MACH_NOTIFY_DEAD_NAME;
use mach2::port::{mach_port_name_t, MACH_PORT_NULL};

use super::port::{PortId, PortRight};
use super::{KernelError, KernelResult};

/// `mach_msg_descriptor_type_t::MACH_MSG_PORT_DESCRIPTOR`.
const MACH_MSG_PORT_DESCRIPTOR: u8 = 0;
/// `mach_msg_descriptor_type_t::MACH_MSG_OOL_DESCRIPTOR`.
const MACH_MSG_OOL_DESCRIPTOR: u8 = 1;
/// `mach_msg_copy_options_t::MACH_MSG_PHYSICAL_COPY`: the kernel copies the
/// bytes rather than remapping VM, which is appropriate for the small,
/// non-page-aligned heap buffers the protocol header and most user payloads
/// are.
const MACH_MSG_PHYSICAL_COPY: u8 = 0;

/// Layout-compatible with the LP64 `mach_msg_ool_descriptor_t` quoted by the
/// platform headers: address, then a packed deallocate/copy/pad/type word,
/// then size. 16 bytes, matching the `mach_msg_descriptor_t` union stride.
#[repr(C)]
#[derive(Clone, Copy)]
struct OolDescriptor {
    address: *mut c_void,
    packed: u32,
    size: mach_msg_size_t,
}

impl OolDescriptor {
    fn new(address: *mut c_void, size: u32, deallocate: bool) -> OolDescriptor {
        let packed = (deallocate as u32)
            | (MACH_MSG_PHYSICAL_COPY as u32) << 8
            | (MACH_MSG_OOL_DESCRIPTOR as u32) << 24;
        OolDescriptor { address, packed, size }
    }

    fn empty() -> OolDescriptor {
        OolDescriptor::new(std::ptr::null_mut(), 0, false)
    }
}

/// Layout-compatible with userspace `mach_msg_port_descriptor_t`: a port
/// name, then a size-shaped pad field the kernel ignores on this slot, then
/// a packed pad/disposition/type word. Hand-padded with a trailing reserved
/// word to reach the same 16-byte union stride as [`OolDescriptor`], since
/// this struct (12 "real" bytes) would otherwise undersize the slot when
/// overlaid in [`SecondDescriptor`].
#[repr(C)]
#[derive(Clone, Copy)]
struct PortDescriptor {
    name: mach_port_name_t,
    pad1: mach_msg_size_t,
    packed: u32,
    _reserved: u32,
}

impl PortDescriptor {
    fn new(name: mach_port_name_t, disposition: mach_msg_type_name_t) -> PortDescriptor {
        let packed = ((disposition as u32) << 16) | (MACH_MSG_PORT_DESCRIPTOR as u32) << 24;
        PortDescriptor { name, pad1: 0, packed, _reserved: 0 }
    }
}

/// The second descriptor slot is either a plain OOL byte region (the common
/// case: a user payload) or a port descriptor (a transferred capability,
/// §6). Both variants place their type tag in the top byte of a `packed`
/// field at the same struct offset, so the receiver can inspect that tag
/// before deciding which union arm to read.
#[repr(C)]
union SecondDescriptor {
    ool: OolDescriptor,
    port: PortDescriptor,
}

/// The on-wire envelope: header, descriptor count, the protocol-header OOL
/// descriptor, then the second slot (user payload bytes, or a transferred
/// capability). Mirrors `internal.h`'s `internal_mach_msg_t`, generalized
/// for the capability case.
#[repr(C)]
struct Envelope {
    header: mach_msg_header_t,
    body: mach_msg_body_t,
    payload: OolDescriptor,
    second: SecondDescriptor,
}

/// A fully received message: the sender/msg-id metadata plus the OOL header
/// region, still kernel-VM-backed (not copied) so the usual
/// claimed-by-handler-or-released-by-the-loop ownership discipline applies
/// to the real mapping, not a throwaway copy. Exactly one of `user`'s bytes
/// being non-empty or `capability` being `Some` holds for a complex message;
/// neither does for a native kernel notification.
pub struct RawMessage {
    pub msg_id: u32,
    pub remote_port: PortId,
    /// Present only when the sender attached a local port as a reply
    /// channel.
    pub local_port: Option<PortId>,
    /// A transferred capability's send right, carried as a port descriptor
    /// in the second slot instead of OOL bytes (§6).
    pub capability: Option<PortId>,
    pub header: crate::util::VmPayload,
    pub user: crate::util::VmPayload,
}

/// Body of a `MACH_NOTIFY_DEAD_NAME` notification: an 8-byte NDR record
/// followed by the dead port's name. Mirrors `mach_dead_name_notification_t`
/// (the only field this protocol reads is `not_port`); `msgh_remote_port` is
/// null on a notification, so this is the only place the dead name appears.
#[repr(C)]
#[derive(Clone, Copy)]
struct DeadNameNotificationBody {
    _ndr: [u8; 8],
    not_port: mach_port_name_t,
}

/// Send a complex message carrying `header_bytes` as the first OOL region.
/// `reply_port` is attached as the message's local port field when the
/// sender wants a reply channel; it is never displaced by `capability`.
/// When `capability` is set, it rides as a `COPY_SEND` port descriptor in
/// the second slot (the sender already holds a send right for it, e.g. a
/// memory-object port, and keeps using it after the call) and `user_bytes`
/// is ignored; otherwise the second slot carries `user_bytes` as OOL bytes.
pub fn send(
    dest: PortId,
    reply_port: Option<PortId>,
    capability: Option<PortId>,
    msg_id: u32,
    header_bytes: &[u8],
    user_bytes: &[u8],
    timeout: Duration,
) -> KernelResult<()> {
    let mut header_copy = header_bytes.to_vec();
    let mut user_copy = user_bytes.to_vec();

    let local_port = reply_port.map(|p| p.raw()).unwrap_or(MACH_PORT_NULL);
    let msgh_bits: mach_msg_bits_t = MACH_MSGH_BITS_COMPLEX
        | MACH_MSG_TYPE_COPY_SEND
        | (if reply_port.is_some() { MACH_MSG_TYPE_MAKE_SEND << 8 } else { 0 });

    let second = match capability {
        Some(cap) => SecondDescriptor { port: PortDescriptor::new(cap.raw(), MACH_MSG_TYPE_COPY_SEND) },
        None => {
            SecondDescriptor { ool: OolDescriptor::new(user_copy.as_mut_ptr() as *mut c_void, user_copy.len() as u32, false) }
        }
    };

    let mut envelope = Envelope {
        header: mach_msg_header_t {
            msgh_bits,
            msgh_size: std::mem::size_of::<Envelope>() as mach_msg_size_t,
            msgh_remote_port: dest.raw(),
            msgh_local_port: local_port,
            msgh_voucher_port: 0,
            msgh_id: msg_id as mach_msg_id_t,
        },
        body: mach_msg_body_t { msgh_descriptor_count: 2 },
        payload: OolDescriptor::new(header_copy.as_mut_ptr() as *mut c_void, header_copy.len() as u32, false),
        second,
    };

    let opts: mach_msg_option_t = MACH_SEND_MSG | MACH_SEND_TIMEOUT;
    // SAFETY: `envelope` is a fully initialized, correctly sized message
    // buffer living on this stack frame for the duration of the call; the
    // first OOL descriptor points at `header_copy`, which outlives the call;
    // the second slot either names `user_copy` (same guarantee) or a port
    // the caller already owns a send right to. `mach_msg` only reads from
    // the send side here.
    let kr = unsafe {
        message::mach_msg(
            &mut envelope.header,
            opts,
            envelope.header.msgh_size,
            0,
            MACH_PORT_NULL,
            timeout.as_millis() as u32,
            MACH_PORT_NULL,
        )
    };

    match kr {
        KERN_SUCCESS => Ok(()),
        MACH_SEND_TIMED_OUT => Err(KernelError::SendTimedOut),
        other => Err(KernelError::MessageSend(other)),
    }
}

/// Receive one message on `port`, with a bounded poll timeout so a caller
/// loop can re-check a shutdown flag. Returns `Ok(None)` on timeout (not an
/// error condition).
pub fn receive(port: PortId, timeout: Duration) -> KernelResult<Option<RawMessage>> {
    const RCV_BUFFER_SIZE: usize = std::mem::size_of::<Envelope>() + 1024;
    let mut buffer = vec![0u8; RCV_BUFFER_SIZE];
    let header_ptr = buffer.as_mut_ptr() as *mut mach_msg_header_t;

    let opts: mach_msg_option_t = MACH_RCV_MSG | MACH_RCV_TIMEOUT;
    // SAFETY: `buffer` is sized to hold the largest envelope this protocol
    // sends plus slack for trailers; `mach_msg` writes the received message
    // (header + inline trailer) into it and returns before we interpret the
    // bytes.
    let kr = unsafe {
        message::mach_msg(
            header_ptr,
            opts,
            0,
            RCV_BUFFER_SIZE as mach_msg_size_t,
            port.raw(),
            timeout.as_millis() as u32,
            MACH_PORT_NULL,
        )
    };

    match kr {
        KERN_SUCCESS => {}
        MACH_RCV_TIMED_OUT => return Ok(None),
        other => return Err(KernelError::MessageReceive(other)),
    }

    // SAFETY: the kernel just populated `buffer` with a successfully
    // received message of at least `size_of::<mach_msg_header_t>()` bytes;
    // if it set the complex bit, a full `Envelope` follows.
    let header = unsafe { std::ptr::read(header_ptr) };
    let msg_id = header.msgh_id as u32;
    let mut remote_port = PortId::from_raw(header.msgh_remote_port, PortRight::Send);
    let local_port = if header.msgh_local_port != MACH_PORT_NULL {
        Some(PortId::from_raw(header.msgh_local_port, PortRight::Send))
    } else {
        None
    };

    if header.msgh_bits & MACH_MSGH_BITS_COMPLEX == 0 {
        // A native, non-complex notification. `MACH_NOTIFY_DEAD_NAME` in
        // particular carries the dead port's name in its body, not in
        // `msgh_remote_port` (which is null here) — read it from there.
        if msg_id == MACH_NOTIFY_DEAD_NAME as u32 {
            // SAFETY: the kernel filled in at least a `mach_msg_header_t`
            // plus this notification's fixed body; `header_ptr.add(1)`
            // addresses the bytes immediately following the header, and
            // `buffer` was sized well beyond `size_of::<DeadNameNotificationBody>()`.
            let body = unsafe { std::ptr::read_unaligned(header_ptr.add(1) as *const DeadNameNotificationBody) };
            remote_port = PortId::from_raw(body.not_port, PortRight::Send);
        }
        return Ok(Some(RawMessage {
            msg_id,
            remote_port,
            local_port,
            capability: None,
            header: empty_payload(),
            user: empty_payload(),
        }));
    }

    // SAFETY: complex bit was set and our own protocol always sends exactly
    // our `Envelope` shape when that's true; `buffer` is large enough.
    let envelope = unsafe { &*(buffer.as_ptr() as *const Envelope) };
    if envelope.body.msgh_descriptor_count != 2 {
        return Err(KernelError::MalformedMessage("expected exactly 2 descriptors"));
    }
    if envelope.payload.packed >> 24 != MACH_MSG_OOL_DESCRIPTOR as u32 {
        return Err(KernelError::MalformedMessage("first descriptor kind was not OOL"));
    }

    // SAFETY: the first OOL descriptor names a region the kernel mapped
    // into this task's address space as part of delivering the message;
    // ownership transfers to the `VmPayload`, whose `Drop` releases it via
    // `vm_deallocate` unless something downstream (the ack registry, a
    // claiming handler) takes it over first via `into_raw`.
    let header_payload = unsafe { region_to_payload(envelope.payload.address, envelope.payload.size as usize) };

    // SAFETY: reading `packed` through either union arm is sound here: both
    // `OolDescriptor` and `PortDescriptor` place that field at the same
    // struct offset, so the byte pattern is identical regardless of which
    // arm the sender actually wrote; this read only inspects the tag byte
    // before committing to an arm.
    let second_tag = unsafe { envelope.second.ool.packed } >> 24;
    if second_tag == MACH_MSG_PORT_DESCRIPTOR as u32 {
        // SAFETY: tag confirmed this slot holds a `PortDescriptor`; the
        // named port is a send right delivered to this task by the kernel
        // as part of the message.
        let port = unsafe { envelope.second.port.name };
        Ok(Some(RawMessage {
            msg_id,
            remote_port,
            local_port,
            capability: Some(PortId::from_raw(port, PortRight::Send)),
            header: header_payload,
            user: empty_payload(),
        }))
    } else if second_tag == MACH_MSG_OOL_DESCRIPTOR as u32 {
        // SAFETY: tag confirmed this slot holds an `OolDescriptor` naming a
        // region the kernel mapped into this task; same ownership-transfer
        // reasoning as `header_payload` above.
        let user = unsafe { region_to_payload(envelope.second.ool.address, envelope.second.ool.size as usize) };
        Ok(Some(RawMessage { msg_id, remote_port, local_port, capability: None, header: header_payload, user }))
    } else {
        Err(KernelError::MalformedMessage("second descriptor kind was neither OOL nor a port"))
    }
}

fn empty_payload() -> crate::util::VmPayload {
    // SAFETY: a null/zero-length region is never dereferenced by `VmPayload`.
    unsafe { crate::util::VmPayload::from_raw(std::ptr::null_mut(), 0) }
}

unsafe fn region_to_payload(address: *mut c_void, size: usize) -> crate::util::VmPayload {
    if address.is_null() || size == 0 {
        return empty_payload();
    }
    crate::util::VmPayload::from_raw(address as *mut u8, size)
}

// `MACH_MSG_TIMEOUT_NONE` is unused once every call path specifies an
// explicit bounded timeout (send timeout, receive-poll timeout); kept as a
// named re-export for callers that construct a one-off unbounded wait
// outside this module (none currently do).
#[allow(dead_code)]
pub const NO_TIMEOUT: u32 = MACH_MSG_TIMEOUT_NONE;
