//! VM allocate/deallocate and memory-entry creation/mapping, backing the
//! shared-memory handle (component D) and the release path for kernel-VM
//! payload memory. Grounded on
//! `original_source/include/mach_ipc.h`'s `shared_memory_t` API.

#![cfg(target_os = "macos")]

use mach2::kern_return::KERN_SUCCESS;
use mach2::port::mach_port_t;
use mach2::traps::mach_task_self;
use mach2::vm::{mach_vm_allocate, mach_vm_deallocate};
use mach2::vm_inherit::VM_INHERIT_NONE;
use mach2::vm_prot::{VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_statistics::VM_FLAGS_ANYWHERE;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use tracing::warn;

use super::port::{PortId, PortRight};
use super::{KernelError, KernelResult};

/// Allocate a fresh, zero-filled VM region of at least `size` bytes.
pub fn vm_allocate(size: usize) -> KernelResult<(mach_vm_address_t, usize)> {
    let mut address: mach_vm_address_t = 0;
    // SAFETY: allocating into our own task; `address` is an out-param.
    let kr = unsafe {
        mach_vm_allocate(mach_task_self(), &mut address, size as mach_vm_size_t, VM_FLAGS_ANYWHERE)
    };
    if kr != KERN_SUCCESS {
        return Err(KernelError::VmAllocate(kr));
    }
    Ok((address, size))
}

/// Release a VM region previously obtained from [`vm_allocate`] or a
/// mapping from [`map_memory_entry`].
pub fn vm_deallocate(address: mach_vm_address_t, size: usize) -> KernelResult<()> {
    // SAFETY: caller guarantees `address`/`size` describe a region this task
    // owns (allocated or mapped by this module).
    let kr = unsafe { mach_vm_deallocate(mach_task_self(), address, size as mach_vm_size_t) };
    if kr != KERN_SUCCESS {
        return Err(KernelError::VmDeallocate(kr));
    }
    Ok(())
}

/// Release kernel-VM-backed payload memory, tolerating failure the way the
/// resource tracker tolerates `KERN_INVALID_RIGHT` on ports: log and move on
/// rather than panicking from a `Drop` impl.
pub fn vm_deallocate_payload(ptr: *mut u8, len: usize) {
    if let Err(e) = vm_deallocate(ptr as mach_vm_address_t, len) {
        warn!(error = %e, "failed to release OOL payload memory");
    }
}

/// Wrap an owned VM region in a memory-object capability with read+write
/// protection, retaining owner-mode (the handle stays mapped in this task).
pub fn make_memory_entry(address: mach_vm_address_t, size: usize) -> KernelResult<PortId> {
    use mach2::vm::mach_make_memory_entry_64;

    let mut entry_size: mach_vm_size_t = size as mach_vm_size_t;
    let mut mem_object: mach_port_t = 0;
    // SAFETY: `address`/`size` describe a region this task owns (from
    // `vm_allocate`); `entry_size`/`mem_object` are out-params the kernel
    // fills in on success. Parent entry `0` means "derive from our task's
    // own VM map".
    let kr = unsafe {
        mach_make_memory_entry_64(
            mach_task_self(),
            &mut entry_size,
            address,
            VM_PROT_READ | VM_PROT_WRITE,
            &mut mem_object,
            0,
        )
    };
    if kr != KERN_SUCCESS {
        return Err(KernelError::MemoryEntryCreate(kr));
    }
    Ok(PortId::from_raw(mem_object, PortRight::Send))
}

/// Map an incoming memory-object capability into this task's address space
/// anywhere, with read+write protection, retaining consumer-mode.
pub fn map_memory_entry(mem_object: PortId, size: usize) -> KernelResult<mach_vm_address_t> {
    use mach2::vm::mach_vm_map;

    let mut address: mach_vm_address_t = 0;
    // SAFETY: `mem_object` names a memory-object send right the caller
    // received from a peer's `make_memory_entry`; `address` is an out-param.
    let kr = unsafe {
        mach_vm_map(
            mach_task_self(),
            &mut address,
            size as mach_vm_size_t,
            0,
            VM_FLAGS_ANYWHERE,
            mem_object.raw(),
            0,
            0,
            VM_PROT_READ | VM_PROT_WRITE,
            VM_PROT_READ | VM_PROT_WRITE,
            VM_INHERIT_NONE,
        )
    };
    if kr != KERN_SUCCESS {
        return Err(KernelError::VmMap(kr));
    }
    Ok(address)
}
