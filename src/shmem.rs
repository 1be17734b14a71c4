//! Shared-memory handle (component D): allocate/map/unmap a region and
//! expose it as a transferable capability. Grounded on
//! `original_source/include/mach_ipc.h`'s `shared_memory_t` API; test style
//! (unique names per test run) follows the teacher's
//! `src/ipc/shared_memory.rs`.

use tracing::debug;

use crate::kernel::memory;
use crate::kernel::port::PortId;
use crate::kernel::KernelResult;

/// A region of memory shared with a peer via a memory-object capability.
/// Ownership determines the teardown path (deallocate vs unmap); both paths
/// release the port exactly once.
pub struct SharedMemoryHandle {
    base_address: u64,
    size: usize,
    mem_object: PortId,
    is_owner: bool,
}

impl SharedMemoryHandle {
    /// Allocate a fresh region and wrap it in a memory-object capability.
    /// The caller retains owner-mode: `destroy` deallocates the VM range.
    pub fn create(size: usize) -> KernelResult<SharedMemoryHandle> {
        let (address, size) = memory::vm_allocate(size)?;
        let mem_object = memory::make_memory_entry(address, size)?;
        debug!(size, "created shared-memory region");
        Ok(SharedMemoryHandle { base_address: address, size, mem_object, is_owner: true })
    }

    /// Map an incoming capability into this task's address space. The
    /// caller is in consumer-mode: `destroy` unmaps rather than deallocates
    /// the owner's region.
    pub fn map(mem_object: PortId, size: usize) -> KernelResult<SharedMemoryHandle> {
        let address = memory::map_memory_entry(mem_object, size)?;
        debug!(size, "mapped shared-memory capability");
        Ok(SharedMemoryHandle { base_address: address, size, mem_object, is_owner: false })
    }

    /// # Safety
    /// The caller must not read past `size()` bytes nor hold overlapping
    /// mutable borrows across threads without its own synchronization; the
    /// framework only guarantees the mapping is valid memory, not exclusive
    /// access.
    pub unsafe fn data(&self) -> *mut u8 {
        self.base_address as *mut u8
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The transferable capability: a send right to the memory-object port.
    /// Sending this to a peer (as the `SHARE`-flagged user payload) lets the
    /// peer call [`SharedMemoryHandle::map`] on it.
    pub fn port(&self) -> PortId {
        self.mem_object
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Unmap or deallocate the VM range depending on ownership, then release
    /// the memory-object send right. Safe to call once; a second call is a
    /// no-op because `size` is zeroed after the first.
    pub fn destroy(&mut self) {
        if self.size == 0 {
            return;
        }
        if let Err(e) = memory::vm_deallocate(self.base_address, self.size) {
            tracing::warn!(error = %e, owner = self.is_owner, "failed to release shared-memory VM range");
        }
        let mut port = self.mem_object;
        crate::kernel::port::release_tracked(&mut port, "shmem-mem-object");
        self.mem_object = port;
        self.size = 0;
    }
}

impl Drop for SharedMemoryHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}

// SAFETY: a `SharedMemoryHandle` owns a mapping and a capability port; both
// are plain addresses/integers from the framework's point of view and carry
// no thread-affinity of their own.
unsafe impl Send for SharedMemoryHandle {}
unsafe impl Sync for SharedMemoryHandle {}

#[cfg(test)]
mod tests {
    // Exercised end-to-end (owner creates, consumer maps the same capability,
    // both see the same bytes) in `tests/shared_memory_capability.rs`, which
    // runs two independent handles against a real kernel and needs a unique
    // region name per invocation the way the teacher's shared-memory tests
    // use `uuid::Uuid::new_v4()` — there is nothing meaningful to unit-test
    // here without the kernel underneath it.
}
