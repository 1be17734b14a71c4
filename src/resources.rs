//! Resource tracker (component C): register heterogeneous resources tagged
//! by kind, release in reverse registration order on teardown.

use parking_lot::Mutex;
use tracing::debug;

use crate::kernel::port::PortId;

/// A releaser supplied for `ResourceKind::Custom` entries.
pub type CustomCleanup = Box<dyn FnOnce() + Send>;

pub enum Resource {
    Port(PortId),
    /// Kernel-VM-backed memory, released through the VM deallocate binding.
    VmMemory { ptr: *mut u8, len: usize },
    /// A serial queue; draining happens before the queue itself is dropped.
    Queue(crate::wire::SerialQueueHandle),
    Custom(CustomCleanup),
}

// SAFETY: `Resource::VmMemory` is just an address/length pair describing a
// kernel region; transferring it between threads carries no aliasing beyond
// what the resource tracker itself serializes via its own mutex.
unsafe impl Send for Resource {}

struct Entry {
    resource: Resource,
    debug_name: String,
    active: bool,
}

/// A stack of registered resources, released in reverse order. Mirrors the
/// source's `resource_tracker_t`: process-internal, never shared across
/// processes.
#[derive(Default)]
pub struct ResourceTracker {
    entries: Mutex<Vec<Entry>>,
}

impl ResourceTracker {
    pub fn new() -> ResourceTracker {
        ResourceTracker { entries: Mutex::new(Vec::new()) }
    }

    /// Register a resource for later teardown. Returns a handle usable with
    /// [`Self::remove`] (the index at time of registration; stable because
    /// entries are never shifted, only marked inactive).
    pub fn add(&self, resource: Resource, debug_name: impl Into<String>) -> usize {
        let mut entries = self.entries.lock();
        let idx = entries.len();
        let debug_name = debug_name.into();
        debug!(idx, name = %debug_name, "tracking resource");
        entries.push(Entry { resource, debug_name, active: true });
        idx
    }

    /// Mark a previously registered resource inactive without releasing it;
    /// used when ownership of the underlying resource has moved elsewhere
    /// (e.g. it was already released explicitly).
    pub fn forget(&self, handle: usize) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get_mut(handle) {
            e.active = false;
        }
    }

    /// Release every still-active resource in reverse registration order.
    pub fn cleanup_all(&self) {
        let mut entries = self.entries.lock();
        debug!(count = entries.len(), "cleaning up tracked resources");
        for entry in entries.iter_mut().rev() {
            if !entry.active {
                continue;
            }
            entry.active = false;
            release(&mut entry.resource, &entry.debug_name);
        }
        entries.clear();
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        self.cleanup_all();
    }
}

fn release(resource: &mut Resource, debug_name: &str) {
    match resource {
        Resource::Port(port) => crate::kernel::port::release_tracked(port, debug_name),
        Resource::VmMemory { ptr, len } => {
            if !ptr.is_null() && *len > 0 {
                debug!(name = debug_name, len, "releasing vm memory");
                crate::kernel::memory::vm_deallocate_payload(*ptr, *len);
            }
        }
        Resource::Queue(queue) => {
            debug!(name = debug_name, "draining serial queue before release");
            queue.drain_and_stop();
        }
        Resource::Custom(cleanup) => {
            debug!(name = debug_name, "running custom cleanup");
            // `FnOnce` inside a `Box`: take it out so we can call it once.
            let cleanup = std::mem::replace(cleanup, Box::new(|| {}));
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn custom_resources_release_in_reverse_order() {
        let tracker = ResourceTracker::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            tracker.add(
                Resource::Custom(Box::new(move || order.lock().push(i))),
                format!("custom-{i}"),
            );
        }
        tracker.cleanup_all();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn forgotten_resource_is_not_released_twice() {
        let tracker = ResourceTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let handle = tracker.add(
            Resource::Custom(Box::new(move || {
                calls2.fetch_add(1, Ordering::SeqCst);
            })),
            "once",
        );
        tracker.forget(handle);
        tracker.cleanup_all();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cleanup_all_is_idempotent() {
        let tracker = ResourceTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        tracker.add(
            Resource::Custom(Box::new(move || {
                calls2.fetch_add(1, Ordering::SeqCst);
            })),
            "once",
        );
        tracker.cleanup_all();
        tracker.cleanup_all();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
