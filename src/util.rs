//! Utilities (component J): monotonic deadlines and payload allocation that
//! tells kernel-VM-backed memory apart from ordinary heap buffers.
//!
//! Deadlines are carried in the wire header (`user_payload_deadline`, §3), so
//! unlike `std::time::Instant` (opaque, not reconstructible from a raw
//! value) they are represented as raw nanoseconds off the machine's
//! monotonic clock — the same clock both peers' kernels share, which is
//! exactly what lets a receiver compare a deadline stamped by a different
//! process. Grounded on `original_source/src/internal.h`'s
//! `calc_deadline`/`is_deadline_expired`/`has_no_deadline`, which operate on
//! a `struct timespec` from `CLOCK_MONOTONIC` for the same reason.

use std::time::Duration;

#[cfg(target_os = "macos")]
fn monotonic_now_ns() -> u64 {
    use mach2::mach_time::{mach_absolute_time, mach_timebase_info};

    // SAFETY: `mach_timebase_info` fills in an out-param describing the tick
    // period; it has no other preconditions.
    let info = unsafe {
        let mut info = std::mem::zeroed();
        mach_timebase_info(&mut info);
        info
    };
    // SAFETY: no preconditions; reads the continuously-running tick counter.
    let ticks = unsafe { mach_absolute_time() };
    ticks * info.numer as u64 / info.denom as u64
}

#[cfg(not(target_os = "macos"))]
fn monotonic_now_ns() -> u64 {
    use std::time::Instant;
    // Non-macOS builds never talk to a real peer process, so an
    // in-process-only monotonic source is fine for tests that exercise the
    // deadline math without a kernel underneath it.
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// A monotonic instant, in nanoseconds, by which a referenced OOL user
/// payload is valid. `0` means no deadline, matching the wire header's
/// "zero = no deadline" convention.
pub type Deadline = u64;

/// Compute a deadline `margin` in the future from now.
pub fn calc_deadline(margin: Duration) -> Deadline {
    monotonic_now_ns() + margin.as_nanos() as u64
}

pub fn has_no_deadline(deadline: Deadline) -> bool {
    deadline == 0
}

/// Is `deadline` expired, accounting for a safety margin? A deadline is
/// treated as expired if fewer than `margin` remain before it, which is what
/// lets a server-side callback decline to touch a buffer the sender may have
/// already reclaimed.
pub fn is_deadline_expired(deadline: Deadline, margin: Duration) -> bool {
    if has_no_deadline(deadline) {
        return false;
    }
    let now = monotonic_now_ns();
    let margin_ns = margin.as_nanos() as u64;
    match deadline.checked_sub(now) {
        Some(remaining) => remaining < margin_ns,
        None => true,
    }
}

/// Ordinary heap-owned bytes (a user payload copied rather than shared).
/// Distinguishing this from [`VmPayload`] at the type level means a caller
/// cannot accidentally hand heap memory to the VM-deallocate path or vice
/// versa.
pub type HeapPayload = Vec<u8>;

/// Bytes that came from a kernel OOL region and must be released through the
/// VM deallocate binding ([`crate::kernel::memory::vm_deallocate_payload`]),
/// not dropped as an ordinary `Vec`.
#[derive(Debug)]
pub struct VmPayload {
    ptr: *mut u8,
    len: usize,
}

impl VmPayload {
    /// # Safety
    /// `ptr`/`len` must describe a live kernel-VM-allocated region owned by
    /// the caller; ownership transfers to the returned `VmPayload`.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> VmPayload {
        VmPayload { ptr, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: constructed only from a live kernel-VM region of `len`
        // bytes; the region outlives this borrow because `self` owns it.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the VM-backed bytes into an ordinary heap buffer.
    pub fn to_heap(&self) -> HeapPayload {
        self.as_slice().to_vec()
    }

    /// Consume without releasing the backing region; used when ownership is
    /// being handed to another component (e.g. the ack registry moving a
    /// reply payload into a waiter).
    pub fn into_raw(self) -> (*mut u8, usize) {
        let out = (self.ptr, self.len);
        std::mem::forget(self);
        out
    }
}

impl Drop for VmPayload {
    fn drop(&mut self) {
        if self.ptr.is_null() || self.len == 0 {
            return;
        }
        crate::kernel::memory::vm_deallocate_payload(self.ptr, self.len);
    }
}

// SAFETY: a VmPayload owns exclusive access to a kernel-allocated region;
// moving ownership across threads is sound the same way it is for `Vec<u8>`.
unsafe impl Send for VmPayload {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_deadline_never_expires() {
        assert!(!is_deadline_expired(0, Duration::from_millis(10)));
        assert!(has_no_deadline(0));
    }

    #[test]
    fn far_future_deadline_is_not_expired() {
        let d = calc_deadline(Duration::from_secs(60));
        assert!(!is_deadline_expired(d, Duration::from_millis(10)));
    }

    #[test]
    fn past_deadline_is_expired() {
        let d = calc_deadline(Duration::from_secs(1)).saturating_sub(2_000_000_000);
        assert!(is_deadline_expired(d, Duration::from_millis(10)));
    }

    #[test]
    fn deadline_within_safety_margin_counts_as_expired() {
        let d = calc_deadline(Duration::from_millis(2));
        assert!(is_deadline_expired(d, Duration::from_millis(10)));
    }
}
