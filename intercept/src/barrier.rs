//! Scoped relaxation of write protection around a single slot write.
//!
//! Protection is a property of the whole page, not of one slot, so two
//! installers toggling it concurrently could re-protect the page while the
//! other is mid-write. Every barrier session therefore runs under one
//! process-wide lock, and the protection flip is held only for the duration
//! of exactly one slot write.

use crate::types::{Address, HookError};

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use crate::maps;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    static BARRIER_LOCK: Mutex<()> = Mutex::new(());

    /// Guard invariant: set while the protection flip is live. Observing it
    /// already set under the lock means a toggle bypassed the lock entirely,
    /// which is fatal — the page state can no longer be trusted.
    static BARRIER_OPEN: AtomicBool = AtomicBool::new(false);

    struct FlagGuard;

    impl Drop for FlagGuard {
        fn drop(&mut self) {
            BARRIER_OPEN.store(false, Ordering::SeqCst);
        }
    }

    struct ProtectionGuard {
        page: usize,
        len: usize,
        restore: libc::c_int,
    }

    impl Drop for ProtectionGuard {
        fn drop(&mut self) {
            // Re-protect on every exit path. Failure here cannot propagate
            // out of a destructor; it is logged, and a page left writable is
            // recoverable in a way a torn slot is not.
            let rc =
                unsafe { libc::mprotect(self.page as *mut libc::c_void, self.len, self.restore) };
            if rc != 0 {
                log::error!(
                    "failed to re-protect page {:#x} after slot write (errno {})",
                    self.page,
                    last_errno()
                );
            }
        }
    }

    fn last_errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
    }

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    pub fn with_slot_writable<T>(
        slot: Address,
        write: impl FnOnce() -> T,
    ) -> Result<T, HookError> {
        debug_assert!(slot.is_aligned(), "slot writes must be word aligned");

        let _serial = BARRIER_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        if BARRIER_OPEN.swap(true, Ordering::SeqCst) {
            return Err(HookError::BarrierToggleRaced);
        }
        let _flag = FlagGuard;

        let region = maps::region_containing(slot.raw())?
            .ok_or(HookError::Protection(libc::EFAULT))?;
        let restore = region.prot_flags();

        // An aligned word never straddles a page boundary, so one page is
        // always enough.
        let len = page_size();
        let page = slot.raw() & !(len - 1);

        let rc = unsafe {
            libc::mprotect(page as *mut libc::c_void, len, restore | libc::PROT_WRITE)
        };
        if rc != 0 {
            return Err(HookError::Protection(last_errno()));
        }
        let _prot = ProtectionGuard { page, len, restore };

        Ok(write())
    }
}

/// Run `write` — exactly one word-sized store to `slot` — with the page
/// containing `slot` made temporarily writable.
///
/// The page's current protection is captured first and restored immediately
/// after `write` returns, on all exit paths. Nothing else (logging, error
/// handling) happens inside the window.
pub fn with_slot_writable<T>(slot: Address, write: impl FnOnce() -> T) -> Result<T, HookError> {
    #[cfg(target_os = "linux")]
    {
        linux::with_slot_writable(slot, write)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (slot, write);
        Err(HookError::Unsupported)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::maps;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn map_read_only_page() -> (usize, usize) {
        let len = page_size();
        let page = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED, "mmap failed");
        (page as usize, len)
    }

    #[test]
    fn write_succeeds_and_protection_is_restored() {
        let (base, len) = map_read_only_page();
        let slot = Address::new(base);

        with_slot_writable(slot, || unsafe {
            (*(base as *const AtomicUsize)).store(0x5511, Ordering::SeqCst);
        })
        .expect("barrier write");

        // The value is visible at the original address...
        let value = unsafe { (*(base as *const AtomicUsize)).load(Ordering::SeqCst) };
        assert_eq!(value, 0x5511);

        // ...and the page went back to read-only.
        let region = maps::region_containing(base).unwrap().unwrap();
        assert!(region.read && !region.write, "page must be re-protected");

        unsafe { libc::munmap(base as *mut libc::c_void, len) };
    }

    #[test]
    fn unmapped_slot_reports_protection_error() {
        // Page zero is never mapped (mmap_min_addr).
        let slot = Address::new(core::mem::size_of::<usize>());
        let err = with_slot_writable(slot, || ()).unwrap_err();
        assert!(matches!(err, HookError::Protection(_)), "got {err:?}");
    }

    #[test]
    fn concurrent_sessions_serialize() {
        let (base, len) = map_read_only_page();

        let handles: Vec<_> = (0..4usize)
            .map(|i| {
                std::thread::spawn(move || {
                    let slot = Address::new(base + i * core::mem::size_of::<usize>());
                    for round in 0..100usize {
                        with_slot_writable(slot, || unsafe {
                            (*(slot.raw() as *const AtomicUsize))
                                .store(i * 1000 + round, Ordering::SeqCst);
                        })
                        .expect("barrier write");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread panicked");
        }

        for i in 0..4usize {
            let slot = base + i * core::mem::size_of::<usize>();
            let value = unsafe { (*(slot as *const AtomicUsize)).load(Ordering::SeqCst) };
            assert_eq!(value, i * 1000 + 99, "slot {i} holds its final write");
        }
        let region = maps::region_containing(base).unwrap().unwrap();
        assert!(!region.write, "page must end read-only");

        unsafe { libc::munmap(base as *mut libc::c_void, len) };
    }
}
