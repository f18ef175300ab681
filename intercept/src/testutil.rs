//! Shared fixtures for engine tests.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::table::ENTRY_STRIDE;
use crate::types::{Address, ResolvedSymbol, Technique};

pub extern "C" fn double_value(x: u64) -> u64 {
    x.wrapping_mul(2)
}

pub extern "C" fn triple_value(x: u64) -> u64 {
    x.wrapping_mul(3)
}

pub fn table_symbol(name: &str, address: Address) -> ResolvedSymbol {
    ResolvedSymbol {
        name: name.to_string(),
        address,
        technique: Technique::Export,
    }
}

/// Call a one-argument entry through its raw address, the way an external
/// dispatcher would.
pub fn call1(entry: Address, x: u64) -> u64 {
    let f: extern "C" fn(u64) -> u64 = unsafe { core::mem::transmute(entry.raw()) };
    std::hint::black_box(f)(x)
}

/// A read-only page laid out like a live dispatch table, backed by an
/// inaccessible guard page so span checks cannot bleed into neighbouring
/// mappings.
pub struct FixtureTable {
    base: usize,
    page_sz: usize,
}

impl FixtureTable {
    pub fn new(entries: &[usize]) -> Self {
        let page_sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        assert!(entries.len() * ENTRY_STRIDE <= page_sz);

        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                page_sz * 2,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED, "mmap failed");
        let base = base as usize;

        for (i, &entry) in entries.iter().enumerate() {
            let slot = (base + i * ENTRY_STRIDE) as *const AtomicUsize;
            unsafe { (*slot).store(entry, Ordering::SeqCst) };
        }

        unsafe {
            libc::mprotect(base as *mut libc::c_void, page_sz, libc::PROT_READ);
            libc::mprotect(
                (base + page_sz) as *mut libc::c_void,
                page_sz,
                libc::PROT_NONE,
            );
        }
        FixtureTable { base, page_sz }
    }

    pub fn base(&self) -> Address {
        Address::new(self.base)
    }

    /// Entries that fit before the guard page.
    pub fn capacity(&self) -> usize {
        self.page_sz / ENTRY_STRIDE
    }

    pub fn symbol(&self) -> ResolvedSymbol {
        table_symbol("fixture_table", self.base())
    }

    /// Direct word read, for bit-for-bit assertions.
    pub fn raw_entry(&self, index: usize) -> usize {
        assert!(index < self.capacity());
        let slot = (self.base + index * ENTRY_STRIDE) as *const AtomicUsize;
        unsafe { (*slot).load(Ordering::SeqCst) }
    }
}

impl Drop for FixtureTable {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.page_sz * 2);
        }
    }
}
