//! Locating and addressing the shared dispatch table.

use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::maps;
use crate::types::{Address, HookError, ResolvedSymbol};

/// Distance between consecutive table entries: one machine word.
pub const ENTRY_STRIDE: usize = mem::size_of::<usize>();

/// Handle to a live, externally owned table of function-pointer entries.
///
/// The engine never allocates or frees the table; this handle is a weak
/// view. Once located, the base is carried unchanged for the rest of the
/// session. Writing through a re-derived, possibly stale base is exactly
/// the failure class the sanity check exists to catch early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTable {
    base: Address,
    entry_count: usize,
}

impl DispatchTable {
    /// Validate `symbol` as the base of a table with `entry_count` entries.
    ///
    /// Beyond basic shape checks, the first entry must read as an address
    /// inside a currently mapped executable region. Name resolution can
    /// silently land on an unrelated symbol when names collide across build
    /// variants; a non-code first entry exposes that before the first write.
    pub fn locate(symbol: &ResolvedSymbol, entry_count: usize) -> Result<Self, HookError> {
        let base = symbol.address;
        if base.is_null() || !base.is_aligned() || entry_count == 0 {
            return Err(HookError::TableSanityCheckFailed(base));
        }

        let regions = maps::regions()?;
        let span_end = base
            .raw()
            .checked_add(entry_count * ENTRY_STRIDE)
            .ok_or(HookError::TableSanityCheckFailed(base))?;
        let span_ok = regions
            .iter()
            .any(|r| r.read && r.contains(base.raw()) && span_end <= r.end);
        if !span_ok {
            return Err(HookError::TableSanityCheckFailed(base));
        }

        let table = DispatchTable { base, entry_count };
        let first = table.read_entry(0);
        let first_is_code = regions.iter().any(|r| r.exec && r.contains(first.raw()));
        if !first_is_code {
            return Err(HookError::TableSanityCheckFailed(base));
        }
        Ok(table)
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Address of slot `index`.
    pub fn slot_address(&self, index: usize) -> Address {
        debug_assert!(index < self.entry_count);
        Address::new(self.base.raw() + index * ENTRY_STRIDE)
    }

    /// Atomically read the entry at `index`.
    ///
    /// This is one of the two places in the engine where an [`Address`]
    /// becomes a real pointer. The span was validated readable by
    /// [`DispatchTable::locate`], and the load is a single word-width atomic
    /// operation, so a concurrent installer can never expose a torn pointer
    /// to readers.
    pub fn read_entry(&self, index: usize) -> Address {
        assert!(index < self.entry_count, "entry index out of range");
        let slot = self.slot_address(index).raw() as *const AtomicUsize;
        Address::new(unsafe { (*slot).load(Ordering::Acquire) })
    }

    /// Atomically overwrite the entry at `index`.
    ///
    /// The second and last real memory access in the engine.
    ///
    /// # Safety
    /// The caller must have made the slot writable (an open barrier session)
    /// and must hold exclusivity for this slot via the hook registry.
    pub(crate) unsafe fn write_entry(&self, index: usize, value: Address) {
        assert!(index < self.entry_count, "entry index out of range");
        let slot = self.slot_address(index).raw() as *const AtomicUsize;
        unsafe { (*slot).store(value.raw(), Ordering::Release) };
    }

    /// Find the slot currently holding `entry`.
    pub fn index_of(&self, entry: Address) -> Option<usize> {
        (0..self.entry_count).find(|&i| self.read_entry(i) == entry)
    }
}
