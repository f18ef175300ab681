//! The install/restore primitive.
//!
//! A [`HookUnit`] owns exactly one (table, index, original, replacement)
//! triple. Installing swaps the slot under the write barrier; restoring
//! swaps the saved original back. Both directions are a single word-width
//! atomic store, so dispatchers racing through the table observe either
//! entry, never a torn pointer.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashSet;
use std::sync::Mutex;

use crate::barrier;
use crate::table::DispatchTable;
use crate::types::{Address, HookError};

/// Where an installed hook publishes the captured original entry.
///
/// A replacement reachable through the table forwards through one of these.
/// The original is stored (Release) before the slot swap makes the
/// replacement reachable, so any caller that can enter the replacement will
/// observe a populated cell. The cell is deliberately never cleared on
/// restore: calls already inside the replacement may still need to forward.
pub struct Trampoline(AtomicUsize);

impl Trampoline {
    pub const fn new() -> Self {
        Trampoline(AtomicUsize::new(0))
    }

    /// The saved original entry. Null until the owning hook is installed.
    pub fn original(&self) -> Address {
        Address::new(self.0.load(Ordering::Acquire))
    }

    fn publish(&self, entry: Address) {
        self.0.store(entry.raw(), Ordering::Release);
    }
}

impl Default for Trampoline {
    fn default() -> Self {
        Self::new()
    }
}

/// Live (table base, slot index) claims. At most one installed hook may own
/// a slot at a time; a silent overwrite would leak the stored original and
/// fork the slot into two hook chains that cannot both be restored.
static INSTALLED_SLOTS: Mutex<Option<HashSet<(usize, usize)>>> = Mutex::new(None);

fn claim_slot(base: Address, index: usize) -> Result<(), HookError> {
    let mut guard = INSTALLED_SLOTS.lock().unwrap_or_else(|e| e.into_inner());
    let slots = guard.get_or_insert_with(HashSet::new);
    if !slots.insert((base.raw(), index)) {
        return Err(HookError::AlreadyInstalled { base, index });
    }
    Ok(())
}

fn release_slot(base: Address, index: usize) {
    let mut guard = INSTALLED_SLOTS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(slots) = guard.as_mut() {
        slots.remove(&(base.raw(), index));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookState {
    Uninstalled,
    Installed,
}

/// One interposed table entry.
///
/// State machine: Uninstalled →install→ Installed →restore→ Uninstalled.
/// There are no other transitions. The unit must reach Uninstalled before
/// the code containing its replacement can be unloaded, or the table is
/// left dispatching into a dangling entry.
#[derive(Debug)]
pub struct HookUnit {
    table: DispatchTable,
    index: usize,
    original: Address,
    replacement: Address,
    state: HookState,
}

impl HookUnit {
    /// Capture `table[index]`, publish it to `original_out`, then swap in
    /// `replacement` under the write barrier.
    ///
    /// Fails with [`HookError::AlreadyInstalled`] if the slot already holds
    /// a live hook; the table is left untouched in that case.
    pub fn install(
        table: DispatchTable,
        index: usize,
        replacement: Address,
        original_out: &Trampoline,
    ) -> Result<HookUnit, HookError> {
        debug_assert!(!replacement.is_null());
        if index >= table.entry_count() {
            return Err(HookError::EntryNotFound(format!("slot index {index}")));
        }
        claim_slot(table.base(), index)?;

        let original = table.read_entry(index);
        original_out.publish(original);

        let swap = barrier::with_slot_writable(table.slot_address(index), || unsafe {
            table.write_entry(index, replacement);
        });
        if let Err(e) = swap {
            release_slot(table.base(), index);
            return Err(e);
        }

        Ok(HookUnit {
            table,
            index,
            original,
            replacement,
            state: HookState::Installed,
        })
    }

    /// Swap the saved original back into the slot.
    ///
    /// A second restore is rejected with [`HookError::DoubleRestore`] and
    /// performs no write — the slot may since have been claimed by another
    /// installer. Likewise, if the slot no longer holds this unit's
    /// replacement, nothing is written and the mismatch is reported: our
    /// entry is already gone from the table, and writing the stale original
    /// would clobber whoever owns the slot now.
    pub fn restore(&mut self) -> Result<(), HookError> {
        if self.state != HookState::Installed {
            return Err(HookError::DoubleRestore);
        }

        let slot = self.table.slot_address(self.index);
        let current = self.table.read_entry(self.index);
        if current != self.replacement {
            self.state = HookState::Uninstalled;
            release_slot(self.table.base(), self.index);
            return Err(HookError::TableSanityCheckFailed(slot));
        }

        barrier::with_slot_writable(slot, || unsafe {
            self.table.write_entry(self.index, self.original);
        })?;
        self.state = HookState::Uninstalled;
        release_slot(self.table.base(), self.index);

        // Read-back check, outside the barrier window.
        if self.table.read_entry(self.index) != self.original {
            return Err(HookError::TableSanityCheckFailed(slot));
        }
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn original(&self) -> Address {
        self.original
    }

    pub fn replacement(&self) -> Address {
        self.replacement
    }

    pub fn is_installed(&self) -> bool {
        self.state == HookState::Installed
    }
}
