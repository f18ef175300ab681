use core::fmt;

use thiserror::Error;

/// Opaque pointer-width address.
///
/// Addresses move through the engine as plain integers; conversion back to a
/// raw pointer happens only at the slot accessors in [`crate::table`], so
/// every real memory access is auditable in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    pub const fn new(raw: usize) -> Self {
        Address(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn is_aligned(self) -> bool {
        self.0 % core::mem::size_of::<usize>() == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How a symbol's runtime address was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Technique {
    /// Direct lookup through the exported dynamic symbol interface.
    Export,
    /// Transient introspection probe revealing the owning image, followed by
    /// a full symbol-table walk of that image. Finds non-exported symbols.
    Probe,
}

/// A name-to-address resolution result. Immutable once produced; the address
/// is only meaningful inside the process that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: String,
    pub address: Address,
    pub technique: Technique,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("introspection probe registration failed")]
    ProbeRegistrationFailed,

    #[error("dispatch table at {0} failed the sanity check")]
    TableSanityCheckFailed(Address),

    #[error("no live table entry matches {0}")]
    EntryNotFound(String),

    #[error("slot {index} of table at {base} already holds a hook")]
    AlreadyInstalled { base: Address, index: usize },

    #[error("hook unit was already restored")]
    DoubleRestore,

    #[error("write-barrier toggle raced past its lock")]
    BarrierToggleRaced,

    #[error("memory protection update failed (errno {0})")]
    Protection(i32),

    #[error("not supported on this platform")]
    Unsupported,
}
