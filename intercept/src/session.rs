//! Composition layer: resolve the table once, install hooks in order,
//! restore them in reverse.

use log::{debug, error, info};

use crate::hook::{HookUnit, Trampoline};
use crate::resolver::SymbolResolver;
use crate::table::DispatchTable;
use crate::types::{Address, HookError};

/// One interception target: the named routine whose table entry is replaced,
/// the replacement entry, and the cell the captured original is published to.
///
/// The trampoline cell must outlive every call that might still forward
/// through it, which in practice means the life of the process.
pub struct HookTarget<'a> {
    pub symbol: &'a str,
    pub replacement: Address,
    pub saved: &'static Trampoline,
}

/// The dispatch table to operate on, by symbol name and entry count.
pub struct TableSpec<'a> {
    pub symbol: &'a str,
    pub entry_count: usize,
}

/// An active set of hooks over one dispatch table.
///
/// Holds the resolver for its whole lifetime; resolver state (the probed
/// image mapping) is released when the session is deactivated or dropped.
pub struct HookSession {
    table: DispatchTable,
    units: Vec<HookUnit>,
    #[allow(dead_code)] // Held so resolver state lives exactly as long as the session.
    resolver: Box<dyn SymbolResolver>,
}

impl std::fmt::Debug for HookSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSession")
            .field("table", &self.table)
            .field("units", &self.units)
            .finish_non_exhaustive()
    }
}

impl HookSession {
    /// Resolve and locate the table once, then install one hook per target,
    /// in the order given.
    ///
    /// If any install fails, the units already installed are rolled back in
    /// reverse order and the error is returned; activation never leaves a
    /// partial install behind.
    pub fn activate(
        resolver: Box<dyn SymbolResolver>,
        table_spec: &TableSpec<'_>,
        targets: &[HookTarget<'_>],
    ) -> Result<HookSession, HookError> {
        let table_sym = resolver.resolve(table_spec.symbol)?;
        let table = DispatchTable::locate(&table_sym, table_spec.entry_count)?;
        info!(
            "dispatch table {} located at {} ({} entries)",
            table_spec.symbol,
            table.base(),
            table.entry_count()
        );

        let mut units: Vec<HookUnit> = Vec::with_capacity(targets.len());
        for target in targets {
            match install_target(resolver.as_ref(), table, target) {
                Ok(unit) => {
                    debug!("hooked {} (slot {})", target.symbol, unit.index());
                    units.push(unit);
                }
                Err(e) => {
                    error!(
                        "activation failed at {}: {e}; rolling back {} unit(s)",
                        target.symbol,
                        units.len()
                    );
                    rollback(&mut units);
                    return Err(e);
                }
            }
        }

        Ok(HookSession {
            table,
            units,
            resolver,
        })
    }

    /// Restore every installed unit in strict reverse installation order,
    /// then drop resolver state.
    ///
    /// Later hooks may layer on state set up by earlier ones, so later hooks
    /// come out first. A failed restore is logged, the remaining units are
    /// still processed (teardown always runs to completion), and the first
    /// failure is returned.
    pub fn deactivate(mut self) -> Result<(), HookError> {
        self.restore_all()
    }

    pub fn table(&self) -> DispatchTable {
        self.table
    }

    /// Number of currently installed units.
    pub fn installed(&self) -> usize {
        self.units.len()
    }

    fn restore_all(&mut self) -> Result<(), HookError> {
        let mut first_err = None;
        while let Some(mut unit) = self.units.pop() {
            match unit.restore() {
                Ok(()) => debug!("restored slot {}", unit.index()),
                Err(e) => {
                    error!("restore of slot {} could not be verified: {e}", unit.index());
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for HookSession {
    fn drop(&mut self) {
        if !self.units.is_empty() {
            error!("hook session dropped while still active; forcing restore");
            let _ = self.restore_all();
        }
    }
}

fn install_target(
    resolver: &dyn SymbolResolver,
    table: DispatchTable,
    target: &HookTarget<'_>,
) -> Result<HookUnit, HookError> {
    let sym = resolver.resolve(target.symbol)?;
    let index = table
        .index_of(sym.address)
        .ok_or_else(|| HookError::EntryNotFound(target.symbol.to_string()))?;
    HookUnit::install(table, index, target.replacement, target.saved)
}

fn rollback(units: &mut Vec<HookUnit>) {
    while let Some(mut unit) = units.pop() {
        if let Err(e) = unit.restore() {
            error!("rollback of slot {} failed: {e}", unit.index());
        }
    }
}
