//! Name-to-address resolution strategies.

mod export;
mod probe;

pub use export::ExportResolver;
pub use probe::ProbeResolver;

use crate::types::{HookError, ResolvedSymbol, Technique};

/// A resolution strategy.
///
/// Which technique works is a property of the host build, not of the call
/// site, so the strategy is chosen once at configuration time and injected —
/// the rest of the engine never branches on it. Resolvers ride inside the
/// session, which crosses threads, hence the `Send + Sync` bound.
pub trait SymbolResolver: Send + Sync {
    fn technique(&self) -> Technique;
    fn resolve(&self, name: &str) -> Result<ResolvedSymbol, HookError>;
}

/// Build the resolver for a configured technique.
pub fn for_technique(technique: Technique) -> Result<Box<dyn SymbolResolver>, HookError> {
    match technique {
        Technique::Export => Ok(Box::new(ExportResolver)),
        Technique::Probe => Ok(Box::new(ProbeResolver::new()?)),
    }
}
