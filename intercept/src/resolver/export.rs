use super::SymbolResolver;
use crate::types::{Address, HookError, ResolvedSymbol, Technique};

/// Direct lookup through the exported dynamic-symbol interface
/// (`dlsym(RTLD_DEFAULT, ...)`). Only sees symbols the host chose to export.
pub struct ExportResolver;

impl SymbolResolver for ExportResolver {
    fn technique(&self) -> Technique {
        Technique::Export
    }

    #[cfg(target_os = "linux")]
    fn resolve(&self, name: &str) -> Result<ResolvedSymbol, HookError> {
        let cname = std::ffi::CString::new(name)
            .map_err(|_| HookError::SymbolNotFound(name.to_string()))?;
        let p = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
        if p.is_null() {
            return Err(HookError::SymbolNotFound(name.to_string()));
        }
        Ok(ResolvedSymbol {
            name: name.to_string(),
            address: Address::new(p as usize),
            technique: Technique::Export,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn resolve(&self, _name: &str) -> Result<ResolvedSymbol, HookError> {
        Err(HookError::Unsupported)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn resolves_an_exported_libc_symbol() {
        let sym = ExportResolver.resolve("malloc").expect("malloc resolves");
        assert!(!sym.address.is_null());
        assert_eq!(sym.technique, Technique::Export);
        assert_eq!(sym.name, "malloc");
    }

    #[test]
    fn garbled_name_reports_symbol_not_found() {
        let err = ExportResolver
            .resolve("this_symbol_definitely_does_not_exist_xyz123")
            .unwrap_err();
        assert_eq!(
            err,
            HookError::SymbolNotFound("this_symbol_definitely_does_not_exist_xyz123".into())
        );
    }

    #[test]
    fn embedded_nul_cannot_resolve() {
        assert!(matches!(
            ExportResolver.resolve("bad\0name"),
            Err(HookError::SymbolNotFound(_))
        ));
    }
}
