//! Probe-based resolution for symbols outside the exported interface.
//!
//! The interesting targets are deliberately not exported, so the direct
//! dynamic lookup cannot see them. Instead the resolver registers a
//! transient introspection probe (a one-shot `dl_iterate_phdr` callback)
//! whose single firing reveals the image, on-disk path and load base,
//! backing a known anchor address. The probe is deregistered immediately
//! after that firing. The revealed image is then handed to a general-purpose
//! name-to-address primitive: a walk of the full `.symtab` of the on-disk
//! ELF, which still lists local symbols. Stripped images have no `.symtab`
//! and cannot be probed; that surfaces at construction, not at lookup.

use super::SymbolResolver;
use crate::types::{Address, HookError, ResolvedSymbol, Technique};

#[cfg(target_os = "linux")]
pub use linux::ProbeResolver;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use core::ffi::c_void;
    use std::ffi::CStr;

    /// Image identity reported by the probe's single firing.
    struct ProbeHit {
        path: String,
        load_base: usize,
    }

    /// Register a probe on whichever loaded image maps `anchor`, take its
    /// one firing, and deregister it by stopping the iteration.
    fn register_probe(anchor: usize) -> Result<ProbeHit, HookError> {
        struct Ctx {
            anchor: usize,
            hit: Option<ProbeHit>,
        }

        unsafe extern "C" fn probe(
            info: *mut libc::dl_phdr_info,
            _size: libc::size_t,
            data: *mut c_void,
        ) -> libc::c_int {
            unsafe {
                let ctx = &mut *(data as *mut Ctx);
                let info = &*info;

                let phdrs =
                    core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
                let covers = phdrs.iter().any(|p| {
                    if p.p_type != libc::PT_LOAD || p.p_memsz == 0 {
                        return false;
                    }
                    let start = info.dlpi_addr.wrapping_add(p.p_vaddr) as usize;
                    ctx.anchor >= start && ctx.anchor < start + p.p_memsz as usize
                });
                if !covers {
                    return 0;
                }

                // The empty name is the main executable.
                let path = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
                    std::fs::read_link("/proc/self/exe")
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default()
                } else {
                    CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
                };

                ctx.hit = Some(ProbeHit {
                    path,
                    load_base: info.dlpi_addr as usize,
                });
                1 // one firing is all the probe gets
            }
        }

        let mut ctx = Ctx { anchor, hit: None };
        unsafe {
            libc::dl_iterate_phdr(Some(probe), &mut ctx as *mut Ctx as *mut c_void);
        }
        match ctx.hit {
            Some(hit) if !hit.path.is_empty() => Ok(hit),
            _ => Err(HookError::ProbeRegistrationFailed),
        }
    }

    #[derive(Debug)]
    struct SymtabRange {
        symtab_off: usize,
        symtab_size: usize,
        entsize: usize,
        strtab_off: usize,
        strtab_size: usize,
    }

    /// The general-purpose lookup primitive: a read-only mapping of the
    /// on-disk ELF with its `.symtab`/`.strtab` ranges pre-parsed.
    #[derive(Debug)]
    struct ImageSymtab {
        data: *const u8,
        size: usize,
        range: SymtabRange,
    }

    // Safety: read-only private mapping, unmapped only on drop.
    unsafe impl Send for ImageSymtab {}
    unsafe impl Sync for ImageSymtab {}

    impl Drop for ImageSymtab {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.data as *mut c_void, self.size);
            }
        }
    }

    fn u16_at(b: &[u8], off: usize) -> Option<u16> {
        b.get(off..off + 2)
            .map(|s| u16::from_le_bytes(s.try_into().unwrap()))
    }

    fn u32_at(b: &[u8], off: usize) -> Option<u32> {
        b.get(off..off + 4)
            .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
    }

    fn u64_at(b: &[u8], off: usize) -> Option<u64> {
        b.get(off..off + 8)
            .map(|s| u64::from_le_bytes(s.try_into().unwrap()))
    }

    /// Find `.symtab` and its linked string table in an ELF64 image.
    fn parse_symtab(bytes: &[u8]) -> Option<SymtabRange> {
        const SHT_SYMTAB: u32 = 2;

        if bytes.len() < 64 || &bytes[0..4] != b"\x7fELF" {
            return None;
        }
        let e_shoff = u64_at(bytes, 40)? as usize;
        let e_shentsize = u16_at(bytes, 58)? as usize;
        let e_shnum = u16_at(bytes, 60)? as usize;
        if e_shoff == 0 || e_shnum == 0 || e_shentsize < 64 {
            return None;
        }

        for i in 0..e_shnum {
            let sh = e_shoff + i * e_shentsize;
            if sh + e_shentsize > bytes.len() {
                return None;
            }
            if u32_at(bytes, sh + 4)? != SHT_SYMTAB {
                continue;
            }
            let symtab_off = u64_at(bytes, sh + 24)? as usize;
            let symtab_size = u64_at(bytes, sh + 32)? as usize;
            let link = u32_at(bytes, sh + 40)? as usize;
            let entsize = u64_at(bytes, sh + 56)? as usize;
            if entsize == 0 || symtab_off.checked_add(symtab_size)? > bytes.len() {
                return None;
            }

            let str_sh = e_shoff + link * e_shentsize;
            if str_sh + e_shentsize > bytes.len() {
                return None;
            }
            let strtab_off = u64_at(bytes, str_sh + 24)? as usize;
            let strtab_size = u64_at(bytes, str_sh + 32)? as usize;
            if strtab_off.checked_add(strtab_size)? > bytes.len() {
                return None;
            }

            return Some(SymtabRange {
                symtab_off,
                symtab_size,
                entsize,
                strtab_off,
                strtab_size,
            });
        }
        None
    }

    impl ImageSymtab {
        fn open(path: &str) -> Result<Self, HookError> {
            let c_path = std::ffi::CString::new(path)
                .map_err(|_| HookError::ProbeRegistrationFailed)?;

            unsafe {
                let fd = libc::open(c_path.as_ptr(), libc::O_RDONLY);
                if fd < 0 {
                    return Err(HookError::ProbeRegistrationFailed);
                }
                let mut st: libc::stat = core::mem::zeroed();
                if libc::fstat(fd, &mut st) != 0 || st.st_size < 64 {
                    libc::close(fd);
                    return Err(HookError::ProbeRegistrationFailed);
                }
                let size = st.st_size as usize;

                let ptr = libc::mmap(
                    core::ptr::null_mut(),
                    size,
                    libc::PROT_READ,
                    libc::MAP_PRIVATE,
                    fd,
                    0,
                );
                libc::close(fd);
                if ptr == libc::MAP_FAILED {
                    return Err(HookError::ProbeRegistrationFailed);
                }

                let data = ptr as *const u8;
                let bytes = core::slice::from_raw_parts(data, size);
                match parse_symtab(bytes) {
                    Some(range) => Ok(ImageSymtab { data, size, range }),
                    None => {
                        libc::munmap(ptr, size);
                        Err(HookError::ProbeRegistrationFailed)
                    }
                }
            }
        }

        /// Link-time value of the named function or object, if present.
        fn lookup(&self, name: &str) -> Option<u64> {
            const STT_OBJECT: u8 = 1;
            const STT_FUNC: u8 = 2;

            let bytes = unsafe { core::slice::from_raw_parts(self.data, self.size) };
            let r = &self.range;
            let strtab = bytes.get(r.strtab_off..r.strtab_off + r.strtab_size)?;

            for i in 0..r.symtab_size / r.entsize {
                let off = r.symtab_off + i * r.entsize;
                let st_name = u32_at(bytes, off)? as usize;
                let st_info = *bytes.get(off + 4)?;
                let st_shndx = u16_at(bytes, off + 6)?;
                let st_value = u64_at(bytes, off + 8)?;

                if st_name == 0 || st_shndx == 0 || st_value == 0 {
                    continue;
                }
                let st_type = st_info & 0xf;
                if st_type != STT_FUNC && st_type != STT_OBJECT {
                    continue;
                }
                if st_name >= strtab.len() {
                    continue;
                }

                let rest = &strtab[st_name..];
                let end = rest.iter().position(|&b| b == 0)?;
                if &rest[..end] == name.as_bytes() {
                    return Some(st_value);
                }
            }
            None
        }
    }

    /// Resolver over one probed image. Owns the mapped image; dropping the
    /// resolver releases it.
    #[derive(Debug)]
    pub struct ProbeResolver {
        image: ImageSymtab,
        load_base: usize,
    }

    impl ProbeResolver {
        /// Probe the image containing the engine itself.
        pub fn new() -> Result<Self, HookError> {
            Self::for_address(Address::new(register_probe as usize))
        }

        /// Probe whichever loaded image maps `anchor`.
        pub fn for_address(anchor: Address) -> Result<Self, HookError> {
            let hit = register_probe(anchor.raw())?;
            let image = ImageSymtab::open(&hit.path)?;
            Ok(ProbeResolver {
                image,
                load_base: hit.load_base,
            })
        }
    }

    impl SymbolResolver for ProbeResolver {
        fn technique(&self) -> Technique {
            Technique::Probe
        }

        fn resolve(&self, name: &str) -> Result<ResolvedSymbol, HookError> {
            match self.image.lookup(name) {
                Some(value) => Ok(ResolvedSymbol {
                    name: name.to_string(),
                    address: Address::new(self.load_base.wrapping_add(value as usize)),
                    technique: Technique::Probe,
                }),
                None => Err(HookError::SymbolNotFound(name.to_string())),
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub struct ProbeResolver;

#[cfg(not(target_os = "linux"))]
impl ProbeResolver {
    pub fn new() -> Result<Self, HookError> {
        Err(HookError::Unsupported)
    }

    pub fn for_address(_anchor: Address) -> Result<Self, HookError> {
        Err(HookError::Unsupported)
    }
}

#[cfg(not(target_os = "linux"))]
impl SymbolResolver for ProbeResolver {
    fn technique(&self) -> Technique {
        Technique::Probe
    }

    fn resolve(&self, _name: &str) -> Result<ResolvedSymbol, HookError> {
        Err(HookError::Unsupported)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[unsafe(no_mangle)]
    extern "C" fn tabletap_probe_fixture_fn() -> u64 {
        41
    }

    #[unsafe(no_mangle)]
    static TABLETAP_PROBE_FIXTURE_CELL: u64 = 0x5a5a;

    #[test]
    fn resolves_a_function_in_our_own_image() {
        let resolver = ProbeResolver::new().expect("probe our own image");
        let sym = resolver.resolve("tabletap_probe_fixture_fn").expect("resolve");
        assert_eq!(sym.address.raw(), tabletap_probe_fixture_fn as usize);
        assert_eq!(sym.technique, Technique::Probe);
    }

    #[test]
    fn resolves_a_data_object_in_our_own_image() {
        let resolver = ProbeResolver::new().expect("probe our own image");
        let sym = resolver
            .resolve("TABLETAP_PROBE_FIXTURE_CELL")
            .expect("resolve");
        assert_eq!(
            sym.address.raw(),
            &TABLETAP_PROBE_FIXTURE_CELL as *const u64 as usize
        );
        // The resolved address really is the live object.
        let value = unsafe { *(sym.address.raw() as *const u64) };
        assert_eq!(value, 0x5a5a);
    }

    #[test]
    fn garbled_name_reports_symbol_not_found() {
        let resolver = ProbeResolver::new().expect("probe our own image");
        let err = resolver.resolve("no_such_symbol_zq9x").unwrap_err();
        assert_eq!(err, HookError::SymbolNotFound("no_such_symbol_zq9x".into()));
    }

    #[test]
    fn probing_an_unmapped_anchor_fails_registration() {
        // Page zero is never mapped.
        let err = ProbeResolver::for_address(Address::new(8)).unwrap_err();
        assert_eq!(err, HookError::ProbeRegistrationFailed);
    }

    #[test]
    fn probe_anchored_at_a_heap_address_fails_registration() {
        // Heap pages belong to no loaded image.
        let boxed = Box::new(0u64);
        let err = ProbeResolver::for_address(Address::new(&*boxed as *const u64 as usize))
            .unwrap_err();
        assert_eq!(err, HookError::ProbeRegistrationFailed);
    }
}
