//! Snapshot view of the process address space.
//!
//! The write barrier needs the current protection of a page before it can
//! flip it writable and put it back, and the table locator needs to know
//! whether an entry points into executable memory. Both read `/proc/self/maps`.

use crate::types::HookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Region {
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// The region's current permissions as `mprotect` flags.
    #[cfg(target_os = "linux")]
    pub(crate) fn prot_flags(&self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.read {
            prot |= libc::PROT_READ;
        }
        if self.write {
            prot |= libc::PROT_WRITE;
        }
        if self.exec {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Parse the current memory map.
#[cfg(target_os = "linux")]
pub fn regions() -> Result<Vec<Region>, HookError> {
    let text = std::fs::read_to_string("/proc/self/maps")
        .map_err(|e| HookError::Protection(e.raw_os_error().unwrap_or(0)))?;
    Ok(text.lines().filter_map(parse_line).collect())
}

#[cfg(not(target_os = "linux"))]
pub fn regions() -> Result<Vec<Region>, HookError> {
    Err(HookError::Unsupported)
}

/// A maps line is `start-end perms offset dev inode [path]`.
#[cfg(target_os = "linux")]
fn parse_line(line: &str) -> Option<Region> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?.as_bytes();
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    if perms.len() < 3 || end <= start {
        return None;
    }
    Some(Region {
        start,
        end,
        read: perms[0] == b'r',
        write: perms[1] == b'w',
        exec: perms[2] == b'x',
    })
}

/// The mapped region containing `addr`, if any.
pub fn region_containing(addr: usize) -> Result<Option<Region>, HookError> {
    Ok(regions()?.into_iter().find(|r| r.contains(addr)))
}

/// Whether `addr` lands inside a currently mapped executable region.
pub fn is_code_address(addr: usize) -> bool {
    matches!(region_containing(addr), Ok(Some(r)) if r.exec)
}

/// Whether the `len` bytes starting at `addr` are mapped readable.
///
/// A span crossing a region boundary is rejected; a dispatch table split
/// across differently-protected mappings is not something this engine will
/// write into.
pub fn is_readable_span(addr: usize, len: usize) -> bool {
    match region_containing(addr) {
        Ok(Some(r)) => r.read && addr.checked_add(len).is_some_and(|end| end <= r.end),
        _ => false,
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn regions_cover_our_own_code() {
        let addr = regions_cover_our_own_code as usize;
        assert!(is_code_address(addr), "test function must be in an exec mapping");
    }

    #[test]
    fn heap_data_is_not_code() {
        let boxed = Box::new(0u64);
        assert!(!is_code_address(&*boxed as *const u64 as usize));
    }

    #[test]
    fn parse_line_reads_range_and_perms() {
        let r = parse_line("7f5c000-7f60000 r-xp 00000000 00:00 0 /lib/x.so").unwrap();
        assert_eq!((r.start, r.end), (0x7f5c000, 0x7f60000));
        assert!(r.read && r.exec && !r.write);
        assert!(parse_line("garbage").is_none());
    }

    #[test]
    fn readable_span_rejects_region_overrun() {
        let page_sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let pages = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                page_sz * 2,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(pages, libc::MAP_FAILED);
        let base = pages as usize;
        // Different protection on the second page forces a region boundary.
        unsafe {
            libc::mprotect((base + page_sz) as *mut libc::c_void, page_sz, libc::PROT_NONE);
        }
        assert!(is_readable_span(base, page_sz));
        assert!(!is_readable_span(base, page_sz * 2));
        unsafe { libc::munmap(pages, page_sz * 2) };
    }
}
