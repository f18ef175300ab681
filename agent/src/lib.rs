//! tabletap-agent: loadable module wiring the interception engine to a host.
//!
//! Compiled as a cdylib and loaded into the target process (LD_PRELOAD or
//! dlopen). On load it brings up the toy character device, then activates
//! one interception session over the device's ops dispatch table; on unload
//! it restores every hooked slot before this library's code can disappear
//! from the address space.

pub mod chardev;
pub mod shims;

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use tabletap_intercept::{
    resolver, Address, HookSession, HookTarget, TableSpec, Technique, Trampoline,
};

/// The active interception session, if any.
static SESSION: Mutex<Option<HookSession>> = Mutex::new(None);

/// Saved original of the device's read entry. The traced replacement
/// forwards through this on every call; it is published before the slot
/// swap makes the replacement reachable.
static SAVED_READ: Trampoline = Trampoline::new();

/// Reads observed through the hooked entry since activation.
static READS_OBSERVED: AtomicU64 = AtomicU64::new(0);

/// Replacement for the device's read entry: forward, then account.
extern "C" fn traced_read(buf: *mut u8, len: usize, pos: *mut usize) -> isize {
    let original: extern "C" fn(*mut u8, usize, *mut usize) -> isize =
        unsafe { core::mem::transmute(SAVED_READ.original().raw()) };
    let n = original(buf, len, pos);
    READS_OBSERVED.fetch_add(1, Ordering::Relaxed);
    debug!("chardev read observed: {n} byte(s)");
    n
}

/// Resolution technique from `TABLETAP_RESOLVER` (`export` | `probe`).
///
/// Which technique a host build needs is configuration, not logic: the
/// default probe walk covers symbols the host never exported, while
/// `export` suffices when the table is part of the dynamic interface.
fn configured_technique() -> Technique {
    match std::env::var("TABLETAP_RESOLVER").as_deref() {
        Ok("export") => Technique::Export,
        Ok("probe") | Err(_) => Technique::Probe,
        Ok(other) => {
            warn!("unknown TABLETAP_RESOLVER value {other:?}, using probe");
            Technique::Probe
        }
    }
}

/// Dispatch-table symbol, overridable via `TABLETAP_TABLE`.
fn configured_table() -> String {
    std::env::var("TABLETAP_TABLE").unwrap_or_else(|_| "CHARDEV_OPS".to_string())
}

/// Resolve the table and install the static target list, in order.
pub fn activate() -> Result<()> {
    let mut guard = SESSION.lock().unwrap_or_else(|e| e.into_inner());
    if guard.is_some() {
        bail!("interception already active");
    }

    chardev::init_device();

    let technique = configured_technique();
    let resolver = resolver::for_technique(technique)
        .with_context(|| format!("building {technique:?} resolver"))?;
    let table_symbol = configured_table();

    let targets = [HookTarget {
        symbol: "device_read",
        replacement: Address::new(traced_read as usize),
        saved: &SAVED_READ,
    }];

    let session = HookSession::activate(
        resolver,
        &TableSpec {
            symbol: &table_symbol,
            entry_count: chardev::OPS_LEN,
        },
        &targets,
    )
    .with_context(|| format!("activating interception over {table_symbol}"))?;

    READS_OBSERVED.store(0, Ordering::Relaxed);
    info!(
        "interception active: {} hook(s) over {table_symbol}",
        session.installed()
    );
    *guard = Some(session);
    Ok(())
}

/// Restore every hooked slot in reverse installation order.
///
/// Tolerates being called with nothing active (teardown paths can be
/// reached more than once); an unverifiable restore is the severe case and
/// is surfaced as an error after teardown has still run to completion.
pub fn deactivate() -> Result<()> {
    let session = SESSION
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    let Some(session) = session else {
        warn!("deactivate called with no active interception");
        return Ok(());
    };

    session
        .deactivate()
        .context("restoring hooked table entries")?;
    info!("interception deactivated");
    Ok(())
}

/// Reads observed through the hooked entry since the last activation.
pub fn reads_observed() -> u64 {
    READS_OBSERVED.load(Ordering::Relaxed)
}

/// Activation surface: invoked once at load time.
#[unsafe(no_mangle)]
pub extern "C" fn tabletap_agent_init() -> i32 {
    let _ = env_logger::try_init();
    shims::on_load();
    match activate() {
        Ok(()) => 0,
        Err(e) => {
            error!("agent activation failed: {e:#}");
            -1
        }
    }
}

/// Deactivation surface: invoked once at unload time.
#[unsafe(no_mangle)]
pub extern "C" fn tabletap_agent_shutdown() {
    if let Err(e) = deactivate() {
        // There is no safe "leave it hooked" fallback once unload is
        // committed; make the failure loud.
        error!("agent deactivation failed, table may hold dangling entries: {e:#}");
    }
    shims::on_unload();
}

#[cfg(all(target_os = "linux", not(test)))]
extern "C" fn shutdown_at_exit() {
    tabletap_agent_shutdown();
}

/// Automatic initialisation on library load.
///
/// Stays passive unless `TABLETAP_AUTOLOAD` is set: the library is also
/// dlopened by tooling that only wants to inspect it, and hooking a host
/// that did not ask for it is not this module's call to make.
#[cfg(all(target_os = "linux", not(test)))]
#[unsafe(link_section = ".init_array")]
#[used]
static INIT: extern "C" fn() = {
    extern "C" fn init() {
        if std::env::var_os("TABLETAP_AUTOLOAD").is_none() {
            return;
        }
        if tabletap_agent_init() == 0 {
            unsafe {
                libc::atexit(shutdown_at_exit);
            }
        }
    }
    init
};

/// Process-global lock for tests that touch the shared device, the ops
/// table, or the agent environment variables.
#[cfg(test)]
pub(crate) fn lock_agent_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
