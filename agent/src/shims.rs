//! Minimal lifecycle shims bracketing the engine's activate/deactivate.

use log::info;

pub fn on_load() {
    info!("tabletap agent loaded (pid {})", std::process::id());
}

pub fn on_unload() {
    info!("tabletap agent unloaded (pid {})", std::process::id());
}
