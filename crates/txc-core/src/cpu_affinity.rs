//! Pinning of hot threads (callback forwarding) to a CPU core.

use tracing::{info, warn};

/// Pin the calling thread to `core_id`. Returns whether the OS accepted it.
pub fn pin_current_thread(core_id: usize) -> bool {
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    match cores.iter().find(|c| c.id == core_id) {
        Some(core) => {
            let ok = core_affinity::set_for_current(*core);
            if ok {
                info!("thread pinned to CPU core {core_id}");
            } else {
                warn!("failed to pin thread to CPU core {core_id}");
            }
            ok
        }
        None => {
            warn!("CPU core {core_id} not available ({} cores)", cores.len());
            false
        }
    }
}

/// Config helper: negative or missing ids mean "don't pin".
pub fn maybe_pin(core_id: Option<i32>) -> bool {
    match core_id {
        Some(id) if id >= 0 => pin_current_thread(id as usize),
        _ => false,
    }
}
