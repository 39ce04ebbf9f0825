//! Spawning threads with FreeRTOS task names
//!
//! `std::thread::Builder::name()` only renames the pthread after the FreeRTOS
//! task was created with the default name, so the name (and core affinity)
//! go through `ThreadSpawnConfiguration` before spawning instead.

use anyhow::Result;
use esp_idf_hal::cpu::Core;
use esp_idf_hal::task::thread::ThreadSpawnConfiguration;
use std::ffi::CStr;
use std::thread::JoinHandle;

/// Spawn `f` as a FreeRTOS task named `name` (at most 15 characters),
/// optionally pinned to `core`.
pub fn spawn_named<F, T>(name: &'static CStr, core: Option<Core>, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let prev_conf = ThreadSpawnConfiguration::get();

    ThreadSpawnConfiguration {
        name: Some(name.to_bytes_with_nul()),
        pin_to_core: core,
        ..Default::default()
    }
    .set()?;

    let handle = std::thread::spawn(f);

    // Restore whatever was configured before, for threads spawned elsewhere
    match prev_conf {
        Some(prev) => prev.set()?,
        None => ThreadSpawnConfiguration::default().set()?,
    }

    Ok(handle)
}
