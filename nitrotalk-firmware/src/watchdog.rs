//! Task Watchdog Timer (TWDT) users for the long-running threads
//!
//! The link task and the polling scheduler each register as a user and feed
//! on every pass of their loops; the longest single pass (a full adapter
//! initialization) has to fit in the timeout set in `sdkconfig.defaults`.

use anyhow::{bail, Result};
use esp_idf_svc::sys::{
    esp_task_wdt_add_user, esp_task_wdt_delete_user, esp_task_wdt_reset_user,
    esp_task_wdt_user_handle_t,
};
use log::{debug, error};
use std::ffi::CStr;

/// Heartbeat for a thread loop: feeds the watchdog when registration
/// succeeded, otherwise does nothing and the thread runs unsupervised.
///
/// Call from inside the thread that will feed it.
pub fn heartbeat(name: &'static CStr) -> impl FnMut() {
    let watchdog = match WatchdogHandle::register(name) {
        Ok(watchdog) => Some(watchdog),
        Err(e) => {
            error!("{e}, running {name:?} unsupervised");
            None
        }
    };
    move || {
        if let Some(watchdog) = &watchdog {
            watchdog.feed();
        }
    }
}

/// A registered watchdog user. Unregisters on drop.
pub struct WatchdogHandle {
    handle: esp_task_wdt_user_handle_t,
    name: &'static CStr,
}

impl WatchdogHandle {
    pub fn register(name: &'static CStr) -> Result<Self> {
        let mut handle: esp_task_wdt_user_handle_t = std::ptr::null_mut();

        let result = unsafe { esp_task_wdt_add_user(name.as_ptr(), &mut handle) };
        if result != 0 {
            bail!("failed to register watchdog user {name:?}: error code {result}");
        }
        debug!("Watchdog: registered user {name:?}");
        Ok(Self { handle, name })
    }

    pub fn feed(&self) {
        let result = unsafe { esp_task_wdt_reset_user(self.handle) };
        if result != 0 {
            error!("Watchdog: failed to feed {:?}", self.name);
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        debug!("Watchdog: unregistering user {:?}", self.name);
        let result = unsafe { esp_task_wdt_delete_user(self.handle) };
        if result != 0 {
            error!(
                "Watchdog: failed to unregister {:?}: error code {result}",
                self.name
            );
        }
    }
}
