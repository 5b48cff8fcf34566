//! Device services the agent needs beyond networking.
//!
//! - [`HostPlatform`] - records requests and logs them (development, tests)
//! - `EspPlatform` - ESP-IDF restart and log control (ESP32 only)
//! - `mount_storage` - data partition for settings and uploads (ESP32 only)

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where the device mounts its data partition. Relative settings and
/// upload paths are placed under it.
pub const STORAGE_ROOT: &str = "/storage";

/// Reboot and debug-output control.
pub trait Platform {
    /// Restart the device. On real hardware this does not return.
    fn reboot(&mut self);

    /// Silence the platform's diagnostic output.
    fn suppress_debug_output(&mut self);
}

/// Host stand-in: nothing is restarted, requests are logged and recorded.
///
/// Clones share their flags, so a test can keep one handle and give the
/// other to the server.
#[derive(Debug, Clone, Default)]
pub struct HostPlatform {
    rebooted: Arc<AtomicBool>,
    debug_suppressed: Arc<AtomicBool>,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a reboot has been requested.
    pub fn reboot_requested(&self) -> bool {
        self.rebooted.load(Ordering::Acquire)
    }

    pub fn debug_suppressed(&self) -> bool {
        self.debug_suppressed.load(Ordering::Acquire)
    }
}

impl Platform for HostPlatform {
    fn reboot(&mut self) {
        info!("Reboot requested (host build: not restarting)");
        self.rebooted.store(true, Ordering::Release);
    }

    fn suppress_debug_output(&mut self) {
        warn!("Debug output disabled by configuration");
        log::set_max_level(log::LevelFilter::Warn);
        self.debug_suppressed.store(true, Ordering::Release);
    }
}

#[cfg(feature = "esp32")]
pub use esp::{mount_storage, EspPlatform};

#[cfg(feature = "esp32")]
mod esp {
    use super::{Platform, STORAGE_ROOT};
    use esp_idf_sys::EspError;
    use log::info;

    /// Mount the first SPIFFS partition at [`STORAGE_ROOT`], formatting it
    /// when it cannot be mounted as is.
    pub fn mount_storage() -> Result<(), EspError> {
        let conf = esp_idf_sys::esp_vfs_spiffs_conf_t {
            base_path: c"/storage".as_ptr(),
            partition_label: std::ptr::null(),
            max_files: 4,
            format_if_mount_failed: true,
        };
        // SAFETY: conf points at static strings; ESP-IDF copies what it keeps.
        EspError::convert(unsafe { esp_idf_sys::esp_vfs_spiffs_register(&conf) })?;
        info!("Storage mounted at {}", STORAGE_ROOT);
        Ok(())
    }

    /// ESP-IDF restart and log level control.
    #[derive(Debug, Default)]
    pub struct EspPlatform;

    impl EspPlatform {
        pub fn new() -> Self {
            Self
        }
    }

    impl Platform for EspPlatform {
        fn reboot(&mut self) {
            info!("Restarting device");
            // SAFETY: esp_restart has no preconditions and does not return.
            unsafe { esp_idf_sys::esp_restart() };
        }

        fn suppress_debug_output(&mut self) {
            // SAFETY: the tag is a NUL-terminated static string.
            unsafe {
                esp_idf_sys::esp_log_level_set(
                    c"*".as_ptr(),
                    esp_idf_sys::esp_log_level_t_ESP_LOG_NONE,
                );
            }
            log::set_max_level(log::LevelFilter::Off);
        }
    }
}
