use esp_idf_hal::delay::FreeRtos;
use log::{error, info, warn};
use sentinel_core::{Millis, MonotonicClock, SystemControl};

/// Monotonic milliseconds from the high-resolution ESP timer.
pub struct EspClock;

impl MonotonicClock for EspClock {
    fn now(&self) -> Millis {
        let micros = unsafe { esp_idf_sys::esp_timer_get_time() };
        // Truncation is intended: probation timers use wrapping differences.
        Millis((micros / 1000) as u32)
    }
}

/// Boot-slot control through the ESP-IDF OTA API.
pub struct EspSystemControl;

impl SystemControl for EspSystemControl {
    fn has_previous_image(&self) -> bool {
        unsafe { esp_idf_sys::esp_ota_check_rollback_is_possible() }
    }

    fn rollback_and_restart(&mut self) {
        info!("Switching boot slot to previous image");
        log::logger().flush();
        FreeRtos::delay_ms(500);

        // Marks the running slot invalid, selects the other one and restarts.
        // Only returns if the rollback could not be set up.
        let err = unsafe { esp_idf_sys::esp_ota_mark_app_invalid_rollback_and_reboot() };
        error!("Rollback refused by OTA layer (error {}), restarting instead", err);
        self.restart();
    }

    fn restart(&mut self) {
        warn!("Restarting device");
        log::logger().flush();
        // Give the UART time to drain
        FreeRtos::delay_ms(1000);
        unsafe { esp_idf_sys::esp_restart() }
    }

    fn mark_running_image_valid(&mut self) {
        let result = unsafe { esp_idf_sys::esp_ota_mark_app_valid_cancel_rollback() };
        if result != esp_idf_sys::ESP_OK {
            warn!("Bootloader did not accept image validation: {}", result);
        }
    }
}

/// Get the last reset reason as a string
pub fn reset_reason() -> &'static str {
    let reason = unsafe { esp_idf_sys::esp_reset_reason() };

    match reason {
        esp_idf_sys::esp_reset_reason_t_ESP_RST_UNKNOWN => "Unknown",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_POWERON => "Power-on",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_EXT => "External pin",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SW => "Software reset",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_PANIC => "Panic",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_INT_WDT => "Interrupt watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_TASK_WDT => "Task watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_WDT => "Other watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "Deep sleep",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "Brownout",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SDIO => "SDIO",
        _ => "Unknown reason code",
    }
}

/// Put the calling task under the task watchdog.
pub fn watch_current_task() {
    unsafe {
        let result = esp_idf_sys::esp_task_wdt_add(std::ptr::null_mut());
        if result == esp_idf_sys::ESP_OK {
            info!("Control loop added to task watchdog");
        } else {
            warn!("Failed to add task to watchdog: {:?}", result);
        }
    }
}

pub fn feed_task_watchdog() {
    unsafe {
        esp_idf_sys::esp_task_wdt_reset();
    }
}
