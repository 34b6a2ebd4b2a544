/// Get the last reset reason as a string
pub fn get_reset_reason() -> &'static str {
    let reason = unsafe { esp_idf_sys::esp_reset_reason() };

    match reason {
        esp_idf_sys::esp_reset_reason_t_ESP_RST_POWERON => "Power-on",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_EXT => "External pin",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SW => "Software reset",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_PANIC => "Panic",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_INT_WDT => "Interrupt watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_TASK_WDT => "Task watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_WDT => "Other watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "Deep sleep",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "Brownout",
        _ => "Unknown",
    }
}

/// Label of the app partition the device booted from
pub fn running_partition() -> String {
    unsafe {
        let partition = esp_idf_sys::esp_ota_get_running_partition();
        if partition.is_null() {
            return "unknown".to_string();
        }
        std::ffi::CStr::from_ptr((*partition).label.as_ptr())
            .to_string_lossy()
            .into_owned()
    }
}

/// Keep the running image: cancels a pending rollback after an update
pub fn confirm_running_image() {
    let result = unsafe { esp_idf_sys::esp_ota_mark_app_valid_cancel_rollback() };
    if result == esp_idf_sys::ESP_OK {
        log::info!("Running image marked valid");
    } else {
        log::warn!("Could not mark running image valid: {}", result);
    }
}
