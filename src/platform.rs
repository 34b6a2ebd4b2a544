// Device services used by the update service

use std::time::Duration;

use esp_idf_hal::delay::FreeRtos;
use log::info;

use ota_core::ports::Platform;

const STA_IFKEY: &[u8] = b"WIFI_STA_DEF\0";

#[derive(Debug, Clone, Copy, Default)]
pub struct EspPlatform;

impl Platform for EspPlatform {
    fn is_connected(&self) -> bool {
        unsafe {
            let netif = esp_idf_sys::esp_netif_get_handle_from_ifkey(STA_IFKEY.as_ptr() as *const ::core::ffi::c_char);
            if netif.is_null() {
                return false;
            }
            let mut ip_info: esp_idf_sys::esp_netif_ip_info_t = std::mem::zeroed();
            esp_idf_sys::esp_netif_get_ip_info(netif, &mut ip_info) == esp_idf_sys::ESP_OK && ip_info.ip.addr != 0
        }
    }

    fn uptime(&self) -> Duration {
        let micros = unsafe { esp_idf_sys::esp_timer_get_time() };
        Duration::from_micros(micros.max(0) as u64)
    }

    fn delay(&self, duration: Duration) {
        FreeRtos::delay_ms(duration.as_millis().min(u32::MAX as u128) as u32);
    }

    fn yield_now(&self) {
        // Zero ticks yields to ready tasks without sleeping a full tick
        unsafe { esp_idf_sys::vTaskDelay(0) };
    }

    fn restart(&self) {
        info!("Restarting into the new firmware");
        log::logger().flush();
        unsafe { esp_idf_sys::esp_restart() };
    }

    fn free_heap(&self) -> Option<usize> {
        Some(unsafe { esp_idf_sys::esp_get_free_heap_size() } as usize)
    }
}
