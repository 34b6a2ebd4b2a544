// Flash update driver - writes the image into the inactive app slot via the ESP-IDF OTA API

use anyhow::{bail, Result};
use core::ffi::c_void;
use esp_idf_sys::{
    esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_t,
    ESP_ERR_INVALID_SIZE, ESP_ERR_INVALID_STATE, ESP_ERR_OTA_VALIDATE_FAILED, ESP_OK,
    OTA_SIZE_UNKNOWN,
};
use log::{debug, info, warn};

use ota_core::ports::{FlashError, FlashUpdater, ImageSize};

pub struct EspFlashUpdater {
    update_partition: *const esp_partition_t,
    ota_handle: Option<esp_ota_handle_t>,
    expected_size: Option<usize>,
    bytes_written: usize,
    finished: bool,
    last_error: i32,
}

// The partition pointer refers to the static partition table
unsafe impl Send for EspFlashUpdater {}

impl EspFlashUpdater {
    pub fn new() -> Result<Self> {
        let update_partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if update_partition.is_null() {
            bail!("No OTA update partition in the partition table");
        }

        Ok(Self {
            update_partition,
            ota_handle: None,
            expected_size: None,
            bytes_written: 0,
            finished: false,
            last_error: ESP_OK,
        })
    }

    pub fn slot_size(&self) -> usize {
        unsafe { (*self.update_partition).size as usize }
    }

    fn fail(&mut self, code: i32) -> FlashError {
        self.last_error = code;
        FlashError { code }
    }
}

impl FlashUpdater for EspFlashUpdater {
    fn begin(&mut self, size: ImageSize) -> Result<(), FlashError> {
        self.abort();
        self.finished = false;
        self.bytes_written = 0;

        let (image_size, expected) = match size {
            ImageSize::Known(n) => {
                let n = n as usize;
                if n > self.slot_size() {
                    warn!("Image of {} bytes does not fit the {} byte slot", n, self.slot_size());
                    return Err(self.fail(ESP_ERR_INVALID_SIZE as i32));
                }
                (n, Some(n))
            }
            // Unknown size erases the whole slot up front
            ImageSize::Unknown => (OTA_SIZE_UNKNOWN as usize, None),
        };

        let mut handle: esp_ota_handle_t = 0;
        let result = unsafe { esp_ota_begin(self.update_partition, image_size as _, &mut handle) };
        if result != ESP_OK {
            return Err(self.fail(result));
        }

        info!("Flash session opened ({:?})", size);
        self.ota_handle = Some(handle);
        self.expected_size = expected;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let Some(handle) = self.ota_handle else {
            self.last_error = ESP_ERR_INVALID_STATE as i32;
            return 0;
        };

        let result = unsafe { esp_ota_write(handle, data.as_ptr() as *const c_void, data.len() as _) };
        if result != ESP_OK {
            self.last_error = result;
            return 0;
        }
        self.bytes_written += data.len();
        data.len()
    }

    fn abort(&mut self) {
        if let Some(handle) = self.ota_handle.take() {
            let result = unsafe { esp_ota_abort(handle) };
            debug!("Flash session aborted after {} bytes (code {})", self.bytes_written, result);
        }
    }

    fn end(&mut self, allow_partial: bool) -> Result<(), FlashError> {
        let Some(handle) = self.ota_handle.take() else {
            return Err(self.fail(ESP_ERR_INVALID_STATE as i32));
        };

        if let Some(expected) = self.expected_size {
            if !allow_partial && self.bytes_written != expected {
                unsafe { esp_ota_abort(handle) };
                return Err(self.fail(ESP_ERR_INVALID_SIZE as i32));
            }
        }

        // esp_ota_end releases the handle whatever it returns
        let result = unsafe { esp_ota_end(handle) };
        if result == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
            warn!("Image validation failed");
            return Err(self.fail(result));
        } else if result != ESP_OK {
            return Err(self.fail(result));
        }

        let result = unsafe { esp_ota_set_boot_partition(self.update_partition) };
        if result != ESP_OK {
            return Err(self.fail(result));
        }

        info!("Image of {} bytes committed and selected for boot", self.bytes_written);
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn last_error(&self) -> i32 {
        self.last_error
    }
}
