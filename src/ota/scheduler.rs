// FreeRTOS scheduler - task creation and suspend/resume for the update service

use std::ffi::{c_void, CStr, CString};

use esp_idf_sys::*;
use log::{debug, info};

use ota_core::ports::{SchedulerError, TaskEntry, TaskScheduler};

/// FreeRTOS task handle, stored by address so it can cross tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

impl TaskId {
    fn from_raw(handle: TaskHandle_t) -> Self {
        Self(handle as usize)
    }

    fn raw(self) -> TaskHandle_t {
        self.0 as TaskHandle_t
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FreeRtosScheduler;

impl FreeRtosScheduler {
    pub fn new() -> Self {
        Self
    }
}

extern "C" fn task_wrapper(arg: *mut c_void) {
    unsafe {
        let entry = Box::from_raw(arg as *mut TaskEntry);
        entry();
        vTaskDelete(std::ptr::null_mut());
    }
}

impl TaskScheduler for FreeRtosScheduler {
    type Handle = TaskId;

    fn spawn(&self, name: &str, stack_size: usize, priority: u8, entry: TaskEntry) -> Result<TaskId, SchedulerError> {
        let name_cstr = CString::new(name).map_err(|_| SchedulerError(ESP_ERR_INVALID_ARG as i32))?;
        let entry_ptr = Box::into_raw(Box::new(entry)) as *mut c_void;

        let mut task_handle: TaskHandle_t = std::ptr::null_mut();
        let result = unsafe {
            xTaskCreatePinnedToCore(
                Some(task_wrapper),
                name_cstr.as_ptr(),
                stack_size as u32,
                entry_ptr,
                priority as UBaseType_t,
                &mut task_handle,
                tskNO_AFFINITY as BaseType_t,
            )
        };

        if result != 1 {
            // pdPASS == 1; the task never ran so the closure is still ours
            drop(unsafe { Box::from_raw(entry_ptr as *mut TaskEntry) });
            return Err(SchedulerError(result));
        }

        info!("Created task '{}' with priority {} (stack {})", name, priority, stack_size);
        Ok(TaskId::from_raw(task_handle))
    }

    fn current(&self) -> TaskId {
        TaskId::from_raw(unsafe { xTaskGetCurrentTaskHandle() })
    }

    fn units(&self) -> Vec<(TaskId, String)> {
        unsafe {
            // Leave room for tasks created between the two calls
            let capacity = uxTaskGetNumberOfTasks() as usize + 4;
            let mut statuses: Vec<TaskStatus_t> = Vec::with_capacity(capacity);
            let filled = uxTaskGetSystemState(
                statuses.as_mut_ptr(),
                capacity as UBaseType_t,
                std::ptr::null_mut(),
            ) as usize;
            statuses.set_len(filled.min(capacity));

            // Tasks already suspended by their owners stay out of quiescence
            statuses
                .iter()
                .filter(|status| status.eCurrentState != eTaskState_eSuspended)
                .map(|status| {
                    let name = if status.pcTaskName.is_null() {
                        String::new()
                    } else {
                        CStr::from_ptr(status.pcTaskName).to_string_lossy().into_owned()
                    };
                    (TaskId::from_raw(status.xHandle), name)
                })
                .collect()
        }
    }

    fn suspend(&self, handle: TaskId) {
        debug!("Suspending task {:?}", handle);
        unsafe { vTaskSuspend(handle.raw()) };
    }

    fn resume(&self, handle: TaskId) {
        debug!("Resuming task {:?}", handle);
        unsafe { vTaskResume(handle.raw()) };
    }
}
