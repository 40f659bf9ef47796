// Synchronization primitives
//
// Semaphores order acquire -> submit -> present on the GPU timeline.
// The fence is the only CPU-visible signal: it bounds how far the CPU
// can run ahead of the GPU.
//
// None of this depends on the swapchain, so it survives recreation.

use ash::vk;

use super::DeviceContext;
use crate::error::{EngineError, Result};

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &DeviceContext) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
        };

        let created = unsafe {
            (|| -> ash::prelude::VkResult<()> {
                sync.image_available = device.device.create_semaphore(&semaphore_info, None)?;
                sync.render_finished = device.device.create_semaphore(&semaphore_info, None)?;
                sync.in_flight_fence = device.device.create_fence(&fence_info, None)?;
                Ok(())
            })()
        };

        match created {
            Ok(()) => Ok(sync),
            Err(result) => {
                sync.destroy(device);
                Err(EngineError::creation("frame sync objects")(result))
            }
        }
    }

    /// Create one sync slot per frame in flight
    pub fn create_slots(device: &DeviceContext, count: usize) -> Result<Vec<Self>> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            match Self::new(device) {
                Ok(sync) => slots.push(sync),
                Err(e) => {
                    slots.iter().for_each(|s: &FrameSync| s.destroy(device));
                    return Err(e);
                }
            }
        }
        Ok(slots)
    }

    /// Block until the last submission that used this slot has finished
    pub fn wait(&self, device: &DeviceContext) -> Result<()> {
        unsafe {
            device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .map_err(EngineError::presentation("fence wait"))
    }

    pub fn destroy(&self, device: &DeviceContext) {
        unsafe {
            if self.image_available != vk::Semaphore::null() {
                device.device.destroy_semaphore(self.image_available, None);
            }
            if self.render_finished != vk::Semaphore::null() {
                device.device.destroy_semaphore(self.render_finished, None);
            }
            if self.in_flight_fence != vk::Fence::null() {
                device.device.destroy_fence(self.in_flight_fence, None);
            }
        }
    }
}
