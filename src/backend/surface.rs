// Presentation surface
//
// The window side of the swapchain. Destroyed before the instance it was
// created from, which the `Arc<Instance>` it holds guarantees.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::Instance;
use crate::error::SetupError;

pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: ash::khr::surface::Instance,
    instance: Arc<Instance>,
}

impl Surface {
    /// Create a surface for a native window.
    ///
    /// # Safety
    /// The handles must refer to a live window that outlives the surface.
    pub unsafe fn new(
        instance: Arc<Instance>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self, SetupError> {
        let handle =
            ash_window::create_surface(&instance.entry, &instance.raw, display, window, None)
                .map_err(|e| SetupError::Surface(e.to_string()))?;
        let loader = ash::khr::surface::Instance::new(&instance.entry, &instance.raw);

        Ok(Self {
            handle,
            loader,
            instance,
        })
    }

    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, family: u32) -> bool {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, family, self.handle)
        }
        .unwrap_or(false)
    }

    pub fn capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> ash::prelude::VkResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
        }
    }

    pub fn formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> ash::prelude::VkResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_formats(physical_device, self.handle)
        }
    }

    pub fn present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> ash::prelude::VkResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)
        }
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        log::debug!("Destroying surface");
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}
