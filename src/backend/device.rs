// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (graphics + present + extensions + surface support)
// - Logical device + queue creation
// - Memory allocator setup

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::{Instance, Surface};
use crate::error::SetupError;

/// Settings for instance and device construction
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub app_name: String,
    pub enable_validation: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "Vulkan Presenter".to_string(),
            enable_validation: false,
        }
    }
}

/// Device extensions that must be present for a GPU to be considered
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    pub extensions: Vec<CString>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            extensions: vec![ash::khr::swapchain::NAME.to_owned()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Distinct family indices, one queue is created per entry
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// What one queue family can do for us
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilySupport {
    pub queue_count: u32,
    pub graphics: bool,
    pub present: bool,
}

/// Everything selection needs to know about one physical device
#[derive(Debug, Clone, Default)]
pub struct DeviceCandidate {
    pub name: String,
    pub queue_families: Vec<QueueFamilySupport>,
    pub extensions: HashSet<CString>,
    pub format_count: usize,
    pub present_mode_count: usize,
}

impl DeviceCandidate {
    fn query(
        instance: &ash::Instance,
        surface: &Surface,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) }
                .iter()
                .enumerate()
                .map(|(i, family)| QueueFamilySupport {
                    queue_count: family.queue_count,
                    graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                    present: surface.supports_present(physical_device, i as u32),
                })
                .collect();

        let extensions =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .unwrap_or_default()
                .iter()
                .map(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }.to_owned())
                .collect();

        Self {
            name,
            queue_families,
            extensions,
            format_count: surface.formats(physical_device).map_or(0, |f| f.len()),
            present_mode_count: surface.present_modes(physical_device).map_or(0, |m| m.len()),
        }
    }

    /// Prefer one family that does both, else first graphics + first present.
    pub fn find_queue_families(&self) -> Option<QueueFamilyIndices> {
        let usable = || {
            self.queue_families
                .iter()
                .enumerate()
                .filter(|(_, family)| family.queue_count > 0)
        };

        if let Some((i, _)) = usable().find(|(_, f)| f.graphics && f.present) {
            return Some(QueueFamilyIndices {
                graphics: i as u32,
                present: i as u32,
            });
        }

        let graphics = usable().find(|(_, f)| f.graphics).map(|(i, _)| i as u32)?;
        let present = usable().find(|(_, f)| f.present).map(|(i, _)| i as u32)?;
        Some(QueueFamilyIndices { graphics, present })
    }

    pub fn missing_extensions<'a>(&self, required: &'a [CString]) -> Vec<&'a CString> {
        required
            .iter()
            .filter(|ext| !self.extensions.contains(*ext))
            .collect()
    }

    pub fn has_surface_support(&self) -> bool {
        self.format_count > 0 && self.present_mode_count > 0
    }
}

/// Pick the first candidate that passes every check.
///
/// When no device qualifies, a device that had the extensions and surface
/// support but lacked queues is reported as `NoSuitableQueueFamily`.
pub fn select_device(
    candidates: &[DeviceCandidate],
    requirements: &DeviceRequirements,
) -> Result<(usize, QueueFamilyIndices), SetupError> {
    let mut queue_failure = None;

    for (index, candidate) in candidates.iter().enumerate() {
        let missing = candidate.missing_extensions(&requirements.extensions);
        if !missing.is_empty() {
            log::debug!("Skipping {}: missing extensions {:?}", candidate.name, missing);
            continue;
        }
        if !candidate.has_surface_support() {
            log::debug!(
                "Skipping {}: {} surface formats, {} present modes",
                candidate.name,
                candidate.format_count,
                candidate.present_mode_count
            );
            continue;
        }
        match candidate.find_queue_families() {
            Some(families) => return Ok((index, families)),
            None => {
                log::debug!("Skipping {}: no graphics/present queue family", candidate.name);
                queue_failure.get_or_insert_with(|| candidate.name.clone());
            }
        }
    }

    Err(match queue_failure {
        Some(device) => SetupError::NoSuitableQueueFamily { device },
        None => SetupError::NoSuitableDevice,
    })
}

/// Selected GPU, logical device and its queues
pub struct DeviceContext {
    allocator: ManuallyDrop<Mutex<gpu_allocator::vulkan::Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,
    instance: Arc<Instance>,
}

impl DeviceContext {
    /// Select a device able to render to and present on `surface`.
    pub fn initialize(
        surface: &Surface,
        requirements: &DeviceRequirements,
    ) -> Result<Arc<Self>, SetupError> {
        let instance = surface.instance().clone();

        let physical_devices = unsafe { instance.raw.enumerate_physical_devices() }
            .map_err(SetupError::vulkan("vkEnumeratePhysicalDevices"))?;
        if physical_devices.is_empty() {
            return Err(SetupError::NoSuitableDevice);
        }

        let candidates: Vec<_> = physical_devices
            .iter()
            .map(|&pd| DeviceCandidate::query(&instance.raw, surface, pd))
            .collect();

        let (index, queue_families) = select_device(&candidates, requirements)?;
        let physical_device = physical_devices[index];

        let properties = unsafe { instance.raw.get_physical_device_properties(physical_device) };
        log::info!("Selected GPU: {}", candidates[index].name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} present={}",
            queue_families.graphics,
            queue_families.present
        );

        let device = Self::create_logical_device(
            &instance.raw,
            physical_device,
            queue_families,
            requirements,
        )?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };

        let allocator = match gpu_allocator::vulkan::Allocator::new(
            &gpu_allocator::vulkan::AllocatorCreateDesc {
                instance: instance.raw.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            },
        ) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device,
            graphics_queue,
            present_queue,
            queue_families,
            instance,
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilyIndices,
        requirements: &DeviceRequirements,
    ) -> Result<ash::Device, SetupError> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions: Vec<*const c_char> =
            requirements.extensions.iter().map(|e| e.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(SetupError::vulkan("vkCreateDevice"))
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn allocator(&self) -> &Mutex<gpu_allocator::vulkan::Allocator> {
        &self.allocator
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> ash::prelude::VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            // The allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}
