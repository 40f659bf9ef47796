// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// together with everything that depends on them (views, framebuffers).
// A SwapchainState is built and destroyed as one unit; callers never see
// a half-built one.

use ash::vk;
use std::sync::Arc;

use super::pipeline::{PipelineProvider, PipelineSet, PipelineSwap};
use super::{DeviceContext, QueueFamilyIndices, Surface};
use crate::error::{EngineError, Result};
use crate::frame::{AcquireOutcome, PresentOutcome};

/// Format and present mode we ask for when the surface allows it
#[derive(Debug, Clone, Copy)]
pub struct SwapchainPreferences {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::MAILBOX,
        }
    }
}

/// Surface properties, queried fresh for every creation
#[derive(Debug, Clone, Default)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(surface: &Surface, physical_device: vk::PhysicalDevice) -> Result<Self> {
        Ok(Self {
            capabilities: surface
                .capabilities(physical_device)
                .map_err(EngineError::creation("surface capabilities"))?,
            formats: surface
                .formats(physical_device)
                .map_err(EngineError::creation("surface formats"))?,
            present_modes: surface
                .present_modes(physical_device)
                .map_err(EngineError::creation("surface present modes"))?,
        })
    }
}

/// Resolved creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    pub fn resolve(
        support: &SwapchainSupport,
        preferences: &SwapchainPreferences,
        desired: vk::Extent2D,
    ) -> Self {
        Self {
            surface_format: choose_surface_format(&support.formats, preferences.surface_format),
            present_mode: choose_present_mode(&support.present_modes, preferences.present_mode),
            extent: choose_extent(&support.capabilities, desired),
            image_count: choose_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
        }
    }

    /// A minimized window can report a fixed 0x0 extent, which no swapchain
    /// can be created at.
    pub fn is_degenerate(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }
}

/// A lone UNDEFINED entry means the surface has no preference.
pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> vk::SurfaceFormatKHR {
    match available {
        [] => preferred,
        [only] if only.format == vk::Format::UNDEFINED => preferred,
        _ => available
            .iter()
            .copied()
            .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
            .unwrap_or(available[0]),
    }
}

pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO // FIFO is always supported
    }
}

/// `current_extent.width == u32::MAX` means the surface lets us pick.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: desired
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: desired
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped unless max is 0 (unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Concurrent sharing across both families when they differ.
pub fn sharing_for(families: QueueFamilyIndices) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![families.graphics, families.present],
        )
    }
}

/// One generation of presentation resources.
///
/// Images belong to the presentation engine; views and framebuffers are ours.
/// `images`, `image_views` and `framebuffers` always have the same length
/// once the state leaves the manager.
#[derive(Debug)]
pub struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub epoch: u64,
}

impl SwapchainState {
    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

pub struct SwapchainManager {
    loader: ash::khr::swapchain::Device,
    preferences: SwapchainPreferences,
    next_epoch: u64,
    surface: Arc<Surface>,
    device: Arc<DeviceContext>,
}

impl SwapchainManager {
    pub fn new(
        device: Arc<DeviceContext>,
        surface: Arc<Surface>,
        preferences: SwapchainPreferences,
    ) -> Self {
        let loader = ash::khr::swapchain::Device::new(&device.instance().raw, &device.device);
        Self {
            loader,
            preferences,
            next_epoch: 0,
            surface,
            device,
        }
    }

    /// Resolve creation parameters against the surface as it is right now.
    pub fn plan(&self, desired: vk::Extent2D) -> Result<SwapchainPlan> {
        let support = SwapchainSupport::query(&self.surface, self.device.physical_device)?;
        Ok(SwapchainPlan::resolve(&support, &self.preferences, desired))
    }

    /// Build a complete SwapchainState from a non-degenerate plan.
    ///
    /// `previous` is handed to the driver as `oldSwapchain`; it stays owned
    /// by the caller, who destroys it once nothing in flight references it.
    /// A new pipeline set is built when the plan's format differs from
    /// `pipeline`. The returned swap still holds the current set; the caller
    /// commits or abandons it together with the state.
    pub fn create(
        &mut self,
        previous: Option<&SwapchainState>,
        plan: &SwapchainPlan,
        pipeline: Option<PipelineSet>,
        pipelines: &mut dyn PipelineProvider,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<(SwapchainState, PipelineSwap)> {
        let (sharing_mode, family_indices) = sharing_for(self.device.queue_families);

        log::info!(
            "Creating swapchain: {}x{} {:?}/{:?} {:?}, {} images requested (epoch {})",
            plan.extent.width,
            plan.extent.height,
            plan.surface_format.format,
            plan.surface_format.color_space,
            plan.present_mode,
            plan.image_count,
            self.next_epoch
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface.handle)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(plan.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true)
            .old_swapchain(previous.map_or(vk::SwapchainKHR::null(), |p| p.swapchain));

        let swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .map_err(EngineError::creation("swapchain"))?;

        let mut state = SwapchainState {
            swapchain,
            surface_format: plan.surface_format,
            present_mode: plan.present_mode,
            extent: plan.extent,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            epoch: self.next_epoch,
        };

        let populated = self.populate(&mut state, |format| {
            PipelineSwap::prepare(pipeline, format, |format| {
                pipelines.build(&self.device, format, set_layouts)
            })
        });
        let swap = match populated {
            Ok(swap) => swap,
            Err(e) => {
                log::error!("Swapchain creation failed, tearing down partial state: {}", e);
                self.destroy(state);
                return Err(e);
            }
        };

        log::info!("Created swapchain with {} images", state.images.len());
        self.next_epoch += 1;
        Ok((state, swap))
    }

    /// Images, views, pipeline, framebuffers. A pipeline built here is
    /// destroyed again if the framebuffers fail.
    fn populate(
        &self,
        state: &mut SwapchainState,
        prepare: impl FnOnce(vk::Format) -> anyhow::Result<PipelineSwap>,
    ) -> Result<PipelineSwap> {
        // The driver may hand back more images than requested
        state.images = unsafe { self.loader.get_swapchain_images(state.swapchain) }
            .map_err(EngineError::creation("swapchain images"))?;

        for &image in &state.images {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(state.surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { self.device.device.create_image_view(&create_info, None) }
                .map_err(EngineError::creation("image view"))?;
            state.image_views.push(view);
        }

        let swap = prepare(state.format())?;
        if let Err(e) = self.create_framebuffers(state, swap.active().render_pass) {
            if let Some(fresh) = swap.abandon() {
                fresh.destroy(&self.device);
            }
            return Err(e);
        }
        Ok(swap)
    }

    fn create_framebuffers(
        &self,
        state: &mut SwapchainState,
        render_pass: vk::RenderPass,
    ) -> Result<()> {
        for &view in &state.image_views {
            let attachments = [view];
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(state.extent.width)
                .height(state.extent.height)
                .layers(1);

            let framebuffer = unsafe { self.device.device.create_framebuffer(&create_info, None) }
                .map_err(EngineError::creation("framebuffer"))?;
            state.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    /// Framebuffers, then views, then the swapchain. Images are left to
    /// the presentation engine.
    pub fn destroy(&self, state: SwapchainState) {
        log::debug!("Destroying swapchain epoch {}", state.epoch);
        unsafe {
            for &framebuffer in &state.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &state.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(state.swapchain, None);
        }
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(
        &self,
        state: &SwapchainState,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(state.swapchain, timeout, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(EngineError::presentation("acquire")(e)),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        state: &SwapchainState,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [state.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(EngineError::presentation("present")(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn caps(min_images: u32, max_images: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            current_extent: extent(u32::MAX, u32::MAX),
            min_image_extent: extent(64, 64),
            max_image_extent: extent(4096, 2048),
            ..Default::default()
        }
    }

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    fn preferred() -> vk::SurfaceFormatKHR {
        SwapchainPreferences::default().surface_format
    }

    #[test]
    fn image_count_is_min_plus_one_within_cap() {
        assert_eq!(choose_image_count(&caps(2, 4)), 3);
        assert_eq!(choose_image_count(&caps(3, 3)), 3);
    }

    #[test]
    fn image_count_is_uncapped_when_max_is_zero() {
        assert_eq!(choose_image_count(&caps(3, 0)), 4);
    }

    #[test]
    fn undefined_format_selects_preferred_bgra() {
        let available = [format(
            vk::Format::UNDEFINED,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        let chosen = choose_surface_format(&available, preferred());
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn preferred_format_wins_when_advertised() {
        let available = [
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&available, preferred()), available[1]);
    }

    #[test]
    fn falls_back_to_first_advertised_format() {
        let available = [
            format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(
                vk::Format::B8G8R8A8_UNORM,
                vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            ),
        ];
        assert_eq!(choose_surface_format(&available, preferred()), available[0]);
    }

    #[test]
    fn present_mode_falls_back_to_fifo_without_mailbox() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );

        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn extent_is_clamped_into_surface_bounds() {
        let caps = caps(2, 4);
        for desired in [extent(1, 1), extent(800, 600), extent(10_000, 10_000), extent(32, 3000)] {
            let chosen = choose_extent(&caps, desired);
            assert!((64..=4096).contains(&chosen.width), "{:?}", chosen);
            assert!((64..=2048).contains(&chosen.height), "{:?}", chosen);
        }
        assert_eq!(choose_extent(&caps, extent(800, 600)), extent(800, 600));
        assert_eq!(choose_extent(&caps, extent(32, 3000)), extent(64, 2048));
    }

    #[test]
    fn fixed_extent_is_used_verbatim() {
        let mut caps = caps(2, 4);
        caps.current_extent = extent(1920, 1080);
        assert_eq!(choose_extent(&caps, extent(800, 600)), extent(1920, 1080));
    }

    #[test]
    fn fixed_zero_extent_makes_a_degenerate_plan() {
        let mut capabilities = caps(2, 4);
        capabilities.current_extent = extent(0, 0);
        let support = SwapchainSupport {
            capabilities,
            formats: vec![format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };

        // The window reports a usable size, the surface disagrees
        let prefs = SwapchainPreferences::default();
        let plan = SwapchainPlan::resolve(&support, &prefs, extent(800, 600));
        assert_eq!(plan.extent, extent(0, 0));
        assert!(plan.is_degenerate());

        let mut capabilities = caps(2, 4);
        capabilities.current_extent = extent(1024, 0);
        let support = SwapchainSupport {
            capabilities,
            ..support
        };
        assert!(SwapchainPlan::resolve(&support, &prefs, extent(800, 600)).is_degenerate());
    }

    #[test]
    fn clamped_extent_is_never_degenerate() {
        let support = SwapchainSupport {
            capabilities: caps(2, 4),
            formats: Vec::new(),
            present_modes: Vec::new(),
        };
        let prefs = SwapchainPreferences::default();
        let plan = SwapchainPlan::resolve(&support, &prefs, extent(0, 0));
        assert_eq!(plan.extent, extent(64, 64));
        assert!(!plan.is_degenerate());
    }

    #[test]
    fn resolving_unchanged_support_is_stable() {
        let support = SwapchainSupport {
            capabilities: caps(2, 4),
            formats: vec![format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let prefs = SwapchainPreferences::default();
        let first = SwapchainPlan::resolve(&support, &prefs, extent(1280, 720));
        let second = SwapchainPlan::resolve(&support, &prefs, extent(1280, 720));
        assert_eq!(first, second);
        assert_eq!(first.image_count, 3);
        assert_eq!(first.present_mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn sharing_is_concurrent_only_for_split_families() {
        let (mode, indices) = sharing_for(QueueFamilyIndices {
            graphics: 0,
            present: 0,
        });
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert!(indices.is_empty());

        let (mode, indices) = sharing_for(QueueFamilyIndices {
            graphics: 0,
            present: 2,
        });
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(indices, vec![0, 2]);
    }
}
