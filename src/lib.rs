// =============================================================================
// VK PRESENTER - swapchain lifecycle and frame synchronization
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  FrameSynchronizer (state machine: Running/Recreating/Shutdown) │
// │    └── Renderer (FrameBackend)                                  │
// │          ├── SwapchainManager -> SwapchainState (per epoch)     │
// │          ├── CommandRecorder  -> CommandBufferSet (per epoch)   │
// │          ├── FrameSync (per frame in flight)                    │
// │          └── PipelineProvider / ResourceProvider                │
// │    DeviceContext -> Surface -> Instance                         │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod renderer;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

pub use config::Config;
pub use error::{EngineError, Result, SetupError};
pub use frame::{
    AcquireOutcome, FrameBackend, FrameStatus, FrameSynchronizer, LoopOptions, LoopState,
    PresentOutcome, RecreateOutcome, ResizeHandle,
};
pub use renderer::{Renderer, RendererSettings};

use backend::buffer::MeshBuffers;
use backend::pipeline::ColorPipeline;
use backend::{DeviceContext, DeviceRequirements, Instance, Surface};

/// Build the whole presentation stack for one window and hand back a
/// running frame loop.
///
/// # Safety
/// The handles must refer to a live window that outlives the returned
/// synchronizer.
pub unsafe fn initialize(
    config: &Config,
    display: RawDisplayHandle,
    window: RawWindowHandle,
    extent: vk::Extent2D,
) -> Result<FrameSynchronizer<Renderer>> {
    let instance = Instance::new(&config.device_config(), display)?;
    if instance.has_debug_messenger() {
        log::info!("Validation messages are routed to the log");
    } else {
        log::debug!("No debug messenger, validation output is not captured");
    }
    let surface = Arc::new(Surface::new(instance, display, window)?);
    let device = DeviceContext::initialize(&surface, &DeviceRequirements::default())?;

    let pipelines = ColorPipeline::new(&config.shaders.vertex, &config.shaders.fragment);
    let resources = MeshBuffers::quad(&device)?;

    let settings = RendererSettings {
        preferences: config.swapchain_preferences(),
        clear_color: config.graphics.clear_color,
        frames_in_flight: config.frames_in_flight(),
    };
    let renderer = Renderer::new(
        device,
        surface,
        settings,
        Box::new(pipelines),
        Box::new(resources),
        extent,
    )?;

    let deferred = renderer.swapchain_state().is_none();
    let mut frames = FrameSynchronizer::new(renderer, extent, config.loop_options());
    if deferred {
        // Build the chain on the first step that sees a usable surface
        frames.on_resize(extent.width, extent.height);
    }
    Ok(frames)
}
