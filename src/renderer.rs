// =============================================================================
// RENDERER - the Vulkan side of the frame loop
// =============================================================================
//
// Owns every object whose lifetime is shorter than the device:
//
//   FrameSync (per frame in flight)      survives recreation
//   CommandBufferSet  ─┐
//   SwapchainState    ─┴─ replaced together on recreation
//   PipelineSet                          replaced only on format change
//   resources                            live until release
//
// Recreation is transactional: the new state, its pipeline set and its
// command buffers are fully built before anything old is released. A
// failure leaves the previous generation untouched.

use ash::vk;
use std::sync::Arc;

use crate::backend::buffer::ResourceProvider;
use crate::backend::pipeline::{PipelineProvider, PipelineSet, PipelineSwap};
use crate::backend::swapchain::SwapchainPreferences;
use crate::backend::{
    CommandBufferSet, CommandRecorder, DeviceContext, FrameSync, Surface, SwapchainManager,
    SwapchainState,
};
use crate::error::{EngineError, Result};
use crate::frame::{AcquireOutcome, FrameBackend, PresentOutcome, RecreateOutcome};

/// Creation parameters that are not collaborators
#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub preferences: SwapchainPreferences,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            preferences: SwapchainPreferences::default(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            frames_in_flight: 2,
        }
    }
}

pub struct Renderer {
    swapchains: SwapchainManager,
    state: Option<SwapchainState>,
    recorder: CommandRecorder,
    commands: Option<CommandBufferSet>,
    pipeline: Option<PipelineSet>,
    frame_sync: Vec<FrameSync>,
    pipelines: Box<dyn PipelineProvider>,
    resources: Box<dyn ResourceProvider>,
    /// Pre-allocated to avoid a per-frame allocation
    wait_stages: [vk::PipelineStageFlags; 1],
    released: bool,
    device: Arc<DeviceContext>,
}

impl Renderer {
    /// Build the first presentation chain at `extent` and record it.
    ///
    /// The collaborators are owned from here on; on failure everything
    /// created so far, them included, is released. A surface that is
    /// zero-area right now leaves the renderer without a chain; see
    /// `swapchain_state`.
    pub fn new(
        device: Arc<DeviceContext>,
        surface: Arc<Surface>,
        settings: RendererSettings,
        pipelines: Box<dyn PipelineProvider>,
        mut resources: Box<dyn ResourceProvider>,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let recorder = match CommandRecorder::new(device.clone(), settings.clear_color) {
            Ok(recorder) => recorder,
            Err(e) => {
                resources.destroy(&device);
                return Err(e);
            }
        };

        let mut renderer = Self {
            swapchains: SwapchainManager::new(device.clone(), surface, settings.preferences),
            state: None,
            recorder,
            commands: None,
            pipeline: None,
            frame_sync: Vec::new(),
            pipelines,
            resources,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            released: false,
            device,
        };

        // From here Drop releases whatever exists
        if renderer.rebuild(extent)? == RecreateOutcome::Degenerate {
            log::warn!("Surface is zero-area at startup, presentation chain deferred");
        }
        renderer.frame_sync =
            FrameSync::create_slots(&renderer.device, settings.frames_in_flight.max(1))?;

        log::info!(
            "Renderer ready with {} frames in flight",
            renderer.frame_sync.len()
        );
        Ok(renderer)
    }

    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    /// None until a chain has been built at a non-zero extent
    pub fn swapchain_state(&self) -> Option<&SwapchainState> {
        self.state.as_ref()
    }

    pub fn pipeline(&self) -> Option<&PipelineSet> {
        self.pipeline.as_ref()
    }

    pub fn command_buffers(&self) -> Option<&CommandBufferSet> {
        self.commands.as_ref()
    }

    fn current(&self) -> Result<(&SwapchainState, &CommandBufferSet)> {
        match (&self.state, &self.commands) {
            (Some(state), Some(commands)) => Ok((state, commands)),
            _ => Err(EngineError::Released),
        }
    }

    /// Build a new generation, then retire the old one.
    fn rebuild(&mut self, desired: vk::Extent2D) -> Result<RecreateOutcome> {
        let plan = self.swapchains.plan(desired)?;
        if plan.is_degenerate() {
            return Ok(RecreateOutcome::Degenerate);
        }

        let draw = self.resources.bindings();
        let set_layouts = self.resources.set_layouts();
        if !draw.fits_layout(set_layouts.len()) {
            return Err(anyhow::anyhow!(
                "{} descriptor sets bound but only {} set layouts declared",
                draw.descriptor_sets.len(),
                set_layouts.len()
            )
            .into());
        }

        let (state, swap) = self.swapchains.create(
            self.state.as_ref(),
            &plan,
            self.pipeline,
            &mut *self.pipelines,
            &set_layouts,
        )?;

        let commands = match self.recorder.record(&state, &swap.active(), &draw) {
            Ok(commands) => commands,
            Err(e) => {
                self.abandon(state, swap);
                return Err(e);
            }
        };
        debug_assert!(commands.is_recorded_against(&state));

        let (pipeline, retired) = swap.commit();
        let old_commands = self.commands.replace(commands);
        let old_state = self.state.replace(state);
        self.pipeline = Some(pipeline);

        // The caller waited for idle, nothing in flight uses these
        if let Some(old_commands) = old_commands {
            self.recorder.free(old_commands);
        }
        if let Some(old_state) = old_state {
            self.swapchains.destroy(old_state);
        }
        if let Some(retired) = retired {
            retired.destroy(&self.device);
        }
        Ok(RecreateOutcome::Rebuilt)
    }

    /// Tear down a generation that never went live.
    fn abandon(&self, state: SwapchainState, swap: PipelineSwap) {
        self.swapchains.destroy(state);
        if let Some(fresh) = swap.abandon() {
            fresh.destroy(&self.device);
        }
    }
}

impl FrameBackend for Renderer {
    fn frames_in_flight(&self) -> usize {
        self.frame_sync.len()
    }

    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let (state, _) = self.current()?;
        let sync = &self.frame_sync[slot];

        // The previous submission from this slot must finish before its
        // semaphores are reused
        sync.wait(&self.device)?;

        self.swapchains
            .acquire_next_image(state, u64::MAX, sync.image_available)
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let (state, commands) = self.current()?;
        debug_assert!(commands.is_recorded_against(state));

        let command_buffer = commands
            .get(image_index)
            .ok_or(EngineError::MissingCommandBuffer { index: image_index })?;
        let sync = &self.frame_sync[slot];

        let wait_semaphores = [sync.image_available];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [command_buffer];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            // Reset only once work is certain to be submitted
            self.device
                .device
                .reset_fences(&[sync.in_flight_fence])
                .map_err(EngineError::presentation("fence reset"))?;

            self.device
                .device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info],
                    sync.in_flight_fence,
                )
                .map_err(EngineError::presentation("submit"))
        }
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let (state, _) = self.current()?;
        let sync = &self.frame_sync[slot];

        self.swapchains.present(
            state,
            self.device.present_queue,
            image_index,
            &[sync.render_finished],
        )
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device
            .wait_idle()
            .map_err(EngineError::presentation("idle wait"))
    }

    fn recreate(&mut self, desired: vk::Extent2D) -> Result<RecreateOutcome> {
        if self.released {
            return Err(EngineError::Released);
        }
        self.rebuild(desired)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        log::info!("Releasing renderer resources...");

        for sync in self.frame_sync.drain(..) {
            sync.destroy(&self.device);
        }
        if let Some(commands) = self.commands.take() {
            self.recorder.free(commands);
        }
        self.recorder.destroy();
        if let Some(state) = self.state.take() {
            self.swapchains.destroy(state);
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.destroy(&self.device);
        }
        self.resources.destroy(&self.device);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.device.wait_idle();
            self.release();
        }
    }
}
