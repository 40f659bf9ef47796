// =============================================================================
// FRAME SYNCHRONIZER
// =============================================================================
//
// Drives acquire -> submit -> present and decides when the presentation
// chain must be rebuilt. All GPU work goes through `FrameBackend`, so the
// state machine itself never touches Vulkan handles.
//
//   Running ──(out-of-date / suboptimal / resize)──> Recreating
//   Recreating ──(idle wait + rebuild)──> Running
//   Recreating ──(zero-area surface)──> Recreating (idle, no rebuild)
//   Recreating ──(backend finds the surface zero-area)──> Recreating (idle)
//   any ──(stop / fatal error)──> ShuttingDown (terminal)

use ash::vk;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use crate::error::Result;

/// Result of asking the presentation engine for an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The swapchain no longer matches the surface. No image was acquired
    /// and the slot's semaphore was not signalled.
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// Result of rebuilding the presentation chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateOutcome {
    Rebuilt,
    /// The surface itself reports a zero-area extent. Nothing was built and
    /// the previous chain, if any, is still in place.
    Degenerate,
}

/// GPU-facing half of the frame loop.
///
/// `slot` selects the frame-in-flight sync objects; it is always below
/// `frames_in_flight()`. Calls for one frame arrive strictly as
/// acquire, submit, present on the same slot.
pub trait FrameBackend {
    fn frames_in_flight(&self) -> usize;

    /// Wait for the slot to be free, then acquire the next image,
    /// signalling the slot's imageAvailable semaphore. Never times out.
    fn acquire(&mut self, slot: usize) -> Result<AcquireOutcome>;

    /// Submit the image's command buffer: wait on imageAvailable at colour
    /// attachment output, signal renderFinished.
    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()>;

    /// Queue the image for display once renderFinished is signalled.
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    /// Block until no submitted work is pending.
    fn wait_idle(&mut self) -> Result<()>;

    /// Replace the presentation chain and its command buffers. Called only
    /// after `wait_idle`, with a non-degenerate desired extent. The surface
    /// may still resolve to zero area, which is reported as `Degenerate`.
    fn recreate(&mut self, desired: vk::Extent2D) -> Result<RecreateOutcome>;

    /// Release everything in reverse dependency order. Called once, after
    /// `wait_idle`.
    fn release(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Recreating,
    ShuttingDown,
}

/// Why the chain is being rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateReason {
    /// Acquire or present reported out-of-date or suboptimal
    SurfaceIncompatible,
    Resized,
}

/// What one iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { image_index: u32 },
    /// Acquire reported out-of-date; nothing was submitted
    Skipped,
    Recreated,
    /// Surface has zero area, waiting for a usable size
    Idle,
    /// The loop has shut down
    Stopped,
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// How long to sleep per iteration while the surface is degenerate
    pub idle_poll: Duration,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(16),
        }
    }
}

/// Delivers resize messages to a synchronizer owned elsewhere
#[derive(Debug, Clone)]
pub struct ResizeHandle {
    sender: Sender<vk::Extent2D>,
}

impl ResizeHandle {
    pub fn on_resize(&self, width: u32, height: u32) {
        // A closed channel means the loop is gone; nothing left to resize
        let _ = self.sender.send(vk::Extent2D { width, height });
    }
}

fn is_degenerate(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

pub struct FrameSynchronizer<B: FrameBackend> {
    backend: B,
    state: LoopState,
    reason: RecreateReason,
    desired_extent: vk::Extent2D,
    current_frame: usize,
    options: LoopOptions,
    resize_tx: Sender<vk::Extent2D>,
    resize_rx: Receiver<vk::Extent2D>,
    frames_presented: u64,
    recreations: u64,
}

impl<B: FrameBackend> FrameSynchronizer<B> {
    /// `backend` must already hold a valid presentation chain built for
    /// `initial_extent`.
    pub fn new(backend: B, initial_extent: vk::Extent2D, options: LoopOptions) -> Self {
        let (resize_tx, resize_rx) = mpsc::channel();
        Self {
            backend,
            state: LoopState::Running,
            reason: RecreateReason::Resized,
            desired_extent: initial_extent,
            current_frame: 0,
            options,
            resize_tx,
            resize_rx,
            frames_presented: 0,
            recreations: 0,
        }
    }

    pub fn resize_handle(&self) -> ResizeHandle {
        ResizeHandle {
            sender: self.resize_tx.clone(),
        }
    }

    /// Mark the next iteration for recreation at the given size.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        if self.state == LoopState::ShuttingDown {
            return;
        }
        let extent = vk::Extent2D { width, height };
        log::debug!("Resize to {}x{}", width, height);

        self.desired_extent = extent;
        self.reason = RecreateReason::Resized;
        self.state = LoopState::Recreating;
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn desired_extent(&self) -> vk::Extent2D {
        self.desired_extent
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    fn drain_resize_messages(&mut self) {
        // Only the most recent size matters
        if let Some(extent) = self.resize_rx.try_iter().last() {
            self.on_resize(extent.width, extent.height);
        }
    }

    fn schedule_recreation(&mut self) {
        self.reason = RecreateReason::SurfaceIncompatible;
        self.state = LoopState::Recreating;
    }

    /// Run one iteration of the state machine.
    pub fn step(&mut self) -> Result<FrameStatus> {
        self.drain_resize_messages();

        match self.state {
            LoopState::ShuttingDown => Ok(FrameStatus::Stopped),
            LoopState::Recreating => self.recreate(),
            LoopState::Running => self.draw_frame(),
        }
    }

    fn recreate(&mut self) -> Result<FrameStatus> {
        if is_degenerate(self.desired_extent) {
            // Minimized: no swapchain can be built, wait for a real size
            return Ok(FrameStatus::Idle);
        }

        log::info!(
            "Recreating swapchain ({:?}) at {}x{}",
            self.reason,
            self.desired_extent.width,
            self.desired_extent.height
        );

        self.backend.wait_idle()?;
        if self.backend.recreate(self.desired_extent)? == RecreateOutcome::Degenerate {
            log::debug!("Surface extent is zero, waiting for a usable size");
            return Ok(FrameStatus::Idle);
        }

        self.recreations += 1;
        self.state = LoopState::Running;
        Ok(FrameStatus::Recreated)
    }

    fn draw_frame(&mut self) -> Result<FrameStatus> {
        let slot = self.current_frame;

        let (image_index, acquire_suboptimal) = match self.backend.acquire(slot)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                // Semaphore untouched, the slot is reused next time
                self.schedule_recreation();
                return Ok(FrameStatus::Skipped);
            }
        };

        self.backend.submit(slot, image_index)?;

        let presented = self.backend.present(slot, image_index)?;
        if acquire_suboptimal || presented != PresentOutcome::Presented {
            // This frame still counts, the rebuild happens next iteration
            self.schedule_recreation();
        }

        self.frames_presented += 1;
        self.current_frame = (self.current_frame + 1) % self.backend.frames_in_flight().max(1);
        Ok(FrameStatus::Presented { image_index })
    }

    /// Step until `should_continue` returns false or an error occurs, then
    /// shut down. The error, if any, is returned after the teardown.
    pub fn run_frame_loop(&mut self, mut should_continue: impl FnMut() -> bool) -> Result<()> {
        let mut outcome = Ok(());

        while self.state != LoopState::ShuttingDown && should_continue() {
            match self.step() {
                Ok(FrameStatus::Idle) => std::thread::sleep(self.options.idle_poll),
                Ok(_) => {}
                Err(e) => {
                    log::error!("Frame loop stopped: {}", e);
                    outcome = Err(e);
                    break;
                }
            }
        }

        self.shutdown();
        outcome
    }

    /// Wait for the GPU, then release everything. Idempotent.
    pub fn shutdown(&mut self) {
        if self.state == LoopState::ShuttingDown {
            return;
        }
        self.state = LoopState::ShuttingDown;

        log::info!(
            "Shutting down after {} frames, {} recreations",
            self.frames_presented,
            self.recreations
        );

        if let Err(e) = self.backend.wait_idle() {
            log::error!("Idle wait failed during shutdown: {}", e);
        }
        self.backend.release();
    }
}

impl<B: FrameBackend> Drop for FrameSynchronizer<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
