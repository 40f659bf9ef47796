// =============================================================================
// VK PRESENTER DEMO - a window, a quad and a resilient frame loop
// =============================================================================
//
// The window shell only does two things for the engine: it provides the
// native handles the surface is created from, and it forwards resize
// events. Everything else lives in the library.
//
// FRAME FLOW (one FrameSynchronizer::step per redraw):
// 1. Apply a pending resize, recreating the swapchain if needed
// 2. Wait for the frame slot, acquire an image
// 3. Submit the pre-recorded command buffer
// 4. Present
//
// CONTROLS:
//   F11     toggle borderless fullscreen
//   Escape  quit
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Duration;
use vk_presenter::{Config, FrameStatus, FrameSynchronizer, Renderer};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config);

    log::info!("Starting vk-presenter");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// `RUST_LOG` wins over the configured level
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .parse_filters(&config.debug.log_level)
        .parse_default_env()
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the frame loop (and the surface inside it)
/// must go before the window it was created from.
struct App {
    frames: Option<FrameSynchronizer<Renderer>>,
    window: Option<Arc<Window>>,
    config: Config,
    idle_poll: Duration,
    is_fullscreen: bool,
    /// First fatal error, reported from main once the loop has exited
    failure: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let idle_poll = config.loop_options().idle_poll;
        Self {
            frames: None,
            window: None,
            config,
            idle_poll,
            is_fullscreen,
            failure: None,
        }
    }

    fn init_vulkan(&self, window: &Window) -> Result<FrameSynchronizer<Renderer>> {
        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // SAFETY: the window outlives the frame loop, see the field order of App
        let frames = unsafe {
            vk_presenter::initialize(&self.config, display_handle, window_handle, extent)?
        };
        Ok(frames)
    }

    fn render_frame(&mut self, event_loop: &ActiveEventLoop) {
        let Some(frames) = self.frames.as_mut() else {
            return;
        };

        match frames.step() {
            Ok(FrameStatus::Idle) => std::thread::sleep(self.idle_poll),
            Ok(_) => {}
            Err(e) => {
                log::error!("Render error: {}", e);
                self.failure = Some(anyhow::Error::new(e).context("Frame loop failed"));
                self.shutdown();
                event_loop.exit();
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut frames) = self.frames.take() {
            frames.shutdown();
            log::info!(
                "Presented {} frames, recreated the swapchain {} times",
                frames.frames_presented(),
                frames.recreations()
            );
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Borderless on the current monitor
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The resulting Resized event triggers recreation
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = Window::default_attributes()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match self.init_vulkan(&window) {
            Ok(frames) => self.frames = Some(frames),
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:#}", e);
                self.failure = Some(e);
                event_loop.exit();
            }
        }
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(ref mut frames) = self.frames {
                    frames.on_resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => self.render_frame(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                if !event.state.is_pressed() || event.repeat {
                    return;
                }
                match event.physical_key {
                    PhysicalKey::Code(KeyCode::Escape) => {
                        log::info!("ESC pressed, exiting...");
                        self.shutdown();
                        event_loop.exit();
                    }
                    PhysicalKey::Code(KeyCode::F11) => self.toggle_fullscreen(),
                    _ => {}
                }
            }

            _ => {}
        }
    }

    /// Keep redrawing for as long as the frame loop is alive
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.frames.is_some() {
            if let Some(ref window) = self.window {
                window.request_redraw();
            }
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}
