// Error taxonomy for the presentation core
//
// Only fatal conditions are errors. Surface incompatibility (out-of-date,
// suboptimal) and degenerate surfaces are outcomes the frame loop handles
// itself, see `frame::FrameStatus` and the acquire/present outcome enums.

use ash::vk;
use thiserror::Error;

/// Startup failures: nothing usable to render with.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Failed to load the Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// A Vulkan call during instance or device setup failed
    #[error("Vulkan setup call `{call}` failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    /// No physical device passed every suitability check
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A device had the extensions and surface support but no usable queue families
    #[error("GPU `{device}` lacks a graphics or present queue family")]
    NoSuitableQueueFamily { device: String },

    /// Surface creation or query failed
    #[error("Surface error: {0}")]
    Surface(String),

    /// GPU allocator could not be created
    #[error("Allocator error: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),
}

impl SetupError {
    pub(crate) fn vulkan(call: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Vulkan { call, result }
    }
}

/// Errors surfaced by the swapchain manager, command recorder and frame loop.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// Swapchain, view, framebuffer, pool or sync object creation failed
    #[error("Failed to create {what}: {result}")]
    ResourceCreation {
        what: &'static str,
        result: vk::Result,
    },

    /// The pipeline or resource provider failed
    #[error("Collaborator failed: {0:#}")]
    Provider(#[from] anyhow::Error),

    /// Command buffer allocation or recording failed
    #[error("Command recording failed during {what}: {result}")]
    CommandRecording {
        what: &'static str,
        result: vk::Result,
    },

    /// Any non-success acquire/submit/present result other than out-of-date
    #[error("Presentation failed during {stage}: {result}")]
    Presentation {
        stage: &'static str,
        result: vk::Result,
    },

    /// The acquired image has no command buffer in the current set
    #[error("No command buffer recorded for swapchain image {index}")]
    MissingCommandBuffer { index: u32 },

    #[error("Renderer used after release")]
    Released,
}

impl EngineError {
    pub(crate) fn creation(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::ResourceCreation { what, result }
    }

    pub(crate) fn recording(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::CommandRecording { what, result }
    }

    pub(crate) fn presentation(stage: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Presentation { stage, result }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_stage() {
        let err = EngineError::presentation("present")(vk::Result::ERROR_DEVICE_LOST);
        assert!(err
            .to_string()
            .starts_with("Presentation failed during present:"));
        assert!(matches!(
            err,
            EngineError::Presentation {
                result: vk::Result::ERROR_DEVICE_LOST,
                ..
            }
        ));

        let err = EngineError::from(SetupError::NoSuitableQueueFamily {
            device: "llvmpipe".into(),
        });
        assert!(err.to_string().contains("llvmpipe"));
    }
}
