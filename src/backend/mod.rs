// Vulkan backend
//
// Objects are listed leaves first: instance -> surface -> device ->
// swapchain -> commands -> sync.

pub mod buffer;
pub mod command;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use command::{CommandBufferSet, CommandRecorder, DrawBindings};
pub use device::{DeviceContext, DeviceRequirements, QueueFamilyIndices};
pub use instance::Instance;
pub use surface::Surface;
pub use swapchain::{SwapchainManager, SwapchainState};
pub use sync::FrameSync;
