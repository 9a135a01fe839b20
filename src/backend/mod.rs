// Backend module - Vulkan abstraction layer
//
// Thin wrappers over ash. Every GPU object lives in a value that destroys
// its own handles on drop, so teardown is declaration order, not a
// hand-written cleanup list.

pub mod buffer;
pub mod context;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod vertex;

pub use context::GraphicsContext;
pub use device::VulkanDevice;
