// Synchronization primitives
//
// Two semaphores order GPU work within a frame, the fence throttles the CPU.
// Fences start signaled so the first wait on each frame slot passes.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        unsafe {
            let image_available = device.create_semaphore(&semaphore_info, None)?;
            let render_finished = match device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    return Err(e.into());
                }
            };
            let in_flight_fence = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_available, None);
                    device.destroy_semaphore(render_finished, None);
                    return Err(e.into());
                }
            };

            Ok(Self {
                image_available,
                render_finished,
                in_flight_fence,
            })
        }
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// The sync objects for every frame in flight, destroyed as one unit.
pub struct FrameSyncSet {
    pub frames: Vec<FrameSync>,
    device: Arc<VulkanDevice>,
}

impl FrameSyncSet {
    /// Frames are pushed into the set as they are created, so a failure
    /// partway through drops the set and with it every finished frame.
    pub fn new(device: Arc<VulkanDevice>, frames_in_flight: usize) -> Result<Self> {
        let mut set = Self {
            frames: Vec::with_capacity(frames_in_flight),
            device,
        };
        for _ in 0..frames_in_flight {
            let frame = FrameSync::new(&set.device.device)?;
            set.frames.push(frame);
        }
        Ok(set)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }
}

impl Drop for FrameSyncSet {
    fn drop(&mut self) {
        for frame in &self.frames {
            frame.destroy(&self.device.device);
        }
    }
}
