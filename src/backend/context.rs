// Graphics context - the full GPU stack for one window
//
// Owns everything from the instance down to the per-frame sync objects and
// runs the frame loop. Swapchain loss (resize, minimize, out of date) is
// absorbed here; callers only see draw_frame and notify_resized.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use winit::window::Window;

use super::buffer::VertexBuffer;
use super::device::VulkanDevice;
use super::pipeline::Pipeline;
use super::shader::ShaderSet;
use super::swapchain::{
    choose_extent, choose_surface_format, Swapchain, SwapchainRebuildError, SwapchainSupport,
};
use super::sync::FrameSyncSet;
use crate::config::Config;

/// Command pool plus one primary buffer per frame in flight. Buffers are
/// reset and re-recorded every frame.
pub struct Commands {
    pub pool: vk::CommandPool,
    pub buffers: Vec<vk::CommandBuffer>,
    device: Arc<VulkanDevice>,
}

impl Commands {
    pub fn new(device: Arc<VulkanDevice>, frames_in_flight: usize) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .context("Failed to create command pool")?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);

        let buffers = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(pool, None) };
                return Err(e).context("Failed to allocate command buffers");
            }
        };

        Ok(Self {
            pool,
            buffers,
            device,
        })
    }
}

impl Drop for Commands {
    fn drop(&mut self) {
        // Destroying the pool frees its buffers
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// Outcome of a present call, as seen by the frame loop.
#[derive(Debug, PartialEq, Eq)]
enum PresentAction {
    /// The frame is on screen and the swapchain still matches the surface.
    Advance,
    /// The frame is on screen but the swapchain fits the surface poorly;
    /// rebuild before the next one.
    AdvanceStale,
    /// Nothing reached the screen. Rebuild immediately and keep the
    /// current frame slot.
    RebuildNow,
}

/// Maps a present result onto the frame loop's next move. Any error other
/// than out-of-date passes through.
fn present_action(presented: Result<bool, vk::Result>) -> Result<PresentAction, vk::Result> {
    match presented {
        Ok(false) => Ok(PresentAction::Advance),
        Ok(true) => Ok(PresentAction::AdvanceStale),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentAction::RebuildNow),
        Err(e) => Err(e),
    }
}

/// Owns the GPU stack for one window. Field order is drop order: sync and
/// commands unwind first, the device last, the window after that.
pub struct GraphicsContext {
    sync: FrameSyncSet,
    commands: Commands,
    vertex_buffer: VertexBuffer,
    swapchain: Option<Swapchain>,
    pipeline: Pipeline,
    _shaders: ShaderSet,
    device: Arc<VulkanDevice>,
    window: Arc<Window>,

    current_frame: usize,
    needs_rebuild: bool,
    clear_color: [f32; 4],
    preferred_present_mode: vk::PresentModeKHR,
}

impl GraphicsContext {
    /// Bring up the whole stack: device, shaders, pipeline, swapchain,
    /// command buffers, vertex data, sync objects.
    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&window, &config.window.title, enable_validation)?;

        let shaders = ShaderSet::load(device.clone())?;

        // The pipeline needs the color format before any swapchain exists,
        // so the support query happens once and feeds both.
        let support = SwapchainSupport::query(
            &device.surface_loader,
            device.physical_device,
            device.surface,
        )?;
        let surface_format =
            choose_surface_format(&support.formats).context("Surface advertises no formats")?;

        let pipeline = Pipeline::new(device.clone(), surface_format.format, &shaders)?;

        let size = window.inner_size();
        let preferred_present_mode = config.preferred_present_mode();
        let swapchain = Swapchain::new(
            device.clone(),
            support,
            pipeline.render_pass,
            preferred_present_mode,
            size.width,
            size.height,
        )?;

        let frames_in_flight = config.frames_in_flight();
        let commands = Commands::new(device.clone(), frames_in_flight)?;
        let vertex_buffer = VertexBuffer::upload(device.clone())?;
        let sync = FrameSyncSet::new(device.clone(), frames_in_flight)?;

        log::info!("Vulkan initialized successfully");

        Ok(Self {
            sync,
            commands,
            vertex_buffer,
            swapchain: Some(swapchain),
            pipeline,
            _shaders: shaders,
            device,
            window,
            current_frame: 0,
            needs_rebuild: false,
            clear_color: config.graphics.clear_color,
            preferred_present_mode,
        })
    }

    /// Mark the swapchain stale. The next draw_frame rebuilds it before
    /// rendering anything.
    pub fn notify_resized(&mut self) {
        self.needs_rebuild = true;
    }

    /// Wait for the GPU to finish all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    /// Draw one frame. A tick that only rebuilds the swapchain (resize,
    /// out of date, zero-area surface) returns Ok without presenting.
    pub fn draw_frame(&mut self) -> Result<()> {
        let frame = self.current_frame;
        let (image_available, render_finished, in_flight_fence) = {
            let sync = &self.sync.frames[frame];
            (
                sync.image_available,
                sync.render_finished,
                sync.in_flight_fence,
            )
        };

        // Wait until this slot's previous submission has retired
        unsafe {
            self.device
                .device
                .wait_for_fences(&[in_flight_fence], true, u64::MAX)?;
        }

        // A pending resize invalidates whatever acquire would return
        if self.needs_rebuild || self.swapchain.is_none() {
            self.rebuild_swapchain()?;
            return Ok(());
        }

        let acquired = {
            let swapchain = self.swapchain.as_ref().context("Swapchain not built")?;
            swapchain.acquire_next_image(u64::MAX, image_available)
        };

        let image_index = match acquired {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    // The image is already acquired, so present it and
                    // rebuild on the next tick
                    self.needs_rebuild = true;
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.rebuild_swapchain()?;
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to acquire swapchain image"),
        };

        let command_buffer = self.commands.buffers[frame];
        unsafe {
            self.device
                .device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
        }
        self.record_commands(command_buffer, image_index as usize)?;

        // Reset only once this slot is certain to be resubmitted; a reset
        // without a matching submit would deadlock the next wait
        unsafe {
            self.device.device.reset_fences(&[in_flight_fence])?;
        }

        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    in_flight_fence,
                )
                .context("Failed to submit draw commands")?;
        }

        let presented = {
            let swapchain = self.swapchain.as_ref().context("Swapchain not built")?;
            swapchain.present(self.device.present_queue, image_index, render_finished)
        };

        // The frame slot advances only when an image actually reached the
        // screen; an out-of-date present rebuilds on this tick instead
        match present_action(presented) {
            Ok(PresentAction::Advance) => {}
            Ok(PresentAction::AdvanceStale) => self.needs_rebuild = true,
            Ok(PresentAction::RebuildNow) => {
                self.rebuild_swapchain()?;
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to present swapchain image"),
        }

        self.current_frame = (self.current_frame + 1) % self.sync.frames_in_flight();
        Ok(())
    }

    /// Record the clear-and-draw pass for one acquired image.
    fn record_commands(&self, command_buffer: vk::CommandBuffer, image_index: usize) -> Result<()> {
        let swapchain = self.swapchain.as_ref().context("Swapchain not built")?;
        let device = &self.device.device;

        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe { device.begin_command_buffer(command_buffer, &begin_info)? };

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: swapchain.extent,
        };
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.pipeline.render_pass)
            .framebuffer(swapchain.framebuffers[image_index])
            .render_area(render_area)
            .clear_values(&clear_values);

        unsafe {
            device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.pipeline,
            );

            // Viewport and scissor are dynamic so a rebuilt swapchain does
            // not force a new pipeline
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: swapchain.extent.width as f32,
                height: swapchain.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[render_area]);

            device.cmd_bind_vertex_buffers(command_buffer, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_draw(command_buffer, self.vertex_buffer.vertex_count, 1, 0, 0);

            device.cmd_end_render_pass(command_buffer);
            device.end_command_buffer(command_buffer)?;
        }

        Ok(())
    }

    /// Tear down and recreate the swapchain against the current surface
    /// state. A zero-area surface keeps the stale chain and retries on a
    /// later tick.
    fn rebuild_swapchain(&mut self) -> Result<()> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            self.needs_rebuild = true;
            return Ok(());
        }

        let support = SwapchainSupport::query(
            &self.device.surface_loader,
            self.device.physical_device,
            self.device.surface,
        )
        .context(SwapchainRebuildError)?;

        let extent = choose_extent(&support.capabilities, size.width, size.height);
        if extent.width == 0 || extent.height == 0 {
            self.needs_rebuild = true;
            return Ok(());
        }

        self.device.wait_idle().context(SwapchainRebuildError)?;

        // The surface allows only one swapchain at a time, so the old one
        // goes before the new one is created
        self.swapchain = None;

        let swapchain = Swapchain::new(
            self.device.clone(),
            support,
            self.pipeline.render_pass,
            self.preferred_present_mode,
            size.width,
            size.height,
        )
        .context(SwapchainRebuildError)?;

        self.swapchain = Some(swapchain);
        self.needs_rebuild = false;
        Ok(())
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        log::info!("Cleaning up graphics resources...");
        let _ = self.device.wait_idle();
        // Fields drop next, in declaration order: sync, commands, vertex
        // buffer, swapchain, pipeline, shaders, then the device itself
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_present_advances_the_frame_slot() {
        assert_eq!(present_action(Ok(false)), Ok(PresentAction::Advance));
    }

    #[test]
    fn suboptimal_present_advances_but_marks_the_swapchain_stale() {
        assert_eq!(present_action(Ok(true)), Ok(PresentAction::AdvanceStale));
    }

    #[test]
    fn out_of_date_present_demands_an_immediate_rebuild() {
        assert_eq!(
            present_action(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)),
            Ok(PresentAction::RebuildNow)
        );
    }

    #[test]
    fn other_present_errors_pass_through() {
        assert_eq!(
            present_action(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );
    }
}
