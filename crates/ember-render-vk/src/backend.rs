// SPDX-License-Identifier: CEPL-1.0
//! [`FrameBackend`] over real Vulkan objects, borrowed from the renderer for
//! the length of one frame.

use ash::vk;
use ember_render::RenderSize;

use crate::buffer::StaticGeometry;
use crate::context::DeviceContext;
use crate::error::{VkError, VkResult, VkResultExt};
use crate::frame::{AcquireOutcome, FrameBackend, PresentOutcome};
use crate::pipeline::GraphicsPipeline;
use crate::ring::FrameRing;
use crate::swapchain::SwapchainManager;

pub struct VkFrameBackend<'a> {
    pub ctx: &'a DeviceContext,
    pub ring: &'a FrameRing,
    pub swapchain: &'a mut SwapchainManager,
    pub pipeline: &'a mut GraphicsPipeline,
    pub geometry: &'a StaticGeometry,
    /// Asked for the live framebuffer size whenever the chain has to be
    /// rebuilt mid-frame.
    pub size: &'a dyn Fn() -> RenderSize,
    pub clear: [f32; 4],
}

impl FrameBackend for VkFrameBackend<'_> {
    fn wait_for_slot(&mut self, slot: usize) -> VkResult<()> {
        let fence = self.ring.slot(slot).in_flight;
        // SAFETY: fence is live; unbounded wait.
        unsafe {
            self.ctx
                .device
                .wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
        }
        .op("wait_for_fences")
    }

    fn acquire_image(&mut self, slot: usize) -> VkResult<AcquireOutcome> {
        self.swapchain.acquire(self.ring.slot(slot).image_available)
    }

    fn reset_slot_fence(&mut self, slot: usize) -> VkResult<()> {
        let fence = self.ring.slot(slot).in_flight;
        // SAFETY: the wait above returned, so no pending submission uses it.
        unsafe { self.ctx.device.reset_fences(std::slice::from_ref(&fence)) }.op("reset_fences")
    }

    fn record_commands(&mut self, slot: usize, image_index: u32) -> VkResult<()> {
        let state = self
            .swapchain
            .state()
            .ok_or(VkError::Vulkan {
                op: "record_commands",
                result: vk::Result::ERROR_OUT_OF_DATE_KHR,
            })?;
        let framebuffer = state.framebuffers[image_index as usize];
        let extent = state.extent;
        let cmd = self.ring.slot(slot).cmd;
        let d = &self.ctx.device;

        // SAFETY: the slot's fence was waited on, so the GPU is done with cmd.
        unsafe {
            d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .op("reset_command_buffer")?;
            let begin = vk::CommandBufferBeginInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
                flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                ..Default::default()
            };
            d.begin_command_buffer(cmd, &begin).op("begin_command_buffer")?;

            let clear = vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear,
                },
            };
            let rp_begin = vk::RenderPassBeginInfo {
                s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
                render_pass: self.pipeline.render_pass(),
                framebuffer,
                render_area: vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                },
                clear_value_count: 1,
                p_clear_values: &clear,
                ..Default::default()
            };
            d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.handle());
            d.cmd_bind_vertex_buffers(cmd, 0, &[self.geometry.vertices.handle], &[0]);
            d.cmd_bind_index_buffer(cmd, self.geometry.indices.handle, 0, vk::IndexType::UINT16);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            d.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
            d.cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));
            d.cmd_draw_indexed(cmd, self.geometry.index_count, 1, 0, 0, 0);

            d.cmd_end_render_pass(cmd);
            d.end_command_buffer(cmd).op("end_command_buffer")
        }
    }

    fn submit(&mut self, slot: usize) -> VkResult<()> {
        let s = self.ring.slot(slot);
        let wait_stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &s.image_available,
            p_wait_dst_stage_mask: &wait_stage,
            command_buffer_count: 1,
            p_command_buffers: &s.cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &s.render_finished,
            ..Default::default()
        };
        // SAFETY: the fence was reset for this submission.
        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.graphics_queue, std::slice::from_ref(&si), s.in_flight)
        }
        .op("queue_submit")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> VkResult<PresentOutcome> {
        self.swapchain.present(
            self.ctx.present_queue,
            image_index,
            self.ring.slot(slot).render_finished,
        )
    }

    fn recreate_swapchain(&mut self) -> VkResult<()> {
        let size = (self.size)();
        if size.is_empty() {
            // Minimized: no chain until the framebuffer has area again.
            return self.swapchain.release(self.ctx);
        }
        self.swapchain.recreate(self.ctx, self.pipeline, size)
    }

    fn wait_device_idle(&mut self) -> VkResult<()> {
        self.ctx.wait_idle()
    }
}
