// SPDX-License-Identifier: CEPL-1.0
//! Per-frame synchronization objects and command buffers.

use ash::{vk, Device};

use crate::context::DeviceContext;
use crate::error::{VkError, VkResult, VkResultExt};

/// Frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

#[derive(Clone, Copy, Debug, Default)]
pub struct FrameSlot {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    /// Created signaled so the first wait on each slot returns immediately.
    pub in_flight: vk::Fence,
    pub cmd: vk::CommandBuffer,
}

impl FrameSlot {
    unsafe fn create(device: &Device, cmd: vk::CommandBuffer) -> VkResult<Self> {
        let sem_ci = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let mut slot = Self {
            cmd,
            ..Default::default()
        };
        let created = (|| unsafe {
            slot.image_available = device.create_semaphore(&sem_ci, None)?;
            slot.render_finished = device.create_semaphore(&sem_ci, None)?;
            slot.in_flight = device.create_fence(&fence_ci, None)?;
            Ok::<(), vk::Result>(())
        })();
        if let Err(e) = created {
            unsafe { slot.destroy_sync(device) };
            return Err(VkError::SyncCreation(e));
        }
        Ok(slot)
    }

    unsafe fn destroy_sync(&mut self, device: &Device) {
        unsafe {
            if self.in_flight != vk::Fence::null() {
                device.destroy_fence(self.in_flight, None);
            }
            if self.render_finished != vk::Semaphore::null() {
                device.destroy_semaphore(self.render_finished, None);
            }
            if self.image_available != vk::Semaphore::null() {
                device.destroy_semaphore(self.image_available, None);
            }
        }
        self.in_flight = vk::Fence::null();
        self.render_finished = vk::Semaphore::null();
        self.image_available = vk::Semaphore::null();
    }
}

/// Fixed ring of [`FRAMES_IN_FLIGHT`] slots.
pub struct FrameRing {
    slots: [FrameSlot; FRAMES_IN_FLIGHT],
    pool: vk::CommandPool,
}

impl FrameRing {
    pub fn new(ctx: &DeviceContext) -> VkResult<Self> {
        let device = &ctx.device;
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: ctx.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: FRAMES_IN_FLIGHT as u32,
            ..Default::default()
        };
        // SAFETY: pool belongs to this device.
        let cmds = unsafe { device.allocate_command_buffers(&ai) }.op("allocate_command_buffers")?;

        let mut ring = Self {
            slots: [FrameSlot::default(); FRAMES_IN_FLIGHT],
            pool: ctx.command_pool,
        };
        for (i, slot) in ring.slots.iter_mut().enumerate() {
            slot.cmd = cmds[i];
        }
        for i in 0..FRAMES_IN_FLIGHT {
            match unsafe { FrameSlot::create(device, cmds[i]) } {
                Ok(slot) => ring.slots[i] = slot,
                Err(e) => {
                    unsafe { ring.destroy(device) };
                    return Err(e);
                }
            }
        }
        Ok(ring)
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &Device) {
        let cmds: Vec<vk::CommandBuffer> = self
            .slots
            .iter()
            .map(|s| s.cmd)
            .filter(|&c| c != vk::CommandBuffer::null())
            .collect();
        unsafe {
            for slot in &mut self.slots {
                slot.destroy_sync(device);
                slot.cmd = vk::CommandBuffer::null();
            }
            if !cmds.is_empty() {
                device.free_command_buffers(self.pool, &cmds);
            }
        }
    }
}
