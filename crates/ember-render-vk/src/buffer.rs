// SPDX-License-Identifier: CEPL-1.0
//! Device-local buffers filled through a host-visible staging copy.

use ash::{vk, Device};
use bytemuck::Pod;
use ember_math::{Index, Vertex};
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{VkError, VkResult, VkResultExt};

const STAGING: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
        | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

/// A buffer and the memory bound to it. Owned by whoever created it.
#[derive(Debug)]
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub properties: vk::MemoryPropertyFlags,
}

impl GpuBuffer {
    /// # Safety
    /// The GPU must be done with the buffer.
    pub unsafe fn destroy(&mut self, device: &Device) {
        unsafe {
            if self.handle != vk::Buffer::null() {
                device.destroy_buffer(self.handle, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
        self.handle = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// First memory type allowed by `type_filter` whose flags include `required`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    required: vk::MemoryPropertyFlags,
) -> VkResult<u32> {
    (0..props.memory_type_count)
        .find(|&i| {
            type_filter & (1 << i) != 0
                && props.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(VkError::UnsupportedMemoryType {
            type_filter,
            required,
        })
}

pub fn create_buffer(
    ctx: &DeviceContext,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
) -> VkResult<GpuBuffer> {
    let device = &ctx.device;
    let bci = vk::BufferCreateInfo {
        s_type: vk::StructureType::BUFFER_CREATE_INFO,
        size,
        usage,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let alloc_err = |result: vk::Result| VkError::BufferAllocation { size, result };

    // SAFETY: plain object creation on a live device.
    let handle = unsafe { device.create_buffer(&bci, None) }.map_err(alloc_err)?;
    let mut buf = GpuBuffer {
        handle,
        memory: vk::DeviceMemory::null(),
        size,
        usage,
        properties,
    };

    let req = unsafe { device.get_buffer_memory_requirements(handle) };
    let bound = find_memory_type(&ctx.memory_properties, req.memory_type_bits, properties)
        .and_then(|memory_type_index| {
            let mai = vk::MemoryAllocateInfo {
                s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
                allocation_size: req.size,
                memory_type_index,
                ..Default::default()
            };
            buf.memory = unsafe { device.allocate_memory(&mai, None) }.map_err(alloc_err)?;
            unsafe { device.bind_buffer_memory(handle, buf.memory, 0) }.op("bind_buffer_memory")
        });
    if let Err(e) = bound {
        unsafe { buf.destroy(device) };
        return Err(e);
    }
    Ok(buf)
}

/// Records with `record`, submits to the graphics queue and blocks until the
/// queue is idle. The command buffer is freed on every path.
pub fn one_shot<F>(ctx: &DeviceContext, record: F) -> VkResult<()>
where
    F: FnOnce(&Device, vk::CommandBuffer),
{
    let device = &ctx.device;
    let ai = vk::CommandBufferAllocateInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
        command_pool: ctx.command_pool,
        level: vk::CommandBufferLevel::PRIMARY,
        command_buffer_count: 1,
        ..Default::default()
    };
    let cmd = unsafe { device.allocate_command_buffers(&ai) }.op("allocate_command_buffers")?[0];

    let run = || -> VkResult<()> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            device.begin_command_buffer(cmd, &bi).op("begin_command_buffer")?;
            record(device, cmd);
            device.end_command_buffer(cmd).op("end_command_buffer")?;

            let si = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                ..Default::default()
            };
            device
                .queue_submit(ctx.graphics_queue, std::slice::from_ref(&si), vk::Fence::null())
                .op("queue_submit")?;
            device.queue_wait_idle(ctx.graphics_queue).op("queue_wait_idle")
        }
    };
    let result = run();
    unsafe { device.free_command_buffers(ctx.command_pool, std::slice::from_ref(&cmd)) };
    result
}

unsafe fn copy_buffer(
    ctx: &DeviceContext,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> VkResult<()> {
    one_shot(ctx, |device, cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { device.cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region)) };
    })
}

/// host -> staging -> new device-local buffer with `TRANSFER_DST | usage`.
pub fn upload(
    ctx: &DeviceContext,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> VkResult<GpuBuffer> {
    if data.is_empty() {
        return Err(VkError::EmptyUpload);
    }
    let device = &ctx.device;
    let size = data.len() as vk::DeviceSize;

    let mut staging = create_buffer(ctx, size, vk::BufferUsageFlags::TRANSFER_SRC, STAGING)?;
    let result = (|| -> VkResult<GpuBuffer> {
        // SAFETY: staging memory is host-visible and at least `size` bytes.
        unsafe {
            let ptr = device
                .map_memory(staging.memory, 0, size, vk::MemoryMapFlags::empty())
                .op("map_memory")?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            device.unmap_memory(staging.memory);
        }

        let mut dst = create_buffer(
            ctx,
            size,
            vk::BufferUsageFlags::TRANSFER_DST | usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        if let Err(e) = unsafe { copy_buffer(ctx, staging.handle, dst.handle, size) } {
            unsafe { dst.destroy(device) };
            return Err(e);
        }
        Ok(dst)
    })();
    // The copy has completed (or never ran), staging can go.
    unsafe { staging.destroy(device) };

    if result.is_ok() {
        debug!("vk: uploaded {size} bytes ({usage:?})");
    }
    result
}

pub fn upload_pod<T: Pod>(
    ctx: &DeviceContext,
    items: &[T],
    usage: vk::BufferUsageFlags,
) -> VkResult<GpuBuffer> {
    upload(ctx, bytemuck::cast_slice(items), usage)
}

/// Copies the contents of `buffer` back to the host. Debug path; the buffer
/// must have been created with `TRANSFER_SRC`.
pub fn read_back(ctx: &DeviceContext, buffer: &GpuBuffer) -> VkResult<Vec<u8>> {
    if !buffer.usage.contains(vk::BufferUsageFlags::TRANSFER_SRC) {
        return Err(VkError::ReadbackUnsupported);
    }
    let device = &ctx.device;
    let size = buffer.size;
    let mut host = create_buffer(ctx, size, vk::BufferUsageFlags::TRANSFER_DST, STAGING)?;

    let result = (|| -> VkResult<Vec<u8>> {
        // SAFETY: host memory is host-visible and coherent; the copy has completed.
        unsafe {
            copy_buffer(ctx, buffer.handle, host.handle, size)?;
            let ptr = device
                .map_memory(host.memory, 0, size, vk::MemoryMapFlags::empty())
                .op("map_memory")?;
            let out = std::slice::from_raw_parts(ptr.cast::<u8>(), size as usize).to_vec();
            device.unmap_memory(host.memory);
            Ok(out)
        }
    })();
    unsafe { host.destroy(device) };
    result
}

/// Vertex and index buffers uploaded once at startup.
#[derive(Debug)]
pub struct StaticGeometry {
    pub vertices: GpuBuffer,
    pub indices: GpuBuffer,
    pub index_count: u32,
}

impl StaticGeometry {
    pub fn upload(ctx: &DeviceContext, vertices: &[Vertex], indices: &[Index]) -> VkResult<Self> {
        let mut vb = upload_pod(ctx, vertices, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let ib = match upload_pod(ctx, indices, vk::BufferUsageFlags::INDEX_BUFFER) {
            Ok(ib) => ib,
            Err(e) => {
                unsafe { vb.destroy(&ctx.device) };
                return Err(e);
            }
        };
        Ok(Self {
            vertices: vb,
            indices: ib,
            index_count: indices.len() as u32,
        })
    }

    /// # Safety
    /// The GPU must be done with both buffers.
    pub unsafe fn destroy(&mut self, device: &Device) {
        unsafe {
            self.indices.destroy(device);
            self.vertices.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in p.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        p
    }

    #[test]
    fn picks_first_superset_in_filter() {
        let p = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            STAGING,
            STAGING | vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(find_memory_type(&p, 0b1111, STAGING).unwrap(), 2);
        // type 2 filtered out
        assert_eq!(find_memory_type(&p, 0b1011, STAGING).unwrap(), 3);
        assert_eq!(
            find_memory_type(&p, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn unsatisfiable_request_is_an_error() {
        let p = props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&p, 0b1, STAGING).unwrap_err();
        assert!(matches!(err, VkError::UnsupportedMemoryType { type_filter: 1, .. }));
        // bits beyond memory_type_count are ignored
        assert!(find_memory_type(&p, 0b10, vk::MemoryPropertyFlags::empty()).is_err());
    }
}
