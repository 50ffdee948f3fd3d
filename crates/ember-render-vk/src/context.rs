// SPDX-License-Identifier: CEPL-1.0
//! Logical device, queues and the shared command pool.

use ash::{vk, Device, Instance};
use std::ffi::{c_char, CStr};
use tracing::info;

use crate::device::QueueFamilyIndices;
use crate::error::{VkError, VkResult, VkResultExt};
use crate::instance::VALIDATION_LAYER;

pub struct DeviceContext {
    pub phys: vk::PhysicalDevice,
    pub device: Device,
    pub indices: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    /// Graphics-family pool; command buffers are individually resettable.
    pub command_pool: vk::CommandPool,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub name: String,
    destroyed: bool,
}

impl DeviceContext {
    /// `indices` must be complete (graphics and present resolved).
    pub fn new(
        instance: &Instance,
        phys: vk::PhysicalDevice,
        indices: QueueFamilyIndices,
        extensions: &[&CStr],
        validation: bool,
    ) -> VkResult<Self> {
        let (graphics_family, present_family) = indices
            .graphics_present()
            .ok_or(VkError::DeviceCreation(vk::Result::ERROR_INITIALIZATION_FAILED))?;

        let priority = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = indices
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priority.as_ptr(),
                ..Default::default()
            })
            .collect();

        let ext_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
        // Device layers are deprecated but older loaders still read them.
        let layers = [VALIDATION_LAYER.as_ptr()];
        let (enabled_layer_count, pp_enabled_layer_names) = if validation {
            (layers.len() as u32, layers.as_ptr())
        } else {
            (0, std::ptr::null())
        };
        let features = vk::PhysicalDeviceFeatures::default();

        let dci = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: ext_ptrs.len() as u32,
            pp_enabled_extension_names: ext_ptrs.as_ptr(),
            enabled_layer_count,
            pp_enabled_layer_names,
            p_enabled_features: &features,
            ..Default::default()
        };

        // SAFETY: phys belongs to instance; every pointer borrows a local.
        let device = unsafe { instance.create_device(phys, &dci, None) }
            .map_err(VkError::DeviceCreation)?;

        // SAFETY: each family was requested with exactly one queue above.
        let (graphics_queue, present_queue) = unsafe {
            (
                device.get_device_queue(graphics_family, 0),
                device.get_device_queue(present_family, 0),
            )
        };

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: graphics_family,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        // SAFETY: device is live and nothing else owns it yet.
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(VkError::CommandPoolCreation(e));
            }
        };

        // SAFETY: plain queries on a live physical device.
        let (memory_properties, props) = unsafe {
            (
                instance.get_physical_device_memory_properties(phys),
                instance.get_physical_device_properties(phys),
            )
        };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        info!(
            "vk: device '{}' ready ({} queue famil{}, {} extension(s), validation={})",
            name,
            queue_infos.len(),
            if queue_infos.len() == 1 { "y" } else { "ies" },
            extensions.len(),
            validation
        );

        Ok(Self {
            phys,
            device,
            indices,
            graphics_queue,
            present_queue,
            command_pool,
            memory_properties,
            name,
            destroyed: false,
        })
    }

    pub fn wait_idle(&self) -> VkResult<()> {
        // SAFETY: device is live until destroy().
        unsafe { self.device.device_wait_idle() }.op("device_wait_idle")
    }

    /// Pool, then device. Everything created from this device must already be gone.
    ///
    /// # Safety
    /// No other object may still reference the device.
    pub unsafe fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
        self.command_pool = vk::CommandPool::null();
        self.destroyed = true;
    }
}
