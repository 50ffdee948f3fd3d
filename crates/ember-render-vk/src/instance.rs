// SPDX-License-Identifier: CEPL-1.0
//! Loader, instance, validation layer and surface.

use ash::ext::debug_utils;
use ash::{vk, Entry, Instance};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr};
use tracing::{debug, error, info, trace, warn};

use crate::error::{VkError, VkResult, VkResultExt};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const APP_NAME: &CStr = c"Ember";

pub fn load_entry() -> VkResult<Entry> {
    // SAFETY: the loader is kept alive by the returned Entry.
    Ok(unsafe { Entry::load() }?)
}

pub fn validation_layer_available(entry: &Entry) -> bool {
    // SAFETY: plain enumeration, no handles involved.
    let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
    layers
        .iter()
        .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER)
}

/// Returns the instance and whether validation actually ended up enabled.
///
/// `display` is `None` for headless use (no WSI extensions).
pub fn create_instance(
    entry: &Entry,
    display: Option<RawDisplayHandle>,
    validation: bool,
) -> VkResult<(Instance, bool)> {
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: APP_NAME.as_ptr(),
        application_version: vk::make_api_version(0, 0, 1, 0),
        p_engine_name: APP_NAME.as_ptr(),
        engine_version: vk::make_api_version(0, 0, 1, 0),
        api_version: vk::API_VERSION_1_0,
        ..Default::default()
    };

    let mut extensions: Vec<*const c_char> = match display {
        Some(dh) => ash_window::enumerate_required_extensions(dh)
            .op("enumerate_required_extensions")?
            .to_vec(),
        None => Vec::new(),
    };

    let validation = if validation && !validation_layer_available(entry) {
        warn!("validation requested but {VALIDATION_LAYER:?} is not installed; continuing without it");
        false
    } else {
        validation
    };

    let layers = [VALIDATION_LAYER.as_ptr()];
    let (enabled_layer_count, pp_enabled_layer_names) = if validation {
        extensions.push(debug_utils::NAME.as_ptr());
        (layers.len() as u32, layers.as_ptr())
    } else {
        (0, std::ptr::null())
    };

    let create_info = vk::InstanceCreateInfo {
        s_type: vk::StructureType::INSTANCE_CREATE_INFO,
        p_application_info: &app_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        enabled_layer_count,
        pp_enabled_layer_names,
        ..Default::default()
    };

    // SAFETY: every pointer in create_info borrows a local that outlives the call.
    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(VkError::InstanceCreation)?;
    info!(
        "vk: instance ready (validation={}, {} extension(s))",
        validation,
        extensions.len()
    );
    Ok((instance, validation))
}

/// # Safety
/// The handles must refer to a live window/display that outlives the surface.
pub unsafe fn create_surface(
    entry: &Entry,
    instance: &Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> VkResult<vk::SurfaceKHR> {
    // SAFETY: forwarded from the caller.
    unsafe { ash_window::create_surface(entry, instance, display, window, None) }
        .map_err(VkError::SurfaceCreation)
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the layer passes either null or a valid callback struct.
    let Some(data) = (unsafe { data.as_ref() }) else {
        return vk::FALSE;
    };
    if data.p_message.is_null() {
        return vk::FALSE;
    }
    // SAFETY: p_message is a NUL-terminated string owned by the layer for this call.
    let msg = unsafe { CStr::from_ptr(data.p_message) }.to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "[{types:?}] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "[{types:?}] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", "[{types:?}] {msg}");
    } else {
        trace!(target: "vulkan", "[{types:?}] {msg}");
    }
    vk::FALSE
}

/// Forwards validation-layer output into `tracing`.
pub struct DebugMessenger {
    loader: debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    pub fn new(entry: &Entry, instance: &Instance) -> VkResult<Self> {
        let loader = debug_utils::Instance::new(entry, instance);
        let ci = vk::DebugUtilsMessengerCreateInfoEXT {
            s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
            message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            pfn_user_callback: Some(debug_callback),
            ..Default::default()
        };
        // SAFETY: the instance was created with VK_EXT_debug_utils enabled.
        let handle = unsafe { loader.create_debug_utils_messenger(&ci, None) }
            .op("create_debug_utils_messenger")?;
        Ok(Self { loader, handle })
    }

    /// # Safety
    /// Must run before the instance is destroyed, at most once.
    pub unsafe fn destroy(&mut self) {
        if self.handle != vk::DebugUtilsMessengerEXT::null() {
            // SAFETY: handle came from this loader; nulled so a second call is a no-op.
            unsafe { self.loader.destroy_debug_utils_messenger(self.handle, None) };
            self.handle = vk::DebugUtilsMessengerEXT::null();
        }
    }
}
