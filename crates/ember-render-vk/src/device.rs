// SPDX-License-Identifier: CEPL-1.0
//! Physical device discovery and selection.
//!
//! Probing talks to Vulkan and produces plain [`PhysicalDeviceCandidate`]
//! records; the suitability checks only look at those records.

use ash::khr::surface;
use ash::{vk, Instance};
use std::collections::BTreeSet;
use std::ffi::CStr;
use tracing::{debug, info};

use crate::config::DeviceRequirements;
use crate::error::{VkError, VkResult, VkResultExt};
use crate::swapchain::SwapchainSupport;

bitflags::bitflags! {
    /// What a queue family can do, including presenting to our surface.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct QueueCaps: u8 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const PRESENT = 1 << 3;
    }
}

impl QueueCaps {
    pub fn from_flags(flags: vk::QueueFlags, present: bool) -> Self {
        let mut caps = Self::empty();
        caps.set(Self::GRAPHICS, flags.contains(vk::QueueFlags::GRAPHICS));
        caps.set(Self::COMPUTE, flags.contains(vk::QueueFlags::COMPUTE));
        caps.set(Self::TRANSFER, flags.contains(vk::QueueFlags::TRANSFER));
        caps.set(Self::PRESENT, present);
        caps
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    /// Tags the first family exposing each capability. Stops scanning as
    /// soon as graphics and present are both known.
    pub fn resolve(families: &[QueueCaps]) -> Self {
        let mut indices = Self::default();
        for (i, caps) in families.iter().enumerate() {
            let i = i as u32;
            if caps.contains(QueueCaps::GRAPHICS) {
                indices.graphics.get_or_insert(i);
            }
            if caps.contains(QueueCaps::COMPUTE) {
                indices.compute.get_or_insert(i);
            }
            if caps.contains(QueueCaps::TRANSFER) {
                indices.transfer.get_or_insert(i);
            }
            if caps.contains(QueueCaps::PRESENT) {
                indices.present.get_or_insert(i);
            }
            if indices.is_complete() {
                break;
            }
        }
        indices
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct families to request queues from, ascending.
    pub fn unique(&self) -> Vec<u32> {
        [self.graphics, self.present, self.compute, self.transfer]
            .into_iter()
            .flatten()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// (graphics, present) of a complete set.
    pub fn graphics_present(&self) -> Option<(u32, u32)> {
        Some((self.graphics?, self.present?))
    }
}

/// Everything selection needs to know about one GPU.
#[derive(Clone, Debug)]
pub struct PhysicalDeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub geometry_shader: bool,
    pub queue_families: Vec<QueueCaps>,
    pub extensions_supported: bool,
    /// Only queried when the extensions are supported.
    pub swapchain: Option<SwapchainSupport>,
}

/// First predicate a candidate failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    NotDiscrete,
    NoGeometryShader,
    IncompleteQueues,
    MissingExtensions,
    InadequateSwapchain,
}

pub fn check_candidate(
    candidate: &PhysicalDeviceCandidate,
    req: &DeviceRequirements,
) -> Result<QueueFamilyIndices, Rejection> {
    if req.require_discrete && candidate.device_type != vk::PhysicalDeviceType::DISCRETE_GPU {
        return Err(Rejection::NotDiscrete);
    }
    if req.require_geometry_shader && !candidate.geometry_shader {
        return Err(Rejection::NoGeometryShader);
    }
    let indices = QueueFamilyIndices::resolve(&candidate.queue_families);
    if !indices.is_complete() {
        return Err(Rejection::IncompleteQueues);
    }
    if !candidate.extensions_supported {
        return Err(Rejection::MissingExtensions);
    }
    match &candidate.swapchain {
        Some(support) if support.is_adequate() => Ok(indices),
        _ => Err(Rejection::InadequateSwapchain),
    }
}

/// First suitable candidate in enumeration order. No ranking.
pub fn select_candidate(
    candidates: &[PhysicalDeviceCandidate],
    req: &DeviceRequirements,
) -> VkResult<(vk::PhysicalDevice, QueueFamilyIndices)> {
    for c in candidates {
        match check_candidate(c, req) {
            Ok(indices) => {
                info!(
                    "vk: selected '{}' ({:?}) graphics={:?} present={:?} compute={:?} transfer={:?}",
                    c.name,
                    c.device_type,
                    indices.graphics,
                    indices.present,
                    indices.compute,
                    indices.transfer
                );
                return Ok((c.handle, indices));
            }
            Err(why) => debug!("vk: rejected '{}': {:?}", c.name, why),
        }
    }
    Err(VkError::NoSuitableDevice {
        examined: candidates.len(),
    })
}

/// [`select_candidate`] over raw probe results. A device whose probe failed
/// counts as rejected; it still counts toward `examined`.
pub fn select_probed(
    probes: Vec<VkResult<PhysicalDeviceCandidate>>,
    req: &DeviceRequirements,
) -> VkResult<(vk::PhysicalDevice, QueueFamilyIndices)> {
    let examined = probes.len();
    let candidates: Vec<PhysicalDeviceCandidate> = probes
        .into_iter()
        .enumerate()
        .filter_map(|(i, probe)| match probe {
            Ok(c) => Some(c),
            Err(e) => {
                debug!("vk: rejected device #{i}: probe failed: {e}");
                None
            }
        })
        .collect();
    match select_candidate(&candidates, req) {
        Err(VkError::NoSuitableDevice { .. }) => Err(VkError::NoSuitableDevice { examined }),
        picked => picked,
    }
}

pub(crate) fn supports_extensions(
    instance: &Instance,
    phys: vk::PhysicalDevice,
    required: &[&CStr],
) -> VkResult<bool> {
    // SAFETY: phys was enumerated from this instance.
    let available = unsafe { instance.enumerate_device_extension_properties(phys) }
        .op("enumerate_device_extension_properties")?;
    Ok(required.iter().all(|want| {
        available
            .iter()
            .any(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) } == *want)
    }))
}

/// Queries one device. Surface support queries that fail count as "no".
pub fn probe_candidate(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
    required_extensions: &[&CStr],
) -> VkResult<PhysicalDeviceCandidate> {
    // SAFETY: phys was enumerated from this instance; surface outlives the call.
    unsafe {
        let props = instance.get_physical_device_properties(phys);
        let features = instance.get_physical_device_features(phys);
        let name = CStr::from_ptr(props.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let queue_families = instance
            .get_physical_device_queue_family_properties(phys)
            .iter()
            .enumerate()
            .map(|(i, q)| {
                let present = surface_loader
                    .get_physical_device_surface_support(phys, i as u32, surface)
                    .unwrap_or(false);
                QueueCaps::from_flags(q.queue_flags, present)
            })
            .collect();

        let extensions_supported = supports_extensions(instance, phys, required_extensions)?;
        let swapchain = if extensions_supported {
            Some(SwapchainSupport::query(surface_loader, phys, surface)?)
        } else {
            None
        };

        Ok(PhysicalDeviceCandidate {
            handle: phys,
            name,
            device_type: props.device_type,
            geometry_shader: features.geometry_shader == vk::TRUE,
            queue_families,
            extensions_supported,
            swapchain,
        })
    }
}

pub fn select_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    required_extensions: &[&CStr],
    req: &DeviceRequirements,
) -> VkResult<(vk::PhysicalDevice, QueueFamilyIndices)> {
    // SAFETY: instance is live.
    let devices =
        unsafe { instance.enumerate_physical_devices() }.op("enumerate_physical_devices")?;
    let probes = devices
        .into_iter()
        .map(|phys| probe_candidate(instance, surface_loader, surface, phys, required_extensions))
        .collect();
    select_probed(probes, req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn adequate_support() -> SwapchainSupport {
        SwapchainSupport {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    fn good(raw: u64, name: &str) -> PhysicalDeviceCandidate {
        PhysicalDeviceCandidate {
            handle: vk::PhysicalDevice::from_raw(raw),
            name: name.to_owned(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            geometry_shader: true,
            queue_families: vec![
                QueueCaps::GRAPHICS | QueueCaps::COMPUTE | QueueCaps::TRANSFER | QueueCaps::PRESENT,
            ],
            extensions_supported: true,
            swapchain: Some(adequate_support()),
        }
    }

    #[test]
    fn resolve_tags_first_family_per_capability() {
        let families = [
            QueueCaps::TRANSFER,
            QueueCaps::GRAPHICS | QueueCaps::COMPUTE | QueueCaps::TRANSFER,
            QueueCaps::PRESENT,
            QueueCaps::GRAPHICS | QueueCaps::PRESENT,
        ];
        let idx = QueueFamilyIndices::resolve(&families);
        assert_eq!(idx.transfer, Some(0));
        assert_eq!(idx.graphics, Some(1));
        assert_eq!(idx.compute, Some(1));
        assert_eq!(idx.present, Some(2));
        assert_eq!(idx.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn resolve_stops_once_graphics_and_present_found() {
        let families = [QueueCaps::GRAPHICS | QueueCaps::PRESENT, QueueCaps::COMPUTE];
        let idx = QueueFamilyIndices::resolve(&families);
        assert!(idx.is_complete());
        assert_eq!(idx.compute, None);
        assert_eq!(idx.unique(), vec![0]);
    }

    #[test]
    fn missing_present_is_incomplete() {
        let idx = QueueFamilyIndices::resolve(&[QueueCaps::GRAPHICS, QueueCaps::COMPUTE]);
        assert!(!idx.is_complete());
        assert_eq!(idx.graphics_present(), None);
    }

    #[test]
    fn first_suitable_candidate_wins() {
        let mut integrated = good(1, "igpu");
        integrated.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        let candidates = [integrated, good(2, "first"), good(3, "second")];

        let (phys, idx) = select_candidate(&candidates, &DeviceRequirements::default()).unwrap();
        assert_eq!(phys.as_raw(), 2);
        assert_eq!(idx.graphics_present(), Some((0, 0)));
    }

    #[test]
    fn all_failing_candidates_report_no_suitable_device() {
        let mut no_ext = good(1, "no-ext");
        no_ext.extensions_supported = false;
        no_ext.swapchain = None;
        let mut no_formats = good(2, "no-formats");
        no_formats.swapchain.as_mut().unwrap().formats.clear();
        let mut no_present = good(3, "no-present");
        no_present.queue_families = vec![QueueCaps::GRAPHICS];
        let mut no_geom = good(4, "no-geom");
        no_geom.geometry_shader = false;

        let err = select_candidate(
            &[no_ext, no_formats, no_present, no_geom],
            &DeviceRequirements::default(),
        )
        .unwrap_err();
        assert!(matches!(err, VkError::NoSuitableDevice { examined: 4 }));

        assert!(matches!(
            select_candidate(&[], &DeviceRequirements::default()),
            Err(VkError::NoSuitableDevice { examined: 0 })
        ));
    }

    #[test]
    fn rejection_reports_first_failing_predicate() {
        let req = DeviceRequirements::default();
        let mut c = good(1, "x");
        c.device_type = vk::PhysicalDeviceType::CPU;
        c.geometry_shader = false;
        assert_eq!(check_candidate(&c, &req), Err(Rejection::NotDiscrete));

        let mut c = good(1, "x");
        c.swapchain.as_mut().unwrap().present_modes.clear();
        assert_eq!(check_candidate(&c, &req), Err(Rejection::InadequateSwapchain));
    }

    #[test]
    fn relaxed_requirements_accept_integrated_gpu() {
        let mut c = good(7, "igpu");
        c.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        c.geometry_shader = false;
        assert_eq!(
            check_candidate(&c, &DeviceRequirements::default()),
            Err(Rejection::NotDiscrete)
        );
        let (phys, _) = select_candidate(&[c], &DeviceRequirements::RELAXED).unwrap();
        assert_eq!(phys.as_raw(), 7);
    }

    fn lost(op: &'static str) -> VkError {
        VkError::Vulkan {
            op,
            result: vk::Result::ERROR_DEVICE_LOST,
        }
    }

    #[test]
    fn failed_device_query_is_skipped_not_fatal() {
        let probes = vec![
            Err(lost("enumerate_device_extension_properties")),
            Ok(good(5, "after-failure")),
        ];
        let (phys, _) = select_probed(probes, &DeviceRequirements::default()).unwrap();
        assert_eq!(phys.as_raw(), 5);
    }

    #[test]
    fn failed_queries_still_count_as_examined() {
        let mut igpu = good(2, "igpu");
        igpu.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        let probes = vec![
            Err(lost("get_physical_device_surface_formats")),
            Ok(igpu),
            Err(lost("get_physical_device_surface_capabilities")),
        ];
        assert!(matches!(
            select_probed(probes, &DeviceRequirements::default()),
            Err(VkError::NoSuitableDevice { examined: 3 })
        ));
    }
}
