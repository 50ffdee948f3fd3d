// SPDX-License-Identifier: CEPL-1.0
//! Presentation chain: the pure decisions ([`SwapchainPlan`]), the Vulkan
//! objects built from them ([`SwapchainState`]) and the owner that rebuilds
//! them when the surface changes ([`SwapchainManager`]).

use ash::khr::{surface, swapchain};
use ash::{vk, Device, Instance};
use ember_render::RenderSize;
use tracing::{debug, info};

use crate::config::PresentModePreference;
use crate::context::DeviceContext;
use crate::device::QueueFamilyIndices;
use crate::error::{VkError, VkResult, VkResultExt};
use crate::frame::{AcquireOutcome, PresentOutcome};
use crate::pipeline::GraphicsPipeline;

/// Surface capabilities as seen by one physical device.
#[derive(Clone, Debug)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(
        surface_loader: &surface::Instance,
        phys: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Self> {
        // SAFETY: phys and surface come from the same instance as the loader.
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(phys, surface)
                    .op("get_physical_device_surface_capabilities")?,
                formats: surface_loader
                    .get_physical_device_surface_formats(phys, surface)
                    .op("get_physical_device_surface_formats")?,
                present_modes: surface_loader
                    .get_physical_device_surface_present_modes(phys, surface)
                    .op("get_physical_device_surface_present_modes")?,
            })
        }
    }

    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// `B8G8R8A8_SRGB` in the sRGB nonlinear space if offered, else the first format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preference: PresentModePreference,
) -> vk::PresentModeKHR {
    match preference {
        PresentModePreference::Mailbox if modes.contains(&vk::PresentModeKHR::MAILBOX) => {
            vk::PresentModeKHR::MAILBOX
        }
        // FIFO is the one mode every implementation must support.
        _ => vk::PresentModeKHR::FIFO,
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped by the maximum (0 means no maximum).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueSharing {
    Exclusive,
    /// `[graphics, present]`
    Concurrent([u32; 2]),
}

impl QueueSharing {
    pub fn between(graphics: u32, present: u32) -> Self {
        if graphics == present {
            Self::Exclusive
        } else {
            Self::Concurrent([graphics, present])
        }
    }
}

/// Every choice that goes into a swapchain create info.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainPlan {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub sharing: QueueSharing,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    pub fn new(
        support: &SwapchainSupport,
        indices: &QueueFamilyIndices,
        framebuffer: RenderSize,
        preference: PresentModePreference,
    ) -> VkResult<Self> {
        let format = choose_surface_format(&support.formats)
            .ok_or(VkError::SwapchainCreation(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;
        let (graphics, present) = indices
            .graphics_present()
            .ok_or(VkError::SwapchainCreation(vk::Result::ERROR_INITIALIZATION_FAILED))?;
        let caps = &support.capabilities;
        Ok(Self {
            format,
            present_mode: choose_present_mode(&support.present_modes, preference),
            extent: choose_extent(caps, framebuffer),
            image_count: choose_image_count(caps),
            sharing: QueueSharing::between(graphics, present),
            pre_transform: caps.current_transform,
        })
    }

    /// A zero-area extent cannot back a swapchain.
    pub fn has_area(&self) -> bool {
        self.extent.width > 0 && self.extent.height > 0
    }
}

/// The chain and everything sized to it. `images`, `views` and
/// `framebuffers` always have the same length.
pub struct SwapchainState {
    pub chain: vk::SwapchainKHR,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl SwapchainState {
    /// On failure, whatever was already created is destroyed again.
    pub fn create(
        device: &Device,
        loader: &swapchain::Device,
        surface: vk::SurfaceKHR,
        plan: &SwapchainPlan,
        render_pass: vk::RenderPass,
    ) -> VkResult<Self> {
        let (image_sharing_mode, family_indices) = match &plan.sharing {
            QueueSharing::Exclusive => (vk::SharingMode::EXCLUSIVE, [].as_slice()),
            QueueSharing::Concurrent(pair) => (vk::SharingMode::CONCURRENT, pair.as_slice()),
        };

        let info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface,
            min_image_count: plan.image_count,
            image_format: plan.format.format,
            image_color_space: plan.format.color_space,
            image_extent: plan.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode,
            queue_family_index_count: family_indices.len() as u32,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform: plan.pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: plan.present_mode,
            clipped: vk::TRUE,
            old_swapchain: vk::SwapchainKHR::null(),
            ..Default::default()
        };

        // SAFETY: surface is live; the previous chain was destroyed by the caller.
        let chain = unsafe { loader.create_swapchain(&info, None) }
            .map_err(VkError::SwapchainCreation)?;

        let mut state = Self {
            chain,
            format: plan.format.format,
            color_space: plan.format.color_space,
            present_mode: plan.present_mode,
            extent: plan.extent,
            images: Vec::new(),
            views: Vec::new(),
            framebuffers: Vec::new(),
        };
        if let Err(e) = state.build_attachments(device, loader, render_pass) {
            unsafe { state.destroy(device, loader) };
            return Err(e);
        }

        info!(
            "vk: swapchain {}x{} {:?}/{:?} {:?}, {} image(s), {:?}",
            state.extent.width,
            state.extent.height,
            state.format,
            state.color_space,
            state.present_mode,
            state.images.len(),
            plan.sharing
        );
        Ok(state)
    }

    fn build_attachments(
        &mut self,
        device: &Device,
        loader: &swapchain::Device,
        render_pass: vk::RenderPass,
    ) -> VkResult<()> {
        // SAFETY: chain was just created by this loader.
        self.images =
            unsafe { loader.get_swapchain_images(self.chain) }.op("get_swapchain_images")?;

        self.views.reserve(self.images.len());
        for &image in &self.images {
            let ci = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: self.format,
                components: vk::ComponentMapping::default(),
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = unsafe { device.create_image_view(&ci, None) }.op("create_image_view")?;
            self.views.push(view);
        }

        self.framebuffers.reserve(self.views.len());
        for view in &self.views {
            let fci = vk::FramebufferCreateInfo {
                s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                render_pass,
                attachment_count: 1,
                p_attachments: view,
                width: self.extent.width,
                height: self.extent.height,
                layers: 1,
                ..Default::default()
            };
            let fb = unsafe { device.create_framebuffer(&fci, None) }.op("create_framebuffer")?;
            self.framebuffers.push(fb);
        }
        Ok(())
    }

    /// Framebuffers, then views, then the chain. Safe to call twice.
    ///
    /// # Safety
    /// The GPU must no longer use any of these objects.
    pub unsafe fn destroy(&mut self, device: &Device, loader: &swapchain::Device) {
        unsafe {
            self.destroy_framebuffers(device);
            self.destroy_views(device);
            self.destroy_chain(loader);
        }
    }

    /// # Safety
    /// No pending submission may reference the framebuffers.
    pub unsafe fn destroy_framebuffers(&mut self, device: &Device) {
        for fb in self.framebuffers.drain(..) {
            unsafe { device.destroy_framebuffer(fb, None) };
        }
    }

    /// # Safety
    /// The framebuffers built on these views must already be gone.
    pub unsafe fn destroy_views(&mut self, device: &Device) {
        for view in self.views.drain(..) {
            unsafe { device.destroy_image_view(view, None) };
        }
    }

    /// # Safety
    /// The views of the chain's images must already be gone.
    pub unsafe fn destroy_chain(&mut self, loader: &swapchain::Device) {
        if self.chain != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(self.chain, None) };
            self.chain = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }
}

/// The steps of a chain rebuild. [`recreate_chain`] fixes their order.
pub trait ChainOps {
    fn wait_idle(&mut self) -> VkResult<()>;
    fn destroy_framebuffers(&mut self);
    fn destroy_views(&mut self);
    fn destroy_chain(&mut self);
    fn query_support(&mut self) -> VkResult<SwapchainSupport>;
    /// Color format the current render pass was built for.
    fn pipeline_format(&self) -> vk::Format;
    fn rebuild_pipeline(&mut self, format: vk::Format) -> VkResult<()>;
    fn build(&mut self, plan: &SwapchainPlan) -> VkResult<()>;
}

/// Device idle, then framebuffers, views and chain are torn down, then the
/// surface is re-queried and a new chain built. Nothing is destroyed if the
/// idle wait fails; nothing is built if the surface reports no area.
pub fn recreate_chain<O: ChainOps + ?Sized>(
    ops: &mut O,
    indices: &QueueFamilyIndices,
    size: RenderSize,
    preference: PresentModePreference,
) -> VkResult<SwapchainPlan> {
    ops.wait_idle()?;
    ops.destroy_framebuffers();
    ops.destroy_views();
    ops.destroy_chain();

    let support = ops.query_support()?;
    let plan = SwapchainPlan::new(&support, indices, size, preference)?;
    if !plan.has_area() {
        debug!("vk: surface has no area, leaving the chain released");
        return Ok(plan);
    }
    if plan.format.format != ops.pipeline_format() {
        debug!(
            "vk: surface format changed {:?} -> {:?}, rebuilding pipeline",
            ops.pipeline_format(),
            plan.format.format
        );
        ops.rebuild_pipeline(plan.format.format)?;
    }
    ops.build(&plan)?;
    Ok(plan)
}

pub(crate) fn acquire_outcome(
    result: Result<(u32, bool), vk::Result>,
) -> VkResult<AcquireOutcome> {
    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal,
        }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(e) => Err(VkError::SwapchainAcquire(e)),
    }
}

pub(crate) fn present_outcome(result: Result<bool, vk::Result>) -> VkResult<PresentOutcome> {
    match result {
        Ok(suboptimal) => Ok(PresentOutcome::Presented { suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
        Err(e) => Err(VkError::SwapchainPresent(e)),
    }
}

/// Owns the current [`SwapchainState`] and rebuilds it on demand. The
/// surface itself belongs to the renderer.
pub struct SwapchainManager {
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    loader: swapchain::Device,
    state: Option<SwapchainState>,
    preference: PresentModePreference,
}

impl SwapchainManager {
    pub fn new(
        instance: &Instance,
        ctx: &DeviceContext,
        surface_loader: surface::Instance,
        surface: vk::SurfaceKHR,
        preference: PresentModePreference,
    ) -> Self {
        Self {
            surface_loader,
            surface,
            loader: swapchain::Device::new(instance, &ctx.device),
            state: None,
            preference,
        }
    }

    pub fn state(&self) -> Option<&SwapchainState> {
        self.state.as_ref()
    }

    pub fn preference(&self) -> PresentModePreference {
        self.preference
    }

    /// Takes effect on the next [`recreate`](Self::recreate).
    pub fn set_preference(&mut self, preference: PresentModePreference) {
        self.preference = preference;
    }

    pub fn query_support(&self, phys: vk::PhysicalDevice) -> VkResult<SwapchainSupport> {
        SwapchainSupport::query(&self.surface_loader, phys, self.surface)
    }

    pub fn plan(&self, ctx: &DeviceContext, size: RenderSize) -> VkResult<SwapchainPlan> {
        let support = self.query_support(ctx.phys)?;
        SwapchainPlan::new(&support, &ctx.indices, size, self.preference)
    }

    /// Builds a chain from `plan`. Any previous chain must already be gone.
    pub fn build(
        &mut self,
        ctx: &DeviceContext,
        plan: &SwapchainPlan,
        render_pass: vk::RenderPass,
    ) -> VkResult<()> {
        debug_assert!(self.state.is_none());
        let state =
            SwapchainState::create(&ctx.device, &self.loader, self.surface, plan, render_pass)?;
        self.state = Some(state);
        Ok(())
    }

    /// Drains the device, tears the chain down and builds a new one for the
    /// current surface. Rebuilds the pipeline first if the format changed.
    pub fn recreate(
        &mut self,
        ctx: &DeviceContext,
        pipeline: &mut GraphicsPipeline,
        size: RenderSize,
    ) -> VkResult<()> {
        let preference = self.preference;
        let mut ops = VkChainOps {
            ctx,
            manager: self,
            pipeline,
        };
        let plan = recreate_chain(&mut ops, &ctx.indices, size, preference)?;
        if plan.has_area() {
            info!("vk: swapchain recreated for {}x{}", size.width, size.height);
        }
        Ok(())
    }

    /// Idles the device and drops the chain without building a new one.
    pub fn release(&mut self, ctx: &DeviceContext) -> VkResult<()> {
        ctx.wait_idle()?;
        // SAFETY: the device is idle.
        unsafe { self.destroy(&ctx.device) };
        Ok(())
    }

    pub fn acquire(&self, signal: vk::Semaphore) -> VkResult<AcquireOutcome> {
        let Some(state) = &self.state else {
            return Ok(AcquireOutcome::OutOfDate);
        };
        // SAFETY: chain and semaphore are live; the semaphore is unsignaled
        // because its previous wait was consumed by the last submit.
        acquire_outcome(unsafe {
            self.loader
                .acquire_next_image(state.chain, u64::MAX, signal, vk::Fence::null())
        })
    }

    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<PresentOutcome> {
        let Some(state) = &self.state else {
            return Ok(PresentOutcome::OutOfDate);
        };
        let info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &state.chain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        // SAFETY: image_index was acquired from this chain.
        present_outcome(unsafe { self.loader.queue_present(queue, &info) })
    }

    /// # Safety
    /// The GPU must no longer use the chain.
    pub unsafe fn destroy(&mut self, device: &Device) {
        if let Some(mut state) = self.state.take() {
            unsafe { state.destroy(device, &self.loader) };
        }
    }
}

/// [`ChainOps`] over the live objects. Only built by
/// [`SwapchainManager::recreate`], so the destroy steps always follow the
/// idle wait.
struct VkChainOps<'a> {
    ctx: &'a DeviceContext,
    manager: &'a mut SwapchainManager,
    pipeline: &'a mut GraphicsPipeline,
}

impl ChainOps for VkChainOps<'_> {
    fn wait_idle(&mut self) -> VkResult<()> {
        self.ctx.wait_idle()
    }

    fn destroy_framebuffers(&mut self) {
        if let Some(state) = self.manager.state.as_mut() {
            // SAFETY: recreate_chain waited for the device to go idle.
            unsafe { state.destroy_framebuffers(&self.ctx.device) };
        }
    }

    fn destroy_views(&mut self) {
        if let Some(state) = self.manager.state.as_mut() {
            // SAFETY: framebuffers are gone and the device is idle.
            unsafe { state.destroy_views(&self.ctx.device) };
        }
    }

    fn destroy_chain(&mut self) {
        if let Some(mut state) = self.manager.state.take() {
            // SAFETY: views are gone and the device is idle.
            unsafe { state.destroy_chain(&self.manager.loader) };
        }
    }

    fn query_support(&mut self) -> VkResult<SwapchainSupport> {
        self.manager.query_support(self.ctx.phys)
    }

    fn pipeline_format(&self) -> vk::Format {
        self.pipeline.color_format()
    }

    fn rebuild_pipeline(&mut self, format: vk::Format) -> VkResult<()> {
        self.pipeline.rebuild(&self.ctx.device, format)
    }

    fn build(&mut self, plan: &SwapchainPlan) -> VkResult<()> {
        self.manager
            .build(self.ctx, plan, self.pipeline.render_pass())
    }
}
