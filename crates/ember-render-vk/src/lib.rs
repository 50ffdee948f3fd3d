// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend: device selection, swapchain lifecycle and a two-deep
//! ring of frames in flight.

use anyhow::{Context, Result};
use ash::khr::surface;
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{info, warn};

use ember_math::glam::Vec2;
use ember_math::{quad, QUAD_INDICES};
use ember_render::{RenderSize, Renderer};

pub mod backend;
pub mod buffer;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod frame;
pub mod instance;
pub mod pipeline;
pub mod ring;
pub mod swapchain;

pub use backend::VkFrameBackend;
pub use buffer::{GpuBuffer, StaticGeometry};
pub use config::{DeviceRequirements, PresentModePreference, VkConfig};
pub use context::DeviceContext;
pub use device::{QueueCaps, QueueFamilyIndices};
pub use error::{VkError, VkResult};
pub use frame::{AcquireOutcome, FrameBackend, FrameOutcome, FrameScheduler, PresentOutcome};
pub use pipeline::{GraphicsPipeline, ShaderBlobs};
pub use ring::{FrameRing, FRAMES_IN_FLIGHT};
pub use swapchain::{SwapchainManager, SwapchainPlan};

use crate::instance::DebugMessenger;

/// Everything created from the logical device.
struct GpuState {
    ctx: DeviceContext,
    swapchain: SwapchainManager,
    pipeline: GraphicsPipeline,
    geometry: StaticGeometry,
    ring: FrameRing,
}

impl GpuState {
    /// An empty `size` leaves the chain unbuilt until the first non-empty
    /// resize.
    fn new(
        instance: &Instance,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
        cfg: &VkConfig,
        validation: bool,
        size: RenderSize,
    ) -> VkResult<Self> {
        let shaders = match &cfg.shader_dir {
            Some(dir) => ShaderBlobs::load_dir(dir)?,
            None => ShaderBlobs::builtin()?,
        };
        let extensions = [ash::khr::swapchain::NAME];
        let (phys, indices) =
            device::select_device(instance, surface_loader, surface, &extensions, &cfg.device)?;
        let mut ctx = DeviceContext::new(instance, phys, indices, &extensions, validation)?;

        let mut swapchain = SwapchainManager::new(
            instance,
            &ctx,
            surface_loader.clone(),
            surface,
            cfg.present_mode,
        );
        let objects = (|| -> VkResult<(GraphicsPipeline, StaticGeometry, FrameRing)> {
            let plan = swapchain.plan(&ctx, size)?;
            let mut pipeline = GraphicsPipeline::new(&ctx.device, plan.format.format, shaders)?;
            let chain = if size.is_empty() || !plan.has_area() {
                Ok(())
            } else {
                swapchain.build(&ctx, &plan, pipeline.render_pass())
            };
            let vertices = quad(Vec2::ZERO, Vec2::splat(0.5));
            let rest = chain
                .and_then(|()| StaticGeometry::upload(&ctx, &vertices, &QUAD_INDICES))
                .and_then(|mut geometry| match FrameRing::new(&ctx) {
                    Ok(ring) => Ok((geometry, ring)),
                    Err(e) => {
                        unsafe { geometry.destroy(&ctx.device) };
                        Err(e)
                    }
                });
            match rest {
                Ok((geometry, ring)) => Ok((pipeline, geometry, ring)),
                Err(e) => {
                    unsafe { pipeline.destroy(&ctx.device) };
                    Err(e)
                }
            }
        })();

        match objects {
            Ok((pipeline, geometry, ring)) => Ok(Self {
                ctx,
                swapchain,
                pipeline,
                geometry,
                ring,
            }),
            Err(e) => {
                // SAFETY: nothing was submitted except finished uploads.
                unsafe {
                    swapchain.destroy(&ctx.device);
                    ctx.destroy();
                }
                Err(e)
            }
        }
    }

    fn backend<'a>(
        &'a mut self,
        size: &'a dyn Fn() -> RenderSize,
        clear: [f32; 4],
    ) -> VkFrameBackend<'a> {
        VkFrameBackend {
            ctx: &self.ctx,
            ring: &self.ring,
            swapchain: &mut self.swapchain,
            pipeline: &mut self.pipeline,
            geometry: &self.geometry,
            size,
            clear,
        }
    }
}

pub struct VkRenderer {
    _entry: Entry,
    instance: Instance,
    debug: Option<DebugMessenger>,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
    gpu: GpuState,
    scheduler: FrameScheduler,

    size: RenderSize,
    /// Zero-area framebuffer; frames are skipped until the next non-empty resize.
    paused: bool,
    clear: [f32; 4],
    /// Present mode from config, restored when vsync is switched off.
    configured_present: PresentModePreference,
    shut_down: bool,
}

impl VkRenderer {
    pub fn with_config(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &VkConfig,
    ) -> Result<Self> {
        let dh = display.display_handle()?.as_raw();
        let wh = window.window_handle()?.as_raw();

        let entry = instance::load_entry().context("load Vulkan loader")?;
        let (instance, validation) =
            instance::create_instance(&entry, Some(dh), cfg.validation).context("create_instance")?;

        let mut debug = if validation {
            match DebugMessenger::new(&entry, &instance) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!("vk: debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };
        let destroy_instance = |debug: &mut Option<DebugMessenger>| unsafe {
            if let Some(m) = debug.as_mut() {
                m.destroy();
            }
            instance.destroy_instance(None);
        };

        // SAFETY: the window outlives the renderer (owned by the app, dropped after it).
        let surface = match unsafe { instance::create_surface(&entry, &instance, dh, wh) } {
            Ok(s) => s,
            Err(e) => {
                destroy_instance(&mut debug);
                return Err(e).context("create_surface");
            }
        };
        let surface_loader = surface::Instance::new(&entry, &instance);

        let gpu = match GpuState::new(&instance, &surface_loader, surface, cfg, validation, size) {
            Ok(gpu) => gpu,
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                destroy_instance(&mut debug);
                return Err(e).context("initialize Vulkan device");
            }
        };

        match gpu.swapchain.state() {
            Some(state) => info!(
                "Vulkan renderer ready on '{}' ({}x{}, {:?}, {:?})",
                gpu.ctx.name,
                state.extent.width,
                state.extent.height,
                state.format,
                state.present_mode
            ),
            None => info!(
                "Vulkan renderer ready on '{}', paused until the framebuffer has area",
                gpu.ctx.name
            ),
        }

        let paused = gpu.swapchain.state().is_none();
        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            gpu,
            scheduler: FrameScheduler::new(),
            size,
            paused,
            clear: cfg.clear_color,
            configured_present: cfg.present_mode,
            shut_down: false,
        })
    }

    /// Runs one frame, rebuilding a stale chain at the last resized size.
    /// `None` while paused or after shutdown.
    pub fn render_frame(&mut self) -> Result<Option<FrameOutcome>> {
        let cached = self.size;
        self.render_frame_sized(&move || cached)
    }

    /// Like [`render_frame`](Self::render_frame), but a chain rebuilt
    /// mid-frame is sized from `framebuffer_size`, queried at that moment.
    /// An empty answer drops the chain and pauses.
    pub fn render_frame_sized(
        &mut self,
        framebuffer_size: &dyn Fn() -> RenderSize,
    ) -> Result<Option<FrameOutcome>> {
        if self.paused || self.shut_down {
            return Ok(None);
        }
        let recreations = self.scheduler.recreations();
        let mut backend = self.gpu.backend(framebuffer_size, self.clear);
        let outcome = self.scheduler.run_frame(&mut backend).context("render frame")?;

        if self.scheduler.recreations() != recreations {
            self.size = framebuffer_size();
        }
        if self.gpu.swapchain.state().is_none() {
            info!("vk: framebuffer is empty, pausing");
            self.paused = true;
        }
        Ok(Some(outcome))
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    pub fn device_name(&self) -> &str {
        &self.gpu.ctx.name
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn recreate(&mut self) -> Result<()> {
        let cached = self.size;
        let size = move || cached;
        let mut backend = self.gpu.backend(&size, self.clear);
        self.scheduler
            .recreate(&mut backend)
            .context("recreate swapchain")
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
    ) -> Result<Self> {
        Self::with_config(window, display, size, &VkConfig::default())
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.size = size;
        if size.is_empty() {
            if !self.paused {
                info!("vk: framebuffer is empty, pausing");
            }
            self.paused = true;
            return Ok(());
        }
        self.recreate()?;
        self.paused = self.gpu.swapchain.state().is_none();
        Ok(())
    }

    fn render(&mut self) -> Result<()> {
        self.render_frame().map(|_| ())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
    }

    fn set_vsync(&mut self, on: bool) {
        let preference = if on {
            PresentModePreference::Fifo
        } else {
            self.configured_present
        };
        if preference == self.gpu.swapchain.preference() {
            return;
        }
        self.gpu.swapchain.set_preference(preference);
        if self.paused || self.shut_down {
            return;
        }
        if let Err(e) = self.recreate() {
            warn!("vk: switching present mode failed: {e:#}");
        }
        self.paused = self.gpu.swapchain.state().is_none();
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let cached = self.size;
        let size = move || cached;
        let mut backend = self.gpu.backend(&size, self.clear);
        let drained = self.scheduler.drain(&mut backend);
        if let Err(e) = &drained {
            warn!("vk: device_wait_idle failed during shutdown: {e}");
        }

        // STRICT TEARDOWN ORDER:
        // frame ring -> geometry -> swapchain -> pipeline -> device
        //   -> surface -> messenger -> instance
        unsafe {
            let g = &mut self.gpu;
            g.ring.destroy(&g.ctx.device);
            g.geometry.destroy(&g.ctx.device);
            g.swapchain.destroy(&g.ctx.device);
            g.pipeline.destroy(&g.ctx.device);
            g.ctx.destroy();

            self.surface_loader.destroy_surface(self.surface, None);
            if let Some(m) = self.debug.as_mut() {
                m.destroy();
            }
            self.instance.destroy_instance(None);
        }
        info!("vk: shut down");
        drained.context("drain frames in flight")
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("vk: shutdown from drop: {e:#}");
        }
    }
}
