// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{Context, Result};
use clap::Parser;
use ember_core::{init_tracing, FpsCounter};
use ember_platform::{default_window_attributes, framebuffer_size};
use ember_render::{RenderSize, Renderer};
use ember_render_vk::{FrameOutcome, VkConfig, VkRenderer};
use tracing::{error, info, warn};

use ember_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file; missing file means defaults
    #[arg(long, default_value = "ember.toml")]
    config: PathBuf,
    /// Override `[vulkan] validation`
    #[arg(long)]
    validation: Option<bool>,
    /// Exit after this many rendered frames
    #[arg(long)]
    frames: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LogCfg {
    filter: String,
}

impl Default for LogCfg {
    fn default() -> Self {
        Self {
            filter: "info".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
struct RenderCfg {
    clear_color: [f32; 4],
    /// Forces FIFO regardless of `[vulkan] present_mode`.
    vsync: bool,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: VkConfig::default().clear_color,
            vsync: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct AppCfg {
    log: LogCfg,
    render: RenderCfg,
    vulkan: VkConfig,
}

/// Reads the config. Problems come back as a message to log once tracing is up.
fn load_cfg(path: &Path) -> (AppCfg, Option<String>) {
    match fs::read_to_string(path) {
        Ok(s) => match toml::from_str::<AppCfg>(&s) {
            Ok(cfg) => (cfg, None),
            Err(e) => (
                AppCfg::default(),
                Some(format!("{}: {e}; using defaults", path.display())),
            ),
        },
        Err(_) => (AppCfg::default(), None),
    }
}

struct App {
    cfg: AppCfg,
    frame_limit: Option<u64>,

    // Field order matters: the renderer must drop before the window.
    renderer: Option<VkRenderer>,
    window: Option<Window>,
    render_size: RenderSize,

    frames_rendered: u64,
    fps: FpsCounter,
    exiting: bool,
    failure: Option<anyhow::Error>,
}

impl App {
    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = event_loop
            .create_window(default_window_attributes("ember", RenderSize::new(1280, 720)))
            .context("create_window")?;
        self.render_size = framebuffer_size(&window);

        let mut renderer =
            VkRenderer::with_config(&window, &window, self.render_size, &self.cfg.vulkan)
                .context("Vulkan init")?;
        renderer.set_clear_color(self.cfg.render.clear_color);
        renderer.set_vsync(self.cfg.render.vsync);
        info!(
            "device = '{}', vsync cfg = {}",
            renderer.device_name(),
            self.cfg.render.vsync
        );

        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    /// Orderly teardown: renderer first, then the window it presents to.
    fn exit(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        if let Some(mut r) = self.renderer.take() {
            if let Err(e) = r.shutdown() {
                error!("shutdown: {e:#}");
            }
        }
        self.window = None;
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        error!("{e:#}");
        self.failure = Some(e);
        self.exit(event_loop);
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
                return;
            }
            self.fps.reset(Instant::now());
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exit(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                self.render_size = RenderSize::new(new_size.width, new_size.height);
                info!(
                    "Resized -> {}x{}",
                    self.render_size.width, self.render_size.height
                );
                if let Some(r) = &mut self.renderer {
                    if let Err(e) = r.resize(self.render_size) {
                        self.fail(event_loop, e);
                        return;
                    }
                }
                if self.render_size.is_empty() {
                    self.fps.reset(Instant::now());
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting {
                    return;
                }
                let (Some(r), Some(window)) = (&mut self.renderer, &self.window) else {
                    return;
                };
                match r.render_frame_sized(&|| framebuffer_size(window)) {
                    Ok(Some(FrameOutcome::Presented { .. } | FrameOutcome::PresentOutOfDate)) => {
                        // count only frames that were actually submitted
                        self.frames_rendered += 1;
                        self.fps.frame();
                    }
                    Ok(Some(FrameOutcome::AcquireOutOfDate)) | Ok(None) => {}
                    Err(e) => {
                        self.fail(event_loop, e);
                        return;
                    }
                }
                if self.frame_limit.is_some_and(|n| self.frames_rendered >= n) {
                    info!("rendered {} frame(s), exiting", self.frames_rendered);
                    self.exit(event_loop);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        let paused = self.renderer.as_ref().is_some_and(|r| r.is_paused());
        if paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        if let Some(fps) = self.fps.tick(Instant::now()) {
            info!("fps ~ {fps}");
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let (mut cfg, cfg_problem) = load_cfg(&args.config);
    init_tracing(&cfg.log.filter);
    if let Some(msg) = cfg_problem {
        warn!("config: {msg}");
    }
    if let Some(v) = args.validation {
        cfg.vulkan.validation = v;
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        cfg,
        frame_limit: args.frames,
        renderer: None,
        window: None,
        render_size: RenderSize::new(1, 1),
        frames_rendered: 0,
        fps: FpsCounter::new(Instant::now()),
        exiting: false,
        failure: None,
    };

    event_loop.run_app(&mut app)?;
    match app.failure.take() {
        Some(e) => Err(e.context("ember exited with an error")),
        None => Ok(()),
    }
}
