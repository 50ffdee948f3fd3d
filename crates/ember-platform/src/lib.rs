// SPDX-License-Identifier: CEPL-1.0
//! Window glue. The renderer only sees raw handles and [`RenderSize`].

use ember_render::RenderSize;

pub use winit;
use winit::window::Window;

/// Current framebuffer size in physical pixels.
pub fn framebuffer_size(window: &Window) -> RenderSize {
    let size = window.inner_size();
    RenderSize::new(size.width, size.height)
}

pub fn default_window_attributes(title: &str, size: RenderSize) -> winit::window::WindowAttributes {
    Window::default_attributes()
        .with_title(title)
        .with_inner_size(winit::dpi::PhysicalSize::new(size.width, size.height))
}
