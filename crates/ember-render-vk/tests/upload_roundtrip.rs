// SPDX-License-Identifier: CEPL-1.0
//! Staged uploads against a real device. Skips when no Vulkan loader or
//! graphics-capable device is present.

use ash::vk;
use ember_math::glam::Vec2;
use ember_math::{quad, Vertex};
use ember_render_vk::buffer::{self, StaticGeometry};
use ember_render_vk::instance;
use ember_render_vk::{DeviceContext, QueueFamilyIndices, VkError};

fn with_headless_device(test: impl FnOnce(&DeviceContext)) {
    let entry = match instance::load_entry() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("skipping: {e}");
            return;
        }
    };
    let (instance, _) = match instance::create_instance(&entry, None, false) {
        Ok(i) => i,
        Err(e) => {
            eprintln!("skipping: {e}");
            return;
        }
    };

    let found = unsafe { instance.enumerate_physical_devices() }
        .unwrap_or_default()
        .into_iter()
        .find_map(|phys| {
            let families = unsafe { instance.get_physical_device_queue_family_properties(phys) };
            families
                .iter()
                .position(|q| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|i| (phys, i as u32))
        });
    let Some((phys, family)) = found else {
        eprintln!("skipping: no graphics-capable device");
        unsafe { instance.destroy_instance(None) };
        return;
    };

    let indices = QueueFamilyIndices {
        graphics: Some(family),
        present: Some(family),
        ..Default::default()
    };
    let mut ctx = DeviceContext::new(&instance, phys, indices, &[], false).unwrap();
    test(&ctx);
    unsafe {
        ctx.destroy();
        instance.destroy_instance(None);
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

#[test]
fn read_back_matches_uploaded_bytes() {
    with_headless_device(|ctx| {
        for len in [1usize, 4096, 3001] {
            let data = pattern(len);
            let mut buf = buffer::upload(
                ctx,
                &data,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
            )
            .unwrap();
            assert_eq!(buf.size, len as u64);
            assert!(buf.properties.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));
            assert_eq!(buffer::read_back(ctx, &buf).unwrap(), data, "length {len}");
            unsafe { buf.destroy(&ctx.device) };
        }
    });
}

#[test]
fn empty_upload_is_rejected() {
    with_headless_device(|ctx| {
        let err = buffer::upload(ctx, &[], vk::BufferUsageFlags::VERTEX_BUFFER).unwrap_err();
        assert!(matches!(err, VkError::EmptyUpload));
    });
}

#[test]
fn read_back_needs_transfer_src() {
    with_headless_device(|ctx| {
        let mut buf =
            buffer::upload(ctx, &pattern(16), vk::BufferUsageFlags::INDEX_BUFFER).unwrap();
        assert!(matches!(
            buffer::read_back(ctx, &buf),
            Err(VkError::ReadbackUnsupported)
        ));
        unsafe { buf.destroy(&ctx.device) };
    });
}

#[test]
fn static_geometry_counts_indices() {
    with_headless_device(|ctx| {
        let vertices = quad(Vec2::ZERO, Vec2::ONE);
        let mut geo = StaticGeometry::upload(ctx, &vertices, &[0, 1, 2]).unwrap();
        assert_eq!(geo.index_count, 3);
        assert_eq!(geo.vertices.size, 4 * Vertex::STRIDE as u64);
        assert_eq!(geo.indices.size, 6);
        unsafe { geo.destroy(&ctx.device) };
    });
}
