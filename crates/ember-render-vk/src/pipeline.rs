// SPDX-License-Identifier: CEPL-1.0
//! Shader blobs, the single render pass and the fixed graphics pipeline.

use ash::util::read_spv;
use ash::{vk, Device};
use ember_math::Vertex;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

use crate::error::{VkError, VkResult, VkResultExt};

pub const VERTEX_SHADER_FILE: &str = "triangle.vert.spv";
pub const FRAGMENT_SHADER_FILE: &str = "triangle.frag.spv";
const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decoded SPIR-V for the two stages.
#[derive(Clone, Debug)]
pub struct ShaderBlobs {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderBlobs {
    /// The blobs compiled into the binary by the build script.
    pub fn builtin() -> VkResult<Self> {
        let vs = include_bytes!(concat!(env!("OUT_DIR"), "/triangle.vert.spv"));
        let fs = include_bytes!(concat!(env!("OUT_DIR"), "/triangle.frag.spv"));
        Self::from_bytes(vs, fs)
    }

    /// Reads `triangle.vert.spv` and `triangle.frag.spv` from `dir`.
    pub fn load_dir(dir: &Path) -> VkResult<Self> {
        let read = |stage: &'static str, name: &str| {
            let path = dir.join(name);
            std::fs::read(&path).map_err(|e| VkError::ShaderLoad {
                stage,
                reason: format!("{}: {e}", path.display()),
            })
        };
        let vs = read("vertex", VERTEX_SHADER_FILE)?;
        let fs = read("fragment", FRAGMENT_SHADER_FILE)?;
        Self::from_bytes(&vs, &fs)
    }

    pub fn from_bytes(vertex: &[u8], fragment: &[u8]) -> VkResult<Self> {
        Ok(Self {
            vertex: decode_spirv("vertex", vertex)?,
            fragment: decode_spirv("fragment", fragment)?,
        })
    }
}

/// Validates and converts a raw blob into SPIR-V words.
pub fn decode_spirv(stage: &'static str, bytes: &[u8]) -> VkResult<Vec<u32>> {
    let fail = |reason: String| VkError::ShaderLoad { stage, reason };
    if bytes.is_empty() {
        return Err(fail("blob is empty".into()));
    }
    if bytes.len() % 4 != 0 {
        return Err(fail(format!("length {} is not a multiple of 4", bytes.len())));
    }
    let words = read_spv(&mut Cursor::new(bytes)).map_err(|e| fail(e.to_string()))?;
    // read_spv also accepts byte-swapped input and normalizes it.
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(fail("missing SPIR-V magic number".into()));
    }
    Ok(words)
}

unsafe fn create_render_pass(
    device: &Device,
    color_format: vk::Format,
) -> VkResult<vk::RenderPass> {
    // Single color attachment -> present
    let color_att = vk::AttachmentDescription {
        format: color_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let att_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &att_ref,
        ..Default::default()
    };
    // The layout transition must wait for the acquire semaphore, which is
    // waited on at COLOR_ATTACHMENT_OUTPUT.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_att,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    unsafe { device.create_render_pass(&rp_info, None) }.op("create_render_pass")
}

unsafe fn create_shader_module(device: &Device, code: &[u32]) -> VkResult<vk::ShaderModule> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    unsafe { device.create_shader_module(&ci, None) }.op("create_shader_module")
}

fn vertex_attributes() -> [vk::VertexInputAttributeDescription; 2] {
    [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32_SFLOAT,
            offset: Vertex::POS_OFFSET,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: Vertex::COLOR_OFFSET,
        },
    ]
}

/// Creates the pipeline against `render_pass`. Shader modules never outlive the call.
unsafe fn create_pipeline(
    device: &Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    shaders: &ShaderBlobs,
) -> VkResult<vk::Pipeline> {
    let vs = unsafe { create_shader_module(device, &shaders.vertex)? };
    let fs = match unsafe { create_shader_module(device, &shaders.fragment) } {
        Ok(fs) => fs,
        Err(e) => {
            unsafe { device.destroy_shader_module(vs, None) };
            return Err(e);
        }
    };
    let entry = c"main";

    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
    ];

    // binding 0: Vertex { pos, color }
    let vb = vk::VertexInputBindingDescription {
        binding: 0,
        stride: Vertex::STRIDE,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let va = vertex_attributes();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    // Quad winding is clockwise in Vulkan's y-down framebuffer space.
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::BACK,
        front_face: vk::FrontFace::CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::R
            | vk::ColorComponentFlags::G
            | vk::ColorComponentFlags::B
            | vk::ColorComponentFlags::A,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    let result = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
    };
    unsafe {
        device.destroy_shader_module(vs, None);
        device.destroy_shader_module(fs, None);
    }
    match result {
        Ok(pipelines) => Ok(pipelines[0]),
        Err((_, err)) => Err(VkError::PipelineCreation(err)),
    }
}

/// Render pass, layout and pipeline for one color format. Rebuilt when the
/// swapchain format changes.
pub struct GraphicsPipeline {
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    color_format: vk::Format,
    shaders: ShaderBlobs,
}

impl GraphicsPipeline {
    pub fn new(device: &Device, color_format: vk::Format, shaders: ShaderBlobs) -> VkResult<Self> {
        let mut this = Self {
            render_pass: vk::RenderPass::null(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            color_format,
            shaders,
        };
        if let Err(e) = unsafe { this.create_objects(device) } {
            unsafe { this.destroy(device) };
            return Err(e);
        }
        Ok(this)
    }

    unsafe fn create_objects(&mut self, device: &Device) -> VkResult<()> {
        unsafe {
            self.render_pass = create_render_pass(device, self.color_format)?;
            // No descriptors or push constants.
            let layout_info = vk::PipelineLayoutCreateInfo {
                s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
                ..Default::default()
            };
            self.layout = device
                .create_pipeline_layout(&layout_info, None)
                .op("create_pipeline_layout")?;
            self.pipeline = create_pipeline(device, self.render_pass, self.layout, &self.shaders)?;
        }
        debug!("vk: pipeline built for {:?}", self.color_format);
        Ok(())
    }

    /// Replaces every object with ones targeting `color_format`. The device must be idle.
    pub fn rebuild(&mut self, device: &Device, color_format: vk::Format) -> VkResult<()> {
        unsafe { self.destroy(device) };
        self.color_format = color_format;
        if let Err(e) = unsafe { self.create_objects(device) } {
            unsafe { self.destroy(device) };
            return Err(e);
        }
        Ok(())
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }

    /// # Safety
    /// The GPU must no longer use the pipeline or render pass.
    pub unsafe fn destroy(&mut self, device: &Device) {
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.layout, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
            }
        }
        self.pipeline = vk::Pipeline::null();
        self.layout = vk::PipelineLayout::null();
        self.render_pass = vk::RenderPass::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn builtin_blobs_decode() {
        let blobs = ShaderBlobs::builtin().unwrap();
        assert_eq!(blobs.vertex[0], SPIRV_MAGIC);
        assert_eq!(blobs.fragment[0], SPIRV_MAGIC);
    }

    #[test]
    fn rejects_empty_misaligned_and_foreign_blobs() {
        let reason = |r: VkResult<Vec<u32>>| match r {
            Err(VkError::ShaderLoad { reason, .. }) => reason,
            other => panic!("expected ShaderLoad, got {other:?}"),
        };
        assert!(reason(decode_spirv("vertex", &[])).contains("empty"));
        assert!(reason(decode_spirv("vertex", &[3, 2, 35, 7, 0])).contains("multiple of 4"));
        reason(decode_spirv("fragment", &words_to_bytes(&[0xdead_beef, 0])));
    }

    #[test]
    fn accepts_byte_swapped_magic() {
        let swapped: Vec<u8> = [SPIRV_MAGIC, 0x0001_0000]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        let words = decode_spirv("vertex", &swapped).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn missing_dir_names_the_stage() {
        let err = ShaderBlobs::load_dir(Path::new("/nonexistent/ember-shaders")).unwrap_err();
        assert!(matches!(err, VkError::ShaderLoad { stage: "vertex", .. }));
    }

    #[test]
    fn vertex_attributes_follow_vertex_layout() {
        let [pos, color] = vertex_attributes();
        assert_eq!(pos.format, vk::Format::R32G32_SFLOAT);
        assert_eq!(pos.offset, 0);
        assert_eq!(color.format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(color.offset, Vertex::COLOR_OFFSET);
    }
}
