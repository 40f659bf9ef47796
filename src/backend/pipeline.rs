// Graphics pipeline creation and management
//
// The render pass depends on the swapchain image format, nothing else does:
// viewport and scissor are dynamic state, so a resize never forces a
// pipeline rebuild. Only a format change does.
//
// A build never touches the set currently in use. The caller decides,
// once the whole new generation exists, which of the two sets to destroy.

use anyhow::{Context, Result};
use ash::vk;
use std::path::PathBuf;

use super::buffer::Vertex;
use super::shader::load_shader_module;
use super::DeviceContext;

/// Render pass + pipeline for one image format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSet {
    pub format: vk::Format,
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl PipelineSet {
    pub fn destroy(&self, device: &DeviceContext) {
        unsafe {
            device.device.destroy_pipeline(self.pipeline, None);
            device.device.destroy_pipeline_layout(self.layout, None);
            device.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Builds pipeline sets compatible with a swapchain format.
pub trait PipelineProvider {
    /// Build a fresh set. `set_layouts` are the descriptor set layouts of
    /// the resources that will be bound, in set order.
    fn build(
        &mut self,
        device: &DeviceContext,
        format: vk::Format,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<PipelineSet>;
}

/// The pipeline side of one recreation: either the current set is reused,
/// or a fresh one is pending next to it until the generation is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineSwap {
    Reuse(PipelineSet),
    Fresh {
        fresh: PipelineSet,
        previous: Option<PipelineSet>,
    },
}

impl PipelineSwap {
    /// Reuse `current` when it already targets `format`, otherwise build.
    pub fn prepare(
        current: Option<PipelineSet>,
        format: vk::Format,
        build: impl FnOnce(vk::Format) -> Result<PipelineSet>,
    ) -> Result<Self> {
        match current {
            Some(set) if set.format == format => Ok(Self::Reuse(set)),
            previous => {
                if let Some(previous) = previous {
                    log::info!(
                        "Surface format changed {:?} -> {:?}, rebuilding pipeline",
                        previous.format,
                        format
                    );
                }
                Ok(Self::Fresh {
                    fresh: build(format)?,
                    previous,
                })
            }
        }
    }

    /// Set the new generation records against
    pub fn active(&self) -> PipelineSet {
        match *self {
            Self::Reuse(set) => set,
            Self::Fresh { fresh, .. } => fresh,
        }
    }

    /// The generation failed: the set to destroy, if one was built
    pub fn abandon(self) -> Option<PipelineSet> {
        match self {
            Self::Reuse(_) => None,
            Self::Fresh { fresh, .. } => Some(fresh),
        }
    }

    /// The generation is in place: the set to keep and the one it retires
    pub fn commit(self) -> (PipelineSet, Option<PipelineSet>) {
        match self {
            Self::Reuse(set) => (set, None),
            Self::Fresh { fresh, previous } => (fresh, previous),
        }
    }
}

/// Vertex-coloured geometry with a single colour attachment
pub struct ColorPipeline {
    vertex_shader: PathBuf,
    fragment_shader: PathBuf,
}

impl ColorPipeline {
    pub fn new(vertex_shader: impl Into<PathBuf>, fragment_shader: impl Into<PathBuf>) -> Self {
        Self {
            vertex_shader: vertex_shader.into(),
            fragment_shader: fragment_shader.into(),
        }
    }
}

impl PipelineProvider for ColorPipeline {
    fn build(
        &mut self,
        device: &DeviceContext,
        format: vk::Format,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<PipelineSet> {
        let render_pass = create_render_pass(device, format)?;

        let built = (|| -> Result<(vk::Pipeline, vk::PipelineLayout)> {
            let vert = load_shader_module(device, &self.vertex_shader)?;
            let frag = match load_shader_module(device, &self.fragment_shader) {
                Ok(frag) => frag,
                Err(e) => {
                    unsafe { device.device.destroy_shader_module(vert, None) };
                    return Err(e);
                }
            };

            let pipeline = create_graphics_pipeline(device, render_pass, vert, frag, set_layouts);

            // Modules are only needed while the pipeline is being built
            unsafe {
                device.device.destroy_shader_module(vert, None);
                device.device.destroy_shader_module(frag, None);
            }
            pipeline
        })();

        match built {
            Ok((pipeline, layout)) => Ok(PipelineSet {
                format,
                render_pass,
                layout,
                pipeline,
            }),
            Err(e) => {
                unsafe { device.device.destroy_render_pass(render_pass, None) };
                Err(e)
            }
        }
    }
}

/// Create a render pass with one colour attachment (the swapchain image)
pub fn create_render_pass(device: &DeviceContext, format: vk::Format) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let color_attachment_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments);

    // The image may still be read by the presentation engine when the
    // imageAvailable wait completes at this stage
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

    let attachments = [color_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe {
        device
            .device
            .create_render_pass(&render_pass_info, None)
            .context("Failed to create render pass")
    }
}

/// Create the graphics pipeline with dynamic viewport and scissor
pub fn create_graphics_pipeline(
    device: &DeviceContext,
    render_pass: vk::RenderPass,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
    set_layouts: &[vk::DescriptorSetLayout],
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_shader)
            .name(c"main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_shader)
            .name(c"main"),
    ];

    let bindings = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Counts only, the values are recorded per command buffer
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
    let pipeline_layout = unsafe {
        device
            .device
            .create_pipeline_layout(&layout_info, None)
            .context("Failed to create pipeline layout")?
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(pipeline_layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };

    match pipelines {
        Ok(pipelines) => Ok((pipelines[0], pipeline_layout)),
        Err((_, e)) => {
            unsafe { device.device.destroy_pipeline_layout(pipeline_layout, None) };
            Err(anyhow::Error::new(e).context("Failed to create graphics pipeline"))
        }
    }
}
