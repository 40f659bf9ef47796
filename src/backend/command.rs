// Command recording
//
// One primary command buffer per swapchain image, recorded once and
// resubmitted every frame until the next recreation replaces the whole set.

use ash::vk;
use std::sync::Arc;

use super::pipeline::PipelineSet;
use super::swapchain::SwapchainState;
use super::DeviceContext;
use crate::error::{EngineError, Result};

/// Handles supplied by the resource provider
#[derive(Debug, Clone, Default)]
pub struct DrawBindings {
    pub vertex_buffers: Vec<vk::Buffer>,
    pub index_buffer: Option<(vk::Buffer, vk::IndexType)>,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    /// Index count when indexed, vertex count otherwise
    pub element_count: u32,
}

impl DrawBindings {
    /// Descriptor sets bind from set 0, so there can be no more of them than
    /// the pipeline layout declares.
    pub fn fits_layout(&self, set_layout_count: usize) -> bool {
        self.descriptor_sets.len() <= set_layout_count
    }
}

/// Command buffers for one swapchain epoch, indexed by image
#[derive(Debug)]
pub struct CommandBufferSet {
    pub buffers: Vec<vk::CommandBuffer>,
    /// Framebuffer each buffer renders into, same index
    pub framebuffers: Vec<vk::Framebuffer>,
    pub epoch: u64,
}

impl CommandBufferSet {
    pub fn get(&self, image_index: u32) -> Option<vk::CommandBuffer> {
        self.buffers.get(image_index as usize).copied()
    }

    /// True when every buffer targets a framebuffer of `state`, index for index
    pub fn is_recorded_against(&self, state: &SwapchainState) -> bool {
        self.epoch == state.epoch
            && self.buffers.len() == state.framebuffers.len()
            && self.framebuffers == state.framebuffers
    }
}

pub struct CommandRecorder {
    pool: vk::CommandPool,
    clear_color: [f32; 4],
    device: Arc<DeviceContext>,
}

impl CommandRecorder {
    pub fn new(device: Arc<DeviceContext>, clear_color: [f32; 4]) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.queue_families.graphics);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .map_err(EngineError::creation("command pool"))?;

        Ok(Self {
            pool,
            clear_color,
            device,
        })
    }

    /// Allocate and record one buffer per framebuffer of `state`.
    pub fn record(
        &self,
        state: &SwapchainState,
        pipeline: &PipelineSet,
        draw: &DrawBindings,
    ) -> Result<CommandBufferSet> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(state.framebuffers.len() as u32);

        let buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .map_err(EngineError::recording("allocation"))?;

        let set = CommandBufferSet {
            buffers,
            framebuffers: state.framebuffers.clone(),
            epoch: state.epoch,
        };

        let recorded = set
            .buffers
            .iter()
            .zip(&state.framebuffers)
            .try_for_each(|(&cmd, &framebuffer)| {
                self.record_one(cmd, framebuffer, state.extent, pipeline, draw)
            });
        if let Err(e) = recorded {
            self.free(set);
            return Err(e);
        }

        log::info!(
            "Recorded {} command buffers (epoch {})",
            set.buffers.len(),
            set.epoch
        );
        Ok(set)
    }

    fn record_one(
        &self,
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        pipeline: &PipelineSet,
        draw: &DrawBindings,
    ) -> Result<()> {
        let device = &self.device.device;

        // Resubmitted while a previous submission may still be pending
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(pipeline.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(EngineError::recording("begin"))?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            if !draw.vertex_buffers.is_empty() {
                let offsets = vec![0; draw.vertex_buffers.len()];
                device.cmd_bind_vertex_buffers(cmd, 0, &draw.vertex_buffers, &offsets);
            }
            if !draw.descriptor_sets.is_empty() {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    0,
                    &draw.descriptor_sets,
                    &[],
                );
            }
            match draw.index_buffer {
                Some((buffer, index_type)) => {
                    device.cmd_bind_index_buffer(cmd, buffer, 0, index_type);
                    device.cmd_draw_indexed(cmd, draw.element_count, 1, 0, 0, 0);
                }
                None => device.cmd_draw(cmd, draw.element_count, 1, 0, 0),
            }

            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .map_err(EngineError::recording("end"))?;
        }

        Ok(())
    }

    /// Return a set's buffers to the pool. Nothing may still be executing them.
    pub fn free(&self, set: CommandBufferSet) {
        if !set.buffers.is_empty() {
            unsafe {
                self.device
                    .device
                    .free_command_buffers(self.pool, &set.buffers)
            };
        }
    }

    pub fn destroy(&mut self) {
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
        self.pool = vk::CommandPool::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn state(epoch: u64, framebuffers: &[u64]) -> SwapchainState {
        SwapchainState {
            swapchain: vk::SwapchainKHR::from_raw(1),
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            images: framebuffers.iter().map(|&h| vk::Image::from_raw(h)).collect(),
            image_views: framebuffers.iter().map(|&h| vk::ImageView::from_raw(h)).collect(),
            framebuffers: framebuffers.iter().map(|&h| vk::Framebuffer::from_raw(h)).collect(),
            epoch,
        }
    }

    fn set_for(state: &SwapchainState) -> CommandBufferSet {
        CommandBufferSet {
            buffers: (0..state.framebuffers.len() as u64)
                .map(|i| vk::CommandBuffer::from_raw(100 + i))
                .collect(),
            framebuffers: state.framebuffers.clone(),
            epoch: state.epoch,
        }
    }

    #[test]
    fn set_matches_the_state_it_was_recorded_for() {
        let current = state(3, &[10, 11, 12]);
        let set = set_for(&current);
        assert!(set.is_recorded_against(&current));
        assert_eq!(set.get(2), Some(vk::CommandBuffer::from_raw(102)));
        assert_eq!(set.get(3), None);
    }

    #[test]
    fn set_from_previous_epoch_is_rejected() {
        let old = state(3, &[10, 11, 12]);
        let stale = set_for(&old);

        // Same handles reused by the driver, newer generation
        let reused = state(4, &[10, 11, 12]);
        assert!(!stale.is_recorded_against(&reused));

        let mut forged = set_for(&state(5, &[20, 21, 22]));
        forged.framebuffers[1] = vk::Framebuffer::from_raw(11);
        assert!(!forged.is_recorded_against(&state(5, &[20, 21, 22])));
    }

    #[test]
    fn descriptor_sets_must_fit_the_layout() {
        let mut draw = DrawBindings {
            element_count: 6,
            ..Default::default()
        };
        assert!(draw.fits_layout(0));

        draw.descriptor_sets = vec![
            vk::DescriptorSet::from_raw(40),
            vk::DescriptorSet::from_raw(41),
        ];
        assert!(!draw.fits_layout(0));
        assert!(!draw.fits_layout(1));
        assert!(draw.fits_layout(2));
        assert!(draw.fits_layout(3));
    }

    #[test]
    fn image_count_change_is_detected() {
        let triple = state(7, &[1, 2, 3]);
        let mut set = set_for(&triple);
        set.buffers.pop();
        assert!(!set.is_recorded_against(&triple));
    }
}
