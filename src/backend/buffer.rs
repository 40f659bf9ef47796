// Buffer utilities for vertex and index data
//
// Host-visible buffers allocated through gpu-allocator. Static geometry
// is small enough that a staging copy buys nothing here.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::mem::{offset_of, size_of};

use super::command::DrawBindings;
use super::DeviceContext;

/// Position + colour, matches shaders/triangle.vert
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(position: Vec2, color: Vec3) -> Self {
        Self { position, color }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Self, position) as u32),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Self, color) as u32),
        ]
    }
}

/// A buffer and the allocation backing it
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
}

impl GpuBuffer {
    /// Create a host-visible buffer and fill it with `data`
    pub fn with_data<T: Pod>(
        device: &DeviceContext,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let size = bytes.len() as vk::DeviceSize;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .context("Failed to create buffer")?
        };
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::CpuToGpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let mut allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e).context("Failed to allocate buffer memory");
            }
        };

        let mut this = Self {
            buffer,
            size,
            allocation: None,
        };

        let filled = (|| -> Result<()> {
            unsafe {
                device
                    .device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                    .context("Failed to bind buffer memory")?;
            }
            let mapped = allocation
                .mapped_slice_mut()
                .context("Buffer memory is not host visible")?;
            mapped[..bytes.len()].copy_from_slice(bytes);
            Ok(())
        })();

        this.allocation = Some(allocation);
        if let Err(e) = filled {
            this.destroy(device);
            return Err(e);
        }
        Ok(this)
    }

    pub fn destroy(&mut self, device: &DeviceContext) {
        unsafe { device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator().lock().free(allocation) {
                log::warn!("Failed to free buffer allocation: {}", e);
            }
        }
        self.buffer = vk::Buffer::null();
    }
}

/// Ready-to-bind vertex/index data for the command recorder.
pub trait ResourceProvider {
    fn bindings(&self) -> DrawBindings;

    /// Layouts of the descriptor sets in `bindings`, in set order. The
    /// pipeline layout is built from these.
    fn set_layouts(&self) -> Vec<vk::DescriptorSetLayout> {
        Vec::new()
    }

    fn destroy(&mut self, device: &DeviceContext);
}

/// Indexed geometry in two buffers
pub struct MeshBuffers {
    vertices: GpuBuffer,
    indices: GpuBuffer,
    index_count: u32,
}

impl MeshBuffers {
    pub fn new(device: &DeviceContext, vertices: &[Vertex], indices: &[u16]) -> Result<Self> {
        let mut vertex_buffer = GpuBuffer::with_data(
            device,
            "mesh vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vertices,
        )?;
        let index_buffer = match GpuBuffer::with_data(
            device,
            "mesh indices",
            vk::BufferUsageFlags::INDEX_BUFFER,
            indices,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                vertex_buffer.destroy(device);
                return Err(e);
            }
        };

        Ok(Self {
            vertices: vertex_buffer,
            indices: index_buffer,
            index_count: indices.len() as u32,
        })
    }

    /// A vertex-coloured quad covering the middle of the screen
    pub fn quad(device: &DeviceContext) -> Result<Self> {
        const VERTICES: [Vertex; 4] = [
            Vertex::new(Vec2::new(-0.5, -0.5), Vec3::new(1.0, 0.0, 0.0)),
            Vertex::new(Vec2::new(0.5, -0.5), Vec3::new(0.0, 1.0, 0.0)),
            Vertex::new(Vec2::new(0.5, 0.5), Vec3::new(0.0, 0.0, 1.0)),
            Vertex::new(Vec2::new(-0.5, 0.5), Vec3::new(1.0, 1.0, 1.0)),
        ];
        const INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

        Self::new(device, &VERTICES, &INDICES)
    }
}

impl ResourceProvider for MeshBuffers {
    fn bindings(&self) -> DrawBindings {
        DrawBindings {
            vertex_buffers: vec![self.vertices.buffer],
            index_buffer: Some((self.indices.buffer, vk::IndexType::UINT16)),
            descriptor_sets: Vec::new(),
            element_count: self.index_count,
        }
    }

    fn destroy(&mut self, device: &DeviceContext) {
        self.indices.destroy(device);
        self.vertices.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(size_of::<Vertex>(), 20);
        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 20);

        let [position, color] = Vertex::attribute_descriptions();
        assert_eq!((position.location, position.offset), (0, 0));
        assert_eq!((color.location, color.offset), (1, 8));
    }

    #[test]
    fn vertices_cast_to_tightly_packed_floats() {
        let vertices = [Vertex::new(Vec2::new(1.0, 2.0), Vec3::new(3.0, 4.0, 5.0))];
        let floats: &[f32] = bytemuck::cast_slice(&vertices);
        assert_eq!(floats, &[1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
