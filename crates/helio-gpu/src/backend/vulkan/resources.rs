//! Buffer and texture creation plus memory binding.

use ash::vk;

use crate::bundle::MemFlags;
use crate::device::{BufferDesc, Format, TextureDesc};
use crate::error::DeviceError;

use super::instance::VulkanCore;

pub enum VulkanPayload {
    Buffer {
        buffer: vk::Buffer,
    },
    Texture {
        image: vk::Image,
        extent: vk::Extent3D,
        subresource_range: vk::ImageSubresourceRange,
    },
}

pub struct VulkanResource {
    pub payload: VulkanPayload,
    pub memory: vk::DeviceMemory,
    /// Persistent mapping for host-visible resources.
    pub mapped: Option<*mut u8>,
    pub byte_size: u64,
}

impl VulkanResource {
    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            match self.payload {
                VulkanPayload::Buffer { buffer } => device.destroy_buffer(buffer, None),
                VulkanPayload::Texture { image, .. } => device.destroy_image(image, None),
            }
            device.free_memory(self.memory, None);
        }
    }
}

pub fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::R32Sint => vk::Format::R32_SINT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Rg32Uint => vk::Format::R32G32_UINT,
        Format::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
        Format::Rgba32Sint => vk::Format::R32G32B32A32_SINT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
    }
}

fn memory_flags_for(mem_flags: MemFlags) -> (vk::MemoryPropertyFlags, bool) {
    let host_visible =
        mem_flags.contains(MemFlags::CPU_READ) || mem_flags.contains(MemFlags::CPU_UPLOAD);
    let flags = if host_visible {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    } else {
        vk::MemoryPropertyFlags::DEVICE_LOCAL
    };
    (flags, host_visible)
}

fn allocate_bound_memory(
    core: &VulkanCore,
    requirements: vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory, DeviceError> {
    let type_index = core
        .find_memory_type(requirements.memory_type_bits, flags)
        // Integrated adapters may not advertise DEVICE_LOCAL-only types.
        .or_else(|| core.find_memory_type(requirements.memory_type_bits, vk::MemoryPropertyFlags::empty()))
        .ok_or_else(|| {
            DeviceError::InvalidDescriptor("no compatible memory type for resource".into())
        })?;
    let info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(type_index);
    Ok(unsafe { core.device.allocate_memory(&info, None)? })
}

pub fn create_buffer(core: &VulkanCore, desc: &BufferDesc) -> Result<VulkanResource, DeviceError> {
    if desc.element_count == 0 {
        return Err(DeviceError::InvalidDescriptor(
            "buffer element count must be non-zero".into(),
        ));
    }
    let size = desc.byte_size().max(4);

    let mut usage = vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::INDIRECT_BUFFER;
    if desc.constant_buffer {
        usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }

    let info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { core.device.create_buffer(&info, None)? };
    let requirements = unsafe { core.device.get_buffer_memory_requirements(buffer) };

    let (flags, host_visible) = memory_flags_for(desc.mem_flags);
    let memory = match allocate_bound_memory(core, requirements, flags) {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { core.device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };
    if let Err(e) = unsafe { core.device.bind_buffer_memory(buffer, memory, 0) } {
        unsafe {
            core.device.destroy_buffer(buffer, None);
            core.device.free_memory(memory, None);
        }
        return Err(e.into());
    }

    let mapped = if host_visible {
        match unsafe {
            core.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        } {
            Ok(ptr) => Some(ptr as *mut u8),
            Err(e) => {
                unsafe {
                    core.device.destroy_buffer(buffer, None);
                    core.device.free_memory(memory, None);
                }
                return Err(e.into());
            }
        }
    } else {
        None
    };

    Ok(VulkanResource {
        payload: VulkanPayload::Buffer { buffer },
        memory,
        mapped,
        byte_size: size,
    })
}

pub fn create_texture(
    core: &VulkanCore,
    desc: &TextureDesc,
) -> Result<VulkanResource, DeviceError> {
    if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
        return Err(DeviceError::InvalidDescriptor(
            "texture dimensions must be non-zero".into(),
        ));
    }
    let extent = vk::Extent3D {
        width: desc.width,
        height: desc.height,
        depth: desc.depth,
    };
    let image_type = if desc.depth > 1 { vk::ImageType::TYPE_3D } else { vk::ImageType::TYPE_2D };
    let info = vk::ImageCreateInfo::default()
        .image_type(image_type)
        .format(vk_format(desc.format))
        .extent(extent)
        .mip_levels(desc.mip_levels.max(1))
        .array_layers(desc.array_slices.max(1))
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(
            vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        )
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image = unsafe { core.device.create_image(&info, None)? };
    let requirements = unsafe { core.device.get_image_memory_requirements(image) };

    // Textures stay device-local; CPU readback goes through buffer staging.
    let memory =
        match allocate_bound_memory(core, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { core.device.destroy_image(image, None) };
                return Err(e);
            }
        };
    if let Err(e) = unsafe { core.device.bind_image_memory(image, memory, 0) } {
        unsafe {
            core.device.destroy_image(image, None);
            core.device.free_memory(memory, None);
        }
        return Err(e.into());
    }

    let subresource_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: desc.mip_levels.max(1),
        base_array_layer: 0,
        layer_count: desc.array_slices.max(1),
    };

    Ok(VulkanResource {
        payload: VulkanPayload::Texture { image, extent, subresource_range },
        memory,
        mapped: None,
        byte_size: requirements.size,
    })
}
