//! Compute shader registration: SPIR-V module, fixed three-set layout and
//! pipeline, created once at registration time.
//!
//! Binding convention (mirrors the HLSL register spaces the producer side
//! compiles against): set 0 holds read-only storage buffers (`t` registers),
//! set 1 read-write storage buffers (`u` registers), set 2 uniform buffers
//! (`b` registers). All three sets always exist in the pipeline layout;
//! unused ones are empty.

use std::ffi::CString;

use ash::vk;

use crate::device::{ShaderDesc, ShaderLayout};
use crate::error::DeviceError;

const SPIRV_MAGIC: u32 = 0x0723_0203;

pub const SRV_SET: usize = 0;
pub const UAV_SET: usize = 1;
pub const CBV_SET: usize = 2;
pub const SET_COUNT: usize = 3;

pub struct VulkanShader {
    pub name: String,
    pub layout: ShaderLayout,
    pub module: vk::ShaderModule,
    pub set_layouts: [vk::DescriptorSetLayout; SET_COUNT],
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl VulkanShader {
    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            for layout in self.set_layouts {
                device.destroy_descriptor_set_layout(layout, None);
            }
            device.destroy_shader_module(self.module, None);
        }
    }
}

fn set_layout(
    device: &ash::Device,
    binding_count: u32,
    descriptor_type: vk::DescriptorType,
) -> Result<vk::DescriptorSetLayout, DeviceError> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..binding_count)
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
        })
        .collect();
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    Ok(unsafe { device.create_descriptor_set_layout(&info, None)? })
}

pub fn create_shader(
    device: &ash::Device,
    desc: &ShaderDesc<'_>,
) -> Result<VulkanShader, DeviceError> {
    if desc.bytecode.len() < 4 || desc.bytecode.len() % 4 != 0 {
        return Err(DeviceError::InvalidShader(format!(
            "shader '{}': SPIR-V length {} is not a multiple of four",
            desc.name,
            desc.bytecode.len()
        )));
    }
    let words: Vec<u32> = bytemuck::pod_collect_to_vec(desc.bytecode);
    if words[0] != SPIRV_MAGIC {
        return Err(DeviceError::InvalidShader(format!(
            "shader '{}': bad SPIR-V magic 0x{:08X}",
            desc.name, words[0]
        )));
    }
    let entry = CString::new(desc.entry_point).map_err(|_| {
        DeviceError::InvalidShader(format!(
            "shader '{}': entry point contains a NUL byte",
            desc.name
        ))
    })?;

    let module_info = vk::ShaderModuleCreateInfo::default().code(&words);
    let module = unsafe { device.create_shader_module(&module_info, None)? };

    let mut set_layouts = [vk::DescriptorSetLayout::null(); SET_COUNT];
    let destroy_partial = |device: &ash::Device, layouts: &[vk::DescriptorSetLayout]| unsafe {
        for &l in layouts {
            if l != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(l, None);
            }
        }
        device.destroy_shader_module(module, None);
    };

    let plan = [
        (SRV_SET, desc.layout.srv_count, vk::DescriptorType::STORAGE_BUFFER),
        (UAV_SET, desc.layout.uav_count, vk::DescriptorType::STORAGE_BUFFER),
        (CBV_SET, desc.layout.cbv_count, vk::DescriptorType::UNIFORM_BUFFER),
    ];
    for (set, count, ty) in plan {
        match set_layout(device, count, ty) {
            Ok(layout) => set_layouts[set] = layout,
            Err(e) => {
                destroy_partial(device, &set_layouts);
                return Err(e);
            }
        }
    }

    let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
    let pipeline_layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
        Ok(layout) => layout,
        Err(e) => {
            destroy_partial(device, &set_layouts);
            return Err(e.into());
        }
    };

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(&entry);
    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(pipeline_layout);
    let pipeline = match unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    } {
        Ok(pipelines) => pipelines[0],
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_layout(pipeline_layout, None) };
            destroy_partial(device, &set_layouts);
            return Err(e.into());
        }
    };

    Ok(VulkanShader {
        name: desc.name.to_owned(),
        layout: desc.layout,
        module,
        set_layouts,
        pipeline_layout,
        pipeline,
    })
}
