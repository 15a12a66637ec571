//! Vulkan bring-up: loader, instance, adapter selection and logical device.
//!
//! The instance is an explicitly constructed object owned by the device; no
//! process-wide caching, so construction order is the caller's to control and
//! teardown is deterministic.

use std::ffi::CStr;

use ash::vk;
use tracing::info;

use crate::device::DeviceConfig;
use crate::error::DeviceError;

pub struct VulkanCore {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_family_index: u32,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub limits: vk::PhysicalDeviceLimits,
}

impl VulkanCore {
    pub fn new(config: &DeviceConfig) -> Result<Self, DeviceError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            DeviceError::NoAdapter(format!("failed to load the Vulkan loader: {e}"))
        })?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"helio")
            .engine_name(c"helio")
            .api_version(vk::API_VERSION_1_2);
        let instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&instance_info, None)? };

        match Self::with_instance(config, entry, instance) {
            Ok(core) => Ok(core),
            Err((entry, instance, err)) => {
                // The instance must go down while the loader is still alive.
                unsafe { instance.destroy_instance(None) };
                drop(entry);
                Err(err)
            }
        }
    }

    fn with_instance(
        config: &DeviceConfig,
        entry: ash::Entry,
        instance: ash::Instance,
    ) -> Result<Self, (ash::Entry, ash::Instance, DeviceError)> {
        let physical_devices = match unsafe { instance.enumerate_physical_devices() } {
            Ok(devices) => devices,
            Err(e) => return Err((entry, instance, e.into())),
        };

        // Adapters are ranked by enumeration order; anything with a
        // compute-capable queue family qualifies.
        let mut candidates = Vec::new();
        for pd in physical_devices {
            let families =
                unsafe { instance.get_physical_device_queue_family_properties(pd) };
            let family = families
                .iter()
                .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE));
            if let Some(index) = family {
                candidates.push((pd, index as u32));
            }
        }
        if candidates.is_empty() {
            return Err((
                entry,
                instance,
                DeviceError::NoAdapter("no Vulkan adapter exposes a compute queue".into()),
            ));
        }
        let (physical_device, queue_family_index) =
            candidates[config.adapter_index.min(candidates.len() - 1)];

        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan12);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        if vulkan12.timeline_semaphore == vk::FALSE {
            return Err((
                entry,
                instance,
                DeviceError::NoAdapter(
                    "selected adapter does not support timeline semaphores".into(),
                ),
            ));
        }

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities)];
        let mut enabled12 = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .push_next(&mut enabled12);
        let device =
            match unsafe { instance.create_device(physical_device, &device_info, None) } {
                Ok(device) => device,
                Err(e) => return Err((entry, instance, e.into())),
            };

        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        info!(
            adapter = %name.to_string_lossy(),
            queue_family = queue_family_index,
            "created Vulkan device"
        );

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_family_index,
            memory_properties,
            limits: properties.limits,
        })
    }

    /// Picks a memory type matching `type_bits` with all of `flags`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        (0..self.memory_properties.memory_type_count).find(|&i| {
            (type_bits & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
        })
    }
}
