//! Vulkan-side transient pools: host-visible upload heaps for the generic
//! ring pool, and a fence-gated descriptor-set pool.

use std::collections::VecDeque;

use ash::vk;

use crate::error::DeviceError;
use crate::pool::{HeapFactory, PoolHeap};
use crate::timeline::FenceLedger;

/// One CPU-visible staging buffer, persistently mapped.
pub struct UploadHeap {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub mapped: *mut u8,
    pub size: u64,
}

impl UploadHeap {
    pub fn destroy(self, device: &ash::Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

impl PoolHeap for UploadHeap {
    fn capacity(&self) -> u64 {
        self.size
    }
}

pub struct UploadHeapFactory {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl UploadHeapFactory {
    pub fn new(device: ash::Device, memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self { device, memory_properties }
    }

    fn host_memory_type(&self, type_bits: u32) -> Option<u32> {
        let wanted =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        (0..self.memory_properties.memory_type_count).find(|&i| {
            (type_bits & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(wanted)
        })
    }
}

impl HeapFactory for UploadHeapFactory {
    type Heap = UploadHeap;
    type Error = DeviceError;

    fn create_heap(&mut self, min_size: u64) -> Result<UploadHeap, DeviceError> {
        let info = vk::BufferCreateInfo::default()
            .size(min_size)
            // Inline constants bind straight out of the heap as uniform data.
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::UNIFORM_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let type_index = match self.host_memory_type(requirements.memory_type_bits) {
            Some(index) => index,
            None => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(DeviceError::InvalidDescriptor(
                    "no host-visible memory type for upload heap".into(),
                ));
            }
        };
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);

        let result = (|| unsafe {
            let memory = self.device.allocate_memory(&alloc_info, None)?;
            if let Err(e) = self.device.bind_buffer_memory(buffer, memory, 0) {
                self.device.free_memory(memory, None);
                return Err(e);
            }
            match self.device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) {
                Ok(ptr) => Ok((memory, ptr as *mut u8)),
                Err(e) => {
                    self.device.free_memory(memory, None);
                    Err(e)
                }
            }
        })();

        match result {
            Ok((memory, mapped)) => Ok(UploadHeap { buffer, memory, mapped, size: min_size }),
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                Err(e.into())
            }
        }
    }
}

struct DescriptorPoolState {
    pool: vk::DescriptorPool,
    fence_value: u64,
}

/// Descriptor pools cycled per usage window, reset once their fence retires.
pub struct DescriptorSetPool {
    device: ash::Device,
    pools: Vec<DescriptorPoolState>,
    live: VecDeque<usize>,
    free: VecDeque<usize>,
    active: Option<usize>,
    current_fence: u64,
}

impl DescriptorSetPool {
    const MAX_SETS: u32 = 64;
    const SIZES: [(vk::DescriptorType, u32); 2] = [
        (vk::DescriptorType::STORAGE_BUFFER, 256),
        (vk::DescriptorType::UNIFORM_BUFFER, 64),
    ];

    pub fn new(device: ash::Device) -> Self {
        Self {
            device,
            pools: Vec::new(),
            live: VecDeque::new(),
            free: VecDeque::new(),
            active: None,
            current_fence: 0,
        }
    }

    fn create_pool(&self) -> Result<vk::DescriptorPool, DeviceError> {
        let sizes: Vec<vk::DescriptorPoolSize> = Self::SIZES
            .iter()
            .map(|&(ty, count)| vk::DescriptorPoolSize { ty, descriptor_count: count })
            .collect();
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(Self::MAX_SETS)
            .pool_sizes(&sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None)? })
    }

    fn activate_pool(&mut self) -> Result<(), DeviceError> {
        if let Some(index) = self.free.pop_front() {
            unsafe {
                self.device.reset_descriptor_pool(
                    self.pools[index].pool,
                    vk::DescriptorPoolResetFlags::empty(),
                )?;
            }
            self.active = Some(index);
            return Ok(());
        }
        let pool = self.create_pool()?;
        self.pools.push(DescriptorPoolState { pool, fence_value: 0 });
        self.active = Some(self.pools.len() - 1);
        Ok(())
    }

    pub fn begin_usage(
        &mut self,
        fence_value: u64,
        ledger: &mut FenceLedger,
        mut is_signaled: impl FnMut(u64) -> bool,
    ) -> Result<(), DeviceError> {
        self.current_fence = fence_value;
        while let Some(&front) = self.live.front() {
            if !is_signaled(self.pools[front].fence_value) {
                break;
            }
            ledger.release(self.pools[front].fence_value);
            self.free.push_back(front);
            self.live.pop_front();
        }
        self.activate_pool()
    }

    pub fn end_usage(&mut self, ledger: &mut FenceLedger) {
        if let Some(index) = self.active.take() {
            self.pools[index].fence_value = self.current_fence;
            ledger.add_ref(self.current_fence);
            self.live.push_back(index);
        }
    }

    /// Allocates one set per layout, rolling to a fresh pool when the active
    /// one is exhausted.
    pub fn allocate(
        &mut self,
        layouts: &[vk::DescriptorSetLayout],
        ledger: &mut FenceLedger,
    ) -> Result<Vec<vk::DescriptorSet>, DeviceError> {
        let mut rolled_over = false;
        loop {
            let active = self.active.expect("descriptor allocation outside a usage window");
            let info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(self.pools[active].pool)
                .set_layouts(layouts);
            match unsafe { self.device.allocate_descriptor_sets(&info) } {
                Ok(sets) => return Ok(sets),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
                | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {
                    // One request can never outgrow a fresh pool; a second
                    // miss in the same call means the layouts are oversized.
                    if rolled_over {
                        return Err(DeviceError::InvalidDescriptor(
                            "descriptor demand exceeds a whole descriptor pool".into(),
                        ));
                    }
                    // Retire the exhausted pool into the current window and
                    // keep allocating from a fresh one.
                    self.end_usage(ledger);
                    self.activate_pool()?;
                    rolled_over = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn destroy(&mut self) {
        for state in self.pools.drain(..) {
            unsafe { self.device.destroy_descriptor_pool(state.pool, None) };
        }
        self.live.clear();
        self.free.clear();
        self.active = None;
    }
}
