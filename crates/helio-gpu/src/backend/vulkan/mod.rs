//! Vulkan backend: an `ash`-driven device implementing the scheduler's
//! device surface with a timeline-semaphore fence per queue.

mod emit;
mod events;
mod instance;
mod pools;
mod resources;
mod shaders;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use ash::vk;
use tracing::{debug, error, warn};

use crate::bundle::{GpuState, WorkBundle, WorkType};
use crate::device::{
    BufferDesc, Device, DeviceConfig, ResourceTableDesc, ScheduleFlags, ShaderDesc, TextureDesc,
};
use crate::download::{DownloadLedger, DownloadQuery, DownloadRecord};
use crate::error::{DeviceError, DownloadStatus, ScheduleError, ScheduleErrorKind, WaitStatus};
use crate::handle::{
    HandleContainer, InResourceTable, OutResourceTable, ResourceHandle, ResourceTable,
    SamplerTable, ShaderHandle, WorkHandle,
};
use crate::list::CommandList;
use crate::pool::FencedRingPool;
use crate::registry::{ResourceKind, WorkRegistry};
use crate::schedule::CONSTANT_BUFFER_ALIGN;
use crate::timeline::{FenceLedger, LiveAllocation, SubmissionRing};

use emit::{record_list, RecordContext, UploadBlock};
use events::EventPool;
use instance::VulkanCore;
use pools::{DescriptorSetPool, UploadHeapFactory};
use resources::{VulkanPayload, VulkanResource};
use shaders::VulkanShader;

struct SubmitState {
    cmd_pool: vk::CommandPool,
    ring: SubmissionRing<vk::CommandBuffer, crate::bundle::CommandLocation>,
    ledger: FenceLedger,
    upload_pool: FencedRingPool<UploadHeapFactory>,
    descriptor_pool: DescriptorSetPool,
    event_pool: EventPool,
    /// Resources released by the caller, destroyed once the fence they may
    /// still be referenced by has retired.
    garbage: Vec<(u64, VulkanResource)>,
}

pub struct VulkanDevice {
    core: VulkanCore,
    queue: vk::Queue,
    timeline: vk::Semaphore,
    device_lost: AtomicBool,

    registry: WorkRegistry,
    resources: RwLock<HandleContainer<ResourceHandle, VulkanResource>>,
    tables: Mutex<HandleContainer<ResourceTable, ()>>,
    shaders: RwLock<HandleContainer<ShaderHandle, VulkanShader>>,
    submit: Mutex<SubmitState>,
    downloads: Mutex<DownloadLedger>,
}

// SAFETY: the raw pointers held by resources and upload heaps are persistent
// Vulkan memory mappings; all mutation of backend state is serialized by the
// locks above, and the Vulkan handles themselves are externally synchronized
// through the same locks.
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}

impl VulkanDevice {
    pub fn new(config: &DeviceConfig) -> Result<Self, DeviceError> {
        let core = VulkanCore::new(config)?;
        let queue = unsafe { core.device.get_device_queue(core.queue_family_index, 0) };

        let mut semaphore_type = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut semaphore_type);
        let timeline = unsafe { core.device.create_semaphore(&semaphore_info, None)? };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(core.queue_family_index);
        let cmd_pool = match unsafe { core.device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { core.device.destroy_semaphore(timeline, None) };
                return Err(e.into());
            }
        };

        let submit = SubmitState {
            cmd_pool,
            ring: SubmissionRing::new(config.max_live_submissions),
            ledger: FenceLedger::new(),
            upload_pool: FencedRingPool::new(
                UploadHeapFactory::new(core.device.clone(), core.memory_properties),
                config.upload_pool_initial_size,
            ),
            descriptor_pool: DescriptorSetPool::new(core.device.clone()),
            event_pool: EventPool::new(core.device.clone()),
            garbage: Vec::new(),
        };

        Ok(Self {
            core,
            queue,
            timeline,
            device_lost: AtomicBool::new(false),
            registry: WorkRegistry::new(),
            resources: RwLock::new(HandleContainer::new()),
            tables: Mutex::new(HandleContainer::new()),
            shaders: RwLock::new(HandleContainer::new()),
            submit: Mutex::new(submit),
            downloads: Mutex::new(DownloadLedger::new()),
        })
    }

    pub fn registry(&self) -> &WorkRegistry {
        &self.registry
    }

    fn completed_value(&self) -> Result<u64, vk::Result> {
        unsafe { self.core.device.get_semaphore_counter_value(self.timeline) }
    }

    fn wait_value(&self, value: u64, timeout_ns: u64) -> Result<(), vk::Result> {
        let semaphores = [self.timeline];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        unsafe { self.core.device.wait_semaphores(&info, timeout_ns) }
    }

    /// Recycles everything the GPU has finished with: ring entries (command
    /// buffers and split-barrier events) and deferred resource destruction.
    fn collect_retired(&self, s: &mut SubmitState, completed: u64) {
        let device = &self.core.device;
        let SubmitState { ring, ledger, event_pool, cmd_pool, garbage, .. } = s;
        ring.reap(completed, ledger, |allocation| {
            if !allocation.command_buffers.is_empty() {
                unsafe { device.free_command_buffers(*cmd_pool, &allocation.command_buffers) };
            }
            for location in allocation.events {
                event_pool.release(location);
            }
        });

        let mut kept = Vec::with_capacity(garbage.len());
        for (fence_value, resource) in garbage.drain(..) {
            if fence_value <= completed {
                resource.destroy(device);
            } else {
                kept.push((fence_value, resource));
            }
        }
        *garbage = kept;
    }

    /// Commits retired bundles' states and drops auto-released works.
    fn sweep_works(&self, completed: u64) {
        for work in self.registry.finish_retired(completed) {
            self.downloads.lock().unwrap().release_work(work);
        }
    }

    fn execute_bundle(
        &self,
        work_type: WorkType,
        bundle: &WorkBundle,
        lists: &[&CommandList],
    ) -> Result<(u64, Vec<(ResourceHandle, u32, u32)>), DeviceError> {
        if self.device_lost.load(Ordering::SeqCst) {
            return Err(DeviceError::DeviceLost);
        }
        let mut s = self.submit.lock().unwrap();

        let mut completed = self.completed_value()?;
        self.collect_retired(&mut s, completed);
        self.sweep_works(completed);

        while s.ring.is_full() {
            let oldest = s.ring.oldest_fence().expect("full ring has a head");
            self.wait_value(oldest, u64::MAX)?;
            completed = self.completed_value()?;
            self.collect_retired(&mut s, completed);
            self.sweep_works(completed);
        }

        let fence_value = s.ring.next_fence_value();

        // Everything fallible that does not need an open pool window happens
        // first, so an early error cannot leave the pools mid-usage.

        // Snapshot table membership once; emission must not observe tables
        // released mid-recording.
        let mut tables = HashMap::new();
        for &table in bundle.table_allocations.keys() {
            let info = self.registry.table_info(table).ok_or(DeviceError::StaleHandle)?;
            tables.insert(table, info);
        }

        let cbs = if lists.is_empty() {
            Vec::new()
        } else {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(s.cmd_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(lists.len() as u32);
            unsafe { self.core.device.allocate_command_buffers(&alloc_info)? }
        };

        let close_window = |s: &mut SubmitState, device: &ash::Device, cbs: &[vk::CommandBuffer]| {
            if !cbs.is_empty() {
                unsafe { device.free_command_buffers(s.cmd_pool, cbs) };
            }
            let SubmitState { upload_pool, descriptor_pool, ledger, .. } = s;
            upload_pool.end_usage(ledger);
            descriptor_pool.end_usage(ledger);
        };

        {
            let SubmitState { upload_pool, descriptor_pool, ledger, cmd_pool, .. } = &mut *s;
            upload_pool.begin_usage(fence_value, ledger, |f| f <= completed);
            if let Err(e) = descriptor_pool.begin_usage(fence_value, ledger, |f| f <= completed) {
                upload_pool.end_usage(ledger);
                if !cbs.is_empty() {
                    unsafe { self.core.device.free_command_buffers(*cmd_pool, &cbs) };
                }
                return Err(e);
            }
        }

        let upload_block = if bundle.total_upload_buffer_size > 0 {
            match s.upload_pool.allocate(bundle.total_upload_buffer_size, CONSTANT_BUFFER_ALIGN) {
                Ok(alloc) => {
                    let heap = s.upload_pool.heap(alloc.heap);
                    Some(UploadBlock {
                        buffer: heap.buffer,
                        mapped: unsafe { heap.mapped.add(alloc.offset as usize) },
                        base_offset: alloc.offset,
                    })
                }
                Err(e) => {
                    close_window(&mut s, &self.core.device, &cbs);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let mut used_events = Vec::new();
        let mut pending_downloads = Vec::new();
        let record_result = {
            let resources = self.resources.read().unwrap();
            let shaders = self.shaders.read().unwrap();
            let SubmitState { descriptor_pool, event_pool, ledger, .. } = &mut *s;
            let mut ctx = RecordContext {
                device: &self.core.device,
                resources: &*resources,
                shaders: &*shaders,
                tables: &tables,
                descriptor_pool,
                event_pool,
                ledger,
                upload: upload_block,
                used_events: Vec::new(),
                downloads: Vec::new(),
            };

            let mut result = Ok(());
            for (index, cb) in cbs.iter().enumerate() {
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                result = unsafe { self.core.device.begin_command_buffer(*cb, &begin_info) }
                    .map_err(DeviceError::from)
                    .and_then(|()| {
                        record_list(&mut ctx, *cb, lists[index].data(), &bundle.processed_lists[index])
                    })
                    .and_then(|()| unsafe {
                        self.core.device.end_command_buffer(*cb).map_err(DeviceError::from)
                    });
                if result.is_err() {
                    break;
                }
            }
            used_events = ctx.used_events;
            pending_downloads = ctx.downloads;
            result
        };

        if let Err(e) = record_result {
            close_window(&mut s, &self.core.device, &cbs);
            return Err(e);
        }

        let signal_values = [fence_value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&signal_values);
        let signal_semaphores = [self.timeline];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&cbs)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);
        if let Err(e) =
            unsafe { self.core.device.queue_submit(self.queue, &[submit_info], vk::Fence::null()) }
        {
            close_window(&mut s, &self.core.device, &cbs);
            return Err(e.into());
        }
        debug!(fence_value, lists = lists.len(), ?work_type, "submitted bundle");

        {
            let SubmitState { ring, ledger, upload_pool, descriptor_pool, .. } = &mut *s;
            ring.record(
                LiveAllocation { fence_value, command_buffers: cbs, events: used_events },
                ledger,
            );
            upload_pool.end_usage(ledger);
            descriptor_pool.end_usage(ledger);
        }

        Ok((fence_value, pending_downloads))
    }
}

impl Device for VulkanDevice {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<ResourceHandle, DeviceError> {
        let resource = resources::create_buffer(&self.core, desc)?;
        let handle = self.resources.write().unwrap().allocate(resource);
        let stride = if desc.stride != 0 { desc.stride } else { desc.format.byte_size() };
        self.registry.register_resource(
            handle,
            ResourceKind::Buffer {
                element_count: desc.element_count,
                stride,
                constant_buffer: desc.constant_buffer,
            },
            desc.mem_flags,
            GpuState::Default,
        );
        Ok(handle)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<ResourceHandle, DeviceError> {
        let resource = resources::create_texture(&self.core, desc)?;
        let handle = self.resources.write().unwrap().allocate(resource);
        self.registry.register_resource(
            handle,
            ResourceKind::Texture {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
                mip_levels: desc.mip_levels.max(1),
                array_slices: desc.array_slices.max(1),
            },
            desc.mem_flags,
            GpuState::Default,
        );
        Ok(handle)
    }

    fn create_in_resource_table(
        &self,
        desc: &ResourceTableDesc<'_>,
    ) -> Result<InResourceTable, DeviceError> {
        Ok(InResourceTable(self.create_table(desc, false)?))
    }

    fn create_out_resource_table(
        &self,
        desc: &ResourceTableDesc<'_>,
    ) -> Result<OutResourceTable, DeviceError> {
        Ok(OutResourceTable(self.create_table(desc, true)?))
    }

    fn create_sampler_table(
        &self,
        _desc: &ResourceTableDesc<'_>,
    ) -> Result<SamplerTable, DeviceError> {
        Err(DeviceError::Unsupported("sampler tables"))
    }

    fn register_shader(&self, desc: &ShaderDesc<'_>) -> Result<ShaderHandle, DeviceError> {
        let shader = shaders::create_shader(&self.core.device, desc)?;
        Ok(self.shaders.write().unwrap().allocate(shader))
    }

    fn schedule(
        &self,
        lists: &[&CommandList],
        flags: ScheduleFlags,
    ) -> Result<WorkHandle, ScheduleError> {
        let bundle = self.registry.build(lists)?;
        let auto_release = !flags.contains(ScheduleFlags::GET_WORK_HANDLE);
        let work = self.registry.insert_work(bundle, auto_release);
        let bundle = self.registry.work_bundle(work).expect("bundle was just inserted");

        match self.execute_bundle(WorkType::Compute, &bundle, lists) {
            Ok((fence_value, downloads)) => {
                self.registry.set_work_fence(work, fence_value);
                let mut ledger = self.downloads.lock().unwrap();
                for (resource, mip_level, array_slice) in downloads {
                    ledger.insert(
                        work,
                        DownloadRecord { fence_value, resource, mip_level, array_slice },
                    );
                }
                Ok(work)
            }
            Err(err @ (DeviceError::Vulkan(_) | DeviceError::DeviceLost)) => {
                // The schedule itself was valid; the device failed underneath
                // it. Surface the loss through wait_on_cpu, like any other
                // asynchronous device removal.
                error!(error = %err, "bundle submission failed; marking device as lost");
                self.device_lost.store(true, Ordering::SeqCst);
                Ok(work)
            }
            Err(err) => {
                self.registry.release_work(work);
                Err(ScheduleError::new(
                    ScheduleErrorKind::InvalidResource,
                    format!("bundle emission rejected: {err}"),
                ))
            }
        }
    }

    fn wait_on_cpu(&self, work: WorkHandle, timeout_ms: i64) -> WaitStatus {
        let Some(fence_value) = self.registry.work_fence(work) else {
            return if self.device_lost.load(Ordering::SeqCst) {
                WaitStatus::DeviceLost
            } else {
                // Stale handles and never-submitted works have nothing left
                // to wait for.
                WaitStatus::Ok
            };
        };

        let timeout_ns = if timeout_ms < 0 {
            u64::MAX
        } else {
            (timeout_ms as u64).saturating_mul(1_000_000)
        };
        match self.wait_value(fence_value, timeout_ns) {
            Ok(()) => {
                if let Ok(completed) = self.completed_value() {
                    self.sweep_works(completed);
                } else {
                    let _ = self.registry.commit_resource_states(work);
                }
                WaitStatus::Ok
            }
            Err(vk::Result::TIMEOUT) => WaitStatus::Timeout,
            Err(e) => {
                warn!(error = ?e, "fence wait failed");
                self.device_lost.store(true, Ordering::SeqCst);
                WaitStatus::DeviceLost
            }
        }
    }

    fn download_status(
        &self,
        work: WorkHandle,
        resource: ResourceHandle,
        mip_level: u32,
        array_slice: u32,
    ) -> DownloadStatus {
        let Ok(completed) = self.completed_value() else {
            return DownloadStatus::Invalid;
        };

        let record = {
            let ledger = self.downloads.lock().unwrap();
            match ledger.query(work, resource, mip_level, array_slice, completed) {
                DownloadQuery::Ready(record) => record,
                DownloadQuery::NotReady => return DownloadStatus::NotReady,
                DownloadQuery::Invalid => return DownloadStatus::Invalid,
            }
        };

        let resources = self.resources.read().unwrap();
        let Some(res) = resources.get(record.resource) else {
            return DownloadStatus::Invalid;
        };
        match (&res.payload, res.mapped) {
            (VulkanPayload::Buffer { .. }, Some(mapped)) => {
                // Persistently mapped host-coherent staging; the fence above
                // orders the GPU writes before this read.
                let data = unsafe {
                    std::slice::from_raw_parts(mapped, res.byte_size as usize).to_vec()
                };
                DownloadStatus::Ready { data }
            }
            _ => DownloadStatus::Invalid,
        }
    }

    fn release_resource(&self, handle: ResourceHandle) {
        let Some(resource) = self.resources.write().unwrap().free(handle) else {
            return;
        };
        self.registry.unregister_resource(handle);
        let mut s = self.submit.lock().unwrap();
        let pinned_until = s.ring.current_fence_value();
        s.garbage.push((pinned_until, resource));
    }

    fn release_table(&self, table: ResourceTable) {
        if self.tables.lock().unwrap().free(table).is_some() {
            self.registry.unregister_table(table);
        }
    }

    fn release_work(&self, work: WorkHandle) {
        if self.registry.release_work(work) {
            self.downloads.lock().unwrap().release_work(work);
        }
    }
}

impl VulkanDevice {
    fn create_table(
        &self,
        desc: &ResourceTableDesc<'_>,
        is_uav: bool,
    ) -> Result<ResourceTable, DeviceError> {
        if desc.resources.is_empty() {
            return Err(DeviceError::InvalidDescriptor("a table needs at least one resource".into()));
        }
        {
            let resources = self.resources.read().unwrap();
            for &r in desc.resources {
                if !resources.contains(r) {
                    return Err(DeviceError::StaleHandle);
                }
            }
        }
        let table = self.tables.lock().unwrap().allocate(());
        self.registry
            .register_table(table, desc.resources, is_uav)
            .map_err(|_| DeviceError::StaleHandle)?;
        Ok(table)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let device = self.core.device.clone();
        unsafe {
            let _ = device.device_wait_idle();
        }

        {
            let mut s = self.submit.lock().unwrap();
            let drained = s.ring.drain();
            for allocation in drained {
                if !allocation.command_buffers.is_empty() {
                    unsafe { device.free_command_buffers(s.cmd_pool, &allocation.command_buffers) };
                }
            }
            for (_, resource) in s.garbage.drain(..) {
                resource.destroy(&device);
            }
            for heap in s.upload_pool.drain_heaps() {
                heap.destroy(&device);
            }
            s.descriptor_pool.destroy();
            s.event_pool.destroy();
            unsafe { device.destroy_command_pool(s.cmd_pool, None) };
        }

        {
            let mut resources = self.resources.write().unwrap();
            for handle in resources.handles() {
                if let Some(resource) = resources.free(handle) {
                    resource.destroy(&device);
                }
            }
        }
        {
            let mut shaders = self.shaders.write().unwrap();
            for handle in shaders.handles() {
                if let Some(shader) = shaders.free(handle) {
                    shader.destroy(&device);
                }
            }
        }

        unsafe {
            device.destroy_semaphore(self.timeline, None);
            device.destroy_device(None);
            self.core.instance.destroy_instance(None);
        }
    }
}
