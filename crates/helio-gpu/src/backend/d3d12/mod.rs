//! D3D12 backend: transition barriers grouped per batch with
//! begin-only/end-only flags standing in for the split-barrier halves, root
//! descriptor tables bound per dispatch, and an `ID3D12Fence` driving the
//! queue timeline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use tracing::{debug, error, warn};
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D::{ID3DBlob, D3D_FEATURE_LEVEL_12_0};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::{CreateDXGIFactory2, IDXGIAdapter1, IDXGIFactory4};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};

use helio_protocol::{Cmd, ComputeCmd, Dispatch, ListReader};

use crate::bundle::{BarrierKind, CommandInfo, GpuState, MemFlags, ProcessedList, ResourceBarrier, WorkBundle, WorkType};
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
use crate::pool::align_up;
use crate::registry::{ResourceKind, TableInfo, WorkRegistry};
use crate::schedule::CONSTANT_BUFFER_ALIGN;
use crate::timeline::{FenceLedger, LiveAllocation, SubmissionRing};

/// Root parameter slots: one SRV table, one UAV table, one CBV table.
const ROOT_SLOT_SRV: u32 = 0;
const ROOT_SLOT_UAV: u32 = 1;
const ROOT_SLOT_CBV: u32 = 2;

fn dx12_state(state: GpuState) -> D3D12_RESOURCE_STATES {
    match state {
        GpuState::Default => D3D12_RESOURCE_STATE_COMMON,
        GpuState::Uav => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        GpuState::Srv => D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE,
        GpuState::Cbv => D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER,
        GpuState::CopySrc => D3D12_RESOURCE_STATE_COPY_SOURCE,
        GpuState::CopyDst => D3D12_RESOURCE_STATE_COPY_DEST,
        GpuState::IndirectArgs => D3D12_RESOURCE_STATE_INDIRECT_ARGUMENT,
        GpuState::Rtv => D3D12_RESOURCE_STATE_RENDER_TARGET,
        GpuState::Present => D3D12_RESOURCE_STATE_PRESENT,
    }
}

struct Dx12Resource {
    resource: ID3D12Resource,
    byte_size: u64,
    /// Persistent mapping for readback/upload heaps.
    mapped: Option<*mut u8>,
    is_buffer: bool,
}

struct Dx12Shader {
    pipeline: ID3D12PipelineState,
    name: String,
}

struct DescriptorHeapWindow {
    heap: ID3D12DescriptorHeap,
    fence_value: u64,
}

struct SubmitState {
    ring: SubmissionRing<(ID3D12CommandAllocator, ID3D12GraphicsCommandList), ()>,
    ledger: FenceLedger,
    upload_heaps: VecDeque<(u64, Dx12Resource)>,
    descriptor_heaps: VecDeque<DescriptorHeapWindow>,
    garbage: Vec<(u64, Dx12Resource)>,
}

pub struct Dx12Device {
    device: ID3D12Device,
    queue: ID3D12CommandQueue,
    fence: ID3D12Fence,
    fence_event: HANDLE,
    root_signature: ID3D12RootSignature,
    descriptor_size: u32,
    device_lost: AtomicBool,

    registry: WorkRegistry,
    resources: RwLock<HandleContainer<ResourceHandle, Dx12Resource>>,
    tables: Mutex<HandleContainer<ResourceTable, ()>>,
    shaders: RwLock<HandleContainer<ShaderHandle, Dx12Shader>>,
    submit: Mutex<SubmitState>,
    downloads: Mutex<DownloadLedger>,
}

// SAFETY: D3D12 interfaces are agile here; mapped pointers are persistent
// heap mappings and all mutable state is behind the locks above.
unsafe impl Send for Dx12Device {}
unsafe impl Sync for Dx12Device {}

impl Dx12Device {
    pub fn new(config: &DeviceConfig) -> Result<Self, DeviceError> {
        let _ = config;
        unsafe {
            let factory: IDXGIFactory4 = CreateDXGIFactory2(Default::default())
                .map_err(|e| DeviceError::NoAdapter(format!("DXGI factory: {e}")))?;
            let adapter: IDXGIAdapter1 = factory
                .EnumAdapters1(config.adapter_index as u32)
                .or_else(|_| factory.EnumAdapters1(0))
                .map_err(|e| DeviceError::NoAdapter(format!("no DXGI adapter: {e}")))?;

            let mut device_opt: Option<ID3D12Device> = None;
            D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_12_0, &mut device_opt)
                .map_err(|e| DeviceError::NoAdapter(format!("D3D12CreateDevice: {e}")))?;
            let device = device_opt.expect("D3D12CreateDevice succeeded without a device");

            let queue_desc = D3D12_COMMAND_QUEUE_DESC {
                Type: D3D12_COMMAND_LIST_TYPE_COMPUTE,
                ..Default::default()
            };
            let queue: ID3D12CommandQueue = device
                .CreateCommandQueue(&queue_desc)
                .map_err(|e| DeviceError::NoAdapter(format!("command queue: {e}")))?;

            let fence: ID3D12Fence = device
                .CreateFence(0, D3D12_FENCE_FLAG_NONE)
                .map_err(|e| DeviceError::NoAdapter(format!("fence: {e}")))?;
            let fence_event = CreateEventW(None, false, false, None)
                .map_err(|e| DeviceError::NoAdapter(format!("fence event: {e}")))?;

            let root_signature = create_compute_root_signature(&device)?;
            let descriptor_size =
                device.GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV);

            debug!("created D3D12 device");
            Ok(Self {
                device,
                queue,
                fence,
                fence_event,
                root_signature,
                descriptor_size,
                device_lost: AtomicBool::new(false),
                registry: WorkRegistry::new(),
                resources: RwLock::new(HandleContainer::new()),
                tables: Mutex::new(HandleContainer::new()),
                shaders: RwLock::new(HandleContainer::new()),
                submit: Mutex::new(SubmitState {
                    ring: SubmissionRing::new(config.max_live_submissions),
                    ledger: FenceLedger::new(),
                    upload_heaps: VecDeque::new(),
                    descriptor_heaps: VecDeque::new(),
                    garbage: Vec::new(),
                }),
                downloads: Mutex::new(DownloadLedger::new()),
            })
        }
    }

    fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    fn collect_retired(&self, s: &mut SubmitState, completed: u64) {
        let SubmitState { ring, ledger, upload_heaps, descriptor_heaps, garbage } = s;
        ring.reap(completed, ledger, |_| {});
        while upload_heaps.front().is_some_and(|(f, _)| *f <= completed) {
            upload_heaps.pop_front();
        }
        while descriptor_heaps.front().is_some_and(|w| w.fence_value <= completed) {
            descriptor_heaps.pop_front();
        }
        garbage.retain(|(f, _)| *f > completed);
    }

    fn sweep_works(&self, completed: u64) {
        for work in self.registry.finish_retired(completed) {
            self.downloads.lock().unwrap().release_work(work);
        }
    }

    fn create_committed_buffer(
        &self,
        size: u64,
        heap_type: D3D12_HEAP_TYPE,
        initial_state: D3D12_RESOURCE_STATES,
        allow_uav: bool,
    ) -> Result<Dx12Resource, DeviceError> {
        let heap_props = D3D12_HEAP_PROPERTIES { Type: heap_type, ..Default::default() };
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Width: size.max(4),
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            SampleDesc: windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: if allow_uav {
                D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
            } else {
                D3D12_RESOURCE_FLAG_NONE
            },
            ..Default::default()
        };
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &heap_props,
                D3D12_HEAP_FLAG_NONE,
                &desc,
                initial_state,
                None,
                &mut resource,
            )?;
        }
        let resource = resource.expect("CreateCommittedResource succeeded without a resource");

        let mapped = if heap_type != D3D12_HEAP_TYPE_DEFAULT {
            let mut ptr = std::ptr::null_mut();
            unsafe { resource.Map(0, None, Some(&mut ptr))? };
            Some(ptr as *mut u8)
        } else {
            None
        };
        Ok(Dx12Resource { resource, byte_size: size.max(4), mapped, is_buffer: true })
    }

    fn apply_barriers(
        &self,
        list: &ID3D12GraphicsCommandList,
        resources: &HandleContainer<ResourceHandle, Dx12Resource>,
        barriers: &[ResourceBarrier],
    ) -> Result<(), DeviceError> {
        if barriers.is_empty() {
            return Ok(());
        }
        let mut native: Vec<D3D12_RESOURCE_BARRIER> = Vec::with_capacity(barriers.len());
        for b in barriers {
            if b.prev_state == b.post_state {
                continue;
            }
            let res = resources.get(b.resource).ok_or(DeviceError::StaleHandle)?;
            let flags = match b.kind {
                BarrierKind::Immediate => D3D12_RESOURCE_BARRIER_FLAG_NONE,
                BarrierKind::Begin => D3D12_RESOURCE_BARRIER_FLAG_BEGIN_ONLY,
                BarrierKind::End => D3D12_RESOURCE_BARRIER_FLAG_END_ONLY,
            };
            native.push(D3D12_RESOURCE_BARRIER {
                Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
                Flags: flags,
                Anonymous: D3D12_RESOURCE_BARRIER_0 {
                    Transition: std::mem::ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                        pResource: std::mem::ManuallyDrop::new(Some(res.resource.clone())),
                        Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                        StateBefore: dx12_state(b.prev_state),
                        StateAfter: dx12_state(b.post_state),
                    }),
                },
            });
        }
        if !native.is_empty() {
            unsafe { list.ResourceBarrier(&native) };
            for barrier in &mut native {
                unsafe {
                    let transition =
                        std::mem::ManuallyDrop::take(&mut barrier.Anonymous.Transition);
                    drop(std::mem::ManuallyDrop::into_inner(transition.pResource));
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record_compute(
        &self,
        list: &ID3D12GraphicsCommandList,
        resources: &HandleContainer<ResourceHandle, Dx12Resource>,
        shaders: &HandleContainer<ShaderHandle, Dx12Shader>,
        tables: &HashMap<ResourceTable, TableInfo>,
        bundle: &WorkBundle,
        heap: &ID3D12DescriptorHeap,
        upload: Option<&Dx12Resource>,
        cmd: &ComputeCmd<'_>,
        info: &CommandInfo,
    ) -> Result<(), DeviceError> {
        if !cmd.sampler_tables.is_empty() {
            return Err(DeviceError::Unsupported("sampler tables"));
        }
        let shader = shaders
            .get(ShaderHandle::from_bits(cmd.shader))
            .ok_or(DeviceError::StaleHandle)?;

        unsafe {
            list.SetComputeRootSignature(&self.root_signature);
            list.SetDescriptorHeaps(&[Some(heap.clone())]);
            list.SetPipelineState(&shader.pipeline);
        }

        let cpu_base = unsafe { heap.GetCPUDescriptorHandleForHeapStart() };
        let gpu_base = unsafe { heap.GetGPUDescriptorHandleForHeapStart() };
        let cpu_at = |slot: u32| D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: cpu_base.ptr + (slot as usize) * (self.descriptor_size as usize),
        };
        let gpu_at = |slot: u32| D3D12_GPU_DESCRIPTOR_HANDLE {
            ptr: gpu_base.ptr + u64::from(slot) * u64::from(self.descriptor_size),
        };

        // Tables land at their bundle-assigned offsets in the shared range.
        let mut bind_tables =
            |raw_tables: helio_protocol::HandleSlice<'_>, root_slot: u32, uav: bool| -> Result<(), DeviceError> {
                for (position, raw) in raw_tables.iter().enumerate() {
                    let table = ResourceTable::from_bits(raw);
                    let allocation = bundle
                        .table_allocations
                        .get(&table)
                        .ok_or(DeviceError::StaleHandle)?;
                    let members = tables.get(&table).ok_or(DeviceError::StaleHandle)?;
                    for (i, &member) in members.resources.iter().enumerate() {
                        let res = resources.get(member).ok_or(DeviceError::StaleHandle)?;
                        let slot = cpu_at(allocation.offset + i as u32);
                        if uav {
                            let desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                                Format: windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_R32_TYPELESS,
                                ViewDimension: D3D12_UAV_DIMENSION_BUFFER,
                                Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                                    Buffer: D3D12_BUFFER_UAV {
                                        FirstElement: 0,
                                        NumElements: (res.byte_size / 4) as u32,
                                        StructureByteStride: 0,
                                        CounterOffsetInBytes: 0,
                                        Flags: D3D12_BUFFER_UAV_FLAG_RAW,
                                    },
                                },
                            };
                            unsafe {
                                self.device.CreateUnorderedAccessView(
                                    &res.resource,
                                    None,
                                    Some(&desc),
                                    slot,
                                )
                            };
                        } else {
                            let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
                                Format: windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_R32_TYPELESS,
                                ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
                                Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                                Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                                    Buffer: D3D12_BUFFER_SRV {
                                        FirstElement: 0,
                                        NumElements: (res.byte_size / 4) as u32,
                                        StructureByteStride: 0,
                                        Flags: D3D12_BUFFER_SRV_FLAG_RAW,
                                    },
                                },
                            };
                            unsafe {
                                self.device.CreateShaderResourceView(
                                    &res.resource,
                                    Some(&desc),
                                    slot,
                                )
                            };
                        }
                    }
                    if position == 0 {
                        unsafe {
                            list.SetComputeRootDescriptorTable(root_slot, gpu_at(allocation.offset))
                        };
                    }
                }
                Ok(())
            };

        bind_tables(cmd.in_tables, ROOT_SLOT_SRV, false)?;
        bind_tables(cmd.out_tables, ROOT_SLOT_UAV, true)?;

        let cbv_slot = bundle.total_table_size + info.constant_buffer_table_offset;
        if !cmd.inline_constant.is_empty() {
            let upload = upload.ok_or(DeviceError::Unsupported("inline constants without an upload block"))?;
            let mapped = upload.mapped.ok_or(DeviceError::Unsupported("upload heap is not mapped"))?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    cmd.inline_constant.as_ptr(),
                    mapped.add(info.upload_buffer_offset as usize),
                    cmd.inline_constant.len(),
                );
            }
            let desc = D3D12_CONSTANT_BUFFER_VIEW_DESC {
                BufferLocation: unsafe { upload.resource.GetGPUVirtualAddress() }
                    + info.upload_buffer_offset,
                SizeInBytes: align_up(cmd.inline_constant.len() as u64, CONSTANT_BUFFER_ALIGN)
                    as u32,
            };
            unsafe {
                self.device.CreateConstantBufferView(Some(&desc), cpu_at(cbv_slot));
                list.SetComputeRootDescriptorTable(ROOT_SLOT_CBV, gpu_at(cbv_slot));
            }
        } else if !cmd.constants.is_empty() {
            for (i, raw) in cmd.constants.iter().enumerate() {
                let res = resources
                    .get(ResourceHandle::from_bits(raw))
                    .ok_or(DeviceError::StaleHandle)?;
                let desc = D3D12_CONSTANT_BUFFER_VIEW_DESC {
                    BufferLocation: unsafe { res.resource.GetGPUVirtualAddress() },
                    SizeInBytes: align_up(res.byte_size, CONSTANT_BUFFER_ALIGN) as u32,
                };
                unsafe {
                    self.device
                        .CreateConstantBufferView(Some(&desc), cpu_at(cbv_slot + i as u32))
                };
            }
            unsafe { list.SetComputeRootDescriptorTable(ROOT_SLOT_CBV, gpu_at(cbv_slot)) };
        }

        unsafe {
            match cmd.dispatch {
                Dispatch::Direct { x, y, z } => list.Dispatch(x.max(1), y.max(1), z.max(1)),
                Dispatch::Indirect { .. } => {
                    return Err(DeviceError::Unsupported(
                        "indirect dispatch on the D3D12 backend",
                    ))
                }
            }
        }
        Ok(())
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
        let completed = self.completed_value();
        self.collect_retired(&mut s, completed);
        self.sweep_works(completed);

        let fence_value = s.ring.next_fence_value();

        let upload = if bundle.total_upload_buffer_size > 0 {
            Some(self.create_committed_buffer(
                align_up(bundle.total_upload_buffer_size, CONSTANT_BUFFER_ALIGN),
                D3D12_HEAP_TYPE_UPLOAD,
                D3D12_RESOURCE_STATE_GENERIC_READ,
                false,
            )?)
        } else {
            None
        };

        let descriptor_count = bundle.total_table_size + bundle.total_constant_buffers;
        let heap_desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
            NumDescriptors: descriptor_count.max(1),
            Flags: D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE,
            NodeMask: 0,
        };
        let heap: ID3D12DescriptorHeap =
            unsafe { self.device.CreateDescriptorHeap(&heap_desc)? };

        let mut tables = HashMap::new();
        for &table in bundle.table_allocations.keys() {
            let info = self.registry.table_info(table).ok_or(DeviceError::StaleHandle)?;
            tables.insert(table, info);
        }

        let resources = self.resources.read().unwrap();
        let shaders = self.shaders.read().unwrap();
        let mut pending_downloads = Vec::new();
        let mut recorded = Vec::new();

        for (index, source) in lists.iter().enumerate() {
            let allocator: ID3D12CommandAllocator = unsafe {
                self.device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_COMPUTE)?
            };
            let list: ID3D12GraphicsCommandList = unsafe {
                self.device.CreateCommandList(
                    0,
                    D3D12_COMMAND_LIST_TYPE_COMPUTE,
                    &allocator,
                    None,
                )?
            };

            let reader = ListReader::new(source.data()).map_err(|e| {
                DeviceError::InvalidDescriptor(format!("finalized list failed to re-parse: {e}"))
            })?;
            let schedule: &ProcessedList = &bundle.processed_lists[index];
            let mut entries = schedule.command_schedule.iter();
            for record in reader.commands() {
                let record = record.map_err(|e| {
                    DeviceError::InvalidDescriptor(format!(
                        "finalized list failed to re-parse: {e}"
                    ))
                })?;
                let info = entries.next().ok_or_else(|| {
                    DeviceError::InvalidDescriptor("command schedule is shorter than its list".into())
                })?;

                self.apply_barriers(&list, &resources, &info.pre_barriers)?;
                match record.cmd {
                    Cmd::Compute(cmd) => self.record_compute(
                        &list,
                        &resources,
                        &shaders,
                        &tables,
                        bundle,
                        &heap,
                        upload.as_ref(),
                        &cmd,
                        info,
                    )?,
                    Cmd::Copy(cmd) => {
                        let src = resources
                            .get(ResourceHandle::from_bits(cmd.source))
                            .ok_or(DeviceError::StaleHandle)?;
                        let dst = resources
                            .get(ResourceHandle::from_bits(cmd.destination))
                            .ok_or(DeviceError::StaleHandle)?;
                        unsafe {
                            list.CopyBufferRegion(
                                &dst.resource,
                                0,
                                &src.resource,
                                0,
                                src.byte_size.min(dst.byte_size),
                            )
                        };
                    }
                    Cmd::Upload(cmd) => {
                        let upload = upload
                            .as_ref()
                            .ok_or(DeviceError::Unsupported("upload without an upload block"))?;
                        let mapped = upload
                            .mapped
                            .ok_or(DeviceError::Unsupported("upload heap is not mapped"))?;
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                cmd.data.as_ptr(),
                                mapped.add(info.upload_buffer_offset as usize),
                                cmd.data.len(),
                            );
                        }
                        let dst = resources
                            .get(ResourceHandle::from_bits(cmd.destination))
                            .ok_or(DeviceError::StaleHandle)?;
                        if !dst.is_buffer {
                            return Err(DeviceError::Unsupported(
                                "texture upload footprints on the D3D12 backend",
                            ));
                        }
                        unsafe {
                            list.CopyBufferRegion(
                                &dst.resource,
                                0,
                                &upload.resource,
                                info.upload_buffer_offset,
                                cmd.data.len() as u64,
                            )
                        };
                    }
                    Cmd::Download(cmd) => {
                        pending_downloads.push((
                            ResourceHandle::from_bits(cmd.source),
                            cmd.mip_level,
                            cmd.array_slice,
                        ));
                    }
                    Cmd::ClearAppendConsumeCounter(_) => {
                        return Err(DeviceError::Unsupported(
                            "append/consume counter clears on the D3D12 backend",
                        ));
                    }
                }
                self.apply_barriers(&list, &resources, &info.post_barriers)?;
            }
            unsafe { list.Close()? };
            recorded.push((allocator, list));
        }

        let native_lists: Vec<Option<ID3D12CommandList>> = recorded
            .iter()
            .map(|(_, list)| Some(list.cast::<ID3D12CommandList>().expect("command list cast")))
            .collect();
        unsafe {
            self.queue.ExecuteCommandLists(&native_lists);
            self.queue.Signal(&self.fence, fence_value)?;
        }
        debug!(fence_value, lists = lists.len(), ?work_type, "submitted bundle");

        s.ring.record(
            LiveAllocation { fence_value, command_buffers: recorded, events: Vec::new() },
            &mut s.ledger,
        );
        if let Some(upload) = upload {
            s.upload_heaps.push_back((fence_value, upload));
        }
        s.descriptor_heaps.push_back(DescriptorHeapWindow { heap, fence_value });

        Ok((fence_value, pending_downloads))
    }
}

fn create_compute_root_signature(device: &ID3D12Device) -> Result<ID3D12RootSignature, DeviceError> {
    let ranges = [
        D3D12_DESCRIPTOR_RANGE {
            RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_SRV,
            NumDescriptors: u32::MAX,
            BaseShaderRegister: 0,
            RegisterSpace: 0,
            OffsetInDescriptorsFromTableStart: 0,
        },
        D3D12_DESCRIPTOR_RANGE {
            RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_UAV,
            NumDescriptors: u32::MAX,
            BaseShaderRegister: 0,
            RegisterSpace: 0,
            OffsetInDescriptorsFromTableStart: 0,
        },
        D3D12_DESCRIPTOR_RANGE {
            RangeType: D3D12_DESCRIPTOR_RANGE_TYPE_CBV,
            NumDescriptors: u32::MAX,
            BaseShaderRegister: 0,
            RegisterSpace: 0,
            OffsetInDescriptorsFromTableStart: 0,
        },
    ];
    let parameters: Vec<D3D12_ROOT_PARAMETER> = ranges
        .iter()
        .map(|range| D3D12_ROOT_PARAMETER {
            ParameterType: D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE,
            Anonymous: D3D12_ROOT_PARAMETER_0 {
                DescriptorTable: D3D12_ROOT_DESCRIPTOR_TABLE {
                    NumDescriptorRanges: 1,
                    pDescriptorRanges: range,
                },
            },
            ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
        })
        .collect();
    let desc = D3D12_ROOT_SIGNATURE_DESC {
        NumParameters: parameters.len() as u32,
        pParameters: parameters.as_ptr(),
        ..Default::default()
    };

    unsafe {
        let mut blob = None;
        let mut error_blob = None;
        D3D12SerializeRootSignature(
            &desc,
            D3D_ROOT_SIGNATURE_VERSION_1,
            &mut blob,
            Some(&mut error_blob),
        )
        .map_err(|e| DeviceError::NoAdapter(format!("root signature serialization: {e}")))?;
        let blob: ID3DBlob = blob.expect("serialized root signature blob");
        let bytes = std::slice::from_raw_parts(
            blob.GetBufferPointer() as *const u8,
            blob.GetBufferSize(),
        );
        Ok(device.CreateRootSignature(0, bytes)?)
    }
}

impl Device for Dx12Device {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<ResourceHandle, DeviceError> {
        let (heap_type, initial_state) = if desc.mem_flags.contains(MemFlags::CPU_READ) {
            (D3D12_HEAP_TYPE_READBACK, D3D12_RESOURCE_STATE_COPY_DEST)
        } else if desc.mem_flags.contains(MemFlags::CPU_UPLOAD) {
            (D3D12_HEAP_TYPE_UPLOAD, D3D12_RESOURCE_STATE_GENERIC_READ)
        } else {
            (D3D12_HEAP_TYPE_DEFAULT, D3D12_RESOURCE_STATE_COMMON)
        };
        let resource = self.create_committed_buffer(
            desc.byte_size(),
            heap_type,
            initial_state,
            desc.mem_flags.contains(MemFlags::GPU_WRITE),
        )?;
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

    fn create_texture(&self, _desc: &TextureDesc) -> Result<ResourceHandle, DeviceError> {
        Err(DeviceError::Unsupported("textures on the D3D12 backend"))
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
        let pipeline_desc = D3D12_COMPUTE_PIPELINE_STATE_DESC {
            pRootSignature: std::mem::ManuallyDrop::new(Some(self.root_signature.clone())),
            CS: D3D12_SHADER_BYTECODE {
                pShaderBytecode: desc.bytecode.as_ptr() as *const _,
                BytecodeLength: desc.bytecode.len(),
            },
            ..Default::default()
        };
        let pipeline: ID3D12PipelineState =
            unsafe { self.device.CreateComputePipelineState(&pipeline_desc) }
                .map_err(|e| DeviceError::InvalidShader(format!("'{}': {e}", desc.name)))?;
        unsafe {
            let root = std::ptr::read(&pipeline_desc.pRootSignature);
            drop(std::mem::ManuallyDrop::into_inner(root));
        }
        Ok(self
            .shaders
            .write()
            .unwrap()
            .allocate(Dx12Shader { pipeline, name: desc.name.to_owned() }))
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
            Err(err @ (DeviceError::Dx12(_) | DeviceError::DeviceLost)) => {
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
                WaitStatus::Ok
            };
        };

        if self.completed_value() < fence_value {
            let wait_result = unsafe {
                if self.fence.SetEventOnCompletion(fence_value, self.fence_event).is_err() {
                    warn!("fence wait registration failed");
                    self.device_lost.store(true, Ordering::SeqCst);
                    return WaitStatus::DeviceLost;
                }
                let timeout = if timeout_ms < 0 { INFINITE } else { timeout_ms as u32 };
                WaitForSingleObject(self.fence_event, timeout)
            };
            if wait_result != WAIT_OBJECT_0 {
                return WaitStatus::Timeout;
            }
        }
        self.sweep_works(self.completed_value());
        WaitStatus::Ok
    }

    fn download_status(
        &self,
        work: WorkHandle,
        resource: ResourceHandle,
        mip_level: u32,
        array_slice: u32,
    ) -> DownloadStatus {
        let completed = self.completed_value();
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
        match res.mapped {
            Some(mapped) if res.is_buffer => {
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

impl Dx12Device {
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

impl Drop for Dx12Device {
    fn drop(&mut self) {
        // Drain the GPU before COM references unwind.
        let fence_value = {
            let s = self.submit.lock().unwrap();
            s.ring.current_fence_value()
        };
        unsafe {
            if self.completed_value() < fence_value
                && self.fence.SetEventOnCompletion(fence_value, self.fence_event).is_ok()
            {
                WaitForSingleObject(self.fence_event, INFINITE);
            }
            let _ = CloseHandle(self.fence_event);
        }
    }
}
