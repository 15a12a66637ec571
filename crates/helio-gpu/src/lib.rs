//! `helio-gpu` schedules user-recorded GPU compute work.
//!
//! A producer records [`CommandList`]s (dispatches, copies, uploads,
//! downloads) into the self-describing blob format of `helio-protocol`. A
//! [`Device`] validates a batch of lists against its resource registry into a
//! barrier-annotated [`WorkBundle`], draws transient memory from fence-gated
//! pools, records backend-native command buffers, and submits them against a
//! per-queue fence timeline. Once a bundle's fence retires, its downloads
//! become readable on the CPU and its recorded resource states are committed
//! back to the registry.
//!
//! The backend is chosen at build time: `vulkan` (default, via `ash`) or
//! `d3d12` (Windows, via the `windows` crate). Everything outside
//! [`backend`] is backend-agnostic.

pub mod backend;
mod bundle;
mod device;
mod download;
mod error;
mod handle;
mod list;
mod pool;
mod registry;
mod schedule;
mod timeline;

pub use bundle::{
    BarrierKind, CommandInfo, CommandLocation, GpuState, MemFlags, ProcessedList,
    ResourceBarrier, TableAllocation, WorkBundle, WorkResourceState, WorkType,
};
pub use device::{
    BufferDesc, Device, DeviceConfig, Format, ResourceTableDesc, ScheduleFlags, ShaderDesc,
    ShaderLayout, TextureDesc,
};
#[cfg(any(feature = "vulkan", all(windows, feature = "d3d12")))]
pub use device::create_device;
pub use download::{DownloadLedger, DownloadQuery, DownloadRecord};
pub use error::{
    CommitError, DeviceError, DownloadStatus, ScheduleError, ScheduleErrorKind, WaitStatus,
};
pub use handle::{
    HandleContainer, InResourceTable, OutResourceTable, RawHandle, ResourceHandle, ResourceTable,
    SamplerTable, ShaderHandle, TypedHandle, WorkHandle,
};
pub use list::{CommandList, ComputeCommand, DispatchSize};
pub use pool::{FencedRingPool, HeapFactory, HeapId, PoolAlloc, PoolHeap};
pub use registry::{ResourceInfo, ResourceKind, TableInfo, UnregisteredResource, WorkRegistry};
pub use schedule::CONSTANT_BUFFER_ALIGN;
pub use timeline::{FenceLedger, LiveAllocation, SubmissionRing};
