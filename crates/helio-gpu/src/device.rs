//! Backend-agnostic device surface.
//!
//! The scheduler core never talks to a graphics API directly; it reaches the
//! active backend through [`Device`]. Backend selection is a build-time
//! choice (`vulkan` on by default, `d3d12` on Windows builds), so a binary
//! carries exactly one implementation.

use crate::bundle::MemFlags;
use crate::error::{DeviceError, DownloadStatus, ScheduleError, WaitStatus};
use crate::handle::{
    InResourceTable, OutResourceTable, ResourceHandle, ResourceTable, SamplerTable, ShaderHandle,
    WorkHandle,
};
use crate::list::CommandList;

/// Element formats for typed buffers and textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Rgba8Unorm,
    R32Uint,
    R32Sint,
    R32Float,
    Rg32Uint,
    Rgba32Uint,
    Rgba32Sint,
    Rgba32Float,
}

impl Format {
    pub fn byte_size(self) -> u32 {
        match self {
            Format::Rgba8Unorm | Format::R32Uint | Format::R32Sint | Format::R32Float => 4,
            Format::Rg32Uint => 8,
            Format::Rgba32Uint | Format::Rgba32Sint | Format::Rgba32Float => 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: Option<String>,
    pub mem_flags: MemFlags,
    pub format: Format,
    pub element_count: u32,
    /// Bytes per element; 0 means "use the format's size".
    pub stride: u32,
    pub constant_buffer: bool,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            name: None,
            mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
            format: Format::default(),
            element_count: 1,
            stride: 0,
            constant_buffer: false,
        }
    }
}

impl BufferDesc {
    pub fn byte_size(&self) -> u64 {
        let stride = if self.stride != 0 { self.stride } else { self.format.byte_size() };
        u64::from(stride) * u64::from(self.element_count)
    }
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub name: Option<String>,
    pub mem_flags: MemFlags,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_slices: u32,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            name: None,
            mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
            format: Format::default(),
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_slices: 1,
        }
    }
}

/// Ordered member list for an input/output/sampler table.
#[derive(Debug, Clone, Copy)]
pub struct ResourceTableDesc<'a> {
    pub name: Option<&'a str>,
    pub resources: &'a [ResourceHandle],
}

/// Compute shader registration. Compilation happens outside the scheduler;
/// the bytecode arrives backend-native (SPIR-V for Vulkan, DXIL for D3D12).
#[derive(Debug, Clone, Copy)]
pub struct ShaderDesc<'a> {
    pub name: &'a str,
    pub entry_point: &'a str,
    pub bytecode: &'a [u8],
    pub layout: ShaderLayout,
}

/// Register counts the shader binds, mirroring the HLSL register spaces:
/// `t` registers (read-only), `u` registers (read-write), `b` registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderLayout {
    pub srv_count: u32,
    pub uav_count: u32,
    pub cbv_count: u32,
}

/// Flags accepted by [`Device::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleFlags(u32);

impl ScheduleFlags {
    pub const NONE: Self = Self(0);
    /// Keep the work handle alive for `wait_on_cpu`/`download_status`; the
    /// caller owns it until `release_work`. Without this flag the handle is
    /// released automatically once its fence retires.
    pub const GET_WORK_HANDLE: Self = Self(1 << 0);

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for ScheduleFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Device construction knobs.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Index into the adapter enumeration; clamped to the available set.
    pub adapter_index: usize,
    /// First upload-heap size; later heaps grow geometrically.
    pub upload_pool_initial_size: u64,
    /// Bound on in-flight submissions before `schedule` blocks on the oldest
    /// fence.
    pub max_live_submissions: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            upload_pool_initial_size: 4 * 1024 * 1024,
            max_live_submissions: 16,
        }
    }
}

/// The capability set the scheduler exposes to collaborators.
pub trait Device: Send + Sync {
    fn create_buffer(&self, desc: &BufferDesc) -> Result<ResourceHandle, DeviceError>;
    fn create_texture(&self, desc: &TextureDesc) -> Result<ResourceHandle, DeviceError>;

    fn create_in_resource_table(
        &self,
        desc: &ResourceTableDesc<'_>,
    ) -> Result<InResourceTable, DeviceError>;
    fn create_out_resource_table(
        &self,
        desc: &ResourceTableDesc<'_>,
    ) -> Result<OutResourceTable, DeviceError>;
    fn create_sampler_table(
        &self,
        desc: &ResourceTableDesc<'_>,
    ) -> Result<SamplerTable, DeviceError>;

    fn register_shader(&self, desc: &ShaderDesc<'_>) -> Result<ShaderHandle, DeviceError>;

    /// Builds, submits and fences the given lists as one bundle.
    fn schedule(
        &self,
        lists: &[&CommandList],
        flags: ScheduleFlags,
    ) -> Result<WorkHandle, ScheduleError>;

    /// Blocks until the work's fence retires. Negative timeout waits forever.
    fn wait_on_cpu(&self, work: WorkHandle, timeout_ms: i64) -> WaitStatus;

    fn download_status(
        &self,
        work: WorkHandle,
        resource: ResourceHandle,
        mip_level: u32,
        array_slice: u32,
    ) -> DownloadStatus;

    /// Releases ignore stale handles.
    fn release_resource(&self, handle: ResourceHandle);
    fn release_table(&self, table: ResourceTable);
    fn release_work(&self, work: WorkHandle);
}

/// Creates a device on the backend this binary was built with.
#[cfg(feature = "vulkan")]
pub fn create_device(config: &DeviceConfig) -> Result<Box<dyn Device>, DeviceError> {
    Ok(Box::new(crate::backend::vulkan::VulkanDevice::new(config)?))
}

#[cfg(all(windows, feature = "d3d12", not(feature = "vulkan")))]
pub fn create_device(config: &DeviceConfig) -> Result<Box<dyn Device>, DeviceError> {
    Ok(Box::new(crate::backend::d3d12::Dx12Device::new(config)?))
}
