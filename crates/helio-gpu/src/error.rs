use core::fmt;

/// Why a `schedule` call rejected its input.
///
/// Build errors abort atomically: no work handle is allocated and the
/// resource registry is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleErrorKind {
    /// A list slot held no recorded data.
    NullListFound,
    /// A list was scheduled before `finalize()`.
    ListNotFinalized,
    /// The blob contained an unrecognized or malformed record.
    CorruptedCommandListSentinel,
    /// A referenced resource table is not registered.
    BadTableInfo,
    /// A state transition targeted a resource with no registered state.
    ResourceStateNotFound,
    /// A command referenced an unregistered resource.
    InvalidResource,
    /// A download targeted a resource without the `CPU_READ` memory flag.
    ReadCpuFlagNotFound,
    /// The same resource was downloaded twice in one bundle.
    MultipleDownloadsOnSameResource,
}

impl fmt::Display for ScheduleErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduleErrorKind::NullListFound => "null list found",
            ScheduleErrorKind::ListNotFinalized => "list not finalized",
            ScheduleErrorKind::CorruptedCommandListSentinel => "corrupted command list sentinel",
            ScheduleErrorKind::BadTableInfo => "bad table info",
            ScheduleErrorKind::ResourceStateNotFound => "resource state not found",
            ScheduleErrorKind::InvalidResource => "invalid resource",
            ScheduleErrorKind::ReadCpuFlagNotFound => "read CPU flag not found",
            ScheduleErrorKind::MultipleDownloadsOnSameResource => {
                "multiple downloads on same resource"
            }
        };
        f.write_str(name)
    }
}

/// Structured failure from `schedule`: a stable kind plus a human-readable
/// message naming the offending list, command or handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleError {
    pub kind: ScheduleErrorKind,
    pub message: String,
}

impl ScheduleError {
    pub fn new(kind: ScheduleErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ScheduleError {}

/// Outcome of a CPU-side wait on a work handle's fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Ok,
    Timeout,
    DeviceLost,
}

impl WaitStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, WaitStatus::Ok)
    }
}

/// Outcome of a download query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStatus {
    /// The fence retired; the readback bytes are an owned copy of the mapped
    /// staging memory.
    Ready { data: Vec<u8> },
    /// The work's fence has not retired yet; retry later.
    NotReady,
    /// Unknown `(work, resource)` pair, mismatched subresource, or released
    /// work handle.
    Invalid,
}

impl DownloadStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, DownloadStatus::Ready { .. })
    }
}

/// Failure committing a bundle's recorded states back into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitError {
    UnknownWork,
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::UnknownWork => write!(f, "work handle is stale or unknown"),
        }
    }
}

impl std::error::Error for CommitError {}

/// Device-level failures (resource creation, shader registration, backend
/// bring-up).
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no compatible GPU adapter found: {0}")]
    NoAdapter(String),
    #[error("device lost")]
    DeviceLost,
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("stale or unknown handle")]
    StaleHandle,
    #[error("shader rejected: {0}")]
    InvalidShader(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[cfg(feature = "vulkan")]
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] ash::vk::Result),
    #[cfg(all(windows, feature = "d3d12"))]
    #[error("d3d12 call failed: {0}")]
    Dx12(#[from] windows::core::Error),
}
