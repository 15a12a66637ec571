//! Schedule-ready artifacts: the validated `WorkBundle` and the barrier and
//! allocation records that annotate each command.

use std::collections::{HashMap, HashSet};

use crate::handle::{ResourceHandle, ResourceTable};

/// GPU pipeline state a resource can occupy. The builder is state-agnostic;
/// backends translate these through their own tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GpuState {
    #[default]
    Default,
    Uav,
    Srv,
    Cbv,
    CopySrc,
    CopyDst,
    IndirectArgs,
    Rtv,
    Present,
}

/// Resource memory placement flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemFlags(u32);

impl MemFlags {
    pub const GPU_READ: Self = Self(1 << 0);
    pub const GPU_WRITE: Self = Self(1 << 1);
    pub const CPU_READ: Self = Self(1 << 2);
    pub const CPU_UPLOAD: Self = Self(1 << 3);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for MemFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for MemFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Queue flavor a submission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkType {
    Graphics,
    Compute,
}

/// `(list, command)` coordinates inside one bundle. Split barriers use the
/// producer's location as the pairing key between their begin and end halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CommandLocation {
    pub list_index: usize,
    pub command_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// Transition that must complete before the command runs.
    Immediate,
    /// First half of a split barrier, announced at the producer.
    Begin,
    /// Second half of a split barrier, awaited at the consumer.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBarrier {
    pub resource: ResourceHandle,
    pub prev_state: GpuState,
    pub post_state: GpuState,
    pub kind: BarrierKind,
    /// Producer location; meaningful for `Begin`/`End` pairs.
    pub src_cmd_location: CommandLocation,
}

/// Per-command schedule entry: barriers around the command plus its transient
/// allocation offsets.
#[derive(Debug, Clone, Default)]
pub struct CommandInfo {
    /// Byte offset of the record inside its list blob.
    pub command_offset: usize,
    pub pre_barriers: Vec<ResourceBarrier>,
    pub post_barriers: Vec<ResourceBarrier>,
    /// Offset into the bundle's upload-heap block (uploads and inline
    /// constants share the block).
    pub upload_buffer_offset: u64,
    /// First slot of this command's constant buffers inside the bundle's CBV
    /// descriptor range.
    pub constant_buffer_table_offset: u32,
    pub constant_buffer_count: u32,
    /// Position of this command among the list's downloads.
    pub download_index: Option<u32>,
}

/// Schedule for one input list.
#[derive(Debug, Clone, Default)]
pub struct ProcessedList {
    pub list_index: usize,
    pub command_schedule: Vec<CommandInfo>,
    pub compute_commands: u32,
    pub download_commands: u32,
}

/// Final recorded state of a resource within a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkResourceState {
    pub state: GpuState,
    pub location: CommandLocation,
}

/// A table's slice of the bundle-wide descriptor range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableAllocation {
    pub offset: u32,
    pub count: u32,
}

/// The validated, schedule-ready artifact produced from one `schedule` call.
#[derive(Debug, Clone, Default)]
pub struct WorkBundle {
    pub processed_lists: Vec<ProcessedList>,
    pub states: HashMap<ResourceHandle, WorkResourceState>,
    pub table_allocations: HashMap<ResourceTable, TableAllocation>,
    pub resources_to_download: HashSet<ResourceHandle>,
    /// Total SRV/UAV descriptor slots reserved by tables.
    pub total_table_size: u32,
    /// Total CBV descriptor slots (explicit + inline).
    pub total_constant_buffers: u32,
    /// Bytes of upload heap the bundle consumes.
    pub total_upload_buffer_size: u64,
}

impl WorkBundle {
    /// Count of download commands across all lists (one per downloaded
    /// resource, by construction).
    pub fn download_count(&self) -> usize {
        self.resources_to_download.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_flags_compose() {
        let flags = MemFlags::GPU_READ | MemFlags::CPU_READ;
        assert!(flags.contains(MemFlags::GPU_READ));
        assert!(flags.contains(MemFlags::CPU_READ));
        assert!(!flags.contains(MemFlags::GPU_WRITE));
        assert!(MemFlags::empty().contains(MemFlags::empty()));
    }
}
