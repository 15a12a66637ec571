//! Bundle building: parse command lists, track per-resource GPU state, and
//! synthesize immediate and split barriers plus transient allocation budgets.
//!
//! `build` is atomic. It reads the registry under a shared lock and folds
//! every list into a [`WorkBundle`]; any violation aborts with a structured
//! error and nothing outside the registry is observable.

use std::collections::{HashMap, HashSet};

use helio_protocol::{Cmd, ComputeCmd, DecodeError, Dispatch, ListReader, LIST_HEADER_SIZE};

use crate::bundle::{
    BarrierKind, CommandInfo, CommandLocation, GpuState, MemFlags, ProcessedList,
    ResourceBarrier, TableAllocation, WorkBundle, WorkResourceState,
};
use crate::error::{ScheduleError, ScheduleErrorKind};
use crate::handle::{ResourceHandle, ResourceTable};
use crate::list::CommandList;
use crate::pool::align_up;
use crate::registry::{RegistryState, WorkRegistry};

/// Constant-buffer views must start at a 256-byte boundary.
pub const CONSTANT_BUFFER_ALIGN: u64 = 256;

/// Uploads keep word alignment inside the shared upload block.
const UPLOAD_COPY_ALIGN: u64 = 4;

/// A consumer at least this many commands after the producer (or in a later
/// list) gets a split barrier; anything closer gets an immediate one.
const SPLIT_BARRIER_MIN_GAP: usize = 2;

struct BuildContext<'a> {
    registry: &'a RegistryState,

    list_index: usize,
    command_index: usize,

    states: HashMap<ResourceHandle, WorkResourceState>,
    downloads: HashSet<ResourceHandle>,
    table_allocations: HashMap<ResourceTable, TableAllocation>,
    processed: Vec<ProcessedList>,
    total_table_size: u32,
    total_constant_buffers: u32,
    total_upload_buffer_size: u64,
}

impl<'a> BuildContext<'a> {
    fn new(registry: &'a RegistryState) -> Self {
        Self {
            registry,
            list_index: 0,
            command_index: 0,
            states: HashMap::new(),
            downloads: HashSet::new(),
            table_allocations: HashMap::new(),
            processed: Vec::new(),
            total_table_size: 0,
            total_constant_buffers: 0,
            total_upload_buffer_size: 0,
        }
    }

    fn begin_list(&mut self, list_index: usize) {
        self.list_index = list_index;
        self.processed.push(ProcessedList { list_index, ..ProcessedList::default() });
    }

    fn begin_command(&mut self, command_offset: usize) {
        let list = &mut self.processed[self.list_index];
        self.command_index = list.command_schedule.len();
        list.command_schedule.push(CommandInfo { command_offset, ..CommandInfo::default() });
    }

    fn current_list(&mut self) -> &mut ProcessedList {
        &mut self.processed[self.list_index]
    }

    fn current_command(&mut self) -> &mut CommandInfo {
        let command_index = self.command_index;
        &mut self.processed[self.list_index].command_schedule[command_index]
    }

    fn location(&self) -> CommandLocation {
        CommandLocation { list_index: self.list_index, command_index: self.command_index }
    }

    /// Resources named directly by a command must be registered (table
    /// members are covered by their table's registration instead).
    fn require_registered(&self, resource: ResourceHandle) -> Result<(), ScheduleError> {
        if self.registry.resources.contains_key(&resource) {
            return Ok(());
        }
        Err(ScheduleError::new(
            ScheduleErrorKind::InvalidResource,
            format!("command references unregistered resource {resource:?}"),
        ))
    }

    /// Core state machine: records `resource`'s transition into `new_state`
    /// at the current command, choosing between no barrier, an immediate one,
    /// or a split begin/end pair depending on how far back the previous touch
    /// was.
    fn transition_resource(
        &mut self,
        resource: ResourceHandle,
        new_state: GpuState,
    ) -> Result<(), ScheduleError> {
        let location = self.location();

        let Some(seen) = self.states.get(&resource).copied() else {
            let info = self.registry.resources.get(&resource).ok_or_else(|| {
                ScheduleError::new(
                    ScheduleErrorKind::ResourceStateNotFound,
                    format!("no registered state for resource {resource:?}"),
                )
            })?;
            let prev_state = info.gpu_state;
            self.states.insert(resource, WorkResourceState { state: new_state, location });
            if prev_state != new_state {
                self.current_command().pre_barriers.push(ResourceBarrier {
                    resource,
                    prev_state,
                    post_state: new_state,
                    kind: BarrierKind::Immediate,
                    src_cmd_location: location,
                });
            }
            return Ok(());
        };

        if seen.state != new_state {
            // A gap of at least two commands (or a list boundary) gives the
            // driver a window to overlap unrelated work, so the transition is
            // announced at the producer and awaited at the consumer. Closer
            // than that, a split pair buys nothing over an immediate barrier.
            let split = seen.location.list_index != location.list_index
                || location.command_index >= seen.location.command_index + SPLIT_BARRIER_MIN_GAP;
            if split {
                let src = seen.location;
                self.processed[src.list_index].command_schedule[src.command_index]
                    .post_barriers
                    .push(ResourceBarrier {
                        resource,
                        prev_state: seen.state,
                        post_state: new_state,
                        kind: BarrierKind::Begin,
                        src_cmd_location: src,
                    });
                self.current_command().pre_barriers.push(ResourceBarrier {
                    resource,
                    prev_state: seen.state,
                    post_state: new_state,
                    kind: BarrierKind::End,
                    src_cmd_location: src,
                });
            } else {
                self.current_command().pre_barriers.push(ResourceBarrier {
                    resource,
                    prev_state: seen.state,
                    post_state: new_state,
                    kind: BarrierKind::Immediate,
                    src_cmd_location: location,
                });
            }
        }

        let record = self.states.get_mut(&resource).unwrap();
        record.state = new_state;
        record.location = location;
        Ok(())
    }

    /// Transitions a table's members and reserves its descriptor range once
    /// per bundle.
    fn process_table(&mut self, table: ResourceTable) -> Result<(), ScheduleError> {
        let registry = self.registry;
        let info = registry.tables.get(&table).ok_or_else(|| {
            ScheduleError::new(
                ScheduleErrorKind::BadTableInfo,
                format!("no table information registered for {table:?}"),
            )
        })?;

        let new_state = if info.is_uav { GpuState::Uav } else { GpuState::Srv };
        for &r in &info.resources {
            self.transition_resource(r, new_state)?;
        }

        if !self.table_allocations.contains_key(&table) {
            let count = info.resources.len() as u32;
            self.table_allocations
                .insert(table, TableAllocation { offset: self.total_table_size, count });
            self.total_table_size += count;
        }
        Ok(())
    }

    fn process_compute(&mut self, cmd: &ComputeCmd<'_>) -> Result<(), ScheduleError> {
        for raw in cmd.in_tables.iter() {
            self.process_table(ResourceTable::from_bits(raw))?;
        }
        for raw in cmd.out_tables.iter() {
            self.process_table(ResourceTable::from_bits(raw))?;
        }
        // Samplers carry no GPU state and live in their own descriptor space;
        // registration is still mandatory.
        for raw in cmd.sampler_tables.iter() {
            let table = ResourceTable::from_bits(raw);
            if !self.registry.tables.contains_key(&table) {
                return Err(ScheduleError::new(
                    ScheduleErrorKind::BadTableInfo,
                    format!("no table information registered for sampler table {table:?}"),
                ));
            }
        }

        if !cmd.inline_constant.is_empty() {
            let aligned = align_up(cmd.inline_constant.len() as u64, CONSTANT_BUFFER_ALIGN);
            self.total_upload_buffer_size =
                align_up(self.total_upload_buffer_size, CONSTANT_BUFFER_ALIGN);
            let upload_offset = self.total_upload_buffer_size;
            self.total_upload_buffer_size += aligned;

            let cbv_offset = self.total_constant_buffers;
            self.total_constant_buffers += 1;

            let info = self.current_command();
            info.upload_buffer_offset = upload_offset;
            info.constant_buffer_table_offset = cbv_offset;
        } else if !cmd.constants.is_empty() {
            for raw in cmd.constants.iter() {
                let constant = ResourceHandle::from_bits(raw);
                self.require_registered(constant)?;
                self.transition_resource(constant, GpuState::Cbv)?;
            }
            let count = cmd.constants.len() as u32;
            let cbv_offset = self.total_constant_buffers;
            self.total_constant_buffers += count;

            let info = self.current_command();
            info.constant_buffer_count = count;
            info.constant_buffer_table_offset = cbv_offset;
        }

        if let Dispatch::Indirect { args } = cmd.dispatch {
            let args = ResourceHandle::from_bits(args);
            self.require_registered(args)?;
            self.transition_resource(args, GpuState::IndirectArgs)?;
        }

        self.current_list().compute_commands += 1;
        Ok(())
    }

    fn process_copy(
        &mut self,
        source: ResourceHandle,
        destination: ResourceHandle,
    ) -> Result<(), ScheduleError> {
        self.require_registered(source)?;
        self.require_registered(destination)?;
        self.transition_resource(source, GpuState::CopySrc)?;
        self.transition_resource(destination, GpuState::CopyDst)
    }

    fn process_upload(
        &mut self,
        destination: ResourceHandle,
        size: usize,
    ) -> Result<(), ScheduleError> {
        self.require_registered(destination)?;
        self.transition_resource(destination, GpuState::CopyDst)?;
        self.total_upload_buffer_size = align_up(self.total_upload_buffer_size, UPLOAD_COPY_ALIGN);
        let offset = self.total_upload_buffer_size;
        self.total_upload_buffer_size += size as u64;
        self.current_command().upload_buffer_offset = offset;
        Ok(())
    }

    fn process_download(&mut self, source: ResourceHandle) -> Result<(), ScheduleError> {
        let info = self.registry.resources.get(&source).ok_or_else(|| {
            ScheduleError::new(
                ScheduleErrorKind::InvalidResource,
                format!("download references unregistered resource {source:?}"),
            )
        })?;
        if !info.mem_flags.contains(MemFlags::CPU_READ) {
            return Err(ScheduleError::new(
                ScheduleErrorKind::ReadCpuFlagNotFound,
                format!("resource {source:?} requested for download lacks the CPU_READ memory flag"),
            ));
        }
        if !self.downloads.insert(source) {
            return Err(ScheduleError::new(
                ScheduleErrorKind::MultipleDownloadsOnSameResource,
                format!(
                    "resource {source:?} is downloaded more than once in this bundle; \
                     a resource may be downloaded at most once per schedule call"
                ),
            ));
        }

        let index = self.current_list().download_commands;
        self.current_command().download_index = Some(index);
        self.current_list().download_commands += 1;
        Ok(())
    }

    fn process_clear_counter(&mut self, source: ResourceHandle) -> Result<(), ScheduleError> {
        self.require_registered(source)?;
        // The counter is cleared with a transfer write at emission.
        self.transition_resource(source, GpuState::CopyDst)
    }

    fn finish(self) -> WorkBundle {
        WorkBundle {
            processed_lists: self.processed,
            states: self.states,
            table_allocations: self.table_allocations,
            resources_to_download: self.downloads,
            total_table_size: self.total_table_size,
            total_constant_buffers: self.total_constant_buffers,
            total_upload_buffer_size: self.total_upload_buffer_size,
        }
    }
}

fn corrupted(list_index: usize, err: DecodeError) -> ScheduleError {
    let message = match &err {
        DecodeError::UnknownSentinel { offset, value } => format!(
            "list {list_index}: unrecognized command sentinel 0x{value:08X} at offset {offset}"
        ),
        other => format!("list {list_index}: malformed command blob: {other}"),
    };
    ScheduleError::new(ScheduleErrorKind::CorruptedCommandListSentinel, message)
}

impl WorkRegistry {
    /// Validates `lists` against the registry and produces a schedule-ready
    /// bundle. Does not allocate a work handle; see
    /// [`WorkRegistry::insert_work`].
    pub fn build(&self, lists: &[&CommandList]) -> Result<WorkBundle, ScheduleError> {
        let registry = self.state.read().unwrap();
        let mut ctx = BuildContext::new(&registry);

        for (list_index, list) in lists.iter().enumerate() {
            if list.size() < LIST_HEADER_SIZE {
                return Err(ScheduleError::new(
                    ScheduleErrorKind::NullListFound,
                    format!("list at index {list_index} holds no recorded data"),
                ));
            }
            if !list.is_finalized() {
                return Err(ScheduleError::new(
                    ScheduleErrorKind::ListNotFinalized,
                    format!("list at index {list_index} was scheduled before finalize()"),
                ));
            }

            ctx.begin_list(list_index);
            let reader =
                ListReader::new(list.data()).map_err(|e| corrupted(list_index, e))?;
            for record in reader.commands() {
                let record = record.map_err(|e| corrupted(list_index, e))?;
                ctx.begin_command(record.offset);
                match record.cmd {
                    Cmd::Compute(cmd) => ctx.process_compute(&cmd)?,
                    Cmd::Copy(cmd) => ctx.process_copy(
                        ResourceHandle::from_bits(cmd.source),
                        ResourceHandle::from_bits(cmd.destination),
                    )?,
                    Cmd::Upload(cmd) => ctx.process_upload(
                        ResourceHandle::from_bits(cmd.destination),
                        cmd.data.len(),
                    )?,
                    Cmd::Download(cmd) => {
                        ctx.process_download(ResourceHandle::from_bits(cmd.source))?
                    }
                    Cmd::ClearAppendConsumeCounter(cmd) => {
                        ctx.process_clear_counter(ResourceHandle::from_bits(cmd.source))?
                    }
                }
            }
        }

        Ok(ctx.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceKind;

    fn registry_with_buffer(state: GpuState) -> (WorkRegistry, ResourceHandle) {
        let registry = WorkRegistry::new();
        let r = ResourceHandle::from_bits(0);
        registry.register_resource(
            r,
            ResourceKind::Buffer { element_count: 64, stride: 4, constant_buffer: false },
            MemFlags::GPU_READ | MemFlags::GPU_WRITE,
            state,
        );
        (registry, r)
    }

    #[test]
    fn non_finalized_list_is_rejected() {
        let (registry, r) = registry_with_buffer(GpuState::Default);
        let mut list = CommandList::new();
        list.write_copy(r, r);
        let err = registry.build(&[&list]).unwrap_err();
        assert_eq!(err.kind, ScheduleErrorKind::ListNotFinalized);
    }

    #[test]
    fn close_re_reference_gets_an_immediate_barrier() {
        let (registry, r) = registry_with_buffer(GpuState::CopySrc);
        let other = ResourceHandle::from_bits(1);
        registry.register_resource(
            other,
            ResourceKind::Buffer { element_count: 64, stride: 4, constant_buffer: false },
            MemFlags::GPU_READ | MemFlags::GPU_WRITE,
            GpuState::CopyDst,
        );

        // Command 0 reads `r`; command 1 writes it. One command apart, so the
        // transition must be an immediate barrier, not a split pair.
        let mut list = CommandList::new();
        list.write_copy(r, other);
        list.write_copy(other, r);
        list.finalize();

        let bundle = registry.build(&[&list]).unwrap();
        let schedule = &bundle.processed_lists[0].command_schedule;
        assert!(schedule[0].pre_barriers.is_empty());
        let pre: Vec<_> = schedule[1]
            .pre_barriers
            .iter()
            .filter(|b| b.resource == r)
            .collect();
        assert_eq!(pre.len(), 1);
        assert_eq!(pre[0].kind, BarrierKind::Immediate);
        assert_eq!(pre[0].prev_state, GpuState::CopySrc);
        assert_eq!(pre[0].post_state, GpuState::CopyDst);
        assert!(schedule[0].post_barriers.iter().all(|b| b.resource != r));
    }
}
