//! User-facing command list recording.
//!
//! A `CommandList` owns an append-only blob in the wire format defined by
//! `helio-protocol`. Recording is allocator-light: payloads are appended
//! inline behind each record's fixed header and referenced by list-relative
//! offsets, so replaying the same `write_*` sequence after `reset()` yields a
//! byte-identical blob.

use helio_protocol as protocol;

use crate::handle::{
    InResourceTable, OutResourceTable, ResourceHandle, SamplerTable, ShaderHandle,
};

/// Thread-group dimensions for a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSize {
    Direct { x: u32, y: u32, z: u32 },
    /// Thread-group counts are read from an argument buffer at execution.
    Indirect { args: ResourceHandle },
}

impl Default for DispatchSize {
    fn default() -> Self {
        DispatchSize::Direct { x: 1, y: 1, z: 1 }
    }
}

/// Description of one compute dispatch to record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputeCommand<'a> {
    pub shader: ShaderHandle,
    /// Explicit constant buffers; ignored when `inline_constant` is set.
    pub constants: &'a [ResourceHandle],
    /// Inline constant bytes uploaded through the per-bundle upload heap.
    pub inline_constant: &'a [u8],
    pub in_tables: &'a [InResourceTable],
    pub out_tables: &'a [OutResourceTable],
    pub sampler_tables: &'a [SamplerTable],
    pub dispatch: DispatchSize,
    pub debug_name: &'a str,
}

/// An append-only, finalizable command blob.
///
/// Recording methods panic if called after `finalize()`; that is an API
/// contract violation on the producer side, not a schedule-time error.
#[derive(Debug, Clone)]
pub struct CommandList {
    buf: Vec<u8>,
    finalized: bool,
}

impl Default for CommandList {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandList {
    pub fn new() -> Self {
        let mut buf = Vec::new();
        protocol::write_list_header(&mut buf);
        Self { buf, finalized: false }
    }

    fn assert_recording(&self) {
        assert!(!self.finalized, "command list is finalized; call reset() to record again");
    }

    /// Records a compute dispatch. Returns the record's offset in the blob.
    pub fn write_compute(&mut self, cmd: &ComputeCommand<'_>) -> usize {
        self.assert_recording();
        let constants: Vec<u32> = cmd.constants.iter().map(|h| h.to_bits()).collect();
        let in_tables: Vec<u32> = cmd.in_tables.iter().map(|t| t.to_bits()).collect();
        let out_tables: Vec<u32> = cmd.out_tables.iter().map(|t| t.to_bits()).collect();
        let sampler_tables: Vec<u32> = cmd.sampler_tables.iter().map(|t| t.to_bits()).collect();
        let dispatch = match cmd.dispatch {
            DispatchSize::Direct { x, y, z } => protocol::Dispatch::Direct { x, y, z },
            DispatchSize::Indirect { args } => protocol::Dispatch::Indirect { args: args.to_bits() },
        };
        protocol::ComputeRecord {
            shader: cmd.shader.to_bits(),
            constants: &constants,
            inline_constant: cmd.inline_constant,
            in_tables: &in_tables,
            out_tables: &out_tables,
            sampler_tables: &sampler_tables,
            dispatch,
            debug_name: cmd.debug_name,
        }
        .encode(&mut self.buf)
    }

    /// Records a whole-resource copy.
    pub fn write_copy(&mut self, source: ResourceHandle, destination: ResourceHandle) -> usize {
        self.assert_recording();
        protocol::CopyRecord {
            source: source.to_bits(),
            destination: destination.to_bits(),
        }
        .encode(&mut self.buf)
    }

    /// Records a CPU-to-GPU upload; `data` is captured into the blob.
    pub fn write_upload(&mut self, data: &[u8], destination: ResourceHandle) -> usize {
        self.assert_recording();
        protocol::UploadRecord { destination: destination.to_bits(), data }.encode(&mut self.buf)
    }

    /// Stores `data` in the blob for a deferred upload into `destination` and
    /// returns the offset of the staged bytes inside the list.
    pub fn upload_inline_resource(&mut self, destination: ResourceHandle, data: &[u8]) -> usize {
        let record_at = self.write_upload(data, destination);
        // The staged bytes sit right after the record's fixed header.
        record_at + protocol::UPLOAD_FIXED_SIZE
    }

    /// Records a download of mip 0, slice 0.
    pub fn write_download(&mut self, source: ResourceHandle) -> usize {
        self.write_download_region(source, 0, 0)
    }

    pub fn write_download_region(
        &mut self,
        source: ResourceHandle,
        mip_level: u32,
        array_slice: u32,
    ) -> usize {
        self.assert_recording();
        protocol::DownloadRecord { source: source.to_bits(), mip_level, array_slice }
            .encode(&mut self.buf)
    }

    /// Records a reset of a buffer's append/consume counter.
    pub fn write_clear_append_consume_counter(
        &mut self,
        source: ResourceHandle,
        counter_offset: u32,
    ) -> usize {
        self.assert_recording();
        protocol::ClearCounterRecord { source: source.to_bits(), counter_offset }
            .encode(&mut self.buf)
    }

    /// Writes the terminal sentinel and stamps the declared size. Idempotent.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        protocol::write_end_sentinel(&mut self.buf);
        protocol::patch_list_size(&mut self.buf);
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable view of the blob, for producers that patch payloads in place.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Clears all recorded commands and reopens the list for recording.
    pub fn reset(&mut self) {
        self.buf.clear();
        protocol::write_list_header(&mut self.buf);
        self.finalized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_protocol::{Cmd, ListReader};
    use pretty_assertions::assert_eq;

    fn handle(bits: u32) -> ResourceHandle {
        ResourceHandle::from_bits(bits)
    }

    #[test]
    fn finalize_stamps_size_and_is_idempotent() {
        let mut list = CommandList::new();
        list.write_copy(handle(1), handle(2));
        list.finalize();
        let size = list.size();
        list.finalize();
        assert_eq!(list.size(), size);
        assert!(list.is_finalized());

        let reader = ListReader::new(list.data()).unwrap();
        assert_eq!(reader.data().len(), size);
    }

    #[test]
    fn reset_then_replay_is_byte_identical() {
        let record = |list: &mut CommandList| {
            list.write_upload(&[1, 2, 3, 4, 5, 6, 7], handle(3));
            list.write_compute(&ComputeCommand {
                shader: ShaderHandle::from_bits(9),
                inline_constant: &[0xAA; 12],
                out_tables: &[OutResourceTable(crate::handle::ResourceTable::from_bits(4))],
                dispatch: DispatchSize::Direct { x: 2, y: 1, z: 1 },
                debug_name: "pass",
                ..Default::default()
            });
            list.write_download(handle(3));
            list.finalize();
        };

        let mut list = CommandList::new();
        record(&mut list);
        let first = list.data().to_vec();

        list.reset();
        assert!(!list.is_finalized());
        record(&mut list);
        assert_eq!(list.data(), &first[..]);
    }

    #[test]
    fn recorded_commands_decode_in_order() {
        let mut list = CommandList::new();
        list.write_upload(b"hello world\0", handle(7));
        list.write_compute(&ComputeCommand {
            shader: ShaderHandle::from_bits(1),
            constants: &[handle(7)],
            in_tables: &[InResourceTable(crate::handle::ResourceTable::from_bits(11))],
            out_tables: &[OutResourceTable(crate::handle::ResourceTable::from_bits(12))],
            dispatch: DispatchSize::Direct { x: 8, y: 8, z: 1 },
            debug_name: "abi-check",
            ..Default::default()
        });
        list.finalize();

        let reader = ListReader::new(list.data()).unwrap();
        let records: Vec<_> = reader.commands().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);

        let Cmd::Upload(up) = records[0].cmd else { panic!("expected upload") };
        assert_eq!(up.destination, 7);
        assert_eq!(up.data, b"hello world\0");

        let Cmd::Compute(c) = records[1].cmd else { panic!("expected compute") };
        assert_eq!(c.shader, 1);
        assert_eq!(c.constants.iter().collect::<Vec<_>>(), vec![7]);
        assert_eq!(c.in_tables.iter().collect::<Vec<_>>(), vec![11]);
        assert_eq!(c.out_tables.iter().collect::<Vec<_>>(), vec![12]);
        assert_eq!(c.debug_name, "abi-check");
    }

    #[test]
    fn inline_resource_upload_reports_payload_offset() {
        let mut list = CommandList::new();
        let payload = [5u8, 6, 7, 8];
        let offset = list.upload_inline_resource(handle(2), &payload);
        list.finalize();
        assert_eq!(&list.data()[offset..offset + payload.len()], &payload);
    }

    #[test]
    #[should_panic(expected = "finalized")]
    fn writing_after_finalize_panics() {
        let mut list = CommandList::new();
        list.finalize();
        list.write_copy(handle(1), handle(2));
    }
}
