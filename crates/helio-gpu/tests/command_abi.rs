//! Wire-level checks of recorded command lists: a consumer that only knows
//! the record headers can walk the blob, and every payload lands at the
//! offset its `{count, offset}` reference declares.

use helio_gpu::{
    CommandList, ComputeCommand, DispatchSize, InResourceTable, OutResourceTable, ResourceHandle,
    ResourceTable, ShaderHandle,
};
use helio_protocol::{CmdSentinel, COMPUTE_FIXED_SIZE, LIST_HEADER_SIZE, LIST_SENTINEL};
use pretty_assertions::assert_eq;

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

#[test]
fn recorded_blob_walks_by_record_sizes() {
    let cbuffer = ResourceHandle::from_bits(3);
    let in_table = InResourceTable(ResourceTable::from_bits(4));
    let out_table = OutResourceTable(ResourceTable::from_bits(5));
    let payload = b"hello world\0";

    let mut list = CommandList::new();
    list.write_upload(payload, cbuffer);
    list.write_compute(&ComputeCommand {
        shader: ShaderHandle::from_bits(9),
        constants: &[cbuffer],
        in_tables: &[in_table],
        out_tables: &[out_table],
        dispatch: DispatchSize::Direct { x: 8, y: 8, z: 1 },
        debug_name: "testDispatch",
        ..Default::default()
    });
    list.finalize();
    let data = list.data();

    // List header: sentinel plus the final patched size.
    assert_eq!(read_u32(data, 0), LIST_SENTINEL);
    assert_eq!(read_u32(data, 4) as usize, list.size());

    // Upload record.
    let mut offset = LIST_HEADER_SIZE;
    assert_eq!(read_u32(data, offset), CmdSentinel::Upload as u32);
    let upload_size = read_u32(data, offset + 4) as usize;
    assert_eq!(read_u32(data, offset + 8), cbuffer.to_bits());
    let source_count = read_u32(data, offset + 12) as usize;
    let source_offset = read_u32(data, offset + 16) as usize;
    assert_eq!(source_count, payload.len());
    assert_eq!(&data[source_offset..source_offset + source_count], payload);

    // Compute record, reached purely by skipping `cmd_size`.
    offset += upload_size;
    assert_eq!(read_u32(data, offset), CmdSentinel::Compute as u32);
    let compute_size = read_u32(data, offset + 4) as usize;
    assert!(compute_size >= COMPUTE_FIXED_SIZE);
    assert_eq!(read_u32(data, offset + 8), 9, "shader handle");

    let constants_count = read_u32(data, offset + 12);
    let constants_offset = read_u32(data, offset + 16) as usize;
    assert_eq!(constants_count, 1);
    assert_eq!(read_u32(data, constants_offset), cbuffer.to_bits());

    let in_count = read_u32(data, offset + 28);
    let in_offset = read_u32(data, offset + 32) as usize;
    assert_eq!(in_count, 1);
    assert_eq!(read_u32(data, in_offset), in_table.to_bits());

    let out_count = read_u32(data, offset + 36);
    let out_offset = read_u32(data, offset + 40) as usize;
    assert_eq!(out_count, 1);
    assert_eq!(read_u32(data, out_offset), out_table.to_bits());

    assert_eq!(read_u32(data, offset + 52), 8);
    assert_eq!(read_u32(data, offset + 56), 8);
    assert_eq!(read_u32(data, offset + 60), 1);

    let name_len = read_u32(data, offset + 72) as usize;
    let name_offset = read_u32(data, offset + 76) as usize;
    assert_eq!(&data[name_offset..name_offset + name_len], b"testDispatch");

    // Terminal sentinel right behind the last record.
    offset += compute_size;
    assert_eq!(read_u32(data, offset), CmdSentinel::EndList as u32);
    assert_eq!(offset + 4, list.size());
}

#[test]
fn every_record_offset_is_word_aligned() {
    let r = ResourceHandle::from_bits(1);
    let mut list = CommandList::new();
    // A 5-byte payload forces padding before the next record.
    list.write_upload(&[1, 2, 3, 4, 5], r);
    list.write_copy(r, r);
    list.write_download(r);
    list.finalize();

    let reader = helio_protocol::ListReader::new(list.data()).unwrap();
    for record in reader.commands() {
        let record = record.unwrap();
        assert_eq!(record.offset % 4, 0);
    }
}
