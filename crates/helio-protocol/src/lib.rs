//! Command-list wire ABI (producer encoder + consumer parser).
//!
//! A command list is a self-describing byte blob:
//! - a list header (`LIST_SENTINEL` + declared total size),
//! - a sequence of command records, each starting with
//!   `{ sentinel: u32, cmd_size: u32 }`,
//! - a terminal `CmdSentinel::EndList` word.
//!
//! `cmd_size` includes the 8-byte record header, so a consumer can skip a
//! record without understanding its payload. Variable-length payloads (handle
//! arrays, inline constants, debug names) live after the fixed header of each
//! record and are referenced by `{ count, offset }` pairs whose `offset` is
//! relative to the **list base**.
//!
//! The parser is intentionally conservative:
//! - every read is bounds-checked against the declared list size,
//! - all fields are decoded as explicit little-endian loads (no unaligned
//!   pointer casts into untrusted bytes),
//! - the sentinel set is closed; an unrecognized tag is an error, not a skip.

use core::fmt;

/// First word of every command list.
pub const LIST_SENTINEL: u32 = 0xC0A1_CAFE;

/// Size in bytes of the list header (`sentinel` + `command_list_size`).
pub const LIST_HEADER_SIZE: usize = 8;

/// Size in bytes of the per-record header (`sentinel` + `cmd_size`).
pub const RECORD_HEADER_SIZE: usize = 8;

/// Payloads and record sizes are kept 4-byte aligned so handle arrays can be
/// decoded with word loads.
pub const PAYLOAD_ALIGN: usize = 4;

/// Command record tags.
///
/// This is a closed set: adding a command means adding a variant here and a
/// decoder arm below, which keeps match exhaustiveness working for consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CmdSentinel {
    Compute = 0x1,
    Copy = 0x2,
    Upload = 0x3,
    Download = 0x4,
    ClearAppendConsumeCounter = 0x5,
    EndList = 0x6,
}

impl CmdSentinel {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x1 => Some(CmdSentinel::Compute),
            0x2 => Some(CmdSentinel::Copy),
            0x3 => Some(CmdSentinel::Upload),
            0x4 => Some(CmdSentinel::Download),
            0x5 => Some(CmdSentinel::ClearAppendConsumeCounter),
            0x6 => Some(CmdSentinel::EndList),
            _ => None,
        }
    }
}

/// Fixed portion of a compute record, in bytes.
pub const COMPUTE_FIXED_SIZE: usize = 80;
/// Fixed (and total) size of a copy record.
pub const COPY_FIXED_SIZE: usize = 16;
/// Fixed portion of an upload record.
pub const UPLOAD_FIXED_SIZE: usize = 20;
/// Fixed (and total) size of a download record.
pub const DOWNLOAD_FIXED_SIZE: usize = 20;
/// Fixed (and total) size of a clear-counter record.
pub const CLEAR_COUNTER_FIXED_SIZE: usize = 16;

/// A `{ count, offset }` payload reference. `offset` is relative to the list
/// base, never to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArrayRef {
    pub count: u32,
    pub offset: u32,
}

/// Dispatch dimensions for a compute record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Direct { x: u32, y: u32, z: u32 },
    /// Thread-group counts come from an argument buffer on the GPU.
    Indirect { args: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    BufferTooSmall,
    BadListSentinel(u32),
    BadListSize { declared: u32, actual: usize },
    UnknownSentinel { offset: usize, value: u32 },
    BadCmdSize { offset: usize, size: u32 },
    BadPayloadRange { offset: usize },
    BadDebugName { offset: usize },
    MissingEndSentinel,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::BufferTooSmall => write!(f, "buffer too small"),
            DecodeError::BadListSentinel(v) => {
                write!(f, "invalid command list sentinel 0x{v:08X}")
            }
            DecodeError::BadListSize { declared, actual } => write!(
                f,
                "declared command list size {declared} does not fit buffer of {actual} bytes"
            ),
            DecodeError::UnknownSentinel { offset, value } => {
                write!(f, "unrecognized command sentinel 0x{value:08X} at offset {offset}")
            }
            DecodeError::BadCmdSize { offset, size } => {
                write!(f, "invalid command size {size} at offset {offset}")
            }
            DecodeError::BadPayloadRange { offset } => {
                write!(f, "payload range out of bounds for command at offset {offset}")
            }
            DecodeError::BadDebugName { offset } => {
                write!(f, "debug name is not valid UTF-8 for command at offset {offset}")
            }
            DecodeError::MissingEndSentinel => {
                write!(f, "command list ends without an end sentinel")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, DecodeError> {
    let end = offset.checked_add(4).ok_or(DecodeError::BufferTooSmall)?;
    let slice = bytes.get(offset..end).ok_or(DecodeError::BufferTooSmall)?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_array_ref(bytes: &[u8], offset: usize) -> Result<ArrayRef, DecodeError> {
    Ok(ArrayRef {
        count: read_u32(bytes, offset)?,
        offset: read_u32(bytes, offset + 4)?,
    })
}

/// A borrowed array of 32-bit handles inside a list blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleSlice<'a> {
    bytes: &'a [u8],
}

impl<'a> HandleSlice<'a> {
    pub const EMPTY: HandleSlice<'static> = HandleSlice { bytes: &[] };

    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<u32> {
        let start = index.checked_mul(4)?;
        let slice = self.bytes.get(start..start + 4)?;
        Some(u32::from_le_bytes(slice.try_into().unwrap()))
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + 'a {
        self.bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
    }
}

/// Decoded compute record with payloads resolved against the list base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeCmd<'a> {
    pub shader: u32,
    pub constants: HandleSlice<'a>,
    pub inline_constant: &'a [u8],
    pub in_tables: HandleSlice<'a>,
    pub out_tables: HandleSlice<'a>,
    pub sampler_tables: HandleSlice<'a>,
    pub dispatch: Dispatch,
    pub debug_name: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyCmd {
    pub source: u32,
    pub destination: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadCmd<'a> {
    pub destination: u32,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadCmd {
    pub source: u32,
    pub mip_level: u32,
    pub array_slice: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearCounterCmd {
    pub source: u32,
    pub counter_offset: u32,
}

/// One decoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd<'a> {
    Compute(ComputeCmd<'a>),
    Copy(CopyCmd),
    Upload(UploadCmd<'a>),
    Download(DownloadCmd),
    ClearAppendConsumeCounter(ClearCounterCmd),
}

impl<'a> Cmd<'a> {
    pub fn sentinel(&self) -> CmdSentinel {
        match self {
            Cmd::Compute(_) => CmdSentinel::Compute,
            Cmd::Copy(_) => CmdSentinel::Copy,
            Cmd::Upload(_) => CmdSentinel::Upload,
            Cmd::Download(_) => CmdSentinel::Download,
            Cmd::ClearAppendConsumeCounter(_) => CmdSentinel::ClearAppendConsumeCounter,
        }
    }
}

/// A decoded record plus its byte offset inside the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView<'a> {
    pub offset: usize,
    pub cmd: Cmd<'a>,
}

/// Validated view over a finalized command list blob.
#[derive(Debug, Clone, Copy)]
pub struct ListReader<'a> {
    data: &'a [u8],
}

impl<'a> ListReader<'a> {
    /// Validates the header and declared size, without touching records.
    pub fn new(data: &'a [u8]) -> Result<Self, DecodeError> {
        let sentinel = read_u32(data, 0)?;
        if sentinel != LIST_SENTINEL {
            return Err(DecodeError::BadListSentinel(sentinel));
        }
        let declared = read_u32(data, 4)?;
        let declared_usize = declared as usize;
        if declared_usize < LIST_HEADER_SIZE + 4 || declared_usize > data.len() {
            return Err(DecodeError::BadListSize {
                declared,
                actual: data.len(),
            });
        }
        Ok(Self {
            data: &data[..declared_usize],
        })
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn commands(&self) -> CmdIter<'a> {
        CmdIter {
            data: self.data,
            offset: LIST_HEADER_SIZE,
            finished: false,
        }
    }
}

/// Iterator over the records of a list, ending at the end sentinel.
pub struct CmdIter<'a> {
    data: &'a [u8],
    offset: usize,
    finished: bool,
}

impl<'a> CmdIter<'a> {
    fn payload_bytes(&self, r: ArrayRef, elem_size: usize) -> Result<&'a [u8], DecodeError> {
        if r.count == 0 {
            return Ok(&[]);
        }
        let start = r.offset as usize;
        let len = (r.count as usize)
            .checked_mul(elem_size)
            .ok_or(DecodeError::BadPayloadRange { offset: self.offset })?;
        let end = start
            .checked_add(len)
            .ok_or(DecodeError::BadPayloadRange { offset: self.offset })?;
        self.data
            .get(start..end)
            .ok_or(DecodeError::BadPayloadRange { offset: self.offset })
    }

    fn handle_slice(&self, r: ArrayRef) -> Result<HandleSlice<'a>, DecodeError> {
        Ok(HandleSlice {
            bytes: self.payload_bytes(r, 4)?,
        })
    }

    fn decode_compute(&self, at: usize) -> Result<ComputeCmd<'a>, DecodeError> {
        let d = self.data;
        let constants = read_array_ref(d, at + 12)?;
        let inline_constant = read_array_ref(d, at + 20)?;
        let in_tables = read_array_ref(d, at + 28)?;
        let out_tables = read_array_ref(d, at + 36)?;
        let sampler_tables = read_array_ref(d, at + 44)?;
        let x = read_u32(d, at + 52)?;
        let y = read_u32(d, at + 56)?;
        let z = read_u32(d, at + 60)?;
        let is_indirect = read_u32(d, at + 64)?;
        let indirect_args = read_u32(d, at + 68)?;
        let debug_name = read_array_ref(d, at + 72)?;

        let name_bytes = self.payload_bytes(debug_name, 1)?;
        let debug_name = core::str::from_utf8(name_bytes)
            .map_err(|_| DecodeError::BadDebugName { offset: at })?;

        Ok(ComputeCmd {
            shader: read_u32(d, at + 8)?,
            constants: self.handle_slice(constants)?,
            inline_constant: self.payload_bytes(inline_constant, 1)?,
            in_tables: self.handle_slice(in_tables)?,
            out_tables: self.handle_slice(out_tables)?,
            sampler_tables: self.handle_slice(sampler_tables)?,
            dispatch: if is_indirect != 0 {
                Dispatch::Indirect { args: indirect_args }
            } else {
                Dispatch::Direct { x, y, z }
            },
            debug_name,
        })
    }
}

impl<'a> Iterator for CmdIter<'a> {
    type Item = Result<RecordView<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let at = self.offset;

        let sentinel = match read_u32(self.data, at) {
            Ok(v) => v,
            Err(_) => {
                self.finished = true;
                return Some(Err(DecodeError::MissingEndSentinel));
            }
        };
        let sentinel = match CmdSentinel::from_u32(sentinel) {
            Some(s) => s,
            None => {
                self.finished = true;
                return Some(Err(DecodeError::UnknownSentinel { offset: at, value: sentinel }));
            }
        };

        if sentinel == CmdSentinel::EndList {
            self.finished = true;
            return None;
        }

        let cmd_size = match read_u32(self.data, at + 4) {
            Ok(v) => v,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        let min_size = match sentinel {
            CmdSentinel::Compute => COMPUTE_FIXED_SIZE,
            CmdSentinel::Copy => COPY_FIXED_SIZE,
            CmdSentinel::Upload => UPLOAD_FIXED_SIZE,
            CmdSentinel::Download => DOWNLOAD_FIXED_SIZE,
            CmdSentinel::ClearAppendConsumeCounter => CLEAR_COUNTER_FIXED_SIZE,
            CmdSentinel::EndList => unreachable!(),
        };
        let size = cmd_size as usize;
        if size < min_size || size % PAYLOAD_ALIGN != 0 || at + size > self.data.len() {
            self.finished = true;
            return Some(Err(DecodeError::BadCmdSize { offset: at, size: cmd_size }));
        }

        let decoded: Result<Cmd<'a>, DecodeError> = match sentinel {
            CmdSentinel::Compute => self.decode_compute(at).map(Cmd::Compute),
            CmdSentinel::Copy => (|| {
                Ok(Cmd::Copy(CopyCmd {
                    source: read_u32(self.data, at + 8)?,
                    destination: read_u32(self.data, at + 12)?,
                }))
            })(),
            CmdSentinel::Upload => (|| {
                let destination = read_u32(self.data, at + 8)?;
                let source = read_array_ref(self.data, at + 12)?;
                Ok(Cmd::Upload(UploadCmd {
                    destination,
                    data: self.payload_bytes(source, 1)?,
                }))
            })(),
            CmdSentinel::Download => (|| {
                Ok(Cmd::Download(DownloadCmd {
                    source: read_u32(self.data, at + 8)?,
                    mip_level: read_u32(self.data, at + 12)?,
                    array_slice: read_u32(self.data, at + 16)?,
                }))
            })(),
            CmdSentinel::ClearAppendConsumeCounter => (|| {
                Ok(Cmd::ClearAppendConsumeCounter(ClearCounterCmd {
                    source: read_u32(self.data, at + 8)?,
                    counter_offset: read_u32(self.data, at + 12)?,
                }))
            })(),
            CmdSentinel::EndList => unreachable!(),
        };

        match decoded {
            Ok(cmd) => {
                self.offset = at + size;
                Some(Ok(RecordView { offset: at, cmd }))
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_array_ref(buf: &mut Vec<u8>, r: ArrayRef) {
    put_u32(buf, r.count);
    put_u32(buf, r.offset);
}

fn pad_to_align(buf: &mut Vec<u8>) {
    while buf.len() % PAYLOAD_ALIGN != 0 {
        buf.push(0);
    }
}

/// Appends the list header with a zero size; patch with [`patch_list_size`]
/// once the end sentinel is written.
pub fn write_list_header(buf: &mut Vec<u8>) {
    put_u32(buf, LIST_SENTINEL);
    put_u32(buf, 0);
}

/// Stamps the final list size into the header.
pub fn patch_list_size(buf: &mut [u8]) {
    let size = buf.len() as u32;
    buf[4..8].copy_from_slice(&size.to_le_bytes());
}

/// Appends the terminal sentinel.
pub fn write_end_sentinel(buf: &mut Vec<u8>) {
    put_u32(buf, CmdSentinel::EndList as u32);
}

fn append_handles(buf: &mut Vec<u8>, handles: &[u32]) -> ArrayRef {
    if handles.is_empty() {
        return ArrayRef::default();
    }
    let offset = buf.len() as u32;
    for &h in handles {
        put_u32(buf, h);
    }
    ArrayRef {
        count: handles.len() as u32,
        offset,
    }
}

fn append_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> ArrayRef {
    if bytes.is_empty() {
        return ArrayRef::default();
    }
    let offset = buf.len() as u32;
    buf.extend_from_slice(bytes);
    pad_to_align(buf);
    ArrayRef {
        count: bytes.len() as u32,
        offset,
    }
}

/// Borrowed description of a compute record to encode.
#[derive(Debug, Clone, Copy)]
pub struct ComputeRecord<'a> {
    pub shader: u32,
    pub constants: &'a [u32],
    pub inline_constant: &'a [u8],
    pub in_tables: &'a [u32],
    pub out_tables: &'a [u32],
    pub sampler_tables: &'a [u32],
    pub dispatch: Dispatch,
    pub debug_name: &'a str,
}

impl<'a> ComputeRecord<'a> {
    /// Appends the record (fixed header followed by its payloads) and returns
    /// the record's offset inside the list.
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let record_at = buf.len();

        // Fixed header placeholder; payload refs are patched in afterwards so
        // every offset stays list-base relative.
        put_u32(buf, CmdSentinel::Compute as u32);
        put_u32(buf, 0); // cmd_size
        put_u32(buf, self.shader);
        let refs_at = buf.len();
        for _ in 0..5 {
            put_array_ref(buf, ArrayRef::default());
        }
        let (x, y, z, is_indirect, indirect_args) = match self.dispatch {
            Dispatch::Direct { x, y, z } => (x, y, z, 0, 0),
            Dispatch::Indirect { args } => (0, 0, 0, 1, args),
        };
        put_u32(buf, x);
        put_u32(buf, y);
        put_u32(buf, z);
        put_u32(buf, is_indirect);
        put_u32(buf, indirect_args);
        put_array_ref(buf, ArrayRef::default()); // debug name
        debug_assert_eq!(buf.len() - record_at, COMPUTE_FIXED_SIZE);

        let constants = append_handles(buf, self.constants);
        let inline_constant = append_bytes(buf, self.inline_constant);
        let in_tables = append_handles(buf, self.in_tables);
        let out_tables = append_handles(buf, self.out_tables);
        let sampler_tables = append_handles(buf, self.sampler_tables);
        let debug_name = append_bytes(buf, self.debug_name.as_bytes());

        let patch = |buf: &mut Vec<u8>, at: usize, r: ArrayRef| {
            buf[at..at + 4].copy_from_slice(&r.count.to_le_bytes());
            buf[at + 4..at + 8].copy_from_slice(&r.offset.to_le_bytes());
        };
        patch(buf, refs_at, constants);
        patch(buf, refs_at + 8, inline_constant);
        patch(buf, refs_at + 16, in_tables);
        patch(buf, refs_at + 24, out_tables);
        patch(buf, refs_at + 32, sampler_tables);
        patch(buf, record_at + 72, debug_name);

        let cmd_size = (buf.len() - record_at) as u32;
        buf[record_at + 4..record_at + 8].copy_from_slice(&cmd_size.to_le_bytes());
        record_at
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CopyRecord {
    pub source: u32,
    pub destination: u32,
}

impl CopyRecord {
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let record_at = buf.len();
        put_u32(buf, CmdSentinel::Copy as u32);
        put_u32(buf, COPY_FIXED_SIZE as u32);
        put_u32(buf, self.source);
        put_u32(buf, self.destination);
        record_at
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UploadRecord<'a> {
    pub destination: u32,
    pub data: &'a [u8],
}

impl<'a> UploadRecord<'a> {
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let record_at = buf.len();
        put_u32(buf, CmdSentinel::Upload as u32);
        put_u32(buf, 0);
        put_u32(buf, self.destination);
        put_array_ref(buf, ArrayRef::default());
        debug_assert_eq!(buf.len() - record_at, UPLOAD_FIXED_SIZE);

        let source = append_bytes(buf, self.data);
        buf[record_at + 12..record_at + 16].copy_from_slice(&source.count.to_le_bytes());
        buf[record_at + 16..record_at + 20].copy_from_slice(&source.offset.to_le_bytes());

        let cmd_size = (buf.len() - record_at) as u32;
        buf[record_at + 4..record_at + 8].copy_from_slice(&cmd_size.to_le_bytes());
        record_at
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadRecord {
    pub source: u32,
    pub mip_level: u32,
    pub array_slice: u32,
}

impl DownloadRecord {
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let record_at = buf.len();
        put_u32(buf, CmdSentinel::Download as u32);
        put_u32(buf, DOWNLOAD_FIXED_SIZE as u32);
        put_u32(buf, self.source);
        put_u32(buf, self.mip_level);
        put_u32(buf, self.array_slice);
        record_at
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClearCounterRecord {
    pub source: u32,
    pub counter_offset: u32,
}

impl ClearCounterRecord {
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let record_at = buf.len();
        put_u32(buf, CmdSentinel::ClearAppendConsumeCounter as u32);
        put_u32(buf, CLEAR_COUNTER_FIXED_SIZE as u32);
        put_u32(buf, self.source);
        put_u32(buf, self.counter_offset);
        record_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn finalized(build: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut buf = Vec::new();
        write_list_header(&mut buf);
        build(&mut buf);
        write_end_sentinel(&mut buf);
        patch_list_size(&mut buf);
        buf
    }

    #[test]
    fn empty_list_decodes_to_no_commands() {
        let blob = finalized(|_| {});
        let reader = ListReader::new(&blob).unwrap();
        assert_eq!(reader.commands().count(), 0);
    }

    #[test]
    fn header_is_validated() {
        let mut blob = finalized(|_| {});
        blob[0] ^= 0xFF;
        assert!(matches!(
            ListReader::new(&blob),
            Err(DecodeError::BadListSentinel(_))
        ));

        let blob = finalized(|_| {});
        // Declared size larger than the buffer.
        let mut oversized = blob.clone();
        oversized[4..8].copy_from_slice(&((blob.len() + 8) as u32).to_le_bytes());
        assert!(matches!(
            ListReader::new(&oversized),
            Err(DecodeError::BadListSize { .. })
        ));
    }

    #[test]
    fn copy_round_trips() {
        let blob = finalized(|buf| {
            CopyRecord { source: 7, destination: 9 }.encode(buf);
        });
        let reader = ListReader::new(&blob).unwrap();
        let records: Vec<_> = reader.commands().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].offset, LIST_HEADER_SIZE);
        assert_eq!(
            records[0].cmd,
            Cmd::Copy(CopyCmd { source: 7, destination: 9 })
        );
    }

    #[test]
    fn compute_round_trips_with_payloads() {
        let constants = [11u32, 12];
        let inline = [1u8, 2, 3, 4, 5];
        let in_tables = [21u32];
        let out_tables = [31u32, 32, 33];
        let blob = finalized(|buf| {
            ComputeRecord {
                shader: 99,
                constants: &constants,
                inline_constant: &inline,
                in_tables: &in_tables,
                out_tables: &out_tables,
                sampler_tables: &[],
                dispatch: Dispatch::Direct { x: 8, y: 4, z: 1 },
                debug_name: "fill",
            }
            .encode(buf);
        });

        let reader = ListReader::new(&blob).unwrap();
        let records: Vec<_> = reader.commands().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 1);
        let Cmd::Compute(cmd) = records[0].cmd else {
            panic!("expected a compute record");
        };
        assert_eq!(cmd.shader, 99);
        assert_eq!(cmd.constants.iter().collect::<Vec<_>>(), vec![11, 12]);
        assert_eq!(cmd.inline_constant, &inline);
        assert_eq!(cmd.in_tables.iter().collect::<Vec<_>>(), vec![21]);
        assert_eq!(cmd.out_tables.iter().collect::<Vec<_>>(), vec![31, 32, 33]);
        assert!(cmd.sampler_tables.is_empty());
        assert_eq!(cmd.dispatch, Dispatch::Direct { x: 8, y: 4, z: 1 });
        assert_eq!(cmd.debug_name, "fill");
    }

    #[test]
    fn upload_and_download_round_trip() {
        let payload = [9u8, 8, 7];
        let blob = finalized(|buf| {
            UploadRecord { destination: 5, data: &payload }.encode(buf);
            DownloadRecord { source: 5, mip_level: 2, array_slice: 1 }.encode(buf);
            ClearCounterRecord { source: 6, counter_offset: 16 }.encode(buf);
        });

        let reader = ListReader::new(&blob).unwrap();
        let records: Vec<_> = reader.commands().collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0].cmd,
            Cmd::Upload(UploadCmd { destination: 5, data: &payload })
        );
        assert_eq!(
            records[1].cmd,
            Cmd::Download(DownloadCmd { source: 5, mip_level: 2, array_slice: 1 })
        );
        assert_eq!(
            records[2].cmd,
            Cmd::ClearAppendConsumeCounter(ClearCounterCmd { source: 6, counter_offset: 16 })
        );
        // Records stay 4-byte aligned even with a 3-byte upload payload.
        for r in &records {
            assert_eq!(r.offset % PAYLOAD_ALIGN, 0);
        }
    }

    #[test]
    fn unknown_sentinel_is_an_error_not_a_skip() {
        let mut blob = finalized(|buf| {
            CopyRecord { source: 1, destination: 2 }.encode(buf);
        });
        blob[LIST_HEADER_SIZE..LIST_HEADER_SIZE + 4].copy_from_slice(&0xBEEFu32.to_le_bytes());
        let reader = ListReader::new(&blob).unwrap();
        let err = reader.commands().next().unwrap().unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownSentinel { offset: LIST_HEADER_SIZE, value: 0xBEEF }
        );
    }

    #[test]
    fn truncated_record_is_rejected() {
        let blob = finalized(|buf| {
            CopyRecord { source: 1, destination: 2 }.encode(buf);
        });
        // Chop off the end sentinel and part of the record, then re-declare the
        // shorter size so the header still validates.
        let mut truncated = blob[..LIST_HEADER_SIZE + 4].to_vec();
        patch_list_size(&mut truncated);
        let reader = ListReader::new(&truncated).unwrap();
        let err = reader.commands().next().unwrap().unwrap_err();
        assert!(matches!(
            err,
            DecodeError::BufferTooSmall | DecodeError::BadCmdSize { .. }
        ));
    }

    #[test]
    fn payload_range_outside_list_is_rejected() {
        let mut blob = finalized(|buf| {
            UploadRecord { destination: 5, data: &[1, 2, 3, 4] }.encode(buf);
        });
        // Point the source payload past the end of the list.
        let at = LIST_HEADER_SIZE;
        let blob_len = blob.len() as u32;
        blob[at + 16..at + 20].copy_from_slice(&blob_len.to_le_bytes());
        let reader = ListReader::new(&blob).unwrap();
        let err = reader.commands().next().unwrap().unwrap_err();
        assert!(matches!(err, DecodeError::BadPayloadRange { .. }));
    }
}
