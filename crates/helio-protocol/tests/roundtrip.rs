//! Property tests for the wire format: whatever the encoder writes, the
//! parser reads back verbatim, for arbitrary payload shapes.

use helio_protocol::{
    patch_list_size, write_end_sentinel, write_list_header, Cmd, ComputeRecord, CopyRecord,
    Dispatch, DownloadRecord, ListReader, UploadRecord,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum AnyRecord {
    Compute {
        shader: u32,
        constants: Vec<u32>,
        inline_constant: Vec<u8>,
        in_tables: Vec<u32>,
        out_tables: Vec<u32>,
        xyz: (u32, u32, u32),
        debug_name: String,
    },
    Copy { source: u32, destination: u32 },
    Upload { destination: u32, data: Vec<u8> },
    Download { source: u32, mip_level: u32, array_slice: u32 },
}

fn any_record() -> impl Strategy<Value = AnyRecord> {
    prop_oneof![
        (
            any::<u32>(),
            proptest::collection::vec(any::<u32>(), 0..8),
            proptest::collection::vec(any::<u8>(), 0..64),
            proptest::collection::vec(any::<u32>(), 0..4),
            proptest::collection::vec(any::<u32>(), 0..4),
            (1u32..64, 1u32..64, 1u32..8),
            "[a-zA-Z0-9_]{0,24}",
        )
            .prop_map(
                |(shader, constants, inline_constant, in_tables, out_tables, xyz, debug_name)| {
                    AnyRecord::Compute {
                        shader,
                        constants,
                        inline_constant,
                        in_tables,
                        out_tables,
                        xyz,
                        debug_name,
                    }
                }
            ),
        (any::<u32>(), any::<u32>())
            .prop_map(|(source, destination)| AnyRecord::Copy { source, destination }),
        (any::<u32>(), proptest::collection::vec(any::<u8>(), 0..128))
            .prop_map(|(destination, data)| AnyRecord::Upload { destination, data }),
        (any::<u32>(), 0u32..16, 0u32..16).prop_map(|(source, mip_level, array_slice)| {
            AnyRecord::Download { source, mip_level, array_slice }
        }),
    ]
}

proptest! {
    #[test]
    fn encoded_lists_parse_back_to_the_same_sequence(
        records in proptest::collection::vec(any_record(), 0..12)
    ) {
        let mut buf = Vec::new();
        write_list_header(&mut buf);
        for r in &records {
            match r {
                AnyRecord::Compute {
                    shader, constants, inline_constant, in_tables, out_tables, xyz, debug_name,
                } => {
                    ComputeRecord {
                        shader: *shader,
                        constants,
                        inline_constant,
                        in_tables,
                        out_tables,
                        sampler_tables: &[],
                        dispatch: Dispatch::Direct { x: xyz.0, y: xyz.1, z: xyz.2 },
                        debug_name,
                    }
                    .encode(&mut buf);
                }
                AnyRecord::Copy { source, destination } => {
                    CopyRecord { source: *source, destination: *destination }.encode(&mut buf);
                }
                AnyRecord::Upload { destination, data } => {
                    UploadRecord { destination: *destination, data }.encode(&mut buf);
                }
                AnyRecord::Download { source, mip_level, array_slice } => {
                    DownloadRecord {
                        source: *source,
                        mip_level: *mip_level,
                        array_slice: *array_slice,
                    }
                    .encode(&mut buf);
                }
            }
        }
        write_end_sentinel(&mut buf);
        patch_list_size(&mut buf);

        let reader = ListReader::new(&buf).unwrap();
        let decoded: Vec<_> = reader.commands().collect::<Result<_, _>>().unwrap();
        prop_assert_eq!(decoded.len(), records.len());

        for (got, expected) in decoded.iter().zip(&records) {
            match (&got.cmd, expected) {
                (
                    Cmd::Compute(c),
                    AnyRecord::Compute {
                        shader, constants, inline_constant, in_tables, out_tables, xyz, debug_name,
                    },
                ) => {
                    prop_assert_eq!(c.shader, *shader);
                    prop_assert_eq!(&c.constants.iter().collect::<Vec<_>>(), constants);
                    prop_assert_eq!(c.inline_constant, &inline_constant[..]);
                    prop_assert_eq!(&c.in_tables.iter().collect::<Vec<_>>(), in_tables);
                    prop_assert_eq!(&c.out_tables.iter().collect::<Vec<_>>(), out_tables);
                    prop_assert_eq!(
                        c.dispatch,
                        Dispatch::Direct { x: xyz.0, y: xyz.1, z: xyz.2 }
                    );
                    prop_assert_eq!(c.debug_name, debug_name);
                }
                (Cmd::Copy(c), AnyRecord::Copy { source, destination }) => {
                    prop_assert_eq!(c.source, *source);
                    prop_assert_eq!(c.destination, *destination);
                }
                (Cmd::Upload(c), AnyRecord::Upload { destination, data }) => {
                    prop_assert_eq!(c.destination, *destination);
                    prop_assert_eq!(c.data, &data[..]);
                }
                (Cmd::Download(c), AnyRecord::Download { source, mip_level, array_slice }) => {
                    prop_assert_eq!(c.source, *source);
                    prop_assert_eq!(c.mip_level, *mip_level);
                    prop_assert_eq!(c.array_slice, *array_slice);
                }
                _ => prop_assert!(false, "decoded record kind does not match encoded kind"),
            }
        }
    }
}
