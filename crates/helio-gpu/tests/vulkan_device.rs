//! End-to-end submission against a real Vulkan adapter.
//!
//! These tests need a working ICD. Without one they skip with a note;
//! `HELIO_REQUIRE_GPU=1` turns the skip into a failure for machines that are
//! supposed to have a device.

#![cfg(feature = "vulkan")]

use helio_gpu::{
    create_device, BufferDesc, CommandList, Device, DeviceConfig, DownloadStatus, Format,
    MemFlags, ScheduleFlags, WaitStatus,
};

fn require_gpu() -> bool {
    std::env::var("HELIO_REQUIRE_GPU").is_ok_and(|v| {
        let v = v.trim();
        v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
    })
}

fn device_or_skip(test_name: &str) -> Option<Box<dyn Device>> {
    match create_device(&DeviceConfig::default()) {
        Ok(device) => Some(device),
        Err(e) => {
            if require_gpu() {
                panic!("HELIO_REQUIRE_GPU is set but {test_name} cannot run: {e}");
            }
            eprintln!("skipping {test_name}: {e}");
            None
        }
    }
}

#[test]
fn upload_copy_download_round_trips_bytes() {
    let Some(device) = device_or_skip("upload_copy_download_round_trips_bytes") else {
        return;
    };

    let element_count = 64u32;
    let staging = device
        .create_buffer(&BufferDesc {
            name: Some("scratch".into()),
            mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
            format: Format::R32Uint,
            element_count,
            ..Default::default()
        })
        .unwrap();
    let readback = device
        .create_buffer(&BufferDesc {
            name: Some("readback".into()),
            mem_flags: MemFlags::CPU_READ,
            format: Format::R32Uint,
            element_count,
            ..Default::default()
        })
        .unwrap();

    let values: Vec<u32> = (0..element_count).map(|i| i * 3 + 7).collect();
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

    let mut list = CommandList::new();
    list.write_upload(&bytes, staging);
    list.write_copy(staging, readback);
    list.write_download(readback);
    list.finalize();

    let work = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE).unwrap();
    assert_eq!(device.wait_on_cpu(work, -1), WaitStatus::Ok);

    match device.download_status(work, readback, 0, 0) {
        DownloadStatus::Ready { data } => {
            assert_eq!(&data[..bytes.len()], &bytes[..]);
        }
        other => panic!("expected a ready download, got {other:?}"),
    }

    device.release_work(work);
    assert_eq!(device.download_status(work, readback, 0, 0), DownloadStatus::Invalid);
    device.release_resource(staging);
    device.release_resource(readback);
}

#[test]
fn fences_retire_across_consecutive_schedules() {
    let Some(device) = device_or_skip("fences_retire_across_consecutive_schedules") else {
        return;
    };

    let buffer = device
        .create_buffer(&BufferDesc {
            mem_flags: MemFlags::GPU_READ | MemFlags::GPU_WRITE,
            format: Format::R32Uint,
            element_count: 16,
            ..Default::default()
        })
        .unwrap();

    let mut works = Vec::new();
    for round in 0u32..4 {
        let payload: Vec<u8> = (0..64).map(|i| (i as u8).wrapping_add(round as u8)).collect();
        let mut list = CommandList::new();
        list.write_upload(&payload, buffer);
        list.finalize();
        works.push(device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE).unwrap());
    }

    for work in works {
        assert_eq!(device.wait_on_cpu(work, 10_000), WaitStatus::Ok);
        device.release_work(work);
    }
    device.release_resource(buffer);
}

#[test]
fn waiting_on_a_released_handle_is_harmless() {
    let Some(device) = device_or_skip("waiting_on_a_released_handle_is_harmless") else {
        return;
    };

    let mut list = CommandList::new();
    list.finalize();
    let work = device.schedule(&[&list], ScheduleFlags::GET_WORK_HANDLE).unwrap();
    assert_eq!(device.wait_on_cpu(work, -1), WaitStatus::Ok);
    device.release_work(work);
    device.release_work(work);
    assert_eq!(device.wait_on_cpu(work, 0), WaitStatus::Ok);
}
