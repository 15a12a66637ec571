//! Translates a built bundle into Vulkan command buffers: pipeline barriers
//! and event-paired split barriers, descriptor writes, dispatches, copies,
//! uploads and download bookkeeping.

use std::collections::HashMap;

use ash::vk;

use helio_protocol::{Cmd, ComputeCmd, Dispatch, ListReader};

use crate::bundle::{BarrierKind, CommandInfo, CommandLocation, GpuState, ProcessedList, ResourceBarrier};
use crate::error::DeviceError;
use crate::handle::{HandleContainer, ResourceHandle, ResourceTable, ShaderHandle};
use crate::pool::align_up;
use crate::registry::TableInfo;
use crate::schedule::CONSTANT_BUFFER_ALIGN;

use super::events::EventPool;
use super::pools::DescriptorSetPool;
use super::resources::{VulkanPayload, VulkanResource};
use super::shaders::{VulkanShader, CBV_SET, SRV_SET, UAV_SET};
use crate::timeline::FenceLedger;

pub(super) fn stage_mask(state: GpuState) -> vk::PipelineStageFlags {
    match state {
        GpuState::Default | GpuState::Present => vk::PipelineStageFlags::TOP_OF_PIPE,
        GpuState::Uav | GpuState::Srv | GpuState::Cbv => vk::PipelineStageFlags::COMPUTE_SHADER,
        GpuState::IndirectArgs => vk::PipelineStageFlags::DRAW_INDIRECT,
        GpuState::CopySrc | GpuState::CopyDst => vk::PipelineStageFlags::TRANSFER,
        GpuState::Rtv => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
    }
}

pub(super) fn access_mask(state: GpuState) -> vk::AccessFlags {
    match state {
        GpuState::Default => vk::AccessFlags::empty(),
        GpuState::Uav => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        GpuState::Srv => vk::AccessFlags::SHADER_READ,
        GpuState::Cbv => vk::AccessFlags::UNIFORM_READ,
        GpuState::CopySrc => vk::AccessFlags::TRANSFER_READ,
        GpuState::CopyDst => vk::AccessFlags::TRANSFER_WRITE,
        GpuState::IndirectArgs => vk::AccessFlags::INDIRECT_COMMAND_READ,
        GpuState::Rtv => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        GpuState::Present => vk::AccessFlags::MEMORY_READ,
    }
}

pub(super) fn image_layout(state: GpuState) -> vk::ImageLayout {
    match state {
        GpuState::Default | GpuState::Cbv => vk::ImageLayout::UNDEFINED,
        GpuState::Uav | GpuState::IndirectArgs => vk::ImageLayout::GENERAL,
        GpuState::Srv => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        GpuState::CopySrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        GpuState::CopyDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        GpuState::Rtv | GpuState::Present => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }
}

/// The bundle's slice of the upload ring: buffer, mapped block base and the
/// block's absolute offset inside the buffer.
pub(super) struct UploadBlock {
    pub buffer: vk::Buffer,
    pub mapped: *mut u8,
    pub base_offset: u64,
}

/// Everything command recording needs, borrowed for one submission.
pub(super) struct RecordContext<'a> {
    pub device: &'a ash::Device,
    pub resources: &'a HandleContainer<ResourceHandle, VulkanResource>,
    pub shaders: &'a HandleContainer<ShaderHandle, VulkanShader>,
    /// Table membership snapshot taken at submit time.
    pub tables: &'a HashMap<ResourceTable, TableInfo>,
    pub descriptor_pool: &'a mut DescriptorSetPool,
    pub event_pool: &'a mut EventPool,
    pub ledger: &'a mut FenceLedger,
    pub upload: Option<UploadBlock>,
    /// Locations whose events this submission owns, released on reap.
    pub used_events: Vec<CommandLocation>,
    /// Downloads recorded by this bundle, registered after submit.
    pub downloads: Vec<(ResourceHandle, u32, u32)>,
}

impl<'a> RecordContext<'a> {
    fn resource(&self, handle: ResourceHandle) -> Result<&'a VulkanResource, DeviceError> {
        self.resources.get(handle).ok_or(DeviceError::StaleHandle)
    }

    fn buffer_of(&self, handle: ResourceHandle) -> Result<(vk::Buffer, u64), DeviceError> {
        let res = self.resource(handle)?;
        match res.payload {
            VulkanPayload::Buffer { buffer } => Ok((buffer, res.byte_size)),
            VulkanPayload::Texture { .. } => {
                Err(DeviceError::Unsupported("texture bound where a buffer is required"))
            }
        }
    }

    fn write_buffer_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        let info = [vk::DescriptorBufferInfo { buffer, offset, range }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .buffer_info(&info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }
}

struct PendingWait {
    event: vk::Event,
    src_stages: vk::PipelineStageFlags,
    dst_stages: vk::PipelineStageFlags,
    buffers: Vec<vk::BufferMemoryBarrier<'static>>,
    images: Vec<vk::ImageMemoryBarrier<'static>>,
}

/// Records one command's barrier batch.
///
/// `Immediate` records group into a single pipeline barrier. `End` records
/// group per producer location and wait on that location's event. `Begin`
/// records union into a single set-event (they all originate at the command
/// being recorded). Same-state records are skipped.
pub(super) fn apply_barriers(
    ctx: &mut RecordContext<'_>,
    cb: vk::CommandBuffer,
    barriers: &[ResourceBarrier],
) -> Result<(), DeviceError> {
    if barriers.is_empty() {
        return Ok(());
    }

    let mut imm_buffers: Vec<vk::BufferMemoryBarrier<'static>> = Vec::new();
    let mut imm_images: Vec<vk::ImageMemoryBarrier<'static>> = Vec::new();
    let mut imm_src = vk::PipelineStageFlags::empty();
    let mut imm_dst = vk::PipelineStageFlags::empty();

    let mut set_event: Option<(CommandLocation, vk::Event, vk::PipelineStageFlags, bool)> = None;
    let mut waits: Vec<(CommandLocation, PendingWait)> = Vec::new();

    for b in barriers {
        if b.prev_state == b.post_state {
            continue;
        }

        if b.kind == BarrierKind::Begin {
            match &mut set_event {
                Some((location, _, stages, _)) => {
                    debug_assert_eq!(*location, b.src_cmd_location);
                    *stages |= stage_mask(b.prev_state);
                }
                None => {
                    let (event, recycled) = ctx.event_pool.acquire(b.src_cmd_location)?;
                    ctx.used_events.push(b.src_cmd_location);
                    set_event =
                        Some((b.src_cmd_location, event, stage_mask(b.prev_state), recycled));
                }
            }
            continue;
        }

        let resource = ctx.resource(b.resource)?;
        let (buffers, images, src_stages, dst_stages) = match b.kind {
            BarrierKind::End => {
                let index = match waits.iter().position(|(loc, _)| *loc == b.src_cmd_location) {
                    Some(index) => index,
                    None => {
                        let event = ctx.event_pool.find(b.src_cmd_location).ok_or_else(|| {
                            DeviceError::InvalidDescriptor(
                                "split barrier end without a matching begin".into(),
                            )
                        })?;
                        waits.push((
                            b.src_cmd_location,
                            PendingWait {
                                event,
                                src_stages: vk::PipelineStageFlags::empty(),
                                dst_stages: vk::PipelineStageFlags::empty(),
                                buffers: Vec::new(),
                                images: Vec::new(),
                            },
                        ));
                        waits.len() - 1
                    }
                };
                let wait = &mut waits[index].1;
                (&mut wait.buffers, &mut wait.images, &mut wait.src_stages, &mut wait.dst_stages)
            }
            BarrierKind::Immediate => {
                (&mut imm_buffers, &mut imm_images, &mut imm_src, &mut imm_dst)
            }
            BarrierKind::Begin => unreachable!(),
        };

        *src_stages |= stage_mask(b.prev_state);
        *dst_stages |= stage_mask(b.post_state);
        match resource.payload {
            VulkanPayload::Buffer { buffer } => buffers.push(
                vk::BufferMemoryBarrier::default()
                    .src_access_mask(access_mask(b.prev_state))
                    .dst_access_mask(access_mask(b.post_state))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE),
            ),
            VulkanPayload::Texture { image, subresource_range, .. } => images.push(
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(access_mask(b.prev_state))
                    .dst_access_mask(access_mask(b.post_state))
                    .old_layout(image_layout(b.prev_state))
                    .new_layout(image_layout(b.post_state))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(subresource_range),
            ),
        }
    }

    unsafe {
        if !imm_buffers.is_empty() || !imm_images.is_empty() {
            ctx.device.cmd_pipeline_barrier(
                cb,
                imm_src,
                imm_dst,
                vk::DependencyFlags::empty(),
                &[],
                &imm_buffers,
                &imm_images,
            );
        }
        for (_, wait) in &waits {
            ctx.device.cmd_wait_events(
                cb,
                &[wait.event],
                wait.src_stages,
                wait.dst_stages,
                &[],
                &wait.buffers,
                &wait.images,
            );
        }
        if let Some((_, event, stages, needs_reset)) = set_event {
            if needs_reset {
                ctx.device.cmd_reset_event(cb, event, stages);
            }
            ctx.device.cmd_set_event(cb, event, stages);
        }
    }
    Ok(())
}

fn record_compute(
    ctx: &mut RecordContext<'_>,
    cb: vk::CommandBuffer,
    cmd: &ComputeCmd<'_>,
    info: &CommandInfo,
) -> Result<(), DeviceError> {
    if !cmd.sampler_tables.is_empty() {
        return Err(DeviceError::Unsupported("sampler tables"));
    }
    let shader = ctx
        .shaders
        .get(ShaderHandle::from_bits(cmd.shader))
        .ok_or(DeviceError::StaleHandle)?;
    let sets = ctx.descriptor_pool.allocate(&shader.set_layouts, ctx.ledger)?;

    let write_table_bindings =
        |ctx: &RecordContext<'_>, raw_tables: helio_protocol::HandleSlice<'_>, set: vk::DescriptorSet, bound: u32| -> Result<u32, DeviceError> {
            let mut binding = 0u32;
            for raw in raw_tables.iter() {
                let table = ResourceTable::from_bits(raw);
                let table_info = ctx.tables.get(&table).ok_or(DeviceError::StaleHandle)?;
                for &member in &table_info.resources {
                    if binding >= bound {
                        return Err(DeviceError::InvalidDescriptor(format!(
                            "shader '{}' binds {} resources but the dispatch provides more",
                            shader.name, bound
                        )));
                    }
                    let (buffer, _) = ctx.buffer_of(member)?;
                    ctx.write_buffer_descriptor(
                        set,
                        binding,
                        vk::DescriptorType::STORAGE_BUFFER,
                        buffer,
                        0,
                        vk::WHOLE_SIZE,
                    );
                    binding += 1;
                }
            }
            Ok(binding)
        };

    write_table_bindings(ctx, cmd.in_tables, sets[SRV_SET], shader.layout.srv_count)?;
    write_table_bindings(ctx, cmd.out_tables, sets[UAV_SET], shader.layout.uav_count)?;

    if !cmd.inline_constant.is_empty() {
        let upload = ctx
            .upload
            .as_ref()
            .ok_or(DeviceError::Unsupported("inline constants without an upload block"))?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                cmd.inline_constant.as_ptr(),
                upload.mapped.add(info.upload_buffer_offset as usize),
                cmd.inline_constant.len(),
            );
        }
        ctx.write_buffer_descriptor(
            sets[CBV_SET],
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            upload.buffer,
            upload.base_offset + info.upload_buffer_offset,
            align_up(cmd.inline_constant.len() as u64, CONSTANT_BUFFER_ALIGN),
        );
    } else {
        for (binding, raw) in cmd.constants.iter().enumerate() {
            let (buffer, size) = ctx.buffer_of(ResourceHandle::from_bits(raw))?;
            ctx.write_buffer_descriptor(
                sets[CBV_SET],
                binding as u32,
                vk::DescriptorType::UNIFORM_BUFFER,
                buffer,
                0,
                size,
            );
        }
    }

    unsafe {
        ctx.device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, shader.pipeline);
        ctx.device.cmd_bind_descriptor_sets(
            cb,
            vk::PipelineBindPoint::COMPUTE,
            shader.pipeline_layout,
            0,
            &sets,
            &[],
        );
        match cmd.dispatch {
            Dispatch::Direct { x, y, z } => {
                ctx.device.cmd_dispatch(cb, x.max(1), y.max(1), z.max(1));
            }
            Dispatch::Indirect { args } => {
                let (buffer, _) = ctx.buffer_of(ResourceHandle::from_bits(args))?;
                ctx.device.cmd_dispatch_indirect(cb, buffer, 0);
            }
        }
    }
    Ok(())
}

fn record_copy(
    ctx: &mut RecordContext<'_>,
    cb: vk::CommandBuffer,
    source: ResourceHandle,
    destination: ResourceHandle,
) -> Result<(), DeviceError> {
    let src = ctx.resource(source)?;
    let dst = ctx.resource(destination)?;
    match (&src.payload, &dst.payload) {
        (VulkanPayload::Buffer { buffer: src_buffer }, VulkanPayload::Buffer { buffer: dst_buffer }) => {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: src.byte_size.min(dst.byte_size),
            };
            unsafe { ctx.device.cmd_copy_buffer(cb, *src_buffer, *dst_buffer, &[region]) };
            Ok(())
        }
        (
            VulkanPayload::Texture { image: src_image, extent, subresource_range: src_range },
            VulkanPayload::Texture { image: dst_image, subresource_range: dst_range, .. },
        ) => {
            let layers = src_range.layer_count.min(dst_range.layer_count);
            let subresource = vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: layers,
            };
            let region = vk::ImageCopy {
                src_subresource: subresource,
                src_offset: vk::Offset3D::default(),
                dst_subresource: subresource,
                dst_offset: vk::Offset3D::default(),
                extent: *extent,
            };
            unsafe {
                ctx.device.cmd_copy_image(
                    cb,
                    *src_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    *dst_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
            };
            Ok(())
        }
        _ => Err(DeviceError::Unsupported("copies between buffers and textures")),
    }
}

fn record_upload(
    ctx: &mut RecordContext<'_>,
    cb: vk::CommandBuffer,
    destination: ResourceHandle,
    data: &[u8],
    info: &CommandInfo,
) -> Result<(), DeviceError> {
    if data.is_empty() {
        return Ok(());
    }
    let upload = ctx
        .upload
        .as_ref()
        .ok_or(DeviceError::Unsupported("upload command without an upload block"))?;
    unsafe {
        core::ptr::copy_nonoverlapping(
            data.as_ptr(),
            upload.mapped.add(info.upload_buffer_offset as usize),
            data.len(),
        );
    }
    let src_offset = upload.base_offset + info.upload_buffer_offset;

    let dst = ctx.resource(destination)?;
    match &dst.payload {
        VulkanPayload::Buffer { buffer } => {
            let region = vk::BufferCopy {
                src_offset,
                dst_offset: 0,
                size: (data.len() as u64).min(dst.byte_size),
            };
            unsafe { ctx.device.cmd_copy_buffer(cb, upload.buffer, *buffer, &[region]) };
        }
        VulkanPayload::Texture { image, extent, .. } => {
            // Tightly packed rows; row-pitch-aligned footprints are the
            // extension point for adapters with stricter copy alignment.
            let region = vk::BufferImageCopy {
                buffer_offset: src_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: *extent,
            };
            unsafe {
                ctx.device.cmd_copy_buffer_to_image(
                    cb,
                    upload.buffer,
                    *image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
            };
        }
    }
    Ok(())
}

/// Walks one list's schedule and records it into `cb`. Pre-barriers, then the
/// command, then post-barriers, per entry.
pub(super) fn record_list(
    ctx: &mut RecordContext<'_>,
    cb: vk::CommandBuffer,
    list_data: &[u8],
    schedule: &ProcessedList,
) -> Result<(), DeviceError> {
    let reader = ListReader::new(list_data).map_err(|e| {
        DeviceError::InvalidDescriptor(format!("finalized list failed to re-parse: {e}"))
    })?;

    let mut entries = schedule.command_schedule.iter();
    for record in reader.commands() {
        let record = record.map_err(|e| {
            DeviceError::InvalidDescriptor(format!("finalized list failed to re-parse: {e}"))
        })?;
        let info = entries.next().ok_or_else(|| {
            DeviceError::InvalidDescriptor("command schedule is shorter than its list".into())
        })?;
        debug_assert_eq!(info.command_offset, record.offset);

        apply_barriers(ctx, cb, &info.pre_barriers)?;
        match record.cmd {
            Cmd::Compute(cmd) => record_compute(ctx, cb, &cmd, info)?,
            Cmd::Copy(cmd) => record_copy(
                ctx,
                cb,
                ResourceHandle::from_bits(cmd.source),
                ResourceHandle::from_bits(cmd.destination),
            )?,
            Cmd::Upload(cmd) => record_upload(
                ctx,
                cb,
                ResourceHandle::from_bits(cmd.destination),
                cmd.data,
                info,
            )?,
            Cmd::Download(cmd) => {
                ctx.downloads.push((
                    ResourceHandle::from_bits(cmd.source),
                    cmd.mip_level,
                    cmd.array_slice,
                ));
            }
            Cmd::ClearAppendConsumeCounter(cmd) => {
                let (buffer, _) = ctx.buffer_of(ResourceHandle::from_bits(cmd.source))?;
                unsafe {
                    ctx.device.cmd_fill_buffer(cb, buffer, u64::from(cmd.counter_offset), 4, 0)
                };
            }
        }
        apply_barriers(ctx, cb, &info.post_barriers)?;
    }

    if entries.next().is_some() {
        return Err(DeviceError::InvalidDescriptor(
            "command schedule is longer than its list".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_translation_tables_cover_transfer_and_shader_states() {
        assert_eq!(stage_mask(GpuState::CopySrc), vk::PipelineStageFlags::TRANSFER);
        assert_eq!(stage_mask(GpuState::Uav), vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(stage_mask(GpuState::IndirectArgs), vk::PipelineStageFlags::DRAW_INDIRECT);

        assert_eq!(access_mask(GpuState::Srv), vk::AccessFlags::SHADER_READ);
        assert_eq!(
            access_mask(GpuState::Uav),
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(access_mask(GpuState::CopyDst), vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(access_mask(GpuState::Default), vk::AccessFlags::empty());

        assert_eq!(image_layout(GpuState::Srv), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(image_layout(GpuState::Uav), vk::ImageLayout::GENERAL);
        assert_eq!(image_layout(GpuState::CopyDst), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }
}
