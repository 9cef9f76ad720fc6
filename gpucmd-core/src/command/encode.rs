/*! Translation of a validated command stream into backend commands.

The stream went through the validating replay when its command buffer was
finished, so this pass only tracks what the backend needs: the open pass,
the bound groups and buffers, and the usage changes to apply to resources.
!*/

use crate::{
    binding_model::PipelineLayout,
    command::{
        bind::{Binder, EntryPayload},
        commands::CommandRef,
        CommandStream,
    },
    resource::{Buffer, DeviceError},
    Label,
};

use hal::{CommandEncoder as _, ComputePass as _, Device as _, RenderPass as _};
use arrayvec::ArrayVec;
use wgt::{BufferAddress, TextureUsage};

use std::{iter, mem, sync::Arc};

enum ActivePass<A: hal::Api> {
    None,
    Compute(A::ComputePass),
    Render(A::RenderPass),
}

struct VertexState<A: hal::Api> {
    buffers: [Option<(Arc<Buffer<A>>, BufferAddress)>; wgt::MAX_VERTEX_INPUTS],
    index: Option<(Arc<Buffer<A>>, BufferAddress, wgt::IndexFormat)>,
}

fn buffer_binding<A: hal::Api>(buffer: &Buffer<A>, offset: BufferAddress) -> hal::BufferBinding<'_, A> {
    hal::BufferBinding {
        buffer: &*buffer.raw,
        offset,
        size: buffer.size - offset,
    }
}

/// Binds the groups the binder reported as needing a rebind.
unsafe fn rebind<A: hal::Api>(
    pass: &mut ActivePass<A>,
    layout: &PipelineLayout<A>,
    start: usize,
    payloads: &[EntryPayload<A>],
) {
    for (i, payload) in payloads.iter().enumerate() {
        let group = match payload.group {
            Some(ref group) => group,
            None => continue,
        };
        let index = (start + i) as u32;
        match *pass {
            ActivePass::Compute(ref mut raw) => unsafe {
                raw.set_bind_group(&layout.raw, index, &group.raw, &payload.dynamic_offsets)
            },
            ActivePass::Render(ref mut raw) => unsafe {
                raw.set_bind_group(&layout.raw, index, &group.raw, &payload.dynamic_offsets)
            },
            ActivePass::None => {}
        }
    }
}

/// Records `stream` into a new backend command buffer.
///
/// Explicit transitions and render pass attachments update the current
/// usage of the resources as they are encoded.
pub(crate) fn encode_stream<A: hal::Api>(
    device: &A::Device,
    stream: &mut CommandStream<A>,
    label: Label,
) -> Result<A::CommandBuffer, DeviceError> {
    profiling::scope!("encode_stream");
    log::trace!("Encoding command stream {:?}", label);

    let mut encoder =
        unsafe { device.create_command_encoder(&hal::CommandEncoderDescriptor { label })? };
    if let Err(error) = unsafe { encoder.begin_encoding(label) } {
        unsafe { device.destroy_command_encoder(encoder) };
        return Err(error);
    }

    let mut pass = ActivePass::<A>::None;
    let mut binder = Binder::<A>::new();
    let mut vertex = VertexState::<A> {
        buffers: Default::default(),
        index: None,
    };

    stream.reset();
    while let Some(command) = stream.next_command() {
        match command {
            CommandRef::BeginComputePass => {
                pass = ActivePass::Compute(unsafe { encoder.begin_compute_pass() });
            }
            CommandRef::EndComputePass => {
                if let ActivePass::Compute(raw) = mem::replace(&mut pass, ActivePass::None) {
                    unsafe { encoder.end_compute_pass(raw) };
                }
                binder.reset_expectations();
            }
            CommandRef::BeginRenderPass(desc) => {
                let barriers = desc
                    .attachment_textures()
                    .filter_map(|texture| {
                        let mut usage = texture.usage.lock();
                        if usage.is_frozen() {
                            return None;
                        }
                        let old = usage.set_internal(TextureUsage::OUTPUT_ATTACHMENT);
                        (old != TextureUsage::OUTPUT_ATTACHMENT).then(|| hal::TextureBarrier {
                            texture: &*texture.raw,
                            usage: old..TextureUsage::OUTPUT_ATTACHMENT,
                        })
                    })
                    .collect::<Vec<_>>();
                unsafe { encoder.transition_textures(barriers.into_iter()) };

                let color_attachments = desc
                    .color_attachments
                    .iter()
                    .map(|at| hal::ColorAttachment {
                        target: &*at.view.raw,
                        load_op: at.load_op,
                    })
                    .collect::<ArrayVec<_, { hal::MAX_COLOR_ATTACHMENTS }>>();
                let hal_desc = hal::RenderPassDescriptor {
                    label: Some(desc.label()),
                    extent: desc.extent,
                    color_attachments: &color_attachments,
                    depth_stencil_attachment: desc.depth_stencil_attachment.as_ref().map(|at| {
                        hal::DepthStencilAttachment {
                            target: &*at.view.raw,
                            depth_load_op: at.depth_load_op,
                            stencil_load_op: at.stencil_load_op,
                        }
                    }),
                };
                let mut raw = unsafe { encoder.begin_render_pass(&hal_desc) };

                // vertex state survives across passes
                if let Some((ref buffer, offset, format)) = vertex.index {
                    unsafe { raw.set_index_buffer(buffer_binding(buffer, offset), format) };
                }
                for (slot, bound) in vertex.buffers.iter().enumerate() {
                    if let Some((ref buffer, offset)) = *bound {
                        unsafe { raw.set_vertex_buffer(slot as u32, buffer_binding(buffer, offset)) };
                    }
                }
                pass = ActivePass::Render(raw);
            }
            CommandRef::EndRenderPass => {
                if let ActivePass::Render(raw) = mem::replace(&mut pass, ActivePass::None) {
                    unsafe { encoder.end_render_pass(raw) };
                }
                binder.reset_expectations();
            }
            CommandRef::CopyBufferToBuffer(cmd) => unsafe {
                encoder.copy_buffer_to_buffer(
                    &cmd.src.raw,
                    &cmd.dst.raw,
                    iter::once(hal::BufferCopy {
                        src_offset: cmd.src_offset,
                        dst_offset: cmd.dst_offset,
                        size: cmd.size,
                    }),
                );
            },
            CommandRef::CopyBufferToTexture(cmd) => unsafe {
                encoder.copy_buffer_to_texture(
                    &cmd.source.buffer.raw,
                    &cmd.destination.texture.raw,
                    iter::once(hal::BufferTextureCopy {
                        buffer_offset: cmd.source.offset,
                        row_pitch: cmd.source.row_pitch,
                        texture_mip_level: cmd.destination.mip_level,
                        texture_origin: cmd.destination.origin,
                        size: cmd.copy_size,
                    }),
                );
            },
            CommandRef::CopyTextureToBuffer(cmd) => unsafe {
                encoder.copy_texture_to_buffer(
                    &cmd.source.texture.raw,
                    &cmd.destination.buffer.raw,
                    iter::once(hal::BufferTextureCopy {
                        buffer_offset: cmd.destination.offset,
                        row_pitch: cmd.destination.row_pitch,
                        texture_mip_level: cmd.source.mip_level,
                        texture_origin: cmd.source.origin,
                        size: cmd.copy_size,
                    }),
                );
            },
            CommandRef::Dispatch(cmd) => {
                if let ActivePass::Compute(ref mut raw) = pass {
                    unsafe { raw.dispatch([cmd.x, cmd.y, cmd.z]) };
                }
            }
            CommandRef::DrawArrays(cmd) => {
                if let ActivePass::Render(ref mut raw) = pass {
                    unsafe {
                        raw.draw(
                            cmd.first_vertex,
                            cmd.vertex_count,
                            cmd.first_instance,
                            cmd.instance_count,
                        )
                    };
                }
            }
            CommandRef::DrawElements(cmd) => {
                if let ActivePass::Render(ref mut raw) = pass {
                    unsafe {
                        raw.draw_indexed(
                            cmd.first_index,
                            cmd.index_count,
                            cmd.first_instance,
                            cmd.instance_count,
                        )
                    };
                }
            }
            CommandRef::SetComputePipeline(pipeline) => {
                if let ActivePass::Compute(ref mut raw) = pass {
                    unsafe { raw.set_pipeline(&pipeline.raw) };
                }
                let (start, payloads) = binder.change_pipeline_layout(&pipeline.layout);
                unsafe { rebind(&mut pass, &pipeline.layout, start, payloads) };
            }
            CommandRef::SetRenderPipeline(pipeline) => {
                if let ActivePass::Render(ref mut raw) = pass {
                    unsafe { raw.set_pipeline(&pipeline.raw) };
                }
                let (start, payloads) = binder.change_pipeline_layout(&pipeline.layout);
                unsafe { rebind(&mut pass, &pipeline.layout, start, payloads) };
            }
            CommandRef::SetBindGroup {
                index,
                group,
                dynamic_offsets,
            } => {
                let layout = binder.pipeline_layout.clone();
                let (start, payloads) = binder.assign_group(index as usize, group, dynamic_offsets);
                if let Some(layout) = layout {
                    unsafe { rebind(&mut pass, &layout, start, payloads) };
                }
            }
            CommandRef::SetPushConstants {
                stages,
                offset,
                data,
            } => match pass {
                ActivePass::Compute(ref mut raw) => unsafe {
                    raw.set_push_constants(stages, offset, data)
                },
                ActivePass::Render(ref mut raw) => unsafe {
                    raw.set_push_constants(stages, offset, data)
                },
                ActivePass::None => {}
            },
            CommandRef::SetStencilReference(reference) => {
                if let ActivePass::Render(ref mut raw) = pass {
                    unsafe { raw.set_stencil_reference(reference) };
                }
            }
            CommandRef::SetBlendColor(color) => {
                if let ActivePass::Render(ref mut raw) = pass {
                    unsafe { raw.set_blend_constants(color) };
                }
            }
            CommandRef::SetScissorRect(rect) => {
                if let ActivePass::Render(ref mut raw) = pass {
                    unsafe {
                        raw.set_scissor_rect(&hal::Rect {
                            x: rect.x,
                            y: rect.y,
                            w: rect.width,
                            h: rect.height,
                        })
                    };
                }
            }
            CommandRef::SetIndexBuffer(cmd) => {
                if let ActivePass::Render(ref mut raw) = pass {
                    unsafe { raw.set_index_buffer(buffer_binding(&cmd.buffer, cmd.offset), cmd.format) };
                }
                vertex.index = Some((Arc::clone(&cmd.buffer), cmd.offset, cmd.format));
            }
            CommandRef::SetVertexBuffers {
                start_slot,
                buffers,
                offsets,
            } => {
                for (i, (buffer, &offset)) in buffers.iter().zip(offsets.iter()).enumerate() {
                    let slot = start_slot as usize + i;
                    if let ActivePass::Render(ref mut raw) = pass {
                        unsafe { raw.set_vertex_buffer(slot as u32, buffer_binding(buffer, offset)) };
                    }
                    if let Some(bound) = vertex.buffers.get_mut(slot) {
                        *bound = Some((Arc::clone(buffer), offset));
                    }
                }
            }
            CommandRef::TransitionBufferUsage(cmd) => {
                let transition = cmd.buffer.state.lock().usage.transition(cmd.usage);
                match transition {
                    Ok(old) => unsafe {
                        encoder.transition_buffers(iter::once(hal::BufferBarrier {
                            buffer: &*cmd.buffer.raw,
                            usage: old..cmd.usage,
                        }));
                    },
                    Err(error) => log::warn!(
                        "Skipping transition of buffer {:?}: {}",
                        cmd.buffer.label(),
                        error
                    ),
                }
            }
            CommandRef::TransitionTextureUsage(cmd) => {
                let transition = cmd.texture.usage.lock().transition(cmd.usage);
                match transition {
                    Ok(old) => unsafe {
                        encoder.transition_textures(iter::once(hal::TextureBarrier {
                            texture: &*cmd.texture.raw,
                            usage: old..cmd.usage,
                        }));
                    },
                    Err(error) => log::warn!(
                        "Skipping transition of texture {:?}: {}",
                        cmd.texture.label(),
                        error
                    ),
                }
            }
            CommandRef::PushDebugGroup(label) => unsafe { encoder.push_debug_group(label) },
            CommandRef::PopDebugGroup => unsafe { encoder.pop_debug_group() },
            CommandRef::InsertDebugMarker(label) => unsafe { encoder.insert_debug_marker(label) },
        }
    }
    stream.reset();

    let result = unsafe { encoder.end_encoding() };
    unsafe { device.destroy_command_encoder(encoder) };
    result
}
