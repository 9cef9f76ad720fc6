use crate::{
    binding_model::BindGroup,
    command::{
        allocator::{CommandAllocator, CommandIterator},
        render::RenderPassDescriptor,
        transfer::{BufferCopyView, TextureCopyView},
    },
    pipeline::{ComputePipeline, RenderPipeline},
    resource::{Buffer, Texture},
};

use std::{fmt, marker::PhantomData, ptr, sync::Arc};

/// Tag of every record in a command stream.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    BeginComputePass,
    BeginRenderPass,
    CopyBufferToBuffer,
    CopyBufferToTexture,
    CopyTextureToBuffer,
    Dispatch,
    DrawArrays,
    DrawElements,
    EndComputePass,
    EndRenderPass,
    SetComputePipeline,
    SetRenderPipeline,
    SetPushConstants,
    SetStencilReference,
    SetBlendColor,
    SetScissorRect,
    SetBindGroup,
    SetIndexBuffer,
    SetVertexBuffers,
    TransitionBufferUsage,
    TransitionTextureUsage,
    PushDebugGroup,
    PopDebugGroup,
    InsertDebugMarker,
}

impl Command {
    const ALL: [Self; 24] = [
        Self::BeginComputePass,
        Self::BeginRenderPass,
        Self::CopyBufferToBuffer,
        Self::CopyBufferToTexture,
        Self::CopyTextureToBuffer,
        Self::Dispatch,
        Self::DrawArrays,
        Self::DrawElements,
        Self::EndComputePass,
        Self::EndRenderPass,
        Self::SetComputePipeline,
        Self::SetRenderPipeline,
        Self::SetPushConstants,
        Self::SetStencilReference,
        Self::SetBlendColor,
        Self::SetScissorRect,
        Self::SetBindGroup,
        Self::SetIndexBuffer,
        Self::SetVertexBuffers,
        Self::TransitionBufferUsage,
        Self::TransitionTextureUsage,
        Self::PushDebugGroup,
        Self::PopDebugGroup,
        Self::InsertDebugMarker,
    ];

    pub(crate) fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub(crate) fn id(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub(crate) struct BeginComputePassCmd;

#[derive(Debug)]
pub(crate) struct BeginRenderPassCmd<A: hal::Api> {
    pub desc: Arc<RenderPassDescriptor<A>>,
}

#[derive(Debug)]
pub(crate) struct CopyBufferToBufferCmd<A: hal::Api> {
    pub src: Arc<Buffer<A>>,
    pub src_offset: wgt::BufferAddress,
    pub dst: Arc<Buffer<A>>,
    pub dst_offset: wgt::BufferAddress,
    pub size: wgt::BufferAddress,
}

#[derive(Debug)]
pub(crate) struct CopyBufferToTextureCmd<A: hal::Api> {
    pub source: BufferCopyView<A>,
    pub destination: TextureCopyView<A>,
    pub copy_size: wgt::Extent3d,
}

#[derive(Debug)]
pub(crate) struct CopyTextureToBufferCmd<A: hal::Api> {
    pub source: TextureCopyView<A>,
    pub destination: BufferCopyView<A>,
    pub copy_size: wgt::Extent3d,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct DispatchCmd {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct DrawArraysCmd {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct DrawElementsCmd {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub first_instance: u32,
}

#[derive(Debug)]
pub(crate) struct EndComputePassCmd;

#[derive(Debug)]
pub(crate) struct EndRenderPassCmd;

#[derive(Debug)]
pub(crate) struct SetComputePipelineCmd<A: hal::Api> {
    pub pipeline: Arc<ComputePipeline<A>>,
}

#[derive(Debug)]
pub(crate) struct SetRenderPipelineCmd<A: hal::Api> {
    pub pipeline: Arc<RenderPipeline<A>>,
}

/// Followed by `count` values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SetPushConstantsCmd {
    pub stages: wgt::ShaderStage,
    pub offset: u32,
    pub count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SetStencilReferenceCmd {
    pub reference: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SetBlendColorCmd {
    pub color: wgt::Color,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SetScissorRectCmd {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Followed by the dynamic offsets when `dynamic_offset_count` is not zero.
#[derive(Debug)]
pub(crate) struct SetBindGroupCmd<A: hal::Api> {
    pub index: u32,
    pub group: Arc<BindGroup<A>>,
    pub dynamic_offset_count: u32,
}

#[derive(Debug)]
pub(crate) struct SetIndexBufferCmd<A: hal::Api> {
    pub buffer: Arc<Buffer<A>>,
    pub offset: wgt::BufferAddress,
    pub format: wgt::IndexFormat,
}

/// Followed by `count` buffers, then `count` offsets.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SetVertexBuffersCmd {
    pub start_slot: u32,
    pub count: u32,
}

#[derive(Debug)]
pub(crate) struct TransitionBufferUsageCmd<A: hal::Api> {
    pub buffer: Arc<Buffer<A>>,
    pub usage: wgt::BufferUsage,
}

#[derive(Debug)]
pub(crate) struct TransitionTextureUsageCmd<A: hal::Api> {
    pub texture: Arc<Texture<A>>,
    pub usage: wgt::TextureUsage,
}

/// Followed by `length` bytes of UTF-8.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct DebugMarkerCmd {
    pub length: u32,
}

#[derive(Debug)]
pub(crate) struct PopDebugGroupCmd;

/// A decoded record, borrowing from the stream.
#[derive(Debug)]
pub(crate) enum CommandRef<'a, A: hal::Api> {
    BeginComputePass,
    BeginRenderPass(&'a Arc<RenderPassDescriptor<A>>),
    CopyBufferToBuffer(&'a CopyBufferToBufferCmd<A>),
    CopyBufferToTexture(&'a CopyBufferToTextureCmd<A>),
    CopyTextureToBuffer(&'a CopyTextureToBufferCmd<A>),
    Dispatch(DispatchCmd),
    DrawArrays(DrawArraysCmd),
    DrawElements(DrawElementsCmd),
    EndComputePass,
    EndRenderPass,
    SetComputePipeline(&'a Arc<ComputePipeline<A>>),
    SetRenderPipeline(&'a Arc<RenderPipeline<A>>),
    SetPushConstants {
        stages: wgt::ShaderStage,
        offset: u32,
        data: &'a [u32],
    },
    SetStencilReference(u32),
    SetBlendColor(wgt::Color),
    SetScissorRect(SetScissorRectCmd),
    SetBindGroup {
        index: u32,
        group: &'a Arc<BindGroup<A>>,
        dynamic_offsets: &'a [wgt::DynamicOffset],
    },
    SetIndexBuffer(&'a SetIndexBufferCmd<A>),
    SetVertexBuffers {
        start_slot: u32,
        buffers: &'a [Arc<Buffer<A>>],
        offsets: &'a [wgt::BufferAddress],
    },
    TransitionBufferUsage(&'a TransitionBufferUsageCmd<A>),
    TransitionTextureUsage(&'a TransitionTextureUsageCmd<A>),
    PushDebugGroup(&'a str),
    PopDebugGroup,
    InsertDebugMarker(&'a str),
}

impl<A: hal::Api> CommandRef<'_, A> {
    pub(crate) fn kind(&self) -> Command {
        match *self {
            Self::BeginComputePass => Command::BeginComputePass,
            Self::BeginRenderPass(_) => Command::BeginRenderPass,
            Self::CopyBufferToBuffer(_) => Command::CopyBufferToBuffer,
            Self::CopyBufferToTexture(_) => Command::CopyBufferToTexture,
            Self::CopyTextureToBuffer(_) => Command::CopyTextureToBuffer,
            Self::Dispatch(_) => Command::Dispatch,
            Self::DrawArrays(_) => Command::DrawArrays,
            Self::DrawElements(_) => Command::DrawElements,
            Self::EndComputePass => Command::EndComputePass,
            Self::EndRenderPass => Command::EndRenderPass,
            Self::SetComputePipeline(_) => Command::SetComputePipeline,
            Self::SetRenderPipeline(_) => Command::SetRenderPipeline,
            Self::SetPushConstants { .. } => Command::SetPushConstants,
            Self::SetStencilReference(_) => Command::SetStencilReference,
            Self::SetBlendColor(_) => Command::SetBlendColor,
            Self::SetScissorRect(_) => Command::SetScissorRect,
            Self::SetBindGroup { .. } => Command::SetBindGroup,
            Self::SetIndexBuffer(_) => Command::SetIndexBuffer,
            Self::SetVertexBuffers { .. } => Command::SetVertexBuffers,
            Self::TransitionBufferUsage(_) => Command::TransitionBufferUsage,
            Self::TransitionTextureUsage(_) => Command::TransitionTextureUsage,
            Self::PushDebugGroup(_) => Command::PushDebugGroup,
            Self::PopDebugGroup => Command::PopDebugGroup,
            Self::InsertDebugMarker(_) => Command::InsertDebugMarker,
        }
    }
}

pub(crate) fn record_debug_marker(allocator: &mut CommandAllocator, command: Command, label: &str) {
    allocator.allocate(
        command.id(),
        DebugMarkerCmd {
            length: label.len() as u32,
        },
    );
    allocator.allocate_data(label.as_bytes());
}

/// An owned stream of command records, typed by the backend its resources live on.
///
/// Every record is dropped exactly once when the stream is dropped.
pub struct CommandStream<A: hal::Api> {
    iter: CommandIterator,
    _marker: PhantomData<A>,
}

impl<A: hal::Api> fmt::Debug for CommandStream<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("empty", &self.iter.is_empty())
            .finish()
    }
}

impl<A: hal::Api> Default for CommandStream<A> {
    fn default() -> Self {
        Self::new(CommandIterator::default())
    }
}

impl<A: hal::Api> CommandStream<A> {
    /// Takes ownership of records written with the types of this module for backend `A`.
    pub(crate) fn new(iter: CommandIterator) -> Self {
        Self {
            iter,
            _marker: PhantomData,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.iter.reset();
    }

    pub fn is_empty(&self) -> bool {
        self.iter.is_empty()
    }

    /// Decodes the next record.
    pub(crate) fn next_command(&mut self) -> Option<CommandRef<'_, A>> {
        let id = self.iter.next_command_id()?;
        let command = match Command::from_id(id) {
            Some(command) => command,
            None => {
                debug_assert!(false, "unknown command tag {}", id);
                return None;
            }
        };
        let iter = &mut self.iter;
        // The readers below mirror the writers in `CommandBufferBuilder`.
        let decoded = unsafe {
            match command {
                Command::BeginComputePass => {
                    iter.next_command::<BeginComputePassCmd>();
                    CommandRef::BeginComputePass
                }
                Command::BeginRenderPass => {
                    CommandRef::BeginRenderPass(&iter.next_command::<BeginRenderPassCmd<A>>().desc)
                }
                Command::CopyBufferToBuffer => {
                    CommandRef::CopyBufferToBuffer(iter.next_command::<CopyBufferToBufferCmd<A>>())
                }
                Command::CopyBufferToTexture => CommandRef::CopyBufferToTexture(
                    iter.next_command::<CopyBufferToTextureCmd<A>>(),
                ),
                Command::CopyTextureToBuffer => CommandRef::CopyTextureToBuffer(
                    iter.next_command::<CopyTextureToBufferCmd<A>>(),
                ),
                Command::Dispatch => CommandRef::Dispatch(*iter.next_command::<DispatchCmd>()),
                Command::DrawArrays => {
                    CommandRef::DrawArrays(*iter.next_command::<DrawArraysCmd>())
                }
                Command::DrawElements => {
                    CommandRef::DrawElements(*iter.next_command::<DrawElementsCmd>())
                }
                Command::EndComputePass => {
                    iter.next_command::<EndComputePassCmd>();
                    CommandRef::EndComputePass
                }
                Command::EndRenderPass => {
                    iter.next_command::<EndRenderPassCmd>();
                    CommandRef::EndRenderPass
                }
                Command::SetComputePipeline => CommandRef::SetComputePipeline(
                    &iter.next_command::<SetComputePipelineCmd<A>>().pipeline,
                ),
                Command::SetRenderPipeline => CommandRef::SetRenderPipeline(
                    &iter.next_command::<SetRenderPipelineCmd<A>>().pipeline,
                ),
                Command::SetPushConstants => {
                    let cmd = *iter.next_command::<SetPushConstantsCmd>();
                    CommandRef::SetPushConstants {
                        stages: cmd.stages,
                        offset: cmd.offset,
                        data: iter.next_data::<u32>(cmd.count as usize),
                    }
                }
                Command::SetStencilReference => CommandRef::SetStencilReference(
                    iter.next_command::<SetStencilReferenceCmd>().reference,
                ),
                Command::SetBlendColor => {
                    CommandRef::SetBlendColor(iter.next_command::<SetBlendColorCmd>().color)
                }
                Command::SetScissorRect => {
                    CommandRef::SetScissorRect(*iter.next_command::<SetScissorRectCmd>())
                }
                Command::SetBindGroup => {
                    let cmd = iter.next_command::<SetBindGroupCmd<A>>();
                    let dynamic_offsets: &[wgt::DynamicOffset] = if cmd.dynamic_offset_count > 0 {
                        iter.next_data::<wgt::DynamicOffset>(cmd.dynamic_offset_count as usize)
                    } else {
                        &[]
                    };
                    CommandRef::SetBindGroup {
                        index: cmd.index,
                        group: &cmd.group,
                        dynamic_offsets,
                    }
                }
                Command::SetIndexBuffer => {
                    CommandRef::SetIndexBuffer(iter.next_command::<SetIndexBufferCmd<A>>())
                }
                Command::SetVertexBuffers => {
                    let cmd = *iter.next_command::<SetVertexBuffersCmd>();
                    let buffers = iter.next_data::<Arc<Buffer<A>>>(cmd.count as usize);
                    let offsets = iter.next_data::<wgt::BufferAddress>(cmd.count as usize);
                    CommandRef::SetVertexBuffers {
                        start_slot: cmd.start_slot,
                        buffers,
                        offsets,
                    }
                }
                Command::TransitionBufferUsage => CommandRef::TransitionBufferUsage(
                    iter.next_command::<TransitionBufferUsageCmd<A>>(),
                ),
                Command::TransitionTextureUsage => CommandRef::TransitionTextureUsage(
                    iter.next_command::<TransitionTextureUsageCmd<A>>(),
                ),
                Command::PushDebugGroup => CommandRef::PushDebugGroup(read_label(iter)),
                Command::PopDebugGroup => {
                    iter.next_command::<PopDebugGroupCmd>();
                    CommandRef::PopDebugGroup
                }
                Command::InsertDebugMarker => CommandRef::InsertDebugMarker(read_label(iter)),
            }
        };
        Some(decoded)
    }
}

unsafe fn read_label<'a>(iter: &mut CommandIterator) -> &'a str {
    let cmd = *unsafe { iter.next_command::<DebugMarkerCmd>() };
    let bytes = unsafe { iter.next_data::<u8>(cmd.length as usize) };
    std::str::from_utf8(bytes).unwrap_or_default()
}

/// Drops every record of the stream in place.
fn free_commands<A: hal::Api>(iter: &mut CommandIterator) {
    iter.reset();
    while let Some(id) = iter.next_command_id() {
        let command = match Command::from_id(id) {
            Some(command) => command,
            None => break,
        };
        unsafe {
            match command {
                Command::BeginRenderPass => {
                    ptr::drop_in_place(iter.next_command::<BeginRenderPassCmd<A>>());
                }
                Command::CopyBufferToBuffer => {
                    ptr::drop_in_place(iter.next_command::<CopyBufferToBufferCmd<A>>());
                }
                Command::CopyBufferToTexture => {
                    ptr::drop_in_place(iter.next_command::<CopyBufferToTextureCmd<A>>());
                }
                Command::CopyTextureToBuffer => {
                    ptr::drop_in_place(iter.next_command::<CopyTextureToBufferCmd<A>>());
                }
                Command::SetComputePipeline => {
                    ptr::drop_in_place(iter.next_command::<SetComputePipelineCmd<A>>());
                }
                Command::SetRenderPipeline => {
                    ptr::drop_in_place(iter.next_command::<SetRenderPipelineCmd<A>>());
                }
                Command::SetBindGroup => {
                    let cmd = iter.next_command::<SetBindGroupCmd<A>>();
                    if cmd.dynamic_offset_count > 0 {
                        iter.next_data::<wgt::DynamicOffset>(cmd.dynamic_offset_count as usize);
                    }
                    ptr::drop_in_place(cmd);
                }
                Command::SetIndexBuffer => {
                    ptr::drop_in_place(iter.next_command::<SetIndexBufferCmd<A>>());
                }
                Command::SetVertexBuffers => {
                    let cmd = *iter.next_command::<SetVertexBuffersCmd>();
                    ptr::drop_in_place(iter.next_data::<Arc<Buffer<A>>>(cmd.count as usize));
                    iter.next_data::<wgt::BufferAddress>(cmd.count as usize);
                }
                Command::TransitionBufferUsage => {
                    ptr::drop_in_place(iter.next_command::<TransitionBufferUsageCmd<A>>());
                }
                Command::TransitionTextureUsage => {
                    ptr::drop_in_place(iter.next_command::<TransitionTextureUsageCmd<A>>());
                }
                Command::SetPushConstants => {
                    let cmd = *iter.next_command::<SetPushConstantsCmd>();
                    iter.next_data::<u32>(cmd.count as usize);
                }
                Command::PushDebugGroup | Command::InsertDebugMarker => {
                    read_label(iter);
                }
                // plain data
                Command::BeginComputePass => {
                    iter.next_command::<BeginComputePassCmd>();
                }
                Command::Dispatch => {
                    iter.next_command::<DispatchCmd>();
                }
                Command::DrawArrays => {
                    iter.next_command::<DrawArraysCmd>();
                }
                Command::DrawElements => {
                    iter.next_command::<DrawElementsCmd>();
                }
                Command::EndComputePass => {
                    iter.next_command::<EndComputePassCmd>();
                }
                Command::EndRenderPass => {
                    iter.next_command::<EndRenderPassCmd>();
                }
                Command::SetStencilReference => {
                    iter.next_command::<SetStencilReferenceCmd>();
                }
                Command::SetBlendColor => {
                    iter.next_command::<SetBlendColorCmd>();
                }
                Command::SetScissorRect => {
                    iter.next_command::<SetScissorRectCmd>();
                }
                Command::PopDebugGroup => {
                    iter.next_command::<PopDebugGroupCmd>();
                }
            }
        }
    }
    iter.data_was_destroyed();
}

impl<A: hal::Api> Drop for CommandStream<A> {
    fn drop(&mut self) {
        free_commands::<A>(&mut self.iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::empty::Api;

    #[test]
    fn stream_round_trip() {
        let mut allocator = CommandAllocator::new();
        allocator.allocate(Command::BeginComputePass.id(), BeginComputePassCmd);
        allocator.allocate(
            Command::SetPushConstants.id(),
            SetPushConstantsCmd {
                stages: wgt::ShaderStage::COMPUTE,
                offset: 2,
                count: 3,
            },
        );
        allocator.allocate_data(&[7u32, 8, 9]);
        allocator.allocate(Command::Dispatch.id(), DispatchCmd { x: 4, y: 5, z: 6 });
        record_debug_marker(&mut allocator, Command::InsertDebugMarker, "marker");
        allocator.allocate(Command::EndComputePass.id(), EndComputePassCmd);
        let mut stream = CommandStream::<Api>::new(allocator.finish());

        for _ in 0..2 {
            let mut kinds = Vec::new();
            while let Some(command) = stream.next_command() {
                match command {
                    CommandRef::SetPushConstants {
                        stages,
                        offset,
                        data,
                    } => {
                        assert_eq!(stages, wgt::ShaderStage::COMPUTE);
                        assert_eq!(offset, 2);
                        assert_eq!(data, &[7, 8, 9]);
                    }
                    CommandRef::Dispatch(cmd) => {
                        assert_eq!(cmd, DispatchCmd { x: 4, y: 5, z: 6 })
                    }
                    CommandRef::InsertDebugMarker(label) => assert_eq!(label, "marker"),
                    _ => {}
                }
                kinds.push(command.kind());
            }
            assert_eq!(
                kinds,
                [
                    Command::BeginComputePass,
                    Command::SetPushConstants,
                    Command::Dispatch,
                    Command::InsertDebugMarker,
                    Command::EndComputePass,
                ]
            );
            assert!(stream.next_command().is_none());
            stream.reset();
        }
    }

    #[test]
    fn command_ids_are_dense() {
        for (i, command) in Command::ALL.iter().enumerate() {
            assert_eq!(command.id(), i as u32);
            assert_eq!(Command::from_id(i as u32), Some(*command));
        }
        assert_eq!(Command::from_id(Command::ALL.len() as u32), None);
    }
}
