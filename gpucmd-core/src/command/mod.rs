pub mod allocator;
mod bind;
mod commands;
mod draw;
mod encode;
mod render;
mod state;
mod transfer;

pub use self::commands::{Command, CommandStream};
pub use self::draw::DrawError;
pub use self::render::{
    CreateRenderPassError, RenderPassColorAttachment, RenderPassDepthStencilAttachment,
    RenderPassDescriptor, RenderPassInfo,
};
pub use self::state::{GuaranteedUsageError, PassKind, StateError, TransitionFailure};
pub use self::transfer::{BufferCopyView, CopySide, TextureCopyView, TransferError};

pub(crate) use self::encode::encode_stream;

use self::{
    allocator::CommandAllocator,
    commands::*,
    state::{CommandBufferStateTracker, UsageScope},
    transfer::{
        default_row_pitch, validate_buffer_texture_copy, validate_copy_size_fits_in_buffer,
    },
};

use crate::{
    binding_model::{BindError, BindGroup},
    device::Device,
    pipeline::{ComputePipeline, RenderPipeline},
    resource::{Buffer, BufferMapState, ResourceErrorIdent, ResourceInfo, Texture, TrackerIndex},
    FastHashMap, Label,
};

use parking_lot::Mutex;
use thiserror::Error;
use wgt::{BufferAddress, BufferUsage, TextureUsage};

use std::{fmt, sync::Arc};

/// Error detected while recording a single command.
#[derive(Clone, Debug, Error)]
pub enum RecordError {
    #[error("Bind group index {index} is greater than the device's `max_bind_groups` limit {max}")]
    BindGroupIndexOutOfRange { index: u32, max: u32 },
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("Push constants at offset {offset} with {count} values overrun the {} available slots", wgt::MAX_PUSH_CONSTANTS)]
    PushConstantsOutOfRange { offset: u32, count: usize },
    #[error("Push constants must target at least one shader stage")]
    EmptyPushConstantStages,
    #[error("Index buffer offset {offset} is past the end of {res} (size {size})")]
    IndexBufferOffset {
        res: ResourceErrorIdent,
        offset: BufferAddress,
        size: BufferAddress,
    },
    #[error("{buffers} vertex buffers were given with {offsets} offsets")]
    VertexBufferCountMismatch { buffers: usize, offsets: usize },
    #[error("Vertex buffers {start_slot}..{start_slot}+{count} exceed the limit of {limit} slots")]
    TooManyVertexBuffers {
        start_slot: u32,
        count: usize,
        limit: u32,
    },
    #[error("Vertex buffer offset {offset} is past the end of {res} (size {size})")]
    VertexBufferOffset {
        res: ResourceErrorIdent,
        offset: BufferAddress,
        size: BufferAddress,
    },
    #[error(transparent)]
    Transfer(#[from] transfer::TransferError),
    #[error("Cannot transition {0}: usage is frozen")]
    FrozenUsage(ResourceErrorIdent),
}

/// Where in the stream a replay error was found.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CommandScope {
    Command { index: usize, kind: Command },
    End,
}

impl fmt::Display for CommandScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Command { index, kind } => write!(f, "In command #{} ({})", index, kind),
            Self::End => f.write_str("At the end of the command buffer"),
        }
    }
}

#[derive(Clone, Debug, Error)]
pub enum CommandBufferError {
    #[error("Command buffer is invalid because of an earlier error")]
    Invalid,
    #[error("Commands were already acquired")]
    AlreadyAcquired,
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("{scope}")]
    Replay {
        scope: CommandScope,
        #[source]
        inner: StateError,
    },
    #[error("Cannot transition buffer with frozen usage: {0}")]
    FrozenBufferTransition(ResourceErrorIdent),
    #[error("Cannot transition texture with frozen usage: {0}")]
    FrozenTextureTransition(ResourceErrorIdent),
    #[error("{0} is mapped and cannot be used in a submission")]
    MappedBuffer(ResourceErrorIdent),
    #[error("Usage changed after recording: {0}")]
    UsageChanged(GuaranteedUsageError),
    #[error("{0} can no longer be used as a render pass attachment")]
    AttachmentUsage(ResourceErrorIdent),
}

/// Records commands for a `CommandBuffer`.
///
/// Each method checks what can be checked from its own arguments and writes
/// a record. The first error makes the builder invalid: later calls fail
/// with `CommandBufferError::Invalid` without recording anything, and
/// `finish` returns an invalid command buffer.
pub struct CommandBufferBuilder<A: hal::Api> {
    device: Arc<Device<A>>,
    allocator: CommandAllocator,
    error: Option<CommandBufferError>,
    label: String,
}

impl<A: hal::Api> fmt::Debug for CommandBufferBuilder<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferBuilder")
            .field("label", &self.label)
            .field("error", &self.error)
            .finish()
    }
}

impl<A: hal::Api> Drop for CommandBufferBuilder<A> {
    fn drop(&mut self) {
        if !self.allocator.is_empty() {
            resource_log!("Discard unfinished command buffer {:?}", self.label);
            drop(CommandStream::<A>::new(self.allocator.finish()));
        }
    }
}

impl<A: hal::Api> CommandBufferBuilder<A> {
    pub(crate) fn new(device: &Arc<Device<A>>, label: Label) -> Self {
        Self {
            device: Arc::clone(device),
            allocator: CommandAllocator::new(),
            error: None,
            label: label.unwrap_or_default().to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    fn record<F>(&mut self, op: F) -> Result<(), CommandBufferError>
    where
        F: FnOnce(&mut CommandAllocator, &wgt::Limits) -> Result<(), RecordError>,
    {
        if self.error.is_some() {
            return Err(CommandBufferError::Invalid);
        }
        let device = &self.device;
        match op(&mut self.allocator, device.limits()) {
            Ok(()) => Ok(()),
            Err(error) => {
                let error = CommandBufferError::Record(error);
                device.handle_error(&error);
                self.error = Some(error.clone());
                Err(error)
            }
        }
    }

    pub fn begin_compute_pass(&mut self) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(Command::BeginComputePass.id(), BeginComputePassCmd);
            Ok(())
        })
    }

    pub fn end_compute_pass(&mut self) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(Command::EndComputePass.id(), EndComputePassCmd);
            Ok(())
        })
    }

    pub fn begin_render_pass(
        &mut self,
        desc: &Arc<RenderPassDescriptor<A>>,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(
                Command::BeginRenderPass.id(),
                BeginRenderPassCmd {
                    desc: Arc::clone(desc),
                },
            );
            Ok(())
        })
    }

    pub fn end_render_pass(&mut self) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(Command::EndRenderPass.id(), EndRenderPassCmd);
            Ok(())
        })
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &Arc<Buffer<A>>,
        src_offset: BufferAddress,
        dst: &Arc<Buffer<A>>,
        dst_offset: BufferAddress,
        size: BufferAddress,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            validate_copy_size_fits_in_buffer(src, src_offset, size, CopySide::Source)?;
            validate_copy_size_fits_in_buffer(dst, dst_offset, size, CopySide::Destination)?;
            alloc.allocate(
                Command::CopyBufferToBuffer.id(),
                CopyBufferToBufferCmd {
                    src: Arc::clone(src),
                    src_offset,
                    dst: Arc::clone(dst),
                    dst_offset,
                    size,
                },
            );
            Ok(())
        })
    }

    pub fn copy_buffer_to_texture(
        &mut self,
        source: BufferCopyView<A>,
        destination: TextureCopyView<A>,
        copy_size: wgt::Extent3d,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            let source = with_default_row_pitch(source, &destination, &copy_size);
            alloc.allocate(
                Command::CopyBufferToTexture.id(),
                CopyBufferToTextureCmd {
                    source,
                    destination,
                    copy_size,
                },
            );
            Ok(())
        })
    }

    pub fn copy_texture_to_buffer(
        &mut self,
        source: TextureCopyView<A>,
        destination: BufferCopyView<A>,
        copy_size: wgt::Extent3d,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            let destination = with_default_row_pitch(destination, &source, &copy_size);
            alloc.allocate(
                Command::CopyTextureToBuffer.id(),
                CopyTextureToBufferCmd {
                    source,
                    destination,
                    copy_size,
                },
            );
            Ok(())
        })
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(Command::Dispatch.id(), DispatchCmd { x, y, z });
            Ok(())
        })
    }

    pub fn draw_arrays(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(
                Command::DrawArrays.id(),
                DrawArraysCmd {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                },
            );
            Ok(())
        })
    }

    pub fn draw_elements(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        first_instance: u32,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(
                Command::DrawElements.id(),
                DrawElementsCmd {
                    index_count,
                    instance_count,
                    first_index,
                    first_instance,
                },
            );
            Ok(())
        })
    }

    pub fn set_compute_pipeline(
        &mut self,
        pipeline: &Arc<ComputePipeline<A>>,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(
                Command::SetComputePipeline.id(),
                SetComputePipelineCmd {
                    pipeline: Arc::clone(pipeline),
                },
            );
            Ok(())
        })
    }

    pub fn set_render_pipeline(
        &mut self,
        pipeline: &Arc<RenderPipeline<A>>,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(
                Command::SetRenderPipeline.id(),
                SetRenderPipelineCmd {
                    pipeline: Arc::clone(pipeline),
                },
            );
            Ok(())
        })
    }

    pub fn set_push_constants(
        &mut self,
        stages: wgt::ShaderStage,
        offset: u32,
        data: &[u32],
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            if stages.is_empty() {
                return Err(RecordError::EmptyPushConstantStages);
            }
            if offset as u64 + data.len() as u64 > wgt::MAX_PUSH_CONSTANTS as u64 {
                return Err(RecordError::PushConstantsOutOfRange {
                    offset,
                    count: data.len(),
                });
            }
            alloc.allocate(
                Command::SetPushConstants.id(),
                SetPushConstantsCmd {
                    stages,
                    offset,
                    count: data.len() as u32,
                },
            );
            alloc.allocate_data(data);
            Ok(())
        })
    }

    pub fn set_stencil_reference(&mut self, reference: u32) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(
                Command::SetStencilReference.id(),
                SetStencilReferenceCmd { reference },
            );
            Ok(())
        })
    }

    pub fn set_blend_color(&mut self, color: wgt::Color) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(Command::SetBlendColor.id(), SetBlendColorCmd { color });
            Ok(())
        })
    }

    pub fn set_scissor_rect(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(
                Command::SetScissorRect.id(),
                SetScissorRectCmd {
                    x,
                    y,
                    width,
                    height,
                },
            );
            Ok(())
        })
    }

    pub fn set_bind_group(
        &mut self,
        index: u32,
        group: &Arc<BindGroup<A>>,
        dynamic_offsets: &[wgt::DynamicOffset],
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, limits| {
            let max = limits.max_bind_groups.min(hal::MAX_BIND_GROUPS as u32);
            if index >= max {
                return Err(RecordError::BindGroupIndexOutOfRange { index, max });
            }
            for (idx, &offset) in dynamic_offsets.iter().enumerate() {
                if offset % wgt::DYNAMIC_OFFSET_ALIGNMENT != 0 {
                    return Err(BindError::UnalignedDynamicBinding { idx, offset }.into());
                }
            }
            alloc.allocate(
                Command::SetBindGroup.id(),
                SetBindGroupCmd {
                    index,
                    group: Arc::clone(group),
                    dynamic_offset_count: dynamic_offsets.len() as u32,
                },
            );
            if !dynamic_offsets.is_empty() {
                alloc.allocate_data(dynamic_offsets);
            }
            Ok(())
        })
    }

    pub fn set_index_buffer(
        &mut self,
        buffer: &Arc<Buffer<A>>,
        offset: BufferAddress,
        format: wgt::IndexFormat,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            if offset > buffer.size {
                return Err(RecordError::IndexBufferOffset {
                    res: buffer.error_ident(),
                    offset,
                    size: buffer.size,
                });
            }
            alloc.allocate(
                Command::SetIndexBuffer.id(),
                SetIndexBufferCmd {
                    buffer: Arc::clone(buffer),
                    offset,
                    format,
                },
            );
            Ok(())
        })
    }

    pub fn set_vertex_buffers(
        &mut self,
        start_slot: u32,
        buffers: &[Arc<Buffer<A>>],
        offsets: &[BufferAddress],
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, limits| {
            if buffers.len() != offsets.len() {
                return Err(RecordError::VertexBufferCountMismatch {
                    buffers: buffers.len(),
                    offsets: offsets.len(),
                });
            }
            let limit = limits
                .max_vertex_buffers
                .min(wgt::MAX_VERTEX_INPUTS as u32);
            if start_slot as u64 + buffers.len() as u64 > limit as u64 {
                return Err(RecordError::TooManyVertexBuffers {
                    start_slot,
                    count: buffers.len(),
                    limit,
                });
            }
            for (buffer, &offset) in buffers.iter().zip(offsets.iter()) {
                if offset > buffer.size {
                    return Err(RecordError::VertexBufferOffset {
                        res: buffer.error_ident(),
                        offset,
                        size: buffer.size,
                    });
                }
            }
            alloc.allocate(
                Command::SetVertexBuffers.id(),
                SetVertexBuffersCmd {
                    start_slot,
                    count: buffers.len() as u32,
                },
            );
            alloc.allocate_data(buffers);
            alloc.allocate_data(offsets);
            Ok(())
        })
    }

    pub fn transition_buffer_usage(
        &mut self,
        buffer: &Arc<Buffer<A>>,
        usage: BufferUsage,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            if buffer.is_frozen() {
                return Err(RecordError::FrozenUsage(buffer.error_ident()));
            }
            alloc.allocate(
                Command::TransitionBufferUsage.id(),
                TransitionBufferUsageCmd {
                    buffer: Arc::clone(buffer),
                    usage,
                },
            );
            Ok(())
        })
    }

    pub fn transition_texture_usage(
        &mut self,
        texture: &Arc<Texture<A>>,
        usage: TextureUsage,
    ) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            if texture.is_frozen() {
                return Err(RecordError::FrozenUsage(texture.error_ident()));
            }
            alloc.allocate(
                Command::TransitionTextureUsage.id(),
                TransitionTextureUsageCmd {
                    texture: Arc::clone(texture),
                    usage,
                },
            );
            Ok(())
        })
    }

    pub fn push_debug_group(&mut self, label: &str) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            record_debug_marker(alloc, Command::PushDebugGroup, label);
            Ok(())
        })
    }

    pub fn pop_debug_group(&mut self) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            alloc.allocate(Command::PopDebugGroup.id(), PopDebugGroupCmd);
            Ok(())
        })
    }

    pub fn insert_debug_marker(&mut self, label: &str) -> Result<(), CommandBufferError> {
        self.record(|alloc, _| {
            record_debug_marker(alloc, Command::InsertDebugMarker, label);
            Ok(())
        })
    }

    /// Ends recording and validates the whole stream.
    ///
    /// Always returns a command buffer. It is invalid if recording failed or
    /// if the stream breaks a rule that depends on the state built by the
    /// previous commands.
    pub fn finish(mut self) -> CommandBuffer<A> {
        profiling::scope!("CommandBufferBuilder::finish");
        let mut stream = CommandStream::<A>::new(self.allocator.finish());
        let info = ResourceInfo::new(&self.device, Some(self.label.as_str()));

        let outcome = match self.error.take() {
            Some(error) => Err(error),
            None => match validate_stream(&mut stream) {
                Ok(usages) => Ok(usages),
                Err(error) => {
                    self.device.handle_error(&error);
                    Err(error)
                }
            },
        };

        match outcome {
            Ok(usages) => {
                resource_log!("Finish command buffer {:?}", self.label);
                CommandBuffer {
                    device: Arc::clone(&self.device),
                    commands: Mutex::new(Some(stream)),
                    error: None,
                    usages,
                    info,
                }
            }
            Err(error) => {
                resource_log!("Finish invalid command buffer {:?}", self.label);
                CommandBuffer {
                    device: Arc::clone(&self.device),
                    commands: Mutex::new(None),
                    error: Some(error),
                    usages: UsageScope::default(),
                    info,
                }
            }
        }
    }
}

fn with_default_row_pitch<A: hal::Api>(
    mut view: BufferCopyView<A>,
    texture: &TextureCopyView<A>,
    copy_size: &wgt::Extent3d,
) -> BufferCopyView<A> {
    if view.row_pitch == 0 {
        view.row_pitch = default_row_pitch(texture.texture.format, copy_size.width);
    }
    view
}

/// Replays the stream through a state tracker, once.
fn validate_stream<A: hal::Api>(
    stream: &mut CommandStream<A>,
) -> Result<UsageScope<A>, CommandBufferError> {
    let mut state = CommandBufferStateTracker::new();
    let mut index = 0;
    while let Some(command) = stream.next_command() {
        let kind = command.kind();
        validate_command(&mut state, command).map_err(|inner| CommandBufferError::Replay {
            scope: CommandScope::Command { index, kind },
            inner,
        })?;
        index += 1;
    }
    state
        .validate_end_command_buffer()
        .map_err(|inner| CommandBufferError::Replay {
            scope: CommandScope::End,
            inner,
        })?;
    stream.reset();
    Ok(state.into_usage_scope())
}

fn validate_command<A: hal::Api>(
    state: &mut CommandBufferStateTracker<A>,
    command: CommandRef<'_, A>,
) -> Result<(), StateError> {
    match command {
        CommandRef::BeginComputePass => state.begin_compute_pass(),
        CommandRef::BeginRenderPass(desc) => state.begin_render_pass(desc),
        CommandRef::CopyBufferToBuffer(cmd) => {
            state.validate_can_copy()?;
            validate_copy_size_fits_in_buffer(&cmd.src, cmd.src_offset, cmd.size, CopySide::Source)?;
            validate_copy_size_fits_in_buffer(
                &cmd.dst,
                cmd.dst_offset,
                cmd.size,
                CopySide::Destination,
            )?;
            state.validate_buffer_usage(&cmd.src, BufferUsage::TRANSFER_SRC)?;
            state.validate_buffer_usage(&cmd.dst, BufferUsage::TRANSFER_DST)?;
            Ok(())
        }
        CommandRef::CopyBufferToTexture(cmd) => {
            state.validate_can_copy()?;
            validate_buffer_texture_copy(
                &cmd.source,
                &cmd.destination,
                &cmd.copy_size,
                CopySide::Destination,
            )?;
            state.validate_buffer_usage(&cmd.source.buffer, BufferUsage::TRANSFER_SRC)?;
            state.validate_texture_usage(&cmd.destination.texture, TextureUsage::TRANSFER_DST)?;
            Ok(())
        }
        CommandRef::CopyTextureToBuffer(cmd) => {
            state.validate_can_copy()?;
            validate_buffer_texture_copy(
                &cmd.destination,
                &cmd.source,
                &cmd.copy_size,
                CopySide::Source,
            )?;
            state.validate_texture_usage(&cmd.source.texture, TextureUsage::TRANSFER_SRC)?;
            state.validate_buffer_usage(&cmd.destination.buffer, BufferUsage::TRANSFER_DST)?;
            Ok(())
        }
        CommandRef::Dispatch(_) => state.validate_can_dispatch(),
        CommandRef::DrawArrays(cmd) => state.validate_can_draw(&cmd),
        CommandRef::DrawElements(cmd) => state.validate_can_draw_indexed(&cmd),
        CommandRef::EndComputePass => state.end_compute_pass(),
        CommandRef::EndRenderPass => state.end_render_pass(),
        CommandRef::SetComputePipeline(pipeline) => state.set_compute_pipeline(pipeline),
        CommandRef::SetRenderPipeline(pipeline) => state.set_render_pipeline(pipeline),
        CommandRef::SetPushConstants { stages, .. } => state.validate_set_push_constants(stages),
        CommandRef::SetStencilReference(_)
        | CommandRef::SetBlendColor(_)
        | CommandRef::SetScissorRect(_) => state.validate_render_pass_state(),
        CommandRef::SetBindGroup {
            index,
            group,
            dynamic_offsets,
        } => state.set_bind_group(index, group, dynamic_offsets),
        CommandRef::SetIndexBuffer(cmd) => state.set_index_buffer(&cmd.buffer, cmd.offset, cmd.format),
        CommandRef::SetVertexBuffers {
            start_slot,
            buffers,
            offsets,
        } => state.set_vertex_buffers(start_slot, buffers, offsets),
        CommandRef::TransitionBufferUsage(cmd) => state.transition_buffer_usage(&cmd.buffer, cmd.usage),
        CommandRef::TransitionTextureUsage(cmd) => {
            state.transition_texture_usage(&cmd.texture, cmd.usage)
        }
        CommandRef::PushDebugGroup(_) => {
            state.push_debug_group();
            Ok(())
        }
        CommandRef::PopDebugGroup => state.pop_debug_group(),
        CommandRef::InsertDebugMarker(_) => Ok(()),
    }
}

/// A finished, immutable command buffer.
#[derive(Debug)]
pub struct CommandBuffer<A: hal::Api> {
    pub(crate) device: Arc<Device<A>>,
    commands: Mutex<Option<CommandStream<A>>>,
    error: Option<CommandBufferError>,
    pub(crate) usages: UsageScope<A>,
    pub(crate) info: ResourceInfo,
}

/// Usages left behind by the command buffers ahead in the same submission.
#[derive(Debug, Default)]
pub(crate) struct PendingUsages {
    buffers: FastHashMap<TrackerIndex, BufferUsage>,
    textures: FastHashMap<TrackerIndex, TextureUsage>,
}

impl<A: hal::Api> CommandBuffer<A> {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// The error that made the command buffer invalid.
    pub fn error(&self) -> Option<&CommandBufferError> {
        self.error.as_ref()
    }

    pub fn label(&self) -> &str {
        self.info.label()
    }

    /// Returns true until the commands are acquired, for valid command buffers.
    pub fn has_commands(&self) -> bool {
        self.commands.lock().is_some()
    }

    /// Takes the command stream out. Only works once.
    pub fn acquire_commands(&self) -> Result<CommandStream<A>, CommandBufferError> {
        let result = if self.error.is_some() {
            Err(CommandBufferError::Invalid)
        } else {
            self.commands
                .lock()
                .take()
                .ok_or(CommandBufferError::AlreadyAcquired)
        };
        if let Err(ref error) = result {
            self.device.handle_error(error);
        }
        result
    }

    /// Checks that the usages the stream was validated against still hold.
    ///
    /// `pending` holds the usages set by the command buffers submitted ahead
    /// of this one, and receives the usages this one leaves behind.
    pub(crate) fn check_resource_usages(
        &self,
        pending: &mut PendingUsages,
    ) -> Result<(), CommandBufferError> {
        let usages = &self.usages;
        for buffer in usages.buffers_transitioned.iter() {
            if buffer.is_frozen() {
                return Err(CommandBufferError::FrozenBufferTransition(
                    buffer.error_ident(),
                ));
            }
            if buffer.map_state() != BufferMapState::Idle {
                return Err(CommandBufferError::MappedBuffer(buffer.error_ident()));
            }
        }
        for texture in usages.textures_transitioned.iter() {
            if texture.is_frozen() {
                return Err(CommandBufferError::FrozenTextureTransition(
                    texture.error_ident(),
                ));
            }
        }
        for &(ref buffer, usage) in usages.buffers_assumed.iter() {
            let current = pending
                .buffers
                .get(&buffer.info.tracker_index())
                .copied()
                .unwrap_or_else(|| buffer.current_usage());
            if !current.contains(usage) {
                return Err(CommandBufferError::UsageChanged(
                    GuaranteedUsageError::Buffer {
                        res: buffer.error_ident(),
                        expected: usage,
                    },
                ));
            }
        }
        for &(ref texture, usage) in usages.textures_assumed.iter() {
            let current = pending
                .textures
                .get(&texture.info.tracker_index())
                .copied()
                .unwrap_or_else(|| texture.current_usage());
            if !current.contains(usage) {
                return Err(CommandBufferError::UsageChanged(
                    GuaranteedUsageError::Texture {
                        res: texture.error_ident(),
                        expected: usage,
                    },
                ));
            }
        }
        for texture in usages.attachments.iter() {
            let usable = texture.has_frozen_usage(TextureUsage::OUTPUT_ATTACHMENT)
                || texture.is_transition_possible(TextureUsage::OUTPUT_ATTACHMENT);
            if !usable {
                return Err(CommandBufferError::AttachmentUsage(texture.error_ident()));
            }
        }

        pending
            .buffers
            .extend(usages.buffer_end_usages.iter().copied());
        pending
            .textures
            .extend(usages.texture_end_usages.iter().copied());
        Ok(())
    }

    /// Same checks as a submission makes, reported through the device.
    pub fn validate_resource_usages_immediate(&self) -> Result<(), CommandBufferError> {
        let result = self.check_resource_usages(&mut PendingUsages::default());
        if let Err(ref error) = result {
            self.device.handle_error(error);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding_model::{BindGroupDescriptor, BindGroupLayoutDescriptor},
        resource::{BufferDescriptor, TextureDescriptor},
    };
    use hal::empty::{self, Api};
    use wgt::BufferUsage as Bu;

    fn device() -> Arc<Device<Api>> {
        Device::new(empty::Context::open(), wgt::Limits::default(), Some("command")).unwrap()
    }

    fn buffer(device: &Arc<Device<Api>>, size: u64, allowed: Bu, initial: Bu) -> Arc<Buffer<Api>> {
        device
            .create_buffer(&BufferDescriptor {
                label: Some("buffer"),
                size,
                allowed_usage: allowed,
                initial_usage: initial,
            })
            .unwrap()
    }

    fn empty_group(device: &Arc<Device<Api>>) -> Arc<BindGroup<Api>> {
        let layout = device
            .create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: None,
                entries: &[],
            })
            .unwrap();
        device
            .create_bind_group(&BindGroupDescriptor {
                label: None,
                layout: &layout,
                entries: &[],
            })
            .unwrap()
    }

    #[test]
    fn bind_group_index_over_limit() {
        let device = device();
        let group = empty_group(&device);
        let mut builder = device.create_command_buffer_builder(Some("over"));
        builder.begin_compute_pass().unwrap();
        let error = builder.set_bind_group(4, &group, &[]).unwrap_err();
        assert!(matches!(
            error,
            CommandBufferError::Record(RecordError::BindGroupIndexOutOfRange { index: 4, max: 4 })
        ));
        assert_eq!(device.error_count(), 1);
        // nothing was recorded for the failed call
        assert_eq!(Arc::strong_count(&group), 1);
        assert!(matches!(
            builder.set_bind_group(0, &group, &[]),
            Err(CommandBufferError::Invalid)
        ));
        assert_eq!(Arc::strong_count(&group), 1);
        assert!(!builder.is_valid());

        let cb = builder.finish();
        assert!(!cb.is_valid());
        assert!(!cb.has_commands());
        assert_eq!(device.error_count(), 1);
    }

    #[test]
    fn discarded_builder_frees_every_record() {
        let device = device();
        let buf = buffer(&device, 64, Bu::TRANSFER_SRC | Bu::TRANSFER_DST | Bu::INDEX | Bu::VERTEX, Bu::empty());
        let mut builder = device.create_command_buffer_builder(None);
        builder.transition_buffer_usage(&buf, Bu::TRANSFER_DST).unwrap();
        builder.copy_buffer_to_buffer(&buf, 0, &buf, 8, 4).unwrap();
        builder
            .set_index_buffer(&buf, 0, wgt::IndexFormat::Uint16)
            .unwrap();
        builder
            .set_vertex_buffers(0, &[Arc::clone(&buf)], &[0])
            .unwrap();
        builder.dispatch(1, 1, 1).unwrap();
        assert_eq!(Arc::strong_count(&buf), 6);
        drop(builder);
        assert_eq!(Arc::strong_count(&buf), 1);
    }

    #[test]
    fn replay_errors_name_the_command() {
        let device = device();
        let mut builder = device.create_command_buffer_builder(None);
        builder.begin_compute_pass().unwrap();
        builder.dispatch(1, 1, 1).unwrap();
        builder.end_compute_pass().unwrap();
        let cb = builder.finish();
        assert!(!cb.is_valid());
        match cb.error() {
            Some(&CommandBufferError::Replay {
                scope,
                inner: StateError::Draw(DrawError::MissingPipeline),
            }) => assert_eq!(
                scope,
                CommandScope::Command {
                    index: 1,
                    kind: Command::Dispatch,
                }
            ),
            other => panic!("unexpected {:?}", other),
        }
        assert!(cb.error().unwrap().to_string().starts_with("In command #1 (Dispatch)"));
        assert_eq!(device.error_count(), 1);
        assert!(matches!(
            cb.acquire_commands(),
            Err(CommandBufferError::Invalid)
        ));
    }

    #[test]
    fn pass_scoping() {
        let device = device();
        let buf = buffer(&device, 64, Bu::TRANSFER_SRC | Bu::TRANSFER_DST, Bu::TRANSFER_SRC);

        let mut builder = device.create_command_buffer_builder(None);
        builder.begin_compute_pass().unwrap();
        builder.transition_buffer_usage(&buf, Bu::TRANSFER_DST).unwrap();
        builder.end_compute_pass().unwrap();
        assert!(matches!(
            builder.finish().error(),
            Some(&CommandBufferError::Replay {
                inner: StateError::InsidePass(PassKind::Compute),
                ..
            })
        ));

        let mut builder = device.create_command_buffer_builder(None);
        builder.begin_compute_pass().unwrap();
        builder.begin_compute_pass().unwrap();
        assert!(matches!(
            builder.finish().error(),
            Some(&CommandBufferError::Replay {
                inner: StateError::PassAlreadyOpen { .. },
                ..
            })
        ));

        let mut builder = device.create_command_buffer_builder(None);
        builder.push_debug_group("outer").unwrap();
        builder.begin_compute_pass().unwrap();
        builder.end_compute_pass().unwrap();
        assert!(matches!(
            builder.finish().error(),
            Some(&CommandBufferError::Replay {
                scope: CommandScope::End,
                inner: StateError::DebugGroupsNotPopped(1),
            })
        ));

        let mut builder = device.create_command_buffer_builder(None);
        builder.set_stencil_reference(1).unwrap();
        assert!(matches!(
            builder.finish().error(),
            Some(&CommandBufferError::Replay {
                inner: StateError::NotInRenderPass,
                ..
            })
        ));
        assert_eq!(device.error_count(), 4);
    }

    #[test]
    fn copy_bounds_do_not_wrap() {
        let device = device();
        let src = buffer(&device, 1 << 20, Bu::TRANSFER_SRC, Bu::TRANSFER_SRC);
        let dst = buffer(&device, 1 << 20, Bu::TRANSFER_DST, Bu::TRANSFER_DST);
        for &offset in [u32::MAX as u64 - 1, u64::MAX - 1].iter() {
            let mut builder = device.create_command_buffer_builder(None);
            assert!(matches!(
                builder.copy_buffer_to_buffer(&src, offset, &dst, 0, 10),
                Err(CommandBufferError::Record(RecordError::Transfer(
                    TransferError::BufferOverrun {
                        side: CopySide::Source,
                        ..
                    }
                )))
            ));
        }
        assert_eq!(device.error_count(), 2);

        let mut builder = device.create_command_buffer_builder(None);
        builder.copy_buffer_to_buffer(&src, 16, &dst, 0, 16).unwrap();
        let cb = builder.finish();
        assert!(cb.is_valid());
        assert!(!cb.acquire_commands().unwrap().is_empty());
        assert!(matches!(
            cb.acquire_commands(),
            Err(CommandBufferError::AlreadyAcquired)
        ));
    }

    #[test]
    fn copy_usage_must_be_guaranteed() {
        let device = device();
        let src = buffer(&device, 64, Bu::TRANSFER_SRC | Bu::VERTEX, Bu::VERTEX);
        let dst = buffer(&device, 64, Bu::TRANSFER_DST, Bu::TRANSFER_DST);

        let mut builder = device.create_command_buffer_builder(None);
        builder.copy_buffer_to_buffer(&src, 0, &dst, 0, 16).unwrap();
        assert!(matches!(
            builder.finish().error(),
            Some(&CommandBufferError::Replay {
                inner: StateError::Usage(GuaranteedUsageError::Buffer { .. }),
                ..
            })
        ));

        let mut builder = device.create_command_buffer_builder(None);
        builder.transition_buffer_usage(&src, Bu::TRANSFER_SRC).unwrap();
        builder.copy_buffer_to_buffer(&src, 0, &dst, 0, 16).unwrap();
        let cb = builder.finish();
        assert!(cb.is_valid());
        assert_eq!(cb.usages.buffers_transitioned.len(), 1);
        // recording leaves the current usage alone
        assert_eq!(src.current_usage(), Bu::VERTEX);
    }

    #[test]
    fn texture_copy_uses_default_row_pitch() {
        let device = device();
        let texture = device
            .create_texture(&TextureDescriptor {
                label: Some("texture"),
                size: wgt::Extent3d {
                    width: 4,
                    height: 4,
                    depth: 1,
                },
                mip_level_count: 1,
                format: wgt::TextureFormat::R8G8B8A8Unorm,
                allowed_usage: TextureUsage::TRANSFER_DST,
                initial_usage: TextureUsage::TRANSFER_DST,
            })
            .unwrap();
        // 3 rows of 256 bytes then one row of 16
        let small = buffer(&device, 256 * 3 + 15, Bu::TRANSFER_SRC, Bu::TRANSFER_SRC);
        let large = buffer(&device, 256 * 3 + 16, Bu::TRANSFER_SRC, Bu::TRANSFER_SRC);
        let size = wgt::Extent3d {
            width: 4,
            height: 4,
            depth: 1,
        };

        let record = |buffer: &Arc<Buffer<Api>>| {
            let mut builder = device.create_command_buffer_builder(None);
            builder
                .copy_buffer_to_texture(
                    BufferCopyView {
                        buffer: Arc::clone(buffer),
                        offset: 0,
                        row_pitch: 0,
                    },
                    TextureCopyView {
                        texture: Arc::clone(&texture),
                        mip_level: 0,
                        origin: wgt::Origin3d::default(),
                    },
                    size,
                )
                .unwrap();
            builder.finish()
        };

        assert!(record(&large).is_valid());
        assert!(matches!(
            record(&small).error(),
            Some(&CommandBufferError::Replay {
                inner: StateError::Transfer(TransferError::BufferOverrun {
                    side: CopySide::Source,
                    ..
                }),
                ..
            })
        ));
    }

    #[test]
    fn frozen_after_recording() {
        let device = device();
        let buf = buffer(&device, 64, Bu::TRANSFER_DST | Bu::VERTEX, Bu::VERTEX);
        let mut builder = device.create_command_buffer_builder(None);
        builder.transition_buffer_usage(&buf, Bu::TRANSFER_DST).unwrap();
        let cb = builder.finish();
        cb.validate_resource_usages_immediate().unwrap();

        buf.freeze_usage(Bu::VERTEX).unwrap();
        let error = cb.validate_resource_usages_immediate().unwrap_err();
        assert!(error
            .to_string()
            .starts_with("Cannot transition buffer with frozen usage"));
        assert_eq!(device.error_count(), 1);
        assert_eq!(buf.current_usage(), Bu::VERTEX);

        let mut builder = device.create_command_buffer_builder(None);
        assert!(matches!(
            builder.transition_buffer_usage(&buf, Bu::TRANSFER_DST),
            Err(CommandBufferError::Record(RecordError::FrozenUsage(_)))
        ));
    }

    #[test]
    fn trailing_data_spills_into_the_next_block() {
        let device = device();
        let queue = device.create_queue();
        let mut builder = device.create_command_buffer_builder(Some("markers"));
        builder.insert_debug_marker("a").unwrap();
        builder.insert_debug_marker(&"x".repeat(4000)).unwrap();
        for i in 0..300 {
            builder.insert_debug_marker(&"m".repeat(i % 40)).unwrap();
        }
        let cb = builder.finish();
        assert!(cb.is_valid(), "{:?}", cb.error());
        queue.submit(&[&cb]).unwrap();

        // the invalid stream is still read back to free its records
        let buf = buffer(&device, 64, Bu::VERTEX, Bu::VERTEX);
        let mut builder = device.create_command_buffer_builder(Some("vertex buffers"));
        for _ in 0..300 {
            let buffers = [Arc::clone(&buf), Arc::clone(&buf), Arc::clone(&buf)];
            builder.set_vertex_buffers(0, &buffers, &[0, 4, 8]).unwrap();
        }
        assert_eq!(Arc::strong_count(&buf), 901);
        let cb = builder.finish();
        assert!(matches!(
            cb.error(),
            Some(&CommandBufferError::Replay {
                inner: StateError::NotInRenderPass,
                ..
            })
        ));
        assert_eq!(Arc::strong_count(&buf), 1);
    }
}
