/*! Command buffer state tracking.

The tracker follows a command stream during the validating replay. Draws
and dispatches are commit points: they require a set of aspects of the
state to be valid. An aspect stays valid until a command that can change
its outcome invalidates it, so repeated draws with the same state only
pay for the checks once.

Usages are tracked per command buffer. A resource's usage is only known
for sure if it is frozen, if it was transitioned earlier in the same
command buffer, or if the command buffer never transitions it. In the last
case its current usage is assumed, and the assumption is checked again when
the command buffer is submitted, together with the render pass attachments.
!*/

use crate::{
    binding_model::{BindError, BindGroup},
    command::{
        bind::Binder,
        commands::{DrawArraysCmd, DrawElementsCmd},
        draw::{DrawError, VertexBufferInput, VertexLimits},
        render::RenderPassDescriptor,
        transfer::TransferError,
    },
    device::RenderPassCompatibilityError,
    pipeline::{ComputePipeline, RenderPipeline},
    resource::{Buffer, ResourceErrorIdent, Texture, TrackerIndex},
    track::{ResourceUses, UsageError},
    FastHashMap, FastHashSet,
};

use arrayvec::ArrayVec;
use thiserror::Error;
use wgt::{BufferAddress, BufferUsage, ShaderStage, TextureUsage};

use std::{fmt, sync::Arc};

bitflags::bitflags! {
    /// Parts of the state a commit point depends on.
    pub(crate) struct ValidationAspects: u8 {
        const PIPELINE = 1 << 0;
        const BIND_GROUPS = 1 << 1;
        const VERTEX_BUFFERS = 1 << 2;
        const INDEX_BUFFER = 1 << 3;
        const COMPUTE_PASS = 1 << 4;
        const RENDER_PASS = 1 << 5;
    }
}

impl ValidationAspects {
    const DRAW: Self = Self::from_bits_truncate(
        Self::PIPELINE.bits | Self::BIND_GROUPS.bits | Self::VERTEX_BUFFERS.bits | Self::RENDER_PASS.bits,
    );
    const DRAW_INDEXED: Self =
        Self::from_bits_truncate(Self::DRAW.bits | Self::INDEX_BUFFER.bits);
    const DISPATCH: Self = Self::from_bits_truncate(
        Self::PIPELINE.bits | Self::BIND_GROUPS.bits | Self::COMPUTE_PASS.bits,
    );
    /// Aspects whose outcome depends on resource usages.
    const RESOURCE_DEPENDENT: Self = Self::from_bits_truncate(
        Self::BIND_GROUPS.bits | Self::VERTEX_BUFFERS.bits | Self::INDEX_BUFFER.bits,
    );
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PassKind {
    Compute,
    Render,
}

/// A usage a command needs is not guaranteed at submission time.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum GuaranteedUsageError {
    #[error("{res} is not guaranteed to be in usage {expected:?}")]
    Buffer {
        res: ResourceErrorIdent,
        expected: BufferUsage,
    },
    #[error("{res} is not guaranteed to be in usage {expected:?}")]
    Texture {
        res: ResourceErrorIdent,
        expected: TextureUsage,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TransitionFailure {
    Frozen,
    NotAllowed,
    NotPossible,
}

impl TransitionFailure {
    fn of<U: ResourceUses>(error: &UsageError<U>) -> Self {
        match *error {
            UsageError::Frozen { .. } => Self::Frozen,
            UsageError::NotAllowed { .. } => Self::NotAllowed,
            UsageError::Conflicting { .. } => Self::NotPossible,
        }
    }
}

impl fmt::Display for TransitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Frozen => "usage is frozen",
            Self::NotAllowed => "usage not allowed",
            Self::NotPossible => "transition not possible",
        })
    }
}

/// Error found while replaying a command stream through the state tracker.
#[derive(Clone, Debug, Error)]
pub enum StateError {
    #[error("cannot begin a {begin:?} pass while a {open:?} pass is open")]
    PassAlreadyOpen { open: PassKind, begin: PassKind },
    #[error("command must be inside a compute pass")]
    NotInComputePass,
    #[error("command must be inside a render pass")]
    NotInRenderPass,
    #[error("command must be inside a pass")]
    NotInPass,
    #[error("command cannot be used inside a {0:?} pass")]
    InsidePass(PassKind),
    #[error("{0:?} pass was never ended")]
    PassNotEnded(PassKind),
    #[error("bind group index {index} is out of range")]
    BindGroupIndexOutOfRange { index: u32 },
    #[error("pop of an empty debug group stack")]
    DebugGroupUnderflow,
    #[error("{0} debug groups were never popped")]
    DebugGroupsNotPopped(u32),
    #[error("render pipeline is incompatible with render pass")]
    IncompatiblePipeline(#[from] RenderPassCompatibilityError),
    #[error("push constant stages {stages:?} are not valid in a {pass:?} pass")]
    InvalidPushConstantStages { stages: ShaderStage, pass: PassKind },
    #[error("cannot transition {res} to {usage:?}: {reason}")]
    BufferTransition {
        res: ResourceErrorIdent,
        usage: BufferUsage,
        reason: TransitionFailure,
        #[source]
        error: UsageError<BufferUsage>,
    },
    #[error("cannot transition {res} to {usage:?}: {reason}")]
    TextureTransition {
        res: ResourceErrorIdent,
        usage: TextureUsage,
        reason: TransitionFailure,
        #[source]
        error: UsageError<TextureUsage>,
    },
    #[error("{0} cannot be explicitly transitioned to OUTPUT_ATTACHMENT")]
    ExplicitOutputAttachment(ResourceErrorIdent),
    #[error("{0} is not usable as a render pass attachment")]
    AttachmentUsage(ResourceErrorIdent),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Draw(#[from] DrawError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Usage(#[from] GuaranteedUsageError),
}

#[derive(Debug)]
enum PassState<A: hal::Api> {
    None,
    Compute,
    Render(Arc<RenderPassDescriptor<A>>),
}

impl<A: hal::Api> PassState<A> {
    fn kind(&self) -> Option<PassKind> {
        match *self {
            Self::None => None,
            Self::Compute => Some(PassKind::Compute),
            Self::Render(_) => Some(PassKind::Render),
        }
    }
}

#[derive(Debug)]
struct VertexBinding<A: hal::Api> {
    buffer: Arc<Buffer<A>>,
    usable_size: BufferAddress,
}

#[derive(Debug)]
struct IndexBinding<A: hal::Api> {
    buffer: Arc<Buffer<A>>,
    format: wgt::IndexFormat,
    usable_size: BufferAddress,
}

/// Usages a stream relies on without transitioning the resource first.
#[derive(Debug)]
struct AssumedUsages<R, U> {
    list: Vec<(Arc<R>, U)>,
    slots: FastHashMap<TrackerIndex, usize>,
}

impl<R, U: ResourceUses> AssumedUsages<R, U> {
    fn new() -> Self {
        Self {
            list: Vec::new(),
            slots: FastHashMap::default(),
        }
    }

    fn add(&mut self, index: TrackerIndex, resource: &Arc<R>, usage: U) {
        match self.slots.get(&index) {
            Some(&slot) => {
                let assumed = &mut self.list[slot].1;
                *assumed = *assumed | usage;
            }
            None => {
                self.slots.insert(index, self.list.len());
                self.list.push((Arc::clone(resource), usage));
            }
        }
    }
}

/// What a validated stream expects from its resources at submission.
#[derive(Debug)]
pub(crate) struct UsageScope<A: hal::Api> {
    /// Resources the stream transitions, in first-transition order.
    pub(crate) buffers_transitioned: Vec<Arc<Buffer<A>>>,
    pub(crate) textures_transitioned: Vec<Arc<Texture<A>>>,
    /// Usages relied on while the resource still had its pre-submission usage.
    pub(crate) buffers_assumed: Vec<(Arc<Buffer<A>>, BufferUsage)>,
    pub(crate) textures_assumed: Vec<(Arc<Texture<A>>, TextureUsage)>,
    pub(crate) attachments: Vec<Arc<Texture<A>>>,
    /// Usages the resources are left in once the stream has run.
    pub(crate) buffer_end_usages: Vec<(TrackerIndex, BufferUsage)>,
    pub(crate) texture_end_usages: Vec<(TrackerIndex, TextureUsage)>,
}

impl<A: hal::Api> Default for UsageScope<A> {
    fn default() -> Self {
        Self {
            buffers_transitioned: Vec::new(),
            textures_transitioned: Vec::new(),
            buffers_assumed: Vec::new(),
            textures_assumed: Vec::new(),
            attachments: Vec::new(),
            buffer_end_usages: Vec::new(),
            texture_end_usages: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct CommandBufferStateTracker<A: hal::Api> {
    aspects: ValidationAspects,
    pass: PassState<A>,
    compute_pipeline: Option<Arc<ComputePipeline<A>>>,
    render_pipeline: Option<Arc<RenderPipeline<A>>>,
    binder: Binder<A>,
    vertex_buffers: [Option<VertexBinding<A>>; wgt::MAX_VERTEX_INPUTS],
    vertex_limits: VertexLimits,
    index: Option<IndexBinding<A>>,
    index_limit: u64,
    debug_group_depth: u32,
    most_recent_buffer_usages: FastHashMap<TrackerIndex, BufferUsage>,
    most_recent_texture_usages: FastHashMap<TrackerIndex, TextureUsage>,
    buffers_transitioned: Vec<Arc<Buffer<A>>>,
    buffers_transitioned_set: FastHashSet<TrackerIndex>,
    textures_transitioned: Vec<Arc<Texture<A>>>,
    textures_transitioned_set: FastHashSet<TrackerIndex>,
    buffers_assumed: AssumedUsages<Buffer<A>, BufferUsage>,
    textures_assumed: AssumedUsages<Texture<A>, TextureUsage>,
    attachments: Vec<Arc<Texture<A>>>,
    attachments_set: FastHashSet<TrackerIndex>,
    /// Usage each texture ends in, transitions and attachments included.
    texture_end_usages: FastHashMap<TrackerIndex, TextureUsage>,
    /// Number of aspect recomputations performed so far.
    pub(crate) recompute_count: usize,
}

impl<A: hal::Api> CommandBufferStateTracker<A> {
    pub(crate) fn new() -> Self {
        Self {
            aspects: ValidationAspects::empty(),
            pass: PassState::None,
            compute_pipeline: None,
            render_pipeline: None,
            binder: Binder::new(),
            vertex_buffers: Default::default(),
            vertex_limits: VertexLimits::default(),
            index: None,
            index_limit: 0,
            debug_group_depth: 0,
            most_recent_buffer_usages: FastHashMap::default(),
            most_recent_texture_usages: FastHashMap::default(),
            buffers_transitioned: Vec::new(),
            buffers_transitioned_set: FastHashSet::default(),
            textures_transitioned: Vec::new(),
            textures_transitioned_set: FastHashSet::default(),
            buffers_assumed: AssumedUsages::new(),
            textures_assumed: AssumedUsages::new(),
            attachments: Vec::new(),
            attachments_set: FastHashSet::default(),
            texture_end_usages: FastHashMap::default(),
            recompute_count: 0,
        }
    }

    pub(crate) fn into_usage_scope(self) -> UsageScope<A> {
        let most_recent = &self.most_recent_buffer_usages;
        let buffer_end_usages = self
            .buffers_transitioned
            .iter()
            .filter_map(|buffer| {
                let index = buffer.info.tracker_index();
                most_recent.get(&index).map(|&usage| (index, usage))
            })
            .collect();
        UsageScope {
            buffers_transitioned: self.buffers_transitioned,
            textures_transitioned: self.textures_transitioned,
            buffers_assumed: self.buffers_assumed.list,
            textures_assumed: self.textures_assumed.list,
            attachments: self.attachments,
            buffer_end_usages,
            texture_end_usages: self.texture_end_usages.into_iter().collect(),
        }
    }

    fn buffer_has_guaranteed_usage(
        &mut self,
        buffer: &Arc<Buffer<A>>,
        usage: BufferUsage,
    ) -> bool {
        if buffer.has_frozen_usage(usage) {
            return true;
        }
        let index = buffer.info.tracker_index();
        if let Some(recent) = self.most_recent_buffer_usages.get(&index) {
            return recent.contains(usage);
        }
        if self.buffers_transitioned_set.contains(&index)
            || !buffer.current_usage().contains(usage)
        {
            return false;
        }
        self.buffers_assumed.add(index, buffer, usage);
        true
    }

    fn texture_has_guaranteed_usage(
        &mut self,
        texture: &Arc<Texture<A>>,
        usage: TextureUsage,
    ) -> bool {
        if texture.has_frozen_usage(usage) {
            return true;
        }
        let index = texture.info.tracker_index();
        if let Some(recent) = self.most_recent_texture_usages.get(&index) {
            return recent.contains(usage);
        }
        if self.textures_transitioned_set.contains(&index)
            || !texture.current_usage().contains(usage)
        {
            return false;
        }
        self.textures_assumed.add(index, texture, usage);
        true
    }

    pub(crate) fn validate_buffer_usage(
        &mut self,
        buffer: &Arc<Buffer<A>>,
        usage: BufferUsage,
    ) -> Result<(), GuaranteedUsageError> {
        if self.buffer_has_guaranteed_usage(buffer, usage) {
            Ok(())
        } else {
            Err(GuaranteedUsageError::Buffer {
                res: buffer.error_ident(),
                expected: usage,
            })
        }
    }

    pub(crate) fn validate_texture_usage(
        &mut self,
        texture: &Arc<Texture<A>>,
        usage: TextureUsage,
    ) -> Result<(), GuaranteedUsageError> {
        if self.texture_has_guaranteed_usage(texture, usage) {
            Ok(())
        } else {
            Err(GuaranteedUsageError::Texture {
                res: texture.error_ident(),
                expected: usage,
            })
        }
    }

    fn ensure_aspects(&mut self, required: ValidationAspects) -> Result<(), StateError> {
        let missing = required - self.aspects;
        if missing.is_empty() {
            return Ok(());
        }
        if missing.contains(ValidationAspects::COMPUTE_PASS) {
            return Err(StateError::NotInComputePass);
        }
        if missing.contains(ValidationAspects::RENDER_PASS) {
            return Err(StateError::NotInRenderPass);
        }
        if missing.contains(ValidationAspects::PIPELINE) {
            return Err(DrawError::MissingPipeline.into());
        }
        if missing.contains(ValidationAspects::BIND_GROUPS) {
            self.recompute_bind_groups()?;
            self.aspects |= ValidationAspects::BIND_GROUPS;
        }
        if missing.contains(ValidationAspects::VERTEX_BUFFERS) {
            self.recompute_vertex_buffers()?;
            self.aspects |= ValidationAspects::VERTEX_BUFFERS;
        }
        if missing.contains(ValidationAspects::INDEX_BUFFER) {
            self.recompute_index_buffer()?;
            self.aspects |= ValidationAspects::INDEX_BUFFER;
        }
        Ok(())
    }

    fn recompute_bind_groups(&mut self) -> Result<(), StateError> {
        self.recompute_count += 1;
        self.binder.check_compatibility()?;
        let groups = self
            .binder
            .list_active()
            .cloned()
            .collect::<ArrayVec<_, { hal::MAX_BIND_GROUPS }>>();
        for group in groups.iter() {
            for &(ref buffer, usage) in group.used_buffers.iter() {
                self.validate_buffer_usage(buffer, usage)?;
            }
            for &(ref texture, usage) in group.used_textures.iter() {
                self.validate_texture_usage(texture, usage)?;
            }
        }
        Ok(())
    }

    fn recompute_vertex_buffers(&mut self) -> Result<(), StateError> {
        self.recompute_count += 1;
        let pipeline = match self.render_pipeline {
            Some(ref pipeline) => Arc::clone(pipeline),
            None => return Err(DrawError::MissingPipeline.into()),
        };
        let mut inputs = ArrayVec::<VertexBufferInput, { wgt::MAX_VERTEX_INPUTS }>::new();
        for input in pipeline.input_state.inputs.iter().flatten() {
            let (buffer, usable_size) = self
                .vertex_buffers
                .get(input.slot as usize)
                .and_then(Option::as_ref)
                .map(|binding| (Arc::clone(&binding.buffer), binding.usable_size))
                .ok_or(DrawError::MissingVertexBuffer { slot: input.slot })?;
            self.validate_buffer_usage(&buffer, BufferUsage::VERTEX)?;
            inputs.push(VertexBufferInput {
                slot: input.slot,
                usable_size,
                stride: input.stride,
                step_mode: input.step_mode,
            });
        }
        self.vertex_limits = VertexLimits::new(inputs.into_iter());
        Ok(())
    }

    fn recompute_index_buffer(&mut self) -> Result<(), StateError> {
        self.recompute_count += 1;
        let pipeline_format = match self.render_pipeline {
            Some(ref pipeline) => pipeline.index_format,
            None => return Err(DrawError::MissingPipeline.into()),
        };
        let (buffer, format, usable_size) = match self.index {
            Some(ref index) => (Arc::clone(&index.buffer), index.format, index.usable_size),
            None => return Err(DrawError::MissingIndexBuffer.into()),
        };
        if format != pipeline_format {
            return Err(DrawError::UnmatchedIndexFormats {
                pipeline: pipeline_format,
                buffer: format,
            }
            .into());
        }
        self.validate_buffer_usage(&buffer, BufferUsage::INDEX)?;
        self.index_limit = usable_size / format.byte_size();
        Ok(())
    }

    pub(crate) fn validate_can_draw(&mut self, draw: &DrawArraysCmd) -> Result<(), StateError> {
        self.ensure_aspects(ValidationAspects::DRAW)?;
        self.vertex_limits
            .validate_vertex_limit(draw.first_vertex, draw.vertex_count)?;
        self.vertex_limits
            .validate_instance_limit(draw.first_instance, draw.instance_count)?;
        Ok(())
    }

    pub(crate) fn validate_can_draw_indexed(
        &mut self,
        draw: &DrawElementsCmd,
    ) -> Result<(), StateError> {
        self.ensure_aspects(ValidationAspects::DRAW_INDEXED)?;
        let last_index = draw.first_index as u64 + draw.index_count as u64;
        if last_index > self.index_limit {
            return Err(DrawError::IndexBeyondLimit {
                last_index,
                index_limit: self.index_limit,
            }
            .into());
        }
        self.vertex_limits
            .validate_instance_limit(draw.first_instance, draw.instance_count)?;
        Ok(())
    }

    pub(crate) fn validate_can_dispatch(&mut self) -> Result<(), StateError> {
        self.ensure_aspects(ValidationAspects::DISPATCH)
    }

    /// Copies and transitions happen outside of passes.
    pub(crate) fn validate_can_copy(&self) -> Result<(), StateError> {
        match self.pass.kind() {
            Some(kind) => Err(StateError::InsidePass(kind)),
            None => Ok(()),
        }
    }

    /// Dynamic render state needs a render pass.
    pub(crate) fn validate_render_pass_state(&self) -> Result<(), StateError> {
        match self.pass {
            PassState::Render(_) => Ok(()),
            _ => Err(StateError::NotInRenderPass),
        }
    }

    pub(crate) fn validate_set_push_constants(&self, stages: ShaderStage) -> Result<(), StateError> {
        match self.pass {
            PassState::None => Err(StateError::NotInPass),
            PassState::Compute if stages == ShaderStage::COMPUTE => Ok(()),
            PassState::Render(_)
                if !stages.is_empty() && ShaderStage::VERTEX_FRAGMENT.contains(stages) =>
            {
                Ok(())
            }
            PassState::Compute => Err(StateError::InvalidPushConstantStages {
                stages,
                pass: PassKind::Compute,
            }),
            PassState::Render(_) => Err(StateError::InvalidPushConstantStages {
                stages,
                pass: PassKind::Render,
            }),
        }
    }

    pub(crate) fn validate_end_command_buffer(&self) -> Result<(), StateError> {
        if let Some(kind) = self.pass.kind() {
            return Err(StateError::PassNotEnded(kind));
        }
        if self.debug_group_depth != 0 {
            return Err(StateError::DebugGroupsNotPopped(self.debug_group_depth));
        }
        Ok(())
    }

    pub(crate) fn begin_compute_pass(&mut self) -> Result<(), StateError> {
        if let Some(open) = self.pass.kind() {
            return Err(StateError::PassAlreadyOpen {
                open,
                begin: PassKind::Compute,
            });
        }
        self.pass = PassState::Compute;
        self.aspects |= ValidationAspects::COMPUTE_PASS;
        Ok(())
    }

    pub(crate) fn end_compute_pass(&mut self) -> Result<(), StateError> {
        match self.pass {
            PassState::Compute => {}
            _ => return Err(StateError::NotInComputePass),
        }
        self.pass = PassState::None;
        self.compute_pipeline = None;
        self.binder.reset_expectations();
        self.aspects -= ValidationAspects::COMPUTE_PASS | ValidationAspects::PIPELINE;
        Ok(())
    }

    pub(crate) fn begin_render_pass(
        &mut self,
        desc: &Arc<RenderPassDescriptor<A>>,
    ) -> Result<(), StateError> {
        if let Some(open) = self.pass.kind() {
            return Err(StateError::PassAlreadyOpen {
                open,
                begin: PassKind::Render,
            });
        }
        for texture in desc.attachment_textures() {
            let usable = texture.has_frozen_usage(TextureUsage::OUTPUT_ATTACHMENT)
                || texture.is_transition_possible(TextureUsage::OUTPUT_ATTACHMENT);
            if !usable {
                return Err(StateError::AttachmentUsage(texture.error_ident()));
            }
        }
        for texture in desc.attachment_textures() {
            let index = texture.info.tracker_index();
            self.most_recent_texture_usages
                .insert(index, TextureUsage::OUTPUT_ATTACHMENT);
            if !texture.is_frozen() {
                self.texture_end_usages
                    .insert(index, TextureUsage::OUTPUT_ATTACHMENT);
            }
            if self.attachments_set.insert(index) {
                self.attachments.push(Arc::clone(texture));
            }
        }
        self.pass = PassState::Render(Arc::clone(desc));
        self.aspects |= ValidationAspects::RENDER_PASS;
        Ok(())
    }

    pub(crate) fn end_render_pass(&mut self) -> Result<(), StateError> {
        let desc = match self.pass {
            PassState::Render(ref desc) => Arc::clone(desc),
            _ => return Err(StateError::NotInRenderPass),
        };
        // The content of the attachments is only usable again after a transition.
        for texture in desc.attachment_textures() {
            self.most_recent_texture_usages
                .insert(texture.info.tracker_index(), TextureUsage::empty());
        }
        self.pass = PassState::None;
        self.render_pipeline = None;
        self.binder.reset_expectations();
        self.aspects -= ValidationAspects::RENDER_PASS | ValidationAspects::PIPELINE;
        Ok(())
    }

    pub(crate) fn set_compute_pipeline(
        &mut self,
        pipeline: &Arc<ComputePipeline<A>>,
    ) -> Result<(), StateError> {
        match self.pass {
            PassState::Compute => {}
            _ => return Err(StateError::NotInComputePass),
        }
        self.binder.change_pipeline_layout(&pipeline.layout);
        self.compute_pipeline = Some(Arc::clone(pipeline));
        self.aspects |= ValidationAspects::PIPELINE;
        self.aspects -= ValidationAspects::RESOURCE_DEPENDENT;
        Ok(())
    }

    pub(crate) fn set_render_pipeline(
        &mut self,
        pipeline: &Arc<RenderPipeline<A>>,
    ) -> Result<(), StateError> {
        match self.pass {
            PassState::Render(ref desc) => desc.context.check_compatible(&pipeline.pass_context)?,
            _ => return Err(StateError::NotInRenderPass),
        }
        self.binder.change_pipeline_layout(&pipeline.layout);
        self.render_pipeline = Some(Arc::clone(pipeline));
        self.aspects |= ValidationAspects::PIPELINE;
        self.aspects -= ValidationAspects::RESOURCE_DEPENDENT;
        Ok(())
    }

    pub(crate) fn set_bind_group(
        &mut self,
        index: u32,
        group: &Arc<BindGroup<A>>,
        dynamic_offsets: &[wgt::DynamicOffset],
    ) -> Result<(), StateError> {
        if let PassState::None = self.pass {
            return Err(StateError::NotInPass);
        }
        if index as usize >= hal::MAX_BIND_GROUPS {
            return Err(StateError::BindGroupIndexOutOfRange { index });
        }
        group.validate_dynamic_bindings(dynamic_offsets)?;
        self.binder
            .assign_group(index as usize, group, dynamic_offsets);
        self.aspects -= ValidationAspects::BIND_GROUPS;
        Ok(())
    }

    pub(crate) fn set_vertex_buffers(
        &mut self,
        start_slot: u32,
        buffers: &[Arc<Buffer<A>>],
        offsets: &[BufferAddress],
    ) -> Result<(), StateError> {
        self.validate_render_pass_state()?;
        for (i, (buffer, &offset)) in buffers.iter().zip(offsets.iter()).enumerate() {
            self.validate_buffer_usage(buffer, BufferUsage::VERTEX)?;
            let slot = start_slot as usize + i;
            if let Some(entry) = self.vertex_buffers.get_mut(slot) {
                *entry = Some(VertexBinding {
                    buffer: Arc::clone(buffer),
                    usable_size: buffer.size.saturating_sub(offset),
                });
            }
        }
        self.aspects -= ValidationAspects::VERTEX_BUFFERS;
        Ok(())
    }

    pub(crate) fn set_index_buffer(
        &mut self,
        buffer: &Arc<Buffer<A>>,
        offset: BufferAddress,
        format: wgt::IndexFormat,
    ) -> Result<(), StateError> {
        self.validate_render_pass_state()?;
        self.validate_buffer_usage(buffer, BufferUsage::INDEX)?;
        self.index = Some(IndexBinding {
            buffer: Arc::clone(buffer),
            format,
            usable_size: buffer.size.saturating_sub(offset),
        });
        self.aspects -= ValidationAspects::INDEX_BUFFER;
        Ok(())
    }

    pub(crate) fn transition_buffer_usage(
        &mut self,
        buffer: &Arc<Buffer<A>>,
        usage: BufferUsage,
    ) -> Result<(), StateError> {
        self.validate_can_copy()?;
        let checked = buffer.state.lock().usage.check_transition(usage);
        if let Err(error) = checked {
            return Err(StateError::BufferTransition {
                res: buffer.error_ident(),
                usage,
                reason: TransitionFailure::of(&error),
                error,
            });
        }

        let index = buffer.info.tracker_index();
        self.most_recent_buffer_usages.insert(index, usage);
        if self.buffers_transitioned_set.insert(index) {
            self.buffers_transitioned.push(Arc::clone(buffer));
        }
        self.aspects -= ValidationAspects::RESOURCE_DEPENDENT;
        Ok(())
    }

    pub(crate) fn transition_texture_usage(
        &mut self,
        texture: &Arc<Texture<A>>,
        usage: TextureUsage,
    ) -> Result<(), StateError> {
        self.validate_can_copy()?;
        if usage.contains(TextureUsage::OUTPUT_ATTACHMENT) {
            return Err(StateError::ExplicitOutputAttachment(texture.error_ident()));
        }
        let checked = texture.usage.lock().check_transition(usage);
        if let Err(error) = checked {
            return Err(StateError::TextureTransition {
                res: texture.error_ident(),
                usage,
                reason: TransitionFailure::of(&error),
                error,
            });
        }

        let index = texture.info.tracker_index();
        self.most_recent_texture_usages.insert(index, usage);
        self.texture_end_usages.insert(index, usage);
        if self.textures_transitioned_set.insert(index) {
            self.textures_transitioned.push(Arc::clone(texture));
        }
        self.aspects -= ValidationAspects::RESOURCE_DEPENDENT;
        Ok(())
    }

    pub(crate) fn push_debug_group(&mut self) {
        self.debug_group_depth += 1;
    }

    pub(crate) fn pop_debug_group(&mut self) -> Result<(), StateError> {
        if self.debug_group_depth == 0 {
            return Err(StateError::DebugGroupUnderflow);
        }
        self.debug_group_depth -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding_model::{
            BindGroupDescriptor, BindGroupEntry, BindGroupLayoutDescriptor, BindingResource,
            BufferBinding, PipelineLayoutDescriptor,
        },
        command::render::{RenderPassColorAttachment, RenderPassInfo},
        device::Device,
        pipeline::{
            InputStateDescriptor, ProgrammableStageDescriptor, ReflectedBinding,
            RenderPipelineDescriptor, ShaderModuleDescriptor, ShaderReflection,
        },
        resource::{BufferDescriptor, TextureDescriptor, TextureViewDescriptor},
    };
    use hal::empty::{self, Api};
    use wgt::{BufferUsage as Bu, TextureUsage as Tu};

    struct Fixture {
        device: Arc<Device<Api>>,
        pipeline: Arc<RenderPipeline<Api>>,
        pass: Arc<RenderPassDescriptor<Api>>,
        target: Arc<Texture<Api>>,
    }

    fn fixture() -> Fixture {
        let device =
            Device::new(empty::Context::open(), wgt::Limits::default(), Some("state")).unwrap();
        let bgl = device
            .create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: Some("uniforms"),
                entries: &[wgt::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStage::VERTEX,
                    ty: wgt::BindingType::UniformBuffer,
                    has_dynamic_offset: false,
                }],
            })
            .unwrap();
        let layout = device
            .create_pipeline_layout(&PipelineLayoutDescriptor {
                label: None,
                bind_group_layouts: &[Some(bgl)],
            })
            .unwrap();
        let vs = device
            .create_shader_module(&ShaderModuleDescriptor {
                label: Some("vs"),
                stage: ShaderStage::VERTEX,
                reflection: ShaderReflection {
                    entry_point: "main".to_string(),
                    bindings: vec![ReflectedBinding {
                        group: 0,
                        binding: 0,
                        ty: wgt::BindingType::UniformBuffer,
                    }],
                    vertex_inputs_used: 1,
                    ..Default::default()
                },
            })
            .unwrap();
        let fs = device
            .create_shader_module(&ShaderModuleDescriptor {
                label: Some("fs"),
                stage: ShaderStage::FRAGMENT,
                reflection: ShaderReflection {
                    entry_point: "main".to_string(),
                    ..Default::default()
                },
            })
            .unwrap();
        let input_state = device
            .create_input_state(&InputStateDescriptor {
                label: None,
                inputs: &[wgt::VertexInput {
                    slot: 0,
                    stride: 12,
                    step_mode: wgt::InputStepMode::Vertex,
                }],
                attributes: &[wgt::VertexAttribute {
                    location: 0,
                    slot: 0,
                    format: wgt::VertexFormat::Float3,
                    offset: 0,
                }],
            })
            .unwrap();
        let target = device
            .create_texture(&TextureDescriptor {
                label: Some("target"),
                size: wgt::Extent3d {
                    width: 64,
                    height: 64,
                    depth: 1,
                },
                mip_level_count: 1,
                format: wgt::TextureFormat::R8G8B8A8Unorm,
                allowed_usage: Tu::OUTPUT_ATTACHMENT | Tu::TRANSFER_SRC,
                initial_usage: Tu::OUTPUT_ATTACHMENT,
            })
            .unwrap();
        let view = device
            .create_texture_view(&target, &TextureViewDescriptor::default())
            .unwrap();
        let pass = device
            .create_render_pass_descriptor(&RenderPassInfo {
                label: Some("pass"),
                color_attachments: &[RenderPassColorAttachment {
                    view,
                    load_op: wgt::LoadOp::Clear(wgt::Color::BLACK),
                }],
                depth_stencil_attachment: None,
            })
            .unwrap();
        let pipeline = device
            .create_render_pipeline(&RenderPipelineDescriptor {
                label: Some("pipeline"),
                layout: &layout,
                input_state: &input_state,
                vertex_stage: ProgrammableStageDescriptor {
                    module: &vs,
                    entry_point: "main",
                },
                fragment_stage: ProgrammableStageDescriptor {
                    module: &fs,
                    entry_point: "main",
                },
                index_format: wgt::IndexFormat::Uint16,
                color_formats: &[wgt::TextureFormat::R8G8B8A8Unorm],
                depth_stencil_format: None,
            })
            .unwrap();
        Fixture {
            device,
            pipeline,
            pass,
            target,
        }
    }

    fn buffer(fixture: &Fixture, size: u64, allowed: Bu, initial: Bu) -> Arc<Buffer<Api>> {
        fixture
            .device
            .create_buffer(&BufferDescriptor {
                label: None,
                size,
                allowed_usage: allowed,
                initial_usage: initial,
            })
            .unwrap()
    }

    fn uniform_group(fixture: &Fixture) -> Arc<BindGroup<Api>> {
        let uniforms = buffer(fixture, 256, Bu::UNIFORM, Bu::UNIFORM);
        let layout = fixture.pipeline.layout().bind_group_layout(0).unwrap();
        fixture
            .device
            .create_bind_group(&BindGroupDescriptor {
                label: Some("group"),
                layout,
                entries: &[BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::Buffer(BufferBinding {
                        buffer: &uniforms,
                        offset: 0,
                        size: 16,
                    }),
                }],
            })
            .unwrap()
    }

    const FOUR_VERTICES: DrawArraysCmd = DrawArraysCmd {
        vertex_count: 4,
        instance_count: 1,
        first_vertex: 0,
        first_instance: 0,
    };

    #[test]
    fn legal_draw_and_lazy_aspects() {
        let f = fixture();
        let vertices = buffer(&f, 48, Bu::VERTEX, Bu::VERTEX);
        let group = uniform_group(&f);
        let mut state = CommandBufferStateTracker::new();
        state.begin_render_pass(&f.pass).unwrap();
        state.set_render_pipeline(&f.pipeline).unwrap();
        state.set_bind_group(0, &group, &[]).unwrap();
        state.set_vertex_buffers(0, &[vertices], &[0]).unwrap();

        state.validate_can_draw(&FOUR_VERTICES).unwrap();
        let count = state.recompute_count;
        assert_eq!(count, 2);
        state.validate_can_draw(&FOUR_VERTICES).unwrap();
        assert_eq!(state.recompute_count, count);

        let too_many = DrawArraysCmd {
            vertex_count: 5,
            ..FOUR_VERTICES
        };
        assert!(matches!(
            state.validate_can_draw(&too_many),
            Err(StateError::Draw(DrawError::VertexBeyondLimit {
                last_vertex: 5,
                vertex_limit: 4,
                slot: 0,
            }))
        ));
        assert_eq!(state.recompute_count, count);

        state.set_bind_group(0, &group, &[]).unwrap();
        state.validate_can_draw(&FOUR_VERTICES).unwrap();
        assert_eq!(state.recompute_count, count + 1);

        state.end_render_pass().unwrap();
        state.validate_end_command_buffer().unwrap();
    }

    #[test]
    fn missing_bind_group() {
        let f = fixture();
        let vertices = buffer(&f, 48, Bu::VERTEX, Bu::VERTEX);
        let mut state = CommandBufferStateTracker::new();
        state.begin_render_pass(&f.pass).unwrap();
        state.set_render_pipeline(&f.pipeline).unwrap();
        state.set_vertex_buffers(0, &[vertices], &[0]).unwrap();
        assert!(matches!(
            state.validate_can_draw(&FOUR_VERTICES),
            Err(StateError::Draw(DrawError::MissingBindGroup { index: 0 }))
        ));
    }

    #[test]
    fn indexed_draws_check_the_index_buffer() {
        let f = fixture();
        let vertices = buffer(&f, 48, Bu::VERTEX, Bu::VERTEX);
        let indices = buffer(&f, 12, Bu::INDEX, Bu::INDEX);
        let group = uniform_group(&f);
        let mut state = CommandBufferStateTracker::new();
        state.begin_render_pass(&f.pass).unwrap();
        state.set_render_pipeline(&f.pipeline).unwrap();
        state.set_bind_group(0, &group, &[]).unwrap();
        state.set_vertex_buffers(0, &[vertices], &[0]).unwrap();

        let draw = DrawElementsCmd {
            index_count: 6,
            instance_count: 1,
            first_index: 0,
            first_instance: 0,
        };
        assert!(matches!(
            state.validate_can_draw_indexed(&draw),
            Err(StateError::Draw(DrawError::MissingIndexBuffer))
        ));
        state
            .set_index_buffer(&indices, 0, wgt::IndexFormat::Uint32)
            .unwrap();
        assert!(matches!(
            state.validate_can_draw_indexed(&draw),
            Err(StateError::Draw(DrawError::UnmatchedIndexFormats { .. }))
        ));
        state
            .set_index_buffer(&indices, 0, wgt::IndexFormat::Uint16)
            .unwrap();
        state.validate_can_draw_indexed(&draw).unwrap();
        assert!(matches!(
            state.validate_can_draw_indexed(&DrawElementsCmd {
                first_index: 1,
                ..draw
            }),
            Err(StateError::Draw(DrawError::IndexBeyondLimit {
                last_index: 7,
                index_limit: 6,
            }))
        ));
    }

    #[test]
    fn transitions_feed_guaranteed_usage() {
        let f = fixture();
        let vertices = buffer(&f, 48, Bu::VERTEX | Bu::TRANSFER_DST, Bu::TRANSFER_DST);
        let mut state = CommandBufferStateTracker::new();

        state.begin_render_pass(&f.pass).unwrap();
        assert!(matches!(
            state.set_vertex_buffers(0, &[Arc::clone(&vertices)], &[0]),
            Err(StateError::Usage(GuaranteedUsageError::Buffer { .. }))
        ));
        assert!(matches!(
            state.transition_buffer_usage(&vertices, Bu::VERTEX),
            Err(StateError::InsidePass(PassKind::Render))
        ));
        state.end_render_pass().unwrap();

        state.transition_buffer_usage(&vertices, Bu::VERTEX).unwrap();
        state.begin_render_pass(&f.pass).unwrap();
        state
            .set_vertex_buffers(0, &[Arc::clone(&vertices)], &[0])
            .unwrap();
        state.end_render_pass().unwrap();

        // the recorded usage wins over the current one
        assert_eq!(vertices.current_usage(), Bu::TRANSFER_DST);
        assert!(state.validate_buffer_usage(&vertices, Bu::TRANSFER_DST).is_err());

        let scope = state.into_usage_scope();
        assert_eq!(scope.buffers_transitioned.len(), 1);
        assert_eq!(
            scope.buffer_end_usages,
            vec![(vertices.info.tracker_index(), Bu::VERTEX)]
        );
        assert!(scope.buffers_assumed.is_empty());
        assert!(scope.textures_transitioned.is_empty());
        assert_eq!(scope.attachments.len(), 1);
    }

    #[test]
    fn transition_failures_are_named() {
        let f = fixture();
        let frozen = buffer(&f, 16, Bu::VERTEX | Bu::INDEX, Bu::VERTEX);
        frozen.freeze_usage(Bu::VERTEX).unwrap();
        let mut state = CommandBufferStateTracker::<Api>::new();

        let error = state
            .transition_buffer_usage(&frozen, Bu::INDEX)
            .unwrap_err();
        assert!(error.to_string().ends_with("usage is frozen"));
        let error = state
            .transition_texture_usage(&f.target, Tu::SAMPLED)
            .unwrap_err();
        assert!(error.to_string().ends_with("usage not allowed"));
        assert!(matches!(
            state.transition_texture_usage(&f.target, Tu::OUTPUT_ATTACHMENT),
            Err(StateError::ExplicitOutputAttachment(_))
        ));
        // frozen usage is always guaranteed
        state.validate_buffer_usage(&frozen, Bu::VERTEX).unwrap();
    }

    #[test]
    fn attachments_need_a_transition_after_the_pass() {
        let f = fixture();
        let mut state = CommandBufferStateTracker::<Api>::new();
        state.begin_render_pass(&f.pass).unwrap();
        state.end_render_pass().unwrap();
        assert!(state
            .validate_texture_usage(&f.target, Tu::OUTPUT_ATTACHMENT)
            .is_err());
        state
            .transition_texture_usage(&f.target, Tu::TRANSFER_SRC)
            .unwrap();
        state
            .validate_texture_usage(&f.target, Tu::TRANSFER_SRC)
            .unwrap();
    }

    #[test]
    fn pass_scoping() {
        let f = fixture();
        let mut state = CommandBufferStateTracker::<Api>::new();
        assert!(matches!(
            state.validate_can_draw(&FOUR_VERTICES),
            Err(StateError::NotInRenderPass)
        ));
        assert!(matches!(
            state.validate_can_dispatch(),
            Err(StateError::NotInComputePass)
        ));
        assert!(matches!(
            state.end_compute_pass(),
            Err(StateError::NotInComputePass)
        ));
        assert!(matches!(
            state.validate_set_push_constants(ShaderStage::COMPUTE),
            Err(StateError::NotInPass)
        ));

        state.begin_compute_pass().unwrap();
        assert!(matches!(
            state.begin_render_pass(&f.pass),
            Err(StateError::PassAlreadyOpen {
                open: PassKind::Compute,
                begin: PassKind::Render,
            })
        ));
        assert!(matches!(
            state.validate_can_dispatch(),
            Err(StateError::Draw(DrawError::MissingPipeline))
        ));
        assert!(matches!(
            state.validate_set_push_constants(ShaderStage::VERTEX),
            Err(StateError::InvalidPushConstantStages { .. })
        ));
        state
            .validate_set_push_constants(ShaderStage::COMPUTE)
            .unwrap();
        assert!(matches!(
            state.validate_end_command_buffer(),
            Err(StateError::PassNotEnded(PassKind::Compute))
        ));
        state.end_compute_pass().unwrap();

        assert!(matches!(
            state.pop_debug_group(),
            Err(StateError::DebugGroupUnderflow)
        ));
        state.push_debug_group();
        assert!(matches!(
            state.validate_end_command_buffer(),
            Err(StateError::DebugGroupsNotPopped(1))
        ));
        state.pop_debug_group().unwrap();
        state.validate_end_command_buffer().unwrap();
    }
}
