use crate::{
    binding_model::PipelineLayout,
    device::{Device, RenderPassContext},
    resource::{DeviceError, ResourceInfo},
    validation, Label,
};

use thiserror::Error;

use std::{mem::ManuallyDrop, sync::Arc};

/// A binding a shader entry point reads or writes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReflectedBinding {
    pub group: u32,
    pub binding: u32,
    pub ty: wgt::BindingType,
}

/// Push constant slots used by one stage, with the scalar type of each slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PushConstantInfo {
    pub mask: u32,
    pub types: [wgt::PushConstantType; wgt::MAX_PUSH_CONSTANTS],
}

impl PushConstantInfo {
    /// `slot` must be lower than `MAX_PUSH_CONSTANTS`.
    pub fn set(&mut self, slot: u32, ty: wgt::PushConstantType) {
        self.mask |= 1 << slot;
        self.types[slot as usize] = ty;
    }
}

/// Everything the core needs to know about a compiled shader entry point.
#[derive(Clone, Debug, Default)]
pub struct ShaderReflection {
    pub entry_point: String,
    pub bindings: Vec<ReflectedBinding>,
    pub push_constants: PushConstantInfo,
    /// Bit mask of the vertex input locations read, for vertex shaders.
    pub vertex_inputs_used: u32,
}

#[derive(Clone, Debug)]
pub struct ShaderModuleDescriptor<'a> {
    pub label: Label<'a>,
    pub stage: wgt::ShaderStage,
    pub reflection: ShaderReflection,
}

#[derive(Clone, Debug, Error)]
pub enum CreateShaderModuleError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Shader module must target exactly one stage, got {0:?}")]
    InvalidStage(wgt::ShaderStage),
    #[error("Binding {binding} in group {group} is out of range")]
    BindingOutOfRange { group: u32, binding: u32 },
    #[error("Vertex inputs are only valid in vertex shaders")]
    UnexpectedVertexInputs,
}

#[derive(Debug)]
pub struct ShaderModule<A: hal::Api> {
    pub(crate) raw: ManuallyDrop<A::ShaderModule>,
    pub(crate) device: Arc<Device<A>>,
    pub(crate) stage: wgt::ShaderStage,
    pub(crate) reflection: ShaderReflection,
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> Drop for ShaderModule<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw ShaderModule {:?}", self.info.label());
        unsafe {
            use hal::Device as _;
            let raw = ManuallyDrop::take(&mut self.raw);
            self.device.raw.destroy_shader_module(raw);
        }
    }
}

impl<A: hal::Api> ShaderModule<A> {
    pub fn stage(&self) -> wgt::ShaderStage {
        self.stage
    }
}

#[derive(Clone, Debug)]
pub struct InputStateDescriptor<'a> {
    pub label: Label<'a>,
    pub inputs: &'a [wgt::VertexInput],
    pub attributes: &'a [wgt::VertexAttribute],
}

#[derive(Clone, Debug, Error)]
pub enum CreateInputStateError {
    #[error("Vertex buffer slot {slot} exceeds the limit {limit}")]
    SlotOutOfRange { slot: u32, limit: u32 },
    #[error("Vertex buffer slot {0} is declared more than once")]
    DuplicateSlot(u32),
    #[error("Vertex buffer slot {slot} stride {stride} exceeds the limit {limit}")]
    StrideTooLarge { slot: u32, stride: u32, limit: u32 },
    #[error("Vertex attribute location {location} exceeds the limit {limit}")]
    LocationOutOfRange { location: u32, limit: u32 },
    #[error("Two or more vertex attributes were assigned to the same location: {0}")]
    ShaderLocationClash(u32),
    #[error("Vertex attribute at location {location} reads from undeclared slot {slot}")]
    UndeclaredSlot { location: u32, slot: u32 },
    #[error("Vertex attribute at location {location} ends at {end}, past the slot stride {stride}")]
    AttributeOutOfStride { location: u32, end: u64, stride: u32 },
}

/// Vertex fetch description: which buffer slots are read and how.
#[derive(Debug)]
pub struct InputState {
    pub(crate) inputs: [Option<wgt::VertexInput>; wgt::MAX_VERTEX_INPUTS],
    pub(crate) attributes: [Option<wgt::VertexAttribute>; wgt::MAX_VERTEX_ATTRIBUTES],
    /// Bit mask of the declared slots.
    pub(crate) inputs_mask: u32,
    /// Bit mask of the declared locations.
    pub(crate) attributes_mask: u32,
    pub(crate) info: ResourceInfo,
}

impl InputState {
    pub fn label(&self) -> &str {
        self.info.label()
    }

    pub fn input(&self, slot: u32) -> Option<&wgt::VertexInput> {
        self.inputs.get(slot as usize).and_then(Option::as_ref)
    }

    pub fn inputs_mask(&self) -> u32 {
        self.inputs_mask
    }

    pub fn attributes_mask(&self) -> u32 {
        self.attributes_mask
    }
}

/// Describes a programmable pipeline stage.
#[derive(Debug)]
pub struct ProgrammableStageDescriptor<'a, A: hal::Api> {
    /// The shader module for this stage.
    pub module: &'a Arc<ShaderModule<A>>,
    /// The name of the entry point in the shader module.
    pub entry_point: &'a str,
}

#[derive(Debug)]
pub struct ComputePipelineDescriptor<'a, A: hal::Api> {
    pub label: Label<'a>,
    pub layout: &'a Arc<PipelineLayout<A>>,
    pub stage: ProgrammableStageDescriptor<'a, A>,
}

#[derive(Clone, Debug, Error)]
pub enum CreateComputePipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Error matching shader requirements against the pipeline")]
    Stage(#[from] validation::StageError),
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug)]
pub struct ComputePipeline<A: hal::Api> {
    pub(crate) raw: ManuallyDrop<A::ComputePipeline>,
    pub(crate) device: Arc<Device<A>>,
    pub(crate) layout: Arc<PipelineLayout<A>>,
    #[allow(dead_code)]
    pub(crate) push_constants: PushConstantInfo,
    pub(crate) _shader_module: Arc<ShaderModule<A>>,
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> Drop for ComputePipeline<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw ComputePipeline {:?}", self.info.label());
        unsafe {
            use hal::Device as _;
            let raw = ManuallyDrop::take(&mut self.raw);
            self.device.raw.destroy_compute_pipeline(raw);
        }
    }
}

impl<A: hal::Api> ComputePipeline<A> {
    pub fn layout(&self) -> &Arc<PipelineLayout<A>> {
        &self.layout
    }
}

#[derive(Debug)]
pub struct RenderPipelineDescriptor<'a, A: hal::Api> {
    pub label: Label<'a>,
    pub layout: &'a Arc<PipelineLayout<A>>,
    pub input_state: &'a Arc<InputState>,
    pub vertex_stage: ProgrammableStageDescriptor<'a, A>,
    pub fragment_stage: ProgrammableStageDescriptor<'a, A>,
    /// Format of the indices read by indexed draws.
    pub index_format: wgt::IndexFormat,
    /// Formats of the color attachments the pipeline renders into.
    pub color_formats: &'a [wgt::TextureFormat],
    pub depth_stencil_format: Option<wgt::TextureFormat>,
}

#[derive(Clone, Debug, Error)]
pub enum CreateRenderPipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Color attachment count {given} must be between 1 and {limit}")]
    InvalidColorAttachmentCount { given: usize, limit: u32 },
    #[error("Format {0:?} can't be used as a color attachment")]
    InvalidColorFormat(wgt::TextureFormat),
    #[error("Format {0:?} can't be used as a depth/stencil attachment")]
    InvalidDepthStencilFormat(wgt::TextureFormat),
    #[error("Push constant slot {slot} is used with different types by the vertex and fragment stages")]
    PushConstantTypeMismatch { slot: u32 },
    #[error("Error matching {stage:?} shader requirements against the pipeline")]
    Stage {
        stage: wgt::ShaderStage,
        #[source]
        error: validation::StageError,
    },
    #[error("Internal error in {stage:?} shader: {error}")]
    Internal {
        stage: wgt::ShaderStage,
        error: String,
    },
}

#[derive(Debug)]
pub struct RenderPipeline<A: hal::Api> {
    pub(crate) raw: ManuallyDrop<A::RenderPipeline>,
    pub(crate) device: Arc<Device<A>>,
    pub(crate) layout: Arc<PipelineLayout<A>>,
    pub(crate) input_state: Arc<InputState>,
    pub(crate) index_format: wgt::IndexFormat,
    pub(crate) pass_context: RenderPassContext,
    #[allow(dead_code)]
    pub(crate) vertex_push_constants: PushConstantInfo,
    #[allow(dead_code)]
    pub(crate) fragment_push_constants: PushConstantInfo,
    pub(crate) _shader_modules: [Arc<ShaderModule<A>>; 2],
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> Drop for RenderPipeline<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw RenderPipeline {:?}", self.info.label());
        unsafe {
            use hal::Device as _;
            let raw = ManuallyDrop::take(&mut self.raw);
            self.device.raw.destroy_render_pipeline(raw);
        }
    }
}

impl<A: hal::Api> RenderPipeline<A> {
    pub fn layout(&self) -> &Arc<PipelineLayout<A>> {
        &self.layout
    }

    pub fn input_state(&self) -> &Arc<InputState> {
        &self.input_state
    }

    pub fn index_format(&self) -> wgt::IndexFormat {
        self.index_format
    }
}
