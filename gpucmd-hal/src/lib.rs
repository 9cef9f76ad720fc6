/*! This library describes the backend abstraction the gpucmd core translates into.
 *  It follows the validated command model of the core, with the following deviations:
 *  - Fully unsafe: zero overhead, zero validation.
 *  - Compile-time backend selection via traits.
 *  - Objects are passed by references and returned by value. No IDs.
 *  - Resource transitions are explicit.
 *  - All layouts are explicit.
 */

#![allow(
    // We use loops for getting early-out of scope without closures.
    clippy::never_loop,
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Redundant matching is more explicit.
    clippy::redundant_pattern_matching,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // No need for defaults in the internal types.
    clippy::new_without_default,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

pub mod empty;

use std::{fmt, ops::Range};

use thiserror::Error;

pub use wgt::{MAX_BIND_GROUPS, MAX_COLOR_ATTACHMENTS, MAX_VERTEX_INPUTS};

pub type Label<'a> = Option<&'a str>;
pub type MemoryRange = Range<wgt::BufferAddress>;
pub type FenceValue = u64;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum DeviceError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("device is lost")]
    Lost,
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum PipelineError {
    #[error("linkage failed for stage {0:?}: {1}")]
    Linkage(wgt::ShaderStage, String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub trait Api: Clone + fmt::Debug + Sized + 'static {
    type Device: Device<Self> + Send + Sync;
    type Queue: Queue<Self> + Send;

    type CommandEncoder: CommandEncoder<Self>;
    type RenderPass: RenderPass<Self>;
    type ComputePass: ComputePass<Self>;
    type CommandBuffer: fmt::Debug + Send + Sync;

    type Buffer: fmt::Debug + Send + Sync + 'static;
    type Texture: fmt::Debug + Send + Sync + 'static;
    type TextureView: fmt::Debug + Send + Sync;
    type Sampler: fmt::Debug + Send + Sync;

    type BindGroupLayout: fmt::Debug + Send + Sync;
    type BindGroup: fmt::Debug + Send + Sync;
    type PipelineLayout: fmt::Debug + Send + Sync;
    type ShaderModule: fmt::Debug + Send + Sync;
    type RenderPipeline: fmt::Debug + Send + Sync;
    type ComputePipeline: fmt::Debug + Send + Sync;
}

pub trait Device<A: Api> {
    /// Creates a new buffer.
    ///
    /// The initial usage is the one of the descriptor.
    unsafe fn create_buffer(&self, desc: &BufferDescriptor) -> Result<A::Buffer, DeviceError>;
    unsafe fn destroy_buffer(&self, buffer: A::Buffer);
    /// Writes `data` into the buffer at `offset`. The buffer is in `TRANSFER_DST` usage.
    unsafe fn write_buffer(
        &self,
        buffer: &A::Buffer,
        offset: wgt::BufferAddress,
        data: &[u8],
    ) -> Result<(), DeviceError>;
    /// Reads back a range of a buffer in `MAP_READ` usage.
    ///
    /// All the work touching the buffer must be complete.
    unsafe fn read_buffer(
        &self,
        buffer: &A::Buffer,
        range: MemoryRange,
    ) -> Result<Vec<u8>, DeviceError>;

    unsafe fn create_texture(&self, desc: &TextureDescriptor) -> Result<A::Texture, DeviceError>;
    unsafe fn destroy_texture(&self, texture: A::Texture);
    unsafe fn create_texture_view(
        &self,
        texture: &A::Texture,
        desc: &TextureViewDescriptor,
    ) -> Result<A::TextureView, DeviceError>;
    unsafe fn destroy_texture_view(&self, view: A::TextureView);
    unsafe fn create_sampler(&self, desc: &SamplerDescriptor) -> Result<A::Sampler, DeviceError>;
    unsafe fn destroy_sampler(&self, sampler: A::Sampler);

    unsafe fn create_command_encoder(
        &self,
        desc: &CommandEncoderDescriptor,
    ) -> Result<A::CommandEncoder, DeviceError>;
    unsafe fn destroy_command_encoder(&self, encoder: A::CommandEncoder);
    unsafe fn destroy_command_buffer(&self, cmd_buf: A::CommandBuffer);

    unsafe fn create_bind_group_layout(
        &self,
        desc: &BindGroupLayoutDescriptor,
    ) -> Result<A::BindGroupLayout, DeviceError>;
    unsafe fn destroy_bind_group_layout(&self, bg_layout: A::BindGroupLayout);
    unsafe fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDescriptor<A>,
    ) -> Result<A::PipelineLayout, DeviceError>;
    unsafe fn destroy_pipeline_layout(&self, pipeline_layout: A::PipelineLayout);
    unsafe fn create_bind_group(
        &self,
        desc: &BindGroupDescriptor<A>,
    ) -> Result<A::BindGroup, DeviceError>;
    unsafe fn destroy_bind_group(&self, group: A::BindGroup);

    unsafe fn create_shader_module(
        &self,
        desc: &ShaderModuleDescriptor,
    ) -> Result<A::ShaderModule, DeviceError>;
    unsafe fn destroy_shader_module(&self, module: A::ShaderModule);
    unsafe fn create_render_pipeline(
        &self,
        desc: &RenderPipelineDescriptor<A>,
    ) -> Result<A::RenderPipeline, PipelineError>;
    unsafe fn destroy_render_pipeline(&self, pipeline: A::RenderPipeline);
    unsafe fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDescriptor<A>,
    ) -> Result<A::ComputePipeline, PipelineError>;
    unsafe fn destroy_compute_pipeline(&self, pipeline: A::ComputePipeline);

    /// Returns the last fence value the GPU has reached.
    unsafe fn get_fence_value(&self) -> Result<FenceValue, DeviceError>;
}

pub trait Queue<A: Api> {
    /// Submits the command buffers in order and signals `signal_value`
    /// once all of them are complete.
    unsafe fn submit(
        &mut self,
        command_buffers: &[&A::CommandBuffer],
        signal_value: FenceValue,
    ) -> Result<(), DeviceError>;
}

pub trait CommandEncoder<A: Api> {
    unsafe fn begin_encoding(&mut self, label: Label) -> Result<(), DeviceError>;
    unsafe fn end_encoding(&mut self) -> Result<A::CommandBuffer, DeviceError>;

    unsafe fn transition_buffers<'a, T>(&mut self, barriers: T)
    where
        T: Iterator<Item = BufferBarrier<'a, A>>;

    unsafe fn transition_textures<'a, T>(&mut self, barriers: T)
    where
        T: Iterator<Item = TextureBarrier<'a, A>>;

    unsafe fn copy_buffer_to_buffer<T>(&mut self, src: &A::Buffer, dst: &A::Buffer, regions: T)
    where
        T: Iterator<Item = BufferCopy>;

    /// Note: `dst` current usage has to be `TextureUsage::TRANSFER_DST`.
    unsafe fn copy_buffer_to_texture<T>(&mut self, src: &A::Buffer, dst: &A::Texture, regions: T)
    where
        T: Iterator<Item = BufferTextureCopy>;

    unsafe fn copy_texture_to_buffer<T>(&mut self, src: &A::Texture, dst: &A::Buffer, regions: T)
    where
        T: Iterator<Item = BufferTextureCopy>;

    unsafe fn push_debug_group(&mut self, label: &str);
    unsafe fn pop_debug_group(&mut self);
    unsafe fn insert_debug_marker(&mut self, label: &str);

    unsafe fn begin_render_pass(&mut self, desc: &RenderPassDescriptor<A>) -> A::RenderPass;
    unsafe fn end_render_pass(&mut self, pass: A::RenderPass);
    unsafe fn begin_compute_pass(&mut self) -> A::ComputePass;
    unsafe fn end_compute_pass(&mut self, pass: A::ComputePass);
}

pub trait RenderPass<A: Api> {
    unsafe fn set_pipeline(&mut self, pipeline: &A::RenderPipeline);

    /// Sets the bind group at `index` to `group`, assuming the layout
    /// of all the preceeding groups to be taken from `layout`.
    unsafe fn set_bind_group(
        &mut self,
        layout: &A::PipelineLayout,
        index: u32,
        group: &A::BindGroup,
        dynamic_offsets: &[wgt::DynamicOffset],
    );
    unsafe fn set_push_constants(&mut self, stages: wgt::ShaderStage, offset: u32, data: &[u32]);

    unsafe fn set_index_buffer<'a>(
        &mut self,
        binding: BufferBinding<'a, A>,
        format: wgt::IndexFormat,
    );
    unsafe fn set_vertex_buffer<'a>(&mut self, index: u32, binding: BufferBinding<'a, A>);
    unsafe fn set_scissor_rect(&mut self, rect: &Rect<u32>);
    unsafe fn set_stencil_reference(&mut self, value: u32);
    unsafe fn set_blend_constants(&mut self, color: wgt::Color);

    unsafe fn draw(
        &mut self,
        start_vertex: u32,
        vertex_count: u32,
        start_instance: u32,
        instance_count: u32,
    );
    unsafe fn draw_indexed(
        &mut self,
        start_index: u32,
        index_count: u32,
        start_instance: u32,
        instance_count: u32,
    );
}

pub trait ComputePass<A: Api> {
    unsafe fn set_pipeline(&mut self, pipeline: &A::ComputePipeline);

    /// Sets the bind group at `index` to `group`, assuming the layout
    /// of all the preceeding groups to be taken from `layout`.
    unsafe fn set_bind_group(
        &mut self,
        layout: &A::PipelineLayout,
        index: u32,
        group: &A::BindGroup,
        dynamic_offsets: &[wgt::DynamicOffset],
    );
    unsafe fn set_push_constants(&mut self, stages: wgt::ShaderStage, offset: u32, data: &[u32]);

    unsafe fn dispatch(&mut self, count: [u32; 3]);
}

#[derive(Debug)]
pub struct OpenDevice<A: Api> {
    pub device: A::Device,
    pub queue: A::Queue,
}

#[derive(Clone, Debug)]
pub struct BufferDescriptor<'a> {
    pub label: Label<'a>,
    pub size: wgt::BufferAddress,
    pub usage: wgt::BufferUsage,
}

#[derive(Clone, Debug)]
pub struct TextureDescriptor<'a> {
    pub label: Label<'a>,
    pub size: wgt::Extent3d,
    pub mip_level_count: u32,
    pub format: wgt::TextureFormat,
    pub usage: wgt::TextureUsage,
}

#[derive(Clone, Debug)]
pub struct TextureViewDescriptor<'a> {
    pub label: Label<'a>,
    pub format: wgt::TextureFormat,
    pub base_mip_level: u32,
    pub mip_level_count: u32,
}

pub type SamplerDescriptor<'a> = wgt::SamplerDescriptor<Label<'a>>;

#[derive(Clone, Debug)]
pub struct BindGroupLayoutDescriptor<'a> {
    pub label: Label<'a>,
    pub entries: &'a [wgt::BindGroupLayoutEntry],
}

#[derive(Debug)]
pub struct PipelineLayoutDescriptor<'a, A: Api> {
    pub label: Label<'a>,
    /// Layouts of the bind group slots, `None` for the slots left unused.
    pub bind_group_layouts: &'a [Option<&'a A::BindGroupLayout>],
}

#[derive(Debug)]
pub struct BufferBinding<'a, A: Api> {
    pub buffer: &'a A::Buffer,
    pub offset: wgt::BufferAddress,
    pub size: wgt::BufferAddress,
}

// Rust gets confused about the impl requirements for `A`
impl<A: Api> Clone for BufferBinding<'_, A> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer,
            offset: self.offset,
            size: self.size,
        }
    }
}

#[derive(Debug)]
pub enum BindingResource<'a, A: Api> {
    Buffer(BufferBinding<'a, A>),
    Sampler(&'a A::Sampler),
    TextureView(&'a A::TextureView),
}

// Rust gets confused about the impl requirements for `A`
impl<A: Api> Clone for BindingResource<'_, A> {
    fn clone(&self) -> Self {
        match *self {
            Self::Buffer(ref binding) => Self::Buffer(binding.clone()),
            Self::Sampler(sampler) => Self::Sampler(sampler),
            Self::TextureView(view) => Self::TextureView(view),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BindGroupEntry<'a, A: Api> {
    pub binding: u32,
    pub resource: BindingResource<'a, A>,
}

#[derive(Debug)]
pub struct BindGroupDescriptor<'a, A: Api> {
    pub label: Label<'a>,
    pub layout: &'a A::BindGroupLayout,
    pub entries: &'a [BindGroupEntry<'a, A>],
}

#[derive(Clone, Debug)]
pub struct CommandEncoderDescriptor<'a> {
    pub label: Label<'a>,
}

pub struct ShaderModuleDescriptor<'a> {
    pub label: Label<'a>,
    pub stage: wgt::ShaderStage,
}

/// Describes a programmable pipeline stage.
#[derive(Debug)]
pub struct ProgrammableStage<'a, A: Api> {
    /// The compiled shader module for this stage.
    pub module: &'a A::ShaderModule,
    /// The name of the entry point in the compiled shader.
    pub entry_point: &'a str,
}

// Rust gets confused about the impl requirements for `A`
impl<A: Api> Clone for ProgrammableStage<'_, A> {
    fn clone(&self) -> Self {
        Self {
            module: self.module,
            entry_point: self.entry_point,
        }
    }
}

/// Describes a compute pipeline.
#[derive(Debug)]
pub struct ComputePipelineDescriptor<'a, A: Api> {
    pub label: Label<'a>,
    /// The layout of bind groups for this pipeline.
    pub layout: &'a A::PipelineLayout,
    /// The compiled compute stage and its entry point.
    pub stage: ProgrammableStage<'a, A>,
}

/// Describes a render (graphics) pipeline.
#[derive(Debug)]
pub struct RenderPipelineDescriptor<'a, A: Api> {
    pub label: Label<'a>,
    /// The layout of bind groups for this pipeline.
    pub layout: &'a A::PipelineLayout,
    /// Vertex buffer slots read by this pipeline.
    pub vertex_inputs: &'a [wgt::VertexInput],
    /// Vertex attributes read by this pipeline.
    pub vertex_attributes: &'a [wgt::VertexAttribute],
    /// The vertex stage for this pipeline.
    pub vertex_stage: ProgrammableStage<'a, A>,
    /// The fragment stage for this pipeline.
    pub fragment_stage: ProgrammableStage<'a, A>,
    /// Format of the indices read by indexed draws.
    pub index_format: wgt::IndexFormat,
    /// Formats of the color attachments rendered into.
    pub color_formats: &'a [wgt::TextureFormat],
    /// Format of the depth-stencil attachment, if any.
    pub depth_stencil_format: Option<wgt::TextureFormat>,
}

#[derive(Debug)]
pub struct ColorAttachment<'a, A: Api> {
    pub target: &'a A::TextureView,
    pub load_op: wgt::LoadOp<wgt::Color>,
}

#[derive(Debug)]
pub struct DepthStencilAttachment<'a, A: Api> {
    pub target: &'a A::TextureView,
    pub depth_load_op: wgt::LoadOp<f32>,
    pub stencil_load_op: wgt::LoadOp<u32>,
}

#[derive(Debug)]
pub struct RenderPassDescriptor<'a, A: Api> {
    pub label: Label<'a>,
    pub extent: wgt::Extent3d,
    pub color_attachments: &'a [ColorAttachment<'a, A>],
    pub depth_stencil_attachment: Option<DepthStencilAttachment<'a, A>>,
}

#[derive(Debug, Clone)]
pub struct Rect<T> {
    pub x: T,
    pub y: T,
    pub w: T,
    pub h: T,
}

#[derive(Debug, Clone)]
pub struct BufferBarrier<'a, A: Api> {
    pub buffer: &'a A::Buffer,
    pub usage: Range<wgt::BufferUsage>,
}

#[derive(Debug, Clone)]
pub struct TextureBarrier<'a, A: Api> {
    pub texture: &'a A::Texture,
    pub usage: Range<wgt::TextureUsage>,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferCopy {
    pub src_offset: wgt::BufferAddress,
    pub dst_offset: wgt::BufferAddress,
    pub size: wgt::BufferAddress,
}

#[derive(Clone, Debug)]
pub struct BufferTextureCopy {
    pub buffer_offset: wgt::BufferAddress,
    pub row_pitch: u32,
    pub texture_mip_level: u32,
    pub texture_origin: wgt::Origin3d,
    pub size: wgt::Extent3d,
}

#[test]
fn test_default_limits() {
    let limits = wgt::Limits::default();
    assert!(limits.max_bind_groups <= MAX_BIND_GROUPS as u32);
    assert!(limits.max_color_attachments <= MAX_COLOR_ATTACHMENTS as u32);
}
