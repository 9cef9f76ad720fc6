//! A backend that does nothing. Every submission completes the moment it is made.

use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Clone, Debug)]
pub struct Api;
pub struct Context {
    fence: Arc<Mutex<crate::FenceValue>>,
}
pub struct Encoder;
#[derive(Debug)]
pub struct Resource;

type DeviceResult<T> = Result<T, crate::DeviceError>;

impl Context {
    /// Opens a device and its queue, sharing one fence.
    pub fn open() -> crate::OpenDevice<Api> {
        let fence = Arc::new(Mutex::new(0));
        crate::OpenDevice {
            device: Context {
                fence: Arc::clone(&fence),
            },
            queue: Context { fence },
        }
    }
}

impl crate::Api for Api {
    type Device = Context;
    type Queue = Context;

    type CommandEncoder = Encoder;
    type RenderPass = Encoder;
    type ComputePass = Encoder;
    type CommandBuffer = Resource;

    type Buffer = Resource;
    type Texture = Resource;
    type TextureView = Resource;
    type Sampler = Resource;

    type BindGroupLayout = Resource;
    type BindGroup = Resource;
    type PipelineLayout = Resource;
    type ShaderModule = Resource;
    type RenderPipeline = Resource;
    type ComputePipeline = Resource;
}

impl crate::Queue<Api> for Context {
    unsafe fn submit(
        &mut self,
        command_buffers: &[&Resource],
        signal_value: crate::FenceValue,
    ) -> DeviceResult<()> {
        log::trace!(
            "Empty queue: {} command buffers, signal {}",
            command_buffers.len(),
            signal_value
        );
        let mut fence = self.fence.lock();
        *fence = (*fence).max(signal_value);
        Ok(())
    }
}

impl crate::Device<Api> for Context {
    unsafe fn create_buffer(&self, _desc: &crate::BufferDescriptor) -> DeviceResult<Resource> {
        Ok(Resource)
    }
    unsafe fn destroy_buffer(&self, _buffer: Resource) {}
    unsafe fn write_buffer(
        &self,
        _buffer: &Resource,
        _offset: wgt::BufferAddress,
        _data: &[u8],
    ) -> DeviceResult<()> {
        Ok(())
    }
    unsafe fn read_buffer(
        &self,
        _buffer: &Resource,
        range: crate::MemoryRange,
    ) -> DeviceResult<Vec<u8>> {
        Ok(vec![0; (range.end - range.start) as usize])
    }

    unsafe fn create_texture(&self, _desc: &crate::TextureDescriptor) -> DeviceResult<Resource> {
        Ok(Resource)
    }
    unsafe fn destroy_texture(&self, _texture: Resource) {}
    unsafe fn create_texture_view(
        &self,
        _texture: &Resource,
        _desc: &crate::TextureViewDescriptor,
    ) -> DeviceResult<Resource> {
        Ok(Resource)
    }
    unsafe fn destroy_texture_view(&self, _view: Resource) {}
    unsafe fn create_sampler(&self, _desc: &crate::SamplerDescriptor) -> DeviceResult<Resource> {
        Ok(Resource)
    }
    unsafe fn destroy_sampler(&self, _sampler: Resource) {}

    unsafe fn create_command_encoder(
        &self,
        _desc: &crate::CommandEncoderDescriptor,
    ) -> DeviceResult<Encoder> {
        Ok(Encoder)
    }
    unsafe fn destroy_command_encoder(&self, _encoder: Encoder) {}
    unsafe fn destroy_command_buffer(&self, _cmd_buf: Resource) {}

    unsafe fn create_bind_group_layout(
        &self,
        _desc: &crate::BindGroupLayoutDescriptor,
    ) -> DeviceResult<Resource> {
        Ok(Resource)
    }
    unsafe fn destroy_bind_group_layout(&self, _bg_layout: Resource) {}
    unsafe fn create_pipeline_layout(
        &self,
        _desc: &crate::PipelineLayoutDescriptor<Api>,
    ) -> DeviceResult<Resource> {
        Ok(Resource)
    }
    unsafe fn destroy_pipeline_layout(&self, _pipeline_layout: Resource) {}
    unsafe fn create_bind_group(
        &self,
        _desc: &crate::BindGroupDescriptor<Api>,
    ) -> DeviceResult<Resource> {
        Ok(Resource)
    }
    unsafe fn destroy_bind_group(&self, _group: Resource) {}

    unsafe fn create_shader_module(
        &self,
        _desc: &crate::ShaderModuleDescriptor,
    ) -> DeviceResult<Resource> {
        Ok(Resource)
    }
    unsafe fn destroy_shader_module(&self, _module: Resource) {}
    unsafe fn create_render_pipeline(
        &self,
        _desc: &crate::RenderPipelineDescriptor<Api>,
    ) -> Result<Resource, crate::PipelineError> {
        Ok(Resource)
    }
    unsafe fn destroy_render_pipeline(&self, _pipeline: Resource) {}
    unsafe fn create_compute_pipeline(
        &self,
        _desc: &crate::ComputePipelineDescriptor<Api>,
    ) -> Result<Resource, crate::PipelineError> {
        Ok(Resource)
    }
    unsafe fn destroy_compute_pipeline(&self, _pipeline: Resource) {}

    unsafe fn get_fence_value(&self) -> DeviceResult<crate::FenceValue> {
        Ok(*self.fence.lock())
    }
}

impl crate::CommandEncoder<Api> for Encoder {
    unsafe fn begin_encoding(&mut self, _label: crate::Label) -> DeviceResult<()> {
        Ok(())
    }
    unsafe fn end_encoding(&mut self) -> DeviceResult<Resource> {
        Ok(Resource)
    }

    unsafe fn transition_buffers<'a, T>(&mut self, _barriers: T)
    where
        T: Iterator<Item = crate::BufferBarrier<'a, Api>>,
    {
    }

    unsafe fn transition_textures<'a, T>(&mut self, _barriers: T)
    where
        T: Iterator<Item = crate::TextureBarrier<'a, Api>>,
    {
    }

    unsafe fn copy_buffer_to_buffer<T>(&mut self, _src: &Resource, _dst: &Resource, _regions: T) {}

    unsafe fn copy_buffer_to_texture<T>(&mut self, _src: &Resource, _dst: &Resource, _regions: T) {
    }

    unsafe fn copy_texture_to_buffer<T>(&mut self, _src: &Resource, _dst: &Resource, _regions: T) {
    }

    unsafe fn push_debug_group(&mut self, _label: &str) {}
    unsafe fn pop_debug_group(&mut self) {}
    unsafe fn insert_debug_marker(&mut self, _label: &str) {}

    unsafe fn begin_render_pass(&mut self, _desc: &crate::RenderPassDescriptor<Api>) -> Encoder {
        Encoder
    }
    unsafe fn end_render_pass(&mut self, _pass: Encoder) {}
    unsafe fn begin_compute_pass(&mut self) -> Encoder {
        Encoder
    }
    unsafe fn end_compute_pass(&mut self, _pass: Encoder) {}
}

impl crate::RenderPass<Api> for Encoder {
    unsafe fn set_pipeline(&mut self, _pipeline: &Resource) {}
    unsafe fn set_bind_group(
        &mut self,
        _layout: &Resource,
        _index: u32,
        _group: &Resource,
        _dynamic_offsets: &[wgt::DynamicOffset],
    ) {
    }
    unsafe fn set_push_constants(&mut self, _stages: wgt::ShaderStage, _offset: u32, _data: &[u32]) {
    }
    unsafe fn set_index_buffer<'a>(
        &mut self,
        _binding: crate::BufferBinding<'a, Api>,
        _format: wgt::IndexFormat,
    ) {
    }
    unsafe fn set_vertex_buffer<'a>(&mut self, _index: u32, _binding: crate::BufferBinding<'a, Api>) {
    }
    unsafe fn set_scissor_rect(&mut self, _rect: &crate::Rect<u32>) {}
    unsafe fn set_stencil_reference(&mut self, _value: u32) {}
    unsafe fn set_blend_constants(&mut self, _color: wgt::Color) {}

    unsafe fn draw(
        &mut self,
        _start_vertex: u32,
        _vertex_count: u32,
        _start_instance: u32,
        _instance_count: u32,
    ) {
    }
    unsafe fn draw_indexed(
        &mut self,
        _start_index: u32,
        _index_count: u32,
        _start_instance: u32,
        _instance_count: u32,
    ) {
    }
}

impl crate::ComputePass<Api> for Encoder {
    unsafe fn set_pipeline(&mut self, _pipeline: &Resource) {}
    unsafe fn set_bind_group(
        &mut self,
        _layout: &Resource,
        _index: u32,
        _group: &Resource,
        _dynamic_offsets: &[wgt::DynamicOffset],
    ) {
    }
    unsafe fn set_push_constants(&mut self, _stages: wgt::ShaderStage, _offset: u32, _data: &[u32]) {
    }

    unsafe fn dispatch(&mut self, _count: [u32; 3]) {}
}

#[test]
fn fence_follows_submissions() {
    use crate::{Device as _, Queue as _};

    let _ = env_logger::builder().is_test(true).try_init();
    let mut open = Context::open();
    unsafe {
        assert_eq!(open.device.get_fence_value(), Ok(0));
        open.queue.submit(&[&Resource], 3).unwrap();
        assert_eq!(open.device.get_fence_value(), Ok(3));
        open.queue.submit(&[], 2).unwrap();
        assert_eq!(open.device.get_fence_value(), Ok(3));
    }
}
