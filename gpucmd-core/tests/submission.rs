//! End to end: create resources, record, finish, submit and read back.

use gpucmd_core::{
    binding_model::{
        BindGroupDescriptor, BindGroupEntry, BindGroupLayoutDescriptor, BindingResource,
        BufferBinding, PipelineLayoutDescriptor,
    },
    command::{RenderPassColorAttachment, RenderPassInfo},
    device::{Device, QueueSubmitError},
    pipeline::{
        ComputePipelineDescriptor, InputStateDescriptor, ProgrammableStageDescriptor,
        ReflectedBinding, RenderPipelineDescriptor, ShaderModuleDescriptor, ShaderReflection,
    },
    resource::{BufferDescriptor, TextureDescriptor, TextureViewDescriptor},
};
use hal::empty::{self, Api};
use parking_lot::Mutex;
use wgt::{BufferUsage as Bu, ShaderStage, TextureUsage as Tu};

use std::sync::Arc;

fn device(label: &str) -> Arc<Device<Api>> {
    let _ = env_logger::try_init();
    Device::new(empty::Context::open(), wgt::Limits::default(), Some(label)).unwrap()
}

fn reflection(bindings: Vec<ReflectedBinding>, vertex_inputs_used: u32) -> ShaderReflection {
    ShaderReflection {
        entry_point: "main".to_string(),
        bindings,
        vertex_inputs_used,
        ..Default::default()
    }
}

#[test]
fn compute_then_readback() {
    let device = device("compute");
    let queue = device.create_queue();

    let bgl = device
        .create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("storage"),
            entries: &[wgt::BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStage::COMPUTE,
                ty: wgt::BindingType::StorageBuffer,
                has_dynamic_offset: false,
            }],
        })
        .unwrap();
    let layout = device
        .create_pipeline_layout(&PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &[Some(Arc::clone(&bgl))],
        })
        .unwrap();
    let module = device
        .create_shader_module(&ShaderModuleDescriptor {
            label: Some("cs"),
            stage: ShaderStage::COMPUTE,
            reflection: reflection(
                vec![ReflectedBinding {
                    group: 0,
                    binding: 0,
                    ty: wgt::BindingType::StorageBuffer,
                }],
                0,
            ),
        })
        .unwrap();
    let pipeline = device
        .create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("fill"),
            layout: &layout,
            stage: ProgrammableStageDescriptor {
                module: &module,
                entry_point: "main",
            },
        })
        .unwrap();

    let storage = device
        .create_buffer(&BufferDescriptor {
            label: Some("storage"),
            size: 256,
            allowed_usage: Bu::STORAGE | Bu::TRANSFER_SRC,
            initial_usage: Bu::STORAGE,
        })
        .unwrap();
    let readback = device
        .create_buffer(&BufferDescriptor {
            label: Some("readback"),
            size: 64,
            allowed_usage: Bu::MAP_READ | Bu::TRANSFER_DST,
            initial_usage: Bu::TRANSFER_DST,
        })
        .unwrap();
    let group = device
        .create_bind_group(&BindGroupDescriptor {
            label: None,
            layout: &bgl,
            entries: &[BindGroupEntry {
                binding: 0,
                resource: BindingResource::Buffer(BufferBinding {
                    buffer: &storage,
                    offset: 0,
                    size: 256,
                }),
            }],
        })
        .unwrap();

    let mut builder = device.create_command_buffer_builder(Some("fill and copy"));
    builder.begin_compute_pass().unwrap();
    builder.set_compute_pipeline(&pipeline).unwrap();
    builder.set_bind_group(0, &group, &[]).unwrap();
    builder.dispatch(4, 1, 1).unwrap();
    builder.end_compute_pass().unwrap();
    builder.transition_buffer_usage(&storage, Bu::TRANSFER_SRC).unwrap();
    builder
        .copy_buffer_to_buffer(&storage, 0, &readback, 0, 64)
        .unwrap();
    builder.transition_buffer_usage(&readback, Bu::MAP_READ).unwrap();
    let cb = builder.finish();
    assert!(cb.is_valid(), "{:?}", cb.error());

    assert_eq!(queue.submit(&[&cb]).unwrap(), 1);
    assert_eq!(storage.current_usage(), Bu::TRANSFER_SRC);
    assert_eq!(readback.current_usage(), Bu::MAP_READ);

    let result = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&result);
    readback
        .map_read_async(0, 64, Box::new(move |data| *sink.lock() = Some(data)))
        .unwrap();
    device.tick().unwrap();
    match result.lock().take() {
        Some(Ok(data)) => assert_eq!(data.len(), 64),
        other => panic!("unexpected map result {:?}", other.map(|r| r.map(|d| d.len()))),
    }
    readback.unmap().unwrap();

    queue.maintain().unwrap();
    assert_eq!(queue.active_submission_count(), 0);
    assert_eq!(device.error_count(), 0);
}

#[test]
fn render_pass_draws_into_its_target() {
    let device = device("render");
    let queue = device.create_queue();

    let layout = device
        .create_pipeline_layout(&PipelineLayoutDescriptor {
            label: None,
            bind_group_layouts: &[],
        })
        .unwrap();
    let vs = device
        .create_shader_module(&ShaderModuleDescriptor {
            label: Some("vs"),
            stage: ShaderStage::VERTEX,
            reflection: reflection(Vec::new(), 1),
        })
        .unwrap();
    let fs = device
        .create_shader_module(&ShaderModuleDescriptor {
            label: Some("fs"),
            stage: ShaderStage::FRAGMENT,
            reflection: reflection(Vec::new(), 0),
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
    let pipeline = device
        .create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("triangles"),
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

    let target = device
        .create_texture(&TextureDescriptor {
            label: Some("target"),
            size: wgt::Extent3d {
                width: 32,
                height: 32,
                depth: 1,
            },
            mip_level_count: 1,
            format: wgt::TextureFormat::R8G8B8A8Unorm,
            allowed_usage: Tu::OUTPUT_ATTACHMENT | Tu::SAMPLED,
            initial_usage: Tu::SAMPLED,
        })
        .unwrap();
    let view = device
        .create_texture_view(&target, &TextureViewDescriptor::default())
        .unwrap();
    let pass = device
        .create_render_pass_descriptor(&RenderPassInfo {
            label: Some("main pass"),
            color_attachments: &[RenderPassColorAttachment {
                view,
                load_op: wgt::LoadOp::Clear(wgt::Color::BLACK),
            }],
            depth_stencil_attachment: None,
        })
        .unwrap();
    let vertices = device
        .create_buffer(&BufferDescriptor {
            label: Some("vertices"),
            size: 36,
            allowed_usage: Bu::VERTEX | Bu::TRANSFER_DST,
            initial_usage: Bu::VERTEX,
        })
        .unwrap();

    let mut builder = device.create_command_buffer_builder(Some("draw"));
    builder.begin_render_pass(&pass).unwrap();
    builder.set_render_pipeline(&pipeline).unwrap();
    builder
        .set_vertex_buffers(0, &[Arc::clone(&vertices)], &[0])
        .unwrap();
    builder.draw_arrays(3, 1, 0, 0).unwrap();
    builder.end_render_pass().unwrap();
    let cb = builder.finish();
    assert!(cb.is_valid(), "{:?}", cb.error());

    queue.submit(&[&cb]).unwrap();
    assert_eq!(device.error_count(), 0);

    // one vertex too many for the buffer
    let mut builder = device.create_command_buffer_builder(Some("overrun"));
    builder.begin_render_pass(&pass).unwrap();
    builder.set_render_pipeline(&pipeline).unwrap();
    builder
        .set_vertex_buffers(0, &[Arc::clone(&vertices)], &[0])
        .unwrap();
    builder.draw_arrays(4, 1, 0, 0).unwrap();
    builder.end_render_pass().unwrap();
    let bad = builder.finish();
    assert!(!bad.is_valid());
    assert!(matches!(
        queue.submit(&[&bad]),
        Err(QueueSubmitError::InvalidCommandBuffer { index: 0, .. })
    ));
    assert_eq!(device.error_count(), 2);
}

#[test]
fn errors_are_reported_once_through_the_handler() {
    let device = device("errors");
    let messages = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&messages);
    device.set_error_handler(Box::new(move |message| sink.lock().push(message.to_string())));

    let result = device.create_buffer(&BufferDescriptor {
        label: Some("huge"),
        size: device.limits().max_buffer_size + 1,
        allowed_usage: Bu::VERTEX,
        initial_usage: Bu::VERTEX,
    });
    assert!(result.is_err());

    let mut builder = device.create_command_buffer_builder(None);
    builder.pop_debug_group().unwrap();
    let cb = builder.finish();
    assert!(!cb.is_valid());

    let messages = messages.lock();
    assert_eq!(messages.len(), 2);
    assert_eq!(device.last_error().as_deref(), Some(messages[1].as_str()));
}
