use crate::{
    binding_model::{
        BindGroup, BindGroupDescriptor, BindGroupDynamicBindingData, BindGroupLayout,
        BindGroupLayoutDescriptor, BindGroupMask, BindingResource, CreateBindGroupError,
        CreateBindGroupLayoutError, CreatePipelineLayoutError, PipelineLayout,
        PipelineLayoutDescriptor,
    },
    checked_range_end,
    command::{CreateRenderPassError, RenderPassDescriptor, RenderPassInfo},
    device::{Device, RenderPassContext},
    pipeline::{
        ComputePipeline, ComputePipelineDescriptor, CreateComputePipelineError,
        CreateInputStateError, CreateRenderPipelineError, CreateShaderModuleError, InputState,
        InputStateDescriptor, RenderPipeline, RenderPipelineDescriptor, ShaderModule,
        ShaderModuleDescriptor,
    },
    resource::{
        Buffer, BufferDescriptor, BufferMapState, BufferState, CreateBufferError,
        CreateTextureError, CreateTextureViewError, DeviceError, ResourceInfo, Sampler,
        SamplerDescriptor, Texture, TextureDescriptor, TextureView, TextureViewDescriptor,
    },
    track::UsageState,
    validation::{self, find_push_constant_clash},
};

use arrayvec::ArrayVec;
use hal::Device as _;
use parking_lot::Mutex;
use wgt::{BindingType, BufferUsage, ShaderStage, TextureUsage};

use std::{error::Error, mem::ManuallyDrop, sync::Arc};

impl<A: hal::Api> Device<A> {
    fn funnel<T, E: Error + 'static>(&self, result: Result<T, E>) -> Result<T, E> {
        if let Err(ref error) = result {
            self.handle_error(error);
        }
        result
    }

    pub fn create_buffer(
        self: &Arc<Self>,
        desc: &BufferDescriptor,
    ) -> Result<Arc<Buffer<A>>, CreateBufferError> {
        api_log!("Device::create_buffer {:?}", desc.label);
        let result = self.create_buffer_impl(desc);
        self.funnel(result)
    }

    fn create_buffer_impl(
        self: &Arc<Self>,
        desc: &BufferDescriptor,
    ) -> Result<Arc<Buffer<A>>, CreateBufferError> {
        if desc.size > self.limits.max_buffer_size {
            return Err(CreateBufferError::MaxBufferSize {
                requested: desc.size,
                maximum: self.limits.max_buffer_size,
            });
        }
        if desc.allowed_usage.is_empty() {
            return Err(CreateBufferError::EmptyUsage);
        }
        let usage = UsageState::new(desc.allowed_usage, desc.initial_usage)?;

        let hal_desc = hal::BufferDescriptor {
            label: desc.label,
            size: desc.size,
            usage: desc.initial_usage,
        };
        let raw = unsafe { self.raw.create_buffer(&hal_desc)? };

        Ok(Arc::new(Buffer {
            raw: ManuallyDrop::new(raw),
            device: Arc::clone(self),
            size: desc.size,
            state: Mutex::new(BufferState {
                usage,
                map: BufferMapState::Idle,
            }),
            info: ResourceInfo::new(self, desc.label),
        }))
    }

    pub fn create_texture(
        self: &Arc<Self>,
        desc: &TextureDescriptor,
    ) -> Result<Arc<Texture<A>>, CreateTextureError> {
        api_log!("Device::create_texture {:?}", desc.label);
        let result = self.create_texture_impl(desc);
        self.funnel(result)
    }

    fn create_texture_impl(
        self: &Arc<Self>,
        desc: &TextureDescriptor,
    ) -> Result<Arc<Texture<A>>, CreateTextureError> {
        let size = desc.size;
        if size.width == 0 || size.height == 0 || size.depth == 0 {
            return Err(CreateTextureError::InvalidDimension(size));
        }
        let max = self.limits.max_texture_dimension_2d;
        for &dim in [size.width, size.height].iter() {
            if dim > max {
                return Err(CreateTextureError::TooLarge { dim, max });
            }
        }
        let max_mips = size.max_mips();
        if desc.mip_level_count == 0 || desc.mip_level_count > max_mips {
            return Err(CreateTextureError::InvalidMipLevelCount {
                requested: desc.mip_level_count,
                maximum: max_mips,
            });
        }
        if desc.allowed_usage.is_empty() {
            return Err(CreateTextureError::EmptyUsage);
        }
        let usage = UsageState::new(desc.allowed_usage, desc.initial_usage)?;

        let hal_desc = hal::TextureDescriptor {
            label: desc.label,
            size,
            mip_level_count: desc.mip_level_count,
            format: desc.format,
            usage: desc.initial_usage,
        };
        let raw = unsafe { self.raw.create_texture(&hal_desc)? };

        Ok(Arc::new(Texture {
            raw: ManuallyDrop::new(raw),
            device: Arc::clone(self),
            size,
            mip_level_count: desc.mip_level_count,
            format: desc.format,
            usage: Mutex::new(usage),
            info: ResourceInfo::new(self, desc.label),
        }))
    }

    pub fn create_texture_view(
        &self,
        texture: &Arc<Texture<A>>,
        desc: &TextureViewDescriptor,
    ) -> Result<Arc<TextureView<A>>, CreateTextureViewError> {
        api_log!(
            "Device::create_texture_view of {:?} {:?}",
            texture.label(),
            desc.label
        );
        let result = self.create_texture_view_impl(texture, desc);
        self.funnel(result)
    }

    fn create_texture_view_impl(
        &self,
        texture: &Arc<Texture<A>>,
        desc: &TextureViewDescriptor,
    ) -> Result<Arc<TextureView<A>>, CreateTextureViewError> {
        if desc.base_mip_level >= texture.mip_level_count {
            return Err(CreateTextureViewError::InvalidMipLevel {
                level: desc.base_mip_level,
                total: texture.mip_level_count,
            });
        }

        let hal_desc = hal::TextureViewDescriptor {
            label: desc.label,
            format: texture.format,
            base_mip_level: desc.base_mip_level,
            mip_level_count: texture.mip_level_count - desc.base_mip_level,
        };
        let raw = unsafe { self.raw.create_texture_view(&texture.raw, &hal_desc)? };

        Ok(Arc::new(TextureView {
            raw: ManuallyDrop::new(raw),
            parent: Arc::clone(texture),
            base_mip_level: desc.base_mip_level,
            extent: texture.size.at_mip_level(desc.base_mip_level),
            info: ResourceInfo::new(self, desc.label),
        }))
    }

    pub fn create_sampler(
        self: &Arc<Self>,
        desc: &SamplerDescriptor,
    ) -> Result<Arc<Sampler<A>>, DeviceError> {
        api_log!("Device::create_sampler {:?}", desc.label);
        let result = unsafe { self.raw.create_sampler(desc) }.map(|raw| {
            Arc::new(Sampler {
                raw: ManuallyDrop::new(raw),
                device: Arc::clone(self),
                info: ResourceInfo::new(self, desc.label),
            })
        });
        self.funnel(result)
    }

    pub fn create_bind_group_layout(
        self: &Arc<Self>,
        desc: &BindGroupLayoutDescriptor,
    ) -> Result<Arc<BindGroupLayout<A>>, CreateBindGroupLayoutError> {
        api_log!("Device::create_bind_group_layout {:?}", desc.label);
        let result = self.create_bind_group_layout_impl(desc);
        self.funnel(result)
    }

    fn create_bind_group_layout_impl(
        self: &Arc<Self>,
        desc: &BindGroupLayoutDescriptor,
    ) -> Result<Arc<BindGroupLayout<A>>, CreateBindGroupLayoutError> {
        let mut entries = ArrayVec::<_, { wgt::MAX_BINDINGS_PER_GROUP }>::new();
        let mut binding_mask = 0u32;
        let mut dynamic_count = 0usize;
        for entry in desc.entries.iter() {
            let binding = entry.binding;
            if binding as usize >= wgt::MAX_BINDINGS_PER_GROUP {
                return Err(CreateBindGroupLayoutError::BindingOutOfRange {
                    binding,
                    maximum: wgt::MAX_BINDINGS_PER_GROUP as u32,
                });
            }
            if binding_mask & (1 << binding) != 0 {
                return Err(CreateBindGroupLayoutError::ConflictBinding(binding));
            }
            if entry.visibility.is_empty() {
                return Err(CreateBindGroupLayoutError::EmptyVisibility(binding));
            }
            if entry.has_dynamic_offset {
                if !entry.ty.is_buffer() {
                    return Err(CreateBindGroupLayoutError::DynamicNonBuffer(binding));
                }
                dynamic_count += 1;
            }
            binding_mask |= 1 << binding;
            entries.push(*entry);
        }

        let limit = self.limits.max_dynamic_buffers_per_layout;
        if dynamic_count > limit as usize {
            return Err(CreateBindGroupLayoutError::TooManyDynamic {
                count: dynamic_count as u32,
                limit,
            });
        }
        entries.sort_by_key(|entry| entry.binding);

        let hal_desc = hal::BindGroupLayoutDescriptor {
            label: desc.label,
            entries: &entries,
        };
        let raw = unsafe { self.raw.create_bind_group_layout(&hal_desc)? };

        Ok(Arc::new(BindGroupLayout {
            raw: ManuallyDrop::new(raw),
            device: Arc::clone(self),
            content_hash: BindGroupLayout::<A>::content_hash_of(&entries),
            entries,
            binding_mask,
            dynamic_count,
            info: ResourceInfo::new(self, desc.label),
        }))
    }

    pub fn create_pipeline_layout(
        self: &Arc<Self>,
        desc: &PipelineLayoutDescriptor<A>,
    ) -> Result<Arc<PipelineLayout<A>>, CreatePipelineLayoutError> {
        api_log!("Device::create_pipeline_layout {:?}", desc.label);
        let result = self.create_pipeline_layout_impl(desc);
        self.funnel(result)
    }

    fn create_pipeline_layout_impl(
        self: &Arc<Self>,
        desc: &PipelineLayoutDescriptor<A>,
    ) -> Result<Arc<PipelineLayout<A>>, CreatePipelineLayoutError> {
        let max = self.limits.max_bind_groups as usize;
        if desc.bind_group_layouts.len() > max {
            return Err(CreatePipelineLayoutError::TooManyGroups {
                actual: desc.bind_group_layouts.len(),
                max,
            });
        }

        let bind_group_layouts = desc
            .bind_group_layouts
            .iter()
            .cloned()
            .collect::<ArrayVec<_, { hal::MAX_BIND_GROUPS }>>();
        let mut bind_group_mask: BindGroupMask = 0;
        for (index, bgl) in bind_group_layouts.iter().enumerate() {
            if bgl.is_some() {
                bind_group_mask |= 1 << index;
            }
        }

        let raw = {
            let raw_layouts = bind_group_layouts
                .iter()
                .map(|bgl| bgl.as_ref().map(|bgl| &*bgl.raw))
                .collect::<ArrayVec<_, { hal::MAX_BIND_GROUPS }>>();
            let hal_desc = hal::PipelineLayoutDescriptor {
                label: desc.label,
                bind_group_layouts: &raw_layouts,
            };
            unsafe { self.raw.create_pipeline_layout(&hal_desc)? }
        };

        Ok(Arc::new(PipelineLayout {
            raw: ManuallyDrop::new(raw),
            device: Arc::clone(self),
            bind_group_layouts,
            bind_group_mask,
            info: ResourceInfo::new(self, desc.label),
        }))
    }

    pub fn create_bind_group(
        self: &Arc<Self>,
        desc: &BindGroupDescriptor<A>,
    ) -> Result<Arc<BindGroup<A>>, CreateBindGroupError> {
        api_log!("Device::create_bind_group {:?}", desc.label);
        let result = self.create_bind_group_impl(desc);
        self.funnel(result)
    }

    fn create_bind_group_impl(
        self: &Arc<Self>,
        desc: &BindGroupDescriptor<A>,
    ) -> Result<Arc<BindGroup<A>>, CreateBindGroupError> {
        let layout = desc.layout;
        if desc.entries.len() != layout.entries.len() {
            return Err(CreateBindGroupError::BindingsNumMismatch {
                expected: layout.entries.len(),
                actual: desc.entries.len(),
            });
        }

        let mut used_buffers = Vec::new();
        let mut used_textures = Vec::new();
        let mut used_views = Vec::new();
        let mut used_samplers = Vec::new();
        let mut dynamic_bindings = Vec::new();
        let mut hal_entries = Vec::with_capacity(desc.entries.len());
        let mut seen = 0u32;

        for entry in desc.entries.iter() {
            let binding = entry.binding;
            let decl = layout
                .entry(binding)
                .ok_or(CreateBindGroupError::MissingBindingDeclaration(binding))?;
            if seen & (1 << binding) != 0 {
                return Err(CreateBindGroupError::DuplicateBinding(binding));
            }
            seen |= 1 << binding;

            let resource = match (decl.ty, &entry.resource) {
                (BindingType::UniformBuffer, &BindingResource::Buffer(ref bb))
                | (BindingType::StorageBuffer, &BindingResource::Buffer(ref bb)) => {
                    let usage = decl.ty.buffer_usage();
                    bb.buffer.check_allowed_usage(usage)?;
                    let end = checked_range_end(bb.offset, bb.size, bb.buffer.size).ok_or(
                        CreateBindGroupError::BindingRangeTooLarge {
                            binding,
                            offset: bb.offset,
                            size: bb.size,
                            buffer_size: bb.buffer.size,
                        },
                    )?;
                    let limit = self.limits.max_uniform_binding_size;
                    if usage == BufferUsage::UNIFORM && bb.size > limit as wgt::BufferAddress {
                        return Err(CreateBindGroupError::UniformBindingSizeTooLarge {
                            binding,
                            size: bb.size,
                            limit,
                        });
                    }
                    if decl.has_dynamic_offset {
                        dynamic_bindings.push((
                            binding,
                            BindGroupDynamicBindingData {
                                maximum_dynamic_offset: bb.buffer.size - end,
                            },
                        ));
                    }
                    used_buffers.push((Arc::clone(bb.buffer), usage));
                    hal::BindingResource::Buffer(hal::BufferBinding {
                        buffer: &*bb.buffer.raw,
                        offset: bb.offset,
                        size: bb.size,
                    })
                }
                (BindingType::Sampler, &BindingResource::Sampler(sampler)) => {
                    used_samplers.push(Arc::clone(sampler));
                    hal::BindingResource::Sampler(&*sampler.raw)
                }
                (BindingType::SampledTexture, &BindingResource::TextureView(view)) => {
                    view.parent.check_allowed_usage(TextureUsage::SAMPLED)?;
                    used_textures.push((Arc::clone(&view.parent), TextureUsage::SAMPLED));
                    used_views.push(Arc::clone(view));
                    hal::BindingResource::TextureView(&*view.raw)
                }
                (expected, resource) => {
                    return Err(CreateBindGroupError::WrongBindingType {
                        binding,
                        actual: match *resource {
                            BindingResource::Buffer(_) => "Buffer",
                            BindingResource::Sampler(_) => "Sampler",
                            BindingResource::TextureView(_) => "TextureView",
                        },
                        expected,
                    })
                }
            };
            hal_entries.push(hal::BindGroupEntry { binding, resource });
        }

        // dynamic offsets are given in binding order
        dynamic_bindings.sort_by_key(|&(binding, _)| binding);

        let hal_desc = hal::BindGroupDescriptor {
            label: desc.label,
            layout: &*layout.raw,
            entries: &hal_entries,
        };
        let raw = unsafe { self.raw.create_bind_group(&hal_desc)? };

        Ok(Arc::new(BindGroup {
            raw: ManuallyDrop::new(raw),
            device: Arc::clone(self),
            layout: Arc::clone(layout),
            used_buffers,
            used_textures,
            used_views,
            used_samplers,
            dynamic_binding_info: dynamic_bindings.into_iter().map(|(_, data)| data).collect(),
            info: ResourceInfo::new(self, desc.label),
        }))
    }

    pub fn create_input_state(
        &self,
        desc: &InputStateDescriptor,
    ) -> Result<Arc<InputState>, CreateInputStateError> {
        api_log!("Device::create_input_state {:?}", desc.label);
        let result = self.create_input_state_impl(desc);
        self.funnel(result)
    }

    fn create_input_state_impl(
        &self,
        desc: &InputStateDescriptor,
    ) -> Result<Arc<InputState>, CreateInputStateError> {
        let slot_limit = self.limits.max_vertex_buffers;
        let mut inputs = [None; wgt::MAX_VERTEX_INPUTS];
        let mut inputs_mask = 0u32;
        for input in desc.inputs.iter() {
            if input.slot >= slot_limit {
                return Err(CreateInputStateError::SlotOutOfRange {
                    slot: input.slot,
                    limit: slot_limit,
                });
            }
            if inputs_mask & (1 << input.slot) != 0 {
                return Err(CreateInputStateError::DuplicateSlot(input.slot));
            }
            if input.stride > wgt::MAX_VERTEX_STRIDE {
                return Err(CreateInputStateError::StrideTooLarge {
                    slot: input.slot,
                    stride: input.stride,
                    limit: wgt::MAX_VERTEX_STRIDE,
                });
            }
            inputs_mask |= 1 << input.slot;
            inputs[input.slot as usize] = Some(*input);
        }

        let mut attributes = [None; wgt::MAX_VERTEX_ATTRIBUTES];
        let mut attributes_mask = 0u32;
        for attribute in desc.attributes.iter() {
            let location = attribute.location;
            if location as usize >= wgt::MAX_VERTEX_ATTRIBUTES {
                return Err(CreateInputStateError::LocationOutOfRange {
                    location,
                    limit: wgt::MAX_VERTEX_ATTRIBUTES as u32,
                });
            }
            if attributes_mask & (1 << location) != 0 {
                return Err(CreateInputStateError::ShaderLocationClash(location));
            }
            let input = match inputs.get(attribute.slot as usize) {
                Some(&Some(input)) => input,
                _ => {
                    return Err(CreateInputStateError::UndeclaredSlot {
                        location,
                        slot: attribute.slot,
                    })
                }
            };
            let end = attribute.offset as u64 + attribute.format.size() as u64;
            if input.stride != 0 && end > input.stride as u64 {
                return Err(CreateInputStateError::AttributeOutOfStride {
                    location,
                    end,
                    stride: input.stride,
                });
            }
            attributes_mask |= 1 << location;
            attributes[location as usize] = Some(*attribute);
        }

        Ok(Arc::new(InputState {
            inputs,
            attributes,
            inputs_mask,
            attributes_mask,
            info: ResourceInfo::new(self, desc.label),
        }))
    }

    pub fn create_shader_module(
        self: &Arc<Self>,
        desc: &ShaderModuleDescriptor,
    ) -> Result<Arc<ShaderModule<A>>, CreateShaderModuleError> {
        api_log!("Device::create_shader_module {:?}", desc.label);
        let result = self.create_shader_module_impl(desc);
        self.funnel(result)
    }

    fn create_shader_module_impl(
        self: &Arc<Self>,
        desc: &ShaderModuleDescriptor,
    ) -> Result<Arc<ShaderModule<A>>, CreateShaderModuleError> {
        if desc.stage.is_empty() || !wgt::has_zero_or_one_bits(desc.stage.bits()) {
            return Err(CreateShaderModuleError::InvalidStage(desc.stage));
        }
        for reflected in desc.reflection.bindings.iter() {
            if reflected.group as usize >= hal::MAX_BIND_GROUPS
                || reflected.binding as usize >= wgt::MAX_BINDINGS_PER_GROUP
            {
                return Err(CreateShaderModuleError::BindingOutOfRange {
                    group: reflected.group,
                    binding: reflected.binding,
                });
            }
        }
        if desc.reflection.vertex_inputs_used != 0 && desc.stage != ShaderStage::VERTEX {
            return Err(CreateShaderModuleError::UnexpectedVertexInputs);
        }

        let hal_desc = hal::ShaderModuleDescriptor {
            label: desc.label,
            stage: desc.stage,
        };
        let raw = unsafe { self.raw.create_shader_module(&hal_desc)? };

        Ok(Arc::new(ShaderModule {
            raw: ManuallyDrop::new(raw),
            device: Arc::clone(self),
            stage: desc.stage,
            reflection: desc.reflection.clone(),
            info: ResourceInfo::new(self, desc.label),
        }))
    }

    pub fn create_compute_pipeline(
        self: &Arc<Self>,
        desc: &ComputePipelineDescriptor<A>,
    ) -> Result<Arc<ComputePipeline<A>>, CreateComputePipelineError> {
        api_log!("Device::create_compute_pipeline {:?}", desc.label);
        let result = self.create_compute_pipeline_impl(desc);
        self.funnel(result)
    }

    fn create_compute_pipeline_impl(
        self: &Arc<Self>,
        desc: &ComputePipelineDescriptor<A>,
    ) -> Result<Arc<ComputePipeline<A>>, CreateComputePipelineError> {
        let module = desc.stage.module;
        validation::check_stage(module, desc.layout, desc.stage.entry_point, ShaderStage::COMPUTE)?;

        let hal_desc = hal::ComputePipelineDescriptor {
            label: desc.label,
            layout: &*desc.layout.raw,
            stage: hal::ProgrammableStage {
                module: &*module.raw,
                entry_point: desc.stage.entry_point,
            },
        };
        let raw = unsafe { self.raw.create_compute_pipeline(&hal_desc) }.map_err(
            |err| match err {
                hal::PipelineError::Device(error) => CreateComputePipelineError::Device(error),
                hal::PipelineError::Linkage(_stage, msg) => {
                    CreateComputePipelineError::Internal(msg)
                }
            },
        )?;

        Ok(Arc::new(ComputePipeline {
            raw: ManuallyDrop::new(raw),
            device: Arc::clone(self),
            layout: Arc::clone(desc.layout),
            push_constants: module.reflection.push_constants.clone(),
            _shader_module: Arc::clone(module),
            info: ResourceInfo::new(self, desc.label),
        }))
    }

    pub fn create_render_pipeline(
        self: &Arc<Self>,
        desc: &RenderPipelineDescriptor<A>,
    ) -> Result<Arc<RenderPipeline<A>>, CreateRenderPipelineError> {
        api_log!("Device::create_render_pipeline {:?}", desc.label);
        let result = self.create_render_pipeline_impl(desc);
        self.funnel(result)
    }

    fn create_render_pipeline_impl(
        self: &Arc<Self>,
        desc: &RenderPipelineDescriptor<A>,
    ) -> Result<Arc<RenderPipeline<A>>, CreateRenderPipelineError> {
        let limit = self.limits.max_color_attachments;
        let given = desc.color_formats.len();
        if given == 0 || given > limit as usize {
            return Err(CreateRenderPipelineError::InvalidColorAttachmentCount { given, limit });
        }
        for &format in desc.color_formats.iter() {
            if format.is_depth_stencil() {
                return Err(CreateRenderPipelineError::InvalidColorFormat(format));
            }
        }
        if let Some(format) = desc.depth_stencil_format {
            if !format.is_depth_stencil() {
                return Err(CreateRenderPipelineError::InvalidDepthStencilFormat(format));
            }
        }

        let vertex = desc.vertex_stage.module;
        let fragment = desc.fragment_stage.module;
        validation::check_stage(
            vertex,
            desc.layout,
            desc.vertex_stage.entry_point,
            ShaderStage::VERTEX,
        )
        .and_then(|()| {
            validation::check_vertex_inputs(vertex.reflection.vertex_inputs_used, desc.input_state)
        })
        .map_err(|error| CreateRenderPipelineError::Stage {
            stage: ShaderStage::VERTEX,
            error,
        })?;
        validation::check_stage(
            fragment,
            desc.layout,
            desc.fragment_stage.entry_point,
            ShaderStage::FRAGMENT,
        )
        .map_err(|error| CreateRenderPipelineError::Stage {
            stage: ShaderStage::FRAGMENT,
            error,
        })?;

        let vertex_push_constants = vertex.reflection.push_constants.clone();
        let fragment_push_constants = fragment.reflection.push_constants.clone();
        if let Some(slot) = find_push_constant_clash(&vertex_push_constants, &fragment_push_constants)
        {
            return Err(CreateRenderPipelineError::PushConstantTypeMismatch { slot });
        }

        let vertex_inputs = desc
            .input_state
            .inputs
            .iter()
            .filter_map(|input| *input)
            .collect::<Vec<_>>();
        let vertex_attributes = desc
            .input_state
            .attributes
            .iter()
            .filter_map(|attribute| *attribute)
            .collect::<Vec<_>>();
        let hal_desc = hal::RenderPipelineDescriptor {
            label: desc.label,
            layout: &*desc.layout.raw,
            vertex_inputs: &vertex_inputs,
            vertex_attributes: &vertex_attributes,
            vertex_stage: hal::ProgrammableStage {
                module: &*vertex.raw,
                entry_point: desc.vertex_stage.entry_point,
            },
            fragment_stage: hal::ProgrammableStage {
                module: &*fragment.raw,
                entry_point: desc.fragment_stage.entry_point,
            },
            index_format: desc.index_format,
            color_formats: desc.color_formats,
            depth_stencil_format: desc.depth_stencil_format,
        };
        let raw = unsafe { self.raw.create_render_pipeline(&hal_desc) }.map_err(
            |err| match err {
                hal::PipelineError::Device(error) => CreateRenderPipelineError::Device(error),
                hal::PipelineError::Linkage(stage, error) => {
                    CreateRenderPipelineError::Internal { stage, error }
                }
            },
        )?;

        let pass_context = RenderPassContext {
            colors: desc.color_formats.iter().cloned().collect(),
            depth_stencil: desc.depth_stencil_format,
        };

        Ok(Arc::new(RenderPipeline {
            raw: ManuallyDrop::new(raw),
            device: Arc::clone(self),
            layout: Arc::clone(desc.layout),
            input_state: Arc::clone(desc.input_state),
            index_format: desc.index_format,
            pass_context,
            vertex_push_constants,
            fragment_push_constants,
            _shader_modules: [Arc::clone(vertex), Arc::clone(fragment)],
            info: ResourceInfo::new(self, desc.label),
        }))
    }

    /// Validates a set of attachments once, for every pass that uses it.
    pub fn create_render_pass_descriptor(
        &self,
        info: &RenderPassInfo<A>,
    ) -> Result<Arc<RenderPassDescriptor<A>>, CreateRenderPassError> {
        api_log!("Device::create_render_pass_descriptor {:?}", info.label);
        let result = RenderPassDescriptor::validate(info, &self.limits).map(|(extent, context)| {
            Arc::new(RenderPassDescriptor {
                color_attachments: info.color_attachments.iter().cloned().collect(),
                depth_stencil_attachment: info.depth_stencil_attachment.clone(),
                extent,
                context,
                info: ResourceInfo::new(self, info.label),
            })
        });
        self.funnel(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding_model::{BindGroupEntry, BufferBinding},
        pipeline::{ProgrammableStageDescriptor, ReflectedBinding, ShaderReflection},
        validation::{BindingError, StageError},
    };
    use hal::empty::{self, Api};
    use wgt::{BufferUsage as Bu, PushConstantType};

    fn device() -> Arc<Device<Api>> {
        Device::new(empty::Context::open(), wgt::Limits::default(), Some("resources")).unwrap()
    }

    fn uniform_layout(device: &Arc<Device<Api>>, dynamic: bool) -> Arc<BindGroupLayout<Api>> {
        device
            .create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: Some("uniforms"),
                entries: &[wgt::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: ShaderStage::VERTEX | ShaderStage::COMPUTE,
                    ty: BindingType::UniformBuffer,
                    has_dynamic_offset: dynamic,
                }],
            })
            .unwrap()
    }

    fn shader(
        device: &Arc<Device<Api>>,
        stage: ShaderStage,
        reflection: ShaderReflection,
    ) -> Arc<ShaderModule<Api>> {
        device
            .create_shader_module(&ShaderModuleDescriptor {
                label: None,
                stage,
                reflection,
            })
            .unwrap()
    }

    fn uniform_reflection() -> ShaderReflection {
        ShaderReflection {
            entry_point: "main".to_string(),
            bindings: vec![ReflectedBinding {
                group: 0,
                binding: 0,
                ty: BindingType::UniformBuffer,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn texture_mip_count_is_bounded() {
        let device = device();
        let desc = TextureDescriptor {
            label: Some("mips"),
            size: wgt::Extent3d {
                width: 64,
                height: 16,
                depth: 1,
            },
            mip_level_count: 8,
            format: wgt::TextureFormat::R8Unorm,
            allowed_usage: TextureUsage::SAMPLED,
            initial_usage: TextureUsage::SAMPLED,
        };
        assert!(matches!(
            device.create_texture(&desc),
            Err(CreateTextureError::InvalidMipLevelCount {
                requested: 8,
                maximum: 7,
            })
        ));

        let texture = device
            .create_texture(&TextureDescriptor {
                mip_level_count: 7,
                ..desc
            })
            .unwrap();
        let view = device
            .create_texture_view(
                &texture,
                &TextureViewDescriptor {
                    label: None,
                    base_mip_level: 3,
                },
            )
            .unwrap();
        assert_eq!(view.base_mip_level(), 3);
        assert_eq!(
            view.extent(),
            wgt::Extent3d {
                width: 8,
                height: 2,
                depth: 1,
            }
        );
        assert!(device
            .create_texture_view(
                &texture,
                &TextureViewDescriptor {
                    label: None,
                    base_mip_level: 7,
                },
            )
            .is_err());
        assert_eq!(device.error_count(), 2);
    }

    #[test]
    fn bind_group_layout_rules() {
        let device = device();
        let entry = wgt::BindGroupLayoutEntry {
            binding: 2,
            visibility: ShaderStage::FRAGMENT,
            ty: BindingType::Sampler,
            has_dynamic_offset: false,
        };
        assert!(matches!(
            device.create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: None,
                entries: &[entry, entry],
            }),
            Err(CreateBindGroupLayoutError::ConflictBinding(2))
        ));
        assert!(matches!(
            device.create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: None,
                entries: &[wgt::BindGroupLayoutEntry {
                    has_dynamic_offset: true,
                    ..entry
                }],
            }),
            Err(CreateBindGroupLayoutError::DynamicNonBuffer(2))
        ));
        assert!(matches!(
            device.create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: None,
                entries: &[wgt::BindGroupLayoutEntry {
                    binding: 16,
                    ..entry
                }],
            }),
            Err(CreateBindGroupLayoutError::BindingOutOfRange { binding: 16, .. })
        ));

        // equal content, equal layouts
        let a = uniform_layout(&device, false);
        let b = uniform_layout(&device, false);
        assert!(*a == *b);
        assert!(*a != *uniform_layout(&device, true));
    }

    #[test]
    fn bind_group_resources_are_checked() {
        let device = device();
        let layout = uniform_layout(&device, true);
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some("uniforms"),
                size: 1024,
                allowed_usage: Bu::UNIFORM | Bu::TRANSFER_DST,
                initial_usage: Bu::UNIFORM,
            })
            .unwrap();
        let storage_only = device
            .create_buffer(&BufferDescriptor {
                label: Some("storage"),
                size: 1024,
                allowed_usage: Bu::STORAGE,
                initial_usage: Bu::STORAGE,
            })
            .unwrap();

        let bind = |buffer: &Arc<Buffer<Api>>, offset, size| {
            device.create_bind_group(&BindGroupDescriptor {
                label: None,
                layout: &layout,
                entries: &[BindGroupEntry {
                    binding: 0,
                    resource: BindingResource::Buffer(BufferBinding {
                        buffer,
                        offset,
                        size,
                    }),
                }],
            })
        };

        assert!(matches!(
            bind(&storage_only, 0, 16),
            Err(CreateBindGroupError::MissingBufferUsage(_))
        ));
        assert!(matches!(
            bind(&buffer, u64::MAX - 1, 10),
            Err(CreateBindGroupError::BindingRangeTooLarge { .. })
        ));

        let group = bind(&buffer, 256, 512).unwrap();
        assert_eq!(group.dynamic_binding_info.len(), 1);
        assert_eq!(group.dynamic_binding_info[0].maximum_dynamic_offset, 256);
        assert_eq!(group.validate_dynamic_bindings(&[256]), Ok(()));
        assert!(group.validate_dynamic_bindings(&[512]).is_err());
        assert!(group.validate_dynamic_bindings(&[]).is_err());
        assert_eq!(device.error_count(), 2);
    }

    #[test]
    fn input_state_rules() {
        let device = device();
        let input = wgt::VertexInput {
            slot: 1,
            stride: 16,
            step_mode: wgt::InputStepMode::Vertex,
        };
        let attribute = wgt::VertexAttribute {
            location: 3,
            slot: 1,
            format: wgt::VertexFormat::Float3,
            offset: 4,
        };

        let state = device
            .create_input_state(&InputStateDescriptor {
                label: None,
                inputs: &[input],
                attributes: &[attribute],
            })
            .unwrap();
        assert_eq!(state.inputs_mask(), 1 << 1);
        assert_eq!(state.attributes_mask(), 1 << 3);

        assert!(matches!(
            device.create_input_state(&InputStateDescriptor {
                label: None,
                inputs: &[input],
                attributes: &[wgt::VertexAttribute { slot: 0, ..attribute }],
            }),
            Err(CreateInputStateError::UndeclaredSlot { location: 3, slot: 0 })
        ));
        assert!(matches!(
            device.create_input_state(&InputStateDescriptor {
                label: None,
                inputs: &[input],
                attributes: &[wgt::VertexAttribute { offset: 8, ..attribute }],
            }),
            Err(CreateInputStateError::AttributeOutOfStride {
                location: 3,
                end: 20,
                stride: 16,
            })
        ));
        assert!(matches!(
            device.create_input_state(&InputStateDescriptor {
                label: None,
                inputs: &[input, input],
                attributes: &[],
            }),
            Err(CreateInputStateError::DuplicateSlot(1))
        ));
    }

    #[test]
    fn compute_pipeline_matches_layout() {
        let device = device();
        let layout = device
            .create_pipeline_layout(&PipelineLayoutDescriptor {
                label: None,
                bind_group_layouts: &[Some(uniform_layout(&device, false))],
            })
            .unwrap();
        assert_eq!(layout.bind_group_mask(), 1);

        let module = shader(&device, ShaderStage::COMPUTE, uniform_reflection());
        let pipeline = device
            .create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some("compute"),
                layout: &layout,
                stage: ProgrammableStageDescriptor {
                    module: &module,
                    entry_point: "main",
                },
            })
            .unwrap();
        assert!(Arc::ptr_eq(pipeline.layout(), &layout));

        assert!(matches!(
            device.create_compute_pipeline(&ComputePipelineDescriptor {
                label: None,
                layout: &layout,
                stage: ProgrammableStageDescriptor {
                    module: &module,
                    entry_point: "other",
                },
            }),
            Err(CreateComputePipelineError::Stage(StageError::MissingEntryPoint(_)))
        ));

        let empty_layout = device
            .create_pipeline_layout(&PipelineLayoutDescriptor {
                label: None,
                bind_group_layouts: &[],
            })
            .unwrap();
        assert!(matches!(
            device.create_compute_pipeline(&ComputePipelineDescriptor {
                label: None,
                layout: &empty_layout,
                stage: ProgrammableStageDescriptor {
                    module: &module,
                    entry_point: "main",
                },
            }),
            Err(CreateComputePipelineError::Stage(StageError::Binding {
                error: BindingError::Missing,
                ..
            }))
        ));
    }

    #[test]
    fn render_pipeline_stages_must_agree() {
        let device = device();
        let layout = device
            .create_pipeline_layout(&PipelineLayoutDescriptor {
                label: None,
                bind_group_layouts: &[Some(uniform_layout(&device, false))],
            })
            .unwrap();
        let input_state = device
            .create_input_state(&InputStateDescriptor {
                label: None,
                inputs: &[],
                attributes: &[],
            })
            .unwrap();

        let mut vs_reflection = uniform_reflection();
        vs_reflection.push_constants.set(0, PushConstantType::Float);
        let vs = shader(&device, ShaderStage::VERTEX, vs_reflection);
        let mut fs_reflection = ShaderReflection {
            entry_point: "main".to_string(),
            ..Default::default()
        };
        fs_reflection.push_constants.set(0, PushConstantType::Int);
        let fs = shader(&device, ShaderStage::FRAGMENT, fs_reflection);

        let desc = RenderPipelineDescriptor {
            label: None,
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
            color_formats: &[wgt::TextureFormat::B8G8R8A8Unorm],
            depth_stencil_format: None,
        };
        assert!(matches!(
            device.create_render_pipeline(&desc),
            Err(CreateRenderPipelineError::PushConstantTypeMismatch { slot: 0 })
        ));

        // a fragment module in the vertex slot
        assert!(matches!(
            device.create_render_pipeline(&RenderPipelineDescriptor {
                vertex_stage: ProgrammableStageDescriptor {
                    module: &fs,
                    entry_point: "main",
                },
                ..desc
            }),
            Err(CreateRenderPipelineError::Stage {
                stage,
                error: StageError::WrongStage { .. },
            }) if stage == ShaderStage::VERTEX
        ));
    }

    #[test]
    fn shader_reflection_is_checked() {
        let device = device();
        let result = device.create_shader_module(&ShaderModuleDescriptor {
            label: None,
            stage: ShaderStage::VERTEX | ShaderStage::FRAGMENT,
            reflection: ShaderReflection::default(),
        });
        assert!(matches!(result, Err(CreateShaderModuleError::InvalidStage(_))));

        let result = device.create_shader_module(&ShaderModuleDescriptor {
            label: None,
            stage: ShaderStage::FRAGMENT,
            reflection: ShaderReflection {
                vertex_inputs_used: 1,
                ..Default::default()
            },
        });
        assert!(matches!(
            result,
            Err(CreateShaderModuleError::UnexpectedVertexInputs)
        ));
    }
}
