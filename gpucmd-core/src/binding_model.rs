use crate::{
    device::Device,
    resource::{
        Buffer, DeviceError, MissingBufferUsageError, MissingTextureUsageError, ResourceInfo,
        Sampler, Texture, TextureView,
    },
    Label,
};

use arrayvec::ArrayVec;
use thiserror::Error;

use std::{
    hash::{Hash, Hasher},
    mem::ManuallyDrop,
    sync::Arc,
};

#[derive(Clone, Debug, Error)]
pub enum CreateBindGroupLayoutError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Conflicting binding at index {0}")]
    ConflictBinding(u32),
    #[error("Binding index {binding} is out of range, it must be lower than {maximum}")]
    BindingOutOfRange { binding: u32, maximum: u32 },
    #[error("Binding {0} is not visible from any shader stage")]
    EmptyVisibility(u32),
    #[error("Binding {0} has a dynamic offset but is not a buffer binding")]
    DynamicNonBuffer(u32),
    #[error("Too many dynamic bindings: {count} exceeds the limit of {limit}")]
    TooManyDynamic { count: u32, limit: u32 },
}

#[derive(Clone, Debug)]
pub struct BindGroupLayoutDescriptor<'a> {
    pub label: Label<'a>,
    pub entries: &'a [wgt::BindGroupLayoutEntry],
}

/// Immutable description of the bindings a bind group provides.
///
/// Two layouts created from the same entries compare equal.
#[derive(Debug)]
pub struct BindGroupLayout<A: hal::Api> {
    pub(crate) raw: ManuallyDrop<A::BindGroupLayout>,
    pub(crate) device: Arc<Device<A>>,
    /// Entries sorted by binding index.
    pub(crate) entries: ArrayVec<wgt::BindGroupLayoutEntry, { wgt::MAX_BINDINGS_PER_GROUP }>,
    pub(crate) binding_mask: u32,
    pub(crate) dynamic_count: usize,
    pub(crate) content_hash: u64,
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> Drop for BindGroupLayout<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw BindGroupLayout {:?}", self.info.label());
        unsafe {
            use hal::Device as _;
            let raw = ManuallyDrop::take(&mut self.raw);
            self.device.raw.destroy_bind_group_layout(raw);
        }
    }
}

impl<A: hal::Api> PartialEq for BindGroupLayout<A> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
            || (self.content_hash == other.content_hash && self.entries == other.entries)
    }
}

impl<A: hal::Api> Eq for BindGroupLayout<A> {}

impl<A: hal::Api> Hash for BindGroupLayout<A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.content_hash.hash(state);
    }
}

impl<A: hal::Api> BindGroupLayout<A> {
    pub(crate) fn content_hash_of(entries: &[wgt::BindGroupLayoutEntry]) -> u64 {
        let mut hasher = fxhash::FxHasher::default();
        entries.hash(&mut hasher);
        hasher.finish()
    }

    pub fn entry(&self, binding: u32) -> Option<&wgt::BindGroupLayoutEntry> {
        if binding as usize >= wgt::MAX_BINDINGS_PER_GROUP
            || self.binding_mask & (1 << binding) == 0
        {
            return None;
        }
        self.entries.iter().find(|entry| entry.binding == binding)
    }

    pub fn entries(&self) -> &[wgt::BindGroupLayoutEntry] {
        &self.entries
    }

    pub fn binding_mask(&self) -> u32 {
        self.binding_mask
    }

    pub fn dynamic_count(&self) -> usize {
        self.dynamic_count
    }
}

#[derive(Clone, Debug, Error)]
pub enum CreatePipelineLayoutError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Bind group layout count {actual} exceeds device bind group limit {max}")]
    TooManyGroups { actual: usize, max: usize },
}

#[derive(Debug)]
pub struct PipelineLayoutDescriptor<'a, A: hal::Api> {
    pub label: Label<'a>,
    /// Layout of every bind group slot, `None` for slots the pipelines leave unused.
    pub bind_group_layouts: &'a [Option<Arc<BindGroupLayout<A>>>],
}

pub type BindGroupMask = u8;

#[derive(Debug)]
pub struct PipelineLayout<A: hal::Api> {
    pub(crate) raw: ManuallyDrop<A::PipelineLayout>,
    pub(crate) device: Arc<Device<A>>,
    pub(crate) bind_group_layouts:
        ArrayVec<Option<Arc<BindGroupLayout<A>>>, { hal::MAX_BIND_GROUPS }>,
    pub(crate) bind_group_mask: BindGroupMask,
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> Drop for PipelineLayout<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw PipelineLayout {:?}", self.info.label());
        unsafe {
            use hal::Device as _;
            let raw = ManuallyDrop::take(&mut self.raw);
            self.device.raw.destroy_pipeline_layout(raw);
        }
    }
}

impl<A: hal::Api> PipelineLayout<A> {
    pub fn bind_group_mask(&self) -> BindGroupMask {
        self.bind_group_mask
    }

    pub(crate) fn bind_group_layout(&self, index: usize) -> Option<&Arc<BindGroupLayout<A>>> {
        self.bind_group_layouts.get(index).and_then(Option::as_ref)
    }
}

#[derive(Debug)]
pub struct BufferBinding<'a, A: hal::Api> {
    pub buffer: &'a Arc<Buffer<A>>,
    pub offset: wgt::BufferAddress,
    pub size: wgt::BufferAddress,
}

#[derive(Debug)]
pub enum BindingResource<'a, A: hal::Api> {
    Buffer(BufferBinding<'a, A>),
    Sampler(&'a Arc<Sampler<A>>),
    TextureView(&'a Arc<TextureView<A>>),
}

#[derive(Debug)]
pub struct BindGroupEntry<'a, A: hal::Api> {
    pub binding: u32,
    pub resource: BindingResource<'a, A>,
}

#[derive(Debug)]
pub struct BindGroupDescriptor<'a, A: hal::Api> {
    pub label: Label<'a>,
    pub layout: &'a Arc<BindGroupLayout<A>>,
    pub entries: &'a [BindGroupEntry<'a, A>],
}

#[derive(Clone, Debug, Error)]
pub enum CreateBindGroupError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Bind group has {actual} entries, but its layout has {expected}")]
    BindingsNumMismatch { expected: usize, actual: usize },
    #[error("Binding {0} is not declared in the bind group layout")]
    MissingBindingDeclaration(u32),
    #[error("Binding {0} is set more than once")]
    DuplicateBinding(u32),
    #[error("Binding {binding} has a different type ({actual:?}) than the one in the layout ({expected:?})")]
    WrongBindingType {
        binding: u32,
        actual: &'static str,
        expected: wgt::BindingType,
    },
    #[error(transparent)]
    MissingBufferUsage(#[from] MissingBufferUsageError),
    #[error(transparent)]
    MissingTextureUsage(#[from] MissingTextureUsageError),
    #[error("Buffer binding {binding} range {offset}+{size} overruns the buffer of size {buffer_size}")]
    BindingRangeTooLarge {
        binding: u32,
        offset: wgt::BufferAddress,
        size: wgt::BufferAddress,
        buffer_size: wgt::BufferAddress,
    },
    #[error("Uniform buffer binding {binding} range {size} exceeds `max_uniform_binding_size` limit {limit}")]
    UniformBindingSizeTooLarge {
        binding: u32,
        size: wgt::BufferAddress,
        limit: u32,
    },
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum BindError {
    #[error("Number of dynamic offsets ({actual}) doesn't match the number of dynamic bindings in the bind group layout ({expected})")]
    MismatchedDynamicOffsetCount { actual: usize, expected: usize },
    #[error("Dynamic binding at index {idx}: offset {offset} must be aligned to {}", wgt::DYNAMIC_OFFSET_ALIGNMENT)]
    UnalignedDynamicBinding { idx: usize, offset: u32 },
    #[error("Dynamic binding at index {idx} with offset {offset} would overrun the buffer (limit: {max})")]
    DynamicBindingOutOfBounds { idx: usize, offset: u32, max: u64 },
}

#[derive(Debug)]
pub struct BindGroupDynamicBindingData {
    /// The maximum value the dynamic offset can have before running off the end of the buffer.
    pub(crate) maximum_dynamic_offset: wgt::BufferAddress,
}

#[derive(Debug)]
pub struct BindGroup<A: hal::Api> {
    pub(crate) raw: ManuallyDrop<A::BindGroup>,
    pub(crate) device: Arc<Device<A>>,
    pub(crate) layout: Arc<BindGroupLayout<A>>,
    /// Buffers the group reads or writes, with the usage the binding requires.
    pub(crate) used_buffers: Vec<(Arc<Buffer<A>>, wgt::BufferUsage)>,
    pub(crate) used_textures: Vec<(Arc<Texture<A>>, wgt::TextureUsage)>,
    #[allow(dead_code)]
    pub(crate) used_views: Vec<Arc<TextureView<A>>>,
    #[allow(dead_code)]
    pub(crate) used_samplers: Vec<Arc<Sampler<A>>>,
    pub(crate) dynamic_binding_info: Vec<BindGroupDynamicBindingData>,
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> Drop for BindGroup<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw BindGroup {:?}", self.info.label());
        unsafe {
            use hal::Device as _;
            let raw = ManuallyDrop::take(&mut self.raw);
            self.device.raw.destroy_bind_group(raw);
        }
    }
}

impl<A: hal::Api> BindGroup<A> {
    pub fn layout(&self) -> &Arc<BindGroupLayout<A>> {
        &self.layout
    }

    pub(crate) fn validate_dynamic_bindings(
        &self,
        offsets: &[wgt::DynamicOffset],
    ) -> Result<(), BindError> {
        if self.dynamic_binding_info.len() != offsets.len() {
            return Err(BindError::MismatchedDynamicOffsetCount {
                expected: self.dynamic_binding_info.len(),
                actual: offsets.len(),
            });
        }

        for (idx, (info, &offset)) in self
            .dynamic_binding_info
            .iter()
            .zip(offsets.iter())
            .enumerate()
        {
            if offset % wgt::DYNAMIC_OFFSET_ALIGNMENT != 0 {
                return Err(BindError::UnalignedDynamicBinding { idx, offset });
            }

            if offset as wgt::BufferAddress > info.maximum_dynamic_offset {
                return Err(BindError::DynamicBindingOutOfBounds {
                    idx,
                    offset,
                    max: info.maximum_dynamic_offset,
                });
            }
        }

        Ok(())
    }
}
