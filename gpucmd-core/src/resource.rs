use crate::{
    checked_range_end,
    device::{life::PendingMapping, Device},
    track::{UsageError, UsageState},
    Label, LabelHelpers as _,
};

use parking_lot::Mutex;
use thiserror::Error;

use std::{
    fmt,
    mem::ManuallyDrop,
    ops::Range,
    sync::{Arc, Weak},
};

pub use hal::DeviceError;

/// Unique index of a resource inside its device, used as a key by trackers.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrackerIndex(pub(crate) u32);

#[derive(Debug)]
pub struct ResourceInfo {
    tracker_index: TrackerIndex,
    label: String,
}

impl ResourceInfo {
    pub(crate) fn new<A: hal::Api>(device: &Device<A>, label: Label) -> Self {
        Self {
            tracker_index: device.next_tracker_index(),
            label: label.to_owned_label(),
        }
    }

    pub(crate) fn tracker_index(&self) -> TrackerIndex {
        self.tracker_index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn error_ident(&self, r#type: &'static str) -> ResourceErrorIdent {
        ResourceErrorIdent {
            r#type,
            label: self.label.clone(),
        }
    }
}

/// Names a resource inside an error message.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceErrorIdent {
    r#type: &'static str,
    label: String,
}

impl fmt::Display for ResourceErrorIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} with '{}' label", self.r#type, self.label)
    }
}

#[derive(Clone, Debug, Error)]
#[error("Usage flags {actual:?} of {res} do not contain required usage flags {expected:?}")]
pub struct MissingBufferUsageError {
    pub(crate) res: ResourceErrorIdent,
    pub(crate) actual: wgt::BufferUsage,
    pub(crate) expected: wgt::BufferUsage,
}

#[derive(Clone, Debug, Error)]
#[error("Usage flags {actual:?} of {res} do not contain required usage flags {expected:?}")]
pub struct MissingTextureUsageError {
    pub(crate) res: ResourceErrorIdent,
    pub(crate) actual: wgt::TextureUsage,
    pub(crate) expected: wgt::TextureUsage,
}

#[derive(Clone, Debug)]
pub struct BufferDescriptor<'a> {
    pub label: Label<'a>,
    pub size: wgt::BufferAddress,
    /// Every usage the buffer may ever be transitioned to.
    pub allowed_usage: wgt::BufferUsage,
    pub initial_usage: wgt::BufferUsage,
}

#[derive(Clone, Debug, Error)]
pub enum CreateBufferError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Buffer size {requested} is greater than the maximum buffer size ({maximum})")]
    MaxBufferSize {
        requested: wgt::BufferAddress,
        maximum: wgt::BufferAddress,
    },
    #[error("Buffers cannot have empty allowed usage flags")]
    EmptyUsage,
    #[error("Initial usage is not possible: {0}")]
    InvalidInitialUsage(#[from] UsageError<wgt::BufferUsage>),
}

#[derive(Clone, Debug, Error)]
pub enum BufferAccessError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Buffer is already mapped")]
    AlreadyMapped,
    #[error("Buffer map is pending")]
    MapAlreadyPending,
    #[error("Buffer is not mapped")]
    NotMapped,
    #[error(transparent)]
    MissingBufferUsage(#[from] MissingBufferUsageError),
    #[error("Buffer access out of bounds: range starting at {offset} with size {size} would overrun the buffer (size {buffer_size})")]
    OutOfBoundsOverrun {
        offset: wgt::BufferAddress,
        size: wgt::BufferAddress,
        buffer_size: wgt::BufferAddress,
    },
    #[error("Buffer map aborted")]
    MapAborted,
}

#[derive(Clone, Debug, Error)]
pub enum BufferTransitionError {
    #[error("Buffer usage transition is not possible: {0}")]
    Usage(#[from] UsageError<wgt::BufferUsage>),
    #[error("Buffer usage cannot change while it is mapped")]
    Mapped,
}

pub type BufferMapCallback =
    Box<dyn FnOnce(Result<Vec<u8>, BufferAccessError>) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BufferMapState {
    Idle,
    /// A map read was requested and waits for its submission to complete.
    Waiting,
    Mapped,
}

#[derive(Debug)]
pub(crate) struct BufferState {
    pub(crate) usage: UsageState<wgt::BufferUsage>,
    pub(crate) map: BufferMapState,
}

#[derive(Debug)]
pub struct Buffer<A: hal::Api> {
    pub(crate) raw: ManuallyDrop<A::Buffer>,
    pub(crate) device: Arc<Device<A>>,
    pub(crate) size: wgt::BufferAddress,
    pub(crate) state: Mutex<BufferState>,
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> Drop for Buffer<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw Buffer {:?}", self.info.label());
        unsafe {
            use hal::Device as _;
            let raw = ManuallyDrop::take(&mut self.raw);
            self.device.raw.destroy_buffer(raw);
        }
    }
}

impl<A: hal::Api> Buffer<A> {
    pub fn size(&self) -> wgt::BufferAddress {
        self.size
    }

    pub fn label(&self) -> &str {
        self.info.label()
    }

    pub fn allowed_usage(&self) -> wgt::BufferUsage {
        self.state.lock().usage.allowed()
    }

    pub fn current_usage(&self) -> wgt::BufferUsage {
        self.state.lock().usage.current()
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().usage.is_frozen()
    }

    pub fn has_frozen_usage(&self, usage: wgt::BufferUsage) -> bool {
        self.state.lock().usage.has_frozen_usage(usage)
    }

    pub fn is_transition_possible(&self, usage: wgt::BufferUsage) -> bool {
        self.state.lock().usage.is_transition_possible(usage)
    }

    pub fn map_state(&self) -> BufferMapState {
        self.state.lock().map
    }

    pub(crate) fn error_ident(&self) -> ResourceErrorIdent {
        self.info.error_ident("Buffer")
    }

    pub(crate) fn check_allowed_usage(
        &self,
        expected: wgt::BufferUsage,
    ) -> Result<(), MissingBufferUsageError> {
        let actual = self.allowed_usage();
        if actual.contains(expected) {
            Ok(())
        } else {
            Err(MissingBufferUsageError {
                res: self.error_ident(),
                actual,
                expected,
            })
        }
    }

    fn check_current_usage(
        &self,
        state: &BufferState,
        expected: wgt::BufferUsage,
    ) -> Result<(), MissingBufferUsageError> {
        let actual = state.usage.current();
        if actual.contains(expected) {
            Ok(())
        } else {
            Err(MissingBufferUsageError {
                res: self.error_ident(),
                actual,
                expected,
            })
        }
    }

    fn check_range(
        &self,
        offset: wgt::BufferAddress,
        size: wgt::BufferAddress,
    ) -> Result<Range<wgt::BufferAddress>, BufferAccessError> {
        match checked_range_end(offset, size, self.size) {
            Some(end) => Ok(offset..end),
            None => Err(BufferAccessError::OutOfBoundsOverrun {
                offset,
                size,
                buffer_size: self.size,
            }),
        }
    }

    /// Transitions the buffer to `usage` immediately, outside of any command buffer.
    pub fn transition_usage(&self, usage: wgt::BufferUsage) -> Result<(), BufferTransitionError> {
        let result = {
            let mut state = self.state.lock();
            if state.map != BufferMapState::Idle {
                Err(BufferTransitionError::Mapped)
            } else {
                state
                    .usage
                    .transition(usage)
                    .map(|_| ())
                    .map_err(BufferTransitionError::from)
            }
        };
        if let Err(ref error) = result {
            self.device.handle_error(error);
        }
        result
    }

    /// Fixes the usage of the buffer to `usage` for the rest of its lifetime.
    pub fn freeze_usage(&self, usage: wgt::BufferUsage) -> Result<(), BufferTransitionError> {
        let result = {
            let mut state = self.state.lock();
            if state.map != BufferMapState::Idle {
                Err(BufferTransitionError::Mapped)
            } else {
                state.usage.freeze(usage).map_err(BufferTransitionError::from)
            }
        };
        if let Err(ref error) = result {
            self.device.handle_error(error);
        }
        result
    }

    /// Uploads `data` at `offset`. The buffer must currently be in `TRANSFER_DST` usage.
    pub fn set_sub_data(
        &self,
        offset: wgt::BufferAddress,
        data: &[u8],
    ) -> Result<(), BufferAccessError> {
        let result = (|| {
            let state = self.state.lock();
            self.check_current_usage(&state, wgt::BufferUsage::TRANSFER_DST)?;
            if state.map != BufferMapState::Idle {
                return Err(BufferAccessError::AlreadyMapped);
            }
            self.check_range(offset, data.len() as wgt::BufferAddress)?;
            unsafe {
                use hal::Device as _;
                self.device.raw.write_buffer(&self.raw, offset, data)?;
            }
            Ok(())
        })();
        if let Err(ref error) = result {
            self.device.handle_error(error);
        }
        result
    }

    /// Requests the content of a range of the buffer. The callback fires from
    /// `Device::tick` once every submission made so far has completed.
    pub fn map_read_async(
        self: &Arc<Self>,
        offset: wgt::BufferAddress,
        size: wgt::BufferAddress,
        callback: BufferMapCallback,
    ) -> Result<(), BufferAccessError> {
        let result = (|| {
            let mut state = self.state.lock();
            self.check_current_usage(&state, wgt::BufferUsage::MAP_READ)?;
            match state.map {
                BufferMapState::Idle => {}
                BufferMapState::Waiting => return Err(BufferAccessError::MapAlreadyPending),
                BufferMapState::Mapped => return Err(BufferAccessError::AlreadyMapped),
            }
            let range = self.check_range(offset, size)?;
            state.map = BufferMapState::Waiting;
            Ok(range)
        })();
        match result {
            Ok(range) => {
                let weak: Weak<Self> = Arc::downgrade(self);
                self.device.schedule_mapping(PendingMapping {
                    buffer: weak,
                    range,
                    callback,
                });
                Ok(())
            }
            Err(error) => {
                self.device.handle_error(&error);
                Err(error)
            }
        }
    }

    pub fn unmap(&self) -> Result<(), BufferAccessError> {
        let mut state = self.state.lock();
        match state.map {
            BufferMapState::Mapped => {
                state.map = BufferMapState::Idle;
                Ok(())
            }
            BufferMapState::Waiting => {
                // the pending callback reports the abort
                state.map = BufferMapState::Idle;
                Ok(())
            }
            BufferMapState::Idle => {
                drop(state);
                let error = BufferAccessError::NotMapped;
                self.device.handle_error(&error);
                Err(error)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct TextureDescriptor<'a> {
    pub label: Label<'a>,
    pub size: wgt::Extent3d,
    pub mip_level_count: u32,
    pub format: wgt::TextureFormat,
    /// Every usage the texture may ever be transitioned to.
    pub allowed_usage: wgt::TextureUsage,
    pub initial_usage: wgt::TextureUsage,
}

#[derive(Clone, Debug, Error)]
pub enum CreateTextureError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Texture dimensions {0:?} must not be zero")]
    InvalidDimension(wgt::Extent3d),
    #[error("Texture dimension {dim} is greater than the maximum ({max})")]
    TooLarge { dim: u32, max: u32 },
    #[error("Texture mip level count {requested} must be between 1 and {maximum}")]
    InvalidMipLevelCount { requested: u32, maximum: u32 },
    #[error("Textures cannot have empty allowed usage flags")]
    EmptyUsage,
    #[error("Initial usage is not possible: {0}")]
    InvalidInitialUsage(#[from] UsageError<wgt::TextureUsage>),
}

#[derive(Debug)]
pub struct Texture<A: hal::Api> {
    pub(crate) raw: ManuallyDrop<A::Texture>,
    pub(crate) device: Arc<Device<A>>,
    pub(crate) size: wgt::Extent3d,
    pub(crate) mip_level_count: u32,
    pub(crate) format: wgt::TextureFormat,
    pub(crate) usage: Mutex<UsageState<wgt::TextureUsage>>,
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> Drop for Texture<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw Texture {:?}", self.info.label());
        unsafe {
            use hal::Device as _;
            let raw = ManuallyDrop::take(&mut self.raw);
            self.device.raw.destroy_texture(raw);
        }
    }
}

impl<A: hal::Api> Texture<A> {
    pub fn size(&self) -> wgt::Extent3d {
        self.size
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }

    pub fn format(&self) -> wgt::TextureFormat {
        self.format
    }

    pub fn label(&self) -> &str {
        self.info.label()
    }

    pub fn allowed_usage(&self) -> wgt::TextureUsage {
        self.usage.lock().allowed()
    }

    pub fn current_usage(&self) -> wgt::TextureUsage {
        self.usage.lock().current()
    }

    pub fn is_frozen(&self) -> bool {
        self.usage.lock().is_frozen()
    }

    pub fn has_frozen_usage(&self, usage: wgt::TextureUsage) -> bool {
        self.usage.lock().has_frozen_usage(usage)
    }

    pub fn is_transition_possible(&self, usage: wgt::TextureUsage) -> bool {
        self.usage.lock().is_transition_possible(usage)
    }

    pub(crate) fn error_ident(&self) -> ResourceErrorIdent {
        self.info.error_ident("Texture")
    }

    pub(crate) fn check_allowed_usage(
        &self,
        expected: wgt::TextureUsage,
    ) -> Result<(), MissingTextureUsageError> {
        let actual = self.allowed_usage();
        if actual.contains(expected) {
            Ok(())
        } else {
            Err(MissingTextureUsageError {
                res: self.error_ident(),
                actual,
                expected,
            })
        }
    }

    /// Transitions the texture to `usage` immediately, outside of any command buffer.
    pub fn transition_usage(
        &self,
        usage: wgt::TextureUsage,
    ) -> Result<(), UsageError<wgt::TextureUsage>> {
        let result = self.usage.lock().transition(usage).map(|_| ());
        if let Err(ref error) = result {
            self.device.handle_error(error);
        }
        result
    }

    /// Fixes the usage of the texture to `usage` for the rest of its lifetime.
    pub fn freeze_usage(&self, usage: wgt::TextureUsage) -> Result<(), UsageError<wgt::TextureUsage>> {
        let result = self.usage.lock().freeze(usage);
        if let Err(ref error) = result {
            self.device.handle_error(error);
        }
        result
    }
}

#[derive(Clone, Debug, Default)]
pub struct TextureViewDescriptor<'a> {
    pub label: Label<'a>,
    pub base_mip_level: u32,
}

#[derive(Clone, Debug, Error)]
pub enum CreateTextureViewError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Mip level {level} is out of range, the texture has {total} levels")]
    InvalidMipLevel { level: u32, total: u32 },
}

#[derive(Debug)]
pub struct TextureView<A: hal::Api> {
    pub(crate) raw: ManuallyDrop<A::TextureView>,
    pub(crate) parent: Arc<Texture<A>>,
    pub(crate) base_mip_level: u32,
    /// Extent of the mip level the view starts at.
    pub(crate) extent: wgt::Extent3d,
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> Drop for TextureView<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw TextureView {:?}", self.info.label());
        unsafe {
            use hal::Device as _;
            let raw = ManuallyDrop::take(&mut self.raw);
            self.parent.device.raw.destroy_texture_view(raw);
        }
    }
}

impl<A: hal::Api> TextureView<A> {
    pub fn texture(&self) -> &Arc<Texture<A>> {
        &self.parent
    }

    pub fn base_mip_level(&self) -> u32 {
        self.base_mip_level
    }

    pub fn extent(&self) -> wgt::Extent3d {
        self.extent
    }

    pub fn format(&self) -> wgt::TextureFormat {
        self.parent.format
    }
}

pub type SamplerDescriptor<'a> = wgt::SamplerDescriptor<Label<'a>>;

#[derive(Debug)]
pub struct Sampler<A: hal::Api> {
    pub(crate) raw: ManuallyDrop<A::Sampler>,
    pub(crate) device: Arc<Device<A>>,
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> Drop for Sampler<A> {
    fn drop(&mut self) {
        resource_log!("Destroy raw Sampler {:?}", self.info.label());
        unsafe {
            use hal::Device as _;
            let raw = ManuallyDrop::take(&mut self.raw);
            self.device.raw.destroy_sampler(raw);
        }
    }
}
