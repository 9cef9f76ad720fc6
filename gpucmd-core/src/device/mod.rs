use crate::{
    command::CommandBufferBuilder,
    error::format_pretty_any,
    resource::{BufferMapState, DeviceError, TrackerIndex},
    Label, LabelHelpers as _, SubmissionIndex,
};

use arrayvec::ArrayVec;
use hal::Device as _;
use parking_lot::Mutex;
use thiserror::Error;
use wgt::TextureFormat;

use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

pub mod life;
mod queue;
mod resource;

pub use queue::{Queue, QueueSubmitError};

use life::{PendingMapping, SerialQueue};

/// Formats of the attachments a render pass writes, which pipelines must match.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub(crate) struct RenderPassContext {
    pub(crate) colors: ArrayVec<TextureFormat, { hal::MAX_COLOR_ATTACHMENTS }>,
    pub(crate) depth_stencil: Option<TextureFormat>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum RenderPassCompatibilityError {
    #[error("Incompatible color attachment: the renderpass expected {expected:?} but was given {actual:?}")]
    IncompatibleColorAttachment {
        expected: Vec<TextureFormat>,
        actual: Vec<TextureFormat>,
    },
    #[error("Incompatible depth-stencil attachment: the renderpass expected {expected:?} but was given {actual:?}")]
    IncompatibleDepthStencilAttachment {
        expected: Option<TextureFormat>,
        actual: Option<TextureFormat>,
    },
}

impl RenderPassContext {
    pub(crate) fn check_compatible(
        &self,
        other: &Self,
    ) -> Result<(), RenderPassCompatibilityError> {
        if self.colors != other.colors {
            return Err(RenderPassCompatibilityError::IncompatibleColorAttachment {
                expected: self.colors.iter().cloned().collect(),
                actual: other.colors.iter().cloned().collect(),
            });
        }
        if self.depth_stencil != other.depth_stencil {
            return Err(
                RenderPassCompatibilityError::IncompatibleDepthStencilAttachment {
                    expected: self.depth_stencil,
                    actual: other.depth_stencil,
                },
            );
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Error)]
pub enum CreateDeviceError {
    #[error("Limit '{0}' exceeds what the implementation supports")]
    LimitExceedsMaximum(&'static str),
}

pub type ErrorHandler = Box<dyn Fn(&str) + Send + Sync + 'static>;

struct ErrorSink {
    handler: Option<Arc<dyn Fn(&str) + Send + Sync + 'static>>,
    count: usize,
    last: Option<String>,
}

/// Structure describing a logical device, and the root of every object
/// created from it.
pub struct Device<A: hal::Api> {
    pub(crate) raw: A::Device,
    pub(crate) queue: Mutex<A::Queue>,
    limits: wgt::Limits,
    error_sink: Mutex<ErrorSink>,
    tracker_index: AtomicU32,
    /// The serial of the last submission made on any queue of this device.
    pub(crate) last_submission: AtomicU64,
    /// Map reads, keyed by the serial they wait on.
    pending_maps: Mutex<SerialQueue<PendingMapping<A>>>,
    label: String,
}

impl<A: hal::Api> fmt::Debug for Device<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("label", &self.label)
            .field("limits", &self.limits)
            .field("last_submission", &self.last_submission)
            .finish()
    }
}

impl<A: hal::Api> Device<A> {
    pub fn new(
        open: hal::OpenDevice<A>,
        limits: wgt::Limits,
        label: Label,
    ) -> Result<Arc<Self>, CreateDeviceError> {
        if let Some(name) = limits.check_maxima() {
            return Err(CreateDeviceError::LimitExceedsMaximum(name));
        }

        log::info!("Opening device {:?} with {:?}", label, limits);
        Ok(Arc::new(Self {
            raw: open.device,
            queue: Mutex::new(open.queue),
            limits,
            error_sink: Mutex::new(ErrorSink {
                handler: None,
                count: 0,
                last: None,
            }),
            tracker_index: AtomicU32::new(0),
            last_submission: AtomicU64::new(0),
            pending_maps: Mutex::new(SerialQueue::new()),
            label: label.to_owned_label(),
        }))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The limits validation is performed against.
    pub fn limits(&self) -> &wgt::Limits {
        &self.limits
    }

    /// Installs the callback receiving every error message of this device.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.error_sink.lock().handler = Some(Arc::from(handler));
    }

    /// The single funnel of validation errors.
    pub fn handle_error(&self, error: &(dyn Error + 'static)) {
        let message = format_pretty_any(error);
        let handler = {
            let mut sink = self.error_sink.lock();
            sink.count += 1;
            sink.last = Some(message.clone());
            sink.handler.clone()
        };
        // The handler may call back into the device.
        match handler {
            Some(handler) => handler(&message),
            None => log::error!("Unhandled error on device {:?}:\n{}", self.label, message),
        }
    }

    pub fn error_count(&self) -> usize {
        self.error_sink.lock().count
    }

    pub fn last_error(&self) -> Option<String> {
        self.error_sink.lock().last.clone()
    }

    pub(crate) fn next_tracker_index(&self) -> TrackerIndex {
        TrackerIndex(self.tracker_index.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn schedule_mapping(&self, mapping: PendingMapping<A>) {
        let mut pending_maps = self.pending_maps.lock();
        let serial = self.last_submission.load(Ordering::Acquire);
        log::trace!("Scheduling map read of {:?} at {}", mapping.range, serial);
        pending_maps.enqueue(serial, mapping);
    }

    /// Polls the backend fence and fires the map callbacks of the
    /// submissions that completed. Returns the last completed serial.
    pub fn tick(&self) -> Result<SubmissionIndex, DeviceError> {
        profiling::scope!("tick");
        let last_done = unsafe { self.raw.get_fence_value()? };
        let ready = self.pending_maps.lock().drain_up_to(last_done);
        if !ready.is_empty() {
            log::debug!("{} map reads ready at {}", ready.len(), last_done);
        }
        // Callbacks run without any device lock held.
        for mapping in ready {
            let result = self.complete_mapping(&mapping);
            (mapping.callback)(result);
        }
        Ok(last_done)
    }

    fn complete_mapping(
        &self,
        mapping: &PendingMapping<A>,
    ) -> Result<Vec<u8>, crate::resource::BufferAccessError> {
        use crate::resource::BufferAccessError;

        let buffer = match mapping.buffer.upgrade() {
            Some(buffer) => buffer,
            None => {
                log::warn!("Mapping request is dropped because the buffer is destroyed.");
                return Err(BufferAccessError::MapAborted);
            }
        };
        let mut state = buffer.state.lock();
        if state.map != BufferMapState::Waiting {
            // unmapped before completion
            return Err(BufferAccessError::MapAborted);
        }
        match unsafe { self.raw.read_buffer(&buffer.raw, mapping.range.clone()) } {
            Ok(data) => {
                log::debug!("Buffer {:?} map state -> Mapped", buffer.label());
                state.map = BufferMapState::Mapped;
                Ok(data)
            }
            Err(error) => {
                log::error!("Mapping failed {:?}", error);
                state.map = BufferMapState::Idle;
                Err(BufferAccessError::Device(error))
            }
        }
    }

    pub fn create_command_buffer_builder(self: &Arc<Self>, label: Label) -> CommandBufferBuilder<A> {
        api_log!("Device::create_command_buffer_builder {:?}", label);
        CommandBufferBuilder::new(self, label)
    }

    /// Creates a queue submitting to the device's backend queue.
    pub fn create_queue(self: &Arc<Self>) -> Queue<A> {
        api_log!("Device::create_queue");
        Queue::new(self)
    }
}
