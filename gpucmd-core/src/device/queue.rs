use crate::{
    command::{encode_stream, CommandBuffer, CommandBufferError, PendingUsages},
    device::{
        life::{ActiveSubmission, LifetimeTracker},
        Device,
    },
    resource::DeviceError,
    SubmissionIndex,
};

use hal::{Device as _, Queue as _};
use parking_lot::Mutex;
use thiserror::Error;

use std::{
    ptr,
    sync::{atomic::Ordering, Arc},
};

#[derive(Clone, Debug, Error)]
pub enum QueueSubmitError {
    #[error(transparent)]
    Queue(#[from] DeviceError),
    #[error("Command buffer {index} belongs to another device")]
    WrongDevice { index: usize },
    #[error("Command buffer {index} is invalid")]
    InvalidCommandBuffer {
        index: usize,
        #[source]
        error: Option<CommandBufferError>,
    },
    #[error("Command buffer {index} was already submitted")]
    AlreadySubmitted { index: usize },
    #[error("Command buffer {index} cannot be submitted")]
    Usage {
        index: usize,
        #[source]
        source: CommandBufferError,
    },
}

/// Submits finished command buffers to the device's backend queue.
///
/// Each queue keeps the work it submitted alive until the fence reports it complete.
#[derive(Debug)]
pub struct Queue<A: hal::Api> {
    device: Arc<Device<A>>,
    life: Mutex<LifetimeTracker<A>>,
}

impl<A: hal::Api> Queue<A> {
    pub(super) fn new(device: &Arc<Device<A>>) -> Self {
        Self {
            device: Arc::clone(device),
            life: Mutex::new(LifetimeTracker::new()),
        }
    }

    pub fn device(&self) -> &Arc<Device<A>> {
        &self.device
    }

    /// Releases the submissions the GPU is done with.
    pub fn maintain(&self) -> Result<SubmissionIndex, DeviceError> {
        profiling::scope!("maintain", "Queue");
        let last_done = unsafe { self.device.raw.get_fence_value()? };
        self.life
            .lock()
            .triage_submissions(&self.device.raw, last_done);
        Ok(last_done)
    }

    /// Number of submissions still waiting on the GPU.
    pub fn active_submission_count(&self) -> usize {
        self.life.lock().active_submission_count()
    }

    fn validate_submit(&self, command_buffers: &[&CommandBuffer<A>]) -> Result<(), QueueSubmitError> {
        let mut pending = PendingUsages::default();
        for (index, &cmd_buf) in command_buffers.iter().enumerate() {
            if !Arc::ptr_eq(&cmd_buf.device, &self.device) {
                return Err(QueueSubmitError::WrongDevice { index });
            }
            if !cmd_buf.is_valid() {
                return Err(QueueSubmitError::InvalidCommandBuffer {
                    index,
                    error: cmd_buf.error().cloned(),
                });
            }
            let repeated = command_buffers[..index]
                .iter()
                .any(|&other| ptr::eq(other, cmd_buf));
            if repeated || !cmd_buf.has_commands() {
                return Err(QueueSubmitError::AlreadySubmitted { index });
            }
            cmd_buf
                .check_resource_usages(&mut pending)
                .map_err(|source| QueueSubmitError::Usage { index, source })?;
        }
        Ok(())
    }

    /// Submits the command buffers in order and returns the serial of the submission.
    ///
    /// Every command buffer is validated before any of them is translated, so
    /// nothing reaches the backend when one of them fails.
    pub fn submit(
        &self,
        command_buffers: &[&CommandBuffer<A>],
    ) -> Result<SubmissionIndex, QueueSubmitError> {
        profiling::scope!("submit", "Queue");
        api_log!("Queue::submit {} command buffers", command_buffers.len());

        let result = self
            .validate_submit(command_buffers)
            .and_then(|()| self.maintain().map_err(QueueSubmitError::from))
            .and_then(|_| self.submit_validated(command_buffers));
        if let Err(ref error) = result {
            self.device.handle_error(error);
        }
        result
    }

    fn submit_validated(
        &self,
        command_buffers: &[&CommandBuffer<A>],
    ) -> Result<SubmissionIndex, QueueSubmitError> {
        let mut submission = ActiveSubmission {
            raw: Vec::with_capacity(command_buffers.len()),
            streams: Vec::with_capacity(command_buffers.len()),
        };
        for (index, &cmd_buf) in command_buffers.iter().enumerate() {
            let mut stream = cmd_buf
                .acquire_commands()
                .map_err(|source| QueueSubmitError::Usage { index, source })?;
            let encoded = {
                profiling::scope!("encode");
                encode_stream(&self.device.raw, &mut stream, Some(cmd_buf.label()))
            };
            match encoded {
                Ok(raw) => {
                    submission.raw.push(raw);
                    submission.streams.push(stream);
                }
                Err(error) => {
                    for raw in submission.raw.drain(..) {
                        unsafe { self.device.raw.destroy_command_buffer(raw) };
                    }
                    return Err(error.into());
                }
            }
        }

        let mut raw_queue = self.device.queue.lock();
        let index = self.device.last_submission.load(Ordering::Acquire) + 1;
        let submit_result = {
            let refs = submission.raw.iter().collect::<Vec<_>>();
            unsafe { raw_queue.submit(&refs, index) }
        };
        if let Err(error) = submit_result {
            for raw in submission.raw.drain(..) {
                unsafe { self.device.raw.destroy_command_buffer(raw) };
            }
            return Err(error.into());
        }
        self.device.last_submission.store(index, Ordering::Release);
        drop(raw_queue);

        log::debug!(
            "Submission {} with {} command buffers",
            index,
            submission.raw.len()
        );
        self.life.lock().track_submission(index, submission);
        Ok(index)
    }
}

impl<A: hal::Api> Drop for Queue<A> {
    fn drop(&mut self) {
        let mut life = self.life.lock();
        if let Ok(last_done) = unsafe { self.device.raw.get_fence_value() } {
            life.triage_submissions(&self.device.raw, last_done);
        }
        let remaining = life.active_submission_count();
        if remaining != 0 {
            log::warn!("Queue dropped with {} submissions in flight", remaining);
        }
        life.cleanup(&self.device.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::{RenderPassColorAttachment, RenderPassInfo},
        resource::{BufferDescriptor, TextureDescriptor, TextureViewDescriptor},
    };
    use hal::empty::{self, Api};
    use wgt::{BufferUsage as Bu, TextureUsage as Tu};

    fn device() -> Arc<Device<Api>> {
        Device::new(empty::Context::open(), wgt::Limits::default(), Some("queue")).unwrap()
    }

    #[test]
    fn submit_applies_transitions() {
        let device = device();
        let queue = device.create_queue();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some("staging"),
                size: 256,
                allowed_usage: Bu::TRANSFER_SRC | Bu::TRANSFER_DST,
                initial_usage: Bu::TRANSFER_DST,
            })
            .unwrap();

        let mut builder = device.create_command_buffer_builder(Some("upload"));
        builder.transition_buffer_usage(&buffer, Bu::TRANSFER_SRC).unwrap();
        let cb = builder.finish();
        assert!(cb.is_valid());
        // recording leaves the current usage alone
        assert_eq!(buffer.current_usage(), Bu::TRANSFER_DST);

        assert_eq!(queue.submit(&[&cb]).unwrap(), 1);
        assert_eq!(buffer.current_usage(), Bu::TRANSFER_SRC);
        assert_eq!(queue.active_submission_count(), 1);
        assert_eq!(queue.maintain().unwrap(), 1);
        assert_eq!(queue.active_submission_count(), 0);
        assert_eq!(device.error_count(), 0);
    }

    #[test]
    fn second_submission_is_rejected() {
        let device = device();
        let queue = device.create_queue();
        let mut builder = device.create_command_buffer_builder(None);
        builder.insert_debug_marker("marker").unwrap();
        let cb = builder.finish();

        assert!(matches!(
            queue.submit(&[&cb, &cb]),
            Err(QueueSubmitError::AlreadySubmitted { index: 1 })
        ));
        // nothing was consumed by the failed submission
        assert!(cb.has_commands());
        queue.submit(&[&cb]).unwrap();
        assert!(matches!(
            queue.submit(&[&cb]),
            Err(QueueSubmitError::AlreadySubmitted { index: 0 })
        ));
        assert_eq!(device.error_count(), 2);
    }

    #[test]
    fn invalid_buffers_block_the_whole_submission() {
        let device = device();
        let queue = device.create_queue();

        let mut builder = device.create_command_buffer_builder(None);
        builder.push_debug_group("left open").unwrap();
        let bad = builder.finish();
        assert!(!bad.is_valid());

        let mut builder = device.create_command_buffer_builder(None);
        builder.insert_debug_marker("fine").unwrap();
        let good = builder.finish();

        assert!(matches!(
            queue.submit(&[&good, &bad]),
            Err(QueueSubmitError::InvalidCommandBuffer { index: 1, .. })
        ));
        assert!(good.has_commands());
        assert_eq!(queue.active_submission_count(), 0);
    }

    #[test]
    fn frozen_after_recording_is_rejected() {
        let device = device();
        let queue = device.create_queue();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some("frozen"),
                size: 16,
                allowed_usage: Bu::VERTEX | Bu::TRANSFER_DST,
                initial_usage: Bu::TRANSFER_DST,
            })
            .unwrap();

        let mut builder = device.create_command_buffer_builder(None);
        builder.transition_buffer_usage(&buffer, Bu::VERTEX).unwrap();
        let cb = builder.finish();
        buffer.freeze_usage(Bu::TRANSFER_DST).unwrap();

        assert!(matches!(
            queue.submit(&[&cb]),
            Err(QueueSubmitError::Usage {
                index: 0,
                source: CommandBufferError::FrozenBufferTransition(_),
            })
        ));
        assert_eq!(buffer.current_usage(), Bu::TRANSFER_DST);
    }

    #[test]
    fn map_read_waits_for_the_submission() {
        let device = device();
        let queue = device.create_queue();
        let buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some("readback"),
                size: 32,
                allowed_usage: Bu::MAP_READ | Bu::TRANSFER_DST,
                initial_usage: Bu::TRANSFER_DST,
            })
            .unwrap();

        let mut builder = device.create_command_buffer_builder(None);
        builder.transition_buffer_usage(&buffer, Bu::MAP_READ).unwrap();
        queue.submit(&[&builder.finish()]).unwrap();

        let done = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&done);
        buffer
            .map_read_async(0, 32, Box::new(move |data| *sink.lock() = Some(data)))
            .unwrap();
        assert_eq!(device.tick().unwrap(), 1);
        assert!(matches!(*done.lock(), Some(Ok(ref bytes)) if bytes.len() == 32));
    }

    #[test]
    fn usage_changed_after_recording_is_rejected() {
        let device = device();
        let queue = device.create_queue();
        let src = device
            .create_buffer(&BufferDescriptor {
                label: Some("src"),
                size: 64,
                allowed_usage: Bu::TRANSFER_SRC | Bu::TRANSFER_DST,
                initial_usage: Bu::TRANSFER_SRC,
            })
            .unwrap();
        let dst = device
            .create_buffer(&BufferDescriptor {
                label: Some("dst"),
                size: 64,
                allowed_usage: Bu::TRANSFER_DST,
                initial_usage: Bu::TRANSFER_DST,
            })
            .unwrap();

        let mut builder = device.create_command_buffer_builder(Some("copy"));
        builder.copy_buffer_to_buffer(&src, 0, &dst, 0, 64).unwrap();
        let cb = builder.finish();
        assert!(cb.is_valid());
        cb.validate_resource_usages_immediate().unwrap();

        src.transition_usage(Bu::TRANSFER_DST).unwrap();
        assert!(matches!(
            cb.validate_resource_usages_immediate(),
            Err(CommandBufferError::UsageChanged(_))
        ));
        assert!(matches!(
            queue.submit(&[&cb]),
            Err(QueueSubmitError::Usage {
                index: 0,
                source: CommandBufferError::UsageChanged(_),
            })
        ));
        assert!(cb.has_commands());
        assert_eq!(device.error_count(), 2);

        // freezing back to the recorded usage makes it submittable again
        src.freeze_usage(Bu::TRANSFER_SRC).unwrap();
        assert_eq!(queue.submit(&[&cb]).unwrap(), 1);
    }

    #[test]
    fn earlier_command_buffers_change_assumed_usages() {
        let device = device();
        let queue = device.create_queue();
        let shared = device
            .create_buffer(&BufferDescriptor {
                label: Some("shared"),
                size: 64,
                allowed_usage: Bu::TRANSFER_SRC | Bu::TRANSFER_DST,
                initial_usage: Bu::TRANSFER_SRC,
            })
            .unwrap();
        let dst = device
            .create_buffer(&BufferDescriptor {
                label: Some("dst"),
                size: 64,
                allowed_usage: Bu::TRANSFER_DST,
                initial_usage: Bu::TRANSFER_DST,
            })
            .unwrap();

        let mut builder = device.create_command_buffer_builder(Some("transition"));
        builder.transition_buffer_usage(&shared, Bu::TRANSFER_DST).unwrap();
        let transition = builder.finish();
        let mut builder = device.create_command_buffer_builder(Some("copy"));
        builder.copy_buffer_to_buffer(&shared, 0, &dst, 0, 16).unwrap();
        let copy = builder.finish();
        assert!(transition.is_valid() && copy.is_valid());

        assert!(matches!(
            queue.submit(&[&transition, &copy]),
            Err(QueueSubmitError::Usage {
                index: 1,
                source: CommandBufferError::UsageChanged(_),
            })
        ));
        assert!(transition.has_commands());
        assert_eq!(shared.current_usage(), Bu::TRANSFER_SRC);

        queue.submit(&[&copy, &transition]).unwrap();
        assert_eq!(shared.current_usage(), Bu::TRANSFER_DST);
    }

    #[test]
    fn attachment_frozen_after_recording_is_rejected() {
        let device = device();
        let queue = device.create_queue();
        let target = device
            .create_texture(&TextureDescriptor {
                label: Some("target"),
                size: wgt::Extent3d {
                    width: 16,
                    height: 16,
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
                label: Some("clear"),
                color_attachments: &[RenderPassColorAttachment {
                    view,
                    load_op: wgt::LoadOp::Clear(wgt::Color::BLACK),
                }],
                depth_stencil_attachment: None,
            })
            .unwrap();

        let mut builder = device.create_command_buffer_builder(Some("clear"));
        builder.begin_render_pass(&pass).unwrap();
        builder.end_render_pass().unwrap();
        let cb = builder.finish();
        assert!(cb.is_valid());

        target.freeze_usage(Tu::SAMPLED).unwrap();
        assert!(matches!(
            queue.submit(&[&cb]),
            Err(QueueSubmitError::Usage {
                index: 0,
                source: CommandBufferError::AttachmentUsage(_),
            })
        ));
        assert_eq!(target.current_usage(), Tu::SAMPLED);
        assert_eq!(queue.active_submission_count(), 0);
    }
}
