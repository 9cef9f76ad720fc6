/*! Draw structures, shared between the state tracker and the backend replay.
!*/

use thiserror::Error;
use wgt::{BufferAddress, InputStepMode};

/// Error validating a draw or a dispatch.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DrawError {
    #[error("pipeline must be set")]
    MissingPipeline,
    #[error("bind group {index} must be set")]
    MissingBindGroup { index: u32 },
    #[error("current pipeline has a layout which is incompatible with a currently set bind group, first differing at entry index {index}")]
    IncompatibleBindGroup { index: u32 },
    #[error("vertex buffer {slot} must be set")]
    MissingVertexBuffer { slot: u32 },
    #[error("vertex {last_vertex} extends beyond limit {vertex_limit} imposed by the buffer in slot {slot}. Did you bind the correct `Vertex` step-rate vertex buffer?")]
    VertexBeyondLimit {
        last_vertex: u64,
        vertex_limit: u64,
        slot: u32,
    },
    #[error("instance {last_instance} extends beyond limit {instance_limit} imposed by the buffer in slot {slot}. Did you bind the correct `Instance` step-rate vertex buffer?")]
    InstanceBeyondLimit {
        last_instance: u64,
        instance_limit: u64,
        slot: u32,
    },
    #[error("index buffer must be set")]
    MissingIndexBuffer,
    #[error("index {last_index} extends beyond limit {index_limit}. Did you bind the correct index buffer?")]
    IndexBeyondLimit { last_index: u64, index_limit: u64 },
    #[error(
        "pipeline index format ({pipeline:?}) and buffer index format ({buffer:?}) do not match"
    )]
    UnmatchedIndexFormats {
        pipeline: wgt::IndexFormat,
        buffer: wgt::IndexFormat,
    },
}

/// A vertex buffer slot as seen by the vertex limit computation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct VertexBufferInput {
    pub slot: u32,
    /// Bytes of the buffer past the bound offset.
    pub usable_size: BufferAddress,
    pub stride: u32,
    pub step_mode: InputStepMode,
}

/// How many vertices and instances the bound vertex buffers can feed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct VertexLimits {
    pub vertex_limit: u64,
    pub vertex_limit_slot: u32,
    pub instance_limit: u64,
    pub instance_limit_slot: u32,
}

impl Default for VertexLimits {
    fn default() -> Self {
        Self {
            vertex_limit: u64::MAX,
            vertex_limit_slot: 0,
            instance_limit: u64::MAX,
            instance_limit_slot: 0,
        }
    }
}

impl VertexLimits {
    pub(crate) fn new(inputs: impl Iterator<Item = VertexBufferInput>) -> Self {
        let mut limits = Self::default();
        for input in inputs {
            // A zero stride reads the same element over and over.
            if input.stride == 0 {
                continue;
            }
            let limit = input.usable_size / input.stride as u64;
            match input.step_mode {
                InputStepMode::Vertex => {
                    if limit < limits.vertex_limit {
                        limits.vertex_limit = limit;
                        limits.vertex_limit_slot = input.slot;
                    }
                }
                InputStepMode::Instance => {
                    if limit < limits.instance_limit {
                        limits.instance_limit = limit;
                        limits.instance_limit_slot = input.slot;
                    }
                }
            }
        }
        limits
    }

    pub(crate) fn validate_vertex_limit(
        &self,
        first_vertex: u32,
        vertex_count: u32,
    ) -> Result<(), DrawError> {
        let last_vertex = first_vertex as u64 + vertex_count as u64;
        if last_vertex > self.vertex_limit {
            return Err(DrawError::VertexBeyondLimit {
                last_vertex,
                vertex_limit: self.vertex_limit,
                slot: self.vertex_limit_slot,
            });
        }
        Ok(())
    }

    pub(crate) fn validate_instance_limit(
        &self,
        first_instance: u32,
        instance_count: u32,
    ) -> Result<(), DrawError> {
        let last_instance = first_instance as u64 + instance_count as u64;
        if last_instance > self.instance_limit {
            return Err(DrawError::InstanceBeyondLimit {
                last_instance,
                instance_limit: self.instance_limit,
                slot: self.instance_limit_slot,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_follow_the_smallest_buffer() {
        let limits = VertexLimits::new(
            [
                VertexBufferInput {
                    slot: 0,
                    usable_size: 48,
                    stride: 12,
                    step_mode: InputStepMode::Vertex,
                },
                VertexBufferInput {
                    slot: 2,
                    usable_size: 40,
                    stride: 16,
                    step_mode: InputStepMode::Vertex,
                },
                VertexBufferInput {
                    slot: 3,
                    usable_size: 100,
                    stride: 0,
                    step_mode: InputStepMode::Instance,
                },
            ]
            .iter()
            .copied(),
        );
        assert_eq!(limits.vertex_limit, 2);
        assert_eq!(limits.vertex_limit_slot, 2);
        assert_eq!(limits.instance_limit, u64::MAX);
        assert_eq!(limits.validate_vertex_limit(0, 2), Ok(()));
        assert_eq!(
            limits.validate_vertex_limit(1, 2),
            Err(DrawError::VertexBeyondLimit {
                last_vertex: 3,
                vertex_limit: 2,
                slot: 2,
            })
        );
        assert_eq!(limits.validate_instance_limit(u32::MAX, u32::MAX), Ok(()));
    }
}
