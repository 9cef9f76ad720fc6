use crate::{
    binding_model::PipelineLayout,
    pipeline::{InputState, PushConstantInfo, ShaderModule},
};

use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum BindingError {
    #[error("binding is missing from the pipeline layout")]
    Missing,
    #[error("visibility flags don't include the shader stage")]
    Invisible,
    #[error("type {shader:?} on the shader side does not match the pipeline binding {layout:?}")]
    WrongType {
        shader: wgt::BindingType,
        layout: wgt::BindingType,
    },
}

#[derive(Clone, Debug, Error)]
pub enum InputError {
    #[error("input is not provided by any vertex attribute of the input state")]
    Missing,
}

/// Errors produced when validating a programmable stage of a pipeline.
#[derive(Clone, Debug, Error)]
pub enum StageError {
    #[error("shader module is a {actual:?} module, expected {expected:?}")]
    WrongStage {
        expected: wgt::ShaderStage,
        actual: wgt::ShaderStage,
    },
    #[error("unable to find an entry point named {0:?}")]
    MissingEntryPoint(String),
    #[error("error matching global binding at index {binding} in set {set} against the pipeline layout: {error}")]
    Binding {
        set: u32,
        binding: u32,
        #[source]
        error: BindingError,
    },
    #[error("error matching the vertex input at {location}: {error}")]
    Input {
        location: wgt::ShaderLocation,
        #[source]
        error: InputError,
    },
}

/// Checks that `module` can run as `stage` with `entry_point` against `layout`.
pub fn check_stage<A: hal::Api>(
    module: &ShaderModule<A>,
    layout: &PipelineLayout<A>,
    entry_point: &str,
    stage: wgt::ShaderStage,
) -> Result<(), StageError> {
    if module.stage != stage {
        return Err(StageError::WrongStage {
            expected: stage,
            actual: module.stage,
        });
    }
    if module.reflection.entry_point != entry_point {
        return Err(StageError::MissingEntryPoint(entry_point.to_string()));
    }

    for reflected in module.reflection.bindings.iter() {
        let entry = layout
            .bind_group_layout(reflected.group as usize)
            .and_then(|bgl| bgl.entry(reflected.binding));
        let error = match entry {
            None => Some(BindingError::Missing),
            Some(entry) if !entry.visibility.contains(stage) => Some(BindingError::Invisible),
            Some(entry) if entry.ty != reflected.ty => Some(BindingError::WrongType {
                shader: reflected.ty,
                layout: entry.ty,
            }),
            Some(_) => None,
        };
        if let Some(error) = error {
            return Err(StageError::Binding {
                set: reflected.group,
                binding: reflected.binding,
                error,
            });
        }
    }
    Ok(())
}

/// Checks that every location read by the vertex stage is fed by an attribute.
pub fn check_vertex_inputs(used_locations: u32, input_state: &InputState) -> Result<(), StageError> {
    let missing = used_locations & !input_state.attributes_mask;
    if missing != 0 {
        return Err(StageError::Input {
            location: missing.trailing_zeros(),
            error: InputError::Missing,
        });
    }
    Ok(())
}

/// Returns the first push constant slot both stages use with a different type.
pub fn find_push_constant_clash(a: &PushConstantInfo, b: &PushConstantInfo) -> Option<u32> {
    let mut shared = a.mask & b.mask;
    while shared != 0 {
        let slot = shared.trailing_zeros();
        if a.types[slot as usize] != b.types[slot as usize] {
            return Some(slot);
        }
        shared &= shared - 1;
    }
    None
}

#[test]
fn push_constant_clash() {
    use wgt::PushConstantType as Pct;

    let mut vertex = PushConstantInfo::default();
    let mut fragment = PushConstantInfo::default();
    vertex.set(0, Pct::Float);
    vertex.set(3, Pct::Int);
    fragment.set(1, Pct::UInt);
    fragment.set(3, Pct::Int);
    assert_eq!(find_push_constant_clash(&vertex, &fragment), None);
    fragment.set(3, Pct::Float);
    assert_eq!(find_push_constant_clash(&vertex, &fragment), Some(3));
}
