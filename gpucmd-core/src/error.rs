use core::fmt;
use std::error::Error;

use crate::{command::CommandBufferError, device::QueueSubmitError};

pub trait AsDisplay {
    fn as_display(&self) -> &dyn fmt::Display;
}

impl<T: fmt::Display> AsDisplay for T {
    fn as_display(&self) -> &dyn fmt::Display {
        self
    }
}

pub trait PrettyError: Error {
    fn fmt_pretty(&self) -> String {
        format_error_line(self.as_display())
    }
}

impl PrettyError for CommandBufferError {
    fn fmt_pretty(&self) -> String {
        let mut ret = format_error_line(self);
        match *self {
            Self::FrozenBufferTransition(ref res) | Self::FrozenTextureTransition(ref res) => {
                ret.push_str(&format_note_line(
                    &"the resource was frozen after the command buffer was recorded",
                ));
                ret.push_str(&format_label_line("resource", &res.to_string()));
            }
            Self::MappedBuffer(ref res) => {
                ret.push_str(&format_label_line("buffer", &res.to_string()));
            }
            Self::AttachmentUsage(ref res) => {
                ret.push_str(&format_note_line(
                    &"the attachment was frozen to another usage after recording",
                ));
                ret.push_str(&format_label_line("texture", &res.to_string()));
            }
            _ => {}
        }
        ret
    }
}

impl PrettyError for QueueSubmitError {}

pub fn format_error_line(err: &dyn fmt::Display) -> String {
    format!("    {}\n", err)
}

pub fn format_note_line(note: &dyn fmt::Display) -> String {
    format!("      note: {}\n", note)
}

pub fn format_label_line(label_key: &str, label_value: &str) -> String {
    if label_key.is_empty() || label_value.is_empty() {
        String::new()
    } else {
        format_note_line(&format!("{} = `{}`", label_key, label_value))
    }
}

fn format_one(error: &(dyn Error + 'static)) -> String {
    if let Some(pretty_err) = error.downcast_ref::<CommandBufferError>() {
        return pretty_err.fmt_pretty();
    }
    if let Some(pretty_err) = error.downcast_ref::<QueueSubmitError>() {
        return pretty_err.fmt_pretty();
    }
    // default
    format_error_line(error.as_display())
}

/// Renders `error` followed by every error of its `source()` chain.
pub fn format_pretty_any(error: &(dyn Error + 'static)) -> String {
    let mut ret = format_one(error);
    let mut source = error.source();
    while let Some(inner) = source {
        ret.push_str(&format_one(inner));
        source = inner.source();
    }
    ret
}
