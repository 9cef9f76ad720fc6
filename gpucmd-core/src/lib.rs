/*! This library records, validates and tracks the state of GPU command buffers
 *  on top of `gpucmd-hal`. Commands are encoded into a compact tagged stream,
 *  replayed once through a state tracker for validation, and replayed again
 *  into a backend encoder at submission.
 */

#![allow(
    // It is much clearer to assert negative conditions with eq! false
    clippy::bool_assert_comparison,
    // We use loops for getting early-out of scope without closures.
    clippy::never_loop,
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
    // Redundant matching is more explicit.
    clippy::redundant_pattern_matching,
    // Explicit lifetimes are often easier to reason about.
    clippy::needless_lifetimes,
    // No need for defaults in the internal types.
    clippy::new_without_default,
    // Need many arguments for some core functions to be able to re-use code in many situations.
    clippy::too_many_arguments,
    // Clashes with clippy::pattern_type_mismatch
    clippy::needless_borrowed_reference,
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unsafe_op_in_unsafe_fn,
    unused_extern_crates,
    unused_qualifications,
    // We don't match on a reference, unless required.
    clippy::pattern_type_mismatch,
)]

macro_rules! resource_log {
    ($($arg:tt)+) => (log::trace!($($arg)+))
}

macro_rules! api_log {
    ($($arg:tt)+) => (log::trace!($($arg)+))
}

pub mod binding_model;
pub mod command;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod resource;
pub mod track;
pub mod validation;

pub use hal::{MAX_BIND_GROUPS, MAX_COLOR_ATTACHMENTS, MAX_VERTEX_INPUTS};

/// The index of a queue submission.
///
/// These are the values the backend fence is signaled with.
pub type SubmissionIndex = hal::FenceValue;

pub type Label<'a> = Option<&'a str>;

type FastHashMap<K, V> = std::collections::HashMap<K, V, fxhash::FxBuildHasher>;
type FastHashSet<K> = std::collections::HashSet<K, fxhash::FxBuildHasher>;

trait LabelHelpers<'a> {
    fn to_owned_label(&'a self) -> String;
}

impl<'a> LabelHelpers<'a> for Label<'a> {
    fn to_owned_label(&'a self) -> String {
        self.unwrap_or_default().to_string()
    }
}

/// Returns `offset + size` if the range fits inside `total`, without wrapping.
pub(crate) fn checked_range_end(
    offset: wgt::BufferAddress,
    size: wgt::BufferAddress,
    total: wgt::BufferAddress,
) -> Option<wgt::BufferAddress> {
    match offset.checked_add(size) {
        Some(end) if end <= total => Some(end),
        _ => None,
    }
}

#[test]
fn range_end_does_not_wrap() {
    assert_eq!(checked_range_end(4, 12, 16), Some(16));
    assert_eq!(checked_range_end(4, 13, 16), None);
    assert_eq!(checked_range_end(u64::MAX - 1, 10, u64::MAX), None);
    assert_eq!(checked_range_end(u32::MAX as u64 - 1, 10, 1 << 20), None);
}
