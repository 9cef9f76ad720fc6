/*! Resource usage state.

Every buffer and texture carries an allowed usage, chosen at creation,
and a current usage that changes through transitions. A resource may be
in several read-only usages at once, but in at most one usage that writes.

Freezing a resource fixes its usage for the rest of its lifetime: the
allowed and current usages both become the frozen usage, and every later
transition is rejected.
*/

use std::{fmt, ops};

use thiserror::Error;

/// The uses that a resource can be in.
pub trait ResourceUses:
    fmt::Debug + ops::BitAnd<Output = Self> + ops::BitOr<Output = Self> + PartialEq + Sized + Copy
{
    /// All the usages several readers can share.
    const READ_ONLY: Self;

    /// Turn the usage into a pile of bits.
    fn bits(self) -> u32;
}

impl ResourceUses for wgt::BufferUsage {
    const READ_ONLY: Self = Self::READ_ONLY;

    fn bits(self) -> u32 {
        Self::bits(&self)
    }
}

impl ResourceUses for wgt::TextureUsage {
    const READ_ONLY: Self = Self::READ_ONLY;

    fn bits(self) -> u32 {
        Self::bits(&self)
    }
}

fn contains_bits<U: ResourceUses>(set: U, subset: U) -> bool {
    subset.bits() & set.bits() == subset.bits()
}

/// Returns true if `requested` can be the usage of a resource created with `allowed`.
///
/// The requested usage must be allowed, and be either made of read-only
/// usages or of a single usage.
pub fn is_usage_possible<U: ResourceUses>(allowed: U, requested: U) -> bool {
    let read_only = contains_bits(U::READ_ONLY, requested);
    let single_use = wgt::has_zero_or_one_bits(requested.bits());
    contains_bits(allowed, requested) && (read_only || single_use)
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum UsageError<U: ResourceUses> {
    #[error("usage is frozen to {current:?}")]
    Frozen { current: U },
    #[error("usage {requested:?} not allowed, allowed usage is {allowed:?}")]
    NotAllowed { allowed: U, requested: U },
    #[error("usage {requested:?} combines a writable usage with other usages")]
    Conflicting { requested: U },
}

/// Usage state of a buffer or a texture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UsageState<U> {
    allowed: U,
    current: U,
    frozen: bool,
}

impl<U: ResourceUses> UsageState<U> {
    pub fn new(allowed: U, initial: U) -> Result<Self, UsageError<U>> {
        let state = Self {
            allowed,
            current: initial,
            frozen: false,
        };
        state.check_usage(initial)?;
        Ok(state)
    }

    pub fn allowed(&self) -> U {
        self.allowed
    }

    pub fn current(&self) -> U {
        self.current
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns true if the resource is frozen in a usage that contains `usage`.
    pub fn has_frozen_usage(&self, usage: U) -> bool {
        self.frozen && contains_bits(self.allowed, usage)
    }

    fn check_usage(&self, usage: U) -> Result<(), UsageError<U>> {
        if is_usage_possible(self.allowed, usage) {
            Ok(())
        } else if !contains_bits(self.allowed, usage) {
            Err(UsageError::NotAllowed {
                allowed: self.allowed,
                requested: usage,
            })
        } else {
            Err(UsageError::Conflicting { requested: usage })
        }
    }

    pub fn check_transition(&self, usage: U) -> Result<(), UsageError<U>> {
        if self.frozen {
            return Err(UsageError::Frozen {
                current: self.current,
            });
        }
        self.check_usage(usage)
    }

    pub fn is_transition_possible(&self, usage: U) -> bool {
        self.check_transition(usage).is_ok()
    }

    /// Moves to `usage`, returning the previous usage. Nothing changes on failure.
    pub fn transition(&mut self, usage: U) -> Result<U, UsageError<U>> {
        self.check_transition(usage)?;
        let old = self.current;
        self.current = usage;
        Ok(old)
    }

    /// Permanently fixes the usage of the resource to `usage`.
    pub fn freeze(&mut self, usage: U) -> Result<(), UsageError<U>> {
        self.check_transition(usage)?;
        self.allowed = usage;
        self.current = usage;
        self.frozen = true;
        Ok(())
    }

    /// Records a usage change the backend made on its own, such as
    /// render pass attachments. Frozen resources keep their usage.
    pub(crate) fn set_internal(&mut self, usage: U) -> U {
        let old = self.current;
        if !self.frozen {
            debug_assert!(contains_bits(self.allowed, usage));
            self.current = usage;
        }
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgt::{BufferUsage as Bu, TextureUsage as Tu};

    #[test]
    fn usage_possibility() {
        let allowed = Bu::VERTEX | Bu::INDEX | Bu::STORAGE | Bu::TRANSFER_DST;
        assert!(is_usage_possible(allowed, Bu::VERTEX | Bu::INDEX));
        assert!(is_usage_possible(allowed, Bu::STORAGE));
        assert!(is_usage_possible(allowed, Bu::empty()));
        assert!(!is_usage_possible(allowed, Bu::STORAGE | Bu::VERTEX));
        assert!(!is_usage_possible(allowed, Bu::UNIFORM));
        assert!(is_usage_possible(
            Tu::all(),
            Tu::SAMPLED | Tu::TRANSFER_SRC | Tu::PRESENT
        ));
        assert!(!is_usage_possible(
            Tu::all(),
            Tu::SAMPLED | Tu::OUTPUT_ATTACHMENT
        ));
    }

    #[test]
    fn transition_errors() {
        let mut state = UsageState::new(Bu::VERTEX | Bu::STORAGE, Bu::empty()).unwrap();
        assert_eq!(
            state.transition(Bu::UNIFORM),
            Err(UsageError::NotAllowed {
                allowed: Bu::VERTEX | Bu::STORAGE,
                requested: Bu::UNIFORM,
            })
        );
        assert_eq!(
            state.transition(Bu::VERTEX | Bu::STORAGE),
            Err(UsageError::Conflicting {
                requested: Bu::VERTEX | Bu::STORAGE,
            })
        );
        assert_eq!(state.current(), Bu::empty());
        assert_eq!(state.transition(Bu::STORAGE), Ok(Bu::empty()));
        assert_eq!(state.current(), Bu::STORAGE);
        assert!(UsageState::new(Bu::VERTEX, Bu::INDEX).is_err());
    }

    #[test]
    fn frozen_is_monotonic() {
        let mut state = UsageState::new(Bu::all(), Bu::TRANSFER_DST).unwrap();
        state.freeze(Bu::TRANSFER_SRC).unwrap();
        assert!(state.has_frozen_usage(Bu::TRANSFER_SRC));
        assert!(!state.has_frozen_usage(Bu::TRANSFER_DST));

        let frozen = state;
        for bits in 0..=Bu::all().bits() {
            let usage = Bu::from_bits_truncate(bits);
            assert_eq!(
                state.transition(usage),
                Err(UsageError::Frozen {
                    current: Bu::TRANSFER_SRC
                })
            );
            assert!(state.freeze(usage).is_err());
            assert_eq!(state, frozen);
        }
        assert_eq!(state.set_internal(Bu::TRANSFER_SRC), Bu::TRANSFER_SRC);
        assert_eq!(state, frozen);
    }

    #[test]
    fn current_stays_inside_allowed() {
        let allowed = Tu::TRANSFER_SRC | Tu::SAMPLED | Tu::OUTPUT_ATTACHMENT;
        let mut state = UsageState::new(allowed, Tu::SAMPLED).unwrap();
        for bits in 0..=Tu::all().bits() {
            let usage = Tu::from_bits_truncate(bits);
            let _ = state.transition(usage);
            assert!(allowed.contains(state.current()));
        }
        for bits in (0..=Tu::all().bits()).rev() {
            let _ = state.freeze(Tu::from_bits_truncate(bits));
            assert!(state.allowed().contains(state.current()));
        }
        assert!(state.is_frozen());
    }
}
