//! Terminal outcomes of a stage.
//!
//! A stage finishes in exactly one of three states: resolved with a value,
//! failed with a cause, or cancelled. There is no fourth "pending" variant;
//! pending is simply the absence of completion, and callers never observe it
//! through a listener.

use crate::errors::Cause;

/// The terminal state of a [`crate::Stage`].
///
/// `Cancelled` carries no cause: it is the structural signal that the
/// computation will never produce a value, typically because its governing
/// resource is absent or stopping. It propagates through composition chains
/// untouched and is only intercepted by
/// [`crate::Stage::then_compose_cancelled`].
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The computation produced a value.
    Resolved(T),
    /// The computation failed with the given cause.
    Failed(Cause),
    /// The computation will never produce a value.
    Cancelled,
}

impl<T> Outcome<T> {
    /// Returns `true` for `Resolved`.
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Returns `true` for `Failed`.
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns `true` for `Cancelled`.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Extracts the resolved value, discarding failure information.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Resolved(value) => Some(value),
            Self::Failed(_) | Self::Cancelled => None,
        }
    }

    /// Returns the failure cause, if any.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Failed(cause) => Some(cause),
            Self::Resolved(_) | Self::Cancelled => None,
        }
    }

    /// Maps the resolved value, leaving failure and cancellation untouched.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Resolved(value) => Outcome::Resolved(f(value)),
            Self::Failed(cause) => Outcome::Failed(cause),
            Self::Cancelled => Outcome::Cancelled,
        }
    }
}
