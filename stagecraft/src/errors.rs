//! Error types for stagecraft.
//!
//! Failure causes travel inside a [`crate::Outcome::Failed`] variant rather
//! than as raised errors: a stage that cannot produce a value completes with
//! a cause, and composition operators match on the outcome tag instead of
//! unwinding. Because a single outcome may be delivered to many listeners,
//! the cause is reference-counted and cloneable.

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

/// A shared, cloneable failure cause carried by a failed stage.
///
/// Any error type can become a cause; operators that recover from failure
/// receive the cause as-is and may downcast to inspect it.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the stage machinery itself.
///
/// User-supplied closures fail by returning a failed [`crate::Stage`] or by
/// panicking; a panic inside a transform is caught by the operator and
/// converted into a `Panicked` cause so it can never escape the operator
/// call or corrupt the completion state machine.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// A user-supplied transform or continuation panicked.
    #[error("continuation panicked: {0}")]
    Panicked(String),
}

impl StageError {
    /// Builds a `Panicked` error from a caught panic payload.
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked(panic_message(payload))
    }
}

/// Extracts a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload.downcast_ref::<&'static str>().map_or_else(
        || {
            payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "non-string panic payload".to_owned())
        },
        |message| (*message).to_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_extracts_str_and_string() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new("owned".to_owned());
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(17_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn from_panic_wraps_message() {
        let payload: Box<dyn Any + Send> = Box::new("kaboom");
        let error = StageError::from_panic(payload.as_ref());
        assert_eq!(error.to_string(), "continuation panicked: kaboom");
    }
}
