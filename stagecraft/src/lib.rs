//! `Stagecraft` - push-based completion stages with a managed-resource
//! lifecycle and hot reload.
//!
//! The crate has two coupled halves. [`Stage`] is a single-assignment
//! asynchronous result cell: it completes exactly once as resolved, failed
//! or cancelled, delivers that outcome to every listener exactly once, and
//! composes through operators (`then_apply`, `then_compose`, recovery and
//! cleanup hooks, [`collect`]). [`Managed`] builds on it to own a resource
//! whose setup and teardown are themselves asynchronous: access is gated
//! through reference-counted [`Borrowed`] tokens, teardown waits for the
//! last borrow to drain, and [`ReloadableManaged`] atomically swaps in a
//! replacement instance without any borrower ever observing a torn-down
//! resource.
//!
//! The core owns no executor: listener execution is delegated to a
//! [`CallerContext`], either inline on the completing thread
//! ([`DirectContext`]) or dispatched onto a tokio runtime
//! ([`SpawnContext`]).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod errors;
pub mod managed;
pub mod outcome;
pub mod reloadable;
pub mod stage;

pub use context::{CallerContext, Continuation, DirectContext, SpawnContext};
pub use errors::{Cause, StageError};
pub use managed::{Borrowed, LifecycleState, Managed};
pub use outcome::Outcome;
pub use reloadable::ReloadableManaged;
pub use stage::{collect, Stage};
