//! Continuation execution contexts.
//!
//! The completion core never runs user callbacks directly: every listener
//! dispatch goes through a [`CallerContext`], which decides whether the
//! continuation runs synchronously on the completing thread or is handed to
//! an external executor. Either way the context must isolate panics so a
//! misbehaving continuation cannot corrupt stage internals or poison the
//! completion path for other listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::errors::panic_message;

/// A zero-argument continuation scheduled by a stage completion.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Strategy for executing stage continuations.
///
/// Implementations must not let a panic raised by the continuation escape
/// `run`: the completing thread may be deep inside lifecycle bookkeeping
/// when it delivers outcomes, and an escaping panic there would break the
/// exactly-once delivery guarantee for the remaining listeners.
pub trait CallerContext: Send + Sync + 'static {
    /// Executes the continuation, swallowing (and logging) any panic.
    fn run(&self, continuation: Continuation);
}

/// Runs continuations synchronously on the completing thread.
///
/// This is the default context. Panics are caught and logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectContext;

impl CallerContext for DirectContext {
    fn run(&self, continuation: Continuation) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(continuation)) {
            tracing::warn!(
                panic = %panic_message(payload.as_ref()),
                "continuation panicked in caller context"
            );
        }
    }
}

/// Dispatches continuations onto a tokio runtime.
///
/// Useful when completions originate on latency-sensitive threads and the
/// continuation chain should not run inline. Panic isolation comes from the
/// task boundary: a panicking continuation aborts its own task only.
#[derive(Debug, Clone)]
pub struct SpawnContext {
    handle: tokio::runtime::Handle,
}

impl SpawnContext {
    /// Creates a context that spawns onto the given runtime handle.
    pub const fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a context bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, mirroring
    /// [`tokio::runtime::Handle::current`].
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl CallerContext for SpawnContext {
    fn run(&self, continuation: Continuation) {
        drop(self.handle.spawn(async move { continuation() }));
    }
}

/// The default synchronous context, shared by stages created without an
/// explicit one.
pub(crate) fn direct() -> Arc<dyn CallerContext> {
    Arc::new(DirectContext)
}
