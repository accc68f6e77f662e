//! The completion stage state machine.
//!
//! A [`Stage`] is a single-assignment asynchronous result cell: it completes
//! exactly once in one of three terminal states (resolved, failed,
//! cancelled) and delivers that outcome to every registered listener exactly
//! once. Stages never block a thread (absence of completion simply means
//! listeners have not fired yet) and own no executor: every listener
//! dispatch is delegated to the stage's [`CallerContext`].
//!
//! # Completion semantics
//!
//! - The pending→done transition is linearizable; concurrent completion
//!   attempts have exactly one winner (`resolve`/`fail`/`cancel` report it).
//! - Listeners registered before completion fire in registration order.
//! - Listeners registered after completion fire immediately through the
//!   same context, with no ordering guarantee relative to listeners being
//!   registered concurrently on other threads.
//! - A panicking user transform is caught by the operator and converted
//!   into a failed outcome; it never escapes the operator call.
//!
//! # Example
//!
//! ```rust
//! use stagecraft::Stage;
//!
//! let stage = Stage::pending();
//! let doubled = stage.then_apply(|n: u32| n * 2);
//! stage.resolve(21);
//! assert_eq!(doubled.try_outcome().and_then(|o| o.into_value()), Some(42));
//! ```

use std::fmt;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{direct, CallerContext};
use crate::errors::{panic_message, Cause, StageError};
use crate::outcome::Outcome;

type Listener<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

/// Cell state: either waiting with an ordered listener list, or done.
///
/// Completion swaps the listener container for the terminal outcome under a
/// short lock, so a thread registering concurrently with completion either
/// lands in the list (and is drained by the completer) or observes `Done`
/// and runs its listener itself. No listener is ever appended to a
/// container nobody will drain.
enum Cell<T> {
    Pending(Vec<Listener<T>>),
    Done(Outcome<T>),
}

struct StageInner<T> {
    cell: Mutex<Cell<T>>,
    context: Arc<dyn CallerContext>,
}

/// A single-assignment asynchronous result cell with composition operators.
///
/// `Stage` is a cheap handle (`Arc` inner); clones observe the same cell.
/// Values must be cheaply cloneable (`Arc` your resources) because one
/// outcome is delivered to arbitrarily many listeners.
pub struct Stage<T> {
    inner: Arc<StageInner<T>>,
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.cell.lock() {
            Cell::Pending(listeners) => format!("pending({} listeners)", listeners.len()),
            Cell::Done(Outcome::Resolved(_)) => "resolved".to_owned(),
            Cell::Done(Outcome::Failed(_)) => "failed".to_owned(),
            Cell::Done(Outcome::Cancelled) => "cancelled".to_owned(),
        };
        f.debug_tuple("Stage").field(&state).finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Stage<T> {
    /// Creates a pending stage using the default synchronous context.
    pub fn pending() -> Self {
        Self::pending_in(direct())
    }

    /// Creates a pending stage whose listeners run through `context`.
    ///
    /// Stages derived through composition operators inherit this context.
    pub fn pending_in(context: Arc<dyn CallerContext>) -> Self {
        Self {
            inner: Arc::new(StageInner {
                cell: Mutex::new(Cell::Pending(Vec::new())),
                context,
            }),
        }
    }

    /// An immediately resolved stage.
    pub fn resolved(value: T) -> Self {
        let stage = Self::pending();
        stage.resolve(value);
        stage
    }

    /// An immediately failed stage.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let stage = Self::pending();
        stage.fail(error);
        stage
    }

    /// An immediately failed stage carrying an existing cause.
    pub fn failed_with(cause: Cause) -> Self {
        let stage = Self::pending();
        stage.fail_with(cause);
        stage
    }

    /// An immediately cancelled stage.
    ///
    /// Returned whenever an operation cannot proceed because its governing
    /// resource is absent or stopping; a structural signal, not an error.
    pub fn cancelled() -> Self {
        Self::cancelled_in(direct())
    }

    /// An immediately cancelled stage bound to `context`.
    pub fn cancelled_in(context: Arc<dyn CallerContext>) -> Self {
        let stage = Self::pending_in(context);
        stage.cancel();
        stage
    }

    /// Completes the stage with `outcome`.
    ///
    /// Returns `true` if this call won the completion race. Exactly one
    /// completion attempt per stage ever returns `true`; the outcome set by
    /// the winner never changes afterwards.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        let listeners = {
            let mut cell = self.inner.cell.lock();
            match &mut *cell {
                Cell::Done(_) => return false,
                Cell::Pending(listeners) => {
                    let drained = mem::take(listeners);
                    *cell = Cell::Done(outcome.clone());
                    drained
                }
            }
        };
        for listener in listeners {
            let delivered = outcome.clone();
            self.inner
                .context
                .run(Box::new(move || listener(delivered)));
        }
        true
    }

    /// Completes the stage with a value.
    pub fn resolve(&self, value: T) -> bool {
        self.complete(Outcome::Resolved(value))
    }

    /// Completes the stage with a failure.
    pub fn fail<E>(&self, error: E) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.complete(Outcome::Failed(Arc::new(error)))
    }

    /// Completes the stage with an existing failure cause.
    pub fn fail_with(&self, cause: Cause) -> bool {
        self.complete(Outcome::Failed(cause))
    }

    /// Completes the stage as cancelled.
    pub fn cancel(&self) -> bool {
        self.complete(Outcome::Cancelled)
    }

    /// Whether a terminal outcome has been set.
    pub fn is_complete(&self) -> bool {
        matches!(&*self.inner.cell.lock(), Cell::Done(_))
    }

    /// Returns a clone of the terminal outcome, if one has been set.
    pub fn try_outcome(&self) -> Option<Outcome<T>> {
        match &*self.inner.cell.lock() {
            Cell::Done(outcome) => Some(outcome.clone()),
            Cell::Pending(_) => None,
        }
    }

    /// Awaits the terminal outcome.
    ///
    /// Bridges the push-based cell into async code through a oneshot
    /// channel. If every handle to a still-pending stage is dropped the
    /// outcome degrades to `Cancelled`.
    pub async fn wait(&self) -> Outcome<T> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.when_complete(move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(Outcome::Cancelled)
    }

    /// The execution context listeners of this stage run through.
    pub(crate) fn context(&self) -> Arc<dyn CallerContext> {
        Arc::clone(&self.inner.context)
    }

    /// Registers a listener for the terminal outcome.
    ///
    /// Fires exactly once: either when completion drains the listener list,
    /// or immediately (through the context) if the stage is already done.
    pub(crate) fn when_complete(&self, listener: impl FnOnce(Outcome<T>) + Send + 'static) {
        let already_done = {
            let mut cell = self.inner.cell.lock();
            match &mut *cell {
                Cell::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    None
                }
                Cell::Done(outcome) => Some((Box::new(listener) as Listener<T>, outcome.clone())),
            }
        };
        if let Some((listener, outcome)) = already_done {
            self.inner
                .context
                .run(Box::new(move || listener(outcome)));
        }
    }

    /// Maps the resolved value; failure and cancellation pass through.
    ///
    /// A panic inside `f` fails the returned stage with
    /// [`StageError::Panicked`].
    pub fn then_apply<U, F>(&self, f: F) -> Stage<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let next = Stage::pending_in(self.context());
        let target = next.clone();
        self.when_complete(move |outcome| match outcome {
            Outcome::Resolved(value) => match catch_unwind(AssertUnwindSafe(move || f(value))) {
                Ok(mapped) => {
                    target.resolve(mapped);
                }
                Err(payload) => {
                    target.fail(StageError::from_panic(payload.as_ref()));
                }
            },
            Outcome::Failed(cause) => {
                target.fail_with(cause);
            }
            Outcome::Cancelled => {
                target.cancel();
            }
        });
        next
    }

    /// Chains a stage-returning continuation, flattening the result.
    ///
    /// The inner stage's own outcome (including failure or cancellation) is
    /// forwarded to the returned stage.
    pub fn then_compose<U, F>(&self, f: F) -> Stage<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Stage<U> + Send + 'static,
    {
        let next = Stage::pending_in(self.context());
        let target = next.clone();
        self.when_complete(move |outcome| match outcome {
            Outcome::Resolved(value) => match catch_unwind(AssertUnwindSafe(move || f(value))) {
                Ok(inner) => inner.when_complete(move |forwarded| {
                    target.complete(forwarded);
                }),
                Err(payload) => {
                    target.fail(StageError::from_panic(payload.as_ref()));
                }
            },
            Outcome::Failed(cause) => {
                target.fail_with(cause);
            }
            Outcome::Cancelled => {
                target.cancel();
            }
        });
        next
    }

    /// Recovers from failure with a value; success and cancellation pass
    /// through unchanged.
    pub fn then_apply_failed<F>(&self, f: F) -> Self
    where
        F: FnOnce(Cause) -> T + Send + 'static,
    {
        let next = Self::pending_in(self.context());
        let target = next.clone();
        self.when_complete(move |outcome| match outcome {
            Outcome::Failed(cause) => match catch_unwind(AssertUnwindSafe(move || f(cause))) {
                Ok(recovered) => {
                    target.resolve(recovered);
                }
                Err(payload) => {
                    target.fail(StageError::from_panic(payload.as_ref()));
                }
            },
            passthrough => {
                target.complete(passthrough);
            }
        });
        next
    }

    /// Recovers from failure with another stage; success and cancellation
    /// pass through unchanged.
    pub fn then_compose_failed<F>(&self, f: F) -> Self
    where
        F: FnOnce(Cause) -> Self + Send + 'static,
    {
        let next = Self::pending_in(self.context());
        let target = next.clone();
        self.when_complete(move |outcome| match outcome {
            Outcome::Failed(cause) => match catch_unwind(AssertUnwindSafe(move || f(cause))) {
                Ok(inner) => inner.when_complete(move |forwarded| {
                    target.complete(forwarded);
                }),
                Err(payload) => {
                    target.fail(StageError::from_panic(payload.as_ref()));
                }
            },
            passthrough => {
                target.complete(passthrough);
            }
        });
        next
    }

    /// Recovers from cancellation with another stage; success and failure
    /// pass through unchanged.
    pub fn then_compose_cancelled<F>(&self, f: F) -> Self
    where
        F: FnOnce() -> Self + Send + 'static,
    {
        let next = Self::pending_in(self.context());
        let target = next.clone();
        self.when_complete(move |outcome| match outcome {
            Outcome::Cancelled => match catch_unwind(AssertUnwindSafe(f)) {
                Ok(inner) => inner.when_complete(move |forwarded| {
                    target.complete(forwarded);
                }),
                Err(payload) => {
                    target.fail(StageError::from_panic(payload.as_ref()));
                }
            },
            passthrough => {
                target.complete(passthrough);
            }
        });
        next
    }

    /// Runs `action` on any terminal outcome without altering it.
    ///
    /// The primary cleanup hook: release a borrow or close a handle
    /// regardless of how the chain ended. A panicking action is
    /// isolated and the outcome still forwarded.
    pub fn when_finished<F>(&self, action: F) -> Self
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let next = Self::pending_in(self.context());
        let target = next.clone();
        self.when_complete(move |outcome| {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| action(&outcome))) {
                tracing::warn!(
                    panic = %panic_message(payload.as_ref()),
                    "when_finished action panicked"
                );
            }
            target.complete(outcome);
        });
        next
    }
}

/// Resolves once every input stage resolves, preserving input order.
///
/// The first failing or cancelled input completes the result immediately
/// with that outcome; the remaining inputs keep running independently but
/// can no longer affect the result. An empty input resolves to an empty
/// vector.
pub fn collect<T, I>(stages: I) -> Stage<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Stage<T>>,
{
    let stages: Vec<Stage<T>> = stages.into_iter().collect();
    let context = stages.first().map_or_else(direct, Stage::context);
    let result = Stage::pending_in(context);
    if stages.is_empty() {
        result.resolve(Vec::new());
        return result;
    }

    let remaining = Arc::new(AtomicUsize::new(stages.len()));
    let slots: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; stages.len()]));

    for (index, stage) in stages.iter().enumerate() {
        let remaining = Arc::clone(&remaining);
        let slots = Arc::clone(&slots);
        let result = result.clone();
        stage.when_complete(move |outcome| match outcome {
            Outcome::Resolved(value) => {
                slots.lock()[index] = Some(value);
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    let values: Option<Vec<T>> =
                        slots.lock().iter_mut().map(Option::take).collect();
                    if let Some(values) = values {
                        result.resolve(values);
                    }
                }
            }
            Outcome::Failed(cause) => {
                result.fail_with(cause);
            }
            Outcome::Cancelled => {
                result.cancel();
            }
        });
    }
    result
}
