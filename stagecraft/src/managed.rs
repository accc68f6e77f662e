//! Managed resource lifecycle.
//!
//! A [`Managed`] owns one instance of a user resource across an
//! asynchronous setup → started → stopping → stopped lifecycle. Access is
//! gated through [`Managed::borrow`], which hands out reference-counted
//! [`Borrowed`] tokens; teardown never runs while a valid borrow is
//! outstanding. Stopping with borrows in flight defers teardown to the
//! release that drains the count to zero: an at-most-one-winner hand-off,
//! not a cleanup thread.
//!
//! All shared mutable state is atomic: the lifecycle state word, the borrow
//! count, and the pending-stop / teardown-winner flags. No lock is held
//! across a setup or teardown invocation, since either may suspend
//! indefinitely.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{direct, CallerContext};
use crate::outcome::Outcome;
use crate::stage::Stage;

/// Asynchronous resource constructor supplied at creation time.
pub(crate) type SetupFn<T> = Arc<dyn Fn() -> Stage<T> + Send + Sync>;
/// Asynchronous resource destructor supplied at creation time.
pub(crate) type TeardownFn<T> = Arc<dyn Fn(T) -> Stage<()> + Send + Sync>;

const INITIALIZED: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;
const STOPPING: u8 = 3;
const STOPPED: u8 = 4;

/// Observable lifecycle phase of a [`Managed`] resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed; setup has not been invoked.
    Initialized,
    /// Setup is in flight.
    Starting,
    /// The resource is available for borrowing.
    Started,
    /// Stop was requested; waiting for borrows to drain or teardown to end.
    Stopping,
    /// Teardown finished (or the resource never started).
    Stopped,
}

pub(crate) struct ManagedInner<T> {
    state: AtomicU8,
    borrows: AtomicI64,
    stop_requested: AtomicBool,
    teardown_started: AtomicBool,
    value: Mutex<Option<T>>,
    /// Shared setup outcome: every `start()` caller observes this stage.
    ready: Stage<T>,
    /// Completes once teardown has finished; cancelled if start never
    /// completed.
    stopped: Stage<()>,
    setup: SetupFn<T>,
    teardown: TeardownFn<T>,
}

impl<T: Send + 'static> ManagedInner<T> {
    fn release(inner: &Arc<Self>) {
        let previous = inner.borrows.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "borrow count underflow");
        if previous == 1 && inner.state.load(Ordering::SeqCst) == STOPPING {
            Self::run_teardown(inner);
        }
    }

    fn begin_stopping(inner: &Arc<Self>) {
        if inner
            .state
            .compare_exchange(STARTED, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::debug!("managed resource stopping");
            if inner.borrows.load(Ordering::SeqCst) == 0 {
                Self::run_teardown(inner);
            }
        }
    }

    /// Invokes teardown at most once and forwards its outcome to the
    /// `stopped` stage.
    fn run_teardown(inner: &Arc<Self>) {
        if inner.teardown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let value = inner.value.lock().take();
        let Some(value) = value else {
            inner.state.store(STOPPED, Ordering::SeqCst);
            inner.stopped.cancel();
            return;
        };
        let teardown_stage = (inner.teardown)(value);
        let inner = Arc::clone(inner);
        teardown_stage.when_complete(move |outcome| {
            inner.state.store(STOPPED, Ordering::SeqCst);
            match outcome {
                Outcome::Resolved(()) => {
                    tracing::debug!("managed resource stopped");
                    inner.stopped.resolve(());
                }
                Outcome::Failed(cause) => {
                    tracing::debug!(%cause, "managed resource teardown failed");
                    inner.stopped.fail_with(cause);
                }
                Outcome::Cancelled => {
                    inner.stopped.cancel();
                }
            }
        });
    }
}

/// Owner of one resource instance plus its asynchronous lifecycle.
///
/// `Managed` is a cheap handle; clones share the same instance. The
/// resource value is only ever reachable through a valid [`Borrowed`].
///
/// # Example
///
/// ```rust
/// use stagecraft::{Managed, Stage};
/// use std::sync::Arc;
///
/// let managed = Managed::new(
///     || Stage::resolved(Arc::new("connection pool".to_owned())),
///     |_pool| Stage::resolved(()),
/// );
/// managed.start();
/// let mut borrowed = managed.borrow();
/// assert!(borrowed.is_valid());
/// borrowed.release();
/// managed.stop();
/// ```
pub struct Managed<T> {
    inner: Arc<ManagedInner<T>>,
}

impl<T> Clone for Managed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Managed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed")
            .field("state", &self.inner.state.load(Ordering::SeqCst))
            .field("borrows", &self.inner.borrows.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Managed<T> {
    /// Creates a managed resource with the default synchronous context.
    pub fn new(
        setup: impl Fn() -> Stage<T> + Send + Sync + 'static,
        teardown: impl Fn(T) -> Stage<()> + Send + Sync + 'static,
    ) -> Self {
        Self::from_parts(Arc::new(setup), Arc::new(teardown), direct())
    }

    /// Creates a managed resource whose stages use `context`.
    pub fn with_context(
        setup: impl Fn() -> Stage<T> + Send + Sync + 'static,
        teardown: impl Fn(T) -> Stage<()> + Send + Sync + 'static,
        context: Arc<dyn CallerContext>,
    ) -> Self {
        Self::from_parts(Arc::new(setup), Arc::new(teardown), context)
    }

    pub(crate) fn from_parts(
        setup: SetupFn<T>,
        teardown: TeardownFn<T>,
        context: Arc<dyn CallerContext>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagedInner {
                state: AtomicU8::new(INITIALIZED),
                borrows: AtomicI64::new(0),
                stop_requested: AtomicBool::new(false),
                teardown_started: AtomicBool::new(false),
                value: Mutex::new(None),
                ready: Stage::pending_in(Arc::clone(&context)),
                stopped: Stage::pending_in(context),
                setup,
                teardown,
            }),
        }
    }

    /// The current lifecycle phase, for diagnostics.
    pub fn lifecycle(&self) -> LifecycleState {
        match self.inner.state.load(Ordering::SeqCst) {
            INITIALIZED => LifecycleState::Initialized,
            STARTING => LifecycleState::Starting,
            STARTED => LifecycleState::Started,
            STOPPING => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    /// Drives asynchronous setup and transitions to started.
    ///
    /// Idempotent from `Initialized`: the first caller invokes setup, and
    /// every caller, concurrent or late, receives the same shared stage
    /// carrying the setup outcome. On setup failure the resource is never
    /// exposed and the instance goes straight to `Stopped`.
    pub fn start(&self) -> Stage<T> {
        if self
            .inner
            .state
            .compare_exchange(INITIALIZED, STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            (self.inner.setup)().when_complete(move |outcome| match outcome {
                Outcome::Resolved(value) => {
                    *inner.value.lock() = Some(value.clone());
                    inner.state.store(STARTED, Ordering::SeqCst);
                    tracing::debug!("managed resource started");
                    // A stop that raced in during setup parked its request
                    // in the flag; honor it now that the value exists.
                    if inner.stop_requested.load(Ordering::SeqCst) {
                        ManagedInner::begin_stopping(&inner);
                    }
                    inner.ready.resolve(value);
                }
                Outcome::Failed(cause) => {
                    inner.state.store(STOPPED, Ordering::SeqCst);
                    tracing::debug!(%cause, "managed resource setup failed");
                    inner.stopped.cancel();
                    inner.ready.fail_with(cause);
                }
                Outcome::Cancelled => {
                    inner.state.store(STOPPED, Ordering::SeqCst);
                    inner.stopped.cancel();
                    inner.ready.cancel();
                }
            });
        }
        self.inner.ready.clone()
    }

    /// Grants reference-counted access to the resource.
    ///
    /// Returns an invalid token unless the lifecycle is `Started`. The
    /// count is incremented first and the state re-checked afterwards, so a
    /// stop that wins the race is observed and the increment undone.
    pub fn borrow(&self) -> Borrowed<T> {
        if self.inner.state.load(Ordering::SeqCst) != STARTED {
            return Borrowed::invalid();
        }
        self.inner.borrows.fetch_add(1, Ordering::SeqCst);
        if self.inner.state.load(Ordering::SeqCst) != STARTED {
            ManagedInner::release(&self.inner);
            return Borrowed::invalid();
        }
        let value = self.inner.value.lock().clone();
        match value {
            Some(value) => Borrowed::valid(value, Arc::clone(&self.inner)),
            None => {
                // Unreachable in practice: the value is stored before the
                // state becomes STARTED. Degrade structurally regardless.
                ManagedInner::release(&self.inner);
                Borrowed::invalid()
            }
        }
    }

    /// Requests teardown, deferring it until all borrows drain.
    ///
    /// New borrows fail structurally from this point on. The returned stage
    /// completes when teardown has finished; it is cancelled if setup never
    /// completed successfully (there is nothing to tear down).
    pub fn stop(&self) -> Stage<()> {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        loop {
            match self.inner.state.load(Ordering::SeqCst) {
                INITIALIZED => {
                    if self
                        .inner
                        .state
                        .compare_exchange(
                            INITIALIZED,
                            STOPPED,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        self.inner.ready.cancel();
                        self.inner.stopped.cancel();
                        break;
                    }
                    // Lost to a concurrent start; re-evaluate.
                }
                STARTING => {
                    // The setup-completion handler checks the pending-stop
                    // flag after it stores STARTED.
                    break;
                }
                STARTED => {
                    ManagedInner::begin_stopping(&self.inner);
                    break;
                }
                _ => break, // STOPPING | STOPPED
            }
        }
        self.inner.stopped.clone()
    }
}

/// A capability token proving the resource is alive and the holder is
/// counted.
///
/// The underlying value is only readable while the token is valid.
/// `release` is idempotent, and dropping a still-valid token releases it,
/// so every exit path balances the borrow count.
pub struct Borrowed<T: Send + 'static> {
    value: Option<T>,
    owner: Option<Arc<ManagedInner<T>>>,
}

impl<T: Send + 'static> Borrowed<T> {
    /// A token that grants nothing; `release` is a no-op.
    pub const fn invalid() -> Self {
        Self {
            value: None,
            owner: None,
        }
    }

    pub(crate) fn valid(value: T, owner: Arc<ManagedInner<T>>) -> Self {
        Self {
            value: Some(value),
            owner: Some(owner),
        }
    }

    /// Whether this token grants access.
    pub const fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    /// The borrowed resource, while valid.
    pub const fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Returns the borrow and decrements the owner's count.
    ///
    /// Idempotent: repeated calls (or a call followed by drop) decrement
    /// exactly once. The release that drains the count to zero while a stop
    /// is pending runs the deferred teardown.
    pub fn release(&mut self) {
        self.value = None;
        if let Some(owner) = self.owner.take() {
            ManagedInner::release(&owner);
        }
    }
}

impl<T: Send + 'static> Drop for Borrowed<T> {
    fn drop(&mut self) {
        if self.owner.is_some() {
            tracing::trace!("borrow released implicitly on drop");
            self.release();
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Borrowed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Borrowed")
            .field("valid", &self.is_valid())
            .finish()
    }
}
