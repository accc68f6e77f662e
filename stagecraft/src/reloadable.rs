//! Hot-reloadable managed resources.
//!
//! A [`ReloadableManaged`] holds the currently-active [`Managed`] instance
//! behind a lock-free, atomically-swappable pointer and forwards borrow,
//! start and stop calls to it. [`ReloadableManaged::reload`] constructs a
//! brand-new instance from the stored setup/teardown closures and publishes
//! it with a compare-and-swap against the outgoing instance, in one of two
//! orderings: stop-then-start (publish immediately, then cycle the
//! instances) or start-first (bring the replacement fully up before it can
//! become current).
//!
//! The pointer is the only coordination primitive: no mutex guards the
//! swap, because the operations on either side of it (start, stop) are
//! themselves asynchronous and must never run under a lock.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::context::{direct, CallerContext};
use crate::managed::{Borrowed, Managed, SetupFn, TeardownFn};
use crate::outcome::Outcome;
use crate::stage::Stage;

struct ReloadableInner<T> {
    current: ArcSwapOption<Managed<T>>,
    setup: SetupFn<T>,
    teardown: TeardownFn<T>,
    context: Arc<dyn CallerContext>,
}

/// Holder of the currently-active [`Managed`] instance, with hot reload.
///
/// At most one instance is current at any instant. Once [`stop`] has taken
/// the slot, absence means "no managed": borrows are invalid and lifecycle
/// operations report cancelled.
///
/// [`stop`]: ReloadableManaged::stop
pub struct ReloadableManaged<T> {
    inner: Arc<ReloadableInner<T>>,
}

impl<T> Clone for ReloadableManaged<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ReloadableManaged<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadableManaged")
            .field("has_current", &self.inner.current.load().is_some())
            .finish()
    }
}

fn option_ptr_eq<T>(left: &Option<Arc<T>>, right: &Option<Arc<T>>) -> bool {
    match (left, right) {
        (Some(left), Some(right)) => Arc::ptr_eq(left, right),
        (None, None) => true,
        _ => false,
    }
}

impl<T: Clone + Send + Sync + 'static> ReloadableManaged<T> {
    /// Creates a holder with an initial (not yet started) instance, using
    /// the default synchronous context.
    pub fn new(
        setup: impl Fn() -> Stage<T> + Send + Sync + 'static,
        teardown: impl Fn(T) -> Stage<()> + Send + Sync + 'static,
    ) -> Self {
        Self::with_context(setup, teardown, direct())
    }

    /// Creates a holder whose instances use `context`.
    pub fn with_context(
        setup: impl Fn() -> Stage<T> + Send + Sync + 'static,
        teardown: impl Fn(T) -> Stage<()> + Send + Sync + 'static,
        context: Arc<dyn CallerContext>,
    ) -> Self {
        let setup: SetupFn<T> = Arc::new(setup);
        let teardown: TeardownFn<T> = Arc::new(teardown);
        let initial = Managed::from_parts(
            Arc::clone(&setup),
            Arc::clone(&teardown),
            Arc::clone(&context),
        );
        Self {
            inner: Arc::new(ReloadableInner {
                current: ArcSwapOption::from(Some(Arc::new(initial))),
                setup,
                teardown,
                context,
            }),
        }
    }

    /// Starts the current instance; cancelled if the holder was stopped.
    pub fn start(&self) -> Stage<T> {
        self.inner.current.load_full().map_or_else(
            || Stage::cancelled_in(Arc::clone(&self.inner.context)),
            |current| current.start(),
        )
    }

    /// Borrows from the current instance.
    ///
    /// If the delegate's borrow fails because it is mid-stop, the loop
    /// retries against a freshly-read current pointer, but only if the
    /// pointer actually changed since the last attempt. A permanently
    /// stopping instance that has not been swapped out yields an invalid
    /// token rather than a spin.
    pub fn borrow(&self) -> Borrowed<T> {
        let mut last_attempt: Option<Arc<Managed<T>>> = None;
        loop {
            let Some(current) = self.inner.current.load_full() else {
                return Borrowed::invalid();
            };
            if let Some(previous) = &last_attempt {
                if Arc::ptr_eq(previous, &current) {
                    return Borrowed::invalid();
                }
            }
            let borrowed = current.borrow();
            if borrowed.is_valid() {
                return borrowed;
            }
            last_attempt = Some(current);
        }
    }

    /// Replaces the current instance with a freshly constructed one.
    ///
    /// With `start_first = false` (stop-then-start) the replacement is
    /// published immediately (consumers may observe a window where the
    /// current instance is still starting), then the outgoing instance is
    /// stopped and, once its stop reaches a terminal outcome, the
    /// replacement is started. The returned stage carries the replacement's
    /// start outcome.
    ///
    /// With `start_first = true` the replacement is started fully before it
    /// may become current. If the publish compare-and-swap loses (the slot
    /// was cleared by [`stop`](Self::stop) or taken by a competing reload),
    /// the already-started replacement is stopped immediately rather than
    /// leaked, and the returned stage is cancelled. The reload whose swap
    /// publishes last wins.
    ///
    /// In both orderings the outgoing instance is pinned with a borrow for
    /// the duration of the hand-off and stopped exactly once.
    pub fn reload(&self, start_first: bool) -> Stage<()> {
        let fresh = Managed::from_parts(
            Arc::clone(&self.inner.setup),
            Arc::clone(&self.inner.teardown),
            Arc::clone(&self.inner.context),
        );
        let fresh_arc = Arc::new(fresh.clone());
        let mut last_attempt: Option<Arc<Managed<T>>> = None;
        loop {
            let Some(old) = self.inner.current.load_full() else {
                return Stage::cancelled_in(Arc::clone(&self.inner.context));
            };
            if let Some(previous) = &last_attempt {
                if Arc::ptr_eq(previous, &old) {
                    return Stage::cancelled_in(Arc::clone(&self.inner.context));
                }
            }
            // Pin the outgoing instance so a concurrent stop cannot finish
            // tearing it down while the hand-off is in flight.
            let mut pin = old.borrow();
            if !pin.is_valid() {
                last_attempt = Some(old);
                continue;
            }

            if start_first {
                return self.publish_after_start(old, fresh, Arc::clone(&fresh_arc), pin);
            }

            let expected = Some(Arc::clone(&old));
            let previous = self
                .inner
                .current
                .compare_and_swap(&expected, Some(Arc::clone(&fresh_arc)));
            if !option_ptr_eq(&previous, &expected) {
                pin.release();
                last_attempt = Some(old);
                continue;
            }
            pin.release();
            return stop_then_start(&old, fresh, Arc::clone(&self.inner.context));
        }
    }

    /// Start-first ordering: the replacement becomes current only after a
    /// successful start, and is unwound if the publish race is lost.
    fn publish_after_start(
        &self,
        old: Arc<Managed<T>>,
        fresh: Managed<T>,
        fresh_arc: Arc<Managed<T>>,
        pin: Borrowed<T>,
    ) -> Stage<()> {
        let result = Stage::pending_in(Arc::clone(&self.inner.context));
        let target = result.clone();
        let inner = Arc::clone(&self.inner);
        let start_stage = fresh.start();
        start_stage.when_complete(move |started| {
            let mut pin = pin;
            match started {
                Outcome::Resolved(_) => {
                    let expected = Some(Arc::clone(&old));
                    let previous = inner.current.compare_and_swap(&expected, Some(fresh_arc));
                    pin.release();
                    if option_ptr_eq(&previous, &expected) {
                        old.stop().when_complete(move |outcome| match outcome {
                            Outcome::Resolved(()) => {
                                target.resolve(());
                            }
                            Outcome::Failed(cause) => {
                                target.fail_with(cause);
                            }
                            Outcome::Cancelled => {
                                target.cancel();
                            }
                        });
                    } else {
                        // Lost the publish race to a top-level stop or a
                        // competing reload: the started instance must not
                        // leak.
                        tracing::debug!("reload lost publish race; stopping unpublished instance");
                        fresh.stop().when_complete(move |_| {
                            target.cancel();
                        });
                    }
                }
                Outcome::Failed(cause) => {
                    pin.release();
                    target.fail_with(cause);
                }
                Outcome::Cancelled => {
                    pin.release();
                    target.cancel();
                }
            }
        });
        result
    }

    /// Takes the current instance and stops it; the slot stays empty.
    ///
    /// A single atomic exchange picks the winner; every later caller (and
    /// every borrow or reload racing the exchange) observes "no managed"
    /// and degrades to cancelled/invalid semantics.
    pub fn stop(&self) -> Stage<()> {
        self.inner.current.swap(None).map_or_else(
            || Stage::cancelled_in(Arc::clone(&self.inner.context)),
            |taken| taken.stop(),
        )
    }
}

/// Stop-then-start ordering: the swap has already happened; cycle the
/// instances and surface the replacement's start outcome.
fn stop_then_start<T: Clone + Send + Sync + 'static>(
    old: &Managed<T>,
    fresh: Managed<T>,
    context: Arc<dyn CallerContext>,
) -> Stage<()> {
    let result = Stage::pending_in(context);
    let target = result.clone();
    old.stop().when_complete(move |outcome| {
        if let Outcome::Failed(cause) = &outcome {
            // The replacement is already current; a teardown failure on the
            // outgoing instance is observable on its own stop stage.
            tracing::warn!(%cause, "outgoing instance teardown failed during reload");
        }
        fresh.start().when_complete(move |started| match started {
            Outcome::Resolved(_) => {
                target.resolve(());
            }
            Outcome::Failed(cause) => {
                target.fail_with(cause);
            }
            Outcome::Cancelled => {
                target.cancel();
            }
        });
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A reloadable counter resource: setup yields a fresh generation
    /// number, teardown records it.
    fn generational() -> (ReloadableManaged<u32>, Arc<AtomicUsize>, Arc<Mutex<Vec<u32>>>) {
        let generation = Arc::new(AtomicUsize::new(0));
        let stopped_generations = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::clone(&generation);
        let log = Arc::clone(&stopped_generations);
        let reloadable = ReloadableManaged::new(
            move || {
                let n = u32::try_from(counter.fetch_add(1, Ordering::SeqCst)).unwrap_or(u32::MAX);
                Stage::resolved(n)
            },
            move |n| {
                log.lock().push(n);
                Stage::resolved(())
            },
        );
        (reloadable, generation, stopped_generations)
    }

    #[test]
    fn borrow_forwards_to_current() {
        let (reloadable, _, _) = generational();
        assert!(!reloadable.borrow().is_valid());
        reloadable.start();
        assert_eq!(reloadable.borrow().value(), Some(&0));
    }

    #[test]
    fn stop_empties_the_slot() {
        let (reloadable, _, stopped) = generational();
        reloadable.start();
        let first = reloadable.stop();
        assert!(first.try_outcome().is_some_and(|o| o.is_resolved()));
        assert_eq!(*stopped.lock(), vec![0]);

        // Absence degrades every operation.
        assert!(!reloadable.borrow().is_valid());
        assert!(reloadable
            .stop()
            .try_outcome()
            .is_some_and(|o| o.is_cancelled()));
        assert!(reloadable
            .start()
            .try_outcome()
            .is_some_and(|o| o.is_cancelled()));
        assert!(reloadable
            .reload(false)
            .try_outcome()
            .is_some_and(|o| o.is_cancelled()));
    }

    #[test]
    fn reload_stop_then_start_cycles_generations() {
        let (reloadable, _, stopped) = generational();
        reloadable.start();
        assert_eq!(reloadable.borrow().value(), Some(&0));

        let reloaded = reloadable.reload(false);
        assert!(reloaded.try_outcome().is_some_and(|o| o.is_resolved()));

        // Old generation stopped exactly once, new one is current.
        assert_eq!(*stopped.lock(), vec![0]);
        assert_eq!(reloadable.borrow().value(), Some(&1));
    }

    #[test]
    fn reload_start_first_cycles_generations() {
        let (reloadable, _, stopped) = generational();
        reloadable.start();

        let reloaded = reloadable.reload(true);
        assert!(reloaded.try_outcome().is_some_and(|o| o.is_resolved()));
        assert_eq!(*stopped.lock(), vec![0]);
        assert_eq!(reloadable.borrow().value(), Some(&1));
    }

    #[test]
    fn reload_publishes_before_new_instance_starts() {
        // Stop-then-start exposes a window where current is still starting:
        // the swap happens first, and the replacement's setup only runs
        // after the outgoing instance has stopped.
        let gate: Arc<Mutex<Vec<Stage<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&gate);
        let reloadable = ReloadableManaged::new(
            move || {
                let stage = Stage::pending();
                slot.lock().push(stage.clone());
                stage
            },
            |_| Stage::resolved(()),
        );
        reloadable.start();
        gate.lock()[0].resolve(10);
        assert_eq!(reloadable.borrow().value(), Some(&10));

        let reloaded = reloadable.reload(false);
        assert!(!reloaded.is_complete());
        // The replacement is current but not started: borrows fail
        // structurally instead of handing out the torn-down old value.
        assert!(!reloadable.borrow().is_valid());

        gate.lock()[1].resolve(11);
        assert!(reloaded.try_outcome().is_some_and(|o| o.is_resolved()));
        assert_eq!(reloadable.borrow().value(), Some(&11));
    }

    #[test]
    fn start_first_reload_keeps_old_instance_serving_until_swap() {
        let gate: Arc<Mutex<Vec<Stage<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&gate);
        let reloadable = ReloadableManaged::new(
            move || {
                let stage = Stage::pending();
                slot.lock().push(stage.clone());
                stage
            },
            |_| Stage::resolved(()),
        );
        reloadable.start();
        gate.lock()[0].resolve(20);

        let reloaded = reloadable.reload(true);
        assert!(!reloaded.is_complete());
        // Replacement still starting: the old resource keeps serving.
        assert_eq!(reloadable.borrow().value(), Some(&20));

        gate.lock()[1].resolve(21);
        assert!(reloaded.try_outcome().is_some_and(|o| o.is_resolved()));
        assert_eq!(reloadable.borrow().value(), Some(&21));
    }

    #[test]
    fn start_first_reload_unwinds_when_stop_wins_the_race() {
        let gate: Arc<Mutex<Vec<Stage<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&gate);
        let stopped_values = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&stopped_values);
        let reloadable = ReloadableManaged::new(
            move || {
                let stage = Stage::pending();
                slot.lock().push(stage.clone());
                stage
            },
            move |n| {
                log.lock().push(n);
                Stage::resolved(())
            },
        );
        reloadable.start();
        gate.lock()[0].resolve(30);

        let reloaded = reloadable.reload(true);
        assert!(!reloaded.is_complete());

        // Top-level stop races in while the replacement is still starting.
        // It takes the slot and stops the old instance; the pin held by the
        // in-flight reload defers that teardown.
        let stopped = reloadable.stop();
        assert!(!stopped.is_complete());

        // The replacement finishes starting, loses the publish CAS, and
        // unwinds itself. The pin is released, letting the old teardown run.
        gate.lock()[1].resolve(31);
        assert!(reloaded.try_outcome().is_some_and(|o| o.is_cancelled()));
        assert!(stopped.try_outcome().is_some_and(|o| o.is_resolved()));

        // Old stopped once, unpublished replacement stopped once; nothing
        // leaks, nothing is stopped twice.
        // The pin is released before the unpublished replacement unwinds,
        // so the old teardown lands first.
        assert_eq!(*stopped_values.lock(), vec![30, 31]);
        assert!(!reloadable.borrow().is_valid());
    }

    #[test]
    fn reload_against_stopping_instance_gives_up() {
        let (reloadable, _, _) = generational();
        reloadable.start();

        // Stop the delegate directly: current still points at it, but its
        // borrows are invalid and the pointer will never change on its own.
        let current = reloadable
            .inner
            .current
            .load_full()
            .expect("current instance");
        current.stop();

        assert!(!reloadable.borrow().is_valid());
        assert!(reloadable
            .reload(false)
            .try_outcome()
            .is_some_and(|o| o.is_cancelled()));
    }

    #[test]
    fn setup_failure_during_reload_surfaces_on_the_reload_stage() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let reloadable = ReloadableManaged::new(
            move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Stage::resolved(1_u32)
                } else {
                    Stage::failed(crate::errors::StageError::Panicked("refused".into()))
                }
            },
            |_| Stage::resolved(()),
        );
        reloadable.start();

        let reloaded = reloadable.reload(false);
        assert!(reloaded.try_outcome().is_some_and(|o| o.is_failed()));
        // The failed replacement is current; borrows degrade structurally.
        assert!(!reloadable.borrow().is_valid());
    }
}
