use crate::error::{Result, WeakTimerError};
use crate::registry::{Finalize, FinalizationRegistry, OwnerId, TimerId};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shortest period a repeating timer ticks with
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Stand-in deadline for delays too long to represent, about 30 years out
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + delay`, saturating to [`FAR_FUTURE`] instead of overflowing
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Timer engine whose callbacks are bound to weakly held owners
///
/// Cheap to clone; clones share the same timers.
#[derive(Clone)]
pub struct WeakTimers {
    shared: Arc<Shared>,
}

struct Shared {
    /// Instance name for logging
    name: String,

    /// Tick behaviour of repeating timers
    missed_tick_behavior: MissedTickBehavior,

    /// Root token, every native timer runs under a child of it
    cancel_token: CancellationToken,

    /// Live timers of this engine
    timers: Mutex<HashMap<TimerId, Arc<TimerSlot>>>,

    scheduled: AtomicU64,
    fired: AtomicU64,
    released: AtomicU64,
}

/// Opaque token for one scheduled timer
///
/// Holds only the timer id, never the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    id: TimerId,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }
}

/// Counters of one engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeakTimerStats {
    /// Timers ever scheduled
    pub scheduled: u64,
    /// Callback invocations
    pub fired: u64,
    /// Native timers actually released
    pub released: u64,
    /// Timers currently scheduled
    pub active: usize,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Once { deadline: Instant },
    Repeating { start: Instant, period: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TimerState {
    Scheduled = 0,
    Fired = 1,
    Cancelled = 2,
}

/// Per-handle state shared by the native timer, the engine table and the
/// finalization registry
struct TimerSlot {
    id: TimerId,
    owner: OwnerId,
    owner_ref: Weak<dyn Any + Send + Sync>,
    state: AtomicU8,
    token: CancellationToken,
    engine: Weak<Shared>,
}

impl TimerSlot {
    /// Move out of `Scheduled`. Only the caller that wins the transition
    /// cancels the native timer and drops the table and registry entries.
    fn release(&self, to: TimerState) -> bool {
        if self
            .state
            .compare_exchange(
                TimerState::Scheduled as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        self.token.cancel();
        FinalizationRegistry::global().unregister(self.id);

        if let Some(engine) = self.engine.upgrade() {
            engine.released.fetch_add(1, Ordering::Relaxed);
            let removed = engine.timers.lock().remove(&self.id);
            log::debug!(
                "Timer {} released as {:?} in engine '{}'",
                self.id,
                to,
                engine.name
            );
            drop(removed);
        }
        true
    }

    fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) != TimerState::Scheduled as u8
    }
}

impl Finalize for TimerSlot {
    fn owner_alive(&self) -> bool {
        self.owner_ref.strong_count() > 0
    }

    fn finalize(&self) {
        self.release(TimerState::Cancelled);
    }
}

/// Releases the slot when the native timer task ends, however it ends
struct ReleaseGuard(Arc<TimerSlot>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.release(TimerState::Cancelled);
    }
}

/// Callback with its arguments bound
enum Invoke<T> {
    Blocking(Box<dyn FnMut(&Arc<T>) + Send>),
    Async(Box<dyn FnMut(Arc<T>) -> BoxFuture<'static, ()> + Send>),
}

impl<T> Invoke<T> {
    /// Run the callback once, catching a panic
    async fn run(&mut self, owner: Arc<T>) -> std::result::Result<(), Box<dyn Any + Send>> {
        match self {
            Invoke::Blocking(f) => panic::catch_unwind(AssertUnwindSafe(|| f(&owner))),
            Invoke::Async(f) => {
                let fut = panic::catch_unwind(AssertUnwindSafe(|| f(owner)))?;
                AssertUnwindSafe(fut).catch_unwind().await
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        *text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "<non-string panic payload>"
    }
}

impl WeakTimers {
    /// Create a new engine
    ///
    /// # Arguments
    /// * `name` - Engine instance name for logging
    /// * `missed_tick_behavior` - What repeating timers do after falling behind
    /// * `cancel_token` - Cancelling it shuts the engine down
    pub fn new(
        name: String,
        missed_tick_behavior: MissedTickBehavior,
        cancel_token: CancellationToken,
    ) -> Self {
        WeakTimers {
            shared: Arc::new(Shared {
                name,
                missed_tick_behavior,
                cancel_token,
                timers: Mutex::new(HashMap::new()),
                scheduled: AtomicU64::new(0),
                fired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Invoke `f(&owner, &args)` every `period` while `owner` is alive
    ///
    /// The first firing happens one period from now. A zero period is raised
    /// to [`MIN_PERIOD`]. The timer stops for good at the first tick that
    /// finds the owner gone, or earlier through [`finalize`](crate::finalize).
    pub fn schedule_repeating<T, A, F>(
        &self,
        owner: &Arc<T>,
        mut f: F,
        period: Duration,
        args: A,
    ) -> Result<TimerHandle>
    where
        T: Send + Sync + 'static,
        A: Send + 'static,
        F: FnMut(&Arc<T>, &A) + Send + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let mode = Mode::Repeating {
            start: deadline_after(period),
            period,
        };
        self.schedule(
            owner,
            mode,
            Invoke::Blocking(Box::new(move |owner: &Arc<T>| f(owner, &args))),
        )
    }

    /// Invoke `f(&owner, &args)` once after `delay` if `owner` is still alive
    pub fn schedule_once<T, A, F>(
        &self,
        owner: &Arc<T>,
        mut f: F,
        delay: Duration,
        args: A,
    ) -> Result<TimerHandle>
    where
        T: Send + Sync + 'static,
        A: Send + 'static,
        F: FnMut(&Arc<T>, &A) + Send + 'static,
    {
        let mode = Mode::Once {
            deadline: deadline_after(delay),
        };
        self.schedule(
            owner,
            mode,
            Invoke::Blocking(Box::new(move |owner: &Arc<T>| f(owner, &args))),
        )
    }

    /// Like [`schedule_repeating`](Self::schedule_repeating) with an async
    /// callback
    ///
    /// Each returned future is awaited before the next tick is taken, and it
    /// keeps the owner alive until it completes.
    pub fn schedule_repeating_async<T, A, F, Fut>(
        &self,
        owner: &Arc<T>,
        mut f: F,
        period: Duration,
        args: A,
    ) -> Result<TimerHandle>
    where
        T: Send + Sync + 'static,
        A: Send + 'static,
        F: FnMut(Arc<T>, &A) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let mode = Mode::Repeating {
            start: deadline_after(period),
            period,
        };
        self.schedule(
            owner,
            mode,
            Invoke::Async(Box::new(move |owner: Arc<T>| f(owner, &args).boxed())),
        )
    }

    /// Like [`schedule_once`](Self::schedule_once) with an async callback
    pub fn schedule_once_async<T, A, F, Fut>(
        &self,
        owner: &Arc<T>,
        mut f: F,
        delay: Duration,
        args: A,
    ) -> Result<TimerHandle>
    where
        T: Send + Sync + 'static,
        A: Send + 'static,
        F: FnMut(Arc<T>, &A) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mode = Mode::Once {
            deadline: deadline_after(delay),
        };
        self.schedule(
            owner,
            mode,
            Invoke::Async(Box::new(move |owner: Arc<T>| f(owner, &args).boxed())),
        )
    }

    fn schedule<T>(&self, owner: &Arc<T>, mode: Mode, invoke: Invoke<T>) -> Result<TimerHandle>
    where
        T: Send + Sync + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| WeakTimerError::NoRuntime)?;
        if self.shared.cancel_token.is_cancelled() {
            return Err(WeakTimerError::ShutDown {
                name: self.shared.name.clone(),
            });
        }

        let id = TimerId::next();
        let weak = Arc::downgrade(owner);
        let owner_ref: Weak<dyn Any + Send + Sync> = weak.clone();
        let slot = Arc::new(TimerSlot {
            id,
            owner: OwnerId::from_arc(owner),
            owner_ref,
            state: AtomicU8::new(TimerState::Scheduled as u8),
            token: self.shared.cancel_token.child_token(),
            engine: Arc::downgrade(&self.shared),
        });

        self.shared.timers.lock().insert(id, slot.clone());
        FinalizationRegistry::global().register(slot.owner, id, slot.clone());
        self.shared.scheduled.fetch_add(1, Ordering::Relaxed);

        log::debug!(
            "Timer {} scheduled in engine '{}': {:?}",
            id,
            self.shared.name,
            mode
        );

        runtime.spawn(drive(self.shared.clone(), slot, weak, mode, invoke));
        Ok(TimerHandle { id })
    }

    /// Cancel a timer
    ///
    /// Returns true if this call released it. Cancelling twice, after a
    /// one-shot fired, or with a handle of another engine does nothing.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let slot = self.shared.timers.lock().get(&handle.id).cloned();
        match slot {
            Some(slot) => slot.release(TimerState::Cancelled),
            None => false,
        }
    }

    /// Cancel every timer of this engine bound to `owner`
    pub fn cancel_owner<T>(&self, owner: &Arc<T>) -> usize {
        let owner = OwnerId::from_arc(owner);
        let slots: Vec<_> = self
            .shared
            .timers
            .lock()
            .values()
            .filter(|slot| slot.owner == owner)
            .cloned()
            .collect();
        Self::release_all(slots)
    }

    /// Cancel every timer of this engine
    pub fn cancel_all(&self) -> usize {
        let slots: Vec<_> = self.shared.timers.lock().values().cloned().collect();
        let count = Self::release_all(slots);
        if count > 0 {
            log::debug!(
                "Cancelled all {} timer(s) in engine '{}'",
                count,
                self.shared.name
            );
        }
        count
    }

    fn release_all(slots: Vec<Arc<TimerSlot>>) -> usize {
        slots
            .into_iter()
            .filter(|slot| slot.release(TimerState::Cancelled))
            .count()
    }

    /// Stop the engine: every timer is released and scheduling fails from now on
    pub fn shutdown(&self) {
        log::info!("Weak timer engine '{}' shutting down", self.shared.name);
        self.shared.cancel_token.cancel();
        self.cancel_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.cancel_token.is_cancelled()
    }

    /// Whether `handle` still holds a live native timer
    pub fn is_scheduled(&self, handle: &TimerHandle) -> bool {
        self.shared.timers.lock().contains_key(&handle.id)
    }

    pub fn active_count(&self) -> usize {
        self.shared.timers.lock().len()
    }

    pub fn stats(&self) -> WeakTimerStats {
        WeakTimerStats {
            scheduled: self.shared.scheduled.load(Ordering::Relaxed),
            fired: self.shared.fired.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
            active: self.active_count(),
        }
    }
}

impl Shared {
    /// Invoke the callback for one firing. Returns false if the timer must stop.
    async fn fire<T>(&self, slot: &TimerSlot, invoke: &mut Invoke<T>, owner: Arc<T>) -> bool {
        self.fired.fetch_add(1, Ordering::Relaxed);
        match invoke.run(owner).await {
            Ok(()) => true,
            Err(payload) => {
                log::error!(
                    "Callback of timer {} panicked in engine '{}': {}",
                    slot.id,
                    self.name,
                    panic_message(payload.as_ref())
                );
                slot.release(TimerState::Cancelled);
                false
            }
        }
    }
}

/// Native timer task
async fn drive<T>(
    shared: Arc<Shared>,
    slot: Arc<TimerSlot>,
    owner: Weak<T>,
    mode: Mode,
    mut invoke: Invoke<T>,
) where
    T: Send + Sync + 'static,
{
    let _guard = ReleaseGuard(slot.clone());

    match mode {
        Mode::Once { deadline } => {
            tokio::select! {
                biased;

                _ = slot.token.cancelled() => {}

                _ = time::sleep_until(deadline) => {
                    // Deregister before touching the owner
                    if !slot.release(TimerState::Fired) {
                        return;
                    }
                    match owner.upgrade() {
                        Some(owner) => {
                            shared.fire(&slot, &mut invoke, owner).await;
                        }
                        None => {
                            log::debug!("Timer {} fired after its owner was dropped", slot.id);
                        }
                    }
                }
            }
        }
        Mode::Repeating { start, period } => {
            let mut ticker = time::interval_at(start, period);
            ticker.set_missed_tick_behavior(shared.missed_tick_behavior);

            loop {
                tokio::select! {
                    biased;

                    _ = slot.token.cancelled() => break,

                    _ = ticker.tick() => {
                        if slot.is_released() {
                            break;
                        }
                        let Some(owner) = owner.upgrade() else {
                            log::debug!("Timer {} stopping, owner dropped", slot.id);
                            slot.release(TimerState::Cancelled);
                            break;
                        };
                        if !shared.fire(&slot, &mut invoke, owner).await {
                            break;
                        }
                    }
                }
            }
        }
    }
}
