use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Identity of an owner: the address of the value inside its `Arc`
///
/// `OwnerId::of(&*arc)` and `OwnerId::from_arc(&arc)` agree, so an owner can
/// compute its own identity from `Drop`. The address cannot be reused while
/// any `Weak` to the allocation exists, and every registered timer keeps one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(usize);

impl OwnerId {
    /// Identity of the value behind `owner`
    pub fn of<T>(owner: &T) -> Self {
        OwnerId(owner as *const T as usize)
    }

    /// Identity of the value held by `owner`
    pub fn from_arc<T>(owner: &Arc<T>) -> Self {
        OwnerId(Arc::as_ptr(owner) as usize)
    }
}

/// Process-unique id of one native timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

impl TimerId {
    pub(crate) fn next() -> Self {
        TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cleanup action stored in the registry
pub(crate) trait Finalize: Send + Sync {
    /// Whether the owner the action was registered for is still reachable
    fn owner_alive(&self) -> bool;

    /// Release the resource. Must be idempotent.
    fn finalize(&self);
}

/// Registry storage: timer -> (owner, action), plus the reverse index
#[derive(Default)]
struct Entries {
    actions: HashMap<TimerId, (OwnerId, Arc<dyn Finalize>)>,
    by_owner: HashMap<OwnerId, Vec<TimerId>>,
}

/// Association from owner identity to the cleanup actions of its timers
pub(crate) struct FinalizationRegistry {
    entries: Mutex<Entries>,
}

impl FinalizationRegistry {
    pub(crate) fn new() -> Self {
        FinalizationRegistry {
            entries: Mutex::new(Entries::default()),
        }
    }

    /// The process-wide registry
    pub(crate) fn global() -> &'static FinalizationRegistry {
        static GLOBAL: OnceLock<FinalizationRegistry> = OnceLock::new();
        GLOBAL.get_or_init(FinalizationRegistry::new)
    }

    pub(crate) fn register(&self, owner: OwnerId, timer: TimerId, action: Arc<dyn Finalize>) {
        let mut entries = self.entries.lock();
        entries.actions.insert(timer, (owner, action));
        entries.by_owner.entry(owner).or_default().push(timer);
    }

    /// Remove the entry for `timer`. Returns false if it was not registered.
    pub(crate) fn unregister(&self, timer: TimerId) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            let removed = entries.actions.remove(&timer);
            if let Some((owner, _)) = &removed {
                if let Some(timers) = entries.by_owner.get_mut(owner) {
                    timers.retain(|t| *t != timer);
                    if timers.is_empty() {
                        entries.by_owner.remove(owner);
                    }
                }
            }
            removed
        };
        removed.is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self, timer: TimerId) -> bool {
        self.entries.lock().actions.contains_key(&timer)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().actions.len()
    }

    /// Deliver finalization for `owner`
    ///
    /// Runs the action of every entry whose owner is gone and returns how many
    /// ran. Entries of a still reachable owner stay registered. Actions run
    /// after the lock is released.
    pub(crate) fn finalize(&self, owner: OwnerId) -> usize {
        let (due, kept_count) = {
            let mut guard = self.entries.lock();
            let entries = &mut *guard;
            let Some(timers) = entries.by_owner.remove(&owner) else {
                return 0;
            };

            let mut due = Vec::with_capacity(timers.len());
            let mut kept = Vec::new();
            for timer in timers {
                let alive = entries
                    .actions
                    .get(&timer)
                    .map(|(_, action)| action.owner_alive());
                match alive {
                    Some(true) => kept.push(timer),
                    Some(false) => {
                        if let Some((_, action)) = entries.actions.remove(&timer) {
                            due.push(action);
                        }
                    }
                    None => {}
                }
            }

            let kept_count = kept.len();
            if kept_count > 0 {
                entries.by_owner.insert(owner, kept);
            }
            (due, kept_count)
        };

        if kept_count > 0 {
            log::warn!(
                "Finalization delivered for {:?} while it is still reachable, keeping {} timer(s)",
                owner,
                kept_count
            );
        }

        let count = due.len();
        for action in due {
            action.finalize();
        }
        count
    }
}

/// Destructor hook: release every timer bound to `owner`
///
/// Call it from the owner's `Drop` implementation. Timers of an owner that is
/// still reachable are left alone, so a stray call is harmless. Without the
/// hook, a dead owner's timer is released at its next firing instead.
///
/// ```rust
/// use weak_timer::{finalize, OwnerId};
///
/// struct Session;
///
/// impl Drop for Session {
///     fn drop(&mut self) {
///         finalize(OwnerId::of(self));
///     }
/// }
/// ```
pub fn finalize(owner: OwnerId) {
    let count = FinalizationRegistry::global().finalize(owner);
    if count > 0 {
        log::debug!("Finalized {} timer(s) of {:?}", count, owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Probe {
        alive: AtomicBool,
        runs: AtomicUsize,
    }

    impl Probe {
        fn new(alive: bool) -> Arc<Self> {
            Arc::new(Probe {
                alive: AtomicBool::new(alive),
                runs: AtomicUsize::new(0),
            })
        }
    }

    impl Finalize for Probe {
        fn owner_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn finalize(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_owner_id_agrees_for_arc_and_ref() {
        let owner = Arc::new(17u32);
        assert_eq!(OwnerId::of(&*owner), OwnerId::from_arc(&owner));

        let other = Arc::new(17u32);
        assert_ne!(OwnerId::from_arc(&owner), OwnerId::from_arc(&other));
    }

    #[test]
    fn test_timer_ids_are_unique() {
        let a = TimerId::next();
        let b = TimerId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(format!("{a}"), format!("#{}", a.as_u64()));
    }

    #[test]
    fn test_finalize_runs_dead_entries_once() {
        let registry = FinalizationRegistry::new();
        let owner = OwnerId(0x1000);
        let probe = Probe::new(false);

        registry.register(owner, TimerId(1), probe.clone());
        registry.register(owner, TimerId(2), probe.clone());

        assert_eq!(registry.finalize(owner), 2);
        assert_eq!(probe.runs.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 0);

        // second delivery finds nothing
        assert_eq!(registry.finalize(owner), 0);
        assert_eq!(probe.runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_finalize_keeps_live_owner() {
        let registry = FinalizationRegistry::new();
        let owner = OwnerId(0x2000);
        let live = Probe::new(true);

        registry.register(owner, TimerId(10), live.clone());

        assert_eq!(registry.finalize(owner), 0);
        assert!(registry.is_registered(TimerId(10)));
        assert_eq!(live.runs.load(Ordering::SeqCst), 0);

        live.alive.store(false, Ordering::SeqCst);
        assert_eq!(registry.finalize(owner), 1);
        assert!(!registry.is_registered(TimerId(10)));
    }

    #[test]
    fn test_finalize_splits_live_and_dead_entries() {
        let registry = FinalizationRegistry::new();
        let owner = OwnerId(0x2800);
        let live = Probe::new(true);
        let dead = Probe::new(false);

        registry.register(owner, TimerId(30), live.clone());
        registry.register(owner, TimerId(31), dead.clone());

        assert_eq!(registry.finalize(owner), 1);
        assert_eq!(dead.runs.load(Ordering::SeqCst), 1);
        assert_eq!(live.runs.load(Ordering::SeqCst), 0);
        assert!(registry.is_registered(TimerId(30)));
        assert!(!registry.is_registered(TimerId(31)));

        // the kept entry is still reachable through its owner
        live.alive.store(false, Ordering::SeqCst);
        assert_eq!(registry.finalize(owner), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = FinalizationRegistry::new();
        let owner = OwnerId(0x3000);
        let probe = Probe::new(false);

        registry.register(owner, TimerId(20), probe.clone());
        registry.register(owner, TimerId(21), probe.clone());

        assert!(registry.unregister(TimerId(20)));
        assert!(!registry.unregister(TimerId(20)));
        assert!(!registry.unregister(TimerId(99)));

        // only the remaining entry is delivered
        assert_eq!(registry.finalize(owner), 1);
        assert_eq!(probe.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalize_unknown_owner() {
        let registry = FinalizationRegistry::new();
        assert_eq!(registry.finalize(OwnerId(0x4000)), 0);
    }
}
