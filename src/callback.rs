use std::fmt;
use std::sync::{Arc, Weak};

/// Callable bound to a weakly held owner
///
/// Every call upgrades the weak reference first. While the owner is alive the
/// wrapped function runs with it and its result is returned in `Some`; once the
/// owner is gone each call is a no-op returning `None`.
pub struct WeakCallback<T, F> {
    /// Owner, never upgraded for longer than one call
    owner: Weak<T>,

    /// Forwarded function
    f: F,
}

/// Bind `f` to `owner` without keeping `owner` alive
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use weak_timer::weak_callback;
///
/// let counter = Arc::new(String::from("abc"));
/// let len = weak_callback(&counter, |s: &Arc<String>, extra: usize| s.len() + extra);
///
/// assert_eq!(len.call(1), Some(4));
/// drop(counter);
/// assert_eq!(len.call(1), None);
/// ```
pub fn weak_callback<T, F>(owner: &Arc<T>, f: F) -> WeakCallback<T, F> {
    WeakCallback {
        owner: Arc::downgrade(owner),
        f,
    }
}

impl<T, F> WeakCallback<T, F> {
    /// Invoke the function if the owner is still alive
    pub fn call<A, R>(&self, args: A) -> Option<R>
    where
        F: Fn(&Arc<T>, A) -> R,
    {
        let owner = self.owner.upgrade()?;
        Some((self.f)(&owner, args))
    }

    /// Whether the owner can still be reached
    pub fn is_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }

    /// Turn the wrapper into a plain closure
    pub fn into_fn<A, R>(self) -> impl Fn(A) -> Option<R>
    where
        F: Fn(&Arc<T>, A) -> R,
    {
        move |args| self.call(args)
    }
}

impl<T, F: Clone> Clone for WeakCallback<T, F> {
    fn clone(&self) -> Self {
        WeakCallback {
            owner: self.owner.clone(),
            f: self.f.clone(),
        }
    }
}

impl<T, F> fmt::Debug for WeakCallback<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCallback")
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}
