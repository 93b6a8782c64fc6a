//! # Weak Timer
//!
//! Timers for Tokio whose callbacks are bound to a weakly held owner.
//!
//! Scheduling a timer never keeps its owner alive. Every firing upgrades the
//! owner first and skips the callback once the owner is gone; a repeating timer
//! then stops for good. The native timer is released no later than its next
//! firing, or right away when the owner's `Drop` calls [`finalize`].
//!
//! ## Features
//!
//! - **Weak callbacks**: [`weak_callback`] wraps a function so that calls are
//!   forwarded only while the owner lives
//! - **One-shot and repeating timers**: sync or async callbacks, with
//!   arguments bound at schedule time
//! - **Idempotent cancellation**: exactly one release per timer, whichever of
//!   cancel, finalization, owner death or firing gets there first
//! - **Graceful Shutdown**: a root cancellation token stops every timer
//! - **Logging**: per-timer transitions through the `log` facade
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use weak_timer::{finalize, CancellationToken, Duration, MissedTickBehavior, OwnerId, WeakTimers};
//!
//! struct Heartbeat {
//!     peer: String,
//! }
//!
//! impl Drop for Heartbeat {
//!     fn drop(&mut self) {
//!         finalize(OwnerId::of(self));
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let timers = WeakTimers::new(
//!         "heartbeats".to_string(),
//!         MissedTickBehavior::Skip,
//!         CancellationToken::new(),
//!     );
//!
//!     let heartbeat = Arc::new(Heartbeat { peer: "10.0.0.7".to_string() });
//!     let handle = timers.schedule_repeating(
//!         &heartbeat,
//!         |owner: &Arc<Heartbeat>, tag: &&str| println!("{} ping {}", tag, owner.peer),
//!         Duration::from_millis(10),
//!         "hb",
//!     )?;
//!
//!     tokio::time::sleep(Duration::from_millis(35)).await;
//!
//!     // Dropping the owner releases the timer
//!     drop(heartbeat);
//!     assert!(!timers.is_scheduled(&handle));
//!
//!     timers.shutdown();
//!     Ok(())
//! }
//! ```

mod callback;
mod error;
mod registry;
mod timers;

pub use callback::{weak_callback, WeakCallback};
pub use error::{Result, WeakTimerError};
pub use registry::{finalize, OwnerId, TimerId};
pub use timers::{TimerHandle, WeakTimerStats, WeakTimers, MIN_PERIOD};

// Re-export commonly used types for convenience
pub use std::time::Duration;
pub use tokio::time::MissedTickBehavior;
pub use tokio_util::sync::CancellationToken;
