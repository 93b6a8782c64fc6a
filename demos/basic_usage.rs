//! Basic usage example for weak timers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weak_timer::{
    finalize, weak_callback, CancellationToken, Duration, MissedTickBehavior, OwnerId, WeakTimers,
};

/// A connection that polls its peer while it is open
struct Connection {
    peer: String,
    polls: AtomicUsize,
}

impl Drop for Connection {
    fn drop(&mut self) {
        println!("Connection to {} closed", self.peer);
        finalize(OwnerId::of(self));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let cancel_token = CancellationToken::new();
    let timers = WeakTimers::new(
        "example_weak_timers".to_string(),
        MissedTickBehavior::Skip,
        cancel_token.clone(),
    );

    let conn = Arc::new(Connection {
        peer: "10.0.0.7:4000".to_string(),
        polls: AtomicUsize::new(0),
    });

    // Poll every 100ms for as long as the connection exists
    let poll = timers.schedule_repeating(
        &conn,
        |conn: &Arc<Connection>, label: &&str| {
            let n = conn.polls.fetch_add(1, Ordering::SeqCst) + 1;
            println!("[{}] poll #{} of {}", label, n, conn.peer);
        },
        Duration::from_millis(100),
        "poller",
    )?;

    // One-shot greeting
    timers.schedule_once(
        &conn,
        |conn: &Arc<Connection>, _: &()| println!("Connected to {}", conn.peer),
        Duration::from_millis(50),
        (),
    )?;

    // A timeout that gets cancelled before it fires
    let timeout = timers.schedule_once(
        &conn,
        |_: &Arc<Connection>, _: &()| println!("This never prints"),
        Duration::from_secs(10),
        (),
    )?;

    // A plain weak callback, no timer involved
    let describe = weak_callback(&conn, |conn: &Arc<Connection>, prefix: &str| {
        format!("{} {}", prefix, conn.peer)
    });

    tokio::time::sleep(Duration::from_millis(350)).await;
    println!("Timeout cancelled: {}", timers.cancel(&timeout));
    println!("{:?}", describe.call("still talking to"));

    // Closing the connection stops the poller without any explicit cancel
    drop(conn);
    println!("Poller still scheduled: {}", timers.is_scheduled(&poll));
    println!("{:?}", describe.call("still talking to"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("{:?}", timers.stats());

    // Shutdown gracefully
    timers.shutdown();

    println!("Weak timers shut down successfully!");
    Ok(())
}
