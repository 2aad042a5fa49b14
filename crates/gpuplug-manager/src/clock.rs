//! Time source for the plugin lifecycle

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

/// Wall clock and timer used by the serve loop and startup gate
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current Unix timestamp in seconds
    fn unix_timestamp(&self) -> i64;

    /// Suspend for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by the system time and tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn unix_timestamp(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleep for `duration` unless shutdown is requested first.
///
/// Returns `true` when shutdown was requested, including when the
/// shutdown sender has gone away.
pub async fn sleep_or_shutdown<C: Clock + ?Sized>(
    clock: &C,
    duration: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = clock.sleep(duration) => false,
    }
}
