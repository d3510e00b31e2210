//! worker runtime
//!
//! every role runs as an endless loop of cycles separated by sleeps. shutdown
//! only cuts a sleep short; a cycle in progress always runs to completion.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::aggregator::{AggregateOutcome, Aggregator};
use crate::monitor::{Monitor, RoundOutcome};
use crate::publisher::{PublishOutcome, Publisher};

/// unix seconds, the one clock deadlines are stamped and checked with
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// sending half, held by whoever decides to stop the node
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // no receivers left is fine
        let _ = self.tx.send(true);
    }
}

/// receiving half, one clone per worker
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// sleep for `duration`; returns true when shutdown was requested instead
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = self.rx.changed() => changed.is_err() || *self.rx.borrow(),
        }
    }
}

pub async fn run_monitor(mut monitor: Monitor, mut shutdown: Shutdown) {
    info!("monitor worker started");
    while !shutdown.is_triggered() {
        match monitor.run_round(&mut shutdown).await {
            RoundOutcome::Registered { .. } => {}
            RoundOutcome::Interrupted => break,
            RoundOutcome::TimedOut { .. } | RoundOutcome::SendFailed => {
                if shutdown.sleep(monitor.polling_interval()).await {
                    break;
                }
            }
        }
    }
    info!("monitor worker stopped");
}

pub async fn run_publisher(publisher: Publisher, mut shutdown: Shutdown) {
    info!("publisher worker started");
    while !shutdown.is_triggered() {
        let pause = match publisher.publish_once().await {
            // drain the intake channel without pausing
            Ok(PublishOutcome::Published { .. }) => continue,
            Ok(PublishOutcome::Idle) | Ok(PublishOutcome::Shortfall { .. }) => publisher.polling_interval(),
            Err(e) if e.is_transient() => {
                warn!("publisher cycle failed: {}", e);
                publisher.polling_interval()
            }
            Err(e) => {
                error!("publisher cycle failed: {}", e);
                publisher.polling_interval()
            }
        };
        if shutdown.sleep(pause).await {
            break;
        }
    }
    info!("publisher worker stopped");
}

pub async fn run_aggregator(aggregator: Aggregator, mut shutdown: Shutdown) {
    info!("aggregator worker started");
    while !shutdown.is_triggered() {
        match aggregator.run_once().await {
            Ok(outcomes) => {
                let finished = outcomes
                    .iter()
                    .filter(|(_, o)| !matches!(o, AggregateOutcome::NotDue))
                    .count();
                if finished > 0 {
                    info!("aggregated {} of {} jobs", finished, outcomes.len());
                }
            }
            Err(e) => error!("aggregator cycle failed: {}", e),
        }
        if shutdown.sleep(aggregator.polling_interval()).await {
            break;
        }
    }
    info!("aggregator worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cuts_sleep_short() {
        let (handle, mut shutdown) = shutdown_channel();
        let sleeper = tokio::spawn(async move { shutdown.sleep(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.trigger();
        let interrupted = tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(interrupted);
    }

    #[tokio::test]
    async fn test_sleep_completes_without_shutdown() {
        let (_handle, mut shutdown) = shutdown_channel();
        assert!(!shutdown.sleep(Duration::from_millis(5)).await);
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_shutdown() {
        let (handle, mut shutdown) = shutdown_channel();
        drop(handle);
        assert!(shutdown.sleep(Duration::from_secs(3600)).await);
    }

    #[test]
    fn test_clock_is_unix_seconds() {
        assert!(unix_now() > 1_600_000_000);
    }
}
