//! Periodic position reporter
//!
//! Runs a tick closure on a fixed interval until stopped. The first tick fires
//! one full interval after start. `stop()` (or drop) signals shutdown and aborts
//! the task, so an in-progress tick is abandoned at its next await point and no
//! further tick runs.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

pub struct PositionReporter {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PositionReporter {
    /// Spawn the reporter. `tick` returns `false` to end the loop on its own.
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!(interval_secs = %period.as_secs(), "position_reporter_started");
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if !tick().await {
                            debug!("position_reporter_owner_gone");
                            break;
                        }
                    }
                }
            }
            info!("position_reporter_stopped");
        });

        Self { shutdown_tx, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop immediately. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

impl Drop for PositionReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(ticks: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<bool> + Send + 'static {
        let ticks = ticks.clone();
        move || {
            ticks.fetch_add(1, Ordering::SeqCst);
            std::future::ready(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_fixed_interval() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let reporter = PositionReporter::spawn(Duration::from_secs(120), counting(&ticks));

        tokio::time::sleep(Duration::from_secs(119)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(240)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(reporter.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_after_stop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let reporter = PositionReporter::spawn(Duration::from_secs(120), counting(&ticks));

        tokio::time::sleep(Duration::from_secs(121)).await;
        reporter.stop();
        reporter.stop();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(!reporter.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        drop(PositionReporter::spawn(Duration::from_secs(1), counting(&ticks)));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_can_end_loop() {
        let reporter = PositionReporter::spawn(Duration::from_secs(1), || std::future::ready(false));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!reporter.is_running());
    }
}
