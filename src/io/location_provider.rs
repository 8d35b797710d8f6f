//! Device location provider interface and the cancelable position stream
//!
//! A `PositionWatch` is the only handle to a running sensor subscription.
//! Closing it (explicitly via `cancel()` or implicitly on drop) releases the
//! subscription, so every code path that opens a watch also releases it.

use crate::domain::types::{AccuracyTier, PermissionStatus, PositionSample};
use crate::error::LocationError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Requested sampling behaviour for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    pub accuracy_tier: AccuracyTier,
    pub sample_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { accuracy_tier: AccuracyTier::High, sample_interval: Duration::from_secs(1) }
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Cancelable, non-restartable stream of position samples
pub struct PositionWatch {
    rx: mpsc::Receiver<PositionSample>,
    on_release: Option<ReleaseHook>,
    released: bool,
}

impl PositionWatch {
    /// Wrap the receiving half of a provider's sample channel
    pub fn new(rx: mpsc::Receiver<PositionSample>) -> Self {
        Self { rx, on_release: None, released: false }
    }

    /// Run `hook` exactly once when the subscription is released
    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    /// Next sample; `None` once the provider ended the stream or the watch was cancelled
    pub async fn next(&mut self) -> Option<PositionSample> {
        if self.released {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop the subscription. Idempotent.
    pub fn cancel(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Producer side observes this through Sender::closed()
        self.rx.close();
        if let Some(hook) = self.on_release.take() {
            hook();
        }
        debug!("position_watch_released");
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for PositionWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionWatch").field("released", &self.released).finish()
    }
}

/// Platform sensor API
#[async_trait]
pub trait DeviceLocationProvider: Send + Sync {
    async fn permission_status(&self) -> PermissionStatus;

    /// Prompt the user; returns the status after the prompt
    async fn request_permission(&self) -> PermissionStatus;

    /// Open a continuous position stream
    async fn watch_position(&self, config: WatchConfig) -> Result<PositionWatch, LocationError>;
}

/// Take a single reading: open a watch, wait for the first sample, release the watch.
///
/// Returns `None` without prompting when permission is not already granted.
pub async fn sample_once(
    provider: &dyn DeviceLocationProvider,
    config: WatchConfig,
    wait: Duration,
) -> Option<PositionSample> {
    if provider.permission_status().await != PermissionStatus::Granted {
        debug!("sample_once_no_permission");
        return None;
    }

    let mut watch = match provider.watch_position(config).await {
        Ok(watch) => watch,
        Err(e) => {
            debug!(error = %e, "sample_once_watch_failed");
            return None;
        }
    };

    let sample = tokio::time::timeout(wait, watch.next()).await.ok().flatten();
    watch.cancel();
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_release_hook_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::channel(4);
        let counter = released.clone();
        let mut watch = PositionWatch::new(rx).with_release_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        watch.cancel();
        watch.cancel();
        drop(watch);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_and_closes_producer() {
        let released = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(4);
        let counter = released.clone();
        let watch = PositionWatch::new(rx).with_release_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(watch);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(tx.is_closed());
        assert!(tx.send(PositionSample::new(0.0, 0.0, 5.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_next_after_cancel_is_none() {
        let (tx, rx) = mpsc::channel(4);
        let mut watch = PositionWatch::new(rx);
        tx.send(PositionSample::new(52.5, 13.4, 8.0)).await.unwrap();
        assert!(watch.next().await.is_some());
        watch.cancel();
        assert!(watch.next().await.is_none());
    }
}
