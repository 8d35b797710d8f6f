//! Scripted location provider
//!
//! Replays a fixed list of timed samples on every subscription. Used by the
//! CLI on hosts without a GPS sensor and by tests, so acquisition runs the
//! same code path everywhere.

use crate::domain::types::{Coordinate, PermissionStatus, PositionSample};
use crate::error::LocationError;
use crate::infra::config::{Config, SimulatedSample};
use crate::io::location_provider::{DeviceLocationProvider, PositionWatch, WatchConfig};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// One reading delivered `at` after the subscription opens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScriptedSample {
    pub at: Duration,
    pub coordinate: Coordinate,
    pub accuracy_meters: f64,
}

impl ScriptedSample {
    pub fn new(at_ms: u64, coordinate: Coordinate, accuracy_meters: f64) -> Self {
        Self { at: Duration::from_millis(at_ms), coordinate, accuracy_meters }
    }
}

impl From<&SimulatedSample> for ScriptedSample {
    fn from(sample: &SimulatedSample) -> Self {
        Self::new(
            sample.at_ms,
            Coordinate::new(sample.latitude, sample.longitude),
            sample.accuracy_m,
        )
    }
}

pub struct ScriptedLocationProvider {
    permission: Mutex<PermissionStatus>,
    /// Status the simulated prompt resolves to
    prompt_result: PermissionStatus,
    /// Time the user takes to answer the prompt
    prompt_delay: Duration,
    script: Vec<ScriptedSample>,
    sensor_error: Option<String>,
    watches_opened: AtomicUsize,
    active_watches: Arc<AtomicUsize>,
    permission_requests: AtomicUsize,
}

impl ScriptedLocationProvider {
    pub fn new(script: Vec<ScriptedSample>) -> Self {
        Self {
            permission: Mutex::new(PermissionStatus::Granted),
            prompt_result: PermissionStatus::Granted,
            prompt_delay: Duration::ZERO,
            script,
            sensor_error: None,
            watches_opened: AtomicUsize::new(0),
            active_watches: Arc::new(AtomicUsize::new(0)),
            permission_requests: AtomicUsize::new(0),
        }
    }

    /// Provider that never emits a sample
    pub fn silent() -> Self {
        Self::new(Vec::new())
    }

    /// Build from the `[simulation]` config section
    pub fn from_config(config: &Config) -> Self {
        let script = config.simulated_samples().iter().map(ScriptedSample::from).collect();
        Self::new(script).with_permission(config.simulated_permission(), PermissionStatus::Granted)
    }

    /// Current status and the status a prompt resolves to
    pub fn with_permission(mut self, current: PermissionStatus, after_prompt: PermissionStatus) -> Self {
        self.permission = Mutex::new(current);
        self.prompt_result = after_prompt;
        self
    }

    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = delay;
        self
    }

    /// Fail every subscription attempt
    pub fn with_sensor_error(mut self, reason: &str) -> Self {
        self.sensor_error = Some(reason.to_string());
        self
    }

    pub fn watches_opened(&self) -> usize {
        self.watches_opened.load(Ordering::SeqCst)
    }

    /// Subscriptions not yet released
    pub fn active_watches(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceLocationProvider for ScriptedLocationProvider {
    async fn permission_status(&self) -> PermissionStatus {
        *self.permission.lock()
    }

    async fn request_permission(&self) -> PermissionStatus {
        self.permission_requests.fetch_add(1, Ordering::SeqCst);
        if !self.prompt_delay.is_zero() {
            tokio::time::sleep(self.prompt_delay).await;
        }
        let mut permission = self.permission.lock();
        // A permanent denial cannot be overturned from inside the app
        if *permission != PermissionStatus::Denied {
            *permission = self.prompt_result;
        }
        *permission
    }

    async fn watch_position(&self, config: WatchConfig) -> Result<PositionWatch, LocationError> {
        if let Some(reason) = &self.sensor_error {
            return Err(LocationError::SensorUnavailable { reason: reason.clone() });
        }

        let (tx, rx) = mpsc::channel(16);
        let script = self.script.clone();
        let opened_at = Instant::now();

        self.watches_opened.fetch_add(1, Ordering::SeqCst);
        self.active_watches.fetch_add(1, Ordering::SeqCst);
        let active = self.active_watches.clone();

        debug!(
            samples = %script.len(),
            interval_ms = %config.sample_interval.as_millis(),
            "scripted_watch_opened"
        );

        tokio::spawn(async move {
            for step in script {
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = sleep_until(opened_at + step.at) => {}
                }
                let sample = PositionSample {
                    coordinate: step.coordinate,
                    accuracy_meters: step.accuracy_meters,
                    captured_at: Utc::now(),
                };
                if tx.send(sample).await.is_err() {
                    return;
                }
            }
            // Script exhausted: keep the stream open like an idle sensor
            tx.closed().await;
        });

        Ok(PositionWatch::new(rx).with_release_hook(move || {
            active.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::location_provider::sample_once;

    const VENUE: Coordinate = Coordinate::new(52.5108, 13.4434);

    #[tokio::test(start_paused = true)]
    async fn test_replays_script_in_order() {
        let provider = ScriptedLocationProvider::new(vec![
            ScriptedSample::new(0, VENUE, 80.0),
            ScriptedSample::new(1_000, VENUE, 40.0),
        ]);
        let mut watch = provider.watch_position(WatchConfig::default()).await.unwrap();
        let start = Instant::now();

        assert_eq!(watch.next().await.unwrap().accuracy_meters, 80.0);
        let second = watch.next().await.unwrap();
        assert_eq!(second.accuracy_meters, 40.0);
        assert_eq!(start.elapsed(), Duration::from_millis(1_000));
        assert_eq!(provider.active_watches(), 1);

        drop(watch);
        assert_eq!(provider.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_permanent_denial_survives_prompt() {
        let provider = ScriptedLocationProvider::silent()
            .with_permission(PermissionStatus::Denied, PermissionStatus::Granted);
        assert_eq!(provider.request_permission().await, PermissionStatus::Denied);

        let provider = ScriptedLocationProvider::silent()
            .with_permission(PermissionStatus::Undetermined, PermissionStatus::Granted);
        assert_eq!(provider.request_permission().await, PermissionStatus::Granted);
        assert_eq!(provider.permission_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_once_releases_watch() {
        let provider = ScriptedLocationProvider::new(vec![ScriptedSample::new(500, VENUE, 12.0)]);
        let sample = sample_once(&provider, WatchConfig::default(), Duration::from_secs(5)).await;
        assert_eq!(sample.map(|s| s.accuracy_meters), Some(12.0));
        assert_eq!(provider.watches_opened(), 1);
        assert_eq!(provider.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_once_times_out_on_silent_sensor() {
        let provider = ScriptedLocationProvider::silent();
        let sample = sample_once(&provider, WatchConfig::default(), Duration::from_secs(5)).await;
        assert!(sample.is_none());
        assert_eq!(provider.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_sensor_error() {
        let provider = ScriptedLocationProvider::silent().with_sensor_error("gps off");
        let err = provider.watch_position(WatchConfig::default()).await.unwrap_err();
        assert_eq!(err, LocationError::SensorUnavailable { reason: "gps off".to_string() });
    }
}
