//! Location acquisition state machine
//!
//! One attempt runs Idle → Acquiring → Validating → Success | Error:
//! - samples are consumed strictly in arrival order; the best (most accurate) one is kept
//! - the first sample at or below the target accuracy finalizes, but never before
//!   `min_duration` has elapsed (a pending finalize fires at `started_at + min_duration`)
//! - at `max_wait` the best sample is used if it is within the acceptable accuracy
//! - the final fix is checked against the venue geofence
//!
//! The sensor watch is owned by the running attempt and released on every exit,
//! including cancellation and the caller dropping the future. A cancel issued
//! during the permission prompt or while the watch is opening ends the attempt
//! at once, before any sensor subscription is held.

use crate::domain::types::{PermissionStatus, PositionSample};
use crate::error::LocationError;
use crate::infra::config::AcquisitionConfig;
use crate::infra::metrics::Metrics;
use crate::io::location_provider::{DeviceLocationProvider, PositionWatch, WatchConfig};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// A validated position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub sample: PositionSample,
    /// Distance to the geofence anchor; `None` when no geofence is configured
    pub distance_meters: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionStatus {
    Idle,
    Acquiring,
    Validating,
    Success(Fix),
    Error(LocationError),
}

impl AcquisitionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AcquisitionStatus::Success(_) | AcquisitionStatus::Error(_))
    }

    pub fn is_running(&self) -> bool {
        matches!(self, AcquisitionStatus::Acquiring | AcquisitionStatus::Validating)
    }
}

/// Observable state of the current (or last) attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionState {
    pub status: AcquisitionStatus,
    pub best_sample: Option<PositionSample>,
    pub started_at: Option<Instant>,
}

impl AcquisitionState {
    fn idle() -> Self {
        Self { status: AcquisitionStatus::Idle, best_sample: None, started_at: None }
    }
}

/// How the sampling loop ended
enum LoopExit {
    Finalize(PositionSample),
    Failed(LocationError),
    Cancelled,
}

/// Clears the in-flight flag and abandons a running state when the attempt ends
struct AttemptGuard<'a> {
    acquirer: &'a LocationAcquirer,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.acquirer.state_tx.send_if_modified(|state| {
            if state.status.is_running() {
                *state = AcquisitionState::idle();
                true
            } else {
                false
            }
        });
        self.acquirer.in_flight.store(false, Ordering::Release);
    }
}

pub struct LocationAcquirer {
    provider: Arc<dyn DeviceLocationProvider>,
    config: AcquisitionConfig,
    metrics: Arc<Metrics>,
    state_tx: watch::Sender<AcquisitionState>,
    /// Bumped by `cancel()`; the running attempt watches for changes
    cancel_tx: watch::Sender<u64>,
    in_flight: AtomicBool,
}

impl LocationAcquirer {
    pub fn new(
        provider: Arc<dyn DeviceLocationProvider>,
        config: AcquisitionConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(AcquisitionState::idle());
        let (cancel_tx, _) = watch::channel(0);
        Self { provider, config, metrics, state_tx, cancel_tx, in_flight: AtomicBool::new(false) }
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Snapshot of the current state
    pub fn state(&self) -> AcquisitionState {
        self.state_tx.borrow().clone()
    }

    /// Receive every state transition
    pub fn subscribe(&self) -> watch::Receiver<AcquisitionState> {
        self.state_tx.subscribe()
    }

    pub fn is_acquiring(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one acquisition attempt to completion.
    ///
    /// Fails with `AlreadyAcquiring` (state untouched) if an attempt is running,
    /// and with `Cancelled` (state back to Idle) if `cancel()` interrupts it.
    pub async fn begin(&self) -> Result<Fix, LocationError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(LocationError::AlreadyAcquiring);
        }
        let _guard = AttemptGuard { acquirer: self };
        // Only cancels issued after this point interrupt the attempt
        let mut cancel_rx = self.cancel_tx.subscribe();

        self.metrics.record_acquisition_started();
        match until_cancelled(&mut cancel_rx, self.ensure_permission()).await {
            None => return self.cancelled(),
            Some(Err(e)) => return self.fail(e),
            Some(Ok(())) => {}
        }

        let started_at = Instant::now();
        self.state_tx.send_replace(AcquisitionState {
            status: AcquisitionStatus::Acquiring,
            best_sample: None,
            started_at: Some(started_at),
        });
        info!(
            target_m = %self.config.target_accuracy_meters,
            max_wait_ms = %self.config.max_wait.as_millis(),
            "location_acquisition_started"
        );

        let watch_config = WatchConfig {
            accuracy_tier: self.config.accuracy_tier,
            sample_interval: self.config.sample_interval,
        };
        let opened = until_cancelled(&mut cancel_rx, self.provider.watch_position(watch_config)).await;
        let mut positions = match opened {
            None => return self.cancelled(),
            Some(Ok(positions)) => positions,
            Some(Err(e)) => return self.fail(e),
        };

        let exit = self.sample_loop(&mut positions, started_at, &mut cancel_rx).await;
        positions.cancel();

        match exit {
            LoopExit::Cancelled => self.cancelled(),
            LoopExit::Failed(e) => self.fail(e),
            LoopExit::Finalize(sample) => self.validate(sample, started_at),
        }
    }

    /// Start a fresh attempt after a terminal one
    pub async fn retry(&self) -> Result<Fix, LocationError> {
        if self.is_acquiring() {
            return Err(LocationError::AlreadyAcquiring);
        }
        self.state_tx.send_replace(AcquisitionState::idle());
        self.begin().await
    }

    /// Abort the running attempt, if any. The state returns to Idle.
    pub fn cancel(&self) {
        if !self.is_acquiring() {
            return;
        }
        self.cancel_tx.send_modify(|generation| *generation += 1);
    }

    async fn ensure_permission(&self) -> Result<(), LocationError> {
        match self.provider.permission_status().await {
            PermissionStatus::Granted => Ok(()),
            PermissionStatus::Denied => Err(LocationError::PermissionDenied { permanent: true }),
            PermissionStatus::Undetermined => match self.provider.request_permission().await {
                PermissionStatus::Granted => Ok(()),
                PermissionStatus::Denied => {
                    Err(LocationError::PermissionDenied { permanent: true })
                }
                PermissionStatus::Undetermined => {
                    Err(LocationError::PermissionDenied { permanent: false })
                }
            },
        }
    }

    async fn sample_loop(
        &self,
        positions: &mut PositionWatch,
        started_at: Instant,
        cancel_rx: &mut watch::Receiver<u64>,
    ) -> LoopExit {
        let deadline = started_at + self.config.max_wait;
        let min_deadline = started_at + self.config.min_duration;
        let target = self.config.target_accuracy_meters;

        let mut best: Option<PositionSample> = None;
        let mut finalize_pending = false;
        let mut stream_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel_rx.changed() => return LoopExit::Cancelled,

                _ = sleep_until(min_deadline), if finalize_pending => {
                    match best {
                        Some(sample) => return LoopExit::Finalize(sample),
                        None => finalize_pending = false,
                    }
                }

                _ = sleep_until(deadline) => return self.on_timeout(best),

                next = positions.next(), if stream_open => {
                    let Some(sample) = next else {
                        debug!("location_stream_ended");
                        stream_open = false;
                        continue;
                    };

                    if best.map_or(true, |b| sample.is_more_accurate_than(&b)) {
                        best = Some(sample);
                        self.state_tx.send_modify(|state| state.best_sample = Some(sample));
                    }
                    debug!(
                        accuracy_m = %sample.accuracy_meters,
                        elapsed_ms = %started_at.elapsed().as_millis(),
                        "location_sample"
                    );

                    if sample.accuracy_meters <= target {
                        if Instant::now() >= min_deadline {
                            if let Some(best) = best {
                                return LoopExit::Finalize(best);
                            }
                        } else {
                            finalize_pending = true;
                        }
                    }
                }
            }
        }
    }

    fn on_timeout(&self, best: Option<PositionSample>) -> LoopExit {
        match best {
            Some(sample) if sample.accuracy_meters <= self.config.acceptable_accuracy_meters => {
                LoopExit::Finalize(sample)
            }
            Some(sample) => LoopExit::Failed(LocationError::AccuracyInsufficient {
                best_accuracy_meters: sample.accuracy_meters,
            }),
            None => LoopExit::Failed(LocationError::NoFix),
        }
    }

    fn validate(&self, sample: PositionSample, started_at: Instant) -> Result<Fix, LocationError> {
        self.state_tx.send_modify(|state| state.status = AcquisitionStatus::Validating);

        let distance_meters = match &self.config.geofence {
            None => None,
            Some(fence) => match fence.check(sample.coordinate) {
                Ok(distance) => Some(distance),
                Err(distance) => {
                    return self.fail(LocationError::OutOfGeofence {
                        distance_meters: distance,
                        max_distance_meters: fence.max_distance_meters,
                    });
                }
            },
        };

        let fix = Fix { sample, distance_meters };
        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        self.metrics.record_acquisition_succeeded(elapsed_ms);
        self.state_tx.send_modify(|state| state.status = AcquisitionStatus::Success(fix));
        info!(
            accuracy_m = %sample.accuracy_meters,
            distance_m = ?distance_meters,
            elapsed_ms = %elapsed_ms,
            "location_acquired"
        );
        Ok(fix)
    }

    fn cancelled<T>(&self) -> Result<T, LocationError> {
        self.metrics.record_acquisition_cancelled();
        info!("location_acquisition_cancelled");
        Err(LocationError::Cancelled)
    }

    fn fail<T>(&self, error: LocationError) -> Result<T, LocationError> {
        self.metrics
            .record_acquisition_failed(matches!(error, LocationError::OutOfGeofence { .. }));
        self.state_tx.send_modify(|state| state.status = AcquisitionStatus::Error(error.clone()));
        warn!(kind = %error.kind(), error = %error, "location_acquisition_failed");
        Err(error)
    }
}

/// Drive `fut` unless `cancel()` fires first; `None` when cancelled
async fn until_cancelled<F: Future>(cancel_rx: &mut watch::Receiver<u64>, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel_rx.changed() => None,
        out = fut => Some(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::{offset_north, Geofence};
    use crate::domain::types::Coordinate;
    use crate::io::scripted_provider::{ScriptedLocationProvider, ScriptedSample};
    use std::time::Duration;

    const VENUE: Coordinate = Coordinate::new(52.5108, 13.4434);

    fn acquirer(
        provider: Arc<ScriptedLocationProvider>,
        config: AcquisitionConfig,
    ) -> LocationAcquirer {
        LocationAcquirer::new(provider, config, Arc::new(Metrics::new()))
    }

    fn script(steps: &[(u64, f64)]) -> Arc<ScriptedLocationProvider> {
        Arc::new(ScriptedLocationProvider::new(
            steps.iter().map(|&(at, acc)| ScriptedSample::new(at, VENUE, acc)).collect(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_on_first_target_sample() {
        let provider = script(&[(0, 80.0), (1_000, 40.0), (2_000, 12.0), (3_000, 5.0)]);
        let acq = acquirer(provider.clone(), AcquisitionConfig::default());
        let start = Instant::now();

        let fix = acq.begin().await.unwrap();

        assert_eq!(fix.sample.accuracy_meters, 12.0);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(acq.state().status, AcquisitionStatus::Success(fix));
        assert_eq!(provider.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sample_is_no_fix() {
        let provider = Arc::new(ScriptedLocationProvider::silent());
        let acq = acquirer(provider.clone(), AcquisitionConfig::default());
        let start = Instant::now();

        let err = acq.begin().await.unwrap_err();

        assert_eq!(err, LocationError::NoFix);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(acq.state().status, AcquisitionStatus::Error(LocationError::NoFix));
        assert_eq!(provider.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptable_best_at_timeout() {
        let provider = script(&[(0, 60.0), (1_000, 35.0), (5_000, 20.0), (6_000, 25.0)]);
        let acq = acquirer(provider, AcquisitionConfig::default());
        let start = Instant::now();

        let fix = acq.begin().await.unwrap();

        assert_eq!(fix.sample.accuracy_meters, 20.0);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poor_best_at_timeout() {
        let provider = script(&[(0, 90.0), (2_000, 45.0)]);
        let acq = acquirer(provider, AcquisitionConfig::default());

        let err = acq.begin().await.unwrap_err();

        assert_eq!(err, LocationError::AccuracyInsufficient { best_accuracy_meters: 45.0 });
        assert_eq!(acq.state().best_sample.map(|s| s.accuracy_meters), Some(45.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_geofence_carries_distance() {
        let far = offset_north(VENUE, 800.0);
        let provider = Arc::new(ScriptedLocationProvider::new(vec![ScriptedSample::new(0, far, 8.0)]));
        let config = AcquisitionConfig {
            geofence: Some(Geofence::new(VENUE, 500.0)),
            ..AcquisitionConfig::default()
        };
        let acq = acquirer(provider.clone(), config);

        let err = acq.begin().await.unwrap_err();

        match err {
            LocationError::OutOfGeofence { distance_meters, max_distance_meters } => {
                assert!((distance_meters - 800.0).abs() < 1.0);
                assert_eq!(max_distance_meters, 500.0);
            }
            other => panic!("expected OutOfGeofence, got {other:?}"),
        }
        assert_eq!(provider.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advisory_geofence_reports_distance() {
        let far = offset_north(VENUE, 800.0);
        let provider = Arc::new(ScriptedLocationProvider::new(vec![ScriptedSample::new(0, far, 8.0)]));
        let config = AcquisitionConfig {
            geofence: Some(Geofence::advisory(VENUE, 500.0)),
            ..AcquisitionConfig::default()
        };
        let fix = acquirer(provider, config).begin().await.unwrap();
        assert!(fix.distance_meters.unwrap() > 500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_duration_defers_finalize_to_best() {
        let provider = script(&[(0, 10.0), (1_000, 8.0), (4_000, 3.0)]);
        let config = AcquisitionConfig {
            min_duration: Duration::from_secs(3),
            ..AcquisitionConfig::default()
        };
        let acq = acquirer(provider, config);
        let start = Instant::now();

        let fix = acq.begin().await.unwrap();

        assert_eq!(fix.sample.accuracy_meters, 8.0);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_after_min_duration_finalizes_immediately() {
        let provider = script(&[(0, 50.0), (5_000, 14.0)]);
        let config = AcquisitionConfig {
            min_duration: Duration::from_secs(3),
            ..AcquisitionConfig::default()
        };
        let acq = acquirer(provider, config);
        let start = Instant::now();

        let fix = acq.begin().await.unwrap();

        assert_eq!(fix.sample.accuracy_meters, 14.0);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalizes_exactly_once() {
        let provider = script(&[(0, 12.0), (500, 9.0), (1_000, 4.0)]);
        let acq = acquirer(provider, AcquisitionConfig::default());
        let mut rx = acq.subscribe();

        let fix = acq.begin().await.unwrap();
        assert_eq!(fix.sample.accuracy_meters, 12.0);

        // Remaining script samples must not reach a finished attempt
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().status, AcquisitionStatus::Success(fix));
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_to_idle_and_releases_watch() {
        let provider = Arc::new(ScriptedLocationProvider::silent());
        let acq = Arc::new(acquirer(provider.clone(), AcquisitionConfig::default()));

        let task = tokio::spawn({
            let acq = acq.clone();
            async move { acq.begin().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(acq.state().status, AcquisitionStatus::Acquiring);
        assert_eq!(provider.active_watches(), 1);

        acq.cancel();
        let result = task.await.unwrap();

        assert_eq!(result.unwrap_err(), LocationError::Cancelled);
        assert_eq!(acq.state(), AcquisitionState::idle());
        assert_eq!(provider.active_watches(), 0);
        assert!(!acq.is_acquiring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_permission_prompt_opens_no_watch() {
        let provider = Arc::new(
            ScriptedLocationProvider::new(vec![ScriptedSample::new(0, VENUE, 5.0)])
                .with_permission(PermissionStatus::Undetermined, PermissionStatus::Granted)
                .with_prompt_delay(Duration::from_secs(60)),
        );
        let acq = acquirer(provider.clone(), AcquisitionConfig::default());
        let start = Instant::now();

        let (result, ()) = tokio::join!(acq.begin(), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            acq.cancel();
        });

        assert_eq!(result.unwrap_err(), LocationError::Cancelled);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(provider.permission_requests(), 1);
        assert_eq!(provider.watches_opened(), 0);
        assert_eq!(acq.state(), AcquisitionState::idle());
        assert!(!acq.is_acquiring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_caller_releases_watch() {
        let provider = Arc::new(ScriptedLocationProvider::silent());
        let acq = acquirer(provider.clone(), AcquisitionConfig::default());

        let timed_out = tokio::time::timeout(Duration::from_secs(2), acq.begin()).await;

        assert!(timed_out.is_err());
        assert_eq!(provider.active_watches(), 0);
        assert_eq!(acq.state().status, AcquisitionStatus::Idle);
        assert!(!acq.is_acquiring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_attempt_while_running_is_rejected() {
        let provider = Arc::new(ScriptedLocationProvider::silent());
        let acq = Arc::new(acquirer(provider.clone(), AcquisitionConfig::default()));

        let task = tokio::spawn({
            let acq = acq.clone();
            async move { acq.begin().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(acq.begin().await.unwrap_err(), LocationError::AlreadyAcquiring);
        assert_eq!(acq.state().status, AcquisitionStatus::Acquiring);
        assert_eq!(provider.watches_opened(), 1);

        acq.cancel();
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_denial_skips_sensor() {
        let provider = Arc::new(
            ScriptedLocationProvider::silent()
                .with_permission(PermissionStatus::Denied, PermissionStatus::Granted),
        );
        let acq = acquirer(provider.clone(), AcquisitionConfig::default());

        let err = acq.begin().await.unwrap_err();

        assert_eq!(err, LocationError::PermissionDenied { permanent: true });
        assert!(!err.is_retryable());
        assert_eq!(provider.watches_opened(), 0);
        assert_eq!(provider.permission_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undetermined_permission_prompts_then_proceeds() {
        let provider = Arc::new(
            ScriptedLocationProvider::new(vec![ScriptedSample::new(0, VENUE, 9.0)])
                .with_permission(PermissionStatus::Undetermined, PermissionStatus::Granted),
        );
        let acq = acquirer(provider.clone(), AcquisitionConfig::default());

        assert!(acq.begin().await.is_ok());
        assert_eq!(provider.permission_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismissed_prompt_is_retryable_denial() {
        let provider = Arc::new(
            ScriptedLocationProvider::silent()
                .with_permission(PermissionStatus::Undetermined, PermissionStatus::Undetermined),
        );
        let err = acquirer(provider, AcquisitionConfig::default()).begin().await.unwrap_err();
        assert_eq!(err, LocationError::PermissionDenied { permanent: false });
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_failure_surfaces() {
        let provider = Arc::new(ScriptedLocationProvider::silent().with_sensor_error("gps off"));
        let acq = acquirer(provider, AcquisitionConfig::default());
        let err = acq.begin().await.unwrap_err();
        assert!(matches!(err, LocationError::SensorUnavailable { .. }));
        assert!(!acq.is_acquiring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_starts_clean() {
        let provider = script(&[(0, 9.0)]);
        let acq = acquirer(provider.clone(), AcquisitionConfig::default());

        acq.begin().await.unwrap();
        let fix = acq.retry().await.unwrap();

        assert_eq!(fix.sample.accuracy_meters, 9.0);
        assert_eq!(provider.watches_opened(), 2);
        assert_eq!(provider.active_watches(), 0);
    }
}
