//! Queue session lifecycle
//!
//! `SessionManager` is the only writer of the client's `QueueSession` mirror.
//! It keeps the periodic position reporter running exactly while a
//! non-terminal session exists. Mutating calls (join, checkpoint, result,
//! leave) are each guarded by an in-flight flag: a concurrent duplicate fails
//! fast with `ApiError::InProgress` and issues no network request.
//!
//! Answers that arrive after the local session moved on are not mirrored:
//! a fetch is dropped if anything was stored while it was in flight, a join
//! is dropped if the user left meanwhile, and a result is dropped unless the
//! same session is still held.

use crate::domain::types::{Coordinate, QueueOutcome, QueueSession, QueueType};
use crate::error::ApiError;
use crate::infra::config::SessionConfig;
use crate::infra::metrics::Metrics;
use crate::io::estimation_client::{CheckpointAck, EstimationClient, PositionReport};
use crate::io::location_provider::{sample_once, DeviceLocationProvider, WatchConfig};
use crate::services::position_reporter::PositionReporter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// RAII in-flight flag
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool, op: &'static str) -> Result<Self, ApiError> {
        if flag.swap(true, Ordering::AcqRel) {
            debug!(op = %op, "session_op_in_progress");
            return Err(ApiError::InProgress(op));
        }
        Ok(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    client: Arc<dyn EstimationClient>,
    provider: Arc<dyn DeviceLocationProvider>,
    config: SessionConfig,
    watch_config: WatchConfig,
    metrics: Arc<Metrics>,
    session: Mutex<Option<QueueSession>>,
    /// Bumped under the session lock on every replacement
    generation: AtomicU64,
    /// Bumped under the session lock by leave and reset
    departures: AtomicU64,
    reporter: Mutex<Option<PositionReporter>>,
    joining: AtomicBool,
    checkpointing: AtomicBool,
    submitting: AtomicBool,
    leaving: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(reporter) = self.reporter.get_mut().take() {
            reporter.stop();
        }
    }
}

/// Cheap-to-clone handle; the reporter stops when the last handle is dropped
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        client: Arc<dyn EstimationClient>,
        provider: Arc<dyn DeviceLocationProvider>,
        config: SessionConfig,
        watch_config: WatchConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                provider,
                config,
                watch_config,
                metrics,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                departures: AtomicU64::new(0),
                reporter: Mutex::new(None),
                joining: AtomicBool::new(false),
                checkpointing: AtomicBool::new(false),
                submitting: AtomicBool::new(false),
                leaving: AtomicBool::new(false),
            }),
        }
    }

    pub fn club_slug(&self) -> &str {
        &self.inner.config.club_slug
    }

    /// Local mirror of the session, if any
    pub fn current(&self) -> Option<QueueSession> {
        self.inner.session.lock().clone()
    }

    pub fn has_active_session(&self) -> bool {
        self.inner.session.lock().as_ref().is_some_and(|s| !s.is_terminal())
    }

    pub fn is_reporting(&self) -> bool {
        self.inner.reporter.lock().as_ref().is_some_and(|r| r.is_running())
    }

    /// Join a queue. `coordinate` is the validated fix, if one was required.
    pub async fn join(
        &self,
        queue_type: QueueType,
        coordinate: Option<Coordinate>,
    ) -> Result<QueueSession, ApiError> {
        let _flight = InFlight::acquire(&self.inner.joining, "join")?;
        let departed = {
            let slot = self.inner.session.lock();
            if slot.as_ref().is_some_and(|s| !s.is_terminal()) {
                return Err(ApiError::AlreadyInQueue);
            }
            self.inner.departures.load(Ordering::Acquire)
        };

        let club = &self.inner.config.club_slug;
        match self.inner.client.join(club, queue_type, coordinate).await {
            Ok(session) => {
                info!(
                    session_id = %session.id,
                    queue_type = %session.queue_type,
                    with_location = %coordinate.is_some(),
                    "queue_joined"
                );
                self.inner.metrics.record_join();
                let kept = self.replace_if(Some(session.clone()), |_| {
                    self.inner.departures.load(Ordering::Acquire) == departed
                });
                if !kept {
                    info!(session_id = %session.id, "queue_join_superseded_by_leave");
                }
                Ok(session)
            }
            Err(e) => {
                warn!(club = %club, error = %e, "queue_join_failed");
                Err(e)
            }
        }
    }

    /// Refresh from the server. A missing remote session clears the local one.
    pub async fn fetch_session(&self) -> Result<Option<QueueSession>, ApiError> {
        let seen = self.inner.generation.load(Ordering::Acquire);
        let remote = match self.inner.client.fetch_session().await {
            Ok(remote) => remote,
            Err(ApiError::SessionNotFound) => None,
            Err(e) => {
                warn!(error = %e, "session_fetch_failed");
                return Err(e);
            }
        };

        let merged = {
            let mut slot = self.inner.session.lock();
            if self.inner.generation.load(Ordering::Acquire) != seen {
                debug!("session_fetch_superseded");
                return Ok(slot.clone());
            }
            let merged = match (remote, slot.as_ref()) {
                // A recorded result is final
                (Some(remote), Some(local)) if local.id == remote.id && local.is_terminal() => {
                    Some(local.clone())
                }
                (Some(mut remote), Some(local)) if local.id == remote.id => {
                    if remote.last_marker_id.is_none() {
                        remote.last_marker_id = local.last_marker_id;
                    }
                    Some(remote)
                }
                (remote, _) => remote,
            };
            *slot = merged.clone();
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            merged
        };
        self.sync_reporter();

        match &merged {
            Some(session) => debug!(session_id = %session.id, "session_synced"),
            None => debug!("session_absent_remotely"),
        }
        Ok(merged)
    }

    /// Best-effort telemetry. No-op without an active session; failures are logged only.
    pub async fn report_position(&self, report: impl Into<PositionReport>) {
        if !self.has_active_session() {
            return;
        }
        match self.inner.client.report_position(report.into()).await {
            Ok(()) => {
                self.inner.metrics.record_position_report(true);
                debug!("position_reported");
            }
            Err(e) => {
                self.inner.metrics.record_position_report(false);
                warn!(error = %e, "position_report_failed");
            }
        }
    }

    /// Confirm passing a landmark. `Ok(None)` when there is no active session.
    pub async fn submit_checkpoint(&self, marker_id: Uuid) -> Result<Option<CheckpointAck>, ApiError> {
        let _flight = InFlight::acquire(&self.inner.checkpointing, "checkpoint")?;
        let Some(session_id) = self.active_session_id() else {
            return Ok(None);
        };

        let ack = self.inner.client.submit_checkpoint(marker_id).await.map_err(|e| {
            warn!(marker_id = %marker_id, error = %e, "checkpoint_failed");
            e
        })?;

        if ack.success {
            let mut guard = self.inner.session.lock();
            if let Some(session) = guard.as_mut().filter(|s| s.id == session_id && !s.is_terminal()) {
                session.last_marker_id = Some(marker_id);
            }
        }
        self.inner.metrics.record_checkpoint();
        info!(
            marker_id = %marker_id,
            estimated_wait_minutes = ?ack.estimated_wait_minutes,
            "checkpoint_recorded"
        );
        Ok(Some(ack))
    }

    /// Report the outcome. Terminal only after the server acknowledges;
    /// an already-terminal session is returned as is.
    pub async fn submit_result(&self, outcome: QueueOutcome) -> Result<QueueSession, ApiError> {
        let _flight = InFlight::acquire(&self.inner.submitting, "result")?;
        let local = self.current().ok_or(ApiError::SessionNotFound)?;
        if local.is_terminal() {
            debug!(session_id = %local.id, "result_already_recorded");
            return Ok(local);
        }

        let mut session = self.inner.client.submit_result(outcome).await.map_err(|e| {
            warn!(session_id = %local.id, error = %e, "result_submit_failed");
            e
        })?;
        session.result = session.result.or(Some(outcome.into()));
        if session.last_marker_id.is_none() {
            session.last_marker_id = local.last_marker_id;
        }

        info!(
            session_id = %session.id,
            result = %outcome.as_str(),
            wait_minutes = ?session.wait_duration_minutes,
            "queue_result_recorded"
        );
        self.inner.metrics.record_result();
        let kept = self.replace_if(Some(session.clone()), |slot| {
            slot.as_ref().is_some_and(|held| held.id == local.id)
        });
        if !kept {
            debug!(session_id = %local.id, "queue_result_not_mirrored");
        }
        Ok(session)
    }

    /// Leave the queue. Local state is cleared before the server answers.
    pub async fn leave(&self) -> Result<(), ApiError> {
        let _flight = InFlight::acquire(&self.inner.leaving, "leave")?;
        let previous = self.depart();
        self.inner.metrics.record_leave();

        match self.inner.client.leave_queue().await {
            Ok(()) => {
                info!(session_id = ?previous.as_ref().map(|s| s.id), "queue_left");
                Ok(())
            }
            Err(ApiError::SessionNotFound) if previous.is_none() => Ok(()),
            Err(e) => {
                warn!(error = %e, "queue_leave_failed");
                Err(e)
            }
        }
    }

    /// Forget the local session (logout). No network call.
    pub fn reset(&self) {
        self.depart();
        info!("session_reset");
    }

    /// Stop background reporting for owner teardown; local state is kept.
    pub fn shutdown(&self) {
        if let Some(reporter) = self.inner.reporter.lock().take() {
            reporter.stop();
            info!("session_manager_shutdown");
        }
    }

    fn active_session_id(&self) -> Option<Uuid> {
        self.inner.session.lock().as_ref().filter(|s| !s.is_terminal()).map(|s| s.id)
    }

    /// Replace the local session if `still_valid` holds for the current one
    fn replace_if(
        &self,
        session: Option<QueueSession>,
        still_valid: impl FnOnce(&Option<QueueSession>) -> bool,
    ) -> bool {
        {
            let mut slot = self.inner.session.lock();
            if !still_valid(&slot) {
                return false;
            }
            *slot = session;
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.sync_reporter();
        true
    }

    /// Clear the local session on leave or logout
    fn depart(&self) -> Option<QueueSession> {
        let previous = {
            let mut slot = self.inner.session.lock();
            self.inner.departures.fetch_add(1, Ordering::AcqRel);
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            slot.take()
        };
        self.sync_reporter();
        previous
    }

    /// Start or stop the reporter so it runs iff a non-terminal session exists
    fn sync_reporter(&self) {
        let should_run = self.has_active_session();
        let mut reporter = self.inner.reporter.lock();
        let running = reporter.as_ref().is_some_and(|r| r.is_running());
        if should_run == running {
            return;
        }
        if let Some(stale) = reporter.take() {
            stale.stop();
        }
        if should_run {
            *reporter = Some(self.spawn_reporter());
        }
    }

    fn spawn_reporter(&self) -> PositionReporter {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        PositionReporter::spawn(self.inner.config.report_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                SessionManager { inner }.report_tick().await;
                true
            }
        })
    }

    /// One reporter tick: take a single sample and send it
    async fn report_tick(&self) {
        if !self.has_active_session() {
            return;
        }
        let sample = sample_once(
            self.inner.provider.as_ref(),
            self.inner.watch_config,
            self.inner.config.sample_timeout,
        )
        .await;

        match sample {
            Some(sample) => self.report_position(&sample).await,
            None => {
                self.inner.metrics.record_position_report_skipped();
                debug!("position_tick_skipped_no_sample");
            }
        }
    }
}
