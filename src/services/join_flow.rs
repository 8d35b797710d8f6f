//! Locate-then-join flow
//!
//! Queue selection is a plain state transition: `start` acquires a fix, joins
//! with it and returns the next step for the caller to present. A failed fix
//! yields `LocationRequired`, which says whether "join anyway" is on offer
//! under the configured `JoinPolicy`.

use crate::domain::types::{QueueSession, QueueType};
use crate::error::{JoinError, LocationError};
use crate::infra::config::JoinPolicy;
use crate::services::location_acquirer::{Fix, LocationAcquirer};
use crate::services::session_manager::SessionManager;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum JoinStep {
    Joined(QueueSession),
    /// Acquisition failed; the caller may retry, or join without a fix when allowed
    LocationRequired { error: LocationError, can_join_without_location: bool },
    Failed(JoinError),
}

pub struct JoinFlow {
    acquirer: Arc<LocationAcquirer>,
    sessions: SessionManager,
    policy: JoinPolicy,
}

impl JoinFlow {
    pub fn new(acquirer: Arc<LocationAcquirer>, sessions: SessionManager, policy: JoinPolicy) -> Self {
        Self { acquirer, sessions, policy }
    }

    pub fn policy(&self) -> JoinPolicy {
        self.policy
    }

    pub async fn start(&self, queue_type: QueueType) -> JoinStep {
        info!(queue_type = %queue_type, "join_flow_started");
        let fix = self.acquirer.begin().await;
        self.finish(queue_type, fix).await
    }

    /// Run a fresh acquisition after a `LocationRequired` step
    pub async fn retry(&self, queue_type: QueueType) -> JoinStep {
        let fix = self.acquirer.retry().await;
        self.finish(queue_type, fix).await
    }

    /// The "join anyway" continuation
    pub async fn join_without_location(&self, queue_type: QueueType) -> Result<QueueSession, JoinError> {
        if self.policy != JoinPolicy::AllowWithoutFix {
            return Err(JoinError::LocationRequired);
        }
        info!(queue_type = %queue_type, "joining_without_location");
        Ok(self.sessions.join(queue_type, None).await?)
    }

    /// Abandon a running acquisition
    pub fn cancel(&self) {
        self.acquirer.cancel();
    }

    async fn finish(&self, queue_type: QueueType, fix: Result<Fix, LocationError>) -> JoinStep {
        match fix {
            Ok(fix) => match self.sessions.join(queue_type, Some(fix.sample.coordinate)).await {
                Ok(session) => JoinStep::Joined(session),
                Err(e) => JoinStep::Failed(e.into()),
            },
            Err(e @ (LocationError::Cancelled | LocationError::AlreadyAcquiring)) => {
                JoinStep::Failed(e.into())
            }
            Err(error) => {
                let can_join_without_location = self.allows_join_anyway(&error);
                JoinStep::LocationRequired { error, can_join_without_location }
            }
        }
    }

    /// Join anyway is offered for sensor trouble, never for being outside the venue
    fn allows_join_anyway(&self, error: &LocationError) -> bool {
        self.policy == JoinPolicy::AllowWithoutFix
            && error.is_retryable()
            && !matches!(error, LocationError::OutOfGeofence { .. })
    }
}
