//! Result callbacks.
//!
//! When an execution succeeds and its unit has a `callback_url`, the
//! consistent result view is POSTed there. Delivery is at-most-once: a failed
//! POST is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::ResultAggregator;
use crate::core::{
    ExecutionId, ExecutionInstance, ExecutionStatus, IntegrationId, IterationId, SchedulableUnit,
    TenantId, UnitId, UnitType,
};
use crate::metrics;

/// Errors from delivering a callback.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("callback endpoint returned status {0}")]
    Status(u16),
}

/// One execution in a callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackJob {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub partial: bool,
    pub iteration_ts: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
}

impl From<&ExecutionInstance> for CallbackJob {
    fn from(execution: &ExecutionInstance) -> Self {
        Self {
            execution_id: execution.id.clone(),
            status: execution.status,
            partial: execution.partial,
            iteration_ts: execution.iteration_ts,
            result: execution.result.clone(),
        }
    }
}

/// Body POSTed to a unit's callback URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    pub trigger_id: UnitId,
    pub trigger_type: UnitType,
    pub tenant_id: TenantId,
    pub integration_id: Option<IntegrationId>,
    pub iteration_id: IterationId,
    pub jobs: Vec<CallbackJob>,
}

/// Delivers an envelope to a URL.
#[async_trait]
pub trait CallbackDispatcher: Send + Sync {
    async fn deliver(&self, url: &str, envelope: &CallbackEnvelope) -> Result<(), CallbackError>;
}

/// JSON-over-HTTP dispatcher.
#[derive(Debug, Clone)]
pub struct HttpCallback {
    client: reqwest::Client,
}

impl HttpCallback {
    pub fn new(timeout: Duration) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CallbackDispatcher for HttpCallback {
    async fn deliver(&self, url: &str, envelope: &CallbackEnvelope) -> Result<(), CallbackError> {
        let response = self.client.post(url).json(envelope).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CallbackError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Builds and sends callbacks for successful executions.
#[derive(Clone)]
pub struct ResultNotifier {
    results: ResultAggregator,
    dispatcher: Arc<dyn CallbackDispatcher>,
}

impl ResultNotifier {
    pub fn new(results: ResultAggregator, dispatcher: Arc<dyn CallbackDispatcher>) -> Self {
        Self {
            results,
            dispatcher,
        }
    }

    /// Envelope for a success of `unit`.
    ///
    /// Carries the consistent result view, or just `execution` when the unit
    /// has no full success yet.
    pub async fn envelope(
        &self,
        unit: &SchedulableUnit,
        execution: &ExecutionInstance,
    ) -> CallbackEnvelope {
        let view = match self.results.latest_results(&unit.id, false).await {
            Ok(view) => view,
            Err(e) => {
                warn!(unit_id = %unit.id, error = %e, "failed to load results for callback");
                Vec::new()
            }
        };
        let jobs = if view.is_empty() {
            vec![CallbackJob::from(execution)]
        } else {
            view.iter().map(CallbackJob::from).collect()
        };

        CallbackEnvelope {
            trigger_id: unit.id.clone(),
            trigger_type: unit.unit_type.clone(),
            tenant_id: unit.tenant_id.clone(),
            integration_id: unit.integration_id.clone(),
            iteration_id: execution.iteration_id.clone(),
            jobs,
        }
    }

    /// Send the callback, if the unit has a URL. Never fails.
    pub async fn notify(&self, unit: &SchedulableUnit, execution: &ExecutionInstance) {
        let Some(url) = unit.callback_url.as_deref() else {
            return;
        };
        let envelope = self.envelope(unit, execution).await;

        match self.dispatcher.deliver(url, &envelope).await {
            Ok(()) => {
                metrics::record_callback(true);
                debug!(unit_id = %unit.id, execution_id = %execution.id, "callback delivered");
            }
            Err(e) => {
                metrics::record_callback(false);
                warn!(
                    unit_id = %unit.id,
                    execution_id = %execution.id,
                    url,
                    error = %e,
                    "callback failed, dropping"
                );
            }
        }
    }
}
