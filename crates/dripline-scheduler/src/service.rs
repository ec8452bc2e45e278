//! Account-scoped entry points: create, list, fetch and dispatch runs.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use dripline_core::error::{DriplineError, Result};
use dripline_core::traits::{AutomationStore, DeliveryTransport};
use dripline_core::types::{AccountId, AutomationRun, CreateRunRequest, DispatchSummary, RunDetail};

use crate::engine::{DispatchEngine, DispatchSettings};
use crate::{enrollment, lead, status};

/// Default and maximum page size of [`AutomationService::list_runs`].
pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

/// Clamp a requested page size into `1..=100`, defaulting to 20.
pub fn clamp_limit(limit: Option<i64>) -> usize {
    match limit {
        None => DEFAULT_LIST_LIMIT,
        Some(n) => n.clamp(1, MAX_LIST_LIMIT as i64) as usize,
    }
}

/// Stored timestamps carry millisecond precision.
fn now_ms() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub struct AutomationService {
    store: Arc<dyn AutomationStore>,
    engine: DispatchEngine,
}

impl AutomationService {
    pub fn new(
        store: Arc<dyn AutomationStore>,
        transport: Arc<dyn DeliveryTransport>,
        settings: DispatchSettings,
    ) -> Self {
        let engine = DispatchEngine::new(store.clone(), transport, settings);
        Self { store, engine }
    }

    pub fn store(&self) -> &Arc<dyn AutomationStore> {
        &self.store
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    /// Enroll a lead into a new run.
    pub async fn create_run(
        &self,
        account: &AccountId,
        request: &CreateRunRequest,
    ) -> Result<RunDetail> {
        self.create_run_at(account, request, now_ms()).await
    }

    /// [`Self::create_run`] with an explicit enrollment time.
    ///
    /// All validation happens before the first write. When the request does
    /// not opt out, due steps of the new run are dispatched before returning.
    pub async fn create_run_at(
        &self,
        account: &AccountId,
        request: &CreateRunRequest,
        now: DateTime<Utc>,
    ) -> Result<RunDetail> {
        let now = now.trunc_subsecs(3);
        let plan = enrollment::plan(request)?;
        enrollment::check_templates(self.store.as_ref(), account, &plan).await?;

        let lead = lead::resolve_lead(self.store.as_ref(), account, &plan.lead, now).await?;
        let (run, steps) = enrollment::build_run(account, &lead.id, &plan, now);
        self.store.insert_run_with_steps(&run, &steps).await?;
        tracing::info!(
            "📝 Run '{}' ({}) created for lead {} with {} step(s)",
            run.name,
            run.id,
            lead.id,
            steps.len()
        );

        if plan.start_immediately {
            let summary = self.engine.dispatch_due(account, Some(&run.id), now).await?;
            tracing::debug!(
                "📬 Immediate dispatch for run {}: sent={} failed={}",
                run.id,
                summary.sent,
                summary.failed
            );
        }

        self.get_run(account, &run.id).await
    }

    /// Most recent runs of `account` with their steps, newest first.
    pub async fn list_runs(&self, account: &AccountId, limit: Option<i64>) -> Result<Vec<RunDetail>> {
        let runs = self.store.list_runs(account, clamp_limit(limit)).await?;
        let mut details = Vec::with_capacity(runs.len());
        for run in runs {
            details.push(self.hydrate(run).await?);
        }
        Ok(details)
    }

    /// One run of `account` with its steps.
    pub async fn get_run(&self, account: &AccountId, run_id: &str) -> Result<RunDetail> {
        let run = self
            .store
            .get_run(account, run_id)
            .await?
            .ok_or_else(|| DriplineError::NotFound("Automation run not found".into()))?;
        self.hydrate(run).await
    }

    /// Dispatch due steps of `account`, optionally restricted to one run.
    pub async fn dispatch_due(
        &self,
        account: &AccountId,
        run_id: Option<&str>,
    ) -> Result<DispatchSummary> {
        self.dispatch_due_at(account, run_id, now_ms()).await
    }

    pub async fn dispatch_due_at(
        &self,
        account: &AccountId,
        run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DispatchSummary> {
        self.engine
            .dispatch_due(account, run_id, now.trunc_subsecs(3))
            .await
    }

    /// Recompute a run's aggregate status. Returns whether it completed.
    pub async fn sync_run_status(&self, run_id: &str) -> Result<bool> {
        status::sync_run_status(self.store.as_ref(), run_id, now_ms()).await
    }

    async fn hydrate(&self, run: AutomationRun) -> Result<RunDetail> {
        let steps = self.store.steps_for_run(&run.id).await?;
        Ok(RunDetail { run, steps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), 20);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-5)), 1);
        assert_eq!(clamp_limit(Some(50)), 50);
        assert_eq!(clamp_limit(Some(1_000)), 100);
    }
}
