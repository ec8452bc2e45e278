//! Dispatch engine: selects due steps, claims each one atomically, sends it
//! through the delivery transport and records the outcome.
//!
//! A pass never aborts on a single step's delivery failure. Infrastructure
//! errors (the store) stop the pass and propagate after the runs already
//! touched have had their status synchronised.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dripline_core::config::DispatchConfig;
use dripline_core::error::{DriplineError, Result};
use dripline_core::traits::{AutomationStore, DeliveryTransport, DueStepQuery};
use dripline_core::types::{
    AccountId, AutomationRun, AutomationStep, DeliveryRecord, DeliveryStatus, DispatchSummary,
    LeadIdentity, MessageTemplate, new_id,
};

use crate::status::sync_run_status;

/// One year.
const MAX_STALE_CLAIM_MINUTES: u64 = 365 * 24 * 60;

/// Per-pass tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Maximum steps selected by one pass.
    pub batch_size: usize,
    /// Age after which a `Processing` claim is treated as abandoned.
    pub stale_claim: Option<Duration>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl DispatchSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        let stale_claim = (config.stale_claim_minutes > 0)
            .then(|| Duration::minutes(config.stale_claim_minutes.min(MAX_STALE_CLAIM_MINUTES) as i64));
        Self {
            batch_size: config.batch_size.max(1),
            stale_claim,
        }
    }

    fn stale_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.stale_claim.map(|age| now - age)
    }
}

/// A step this pass owns, with the claim instant that fences its final write.
#[derive(Clone, Copy)]
struct ClaimedStep<'a> {
    step: &'a AutomationStep,
    claim: DateTime<Utc>,
}

/// What happened to one selected step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Sent,
    Failed,
    /// Another pass owns the step.
    Skipped,
}

pub struct DispatchEngine {
    store: Arc<dyn AutomationStore>,
    transport: Arc<dyn DeliveryTransport>,
    settings: DispatchSettings,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn AutomationStore>,
        transport: Arc<dyn DeliveryTransport>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    /// Run one dispatch pass for `account`, optionally restricted to a run.
    pub async fn dispatch_due(
        &self,
        account: &AccountId,
        run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DispatchSummary> {
        let stale_before = self.settings.stale_before(now);
        let steps = self
            .store
            .due_steps(&DueStepQuery {
                account: account.clone(),
                run_id: run_id.map(str::to_string),
                now,
                stale_before,
                limit: self.settings.batch_size,
            })
            .await?;

        let mut summary = DispatchSummary {
            matched: steps.len(),
            ..Default::default()
        };
        if steps.is_empty() {
            return Ok(summary);
        }
        tracing::debug!(
            "📬 Dispatch pass for {}: {} due step(s)",
            account,
            steps.len()
        );

        let mut touched: Vec<String> = Vec::new();
        let mut aborted: Option<DriplineError> = None;

        for step in &steps {
            if !touched.contains(&step.run_id) {
                touched.push(step.run_id.clone());
            }
            match self.execute_step(account, step, now, stale_before).await {
                Ok(StepOutcome::Sent) => summary.sent += 1,
                Ok(StepOutcome::Failed) => summary.failed += 1,
                Ok(StepOutcome::Skipped) => {}
                Err(e) => {
                    tracing::error!("❌ Dispatch pass aborted at step {}: {e}", step.id);
                    aborted = Some(e);
                    break;
                }
            }
        }

        for run in &touched {
            if let Err(e) = sync_run_status(self.store.as_ref(), run, now).await {
                if aborted.is_none() {
                    return Err(e);
                }
                tracing::warn!("⚠️ Status sync for run {run} failed: {e}");
            }
        }

        if let Some(e) = aborted {
            return Err(e);
        }

        tracing::info!(
            "📬 Dispatch pass for {}: matched={} sent={} failed={}",
            account,
            summary.matched,
            summary.sent,
            summary.failed
        );
        Ok(summary)
    }

    async fn execute_step(
        &self,
        account: &AccountId,
        step: &AutomationStep,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<StepOutcome> {
        let Some(run) = self.store.get_run(account, &step.run_id).await? else {
            tracing::warn!("⚠️ Step {} has no live run {}", step.id, step.run_id);
            return Ok(StepOutcome::Failed);
        };

        let lead = self.store.get_lead(account, &run.lead_id).await?;
        let template = self.store.get_template(account, &step.template_id).await?;
        let (lead, template) = match (lead, template) {
            (Some(lead), Some(template)) => (lead, template),
            (lead, template) => {
                let reason = match (lead.is_none(), template.is_none()) {
                    (true, true) => "Lead and message template are missing",
                    (true, false) => "Lead is missing",
                    _ => "Message template is missing",
                };
                let err = DriplineError::Integrity(reason.to_string());
                return self.fail_integrity(&run, step, &err, now, stale_before).await;
            }
        };

        let Some(claim) = self.store.claim_step(&step.id, now, stale_before).await? else {
            tracing::debug!("⏭️ Step {} already claimed elsewhere", step.id);
            return Ok(StepOutcome::Skipped);
        };
        let owned = ClaimedStep { step, claim };

        let outcome = match self.transport.send(&template, &lead).await {
            Ok(()) => self.record_sent(&run, owned, &lead, &template, now).await?,
            Err(e) => {
                let message = failure_message(&e);
                self.record_failed(&run, owned, &lead, &template, &message, now)
                    .await?
            }
        };
        self.store.touch_run_executed(&run.id, now).await?;
        Ok(outcome)
    }

    /// Lead or template vanished after enrollment.
    async fn fail_integrity(
        &self,
        run: &AutomationRun,
        step: &AutomationStep,
        err: &DriplineError,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<StepOutcome> {
        let Some(claim) = self.store.claim_step(&step.id, now, stale_before).await? else {
            return Ok(StepOutcome::Skipped);
        };
        tracing::warn!("⚠️ Step {} of run {}: {err}", step.id, run.id);
        if !self
            .store
            .fail_step(&step.id, claim, &failure_message(err), now)
            .await?
        {
            return Ok(StepOutcome::Skipped);
        }
        self.store.mark_run_error(&run.id, now).await?;
        Ok(StepOutcome::Failed)
    }

    async fn record_sent(
        &self,
        run: &AutomationRun,
        ClaimedStep { step, claim }: ClaimedStep<'_>,
        lead: &LeadIdentity,
        template: &MessageTemplate,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let record = DeliveryRecord {
            id: new_id(),
            account_id: run.account_id.clone(),
            step_id: step.id.clone(),
            template_id: template.id.clone(),
            lead_id: lead.id.clone(),
            status: DeliveryStatus::Delivered,
            error: None,
            delivered_at: Some(now),
            errored_at: None,
            created_at: now,
        };
        self.store.insert_delivery(&record).await?;

        if !self
            .store
            .complete_step(&step.id, claim, &record.id, now)
            .await?
        {
            // Our claim was taken over as stale while sending.
            tracing::warn!("⚠️ Step {} was reclaimed before completion", step.id);
            return Ok(StepOutcome::Skipped);
        }
        tracing::info!(
            "✅ Step {} of run {} sent via {}",
            step.step_order,
            run.id,
            self.transport.name()
        );
        Ok(StepOutcome::Sent)
    }

    async fn record_failed(
        &self,
        run: &AutomationRun,
        ClaimedStep { step, claim }: ClaimedStep<'_>,
        lead: &LeadIdentity,
        template: &MessageTemplate,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<StepOutcome> {
        let record = DeliveryRecord {
            id: new_id(),
            account_id: run.account_id.clone(),
            step_id: step.id.clone(),
            template_id: template.id.clone(),
            lead_id: lead.id.clone(),
            status: DeliveryStatus::Error,
            error: Some(message.to_string()),
            delivered_at: None,
            errored_at: Some(now),
            created_at: now,
        };
        self.store.insert_delivery(&record).await?;

        if !self.store.fail_step(&step.id, claim, message, now).await? {
            tracing::warn!("⚠️ Step {} was reclaimed before failure was recorded", step.id);
            return Ok(StepOutcome::Skipped);
        }
        self.store.mark_run_error(&run.id, now).await?;
        tracing::warn!(
            "❌ Step {} of run {} failed via {}: {message}",
            step.step_order,
            run.id,
            self.transport.name()
        );
        Ok(StepOutcome::Failed)
    }
}

/// Message stored on a failed step.
fn failure_message(err: &DriplineError) -> String {
    match err {
        DriplineError::Delivery(msg)
        | DriplineError::Recipient(msg)
        | DriplineError::Integrity(msg) => msg.clone(),
        other => other.to_string(),
    }
}
