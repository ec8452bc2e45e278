//! Enrollment: validate a create-run request and turn it into a run with
//! its ordered, pre-scheduled steps.

use chrono::{DateTime, Duration, Utc};
use dripline_core::error::{DriplineError, Result};
use dripline_core::traits::AutomationStore;
use dripline_core::types::{
    AccountId, AutomationRun, AutomationStep, CreateRunRequest, LeadInput, RunStatus, StepStatus,
    new_id,
};

/// Upper bound on a single step delay (ten years).
pub const MAX_DELAY_MINUTES: i64 = 10 * 365 * 24 * 60;

/// A requested step after normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub step_order: u32,
    pub template_id: String,
    pub delay_minutes: u32,
}

/// Checked and normalised create-run input.
#[derive(Debug, Clone)]
pub struct EnrollmentPlan {
    pub name: Option<String>,
    pub lead: LeadInput,
    pub steps: Vec<PlannedStep>,
    pub start_immediately: bool,
}

impl EnrollmentPlan {
    /// Distinct template ids referenced by the plan, in first-use order.
    pub fn template_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            if !ids.contains(&step.template_id) {
                ids.push(step.template_id.clone());
            }
        }
        ids
    }
}

/// Validate the request shape. Nothing is read from or written to the store.
pub fn plan(request: &CreateRunRequest) -> Result<EnrollmentPlan> {
    let lead = request
        .lead
        .clone()
        .ok_or_else(|| DriplineError::validation("Lead is required"))?;
    crate::lead::validate_lead_input(&lead)?;

    if request.steps.is_empty() {
        return Err(DriplineError::validation("At least one step is required"));
    }

    let mut steps = Vec::with_capacity(request.steps.len());
    for (idx, input) in request.steps.iter().enumerate() {
        let template_id = input.template_id.trim();
        if template_id.is_empty() {
            return Err(DriplineError::validation(format!(
                "Step {} is missing a template id",
                idx + 1
            )));
        }
        let delay = input.delay_minutes.unwrap_or(0.0);
        if delay.is_nan() {
            return Err(DriplineError::validation(format!(
                "Step {} delay is not a number",
                idx + 1
            )));
        }
        let delay = delay.floor().max(0.0);
        if delay > MAX_DELAY_MINUTES as f64 {
            return Err(DriplineError::validation(format!(
                "Step {} delay exceeds {MAX_DELAY_MINUTES} minutes",
                idx + 1
            )));
        }
        steps.push(PlannedStep {
            step_order: idx as u32 + 1,
            template_id: template_id.to_string(),
            delay_minutes: delay as u32,
        });
    }

    if steps
        .windows(2)
        .any(|pair| pair[1].delay_minutes < pair[0].delay_minutes)
    {
        tracing::warn!("⚠️ Step delays are not monotonic; steps will be sent by schedule, not order");
    }

    let name = request
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    Ok(EnrollmentPlan {
        name,
        lead,
        steps,
        start_immediately: request.start_immediately != Some(false),
    })
}

/// Every referenced template must exist, be live and belong to `account`.
pub async fn check_templates(
    store: &dyn AutomationStore,
    account: &AccountId,
    plan: &EnrollmentPlan,
) -> Result<()> {
    let ids = plan.template_ids();
    let found = store.find_templates(account, &ids).await?;
    if found.len() != ids.len() {
        return Err(DriplineError::validation(
            "One or more templates are invalid for this account",
        ));
    }
    Ok(())
}

/// Name used when the caller supplies none.
pub fn default_run_name(now: DateTime<Utc>) -> String {
    format!("Automation run {}", now.format("%Y-%m-%d %H:%M:%S"))
}

/// Materialise the run and its steps. `scheduled_for` is fixed here as
/// `now + delay` and never recomputed.
pub fn build_run(
    account: &AccountId,
    lead_id: &str,
    plan: &EnrollmentPlan,
    now: DateTime<Utc>,
) -> (AutomationRun, Vec<AutomationStep>) {
    let run = AutomationRun {
        id: new_id(),
        account_id: account.as_str().to_string(),
        lead_id: lead_id.to_string(),
        name: plan.name.clone().unwrap_or_else(|| default_run_name(now)),
        status: RunStatus::Active,
        last_executed_at: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    let steps = plan
        .steps
        .iter()
        .map(|step| AutomationStep {
            id: new_id(),
            run_id: run.id.clone(),
            template_id: step.template_id.clone(),
            delivery_id: None,
            step_order: step.step_order,
            delay_minutes: step.delay_minutes,
            scheduled_for: now + Duration::minutes(i64::from(step.delay_minutes)),
            status: StepStatus::Pending,
            sent_at: None,
            claimed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
        .collect();

    (run, steps)
}
