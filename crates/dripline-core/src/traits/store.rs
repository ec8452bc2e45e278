//! Persistence contract for runs, steps, leads, templates and deliveries.
//!
//! Every implementation must hide soft-deleted rows (`deleted_at` set) from
//! every read and every write below. Callers never filter on it themselves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    AccountId, AutomationRun, AutomationStep, DeliveryRecord, LeadIdentity, MessageTemplate,
    Traits,
};

/// Parameters of the due-step selection.
#[derive(Debug, Clone)]
pub struct DueStepQuery {
    pub account: AccountId,
    pub run_id: Option<String>,
    pub now: DateTime<Utc>,
    /// `Processing` steps claimed at or before this instant are treated as abandoned.
    pub stale_before: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Field changes applied when an existing lead is enrolled again.
/// `None` keeps the stored value. Each top-level key of `traits` replaces
/// the stored value for that key, `null` included.
#[derive(Debug, Clone, Default)]
pub struct LeadUpdate {
    pub email: Option<String>,
    pub external_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub traits: Traits,
}

#[async_trait]
pub trait AutomationStore: Send + Sync {
    // ─── Templates ──────────────────────────────────────

    async fn insert_template(&self, template: &MessageTemplate) -> Result<()>;

    async fn get_template(&self, account: &AccountId, id: &str)
    -> Result<Option<MessageTemplate>>;

    /// Templates of `account` whose id is in `ids`, without duplicates.
    async fn find_templates(
        &self,
        account: &AccountId,
        ids: &[String],
    ) -> Result<Vec<MessageTemplate>>;

    async fn soft_delete_template(
        &self,
        account: &AccountId,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // ─── Leads ──────────────────────────────────────

    /// Look a lead up by external id first, then by email.
    async fn find_lead(
        &self,
        account: &AccountId,
        external_id: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<LeadIdentity>>;

    async fn get_lead(&self, account: &AccountId, id: &str) -> Result<Option<LeadIdentity>>;

    /// Insert a new lead. Returns `false` if another lead with the same
    /// `(account_id, external_id)` won the race.
    async fn insert_lead(&self, lead: &LeadIdentity) -> Result<bool>;

    /// Apply `update` atomically and return the stored result.
    async fn merge_lead(
        &self,
        id: &str,
        update: &LeadUpdate,
        now: DateTime<Utc>,
    ) -> Result<LeadIdentity>;

    async fn soft_delete_lead(
        &self,
        account: &AccountId,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // ─── Runs & steps ──────────────────────────────────────

    /// Insert a run and all of its steps atomically.
    async fn insert_run_with_steps(
        &self,
        run: &AutomationRun,
        steps: &[AutomationStep],
    ) -> Result<()>;

    async fn get_run(&self, account: &AccountId, id: &str) -> Result<Option<AutomationRun>>;

    /// Unscoped lookup used by status synchronisation.
    async fn get_run_by_id(&self, id: &str) -> Result<Option<AutomationRun>>;

    /// Runs of `account`, newest first.
    async fn list_runs(&self, account: &AccountId, limit: usize) -> Result<Vec<AutomationRun>>;

    /// Steps of a run in step order.
    async fn steps_for_run(&self, run_id: &str) -> Result<Vec<AutomationStep>>;

    /// Soft-delete a run together with its steps.
    async fn soft_delete_run(
        &self,
        account: &AccountId,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // ─── Dispatch ──────────────────────────────────────

    /// Due steps ordered by `scheduled_for`, then `step_order`, capped at `query.limit`.
    async fn due_steps(&self, query: &DueStepQuery) -> Result<Vec<AutomationStep>>;

    /// Accounts owning at least one due step.
    async fn accounts_with_due_steps(
        &self,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<AccountId>>;

    /// Move a step to `Processing` if it is still `Pending` (or abandoned).
    /// Returns the stored claim instant, or `None` when another pass already
    /// owns the step.
    async fn claim_step(
        &self,
        step_id: &str,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// `Processing → Sent`, only while `claimed_at` still owns the step.
    async fn complete_step(
        &self,
        step_id: &str,
        claimed_at: DateTime<Utc>,
        delivery_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// `Processing → Error`, only while `claimed_at` still owns the step.
    async fn fail_step(
        &self,
        step_id: &str,
        claimed_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn mark_run_error(&self, run_id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn touch_run_executed(&self, run_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Steps of a run still `Pending` or `Processing`.
    async fn count_open_steps(&self, run_id: &str) -> Result<u64>;

    /// Mark a run `Completed` unless it is `Error`, already `Completed`, or
    /// still has open steps. Returns whether a row changed.
    async fn complete_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn insert_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    async fn deliveries_for_step(&self, step_id: &str) -> Result<Vec<DeliveryRecord>>;
}
