//! Domain records shared by the store, the transports and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DriplineError, Result};

/// Trait map attached to a lead. Keys are merged on write, never replaced wholesale.
pub type Traits = serde_json::Map<String, serde_json::Value>;

/// Generate a fresh record id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ─── Account context ──────────────────────────────────────

/// The authenticated account every entry point is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Parse an account id handed over by the authentication layer.
    /// Blank input fails closed.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DriplineError::Unauthorized(
                "missing account context".into(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Status enums ──────────────────────────────────────

/// Aggregate status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Active,
    Paused,
    Completed,
    /// Sticky: set on the first failed step and never cleared automatically.
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for RunStatus {
    type Err = DriplineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            other => Err(DriplineError::Database(format!("unknown run status '{other}'"))),
        }
    }
}

/// Per-step execution status.
///
/// `Pending → Processing → {Sent | Error}`; the last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Processing,
    Sent,
    Error,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for StepStatus {
    type Err = DriplineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "SENT" => Ok(Self::Sent),
            "ERROR" => Ok(Self::Error),
            other => Err(DriplineError::Database(format!("unknown step status '{other}'"))),
        }
    }
}

/// Outcome recorded for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Delivered,
    Error,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "DELIVERED",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = DriplineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DELIVERED" => Ok(Self::Delivered),
            "ERROR" => Ok(Self::Error),
            other => Err(DriplineError::Database(format!(
                "unknown delivery status '{other}'"
            ))),
        }
    }
}

// ─── Records ──────────────────────────────────────

/// One lead's enrollment in an ordered messaging sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRun {
    pub id: String,
    pub account_id: String,
    pub lead_id: String,
    pub name: String,
    pub status: RunStatus,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One scheduled message within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationStep {
    pub id: String,
    pub run_id: String,
    pub template_id: String,
    /// Delivery record written when the step was sent.
    pub delivery_id: Option<String>,
    /// 1-based position in the run.
    pub step_order: u32,
    pub delay_minutes: u32,
    /// Enrollment time + `delay_minutes`, fixed at creation.
    pub scheduled_for: DateTime<Utc>,
    pub status: StepStatus,
    pub sent_at: Option<DateTime<Utc>>,
    /// When the step last moved to `Processing`.
    pub claimed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Account-scoped message recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadIdentity {
    pub id: String,
    pub account_id: String,
    pub external_id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default)]
    pub traits: Traits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Message content a step sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MessageTemplate {
    pub fn new(account: &AccountId, name: &str, subject: &str, body: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            account_id: account.as_str().to_string(),
            name: name.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Persisted result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub account_id: String,
    pub step_id: String,
    pub template_id: String,
    pub lead_id: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub errored_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A run hydrated with its steps in step order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: AutomationRun,
    pub steps: Vec<AutomationStep>,
}

// ─── Requests & results ──────────────────────────────────────

/// Lead fields supplied with an enrollment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadInput {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "externalId")]
    pub external_id: Option<String>,
    #[serde(default, alias = "firstName")]
    pub first_name: Option<String>,
    #[serde(default, alias = "lastName")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub traits: Traits,
}

/// One requested step. Its position in the request defines its order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    #[serde(alias = "templateId", alias = "emailId")]
    pub template_id: String,
    /// Negative or missing delays are treated as zero, fractions are floored.
    #[serde(default, alias = "delayMinutes")]
    pub delay_minutes: Option<f64>,
}

/// Body of a create-run call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub lead: Option<LeadInput>,
    #[serde(default)]
    pub steps: Vec<StepInput>,
    /// Dispatch due steps before returning unless explicitly `false`.
    #[serde(default, alias = "startImmediately")]
    pub start_immediately: Option<bool>,
}

/// Counts reported by one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub matched: usize,
    pub sent: usize,
    pub failed: usize,
}
