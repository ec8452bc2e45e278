//! SQLite store — runs, steps, leads, templates and delivery records.
//!
//! Soft-deleted rows (`deleted_at IS NOT NULL`) are invisible to every
//! statement in this file, reads and writes alike.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dripline_core::error::{DriplineError, Result};
use dripline_core::traits::{AutomationStore, DueStepQuery, LeadUpdate};
use dripline_core::types::{
    AccountId, AutomationRun, AutomationStep, DeliveryRecord, LeadIdentity, MessageTemplate,
    Traits,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::rows::{
    DELIVERY_COLUMNS, LEAD_COLUMNS, RUN_COLUMNS, STEP_COLUMNS, TEMPLATE_COLUMNS, format_ts,
    parse_ts, row_to_delivery, row_to_lead, row_to_run, row_to_step, row_to_template,
};
use crate::schema;

fn db_err(ctx: &'static str) -> impl Fn(rusqlite::Error) -> DriplineError {
    move |e| DriplineError::Database(format!("{ctx}: {e}"))
}

/// SQLite-backed automation store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;

        // WAL: the poll loop and CLI invocations share one file
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err("DB pragma"))?;

        Self::init(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err("DB pragma"))?;
        schema::migrate(&conn).map_err(db_err("Migration"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DriplineError::Database(format!("DB lock poisoned: {e}")))
    }
}

#[async_trait]
impl AutomationStore for SqliteStore {
    // ─── Templates ──────────────────────────────────────

    async fn insert_template(&self, template: &MessageTemplate) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO message_templates
             (id, account_id, name, subject, body, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                template.id,
                template.account_id,
                template.name,
                template.subject,
                template.body,
                format_ts(template.created_at),
                format_ts(template.updated_at),
                template.deleted_at.map(format_ts),
            ],
        )
        .map_err(db_err("Insert template"))?;
        Ok(())
    }

    async fn get_template(
        &self,
        account: &AccountId,
        id: &str,
    ) -> Result<Option<MessageTemplate>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {TEMPLATE_COLUMNS} FROM message_templates
                 WHERE id = ?1 AND account_id = ?2 AND deleted_at IS NULL"
            ),
            params![id, account.as_str()],
            row_to_template,
        )
        .optional()
        .map_err(db_err("Get template"))
    }

    async fn find_templates(
        &self,
        account: &AccountId,
        ids: &[String],
    ) -> Result<Vec<MessageTemplate>> {
        let mut unique: Vec<&str> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(&id.as_str()) {
                unique.push(id);
            }
        }
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..unique.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {TEMPLATE_COLUMNS} FROM message_templates
             WHERE account_id = ?1 AND deleted_at IS NULL AND id IN ({placeholders})"
        );

        let mut values = vec![account.as_str()];
        values.extend(unique);

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(db_err("Find templates"))?;
        let rows = stmt
            .query_map(params_from_iter(values), row_to_template)
            .map_err(db_err("Find templates"))?;
        let templates = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Find templates"))?;
        Ok(templates)
    }

    async fn soft_delete_template(
        &self,
        account: &AccountId,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE message_templates SET deleted_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND account_id = ?2 AND deleted_at IS NULL",
                params![id, account.as_str(), format_ts(now)],
            )
            .map_err(db_err("Delete template"))?;
        Ok(changed > 0)
    }

    // ─── Leads ──────────────────────────────────────

    async fn find_lead(
        &self,
        account: &AccountId,
        external_id: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<LeadIdentity>> {
        let conn = self.lock()?;

        if let Some(external_id) = external_id {
            let found = conn
                .query_row(
                    &format!(
                        "SELECT {LEAD_COLUMNS} FROM leads
                         WHERE account_id = ?1 AND external_id = ?2 AND deleted_at IS NULL"
                    ),
                    params![account.as_str(), external_id],
                    row_to_lead,
                )
                .optional()
                .map_err(db_err("Find lead"))?;
            if found.is_some() {
                return Ok(found);
            }
        }

        match email {
            Some(email) => conn
                .query_row(
                    &format!(
                        "SELECT {LEAD_COLUMNS} FROM leads
                         WHERE account_id = ?1 AND email = ?2 AND deleted_at IS NULL
                         ORDER BY created_at LIMIT 1"
                    ),
                    params![account.as_str(), email],
                    row_to_lead,
                )
                .optional()
                .map_err(db_err("Find lead")),
            None => Ok(None),
        }
    }

    async fn get_lead(&self, account: &AccountId, id: &str) -> Result<Option<LeadIdentity>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads
                 WHERE id = ?1 AND account_id = ?2 AND deleted_at IS NULL"
            ),
            params![id, account.as_str()],
            row_to_lead,
        )
        .optional()
        .map_err(db_err("Get lead"))
    }

    async fn insert_lead(&self, lead: &LeadIdentity) -> Result<bool> {
        let traits = serde_json::to_string(&lead.traits)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT INTO leads
                 (id, account_id, external_id, email, first_name, last_name, traits, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT DO NOTHING",
                params![
                    lead.id,
                    lead.account_id,
                    lead.external_id,
                    lead.email,
                    lead.first_name,
                    lead.last_name,
                    traits,
                    format_ts(lead.created_at),
                    format_ts(lead.updated_at),
                ],
            )
            .map_err(db_err("Insert lead"))?;
        Ok(changed > 0)
    }

    async fn merge_lead(
        &self,
        id: &str,
        update: &LeadUpdate,
        now: DateTime<Utc>,
    ) -> Result<LeadIdentity> {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock before the read, so a concurrent
        // enrollment cannot slip between the SELECT and the UPDATE
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin lead merge"))?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT traits FROM leads WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Merge lead"))?;
        let Some(stored) = stored else {
            return Err(DriplineError::NotFound(format!("lead {id}")));
        };

        // shallow: each incoming key replaces the stored value as a whole
        let mut traits: Traits = serde_json::from_str(&stored)?;
        for (key, value) in &update.traits {
            traits.insert(key.clone(), value.clone());
        }

        tx.execute(
            "UPDATE leads SET
                email = COALESCE(?2, email),
                external_id = COALESCE(?3, external_id),
                first_name = COALESCE(?4, first_name),
                last_name = COALESCE(?5, last_name),
                traits = ?6,
                updated_at = ?7
             WHERE id = ?1 AND deleted_at IS NULL",
            params![
                id,
                update.email,
                update.external_id,
                update.first_name,
                update.last_name,
                serde_json::to_string(&traits)?,
                format_ts(now),
            ],
        )
        .map_err(db_err("Merge lead"))?;

        let lead = tx
            .query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id],
                row_to_lead,
            )
            .map_err(db_err("Reload lead"))?;
        tx.commit().map_err(db_err("Commit lead merge"))?;
        Ok(lead)
    }

    async fn soft_delete_lead(
        &self,
        account: &AccountId,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE leads SET deleted_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND account_id = ?2 AND deleted_at IS NULL",
                params![id, account.as_str(), format_ts(now)],
            )
            .map_err(db_err("Delete lead"))?;
        Ok(changed > 0)
    }

    // ─── Runs & steps ──────────────────────────────────────

    async fn insert_run_with_steps(
        &self,
        run: &AutomationRun,
        steps: &[AutomationStep],
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin run insert"))?;

        tx.execute(
            "INSERT INTO automation_runs
             (id, account_id, lead_id, name, status, last_executed_at, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id,
                run.account_id,
                run.lead_id,
                run.name,
                run.status.as_str(),
                run.last_executed_at.map(format_ts),
                format_ts(run.created_at),
                format_ts(run.updated_at),
                run.deleted_at.map(format_ts),
            ],
        )
        .map_err(db_err("Insert run"))?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO automation_steps
                     (id, run_id, template_id, delivery_id, step_order, delay_minutes, scheduled_for,
                      status, sent_at, claimed_at, error, created_at, updated_at, deleted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )
                .map_err(db_err("Insert step"))?;
            for step in steps {
                stmt.execute(params![
                    step.id,
                    step.run_id,
                    step.template_id,
                    step.delivery_id,
                    step.step_order,
                    step.delay_minutes,
                    format_ts(step.scheduled_for),
                    step.status.as_str(),
                    step.sent_at.map(format_ts),
                    step.claimed_at.map(format_ts),
                    step.error,
                    format_ts(step.created_at),
                    format_ts(step.updated_at),
                    step.deleted_at.map(format_ts),
                ])
                .map_err(db_err("Insert step"))?;
            }
        }

        tx.commit().map_err(db_err("Commit run insert"))?;
        Ok(())
    }

    async fn get_run(&self, account: &AccountId, id: &str) -> Result<Option<AutomationRun>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM automation_runs
                 WHERE id = ?1 AND account_id = ?2 AND deleted_at IS NULL"
            ),
            params![id, account.as_str()],
            row_to_run,
        )
        .optional()
        .map_err(db_err("Get run"))
    }

    async fn get_run_by_id(&self, id: &str) -> Result<Option<AutomationRun>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM automation_runs WHERE id = ?1 AND deleted_at IS NULL"),
            params![id],
            row_to_run,
        )
        .optional()
        .map_err(db_err("Get run"))
    }

    async fn list_runs(&self, account: &AccountId, limit: usize) -> Result<Vec<AutomationRun>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM automation_runs
                 WHERE account_id = ?1 AND deleted_at IS NULL
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))
            .map_err(db_err("List runs"))?;
        let rows = stmt
            .query_map(params![account.as_str(), limit as i64], row_to_run)
            .map_err(db_err("List runs"))?;
        let runs = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List runs"))?;
        Ok(runs)
    }

    async fn steps_for_run(&self, run_id: &str) -> Result<Vec<AutomationStep>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM automation_steps s
                 WHERE s.run_id = ?1 AND s.deleted_at IS NULL
                 ORDER BY s.step_order ASC"
            ))
            .map_err(db_err("List steps"))?;
        let rows = stmt
            .query_map(params![run_id], row_to_step)
            .map_err(db_err("List steps"))?;
        let steps = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List steps"))?;
        Ok(steps)
    }

    async fn soft_delete_run(
        &self,
        account: &AccountId,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let stamp = format_ts(now);
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err("Begin run delete"))?;

        let changed = tx
            .execute(
                "UPDATE automation_runs SET deleted_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND account_id = ?2 AND deleted_at IS NULL",
                params![id, account.as_str(), stamp],
            )
            .map_err(db_err("Delete run"))?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE automation_steps SET deleted_at = ?2, updated_at = ?2
             WHERE run_id = ?1 AND deleted_at IS NULL",
            params![id, stamp],
        )
        .map_err(db_err("Delete run steps"))?;

        tx.commit().map_err(db_err("Commit run delete"))?;
        Ok(true)
    }

    // ─── Dispatch ──────────────────────────────────────

    async fn due_steps(&self, query: &DueStepQuery) -> Result<Vec<AutomationStep>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM automation_steps s
                 JOIN automation_runs r ON r.id = s.run_id
                 WHERE r.account_id = ?1
                   AND r.deleted_at IS NULL
                   AND s.deleted_at IS NULL
                   AND (?2 IS NULL OR r.id = ?2)
                   AND s.scheduled_for <= ?3
                   AND (s.status = 'PENDING'
                        OR (?4 IS NOT NULL AND s.status = 'PROCESSING' AND s.claimed_at <= ?4))
                 ORDER BY s.scheduled_for ASC, s.step_order ASC
                 LIMIT ?5"
            ))
            .map_err(db_err("Due steps"))?;
        let rows = stmt
            .query_map(
                params![
                    query.account.as_str(),
                    query.run_id,
                    format_ts(query.now),
                    query.stale_before.map(format_ts),
                    query.limit as i64,
                ],
                row_to_step,
            )
            .map_err(db_err("Due steps"))?;
        let steps = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Due steps"))?;
        Ok(steps)
    }

    async fn accounts_with_due_steps(
        &self,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<AccountId>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT r.account_id FROM automation_steps s
                 JOIN automation_runs r ON r.id = s.run_id
                 WHERE r.deleted_at IS NULL
                   AND s.deleted_at IS NULL
                   AND s.scheduled_for <= ?1
                   AND (s.status = 'PENDING'
                        OR (?2 IS NOT NULL AND s.status = 'PROCESSING' AND s.claimed_at <= ?2))
                 ORDER BY r.account_id",
            )
            .map_err(db_err("Due accounts"))?;
        let rows = stmt
            .query_map(
                params![format_ts(now), stale_before.map(format_ts)],
                |row| row.get::<_, String>(0),
            )
            .map_err(db_err("Due accounts"))?;
        let raw = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Due accounts"))?;
        Ok(raw
            .iter()
            .filter_map(|id| AccountId::parse(id).ok())
            .collect())
    }

    async fn claim_step(
        &self,
        step_id: &str,
        now: DateTime<Utc>,
        stale_before: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>> {
        let stamp = format_ts(now);
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE automation_steps
                 SET status = 'PROCESSING', error = NULL, claimed_at = ?2, updated_at = ?2
                 WHERE id = ?1
                   AND deleted_at IS NULL
                   AND (status = 'PENDING'
                        OR (?3 IS NOT NULL AND status = 'PROCESSING' AND claimed_at <= ?3))",
                params![step_id, stamp, stale_before.map(format_ts)],
            )
            .map_err(db_err("Claim step"))?;
        if changed != 1 {
            return Ok(None);
        }
        // hand back exactly what was stored, it fences the later writes
        parse_ts(&stamp)
            .map(Some)
            .map_err(|e| DriplineError::Database(format!("Claim step: {e}")))
    }

    async fn complete_step(
        &self,
        step_id: &str,
        claimed_at: DateTime<Utc>,
        delivery_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE automation_steps
                 SET status = 'SENT', sent_at = ?4, delivery_id = ?3, error = NULL, updated_at = ?4
                 WHERE id = ?1 AND status = 'PROCESSING' AND claimed_at = ?2
                   AND deleted_at IS NULL",
                params![step_id, format_ts(claimed_at), delivery_id, format_ts(now)],
            )
            .map_err(db_err("Complete step"))?;
        Ok(changed == 1)
    }

    async fn fail_step(
        &self,
        step_id: &str,
        claimed_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE automation_steps
                 SET status = 'ERROR', error = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = 'PROCESSING' AND claimed_at = ?2
                   AND deleted_at IS NULL",
                params![step_id, format_ts(claimed_at), error, format_ts(now)],
            )
            .map_err(db_err("Fail step"))?;
        Ok(changed == 1)
    }

    async fn mark_run_error(&self, run_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE automation_runs SET status = 'ERROR', updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![run_id, format_ts(now)],
        )
        .map_err(db_err("Mark run error"))?;
        Ok(())
    }

    async fn touch_run_executed(&self, run_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE automation_runs SET last_executed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![run_id, format_ts(now)],
        )
        .map_err(db_err("Touch run"))?;
        Ok(())
    }

    async fn count_open_steps(&self, run_id: &str) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM automation_steps
                 WHERE run_id = ?1 AND deleted_at IS NULL
                   AND status IN ('PENDING', 'PROCESSING')",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(db_err("Count open steps"))?;
        Ok(count.max(0) as u64)
    }

    async fn complete_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE automation_runs SET status = 'COMPLETED', updated_at = ?2
                 WHERE id = ?1
                   AND deleted_at IS NULL
                   AND status NOT IN ('ERROR', 'COMPLETED')
                   AND NOT EXISTS (
                       SELECT 1 FROM automation_steps
                       WHERE run_id = ?1 AND deleted_at IS NULL
                         AND status IN ('PENDING', 'PROCESSING'))",
                params![run_id, format_ts(now)],
            )
            .map_err(db_err("Complete run"))?;
        Ok(changed == 1)
    }

    async fn insert_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO deliveries
             (id, account_id, step_id, template_id, lead_id, status, error, delivered_at, errored_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.account_id,
                record.step_id,
                record.template_id,
                record.lead_id,
                record.status.as_str(),
                record.error,
                record.delivered_at.map(format_ts),
                record.errored_at.map(format_ts),
                format_ts(record.created_at),
            ],
        )
        .map_err(db_err("Insert delivery"))?;
        Ok(())
    }

    async fn deliveries_for_step(&self, step_id: &str) -> Result<Vec<DeliveryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE step_id = ?1 ORDER BY created_at, rowid"
            ))
            .map_err(db_err("List deliveries"))?;
        let rows = stmt
            .query_map(params![step_id], row_to_delivery)
            .map_err(db_err("List deliveries"))?;
        let records = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("List deliveries"))?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use dripline_core::types::{DeliveryStatus, RunStatus, StepStatus, Traits, new_id};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn account(id: &str) -> AccountId {
        AccountId::parse(id).unwrap()
    }

    fn lead(account: &AccountId, email: &str) -> LeadIdentity {
        LeadIdentity {
            id: new_id(),
            account_id: account.as_str().into(),
            external_id: email.into(),
            email: Some(email.into()),
            first_name: None,
            last_name: None,
            traits: Traits::new(),
            created_at: t0(),
            updated_at: t0(),
        }
    }

    fn run(account: &AccountId, lead_id: &str, created_at: DateTime<Utc>) -> AutomationRun {
        AutomationRun {
            id: new_id(),
            account_id: account.as_str().into(),
            lead_id: lead_id.into(),
            name: "run".into(),
            status: RunStatus::Active,
            last_executed_at: None,
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }

    fn step(run_id: &str, template_id: &str, order: u32, delay: u32) -> AutomationStep {
        AutomationStep {
            id: new_id(),
            run_id: run_id.into(),
            template_id: template_id.into(),
            delivery_id: None,
            step_order: order,
            delay_minutes: delay,
            scheduled_for: t0() + Duration::minutes(delay as i64),
            status: StepStatus::Pending,
            sent_at: None,
            claimed_at: None,
            error: None,
            created_at: t0(),
            updated_at: t0(),
            deleted_at: None,
        }
    }

    /// Seed one account with a template, a lead and a run with the given delays.
    async fn seed(
        store: &SqliteStore,
        acct: &AccountId,
        delays: &[u32],
    ) -> (MessageTemplate, AutomationRun, Vec<AutomationStep>) {
        let template = MessageTemplate::new(acct, "welcome", "Hi", "Hello {{first_name}}");
        store.insert_template(&template).await.unwrap();
        let lead = lead(acct, &format!("{}@example.com", new_id()));
        assert!(store.insert_lead(&lead).await.unwrap());
        let run = run(acct, &lead.id, t0());
        let steps: Vec<_> = delays
            .iter()
            .enumerate()
            .map(|(i, d)| step(&run.id, &template.id, i as u32 + 1, *d))
            .collect();
        store.insert_run_with_steps(&run, &steps).await.unwrap();
        (template, run, steps)
    }

    fn due_query(acct: &AccountId, now: DateTime<Utc>) -> DueStepQuery {
        DueStepQuery {
            account: acct.clone(),
            run_id: None,
            now,
            stale_before: None,
            limit: 100,
        }
    }

    #[tokio::test]
    async fn test_open_and_migrate() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.list_runs(&account("a1"), 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_file_database() {
        let dir = std::env::temp_dir().join(format!("dripline-db-test-{}", new_id()));
        let store = SqliteStore::open(&dir.join("test.db")).unwrap();
        let acct = account("a1");
        seed(&store, &acct, &[0]).await;
        assert_eq!(store.list_runs(&acct, 20).await.unwrap().len(), 1);
        drop(store);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_due_steps_filter_and_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (_, run_a, _) = seed(&store, &acct, &[10, 0, 60]).await;
        let (_, run_b, _) = seed(&store, &acct, &[0]).await;
        let (_, _, _) = seed(&store, &account("other"), &[0]).await;

        let due = store
            .due_steps(&due_query(&acct, t0() + Duration::minutes(10)))
            .await
            .unwrap();
        let got: Vec<_> = due.iter().map(|s| (s.run_id.clone(), s.step_order)).collect();
        // both zero-delay steps tie on scheduled_for and break by step order
        assert_eq!(
            got,
            vec![
                (run_b.id.clone(), 1),
                (run_a.id.clone(), 2),
                (run_a.id.clone(), 1),
            ]
        );

        let mut scoped = due_query(&acct, t0() + Duration::minutes(10));
        scoped.run_id = Some(run_b.id.clone());
        assert_eq!(store.due_steps(&scoped).await.unwrap().len(), 1);

        let mut limited = due_query(&acct, t0() + Duration::hours(2));
        limited.limit = 2;
        assert_eq!(store.due_steps(&limited).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_due_steps_skip_non_pending() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (_, _, steps) = seed(&store, &acct, &[0, 0]).await;
        assert!(store.claim_step(&steps[0].id, t0(), None).await.unwrap().is_some());

        let due = store.due_steps(&due_query(&acct, t0())).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, steps[1].id);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (_, _, steps) = seed(&store, &acct, &[0]).await;

        assert_eq!(store.claim_step(&steps[0].id, t0(), None).await.unwrap(), Some(t0()));
        assert_eq!(store.claim_step(&steps[0].id, t0(), None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_claim_can_be_recovered() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (_, _, steps) = seed(&store, &acct, &[0]).await;
        assert!(store.claim_step(&steps[0].id, t0(), None).await.unwrap().is_some());

        let later = t0() + Duration::minutes(30);
        let cutoff = later - Duration::minutes(15);

        // fresh claims are never selected, stale ones are when recovery is on
        assert!(store.due_steps(&due_query(&acct, later)).await.unwrap().is_empty());
        let mut query = due_query(&acct, later);
        query.stale_before = Some(cutoff);
        assert_eq!(store.due_steps(&query).await.unwrap().len(), 1);

        assert_eq!(
            store.claim_step(&steps[0].id, later, Some(cutoff)).await.unwrap(),
            Some(later)
        );
        // the new claim is fresh again
        assert!(store.claim_step(&steps[0].id, later, Some(cutoff)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reclaimed_step_rejects_previous_owner() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (_, run, steps) = seed(&store, &acct, &[0]).await;
        let id = &steps[0].id;

        let first = store.claim_step(id, t0(), None).await.unwrap().unwrap();
        let later = t0() + Duration::minutes(20);
        let second = store
            .claim_step(id, later, Some(t0() + Duration::minutes(5)))
            .await
            .unwrap()
            .unwrap();

        // the slow first owner finishes after the takeover
        let late = later + Duration::minutes(1);
        assert!(!store.complete_step(id, first, "delivery-a", late).await.unwrap());
        assert!(!store.fail_step(id, first, "smtp timeout", late).await.unwrap());
        assert!(store.complete_step(id, second, "delivery-b", late).await.unwrap());

        let stored = store.steps_for_run(&run.id).await.unwrap();
        assert_eq!(stored[0].status, StepStatus::Sent);
        assert_eq!(stored[0].delivery_id.as_deref(), Some("delivery-b"));
        assert_eq!(stored[0].error, None);
    }

    #[tokio::test]
    async fn test_claim_stamp_is_millisecond_precise() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (_, _, steps) = seed(&store, &acct, &[0]).await;

        let now = t0() + Duration::nanoseconds(1_234_567);
        let claim = store.claim_step(&steps[0].id, now, None).await.unwrap().unwrap();
        assert_eq!(claim, t0() + Duration::milliseconds(1));
        assert!(store.complete_step(&steps[0].id, claim, "d", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_states_are_immutable() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (_, run, steps) = seed(&store, &acct, &[0]).await;
        let id = &steps[0].id;

        assert!(!store.complete_step(id, t0(), "d1", t0()).await.unwrap());
        let claim = store.claim_step(id, t0(), None).await.unwrap().unwrap();
        assert!(store.complete_step(id, claim, "d1", t0()).await.unwrap());
        assert!(!store.fail_step(id, claim, "late failure", t0()).await.unwrap());
        assert!(store.claim_step(id, t0(), Some(t0())).await.unwrap().is_none());

        let stored = store.steps_for_run(&run.id).await.unwrap();
        assert_eq!(stored[0].status, StepStatus::Sent);
        assert_eq!(stored[0].delivery_id.as_deref(), Some("d1"));
        assert_eq!(stored[0].sent_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_complete_run_is_conditional() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (_, run, steps) = seed(&store, &acct, &[0, 5]).await;

        assert_eq!(store.count_open_steps(&run.id).await.unwrap(), 2);
        assert!(!store.complete_run(&run.id, t0()).await.unwrap());

        for s in &steps {
            let claim = store.claim_step(&s.id, t0(), None).await.unwrap().unwrap();
            assert!(store.complete_step(&s.id, claim, "d", t0()).await.unwrap());
        }
        assert_eq!(store.count_open_steps(&run.id).await.unwrap(), 0);
        assert!(store.complete_run(&run.id, t0()).await.unwrap());
        assert!(!store.complete_run(&run.id, t0()).await.unwrap());
        let stored = store.get_run(&acct, &run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_error_run_is_never_completed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (_, run, steps) = seed(&store, &acct, &[0]).await;
        let claim = store.claim_step(&steps[0].id, t0(), None).await.unwrap().unwrap();
        assert!(store.fail_step(&steps[0].id, claim, "boom", t0()).await.unwrap());
        store.mark_run_error(&run.id, t0()).await.unwrap();

        assert!(!store.complete_run(&run.id, t0()).await.unwrap());
        let stored = store.get_run(&acct, &run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_lead_lookup_and_trait_merge() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let mut first = lead(&acct, "a@b.com");
        first.traits.insert("plan".into(), serde_json::json!("free"));
        first.traits.insert("seats".into(), serde_json::json!(1));
        assert!(store.insert_lead(&first).await.unwrap());

        // same external id loses the race
        let dup = lead(&acct, "a@b.com");
        assert!(!store.insert_lead(&dup).await.unwrap());

        let found = store
            .find_lead(&acct, Some("missing-ext"), Some("a@b.com"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
        assert!(store.find_lead(&account("a2"), None, Some("a@b.com")).await.unwrap().is_none());

        let mut update = LeadUpdate {
            first_name: Some("Ada".into()),
            ..Default::default()
        };
        update.traits.insert("plan".into(), serde_json::json!("pro"));
        update.traits.insert("company".into(), serde_json::json!("Acme"));
        let merged = store.merge_lead(&first.id, &update, t0()).await.unwrap();

        assert_eq!(merged.first_name.as_deref(), Some("Ada"));
        assert_eq!(merged.email.as_deref(), Some("a@b.com"));
        assert_eq!(merged.traits["plan"], "pro");
        assert_eq!(merged.traits["seats"], 1);
        assert_eq!(merged.traits["company"], "Acme");
    }

    #[tokio::test]
    async fn test_trait_merge_replaces_top_level_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let mut lead = lead(&acct, "a@b.com");
        lead.traits.insert(
            "address".into(),
            serde_json::json!({"city": "Paris", "zip": "75001"}),
        );
        lead.traits.insert("coupon".into(), serde_json::json!("X"));
        assert!(store.insert_lead(&lead).await.unwrap());

        let mut update = LeadUpdate::default();
        update
            .traits
            .insert("address".into(), serde_json::json!({"city": "Lyon"}));
        update.traits.insert("coupon".into(), serde_json::Value::Null);
        let merged = store.merge_lead(&lead.id, &update, t0()).await.unwrap();

        assert_eq!(merged.traits["address"], serde_json::json!({"city": "Lyon"}));
        assert!(merged.traits.contains_key("coupon"));
        assert!(merged.traits["coupon"].is_null());

        let stored = store.get_lead(&acct, &lead.id).await.unwrap().unwrap();
        assert_eq!(stored.traits, merged.traits);
    }

    #[tokio::test]
    async fn test_soft_deleted_lead_is_hidden() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let lead = lead(&acct, "gone@b.com");
        assert!(store.insert_lead(&lead).await.unwrap());

        assert!(!store.soft_delete_lead(&account("a2"), &lead.id, t0()).await.unwrap());
        assert!(store.soft_delete_lead(&acct, &lead.id, t0()).await.unwrap());
        assert!(!store.soft_delete_lead(&acct, &lead.id, t0()).await.unwrap());

        assert!(store.get_lead(&acct, &lead.id).await.unwrap().is_none());
        assert!(
            store
                .find_lead(&acct, Some(lead.external_id.as_str()), Some("gone@b.com"))
                .await
                .unwrap()
                .is_none()
        );
        let err = store
            .merge_lead(&lead.id, &LeadUpdate::default(), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, DriplineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_find_templates_scoped_and_deduplicated() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let mine = MessageTemplate::new(&acct, "mine", "s", "b");
        let theirs = MessageTemplate::new(&account("a2"), "theirs", "s", "b");
        store.insert_template(&mine).await.unwrap();
        store.insert_template(&theirs).await.unwrap();

        let found = store
            .find_templates(&acct, &[mine.id.clone(), mine.id.clone(), theirs.id.clone()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, mine.id);

        assert!(store.soft_delete_template(&acct, &mine.id, t0()).await.unwrap());
        assert!(store.get_template(&acct, &mine.id).await.unwrap().is_none());
        assert!(store.find_templates(&acct, &[mine.id.clone()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_soft_delete_run_cascades() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (_, run, _) = seed(&store, &acct, &[0, 0]).await;

        assert!(store.soft_delete_run(&acct, &run.id, t0()).await.unwrap());
        assert!(!store.soft_delete_run(&acct, &run.id, t0()).await.unwrap());
        assert!(store.get_run(&acct, &run.id).await.unwrap().is_none());
        assert!(store.steps_for_run(&run.id).await.unwrap().is_empty());
        assert!(store.due_steps(&due_query(&acct, t0())).await.unwrap().is_empty());
        assert!(store.accounts_with_due_steps(t0(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_runs_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let template = MessageTemplate::new(&acct, "t", "s", "b");
        store.insert_template(&template).await.unwrap();
        let lead = lead(&acct, "x@y.com");
        store.insert_lead(&lead).await.unwrap();

        let older = run(&acct, &lead.id, t0());
        let newer = run(&acct, &lead.id, t0() + Duration::minutes(1));
        store.insert_run_with_steps(&older, &[]).await.unwrap();
        store.insert_run_with_steps(&newer, &[]).await.unwrap();

        let runs = store.list_runs(&acct, 20).await.unwrap();
        assert_eq!(runs[0].id, newer.id);
        assert_eq!(runs[1].id, older.id);
        assert_eq!(store.list_runs(&acct, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_accounts_with_due_steps() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed(&store, &account("a1"), &[0]).await;
        seed(&store, &account("a2"), &[120]).await;

        let accounts = store.accounts_with_due_steps(t0(), None).await.unwrap();
        assert_eq!(accounts, vec![account("a1")]);
    }

    #[tokio::test]
    async fn test_delivery_records() {
        let store = SqliteStore::open_in_memory().unwrap();
        let acct = account("a1");
        let (template, run, steps) = seed(&store, &acct, &[0]).await;
        let record = DeliveryRecord {
            id: new_id(),
            account_id: acct.as_str().into(),
            step_id: steps[0].id.clone(),
            template_id: template.id.clone(),
            lead_id: run.lead_id.clone(),
            status: DeliveryStatus::Error,
            error: Some("smtp down".into()),
            delivered_at: None,
            errored_at: Some(t0()),
            created_at: t0(),
        };
        store.insert_delivery(&record).await.unwrap();
        let stored = store.deliveries_for_step(&steps[0].id).await.unwrap();
        assert_eq!(stored, vec![record]);
    }
}
