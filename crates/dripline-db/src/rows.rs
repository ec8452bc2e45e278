//! Row mappers and timestamp encoding.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text with millisecond
//! precision so that string comparison in SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use dripline_core::types::{
    AutomationRun, AutomationStep, DeliveryRecord, LeadIdentity, MessageTemplate, Traits,
};
use rusqlite::Row;
use rusqlite::types::Type;

/// Encode a timestamp for storage.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decode a stored timestamp.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|d| d.with_timezone(&Utc))
}

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_err(idx, e))
}

fn opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn parsed<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_err(idx, e))
}

fn traits(row: &Row, idx: usize) -> rusqlite::Result<Traits> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

pub(crate) const TEMPLATE_COLUMNS: &str =
    "id, account_id, name, subject, body, created_at, updated_at, deleted_at";

pub(crate) fn row_to_template(row: &Row) -> rusqlite::Result<MessageTemplate> {
    Ok(MessageTemplate {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        created_at: ts(row, 5)?,
        updated_at: ts(row, 6)?,
        deleted_at: opt_ts(row, 7)?,
    })
}

pub(crate) const LEAD_COLUMNS: &str =
    "id, account_id, external_id, email, first_name, last_name, traits, created_at, updated_at";

pub(crate) fn row_to_lead(row: &Row) -> rusqlite::Result<LeadIdentity> {
    Ok(LeadIdentity {
        id: row.get(0)?,
        account_id: row.get(1)?,
        external_id: row.get(2)?,
        email: row.get(3)?,
        first_name: row.get(4)?,
        last_name: row.get(5)?,
        traits: traits(row, 6)?,
        created_at: ts(row, 7)?,
        updated_at: ts(row, 8)?,
    })
}

pub(crate) const RUN_COLUMNS: &str = "id, account_id, lead_id, name, status, last_executed_at, created_at, updated_at, deleted_at";

pub(crate) fn row_to_run(row: &Row) -> rusqlite::Result<AutomationRun> {
    Ok(AutomationRun {
        id: row.get(0)?,
        account_id: row.get(1)?,
        lead_id: row.get(2)?,
        name: row.get(3)?,
        status: parsed(row, 4)?,
        last_executed_at: opt_ts(row, 5)?,
        created_at: ts(row, 6)?,
        updated_at: ts(row, 7)?,
        deleted_at: opt_ts(row, 8)?,
    })
}

/// Step columns qualified with the `s` alias so they can be joined against runs.
pub(crate) const STEP_COLUMNS: &str = "s.id, s.run_id, s.template_id, s.delivery_id, s.step_order, s.delay_minutes, s.scheduled_for, s.status, s.sent_at, s.claimed_at, s.error, s.created_at, s.updated_at, s.deleted_at";

pub(crate) fn row_to_step(row: &Row) -> rusqlite::Result<AutomationStep> {
    Ok(AutomationStep {
        id: row.get(0)?,
        run_id: row.get(1)?,
        template_id: row.get(2)?,
        delivery_id: row.get(3)?,
        step_order: row.get(4)?,
        delay_minutes: row.get(5)?,
        scheduled_for: ts(row, 6)?,
        status: parsed(row, 7)?,
        sent_at: opt_ts(row, 8)?,
        claimed_at: opt_ts(row, 9)?,
        error: row.get(10)?,
        created_at: ts(row, 11)?,
        updated_at: ts(row, 12)?,
        deleted_at: opt_ts(row, 13)?,
    })
}

pub(crate) const DELIVERY_COLUMNS: &str = "id, account_id, step_id, template_id, lead_id, status, error, delivered_at, errored_at, created_at";

pub(crate) fn row_to_delivery(row: &Row) -> rusqlite::Result<DeliveryRecord> {
    Ok(DeliveryRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        step_id: row.get(2)?,
        template_id: row.get(3)?,
        lead_id: row.get(4)?,
        status: parsed(row, 5)?,
        error: row.get(6)?,
        delivered_at: opt_ts(row, 7)?,
        errored_at: opt_ts(row, 8)?,
        created_at: ts(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_fixed_width_and_ordered() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        let a = format_ts(early);
        let b = format_ts(late);
        assert_eq!(a, "2026-01-02T03:04:05.000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_ts(&b).unwrap(), late);
    }
}
