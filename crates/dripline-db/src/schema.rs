//! Schema migrations.

use rusqlite::Connection;

/// Create tables and indexes if they do not exist yet.
pub(crate) fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS message_templates (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            subject TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_templates_account
            ON message_templates(account_id);

        CREATE TABLE IF NOT EXISTS leads (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            external_id TEXT NOT NULL,
            email TEXT,
            first_name TEXT,
            last_name TEXT,
            traits TEXT NOT NULL DEFAULT '{}',  -- JSON object
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_leads_account_external
            ON leads(account_id, external_id) WHERE deleted_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_leads_account_email
            ON leads(account_id, email);

        CREATE TABLE IF NOT EXISTS automation_runs (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            lead_id TEXT NOT NULL REFERENCES leads(id),
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ACTIVE',  -- ACTIVE, PAUSED, COMPLETED, ERROR
            last_executed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_runs_account_created
            ON automation_runs(account_id, created_at);

        CREATE TABLE IF NOT EXISTS automation_steps (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES automation_runs(id) ON DELETE CASCADE,
            template_id TEXT NOT NULL REFERENCES message_templates(id),
            delivery_id TEXT,
            step_order INTEGER NOT NULL,
            delay_minutes INTEGER NOT NULL DEFAULT 0,
            scheduled_for TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',  -- PENDING, PROCESSING, SENT, ERROR
            sent_at TEXT,
            claimed_at TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            UNIQUE (run_id, step_order)
        );
        CREATE INDEX IF NOT EXISTS idx_steps_status_scheduled
            ON automation_steps(status, scheduled_for);

        CREATE TABLE IF NOT EXISTS deliveries (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            step_id TEXT NOT NULL,
            template_id TEXT NOT NULL,
            lead_id TEXT NOT NULL,
            status TEXT NOT NULL,  -- DELIVERED, ERROR
            error TEXT,
            delivered_at TEXT,
            errored_at TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_deliveries_step ON deliveries(step_id);
        ",
    )
}
