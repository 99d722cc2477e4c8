use std::collections::HashSet;

use libsql::params;
use thiserror::Error;

use crate::db::{Database, DbError};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: "001_initial",
    sql: INITIAL_SCHEMA,
}];

const INITIAL_SCHEMA: &str = r#"
CREATE TABLE accounts (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    display_name TEXT,
    state_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE threads (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    provider_thread_id TEXT NOT NULL,
    subject TEXT,
    snippet TEXT,
    last_message_at TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    is_unread INTEGER NOT NULL DEFAULT 0,
    participants_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (account_id, provider_thread_id)
);

CREATE TABLE messages (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
    provider_message_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    from_email TEXT,
    from_name TEXT,
    to_json TEXT NOT NULL DEFAULT '[]',
    cc_json TEXT NOT NULL DEFAULT '[]',
    bcc_json TEXT NOT NULL DEFAULT '[]',
    subject TEXT,
    snippet TEXT,
    body_plain TEXT,
    body_html TEXT,
    headers_json TEXT NOT NULL DEFAULT '{}',
    attachments_json TEXT NOT NULL DEFAULT '[]',
    received_at TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (account_id, provider_message_id)
);

CREATE INDEX messages_thread_idx ON messages (thread_id);

CREATE TABLE classifications (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL UNIQUE REFERENCES messages(id) ON DELETE CASCADE,
    category TEXT NOT NULL,
    urgency TEXT NOT NULL,
    safe_to_reply INTEGER NOT NULL,
    confidence REAL NOT NULL,
    reasoning TEXT NOT NULL,
    model_used TEXT NOT NULL,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    priority INTEGER NOT NULL DEFAULT 100,
    conditions_json TEXT NOT NULL,
    action TEXT NOT NULL,
    auto_approve INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE decisions (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    thread_id TEXT NOT NULL,
    message_id TEXT NOT NULL UNIQUE REFERENCES messages(id) ON DELETE CASCADE,
    decision_type TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    confidence REAL NOT NULL,
    matched_rule_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE drafts (
    id TEXT PRIMARY KEY,
    decision_id TEXT NOT NULL UNIQUE REFERENCES decisions(id) ON DELETE CASCADE,
    message_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    subject TEXT NOT NULL,
    body_text TEXT NOT NULL,
    body_html TEXT,
    tone TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    is_sent INTEGER NOT NULL DEFAULT 0,
    sent_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE draft_revisions (
    id TEXT PRIMARY KEY,
    draft_id TEXT NOT NULL REFERENCES drafts(id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    subject TEXT NOT NULL,
    body_text TEXT NOT NULL,
    body_html TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (draft_id, version)
);

CREATE TABLE approval_items (
    id TEXT PRIMARY KEY,
    decision_id TEXT NOT NULL UNIQUE REFERENCES decisions(id) ON DELETE CASCADE,
    draft_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    reviewed_at TEXT,
    reviewer_notes TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX approval_items_status_idx ON approval_items (status, created_at);

CREATE TABLE user_settings (
    id TEXT PRIMARY KEY,
    require_approval_above_confidence REAL NOT NULL DEFAULT 0.8,
    default_tone TEXT NOT NULL DEFAULT 'professional',
    signature TEXT,
    working_hours_enabled INTEGER NOT NULL DEFAULT 0,
    working_hours_start TEXT NOT NULL DEFAULT '09:00',
    working_hours_end TEXT NOT NULL DEFAULT '17:00',
    utc_offset_minutes INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE audit_log (
    id TEXT PRIMARY KEY,
    action TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    details_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX audit_log_entity_idx ON audit_log (entity_type, entity_id);

CREATE TABLE jobs (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    lane TEXT,
    payload_json TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'queued',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    not_before TEXT,
    idempotency_key TEXT UNIQUE,
    last_error TEXT,
    heartbeat_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    finished_at TEXT,
    result_json TEXT
);

CREATE INDEX jobs_claim_idx ON jobs (state, priority, created_at);
"#;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("migration failed: {0}")]
    LibSql(#[from] libsql::Error),
}

async fn apply_migrations(
    conn: &libsql::Connection,
    migrations: &[Migration],
) -> Result<(), MigrationError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
        (),
    )
    .await?;

    let mut applied = HashSet::new();
    let mut rows = conn
        .query("SELECT version FROM schema_migrations", ())
        .await?;
    while let Some(row) = rows.next().await? {
        let version: String = row.get(0)?;
        applied.insert(version);
    }

    for migration in migrations {
        if applied.contains(migration.version) {
            continue;
        }

        let tx = conn.transaction().await?;
        tx.execute_batch(migration.sql).await?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
            params![migration.version],
        )
        .await?;
        tx.commit().await?;
    }

    Ok(())
}

pub async fn run_migrations(db: &Database) -> Result<(), MigrationError> {
    let conn = db.connection().await?;
    apply_migrations(&conn, MIGRATIONS).await
}
