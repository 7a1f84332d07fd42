//! SQL migration definitions for the coursesmith run database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: runs, stage_attempts",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per pipeline run; the full run is kept as a JSON snapshot
CREATE TABLE IF NOT EXISTS runs (
    id            TEXT PRIMARY KEY,
    title         TEXT NOT NULL,
    stage         TEXT NOT NULL,
    profile       TEXT NOT NULL,
    snapshot_json TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_updated_at ON runs(updated_at);

-- Append-only log of generation attempts
CREATE TABLE IF NOT EXISTS stage_attempts (
    run_id       TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    seq          INTEGER NOT NULL,
    stage        TEXT NOT NULL,
    outcome      TEXT NOT NULL,
    error        TEXT,
    elapsed_ms   INTEGER NOT NULL,
    attempted_at TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run leases: one mutating process per run",
            sql: r#"
ALTER TABLE runs ADD COLUMN lease_holder TEXT;
ALTER TABLE runs ADD COLUMN lease_since  TEXT;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
