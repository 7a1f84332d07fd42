//! libSQL storage layer for pipeline runs.
//!
//! The [`Storage`] struct wraps a local libSQL database holding one snapshot
//! row per run plus an append-only log of stage attempts. Snapshots are opaque
//! JSON here; the core crate owns their schema.
//!
//! **Access rules:**
//! - Commands that advance a run: read-write via [`Storage::open`]
//! - Commands that only inspect runs: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use coursesmith_shared::{CourseError, Result};
use libsql::{Connection, Database, params};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// A stored run snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: String,
    /// Human-readable label (course name once known).
    pub title: String,
    pub stage: String,
    pub profile: String,
    pub snapshot_json: String,
    pub created_at: String,
    pub updated_at: String,
}

/// One row of the stage attempt log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAttemptRecord {
    /// Position in the run's attempt history, starting at 0.
    pub seq: i64,
    pub stage: String,
    /// `succeeded` or `failed`.
    pub outcome: String,
    pub error: Option<String>,
    pub elapsed_ms: i64,
    pub attempted_at: String,
}

/// Outcome of [`Storage::try_lease`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired,
    /// Another holder is working on the run.
    Held { holder: String, since: String },
}

fn storage_err(e: impl std::fmt::Display) -> CourseError {
    CourseError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CourseError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CourseError::NotFound(format!(
                "no run database at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CourseError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CourseError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    /// Insert a run snapshot, or replace it while keeping `created_at`.
    pub async fn upsert_run(
        &self,
        id: &str,
        title: &str,
        stage: &str,
        profile: &str,
        snapshot_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, title, stage, profile, snapshot_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    stage = excluded.stage,
                    profile = excluded.profile,
                    snapshot_json = excluded.snapshot_json,
                    updated_at = excluded.updated_at",
                params![id, title, stage, profile, snapshot_json, now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Get a run by ID.
    pub async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, stage, profile, snapshot_json, created_at, updated_at
                 FROM runs WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// The most recently updated run, if any.
    pub async fn latest_run(&self) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, stage, profile, snapshot_json, created_at, updated_at
                 FROM runs ORDER BY updated_at DESC, id DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// List all runs, most recently updated first. Snapshots are left empty.
    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, stage, profile, '', created_at, updated_at
                 FROM runs ORDER BY updated_at DESC, id DESC",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    /// Delete a run and its attempt log.
    pub async fn delete_run(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM stage_attempts WHERE run_id = ?1", params![id])
            .await
            .map_err(storage_err)?;
        self.conn
            .execute("DELETE FROM runs WHERE id = ?1", params![id])
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run leases
    // -----------------------------------------------------------------------

    /// Claim the run for `holder`. Succeeds when the run is free, already held
    /// by `holder`, or held for longer than `stale_after` (an abandoned lease).
    pub async fn try_lease(
        &self,
        run_id: &str,
        holder: &str,
        stale_after: Duration,
    ) -> Result<LeaseOutcome> {
        self.check_writable()?;
        let now = Utc::now();
        let since = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let cutoff = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();

        let updated = self
            .conn
            .execute(
                "UPDATE runs SET lease_holder = ?2, lease_since = ?3
                 WHERE id = ?1
                   AND (lease_holder IS NULL OR lease_holder = ?2 OR lease_since < ?4)",
                params![run_id, holder, since.as_str(), cutoff.as_str()],
            )
            .await
            .map_err(storage_err)?;
        if updated == 1 {
            tracing::debug!(run_id, holder, "lease acquired");
            return Ok(LeaseOutcome::Acquired);
        }

        let mut rows = self
            .conn
            .query(
                "SELECT lease_holder, lease_since FROM runs WHERE id = ?1",
                params![run_id],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(LeaseOutcome::Held {
                holder: row.get::<String>(0).unwrap_or_default(),
                since: row.get::<String>(1).unwrap_or_default(),
            }),
            None => Err(CourseError::NotFound(format!("run {run_id}"))),
        }
    }

    /// Give up the run's lease. A lease held by someone else is left alone.
    pub async fn release_lease(&self, run_id: &str, holder: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE runs SET lease_holder = NULL, lease_since = NULL
                 WHERE id = ?1 AND lease_holder = ?2",
                params![run_id, holder],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage attempt log
    // -----------------------------------------------------------------------

    /// Record an attempt. Re-recording an existing `seq` is a no-op.
    pub async fn record_attempt(&self, run_id: &str, attempt: &StageAttemptRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO stage_attempts
                    (run_id, seq, stage, outcome, error, elapsed_ms, attempted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    attempt.seq,
                    attempt.stage.as_str(),
                    attempt.outcome.as_str(),
                    attempt.error.as_deref(),
                    attempt.elapsed_ms,
                    attempt.attempted_at.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Attempt log for a run, oldest first.
    pub async fn list_attempts(&self, run_id: &str) -> Result<Vec<StageAttemptRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT seq, stage, outcome, error, elapsed_ms, attempted_at
                 FROM stage_attempts WHERE run_id = ?1 ORDER BY seq",
                params![run_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(StageAttemptRecord {
                seq: row.get::<i64>(0).map_err(storage_err)?,
                stage: row.get::<String>(1).map_err(storage_err)?,
                outcome: row.get::<String>(2).map_err(storage_err)?,
                error: row.get::<String>(3).ok(),
                elapsed_ms: row.get::<i64>(4).map_err(storage_err)?,
                attempted_at: row.get::<String>(5).map_err(storage_err)?,
            });
        }
        Ok(results)
    }
}

/// Convert a database row to a [`RunRecord`].
fn row_to_run(row: &libsql::Row) -> Result<RunRecord> {
    Ok(RunRecord {
        id: row.get::<String>(0).map_err(storage_err)?,
        title: row.get::<String>(1).map_err(storage_err)?,
        stage: row.get::<String>(2).map_err(storage_err)?,
        profile: row.get::<String>(3).map_err(storage_err)?,
        snapshot_json: row.get::<String>(4).map_err(storage_err)?,
        created_at: row.get::<String>(5).map_err(storage_err)?,
        updated_at: row.get::<String>(6).map_err(storage_err)?,
    })
}
