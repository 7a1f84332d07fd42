//! Saving and loading pipeline runs through the run database.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, instrument};

use coursesmith_shared::{AppConfig, CourseError, Result, RunId};
use coursesmith_storage::{LeaseOutcome, RunRecord, StageAttemptRecord, Storage};

use crate::pipeline::PipelineRun;

/// Database file name inside the data directory.
pub const DATABASE_FILE: &str = "coursesmith.db";

/// Path of the run database, with a leading `~` expanded.
pub fn database_path(config: &AppConfig) -> Result<PathBuf> {
    let dir = &config.defaults.data_dir;
    let dir = match dir.strip_prefix("~/").or_else(|| (dir == "~").then_some("")) {
        Some(rest) => dirs::home_dir()
            .ok_or_else(|| CourseError::config("cannot determine home directory"))?
            .join(rest),
        None => PathBuf::from(dir),
    };
    Ok(dir.join(DATABASE_FILE))
}

/// Upsert the run snapshot and append any attempts not yet recorded.
#[instrument(skip_all, fields(run_id = %run.id, stage = %run.stage))]
pub async fn save_run(storage: &Storage, run: &PipelineRun) -> Result<()> {
    let snapshot = serde_json::to_string(run)
        .map_err(|e| CourseError::Storage(format!("failed to serialize run: {e}")))?;
    let id = run.id.to_string();
    let title = run.title().unwrap_or_else(|| "untitled".into());

    storage
        .upsert_run(
            &id,
            &title,
            run.stage.as_str(),
            run.profile.as_str(),
            &snapshot,
        )
        .await?;

    for (seq, attempt) in run.history.iter().enumerate() {
        let record = StageAttemptRecord {
            seq: seq as i64,
            stage: attempt.step.as_str().to_string(),
            outcome: attempt.outcome.as_str().to_string(),
            error: attempt.error.clone(),
            elapsed_ms: i64::try_from(attempt.elapsed_ms).unwrap_or(i64::MAX),
            attempted_at: attempt.at.to_rfc3339(),
        };
        storage.record_attempt(&id, &record).await?;
    }
    debug!(attempts = run.history.len(), "run saved");
    Ok(())
}

/// Load a run by id.
pub async fn load_run(storage: &Storage, id: RunId) -> Result<PipelineRun> {
    let record = storage
        .get_run(&id.to_string())
        .await?
        .ok_or_else(|| CourseError::NotFound(format!("run {id}")))?;
    decode(&record)
}

/// Load the most recently updated run.
pub async fn load_latest(storage: &Storage) -> Result<PipelineRun> {
    let record = storage.latest_run().await?.ok_or_else(|| {
        CourseError::NotFound("no saved runs; start one with `coursesmith new`".into())
    })?;
    decode(&record)
}

/// Take the run's lease for `holder` and load its latest snapshot.
///
/// Fails with [`CourseError::RunBusy`] while another holder works on the run.
#[instrument(skip_all, fields(run_id = %id, holder = holder))]
pub async fn claim_run(
    storage: &Storage,
    id: RunId,
    holder: &str,
    stale_after: Duration,
) -> Result<PipelineRun> {
    match storage.try_lease(&id.to_string(), holder, stale_after).await? {
        LeaseOutcome::Acquired => load_run(storage, id).await,
        LeaseOutcome::Held { holder, since } => Err(CourseError::RunBusy {
            run: id.to_string(),
            holder,
            since,
        }),
    }
}

/// Save the run, then hand its lease back. The lease is released even when
/// saving fails.
pub async fn save_and_release(storage: &Storage, run: &PipelineRun, holder: &str) -> Result<()> {
    let saved = save_run(storage, run).await;
    let released = storage.release_lease(&run.id.to_string(), holder).await;
    saved.and(released)
}

fn decode(record: &RunRecord) -> Result<PipelineRun> {
    serde_json::from_str(&record.snapshot_json).map_err(|e| {
        CourseError::Storage(format!("run {} has an unreadable snapshot: {e}", record.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Overview, Section};
    use crate::executor::Step;
    use crate::pipeline::{AttemptOutcome, Stage, StageAttempt};
    use chrono::Utc;
    use coursesmith_shared::GenerationProfile;

    async fn temp_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("cs_persist_{}.db", uuid::Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn attempt(outcome: AttemptOutcome) -> StageAttempt {
        StageAttempt {
            step: Step::Sections,
            outcome,
            error: (outcome == AttemptOutcome::Failed).then(|| "backend error: boom".into()),
            elapsed_ms: 12,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let storage = temp_storage().await;
        let mut run = PipelineRun::new(GenerationProfile::FreeformMarkdown);
        run.stage = Stage::Sections;
        run.artifact.overview = Some(Overview::Prose("# Bees\n\nAll about bees".into()));
        run.artifact.sections.push(Section::new("Hives", "Intro", 60));
        run.history.push(attempt(AttemptOutcome::Failed));

        save_run(&storage, &run).await.unwrap();
        let loaded = load_run(&storage, run.id).await.unwrap();
        assert_eq!(loaded, run);

        let record = storage.get_run(&run.id.to_string()).await.unwrap().unwrap();
        assert_eq!(record.title, "Bees");
        assert_eq!(record.stage, "sections");
        assert_eq!(record.profile, "freeform-markdown");
    }

    #[tokio::test]
    async fn attempts_appended_once() {
        let storage = temp_storage().await;
        let mut run = PipelineRun::new(GenerationProfile::StrictStructure);
        run.history.push(attempt(AttemptOutcome::Failed));
        save_run(&storage, &run).await.unwrap();

        run.history.push(attempt(AttemptOutcome::Succeeded));
        save_run(&storage, &run).await.unwrap();

        let attempts = storage.list_attempts(&run.id.to_string()).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, "failed");
        assert_eq!(attempts[1].outcome, "succeeded");
        assert_eq!(attempts[1].stage, "sections");
    }

    #[tokio::test]
    async fn untitled_and_missing_runs() {
        let storage = temp_storage().await;
        assert!(matches!(
            load_latest(&storage).await.unwrap_err(),
            CourseError::NotFound(_)
        ));

        let run = PipelineRun::new(GenerationProfile::StrictStructure);
        save_run(&storage, &run).await.unwrap();
        let record = storage.get_run(&run.id.to_string()).await.unwrap().unwrap();
        assert_eq!(record.title, "untitled");
        assert_eq!(load_latest(&storage).await.unwrap().id, run.id);

        assert!(load_run(&storage, RunId::new()).await.is_err());
    }

    #[tokio::test]
    async fn claimed_run_excludes_other_holders() {
        let storage = temp_storage().await;
        let mut run = PipelineRun::new(GenerationProfile::StrictStructure);
        run.stage = Stage::Overview;
        save_run(&storage, &run).await.unwrap();
        let ttl = Duration::from_secs(600);

        let mut first = claim_run(&storage, run.id, "pid 1", ttl).await.unwrap();
        let err = claim_run(&storage, run.id, "pid 2", ttl).await.unwrap_err();
        assert!(matches!(&err, CourseError::RunBusy { holder, .. } if holder == "pid 1"));
        assert_eq!(err.kind(), coursesmith_shared::ErrorKind::Control);

        first.stage = Stage::Sections;
        first.artifact.sections.push(Section::new("Hives", "Intro", 60));
        save_and_release(&storage, &first, "pid 1").await.unwrap();

        // The next holder starts from the first holder's result.
        let second = claim_run(&storage, run.id, "pid 2", ttl).await.unwrap();
        assert_eq!(second.stage, Stage::Sections);
        assert_eq!(second.artifact.sections.len(), 1);
    }

    #[tokio::test]
    async fn claiming_unknown_run_fails() {
        let storage = temp_storage().await;
        let err = claim_run(&storage, RunId::new(), "pid 1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CourseError::NotFound(_)));
    }

    #[test]
    fn database_path_expands_home() {
        let mut config = AppConfig::default();
        config.defaults.data_dir = "/var/lib/coursesmith".into();
        assert_eq!(
            database_path(&config).unwrap(),
            PathBuf::from("/var/lib/coursesmith/coursesmith.db")
        );

        config.defaults.data_dir = "~/runs".into();
        let path = database_path(&config).unwrap();
        assert!(path.ends_with("runs/coursesmith.db"));
        assert!(!path.to_string_lossy().contains('~'));
    }
}
