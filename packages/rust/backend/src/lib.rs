//! Model backend and document index contracts.
//!
//! The pipeline only ever talks to a generative model through
//! [`ModelBackend`]: open a session, post a message, poll the resulting run,
//! read back the newest assistant message. [`DocumentIndex`] optionally makes
//! uploaded reference files searchable from within a session.
//!
//! Two implementations ship here: [`OpenAiAssistants`] over the Assistants
//! v2 REST API, and [`ScriptedBackend`], a deterministic in-memory stand-in.

mod openai;
mod scripted;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use coursesmith_shared::{CourseError, Result};

pub use openai::{OpenAiAssistants, OpenAiOptions};
pub use scripted::{ScriptedBackend, ScriptedIndex, ScriptedReply};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A persistent conversation bound to one pipeline run.
///
/// Serializable so a run can resume in a later process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId {
    /// Assistant configured for this run.
    pub assistant_id: String,
    /// Conversation thread holding every stage's messages.
    pub thread_id: String,
}

/// One asynchronous model run inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendRunId(pub String);

impl std::fmt::Display for BackendRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A searchable document index built from reference files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexId(pub String);

impl std::fmt::Display for IndexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a submitted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Completed,
    Failed { reason: String },
    Expired,
}

/// Status of a document index build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStatus {
    Building,
    Ready,
    Failed { reason: String },
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// The four operations the pipeline needs from a generative model.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Open a conversation, optionally able to search `index`.
    async fn create_session(&self, index: Option<&IndexId>) -> Result<SessionId>;

    /// Append a user message to the session and start a run.
    async fn submit(&self, session: &SessionId, message: &str) -> Result<BackendRunId>;

    /// Current status of `run`.
    async fn poll_status(&self, session: &SessionId, run: &BackendRunId) -> Result<RunStatus>;

    /// Text of the newest assistant-authored message, if there is one.
    async fn latest_assistant_message(&self, session: &SessionId) -> Result<Option<String>>;
}

/// Long-term document index used for in-session retrieval.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Upload `files` and start indexing them.
    async fn build_index(&self, name: &str, files: &[PathBuf]) -> Result<IndexId>;

    /// Current build status.
    async fn index_status(&self, index: &IndexId) -> Result<IndexStatus>;

    /// Delete the index. Safe to call on an index that failed to build.
    async fn dispose(&self, index: &IndexId) -> Result<()>;
}

/// Poll `index` until it is ready.
///
/// Fails with an ingestion error when the build fails or is still running
/// after `max_polls` polls.
#[instrument(skip_all, fields(index = %id, max_polls))]
pub async fn await_index_ready(
    index: &dyn DocumentIndex,
    id: &IndexId,
    max_polls: u32,
    interval: Duration,
) -> Result<()> {
    for attempt in 1..=max_polls {
        match index.index_status(id).await? {
            IndexStatus::Ready => {
                info!(attempt, "document index ready");
                return Ok(());
            }
            IndexStatus::Failed { reason } => {
                return Err(CourseError::Ingestion(format!(
                    "document index build failed: {reason}"
                )));
            }
            IndexStatus::Building => {
                debug!(attempt, "document index still building");
                if attempt < max_polls {
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    Err(CourseError::Ingestion(format!(
        "document index not ready after {max_polls} polls"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn index_ready_after_building() {
        let index = ScriptedIndex::new(vec![IndexStatus::Building, IndexStatus::Ready]);
        let id = index.build_index("reference", &[]).await.unwrap();
        await_index_ready(&index, &id, 5, Duration::ZERO)
            .await
            .expect("ready");
    }

    #[tokio::test]
    async fn index_poll_limit_is_an_ingestion_error() {
        let index = ScriptedIndex::new(vec![IndexStatus::Building; 10]);
        let id = index.build_index("reference", &[]).await.unwrap();
        let err = await_index_ready(&index, &id, 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), coursesmith_shared::ErrorKind::Ingestion);
        assert!(err.to_string().contains("after 3 polls"));
    }

    #[tokio::test]
    async fn failed_index_reports_reason() {
        let index = ScriptedIndex::new(vec![IndexStatus::Failed {
            reason: "expired".into(),
        }]);
        let id = index.build_index("reference", &[]).await.unwrap();
        let err = await_index_ready(&index, &id, 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn session_id_roundtrips_as_json() {
        let session = SessionId {
            assistant_id: "asst_1".into(),
            thread_id: "thread_1".into(),
        };
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("thread_1"));
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
