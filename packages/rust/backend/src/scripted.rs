//! Deterministic in-memory backend.
//!
//! Replies are consumed in order, one per submitted message. Used by the
//! pipeline tests and handy for dry runs without network access.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use coursesmith_shared::{CourseError, Result};

use crate::{
    BackendRunId, DocumentIndex, IndexId, IndexStatus, ModelBackend, RunStatus, SessionId,
};

/// How a scripted run resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Completes and appends this assistant message.
    Text(String),
    /// Terminates with a failed status.
    Failed(String),
    /// Terminates with an expired status.
    Expired,
    /// Completes without appending any message.
    Silent,
    /// Never leaves the pending status.
    Hang,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

#[derive(Debug)]
struct ScriptedRun {
    thread_id: String,
    reply: ScriptedReply,
    pending_left: u32,
    delivered: bool,
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<ScriptedReply>,
    prompts: Vec<String>,
    runs: HashMap<String, ScriptedRun>,
    threads: HashMap<String, Vec<String>>,
    session_indexes: Vec<Option<IndexId>>,
    next_id: u64,
}

impl ScriptState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{}", self.next_id)
    }
}

/// A [`ModelBackend`] that replays queued replies.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: Mutex<ScriptState>,
    pending_polls: u32,
}

impl ScriptedBackend {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                replies: replies.into_iter().collect(),
                ..ScriptState::default()
            }),
            pending_polls: 0,
        }
    }

    /// Report `Pending` this many times before each run resolves.
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// Queue another reply.
    pub fn push(&self, reply: ScriptedReply) {
        self.lock().replies.push_back(reply);
    }

    /// Every message submitted so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.lock().prompts.clone()
    }

    /// Replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.lock().replies.len()
    }

    /// The index each created session was bound to, in creation order.
    pub fn session_indexes(&self) -> Vec<Option<IndexId>> {
        self.lock().session_indexes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn create_session(&self, index: Option<&IndexId>) -> Result<SessionId> {
        let mut state = self.lock();
        let assistant_id = state.next_id("asst");
        let thread_id = state.next_id("thread");
        state.threads.insert(thread_id.clone(), Vec::new());
        state.session_indexes.push(index.cloned());
        Ok(SessionId {
            assistant_id,
            thread_id,
        })
    }

    async fn submit(&self, session: &SessionId, message: &str) -> Result<BackendRunId> {
        let mut state = self.lock();
        if !state.threads.contains_key(&session.thread_id) {
            return Err(CourseError::Backend(format!(
                "unknown thread {}",
                session.thread_id
            )));
        }
        let reply = state
            .replies
            .pop_front()
            .ok_or_else(|| CourseError::Backend("scripted replies exhausted".into()))?;
        state.prompts.push(message.to_string());

        let run_id = state.next_id("run");
        state.runs.insert(
            run_id.clone(),
            ScriptedRun {
                thread_id: session.thread_id.clone(),
                reply,
                pending_left: self.pending_polls,
                delivered: false,
            },
        );
        Ok(BackendRunId(run_id))
    }

    async fn poll_status(&self, _session: &SessionId, run: &BackendRunId) -> Result<RunStatus> {
        let mut state = self.lock();
        let ScriptState { runs, threads, .. } = &mut *state;
        let entry = runs
            .get_mut(&run.0)
            .ok_or_else(|| CourseError::Backend(format!("unknown run {run}")))?;

        if entry.pending_left > 0 {
            entry.pending_left -= 1;
            return Ok(RunStatus::Pending);
        }

        let status = match &entry.reply {
            ScriptedReply::Text(text) => {
                if !entry.delivered {
                    threads
                        .entry(entry.thread_id.clone())
                        .or_default()
                        .push(text.clone());
                    entry.delivered = true;
                }
                RunStatus::Completed
            }
            ScriptedReply::Failed(reason) => RunStatus::Failed {
                reason: reason.clone(),
            },
            ScriptedReply::Expired => RunStatus::Expired,
            ScriptedReply::Silent => RunStatus::Completed,
            ScriptedReply::Hang => RunStatus::Pending,
        };
        Ok(status)
    }

    async fn latest_assistant_message(&self, session: &SessionId) -> Result<Option<String>> {
        let state = self.lock();
        Ok(state
            .threads
            .get(&session.thread_id)
            .and_then(|messages| messages.last().cloned()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct IndexState {
    statuses: VecDeque<IndexStatus>,
    built: Vec<(String, Vec<PathBuf>)>,
    disposed: Vec<IndexId>,
}

/// A [`DocumentIndex`] that reports queued statuses, then `Ready`.
#[derive(Debug, Default)]
pub struct ScriptedIndex {
    state: Mutex<IndexState>,
}

impl ScriptedIndex {
    pub fn new(statuses: impl IntoIterator<Item = IndexStatus>) -> Self {
        Self {
            state: Mutex::new(IndexState {
                statuses: statuses.into_iter().collect(),
                ..IndexState::default()
            }),
        }
    }

    /// Names and file lists of every index built so far.
    pub fn built(&self) -> Vec<(String, Vec<PathBuf>)> {
        self.lock().built.clone()
    }

    /// Every index disposed so far.
    pub fn disposed(&self) -> Vec<IndexId> {
        self.lock().disposed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DocumentIndex for ScriptedIndex {
    async fn build_index(&self, name: &str, files: &[PathBuf]) -> Result<IndexId> {
        let mut state = self.lock();
        state.built.push((name.to_string(), files.to_vec()));
        Ok(IndexId(format!("vs_{}", state.built.len())))
    }

    async fn index_status(&self, _index: &IndexId) -> Result<IndexStatus> {
        Ok(self.lock().statuses.pop_front().unwrap_or(IndexStatus::Ready))
    }

    async fn dispose(&self, index: &IndexId) -> Result<()> {
        self.lock().disposed.push(index.clone());
        Ok(())
    }
}
