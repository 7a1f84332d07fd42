//! Generation step executor.
//!
//! Sends one prompt plus its serialized context into the run's session,
//! waits for the backend run to finish and routes the newest assistant
//! message through the normalizer. Typed wrappers decode the normalized
//! payload into artifact types.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use coursesmith_backend::{BackendRunId, ModelBackend, RunStatus, SessionId};
use coursesmith_ingest::truncate_chars;
use coursesmith_normalizer::{Normalized, OutputKind, normalize};
use coursesmith_shared::{CourseError, DetailId, GenerationProfile, GenerationSettings, Result};

use crate::artifact::{
    CourseInfo, LessonBody, LessonContent, LessonOutline, Overview, Question, Quiz, Section,
};
use crate::context::Context;
use crate::prompts;

/// One model interaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    TocExtraction,
    Overview,
    Sections,
    Lessons,
    LessonDetail,
    Quiz,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TocExtraction => "toc_extraction",
            Self::Overview => "overview",
            Self::Sections => "sections",
            Self::Lessons => "lessons",
            Self::LessonDetail => "lesson_detail",
            Self::Quiz => "quiz",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw and normalized reply of one stage.
#[derive(Debug, Clone)]
pub struct StageReply {
    pub raw: String,
    pub payload: Normalized,
}

/// Executes generation steps against a [`ModelBackend`].
pub struct StageExecutor {
    backend: Arc<dyn ModelBackend>,
    poll_interval: Duration,
    stage_timeout: Option<Duration>,
    cancel: Mutex<CancellationToken>,
}

impl StageExecutor {
    pub fn new(backend: Arc<dyn ModelBackend>, settings: &GenerationSettings) -> Self {
        Self {
            backend,
            poll_interval: settings.poll_interval,
            stage_timeout: settings.stage_timeout,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    /// Stop waiting on the stage currently in flight.
    ///
    /// The backend run itself keeps going; its result is ignored.
    pub fn cancel(&self) {
        self.token().cancel();
    }

    fn token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn fresh_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token.clone();
        token
    }

    /// Submit `prompt` with `context`, wait for the run and normalize the reply.
    #[instrument(skip_all, fields(step = %step))]
    pub async fn run_stage(
        &self,
        session: &SessionId,
        step: Step,
        prompt: &str,
        context: &Context,
        kind: OutputKind,
    ) -> Result<StageReply> {
        let start = Instant::now();
        let token = self.fresh_token();

        let context_json = serde_json::to_string(context)
            .map_err(|e| CourseError::Backend(format!("failed to serialize context: {e}")))?;
        let message = format!("{prompt}\n\nContext: {context_json}");
        debug!(context = %truncate_chars(&context_json, 2_000), "submitting stage");

        let run = self.backend.submit(session, &message).await?;
        let wait = self.wait_for_run(session, &run, step, &token);
        match self.stage_timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                CourseError::StageTimeout {
                    stage: step.to_string(),
                    elapsed: limit,
                }
            })??,
            None => wait.await?,
        }

        let raw = self
            .backend
            .latest_assistant_message(session)
            .await?
            .ok_or_else(|| CourseError::NoResponse {
                stage: step.to_string(),
            })?;
        debug!(raw = %truncate_chars(&raw, 2_000), "stage reply");

        let payload = normalize(&raw, kind)?;
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "stage completed");
        Ok(StageReply { raw, payload })
    }

    async fn wait_for_run(
        &self,
        session: &SessionId,
        run: &BackendRunId,
        step: Step,
        token: &CancellationToken,
    ) -> Result<()> {
        loop {
            if token.is_cancelled() {
                return Err(CourseError::Cancelled {
                    stage: step.to_string(),
                });
            }
            match self.backend.poll_status(session, run).await? {
                RunStatus::Completed => return Ok(()),
                RunStatus::Failed { reason } => {
                    return Err(CourseError::Backend(format!("{step} run failed: {reason}")));
                }
                RunStatus::Expired => {
                    return Err(CourseError::Backend(format!("{step} run expired")));
                }
                RunStatus::Pending => {}
            }
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(CourseError::Cancelled { stage: step.to_string() });
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Typed stages
    // -----------------------------------------------------------------------

    /// Extract the reference material's outline. `None` means no structure.
    pub async fn toc(&self, session: &SessionId, context: &Context) -> Result<Option<String>> {
        let reply = self
            .run_stage(
                session,
                Step::TocExtraction,
                prompts::TOC_EXTRACTION,
                context,
                OutputKind::RawSentinel,
            )
            .await?;
        Ok(match reply.payload {
            Normalized::Absent => None,
            Normalized::Text(text) | Normalized::Content(text) => {
                Some(text).filter(|t| !t.trim().is_empty())
            }
            Normalized::Structured(value) => {
                Some(serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()))
            }
        })
    }

    pub async fn overview(
        &self,
        session: &SessionId,
        profile: GenerationProfile,
        context: &Context,
    ) -> Result<Overview> {
        match profile {
            GenerationProfile::StrictStructure => {
                let reply = self
                    .run_stage(
                        session,
                        Step::Overview,
                        prompts::COURSE_INFO_JSON,
                        context,
                        OutputKind::Structured,
                    )
                    .await?;
                let value = structured(reply.payload, &reply.raw)?;
                let value = unwrap_key(value, "course_info");
                let wire: WireCourseInfo = decode(value, "course overview", &reply.raw)?;
                Ok(Overview::Structured(wire.into()))
            }
            GenerationProfile::FreeformMarkdown => {
                let reply = self
                    .run_stage(
                        session,
                        Step::Overview,
                        prompts::COURSE_INFO_MARKDOWN,
                        context,
                        OutputKind::Delimited,
                    )
                    .await?;
                Ok(Overview::Prose(content(reply.payload, &reply.raw)?))
            }
        }
    }

    pub async fn sections(&self, session: &SessionId, context: &Context) -> Result<Vec<Section>> {
        let reply = self
            .run_stage(
                session,
                Step::Sections,
                prompts::SECTION_GENERATION,
                context,
                OutputKind::Structured,
            )
            .await?;
        let items = list_payload(structured(reply.payload, &reply.raw)?, "sections");
        let wire: Vec<WireSection> = decode(items, "section list", &reply.raw)?;
        if wire.is_empty() {
            return Err(CourseError::normalization("section list is empty", reply.raw));
        }
        Ok(wire
            .into_iter()
            .map(|s| Section::new(s.title, s.description, s.estimated_time.0))
            .collect())
    }

    pub async fn lesson_outlines(
        &self,
        session: &SessionId,
        context: &Context,
    ) -> Result<Vec<LessonOutline>> {
        let reply = self
            .run_stage(
                session,
                Step::Lessons,
                prompts::LESSON_GENERATION,
                context,
                OutputKind::Structured,
            )
            .await?;
        let items = list_payload(structured(reply.payload, &reply.raw)?, "lessons");
        let wire: Vec<WireLesson> = decode(items, "lesson list", &reply.raw)?;
        if wire.is_empty() {
            return Err(CourseError::normalization("lesson list is empty", reply.raw));
        }
        Ok(wire
            .into_iter()
            .map(|l| LessonOutline::new(l.title, l.duration.0, l.brief))
            .collect())
    }

    pub async fn lesson_body(
        &self,
        session: &SessionId,
        profile: GenerationProfile,
        context: &Context,
    ) -> Result<LessonBody> {
        match profile {
            GenerationProfile::StrictStructure => {
                let reply = self
                    .run_stage(
                        session,
                        Step::LessonDetail,
                        prompts::LESSON_DETAIL_JSON,
                        context,
                        OutputKind::Structured,
                    )
                    .await?;
                let value = unwrap_key(structured(reply.payload, &reply.raw)?, "lesson_content");
                let content: LessonContent = decode(value, "lesson content", &reply.raw)?;
                Ok(LessonBody::Structured(content))
            }
            GenerationProfile::FreeformMarkdown => {
                let reply = self
                    .run_stage(
                        session,
                        Step::LessonDetail,
                        prompts::LESSON_DETAIL_MARKDOWN,
                        context,
                        OutputKind::Delimited,
                    )
                    .await?;
                Ok(LessonBody::Markdown(content(reply.payload, &reply.raw)?))
            }
        }
    }

    pub async fn quiz(
        &self,
        session: &SessionId,
        detail_id: DetailId,
        context: &Context,
    ) -> Result<Quiz> {
        let reply = self
            .run_stage(
                session,
                Step::Quiz,
                prompts::QUIZ_GENERATION,
                context,
                OutputKind::Structured,
            )
            .await?;
        let items = list_payload(structured(reply.payload, &reply.raw)?, "questions");
        let questions: Vec<Question> = decode(items, "quiz", &reply.raw)?;
        Quiz::new(detail_id, questions).map_err(|e| {
            let message = match e {
                CourseError::Validation { message } => message,
                other => other.to_string(),
            };
            CourseError::normalization(message, reply.raw.clone())
        })
    }
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

fn structured(payload: Normalized, raw: &str) -> Result<Value> {
    match payload {
        Normalized::Structured(value) => Ok(value),
        _ => Err(CourseError::normalization("expected a structured payload", raw)),
    }
}

fn content(payload: Normalized, raw: &str) -> Result<String> {
    match payload {
        Normalized::Content(text) | Normalized::Text(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(CourseError::normalization("no content found", raw)),
    }
}

fn decode<T: DeserializeOwned>(value: Value, what: &str, raw: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| CourseError::normalization(format!("unexpected {what} shape: {e}"), raw))
}

/// `{key: inner}` becomes `inner`; anything else passes through.
fn unwrap_key(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(key) => {
            map.remove(key).unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Accept `{key: [...]}` or a bare array.
fn list_payload(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut map) => map.remove(key).unwrap_or(Value::Object(map)),
        other => other,
    }
}

/// Minutes given as a number or as text such as "90 minutes".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Minutes(u32);

impl<'de> Deserialize<'de> for Minutes {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(de)?;
        let minutes = match &value {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
                .unwrap_or(0),
            Value::String(s) => s
                .trim()
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0),
            _ => 0,
        };
        Ok(Self(u32::try_from(minutes).unwrap_or(u32::MAX)))
    }
}

#[derive(Debug, Deserialize)]
struct WireCourseInfo {
    course_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    prerequisites: Value,
    #[serde(default)]
    learning_outcomes: Vec<String>,
}

impl From<WireCourseInfo> for CourseInfo {
    fn from(wire: WireCourseInfo) -> Self {
        let prerequisites = match wire.prerequisites {
            Value::String(s) => s,
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect::<Vec<_>>()
                .join("; "),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Self {
            course_name: wire.course_name,
            description: wire.description,
            prerequisites,
            learning_outcomes: wire.learning_outcomes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireSection {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    estimated_time: Minutes,
}

#[derive(Debug, Deserialize)]
struct WireLesson {
    title: String,
    #[serde(default)]
    duration: Minutes,
    #[serde(default, alias = "description")]
    brief: String,
}
