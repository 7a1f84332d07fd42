//! OpenAI Assistants v2 backend.
//!
//! One assistant and one thread are created per pipeline run. Every stage
//! posts a user message to the thread and starts a run; the reply is the
//! newest assistant message once the run completes. Reference files are
//! uploaded to a vector store that the assistant searches with `file_search`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, multipart};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};
use url::Url;

use coursesmith_shared::{CourseError, OpenAiConfig, Result};

use crate::{
    BackendRunId, DocumentIndex, IndexId, IndexStatus, ModelBackend, RunStatus, SessionId,
};

/// Default timeout in seconds for a single HTTP request.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Messages fetched when looking for the newest assistant reply.
const MESSAGE_PAGE_SIZE: &str = "20";

/// Name given to the per-run assistant.
const ASSISTANT_NAME: &str = "Course Generator";

/// User-Agent string for API requests.
const USER_AGENT: &str = concat!("coursesmith/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Connection settings for [`OpenAiAssistants`].
#[derive(Debug, Clone)]
pub struct OpenAiOptions {
    pub api_key: String,
    pub model: String,
    /// API root, with a trailing slash.
    pub base_url: Url,
    /// System instructions for the per-run assistant.
    pub instructions: String,
    pub timeout_secs: u64,
}

impl OpenAiOptions {
    pub fn new(api_key: impl Into<String>, config: &OpenAiConfig) -> Self {
        Self {
            api_key: api_key.into(),
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            instructions: String::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    status: String,
    #[serde(default)]
    last_error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    role: String,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum MessageContent {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

#[derive(Debug, Deserialize)]
struct VectorStoreObject {
    status: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`ModelBackend`] and [`DocumentIndex`] over the Assistants v2 REST API.
#[derive(Debug, Clone)]
pub struct OpenAiAssistants {
    client: Client,
    options: OpenAiOptions,
}

impl OpenAiAssistants {
    pub fn new(options: OpenAiOptions) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", options.api_key))
            .map_err(|e| CourseError::config(format!("invalid API key: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("openai-beta", HeaderValue::from_static("assistants=v2"));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .map_err(|e| CourseError::Backend(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, options })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.options
            .base_url
            .join(path)
            .map_err(|e| CourseError::Backend(format!("invalid endpoint {path}: {e}")))
    }

    /// Send a request and decode the JSON body, turning API errors into backend errors.
    async fn send<T: DeserializeOwned>(&self, what: &str, request: RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| CourseError::Backend(format!("{what}: request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CourseError::Backend(format!("{what}: failed to read body: {e}")))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(CourseError::Backend(format!(
                "{what}: HTTP {}: {detail}",
                status.as_u16()
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| CourseError::Backend(format!("{what}: unexpected response: {e}")))
    }

    async fn upload_file(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CourseError::io(path, e))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "reference".into());

        let form = multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", multipart::Part::bytes(bytes).file_name(file_name));

        let created: Created = self
            .send("upload file", self.client.post(self.url("files")?).multipart(form))
            .await?;
        Ok(created.id)
    }
}

/// Map an Assistants run status onto [`RunStatus`].
fn map_run_status(run: RunObject) -> RunStatus {
    match run.status.as_str() {
        "completed" => RunStatus::Completed,
        "expired" => RunStatus::Expired,
        "failed" => RunStatus::Failed {
            reason: run
                .last_error
                .map(|e| e.message)
                .unwrap_or_else(|| "run failed".into()),
        },
        "cancelled" | "incomplete" => RunStatus::Failed {
            reason: format!("run {}", run.status),
        },
        _ => RunStatus::Pending,
    }
}

fn map_index_status(store: VectorStoreObject) -> IndexStatus {
    match store.status.as_str() {
        "completed" => IndexStatus::Ready,
        "in_progress" => IndexStatus::Building,
        other => IndexStatus::Failed {
            reason: other.to_string(),
        },
    }
}

/// First text part of the newest assistant message in a desc-ordered page.
fn newest_assistant_text(list: MessageList) -> Option<String> {
    list.data
        .into_iter()
        .find(|m| m.role == "assistant")
        .and_then(|m| {
            m.content.into_iter().find_map(|c| match c {
                MessageContent::Text { text } => Some(text.value.trim().to_string()),
                MessageContent::Other => None,
            })
        })
}

#[async_trait]
impl ModelBackend for OpenAiAssistants {
    #[instrument(skip_all, fields(model = %self.options.model))]
    async fn create_session(&self, index: Option<&IndexId>) -> Result<SessionId> {
        let mut body = json!({
            "model": self.options.model,
            "name": ASSISTANT_NAME,
            "tools": [{ "type": "file_search" }],
        });
        if !self.options.instructions.is_empty() {
            body["instructions"] = Value::String(self.options.instructions.clone());
        }
        if let Some(index) = index {
            body["tool_resources"] = json!({
                "file_search": { "vector_store_ids": [index.0] }
            });
        }

        let assistant: Created = self
            .send(
                "create assistant",
                self.client.post(self.url("assistants")?).json(&body),
            )
            .await?;
        let thread: Created = self
            .send(
                "create thread",
                self.client.post(self.url("threads")?).json(&json!({})),
            )
            .await?;

        info!(assistant = %assistant.id, thread = %thread.id, "session created");
        Ok(SessionId {
            assistant_id: assistant.id,
            thread_id: thread.id,
        })
    }

    #[instrument(skip_all, fields(thread = %session.thread_id, chars = message.len()))]
    async fn submit(&self, session: &SessionId, message: &str) -> Result<BackendRunId> {
        let messages = self.url(&format!("threads/{}/messages", session.thread_id))?;
        let _: Created = self
            .send(
                "post message",
                self.client
                    .post(messages)
                    .json(&json!({ "role": "user", "content": message })),
            )
            .await?;

        let runs = self.url(&format!("threads/{}/runs", session.thread_id))?;
        let run: Created = self
            .send(
                "start run",
                self.client
                    .post(runs)
                    .json(&json!({ "assistant_id": session.assistant_id })),
            )
            .await?;

        debug!(run = %run.id, "run started");
        Ok(BackendRunId(run.id))
    }

    async fn poll_status(&self, session: &SessionId, run: &BackendRunId) -> Result<RunStatus> {
        let url = self.url(&format!("threads/{}/runs/{}", session.thread_id, run.0))?;
        let run: RunObject = self.send("poll run", self.client.get(url)).await?;
        Ok(map_run_status(run))
    }

    async fn latest_assistant_message(&self, session: &SessionId) -> Result<Option<String>> {
        let url = self.url(&format!("threads/{}/messages", session.thread_id))?;
        let list: MessageList = self
            .send(
                "list messages",
                self.client
                    .get(url)
                    .query(&[("order", "desc"), ("limit", MESSAGE_PAGE_SIZE)]),
            )
            .await?;
        Ok(newest_assistant_text(list))
    }
}

#[async_trait]
impl DocumentIndex for OpenAiAssistants {
    #[instrument(skip_all, fields(name = %name, files = files.len()))]
    async fn build_index(&self, name: &str, files: &[PathBuf]) -> Result<IndexId> {
        let mut file_ids = Vec::with_capacity(files.len());
        for path in files {
            let id = self
                .upload_file(path)
                .await
                .map_err(|e| CourseError::Ingestion(format!("{}: {e}", path.display())))?;
            debug!(file = %path.display(), id = %id, "file uploaded");
            file_ids.push(id);
        }

        let store: Created = self
            .send(
                "create vector store",
                self.client
                    .post(self.url("vector_stores")?)
                    .json(&json!({ "name": name, "file_ids": file_ids })),
            )
            .await
            .map_err(|e| CourseError::Ingestion(e.to_string()))?;

        info!(index = %store.id, "vector store created");
        Ok(IndexId(store.id))
    }

    async fn index_status(&self, index: &IndexId) -> Result<IndexStatus> {
        let url = self.url(&format!("vector_stores/{}", index.0))?;
        let store: VectorStoreObject = self.send("poll vector store", self.client.get(url)).await?;
        Ok(map_index_status(store))
    }

    async fn dispose(&self, index: &IndexId) -> Result<()> {
        let url = self.url(&format!("vector_stores/{}", index.0))?;
        let _: Value = self
            .send("delete vector store", self.client.delete(url))
            .await?;
        info!(index = %index, "vector store deleted");
        Ok(())
    }
}
