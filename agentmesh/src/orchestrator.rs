use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::agent::{AgentHandler, HandlerOutcome};
use crate::backoff::{retry, RetryPolicy};
use crate::errors::{CollaboratorFailure, MeshError, Result};
use crate::registry::AgentRegistration;
use crate::task::{Task, TaskKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Payload of a `chat` task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRequest {
    pub text: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ChatMessage>,
}

/// Payload of a `chat_reply` task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatReply {
    pub reply_text: String,
    pub session_id: String,
    /// True when the reply is the fallback message.
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationContext {
    pub messages: Vec<ChatMessage>,
}

impl GenerationContext {
    pub fn build(system_prompt: Option<&str>, request: &ChatRequest, history_limit: usize) -> Self {
        let mut messages = Vec::with_capacity(request.history.len().min(history_limit) + 2);
        if let Some(prompt) = system_prompt {
            messages.push(ChatMessage::system(prompt));
        }
        let skip = request.history.len().saturating_sub(history_limit);
        messages.extend(request.history.iter().skip(skip).cloned());
        messages.push(ChatMessage::user(request.text.clone()));
        Self { messages }
    }
}

/// Opaque text generator. Possibly slow, possibly failing.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, context: &GenerationContext) -> Result<String>;
}

/// OpenAI-compatible `/v1/chat/completions` client.
#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| MeshError::InvalidOperation(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }
}

fn collaborator(kind: CollaboratorFailure, detail: impl Into<String>) -> MeshError {
    MeshError::Collaborator {
        kind,
        detail: detail.into(),
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn generate(&self, context: &GenerationContext) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self.http.post(&url).json(&json!({
            "model": self.model,
            "messages": context.messages,
        }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                collaborator(CollaboratorFailure::Timeout, err.to_string())
            } else {
                MeshError::Network(err.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(collaborator(
                CollaboratorFailure::RateLimited,
                format!("{url} answered {status}"),
            ));
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            if status.is_server_error() {
                return Err(MeshError::Network(format!(
                    "language model failed with status {status}: {body}"
                )));
            }
            return Err(collaborator(
                CollaboratorFailure::InvalidResponse,
                format!("status {status}: {body}"),
            ));
        }

        let body: Value = response.json().await.map_err(|err| {
            if err.is_timeout() {
                collaborator(CollaboratorFailure::Timeout, err.to_string())
            } else {
                collaborator(CollaboratorFailure::InvalidResponse, err.to_string())
            }
        })?;
        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                collaborator(
                    CollaboratorFailure::InvalidResponse,
                    "response has no choices[0].message.content",
                )
            })
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub agent_id: String,
    pub queue: String,
    /// Bound on a single `generate` call.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub system_prompt: Option<String>,
    pub history_limit: usize,
    pub fallback_message: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_id: "orchestrator".to_string(),
            queue: "orchestrator".to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::new(2, Duration::from_millis(500)),
            system_prompt: None,
            history_limit: 20,
            fallback_message:
                "Sorry, I can't answer right now. Please try again in a moment.".to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.min(200);
        self
    }

    pub fn with_fallback_message(mut self, message: impl Into<String>) -> Self {
        self.fallback_message = message.into();
        self
    }
}

/// Conversational agent: turns `chat` tasks into `chat_reply` tasks.
pub struct Orchestrator {
    config: OrchestratorConfig,
    model: Arc<dyn LanguageModel>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, model: Arc<dyn LanguageModel>) -> Self {
        Self { config, model }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Never fails on collaborator errors: the caller gets the fallback
    /// message instead. Only cancellation is returned as an error.
    #[instrument(skip(self, request, cancellation), fields(session_id = %request.session_id))]
    pub async fn respond(
        &self,
        request: &ChatRequest,
        cancellation: &CancellationToken,
    ) -> Result<ChatReply> {
        let context = GenerationContext::build(
            self.config.system_prompt.as_deref(),
            request,
            self.config.history_limit,
        );
        let generated = tokio::select! {
            _ = cancellation.cancelled() => return Err(MeshError::Cancelled),
            generated = retry(&self.config.retry, |attempt| {
                let context = &context;
                async move {
                    if attempt > 0 {
                        debug!(attempt, "retrying language model");
                    }
                    let answer = self.model.generate(context);
                    match tokio::time::timeout(self.config.timeout, answer).await {
                        Ok(result) => result,
                        Err(_) => Err(collaborator(
                            CollaboratorFailure::Timeout,
                            format!("no answer within {:?}", self.config.timeout),
                        )),
                    }
                }
            }) => generated,
        };

        match generated {
            Ok(text) if !text.trim().is_empty() => Ok(ChatReply {
                reply_text: text.trim().to_string(),
                session_id: request.session_id.clone(),
                degraded: false,
            }),
            Ok(_) => {
                warn!("language model returned an empty reply, using fallback");
                Ok(self.fallback(request))
            }
            Err(err) => {
                warn!("language model unavailable, using fallback: {err}");
                Ok(self.fallback(request))
            }
        }
    }

    fn fallback(&self, request: &ChatRequest) -> ChatReply {
        ChatReply {
            reply_text: self.config.fallback_message.clone(),
            session_id: request.session_id.clone(),
            degraded: true,
        }
    }
}

#[async_trait]
impl AgentHandler for Orchestrator {
    fn registration(&self) -> AgentRegistration {
        AgentRegistration::new(self.config.agent_id.clone(), self.config.queue.clone())
            .with_kinds([TaskKind::Chat.as_str()])
            .with_description("Answers conversational requests")
    }

    async fn handle(&self, task: Task, cancellation: CancellationToken) -> Result<HandlerOutcome> {
        let request: ChatRequest = serde_json::from_value(task.payload.clone())?;
        let reply = self.respond(&request, &cancellation).await?;
        let payload = serde_json::to_value(&reply)?;
        let mut outcome = HandlerOutcome::done().with_result(payload.clone());
        match &task.reply_to {
            Some(queue) => {
                let reply_task = task.reply(TaskKind::ChatReply, payload, &self.config.agent_id);
                outcome = outcome.send(queue.clone(), reply_task);
            }
            None => debug!(
                task_id = %task.id,
                "chat task has no reply_to; result kept on the status board"
            ),
        }
        Ok(outcome)
    }
}
