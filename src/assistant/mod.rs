//! Chat assistant that turns free-text requests into board actions.
//!
//! A send is a two-step exchange. The first request carries the transcript,
//! a board context snapshot and the tool catalog. Returned tool calls run in
//! order against the session and their results land in the transcript as an
//! `action_result` entry. When the model returned actions but no prose, a
//! second request asks it to confirm what was done.

pub mod client;
pub mod context;
pub mod stream;
pub mod tools;

use self::client::{CompletionClient, CompletionRequest, WireMessage};
use self::stream::DeltaCollector;
use crate::errors::{AppError, AppResult};
use crate::models::{AppSettings, ChatEntry, ChatRole, NotificationLevel};
use crate::sync::BoardSession;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const FALLBACK_REPLY: &str = "I couldn't work out what to change. Could you rephrase that?";
const FOLLOW_UP_PROMPT: &str = "Briefly confirm to me what you just did, in one or two sentences.";

#[derive(Clone)]
pub struct AssistantBridge {
    session: BoardSession,
    client: Arc<dyn CompletionClient>,
    transcript: Arc<Mutex<Vec<ChatEntry>>>,
    inflight: Arc<Mutex<Option<(String, CancellationToken)>>>,
    request_timeout: Duration,
    model: Option<String>,
}

impl AssistantBridge {
    pub fn new(session: BoardSession, client: Arc<dyn CompletionClient>, settings: &AppSettings) -> Self {
        let greeting = settings.greeting.trim();
        let transcript = if greeting.is_empty() {
            Vec::new()
        } else {
            vec![chat_entry(ChatRole::Assistant, greeting)]
        };
        Self {
            session,
            client,
            transcript: Arc::new(Mutex::new(transcript)),
            inflight: Arc::new(Mutex::new(None)),
            request_timeout: Duration::from_secs(settings.request_timeout_secs.max(1)),
            model: settings.model.clone(),
        }
    }

    pub async fn transcript(&self) -> Vec<ChatEntry> {
        self.transcript.lock().await.clone()
    }

    pub async fn open_panel(&self) {
        self.session.set_chat_open(true).await;
    }

    /// Closing the panel abandons any request still in flight.
    pub async fn close_panel(&self) {
        self.cancel().await;
        self.session.set_chat_open(false).await;
    }

    pub async fn cancel(&self) {
        if let Some((_, token)) = self.inflight.lock().await.take() {
            token.cancel();
        }
    }

    /// Sends `text` and returns the entries appended after the user turn.
    pub async fn send(&self, text: &str) -> AppResult<Vec<ChatEntry>> {
        let (request_id, token) = self.begin(text).await?;
        let result = self.exchange(&token).await;
        self.finish(&request_id).await;
        result
    }

    /// Streams the reply into a growing assistant entry. Tools are not
    /// offered on this path.
    pub async fn send_streaming(&self, text: &str) -> AppResult<ChatEntry> {
        let (request_id, token) = self.begin(text).await?;
        let result = self.stream_exchange(&token).await;
        self.finish(&request_id).await;
        result
    }

    async fn begin(&self, text: &str) -> AppResult<(String, CancellationToken)> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Message cannot be empty".to_string()));
        }
        let request_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        if let Some((previous_id, previous)) = self.inflight.lock().await.replace((request_id.clone(), token.clone())) {
            tracing::debug!(request_id = %previous_id, "superseding in-flight assistant request");
            previous.cancel();
        }
        self.transcript.lock().await.push(chat_entry(ChatRole::User, text));
        Ok((request_id, token))
    }

    async fn finish(&self, request_id: &str) {
        let mut inflight = self.inflight.lock().await;
        if inflight.as_ref().map(|(current, _)| current == request_id).unwrap_or(false) {
            *inflight = None;
        }
    }

    async fn exchange(&self, token: &CancellationToken) -> AppResult<Vec<ChatEntry>> {
        let request = self.request(Some(tools::tool_catalog()), false).await;
        let response = self.guarded(token, self.client.complete(&request)).await.map_err(|error| self.report(error))?;

        let calls = response.tool_calls();
        let prose = response.content().map(ToString::to_string);
        let mut appended = Vec::new();

        if calls.is_empty() {
            let reply = prose.unwrap_or_else(|| FALLBACK_REPLY.to_string());
            appended.push(self.append(ChatRole::Assistant, &reply).await);
            return Ok(appended);
        }

        tracing::info!(actions = calls.len(), "executing assistant actions");
        let outcomes = tools::execute_tool_calls(&self.session, &calls).await;
        let summary = outcomes.iter().map(tools::ActionOutcome::line).collect::<Vec<_>>().join("\n");
        appended.push(self.append(ChatRole::ActionResult, &summary).await);

        if let Some(prose) = prose {
            appended.push(self.append(ChatRole::Assistant, &prose).await);
            return Ok(appended);
        }

        let mut follow_up = self.request(None, false).await;
        follow_up.messages.push(WireMessage {
            role: "user".to_string(),
            content: format!("Actions taken:\n{}\n\n{}", summary, FOLLOW_UP_PROMPT),
        });
        match self.guarded(token, self.client.complete(&follow_up)).await {
            Ok(response) => {
                if let Some(confirmation) = response.content() {
                    appended.push(self.append(ChatRole::Assistant, confirmation).await);
                }
            }
            Err(error) => {
                tracing::debug!(error = %error, "follow-up confirmation skipped");
            }
        }
        Ok(appended)
    }

    async fn stream_exchange(&self, token: &CancellationToken) -> AppResult<ChatEntry> {
        let request = self.request(None, true).await;
        let entry_id = self.append(ChatRole::Assistant, "").await.id;

        let (deltas, mut received) = mpsc::unbounded_channel::<String>();
        let transcript = self.transcript.clone();
        let target = entry_id.clone();
        let consume = async move {
            let mut collector = DeltaCollector::default();
            while let Some(delta) = received.recv().await {
                collector.push(&delta);
                let mut entries = transcript.lock().await;
                if let Some(entry) = entries.iter_mut().find(|entry| entry.id == target) {
                    entry.content.push_str(&delta);
                }
            }
            collector
        };
        let produce = self.client.stream(&request, deltas);
        let outcome = self
            .guarded(token, async {
                let (result, collector) = tokio::join!(produce, consume);
                result.map(|()| collector)
            })
            .await;

        let mut entries = self.transcript.lock().await;
        let position = entries.iter().position(|entry| entry.id == entry_id);
        match outcome {
            Ok(collector) => {
                tracing::debug!(deltas = collector.delta_count(), "assistant stream finished");
                let Some(position) = position else {
                    return Err(AppError::Internal("streamed entry disappeared".to_string()));
                };
                let entry = &mut entries[position];
                entry.content = collector.text();
                if entry.content.is_empty() {
                    entry.content = FALLBACK_REPLY.to_string();
                }
                Ok(entry.clone())
            }
            Err(error) => {
                if let Some(position) = position {
                    if entries[position].content.trim().is_empty() {
                        entries.remove(position);
                    }
                }
                drop(entries);
                Err(self.report(error))
            }
        }
    }

    async fn request(&self, tools: Option<serde_json::Value>, stream: bool) -> CompletionRequest {
        let messages = self
            .transcript
            .lock()
            .await
            .iter()
            .filter(|entry| entry.role != ChatRole::ActionResult && !entry.content.trim().is_empty())
            .map(|entry| WireMessage {
                role: entry.role.as_str().to_string(),
                content: entry.content.clone(),
            })
            .collect();
        let snapshot = self.session.snapshot().await;
        CompletionRequest {
            messages,
            context: Some(context::board_context(&snapshot)),
            tools,
            stream,
            model: self.model.clone(),
        }
    }

    async fn guarded<T>(&self, token: &CancellationToken, work: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        tokio::select! {
            _ = token.cancelled() => Err(AppError::Canceled("The request was superseded".to_string())),
            result = tokio::time::timeout(self.request_timeout, work) => match result {
                Ok(result) => result,
                Err(_) => Err(AppError::Completion("Request timed out.".to_string())),
            },
        }
    }

    /// Surfaces endpoint failures to the user. Cancellation stays quiet.
    fn report(&self, error: AppError) -> AppError {
        if error.is_remote() {
            tracing::warn!(error = %error, "assistant request failed");
            self.session.notify(NotificationLevel::Error, error.detail());
        }
        error
    }

    async fn append(&self, role: ChatRole, content: &str) -> ChatEntry {
        let entry = chat_entry(role, content);
        self.transcript.lock().await.push(entry.clone());
        entry
    }
}

fn chat_entry(role: ChatRole, content: &str) -> ChatEntry {
    ChatEntry {
        id: Uuid::new_v4().to_string(),
        role,
        content: content.to_string(),
        created_at: Utc::now(),
    }
}
