use super::stream::{parse_sse_line, LineBuffer, SseEvent};
use crate::errors::{AppError, AppResult};
use crate::redaction::Redactor;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

const MAX_PENDING_LINE_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<WireMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    /// Either a JSON-encoded string or an already decoded object.
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub message: Option<ResponseMessage>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl CompletionResponse {
    pub fn text(text: &str) -> Self {
        Self {
            message: Some(ResponseMessage {
                content: Some(text.to_string()),
                tool_calls: None,
            }),
            tool_calls: None,
        }
    }

    /// Trimmed prose, if the model produced any.
    pub fn content(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|message| message.content.as_deref())
            .map(str::trim)
            .filter(|content| !content.is_empty())
    }

    /// Tool calls from the message, falling back to the top-level list.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.message
            .as_ref()
            .and_then(|message| message.tool_calls.clone())
            .filter(|calls| !calls.is_empty())
            .or_else(|| self.tool_calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> AppResult<CompletionResponse>;

    /// Sends text deltas through `deltas` as they arrive and returns once the
    /// stream ends.
    async fn stream(&self, request: &CompletionRequest, deltas: mpsc::UnboundedSender<String>) -> AppResult<()>;
}

pub struct HttpCompletionClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    redactor: Redactor,
}

impl HttpCompletionClient {
    pub fn new(url: &str, token: Option<String>) -> AppResult<Self> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AppError::Validation(format!("Invalid completion URL '{}'", url)));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("focus-board/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            url: url.to_string(),
            redactor: Redactor::new(token.clone()),
            token,
        })
    }

    async fn post(&self, request: &CompletionRequest) -> AppResult<reqwest::Response> {
        let mut builder = self.http.post(&self.url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let summary = self.redactor.summarize_error_body(&body);
        tracing::warn!(status, body = %summary, "completion endpoint returned an error");
        Err(status_error(status, &summary))
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> AppResult<CompletionResponse> {
        let response = self.post(request).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|error| {
            AppError::Completion(format!("Unreadable completion response: {}", error))
        })
    }

    async fn stream(&self, request: &CompletionRequest, deltas: mpsc::UnboundedSender<String>) -> AppResult<()> {
        let response = self.post(request).await?;
        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new(Some(MAX_PENDING_LINE_BYTES));

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                match parse_sse_line(&line) {
                    Some(SseEvent::Delta(delta)) => {
                        if deltas.send(delta).is_err() {
                            return Ok(());
                        }
                    }
                    Some(SseEvent::Done) => return Ok(()),
                    None => {}
                }
            }
            let dropped = lines.consume_overflowed_bytes();
            if dropped > 0 {
                tracing::warn!(dropped, "stream line exceeded buffer limit");
            }
        }

        if let Some(SseEvent::Delta(delta)) = parse_sse_line(&lines.flush()) {
            let _ = deltas.send(delta);
        }
        Ok(())
    }
}

fn status_error(status: u16, summary: &str) -> AppError {
    match status {
        429 => AppError::Completion("Rate limit exceeded. Please try again in a moment.".to_string()),
        402 => AppError::Completion("AI credits depleted. Please add credits in Settings.".to_string()),
        _ if summary.is_empty() => AppError::Completion(format!("AI gateway error ({})", status)),
        _ => AppError::Completion(format!("AI gateway error ({}): {}", status, summary)),
    }
}

#[cfg(test)]
mod tests {
    use super::{CompletionClient, CompletionRequest, CompletionResponse, HttpCompletionClient, WireMessage};
    use crate::errors::AppError;
    use tokio::sync::mpsc;

    fn request(stream: bool) -> CompletionRequest {
        CompletionRequest {
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: "hello".to_string(),
            }],
            stream,
            ..Default::default()
        }
    }

    #[test]
    fn reads_tool_calls_with_string_or_object_arguments() {
        let response: CompletionResponse = serde_json::from_value(serde_json::json!({
            "message": {
                "content": "  ",
                "tool_calls": [
                    {"id": "1", "type": "function", "function": {"name": "rename_task", "arguments": "{\"task_id\":\"a\",\"new_title\":\"b\"}"}},
                    {"id": "2", "type": "function", "function": {"name": "delete_tasks", "arguments": {"task_ids": ["a"]}}}
                ]
            }
        }))
        .expect("response");
        assert_eq!(response.content(), None);
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].function.arguments.is_string());
        assert!(calls[1].function.arguments.is_object());
    }

    #[test]
    fn falls_back_to_top_level_tool_calls() {
        let response: CompletionResponse = serde_json::from_value(serde_json::json!({
            "message": {"content": "ok"},
            "tool_calls": [{"function": {"name": "delete_tasks", "arguments": "{}"}}]
        }))
        .expect("response");
        assert_eq!(response.content(), Some("ok"));
        assert_eq!(response.tool_calls().len(), 1);
    }

    #[test]
    fn request_omits_unset_fields() {
        let body = serde_json::to_value(request(false)).expect("json");
        assert!(body.get("stream").is_none());
        assert!(body.get("tools").is_none());
        let body = serde_json::to_value(request(true)).expect("json");
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn maps_rate_limit_and_credit_errors() {
        let mut server = mockito::Server::new_async().await;
        let _limited = server
            .mock("POST", "/limited")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;
        let _broke = server
            .mock("POST", "/broke")
            .with_status(402)
            .create_async()
            .await;

        let client = HttpCompletionClient::new(&format!("{}/limited", server.url()), None).expect("client");
        let error = client.complete(&request(false)).await.expect_err("429");
        assert!(matches!(&error, AppError::Completion(message) if message.starts_with("Rate limit exceeded")));

        let client = HttpCompletionClient::new(&format!("{}/broke", server.url()), None).expect("client");
        let error = client.complete(&request(false)).await.expect_err("402");
        assert!(matches!(&error, AppError::Completion(message) if message.starts_with("AI credits depleted")));
    }

    #[tokio::test]
    async fn gateway_errors_are_redacted() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat")
            .with_status(500)
            .with_body("upstream rejected key sk-abcdefghijklmnopqrstuvwxyz123456")
            .create_async()
            .await;
        let client = HttpCompletionClient::new(&format!("{}/chat", server.url()), None).expect("client");
        let error = client.complete(&request(false)).await.expect_err("500");
        let message = error.detail().to_string();
        assert!(message.contains("AI gateway error (500)"));
        assert!(!message.contains("sk-abcdefghijklmnopqrstuvwxyz123456"));
    }

    #[tokio::test]
    async fn sends_bearer_token_and_parses_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat")
            .match_header("authorization", "Bearer secret-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":{"content":"Done."}}"#)
            .create_async()
            .await;
        let client = HttpCompletionClient::new(&format!("{}/chat", server.url()), Some("secret-token".to_string()))
            .expect("client");
        let response = client.complete(&request(false)).await.expect("response");
        assert_eq!(response.content(), Some("Done."));
    }

    #[tokio::test]
    async fn streams_deltas_until_done() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            ": ping\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"content\":\"ignored\"}\n"
        );
        let _mock = server
            .mock("POST", "/chat")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;
        let client = HttpCompletionClient::new(&format!("{}/chat", server.url()), None).expect("client");
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.stream(&request(true), tx).await.expect("stream");

        let mut text = String::new();
        while let Some(delta) = rx.recv().await {
            text.push_str(&delta);
        }
        assert_eq!(text, "Hello");
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(HttpCompletionClient::new("ftp://example.com", None).is_err());
    }
}
