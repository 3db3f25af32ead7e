use async_trait::async_trait;
use focus_board::assistant::client::{
    CompletionClient, CompletionRequest, CompletionResponse, ResponseMessage, ToolCall, ToolFunction,
};
use focus_board::errors::{AppError, AppResult};
use focus_board::models::{BoardEvent, BucketId, ChatRole, NewTask, Priority};
use focus_board::BoardApp;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Replays canned replies in order and records every request it receives.
#[derive(Default)]
struct ScriptedClient {
    replies: Mutex<VecDeque<AppResult<CompletionResponse>>>,
    stream_chunks: Vec<String>,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    fn with_replies(replies: Vec<AppResult<CompletionResponse>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> AppResult<CompletionResponse> {
        self.requests.lock().expect("requests").push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .expect("replies")
            .pop_front()
            .unwrap_or_else(|| Err(AppError::Completion("script exhausted".to_string())))
    }

    async fn stream(&self, request: &CompletionRequest, deltas: mpsc::UnboundedSender<String>) -> AppResult<()> {
        self.requests.lock().expect("requests").push(request.clone());
        for chunk in &self.stream_chunks {
            let _ = deltas.send(chunk.clone());
        }
        Ok(())
    }
}

fn tool_reply(calls: Vec<(&str, serde_json::Value)>, prose: Option<&str>) -> CompletionResponse {
    CompletionResponse {
        message: Some(ResponseMessage {
            content: prose.map(ToString::to_string),
            tool_calls: Some(
                calls
                    .into_iter()
                    .enumerate()
                    .map(|(index, (name, arguments))| ToolCall {
                        id: Some(format!("call-{}", index)),
                        kind: Some("function".to_string()),
                        function: ToolFunction {
                            name: name.to_string(),
                            arguments,
                        },
                    })
                    .collect(),
            ),
        }),
        tool_calls: None,
    }
}

#[tokio::test]
async fn creates_two_finance_tasks_and_confirms() {
    let dir = TempDir::new().expect("tempdir");
    let client = Arc::new(ScriptedClient::with_replies(vec![
        Ok(tool_reply(
            vec![(
                "create_tasks",
                serde_json::Value::String(
                    json!({
                        "tasks": [
                            {"title": "Reconcile invoices", "bucket_id": "finance", "priority": "high"},
                            {"title": "Review budget", "bucket_id": "finance", "priority": "high"}
                        ]
                    })
                    .to_string(),
                ),
            )],
            None,
        )),
        Ok(CompletionResponse::text("Added both tasks to Finance.")),
    ]));
    let app = BoardApp::start_with_client(dir.path(), "owner", client.clone()).await.expect("app");

    let appended = app
        .assistant()
        .send("create 2 tasks in finance: reconcile invoices and review budget, high priority")
        .await
        .expect("send");

    let finance = app.session().tasks_in_bucket(BucketId::Finance, None).await;
    assert_eq!(finance.len(), 2);
    assert!(finance.iter().all(|task| task.priority == Priority::High));

    assert_eq!(appended[0].role, ChatRole::ActionResult);
    assert_eq!(appended[0].content.lines().filter(|line| line.starts_with("✅")).count(), 2);
    assert_eq!(appended[1].role, ChatRole::Assistant);
    assert_eq!(appended[1].content, "Added both tasks to Finance.");

    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].tools.is_some());
    assert!(requests[0].context.as_ref().and_then(|c| c.get("empty_slots")).is_some());
    assert!(requests[1].tools.is_none());
    let last = requests[1].messages.last().expect("follow-up message");
    assert!(last.content.contains("✅"));
    assert!(requests[1].messages.iter().all(|message| message.role != "action_result"));
    app.shutdown().await;
}

#[tokio::test]
async fn failing_actions_do_not_abort_the_batch() {
    let dir = TempDir::new().expect("tempdir");
    let client = Arc::new(ScriptedClient::with_replies(vec![Ok(tool_reply(
        vec![
            ("rename_task", json!({"task_id": "missing", "new_title": "New"})),
            ("move_task_to_slot", json!({"task_id": "x", "slot_number": 12})),
            ("create_tasks", json!({"tasks": [{"title": "Logo refresh", "bucket_id": "branding"}]})),
        ],
        Some("Done what I could."),
    ))]));
    let app = BoardApp::start_with_client(dir.path(), "owner", client.clone()).await.expect("app");

    let appended = app.assistant().send("tidy things up").await.expect("send");
    let lines = appended[0].content.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("❌"));
    assert!(lines[1].starts_with("❌"));
    assert!(lines[2].starts_with("✅"));
    assert_eq!(appended[1].content, "Done what I could.");
    assert_eq!(client.requests().len(), 1);
    assert_eq!(app.session().tasks_in_bucket(BucketId::Branding, None).await.len(), 1);
    app.shutdown().await;
}

#[tokio::test]
async fn stages_a_task_and_reports_occupied_slots() {
    let dir = TempDir::new().expect("tempdir");
    let client = Arc::new(ScriptedClient::default());
    let app = BoardApp::start_with_client(dir.path(), "owner", client.clone()).await.expect("app");
    let session = app.session();
    let first = session
        .add_task(NewTask {
            bucket_id: Some(BucketId::Admin),
            title: "File receipts".to_string(),
            ..Default::default()
        })
        .await
        .expect("add");
    let second = session
        .add_task(NewTask {
            bucket_id: Some(BucketId::Admin),
            title: "Renew domain".to_string(),
            ..Default::default()
        })
        .await
        .expect("add");

    client.replies.lock().expect("replies").push_back(Ok(tool_reply(
        vec![
            ("move_task_to_slot", json!({"task_id": first.id, "slot_number": 1})),
            ("move_task_to_slot", json!({"task_id": second.id, "slot_number": 1})),
        ],
        Some("Staged."),
    )));
    let appended = app.assistant().send("put both admin tasks in slot 1").await.expect("send");
    let lines = appended[0].content.lines().collect::<Vec<_>>();
    assert!(lines[0].starts_with("✅"));
    assert!(lines[1].starts_with("❌"));
    assert!(lines[1].contains("already occupied"));
    assert_eq!(session.empty_slot_numbers().await.len(), 7);
    app.shutdown().await;
}

#[tokio::test]
async fn prose_without_actions_is_shown_directly() {
    let dir = TempDir::new().expect("tempdir");
    let client = Arc::new(ScriptedClient::with_replies(vec![
        Ok(CompletionResponse::text("Focus on finance first.")),
        Ok(CompletionResponse::default()),
    ]));
    let app = BoardApp::start_with_client(dir.path(), "owner", client.clone()).await.expect("app");

    let appended = app.assistant().send("what should I do?").await.expect("send");
    assert_eq!(appended.len(), 1);
    assert_eq!(appended[0].content, "Focus on finance first.");

    let appended = app.assistant().send("and then?").await.expect("send");
    assert_eq!(appended[0].role, ChatRole::Assistant);
    assert!(!appended[0].content.is_empty());
    app.shutdown().await;
}

#[tokio::test]
async fn endpoint_failure_keeps_the_user_turn_and_notifies() {
    let dir = TempDir::new().expect("tempdir");
    let client = Arc::new(ScriptedClient::with_replies(vec![Err(AppError::Completion(
        "Rate limit exceeded. Please try again in a moment.".to_string(),
    ))]));
    let app = BoardApp::start_with_client(dir.path(), "owner", client).await.expect("app");
    let mut events = app.session().subscribe_events();

    let result = app.assistant().send("make a task").await;
    assert!(matches!(result, Err(AppError::Completion(_))));

    let transcript = app.assistant().transcript().await;
    let last = transcript.last().expect("entry");
    assert_eq!(last.role, ChatRole::User);
    assert_eq!(last.content, "make a task");

    loop {
        match events.recv().await.expect("event") {
            BoardEvent::Notification { message, .. } => {
                assert!(message.starts_with("Rate limit exceeded"));
                break;
            }
            _ => continue,
        }
    }
    app.shutdown().await;
}

#[tokio::test]
async fn closing_the_panel_cancels_the_request() {
    let dir = TempDir::new().expect("tempdir");
    let client = Arc::new(ScriptedClient {
        replies: Mutex::new(VecDeque::from(vec![Ok(CompletionResponse::text("too late"))])),
        delay: Some(Duration::from_secs(30)),
        ..Default::default()
    });
    let app = Arc::new(BoardApp::start_with_client(dir.path(), "owner", client).await.expect("app"));
    app.assistant().open_panel().await;
    assert!(app.session().snapshot().await.chat_open);

    let sender = app.clone();
    let pending = tokio::spawn(async move { sender.assistant().send("slow question").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    app.assistant().close_panel().await;

    let result = pending.await.expect("join");
    assert!(matches!(result, Err(AppError::Canceled(_))));
    assert!(!app.session().snapshot().await.chat_open);
    assert!(app
        .assistant()
        .transcript()
        .await
        .iter()
        .all(|entry| entry.content != "too late"));
    app.shutdown().await;
}

#[tokio::test]
async fn streaming_reply_grows_one_assistant_entry() {
    let dir = TempDir::new().expect("tempdir");
    let client = Arc::new(ScriptedClient {
        stream_chunks: vec!["Start with ".to_string(), "the budget.".to_string()],
        ..Default::default()
    });
    let app = BoardApp::start_with_client(dir.path(), "owner", client.clone()).await.expect("app");

    let entry = app.assistant().send_streaming("where do I start?").await.expect("stream");
    assert_eq!(entry.content, "Start with the budget.");
    let transcript = app.assistant().transcript().await;
    assert_eq!(transcript.last().map(|e| e.content.clone()), Some(entry.content));
    assert!(client.requests()[0].stream);
    app.shutdown().await;
}

#[tokio::test]
async fn failed_confirmation_leaves_the_result_lines() {
    let dir = TempDir::new().expect("tempdir");
    let client = Arc::new(ScriptedClient::with_replies(vec![
        Ok(tool_reply(
            vec![(
                "create_tasks",
                json!({"tasks": [{"title": "Update press kit", "bucket_id": "branding"}]}),
            )],
            None,
        )),
        Err(AppError::Completion("AI gateway error (503)".to_string())),
    ]));
    let app = BoardApp::start_with_client(dir.path(), "owner", client.clone()).await.expect("app");

    let appended = app.assistant().send("add a press kit task").await.expect("send");
    assert_eq!(appended.len(), 1);
    assert_eq!(appended[0].role, ChatRole::ActionResult);
    assert!(appended[0].content.starts_with("✅"));
    assert_eq!(client.requests().len(), 2);

    let transcript = app.assistant().transcript().await;
    assert_eq!(transcript.last().map(|entry| entry.role), Some(ChatRole::ActionResult));
    app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_endpoint_times_out_and_notifies() {
    let dir = TempDir::new().expect("tempdir");
    let client = Arc::new(ScriptedClient {
        replies: Mutex::new(VecDeque::from(vec![Ok(CompletionResponse::text("eventually"))])),
        delay: Some(Duration::from_secs(600)),
        ..Default::default()
    });
    let app = BoardApp::start_with_client(dir.path(), "owner", client).await.expect("app");
    let mut events = app.session().subscribe_events();

    let result = app.assistant().send("plan my week").await;
    assert!(matches!(&result, Err(AppError::Completion(message)) if message == "Request timed out."));
    assert_eq!(
        app.assistant().transcript().await.last().map(|entry| entry.content.clone()),
        Some("plan my week".to_string())
    );

    loop {
        if let BoardEvent::Notification { message, .. } = events.recv().await.expect("event") {
            assert_eq!(message, "Request timed out.");
            break;
        }
    }
    app.shutdown().await;
}
