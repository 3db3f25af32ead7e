use crate::errors::AppError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

pub const SLOT_COUNT: u8 = 8;
pub const DEFAULT_SPRINT_SECS: u32 = 3600;
pub const DEFAULT_WARNING_THRESHOLD_SECS: u32 = 300;
pub const DEFAULT_DURATION_PRESETS_SECS: [u32; 4] = [15 * 60, 25 * 60, 45 * 60, 60 * 60];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BucketId {
    Finance,
    Admin,
    Content,
    Ads,
    Product,
    Website,
    Branding,
    Music,
}

impl BucketId {
    pub const ALL: [BucketId; 8] = [
        Self::Finance,
        Self::Admin,
        Self::Content,
        Self::Ads,
        Self::Product,
        Self::Website,
        Self::Branding,
        Self::Music,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finance => "finance",
            Self::Admin => "admin",
            Self::Content => "content",
            Self::Ads => "ads",
            Self::Product => "product",
            Self::Website => "website",
            Self::Branding => "branding",
            Self::Music => "music",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Finance => "Finance",
            Self::Admin => "Admin/Ops",
            Self::Content => "Content",
            Self::Ads => "Ads",
            Self::Product => "Product Dev",
            Self::Website => "Website/UX",
            Self::Branding => "Branding",
            Self::Music => "Music",
        }
    }
}

impl FromStr for BucketId {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|bucket| bucket.as_str() == raw.trim())
            .ok_or_else(|| AppError::Validation(format!("Unknown bucket '{}'", raw)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(AppError::Validation(format!("Unknown priority '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KanbanColumn {
    #[default]
    Todo,
    InProgress,
    Done,
}

impl KanbanColumn {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in-progress",
            Self::Done => "done",
        }
    }
}

impl FromStr for KanbanColumn {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "todo" => Ok(Self::Todo),
            "in-progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            other => Err(AppError::Validation(format!("Unknown column '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimerState {
    #[default]
    Idle,
    Running,
    Paused,
    Logging,
}

impl TimerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Logging => "logging",
        }
    }
}

impl FromStr for TimerState {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "logging" => Ok(Self::Logging),
            other => Err(AppError::Validation(format!("Unknown timer state '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub text: String,
    pub checked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLink {
    pub url: String,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLogEntry {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub notes: String,
    pub subtasks: Vec<Subtask>,
    pub links: Vec<TaskLink>,
    pub priority: Priority,
    pub column: KanbanColumn,
    pub bucket_id: BucketId,
    pub created_at: DateTime<Utc>,
    pub log_entries: Vec<TaskLogEntry>,
}

impl Task {
    pub fn logs_newest_first(&self) -> Vec<&TaskLogEntry> {
        let mut entries = self.log_entries.iter().collect::<Vec<_>>();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
    }

    pub fn subtask_progress(&self) -> (usize, usize) {
        let done = self.subtasks.iter().filter(|subtask| subtask.checked).count();
        (done, self.subtasks.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookSlot {
    pub slot_number: u8,
    pub task: Option<Task>,
    pub timer_state: TimerState,
    pub time_remaining: u32,
    pub sprint_duration: u32,
}

/// Persisted form of an occupied slot; the task is referenced by id and
/// joined back during reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRecord {
    pub slot_number: u8,
    pub task_id: String,
    pub timer_state: TimerState,
    pub time_remaining: u32,
    pub sprint_duration: u32,
    pub playbook_date: NaiveDate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub bucket_id: Option<BucketId>,
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    pub title: Option<String>,
    pub notes: Option<String>,
    pub priority: Option<Priority>,
    pub bucket_id: Option<BucketId>,
    pub subtasks: Option<Vec<Subtask>>,
    pub links: Option<Vec<TaskLink>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    ActionResult,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ActionResult => "action_result",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingReason {
    Warning,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardEvent {
    StatusLogRequired {
        slot_number: u8,
        reason: LoggingReason,
        time_remaining: u32,
    },
    Reconciled {
        task_count: usize,
        occupied_slots: usize,
        playbook_date: NaiveDate,
    },
    Notification {
        level: NotificationLevel,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreTable {
    Tasks,
    TaskLogs,
    PlaybookSlots,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotice {
    pub user_id: String,
    pub tables: Vec<StoreTable>,
    pub origin: Option<String>,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    pub tasks: Vec<Task>,
    pub slots: Vec<PlaybookSlot>,
    pub chat_open: bool,
    pub playbook_date: NaiveDate,
}

impl BoardSnapshot {
    pub fn tasks_by_bucket(&self) -> BTreeMap<BucketId, Vec<&Task>> {
        let mut grouped: BTreeMap<BucketId, Vec<&Task>> = BucketId::ALL
            .into_iter()
            .map(|bucket| (bucket, Vec::new()))
            .collect();
        for task in &self.tasks {
            grouped.entry(task.bucket_id).or_default().push(task);
        }
        grouped
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub completion_url: String,
    pub model: Option<String>,
    pub request_timeout_secs: u64,
    pub tick_persist_every_secs: u32,
    pub default_sprint_secs: u32,
    pub warning_threshold_secs: u32,
    pub duration_presets_secs: Vec<u32>,
    pub greeting: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            completion_url: "http://127.0.0.1:54321/functions/v1/chat".to_string(),
            model: None,
            request_timeout_secs: 60,
            tick_persist_every_secs: 10,
            default_sprint_secs: DEFAULT_SPRINT_SECS,
            warning_threshold_secs: DEFAULT_WARNING_THRESHOLD_SECS,
            duration_presets_secs: DEFAULT_DURATION_PRESETS_SECS.to_vec(),
            greeting: "I'm your Strategy Assistant. I can create, rename, move and prioritize tasks, or stage them into today's playbook. What would you like to work on?".to_string(),
        }
    }
}

impl AppSettings {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("FOCUS_BOARD_COMPLETION_URL") {
            if !url.trim().is_empty() {
                self.completion_url = url.trim().to_string();
            }
        }
        if let Ok(model) = std::env::var("FOCUS_BOARD_MODEL") {
            if !model.trim().is_empty() {
                self.model = Some(model.trim().to_string());
            }
        }
        self
    }
}
