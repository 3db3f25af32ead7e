use crate::board::BoardState;
use crate::db::{BoardStore, StoreWrite};
use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, BoardEvent, BoardSnapshot, BucketId, ChangeNotice, KanbanColumn, NewTask,
    NotificationLevel, PlaybookSlot, Priority, Task, TaskPatch, TimerState,
};
use crate::slots::TimerConfig;
use chrono::{Local, NaiveDate};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

pub type DateSource = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

struct SessionState {
    board: BoardState,
    ticks_since_persist: u32,
    /// Timer writes whose last attempt failed, retried on the next tick.
    pending_timer_writes: Vec<StoreWrite>,
}

/// One device's view of a user's board.
///
/// Mutations run against a draft of the in-memory state, the resulting row
/// writes are applied to the store in one transaction, and only then is the
/// draft committed. The store's change feed brings every session for the
/// same user back in line through [`BoardSession::reconcile`].
#[derive(Clone)]
pub struct BoardSession {
    store: Arc<dyn BoardStore>,
    user_id: String,
    origin: String,
    state: Arc<Mutex<SessionState>>,
    events: broadcast::Sender<BoardEvent>,
    reconcile_requested: Arc<Notify>,
    persist_every: u32,
    today: DateSource,
}

impl BoardSession {
    pub async fn open(store: Arc<dyn BoardStore>, user_id: &str, settings: &AppSettings) -> AppResult<Self> {
        Self::open_with_clock(store, user_id, settings, Arc::new(|| Local::now().date_naive())).await
    }

    /// Opens a session whose playbook date comes from `today` instead of the
    /// local clock.
    pub async fn open_with_clock(
        store: Arc<dyn BoardStore>,
        user_id: &str,
        settings: &AppSettings,
        today: DateSource,
    ) -> AppResult<Self> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(AppError::Validation("A user id is required".to_string()));
        }
        let timing = TimerConfig::from_settings(settings);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let playbook_date = today();
        let session = Self {
            store,
            user_id: user_id.to_string(),
            origin: Uuid::new_v4().to_string(),
            state: Arc::new(Mutex::new(SessionState {
                board: BoardState::new(playbook_date, timing),
                ticks_since_persist: 0,
                pending_timer_writes: Vec::new(),
            })),
            events,
            reconcile_requested: Arc::new(Notify::new()),
            persist_every: settings.tick_persist_every_secs.max(1),
            today,
        };
        session.reconcile().await?;
        Ok(session)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> BoardSnapshot {
        self.state.lock().await.board.snapshot()
    }

    /// Runs a read-only query against the current state.
    pub async fn read<T>(&self, query: impl FnOnce(&BoardState) -> T) -> T {
        let guard = self.state.lock().await;
        query(&guard.board)
    }

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.read(|board| board.task(task_id).cloned()).await
    }

    pub async fn tasks_in_bucket(&self, bucket: BucketId, column: Option<KanbanColumn>) -> Vec<Task> {
        self.read(|board| board.tasks_in_bucket(bucket, column).into_iter().cloned().collect())
            .await
    }

    pub async fn focus_slot(&self) -> Option<PlaybookSlot> {
        self.read(|board| board.focus_slot().cloned()).await
    }

    pub async fn empty_slot_numbers(&self) -> Vec<u8> {
        self.read(BoardState::empty_slot_numbers).await
    }

    pub async fn today_tasks(&self) -> Vec<Task> {
        self.read(|board| board.today_tasks().into_iter().cloned().collect()).await
    }

    pub async fn set_chat_open(&self, open: bool) {
        self.state.lock().await.board.set_chat_open(open);
    }

    pub async fn add_task(&self, new_task: NewTask) -> AppResult<Task> {
        self.mutate("add_task", |board| board.add_task(new_task)).await
    }

    pub async fn update_task(&self, task_id: &str, patch: TaskPatch) -> AppResult<()> {
        self.mutate_unit("update_task", |board| board.update_task(task_id, patch))
            .await
    }

    pub async fn rename_task(&self, task_id: &str, title: &str) -> AppResult<()> {
        let patch = TaskPatch {
            title: Some(title.to_string()),
            ..Default::default()
        };
        self.update_task(task_id, patch).await
    }

    pub async fn set_task_priority(&self, task_id: &str, priority: Priority) -> AppResult<()> {
        let patch = TaskPatch {
            priority: Some(priority),
            ..Default::default()
        };
        self.update_task(task_id, patch).await
    }

    /// Re-files a task under another bucket. A staged task leaves its slot
    /// and goes back to the list as `todo`.
    pub async fn move_task_to_bucket(&self, task_id: &str, bucket: BucketId) -> AppResult<()> {
        self.mutate_unit("move_task_to_bucket", |board| {
            let mut writes = match board.slots().find_task(task_id) {
                Some(slot_number) => board.return_task_to_bucket(slot_number)?,
                None => Vec::new(),
            };
            let patch = TaskPatch {
                bucket_id: Some(bucket),
                ..Default::default()
            };
            writes.extend(board.update_task(task_id, patch)?);
            Ok(writes)
        })
        .await
    }

    pub async fn set_task_column(&self, task_id: &str, column: KanbanColumn) -> AppResult<()> {
        self.mutate_unit("set_task_column", |board| board.set_task_column(task_id, column))
            .await
    }

    pub async fn delete_task(&self, task_id: &str) -> AppResult<()> {
        self.mutate_unit("delete_task", |board| board.delete_task(task_id))
            .await
    }

    /// Deletes several tasks in one transaction; any unknown id rejects the
    /// whole batch.
    pub async fn delete_tasks(&self, task_ids: &[String]) -> AppResult<()> {
        self.mutate_unit("delete_tasks", |board| {
            let mut writes = Vec::new();
            for task_id in task_ids {
                writes.extend(board.delete_task(task_id)?);
            }
            Ok(writes)
        })
        .await
    }

    /// Returns false when the slot was already occupied.
    pub async fn move_task_to_slot(&self, task_id: &str, slot_number: u8) -> AppResult<bool> {
        self.mutate("move_task_to_slot", |board| {
            let writes = board.move_task_to_slot(task_id, slot_number)?;
            Ok((!writes.is_empty(), writes))
        })
        .await
    }

    pub async fn move_slot_to_slot(&self, from: u8, to: u8) -> AppResult<bool> {
        self.mutate("move_slot_to_slot", |board| {
            let writes = board.move_slot_to_slot(from, to)?;
            Ok((!writes.is_empty(), writes))
        })
        .await
    }

    pub async fn complete_slot(&self, slot_number: u8) -> AppResult<()> {
        self.mutate_unit("complete_slot", |board| board.complete_slot(slot_number))
            .await
    }

    pub async fn return_task_to_bucket(&self, slot_number: u8) -> AppResult<()> {
        self.mutate_unit("return_task_to_bucket", |board| board.return_task_to_bucket(slot_number))
            .await
    }

    pub async fn submit_status_log(&self, slot_number: u8, accomplished: &str, next_step: &str) -> AppResult<()> {
        self.mutate_unit("submit_status_log", |board| {
            board.submit_status_log(slot_number, accomplished, next_step)
        })
        .await
    }

    pub async fn start_slot(&self, slot_number: u8) -> AppResult<()> {
        self.mutate_unit("start_slot", |board| board.start_slot(slot_number))
            .await
    }

    pub async fn pause_slot(&self, slot_number: u8) -> AppResult<()> {
        self.mutate_unit("pause_slot", |board| board.pause_slot(slot_number))
            .await
    }

    pub async fn set_slot_duration(&self, slot_number: u8, seconds: i64) -> AppResult<()> {
        self.mutate_unit("set_slot_duration", |board| board.set_slot_duration(slot_number, seconds))
            .await
    }

    pub async fn skip_slot(&self, slot_number: u8, delta_seconds: i64) -> AppResult<()> {
        self.mutate_unit("skip_slot", |board| board.skip_slot(slot_number, delta_seconds))
            .await
    }

    pub async fn apply_duration_preset(&self, slot_number: u8, seconds: u32) -> AppResult<()> {
        self.mutate_unit("apply_duration_preset", |board| {
            board.apply_duration_preset(slot_number, seconds)
        })
        .await
    }

    pub async fn scrub_slot(&self, slot_number: u8, fraction: f64) -> AppResult<()> {
        self.mutate_unit("scrub_slot", |board| board.scrub_slot(slot_number, fraction))
            .await
    }

    pub async fn add_log_entry(&self, task_id: &str, text: &str) -> AppResult<()> {
        self.mutate_unit("add_log_entry", |board| board.add_log_entry(task_id, text))
            .await
    }

    pub async fn edit_log_entry(&self, task_id: &str, entry_id: &str, text: &str) -> AppResult<()> {
        self.mutate_unit("edit_log_entry", |board| board.edit_log_entry(task_id, entry_id, text))
            .await
    }

    pub async fn add_subtask(&self, task_id: &str, text: &str) -> AppResult<()> {
        self.mutate_unit("add_subtask", |board| board.add_subtask(task_id, text))
            .await
    }

    pub async fn toggle_subtask(&self, task_id: &str, index: usize) -> AppResult<()> {
        self.mutate_unit("toggle_subtask", |board| board.toggle_subtask(task_id, index))
            .await
    }

    pub async fn remove_subtask(&self, task_id: &str, index: usize) -> AppResult<()> {
        self.mutate_unit("remove_subtask", |board| board.remove_subtask(task_id, index))
            .await
    }

    pub async fn add_link(&self, task_id: &str, url: &str, label: Option<&str>) -> AppResult<()> {
        self.mutate_unit("add_link", |board| board.add_link(task_id, url, label))
            .await
    }

    pub async fn remove_link(&self, task_id: &str, url: &str) -> AppResult<()> {
        self.mutate_unit("remove_link", |board| board.remove_link(task_id, url))
            .await
    }

    /// One second of countdown for every running slot.
    ///
    /// Entering logging is persisted immediately; plain countdown is written
    /// every `tick_persist_every_secs`. Timer writes only update a row still
    /// holding the same task. A failed write is kept and retried on the next
    /// tick, and a failed logging transition is reported to the user.
    pub async fn tick(&self) {
        if (self.today)() != self.state.lock().await.board.playbook_date() {
            tracing::info!(user_id = %self.user_id, "playbook date rolled over");
            if let Err(error) = self.reconcile().await {
                tracing::warn!(error = %error, "reconcile after date rollover failed");
            }
            return;
        }

        let mut guard = self.state.lock().await;
        let reports = guard.board.tick();
        if reports.is_empty() && guard.pending_timer_writes.is_empty() {
            return;
        }

        let mut persist_countdown = false;
        if !reports.is_empty() {
            guard.ticks_since_persist = guard.ticks_since_persist.saturating_add(1);
            persist_countdown = guard.ticks_since_persist >= self.persist_every;
            if persist_countdown {
                guard.ticks_since_persist = 0;
            }
        }

        let mut writes = std::mem::take(&mut guard.pending_timer_writes);
        for report in &reports {
            if report.entered_logging.is_none() && !persist_countdown {
                continue;
            }
            match guard.board.timer_write(report.slot_number) {
                Ok(Some(write)) => {
                    writes.retain(|pending| pending.slot_number() != Some(report.slot_number));
                    writes.push(write);
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(slot = report.slot_number, error = %error, "skipping tick write"),
            }
        }
        if !writes.is_empty() {
            if let Err(error) = self.store.apply(&self.user_id, Some(&self.origin), &writes) {
                tracing::warn!(
                    user_id = %self.user_id,
                    pending = writes.len(),
                    error = %error,
                    "failed to persist slot timers, retrying next tick"
                );
                guard.pending_timer_writes = writes;
                if reports.iter().any(|report| report.entered_logging.is_some()) {
                    self.notify(
                        NotificationLevel::Warning,
                        format!("Couldn't save the sprint timer, retrying: {}", error.detail()),
                    );
                }
            }
        }
        drop(guard);

        for report in reports {
            if let Some(reason) = report.entered_logging {
                tracing::info!(slot = report.slot_number, reason = ?reason, "slot entered logging");
                let _ = self.events.send(BoardEvent::StatusLogRequired {
                    slot_number: report.slot_number,
                    reason,
                    time_remaining: report.time_remaining,
                });
            }
        }
    }

    /// Reloads tasks and today's slots from the store and replaces local
    /// state. A slot still running locally with the same task keeps its
    /// local countdown.
    pub async fn reconcile(&self) -> AppResult<()> {
        let playbook_date = (self.today)();
        let mut guard = self.state.lock().await;
        let tasks = self.store.load_tasks(&self.user_id)?;
        let records = self.store.load_slots(&self.user_id, playbook_date)?;

        let timing = guard.board.timing().clone();
        let mut next = BoardState::from_records(tasks, records, playbook_date, timing);
        next.set_chat_open(guard.board.chat_open());

        // A stored row still `running` lags behind the local countdown, and
        // behind a local logging transition whose write is pending.
        if guard.board.playbook_date() == playbook_date {
            for local in guard.board.slots().occupied() {
                if !matches!(local.timer_state, TimerState::Running | TimerState::Logging) {
                    continue;
                }
                let Ok(slot) = next.slots().get(local.slot_number) else {
                    continue;
                };
                let same_task = slot.task.as_ref().map(|task| &task.id) == local.task.as_ref().map(|task| &task.id);
                if same_task && slot.timer_state == TimerState::Running {
                    next.keep_timer(local.slot_number, local.timer_state, local.time_remaining);
                }
            }
        }

        if let Err(error) = next.check_invariants() {
            tracing::error!(user_id = %self.user_id, error = %error, "reloaded board violates invariants");
        }
        let task_count = next.tasks().len() + next.slots().occupied().count();
        let occupied_slots = next.slots().occupied().count();
        guard.board = next;
        drop(guard);

        tracing::debug!(user_id = %self.user_id, task_count, occupied_slots, "board reconciled");
        let _ = self.events.send(BoardEvent::Reconciled {
            task_count,
            occupied_slots,
            playbook_date,
        });
        Ok(())
    }

    /// Listens to the store's change feed and to locally scheduled
    /// reconciles until the task is aborted.
    fn spawn_reconciler(&self) -> JoinHandle<()> {
        let session = self.clone();
        let mut changes = self.store.subscribe();
        tokio::spawn(async move {
            loop {
                let should_reconcile = tokio::select! {
                    received = changes.recv() => match received {
                        Ok(notice) => session.is_relevant(&notice),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "change feed lagged, reconciling once");
                            true
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = session.reconcile_requested.notified() => true,
                };
                if !should_reconcile {
                    continue;
                }
                if let Err(error) = session.reconcile().await {
                    tracing::warn!(user_id = %session.user_id, error = %error, "reconcile failed");
                }
            }
        })
    }

    pub(crate) fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        let _ = self.events.send(BoardEvent::Notification {
            level,
            message: message.into(),
        });
    }

    fn is_relevant(&self, notice: &ChangeNotice) -> bool {
        notice.user_id == self.user_id
    }

    async fn mutate_unit(
        &self,
        action: &str,
        change: impl FnOnce(&mut BoardState) -> AppResult<Vec<StoreWrite>>,
    ) -> AppResult<()> {
        self.mutate(action, |board| Ok(((), change(board)?))).await
    }

    async fn mutate<T>(
        &self,
        action: &str,
        change: impl FnOnce(&mut BoardState) -> AppResult<(T, Vec<StoreWrite>)>,
    ) -> AppResult<T> {
        let mut guard = self.state.lock().await;
        let mut draft = guard.board.clone();
        let (value, writes) = change(&mut draft)?;
        if writes.is_empty() {
            return Ok(value);
        }

        if let Err(error) = self.store.apply(&self.user_id, Some(&self.origin), &writes) {
            drop(guard);
            tracing::warn!(action, user_id = %self.user_id, error = %error, "store write failed, keeping previous state");
            self.notify(NotificationLevel::Error, format!("Couldn't save changes: {}", error));
            self.reconcile_requested.notify_one();
            return Err(match error {
                AppError::Store(message) => AppError::Store(message),
                other => AppError::Store(other.to_string()),
            });
        }

        guard.board = draft;
        guard.pending_timer_writes.retain(|pending| {
            !writes
                .iter()
                .any(|write| write.slot_number().is_some() && write.slot_number() == pending.slot_number())
        });
        tracing::debug!(action, user_id = %self.user_id, writes = writes.len(), "board change committed");
        Ok(value)
    }
}

/// Background listener that keeps one session in line with the store.
/// The listener stops when this handle is stopped or dropped.
pub struct Reconciler {
    origin: String,
    handle: JoinHandle<()>,
}

impl Reconciler {
    pub fn spawn(session: &BoardSession) -> Self {
        Self {
            origin: session.origin.clone(),
            handle: session.spawn_reconciler(),
        }
    }

    /// Origin of the session this listener keeps in line.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
