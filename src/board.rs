//! In-memory board: the bucket task list plus the eight playbook slots.
//!
//! Every mutator validates first, then changes tasks and slots together and
//! returns the row writes that make the change durable. An empty write list
//! means the call was a no-op. A task id is held by exactly one of the bucket
//! list or a slot after any mutator returns.

use crate::db::StoreWrite;
use crate::description::import_description;
use crate::errors::{AppError, AppResult};
use crate::models::{
    BoardSnapshot, BucketId, KanbanColumn, NewTask, PlaybookSlot, SlotRecord, Subtask, Task, TaskLink,
    TaskLogEntry, TaskPatch, TimerState,
};
use crate::slots::{format_clock, SlotBoard, TickReport, TimerConfig};
use chrono::{NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const TODAY_TODO_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLocation {
    Bucket(usize),
    Slot(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardState {
    tasks: Vec<Task>,
    slots: SlotBoard,
    chat_open: bool,
    playbook_date: NaiveDate,
    timing: TimerConfig,
}

impl BoardState {
    pub fn new(playbook_date: NaiveDate, timing: TimerConfig) -> Self {
        Self {
            tasks: Vec::new(),
            slots: SlotBoard::new(timing.default_sprint_secs),
            chat_open: false,
            playbook_date,
            timing,
        }
    }

    /// Rebuilds state from stored rows. Slot rows pointing at unknown tasks,
    /// or at a task already placed in an earlier slot, are skipped.
    pub fn from_records(
        tasks: Vec<Task>,
        records: Vec<SlotRecord>,
        playbook_date: NaiveDate,
        timing: TimerConfig,
    ) -> Self {
        let mut state = Self::new(playbook_date, timing);
        let mut by_id: HashMap<String, Task> = HashMap::new();
        let mut order = Vec::with_capacity(tasks.len());
        for task in tasks {
            order.push(task.id.clone());
            by_id.insert(task.id.clone(), task);
        }

        for record in records {
            if record.playbook_date != playbook_date {
                continue;
            }
            let Ok(slot) = state.slots.get_mut(record.slot_number) else {
                tracing::warn!(slot = record.slot_number, "ignoring slot row with invalid number");
                continue;
            };
            if !slot.is_empty() {
                continue;
            }
            let Some(task) = by_id.remove(&record.task_id) else {
                tracing::warn!(
                    slot = record.slot_number,
                    task_id = %record.task_id,
                    "ignoring slot row for a task that is missing or already staged"
                );
                continue;
            };
            slot.task = Some(task);
            slot.timer_state = record.timer_state;
            slot.sprint_duration = record.sprint_duration;
            slot.time_remaining = record.time_remaining.min(record.sprint_duration);
        }

        state.tasks = order.into_iter().filter_map(|id| by_id.remove(&id)).collect();
        state
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot {
            tasks: self.tasks.clone(),
            slots: self.slots.to_vec(),
            chat_open: self.chat_open,
            playbook_date: self.playbook_date,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn slots(&self) -> &SlotBoard {
        &self.slots
    }

    pub fn playbook_date(&self) -> NaiveDate {
        self.playbook_date
    }

    pub fn timing(&self) -> &TimerConfig {
        &self.timing
    }

    pub fn set_timing(&mut self, timing: TimerConfig) {
        self.timing = timing;
    }

    pub fn chat_open(&self) -> bool {
        self.chat_open
    }

    pub fn set_chat_open(&mut self, open: bool) {
        self.chat_open = open;
    }

    pub fn locate(&self, task_id: &str) -> Option<TaskLocation> {
        if let Some(index) = self.tasks.iter().position(|task| task.id == task_id) {
            return Some(TaskLocation::Bucket(index));
        }
        self.slots.find_task(task_id).map(TaskLocation::Slot)
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        match self.locate(task_id)? {
            TaskLocation::Bucket(index) => self.tasks.get(index),
            TaskLocation::Slot(number) => self.slots.get(number).ok()?.task.as_ref(),
        }
    }

    pub fn tasks_in_bucket(&self, bucket: BucketId, column: Option<KanbanColumn>) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|task| task.bucket_id == bucket)
            .filter(|task| column.map(|column| task.column == column).unwrap_or(true))
            .collect()
    }

    pub fn focus_slot(&self) -> Option<&PlaybookSlot> {
        self.slots.focus_slot()
    }

    pub fn empty_slot_numbers(&self) -> Vec<u8> {
        self.slots.empty_slot_numbers()
    }

    /// Staged tasks in slot order, then unstaged in-progress tasks, then the
    /// first few todo tasks.
    pub fn today_tasks(&self) -> Vec<&Task> {
        let mut today = self
            .slots
            .occupied()
            .filter_map(|slot| slot.task.as_ref())
            .collect::<Vec<_>>();
        today.extend(self.tasks.iter().filter(|task| task.column == KanbanColumn::InProgress));
        today.extend(
            self.tasks
                .iter()
                .filter(|task| task.column == KanbanColumn::Todo)
                .take(TODAY_TODO_LIMIT),
        );
        today
    }

    pub fn add_task(&mut self, new_task: NewTask) -> AppResult<(Task, Vec<StoreWrite>)> {
        let title = normalize_title(&new_task.title)?;
        let bucket_id = new_task
            .bucket_id
            .ok_or_else(|| AppError::Validation("A bucket is required".to_string()))?;
        let imported = import_description(new_task.description.as_deref().unwrap_or_default());

        let task = Task {
            id: Uuid::new_v4().to_string(),
            title,
            notes: imported.notes,
            subtasks: imported.subtasks,
            links: imported.links,
            priority: new_task.priority.unwrap_or_default(),
            column: KanbanColumn::Todo,
            bucket_id,
            created_at: Utc::now(),
            log_entries: Vec::new(),
        };
        self.tasks.push(task.clone());
        Ok((task.clone(), vec![StoreWrite::UpsertTask(task)]))
    }

    pub fn update_task(&mut self, task_id: &str, patch: TaskPatch) -> AppResult<Vec<StoreWrite>> {
        let title = patch.title.as_deref().map(normalize_title).transpose()?;
        if let Some(subtasks) = &patch.subtasks {
            if subtasks.iter().any(|subtask| subtask.text.trim().is_empty()) {
                return Err(AppError::Validation("Subtask text cannot be empty".to_string()));
            }
        }
        if let Some(links) = &patch.links {
            for link in links {
                validate_url(&link.url)?;
            }
        }

        let task = self.task_mut(task_id)?;
        if let Some(title) = title {
            task.title = title;
        }
        if let Some(notes) = patch.notes {
            task.notes = notes;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(bucket_id) = patch.bucket_id {
            task.bucket_id = bucket_id;
        }
        if let Some(subtasks) = patch.subtasks {
            task.subtasks = subtasks;
        }
        if let Some(links) = patch.links {
            task.links = links;
        }
        Ok(vec![StoreWrite::UpsertTask(task.clone())])
    }

    /// Kanban move. A staged task keeps the slot as its single location:
    /// `done` completes the slot and `todo` returns it to its bucket.
    pub fn set_task_column(&mut self, task_id: &str, column: KanbanColumn) -> AppResult<Vec<StoreWrite>> {
        match self.locate(task_id) {
            Some(TaskLocation::Bucket(index)) => {
                let task = &mut self.tasks[index];
                if task.column == column {
                    return Ok(Vec::new());
                }
                task.column = column;
                Ok(vec![StoreWrite::UpsertTask(task.clone())])
            }
            Some(TaskLocation::Slot(number)) => match column {
                KanbanColumn::Done => self.complete_slot(number),
                KanbanColumn::Todo => self.return_task_to_bucket(number),
                KanbanColumn::InProgress => Ok(Vec::new()),
            },
            None => Err(task_not_found(task_id)),
        }
    }

    pub fn delete_task(&mut self, task_id: &str) -> AppResult<Vec<StoreWrite>> {
        match self.locate(task_id) {
            Some(TaskLocation::Bucket(index)) => {
                self.tasks.remove(index);
                Ok(vec![StoreWrite::DeleteTask(task_id.to_string())])
            }
            Some(TaskLocation::Slot(number)) => {
                let default_sprint = self.timing.default_sprint_secs;
                self.slots.get_mut(number)?.clear(default_sprint);
                Ok(vec![
                    StoreWrite::DeleteSlot {
                        slot_number: number,
                        playbook_date: self.playbook_date,
                    },
                    StoreWrite::DeleteTask(task_id.to_string()),
                ])
            }
            None => Err(task_not_found(task_id)),
        }
    }

    /// Stages a bucket task into an empty slot. Occupied slots are left alone.
    pub fn move_task_to_slot(&mut self, task_id: &str, slot_number: u8) -> AppResult<Vec<StoreWrite>> {
        if !self.slots.get(slot_number)?.is_empty() {
            return Ok(Vec::new());
        }
        let index = match self.locate(task_id) {
            Some(TaskLocation::Bucket(index)) => index,
            Some(TaskLocation::Slot(current)) => {
                return Err(AppError::Validation(format!(
                    "Task {} is already staged in slot {}",
                    task_id, current
                )))
            }
            None => return Err(task_not_found(task_id)),
        };

        let mut task = self.tasks.remove(index);
        task.column = KanbanColumn::InProgress;
        let slot = self.slots.get_mut(slot_number)?;
        slot.stage(task.clone());
        let record = slot_record(slot, self.playbook_date);

        Ok(vec![StoreWrite::UpsertTask(task), StoreWrite::UpsertSlot(record)])
    }

    pub fn move_slot_to_slot(&mut self, from: u8, to: u8) -> AppResult<Vec<StoreWrite>> {
        if !self.slots.relocate(from, to, self.timing.default_sprint_secs)? {
            return Ok(Vec::new());
        }
        let mut writes = Vec::with_capacity(2);
        for number in [to, from] {
            let slot = self.slots.get(number)?;
            if slot.is_empty() {
                writes.push(StoreWrite::DeleteSlot {
                    slot_number: number,
                    playbook_date: self.playbook_date,
                });
            } else {
                writes.push(StoreWrite::UpsertSlot(slot_record(slot, self.playbook_date)));
            }
        }
        Ok(writes)
    }

    pub fn complete_slot(&mut self, slot_number: u8) -> AppResult<Vec<StoreWrite>> {
        self.release_slot(slot_number, KanbanColumn::Done)
    }

    pub fn return_task_to_bucket(&mut self, slot_number: u8) -> AppResult<Vec<StoreWrite>> {
        self.release_slot(slot_number, KanbanColumn::Todo)
    }

    /// Records the sprint log on the staged task and completes the slot.
    pub fn submit_status_log(
        &mut self,
        slot_number: u8,
        accomplished: &str,
        next_step: &str,
    ) -> AppResult<Vec<StoreWrite>> {
        let accomplished = accomplished.trim();
        let next_step = next_step.trim();
        if accomplished.is_empty() || next_step.is_empty() {
            return Err(AppError::Validation(
                "Both what was accomplished and the next step are required".to_string(),
            ));
        }

        let slot = self.slots.get_mut(slot_number)?;
        let Some(task) = slot.task.as_mut() else {
            return Err(AppError::Validation(format!("Slot {} is empty", slot_number)));
        };
        let entry = new_log_entry(format!("Accomplished: {}\nNext step: {}", accomplished, next_step));
        task.log_entries.push(entry.clone());
        let task_id = task.id.clone();

        let mut writes = vec![StoreWrite::InsertLog { task_id, entry }];
        writes.extend(self.complete_slot(slot_number)?);
        Ok(writes)
    }

    pub fn start_slot(&mut self, slot_number: u8) -> AppResult<Vec<StoreWrite>> {
        self.with_slot(slot_number, |slot| slot.start())
    }

    pub fn pause_slot(&mut self, slot_number: u8) -> AppResult<Vec<StoreWrite>> {
        self.with_slot(slot_number, |slot| slot.pause())
    }

    pub fn set_slot_duration(&mut self, slot_number: u8, seconds: i64) -> AppResult<Vec<StoreWrite>> {
        self.with_slot(slot_number, |slot| slot.set_time_remaining(seconds))
    }

    pub fn skip_slot(&mut self, slot_number: u8, delta_seconds: i64) -> AppResult<Vec<StoreWrite>> {
        self.with_slot(slot_number, |slot| slot.skip(delta_seconds))
    }

    /// Only durations listed in the configured presets are accepted.
    pub fn apply_duration_preset(&mut self, slot_number: u8, seconds: u32) -> AppResult<Vec<StoreWrite>> {
        if !self.timing.duration_presets_secs.contains(&seconds) {
            return Err(AppError::Validation(format!(
                "{} is not a configured duration preset",
                format_clock(seconds)
            )));
        }
        self.with_slot(slot_number, |slot| slot.apply_preset(seconds))
    }

    pub fn scrub_slot(&mut self, slot_number: u8, fraction: f64) -> AppResult<Vec<StoreWrite>> {
        self.with_slot(slot_number, |slot| slot.scrub(fraction))
    }

    pub fn tick(&mut self) -> Vec<TickReport> {
        self.slots.tick(self.timing.warning_threshold_secs)
    }

    pub(crate) fn keep_timer(&mut self, slot_number: u8, timer_state: TimerState, time_remaining: u32) {
        if let Ok(slot) = self.slots.get_mut(slot_number) {
            slot.timer_state = timer_state;
            slot.time_remaining = time_remaining.min(slot.sprint_duration);
        }
    }

    /// Countdown write for an occupied slot. Empty slots have nothing to
    /// refresh.
    pub fn timer_write(&self, slot_number: u8) -> AppResult<Option<StoreWrite>> {
        let slot = self.slots.get(slot_number)?;
        let Some(task) = slot.task.as_ref() else {
            return Ok(None);
        };
        Ok(Some(StoreWrite::UpdateSlotTimer {
            slot_number,
            task_id: task.id.clone(),
            timer_state: slot.timer_state,
            time_remaining: slot.time_remaining,
            playbook_date: self.playbook_date,
        }))
    }

    pub fn add_log_entry(&mut self, task_id: &str, text: &str) -> AppResult<Vec<StoreWrite>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Log entry cannot be empty".to_string()));
        }
        let entry = new_log_entry(text.to_string());
        self.task_mut(task_id)?.log_entries.push(entry.clone());
        Ok(vec![StoreWrite::InsertLog {
            task_id: task_id.to_string(),
            entry,
        }])
    }

    pub fn edit_log_entry(&mut self, task_id: &str, entry_id: &str, text: &str) -> AppResult<Vec<StoreWrite>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Log entry cannot be empty".to_string()));
        }
        let task = self.task_mut(task_id)?;
        let entry = task
            .log_entries
            .iter_mut()
            .find(|entry| entry.id == entry_id)
            .ok_or_else(|| AppError::NotFound(format!("Log entry {} not found", entry_id)))?;
        entry.text = text.to_string();
        entry.edited_at = Some(Utc::now());
        Ok(vec![StoreWrite::UpdateLog {
            task_id: task_id.to_string(),
            entry: entry.clone(),
        }])
    }

    pub fn add_subtask(&mut self, task_id: &str, text: &str) -> AppResult<Vec<StoreWrite>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::Validation("Subtask text cannot be empty".to_string()));
        }
        let task = self.task_mut(task_id)?;
        task.subtasks.push(Subtask {
            text: text.to_string(),
            checked: false,
        });
        Ok(vec![StoreWrite::UpsertTask(task.clone())])
    }

    pub fn toggle_subtask(&mut self, task_id: &str, index: usize) -> AppResult<Vec<StoreWrite>> {
        let task = self.task_mut(task_id)?;
        let subtask = task
            .subtasks
            .get_mut(index)
            .ok_or_else(|| AppError::NotFound(format!("Subtask {} not found", index)))?;
        subtask.checked = !subtask.checked;
        Ok(vec![StoreWrite::UpsertTask(task.clone())])
    }

    pub fn remove_subtask(&mut self, task_id: &str, index: usize) -> AppResult<Vec<StoreWrite>> {
        let task = self.task_mut(task_id)?;
        if index >= task.subtasks.len() {
            return Err(AppError::NotFound(format!("Subtask {} not found", index)));
        }
        task.subtasks.remove(index);
        Ok(vec![StoreWrite::UpsertTask(task.clone())])
    }

    pub fn add_link(&mut self, task_id: &str, url: &str, label: Option<&str>) -> AppResult<Vec<StoreWrite>> {
        let url = url.trim();
        validate_url(url)?;
        let task = self.task_mut(task_id)?;
        if task.links.iter().any(|link| link.url == url) {
            return Ok(Vec::new());
        }
        task.links.push(TaskLink {
            url: url.to_string(),
            label: label
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(ToString::to_string),
        });
        Ok(vec![StoreWrite::UpsertTask(task.clone())])
    }

    pub fn remove_link(&mut self, task_id: &str, url: &str) -> AppResult<Vec<StoreWrite>> {
        let task = self.task_mut(task_id)?;
        let before = task.links.len();
        task.links.retain(|link| link.url != url);
        if task.links.len() == before {
            return Ok(Vec::new());
        }
        Ok(vec![StoreWrite::UpsertTask(task.clone())])
    }

    /// Verifies that every task id lives in exactly one place.
    pub fn check_invariants(&self) -> AppResult<()> {
        let mut seen = HashSet::new();
        let staged = self.slots.occupied().filter_map(|slot| slot.task.as_ref());
        for task in self.tasks.iter().chain(staged) {
            if !seen.insert(task.id.as_str()) {
                return Err(AppError::Internal(format!(
                    "task {} is held in more than one location",
                    task.id
                )));
            }
        }
        if self.slots.len() != usize::from(crate::models::SLOT_COUNT) {
            return Err(AppError::Internal(format!("expected 8 slots, found {}", self.slots.len())));
        }
        Ok(())
    }

    fn release_slot(&mut self, slot_number: u8, column: KanbanColumn) -> AppResult<Vec<StoreWrite>> {
        let default_sprint = self.timing.default_sprint_secs;
        let slot = self.slots.get_mut(slot_number)?;
        let Some(mut task) = slot.clear(default_sprint) else {
            return Err(AppError::Validation(format!("Slot {} is empty", slot_number)));
        };
        task.column = column;
        self.tasks.push(task.clone());
        Ok(vec![
            StoreWrite::DeleteSlot {
                slot_number,
                playbook_date: self.playbook_date,
            },
            StoreWrite::UpsertTask(task),
        ])
    }

    fn with_slot(
        &mut self,
        slot_number: u8,
        change: impl FnOnce(&mut PlaybookSlot) -> AppResult<()>,
    ) -> AppResult<Vec<StoreWrite>> {
        let slot = self.slots.get_mut(slot_number)?;
        let before = slot.clone();
        change(slot)?;
        if *slot == before {
            return Ok(Vec::new());
        }
        Ok(vec![StoreWrite::UpsertSlot(slot_record(slot, self.playbook_date))])
    }

    fn task_mut(&mut self, task_id: &str) -> AppResult<&mut Task> {
        match self.locate(task_id) {
            Some(TaskLocation::Bucket(index)) => Ok(&mut self.tasks[index]),
            Some(TaskLocation::Slot(_)) => self
                .slots
                .task_mut(task_id)
                .ok_or_else(|| task_not_found(task_id)),
            None => Err(task_not_found(task_id)),
        }
    }
}

pub fn slot_record(slot: &PlaybookSlot, playbook_date: NaiveDate) -> SlotRecord {
    SlotRecord {
        slot_number: slot.slot_number,
        task_id: slot.task.as_ref().map(|task| task.id.clone()).unwrap_or_default(),
        timer_state: slot.timer_state,
        time_remaining: slot.time_remaining,
        sprint_duration: slot.sprint_duration,
        playbook_date,
    }
}

fn new_log_entry(text: String) -> TaskLogEntry {
    TaskLogEntry {
        id: Uuid::new_v4().to_string(),
        text,
        created_at: Utc::now(),
        edited_at: None,
    }
}

fn normalize_title(raw: &str) -> AppResult<String> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(AppError::Validation("Task title cannot be empty".to_string()));
    }
    Ok(title.to_string())
}

fn validate_url(url: &str) -> AppResult<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) || url.contains(char::is_whitespace) {
        return Err(AppError::Validation(format!("'{}' is not a valid link", url)));
    }
    Ok(())
}

fn task_not_found(task_id: &str) -> AppError {
    AppError::NotFound(format!("Task {} not found", task_id))
}

#[cfg(test)]
mod tests {
    use super::BoardState;
    use crate::db::StoreWrite;
    use crate::models::{BucketId, KanbanColumn, NewTask, Priority, TaskPatch, TimerState};
    use crate::slots::TimerConfig;
    use chrono::NaiveDate;

    fn board() -> BoardState {
        BoardState::new(
            NaiveDate::from_ymd_opt(2026, 10, 17).expect("date"),
            TimerConfig::default(),
        )
    }

    fn add(board: &mut BoardState, bucket: BucketId, title: &str) -> String {
        let (task, _) = board
            .add_task(NewTask {
                bucket_id: Some(bucket),
                title: title.to_string(),
                description: None,
                priority: None,
            })
            .expect("add task");
        task.id
    }

    #[test]
    fn add_task_rejects_blank_titles_without_mutating() {
        let mut board = board();
        let result = board.add_task(NewTask {
            bucket_id: Some(BucketId::Finance),
            title: "   ".to_string(),
            ..Default::default()
        });
        assert!(result.is_err());
        assert!(board.tasks().is_empty());
    }

    #[test]
    fn add_task_imports_description_format() {
        let mut board = board();
        let (task, writes) = board
            .add_task(NewTask {
                bucket_id: Some(BucketId::Content),
                title: "  Draft proposal ".to_string(),
                description: Some("context\n[ ] outline\nhttps://example.com".to_string()),
                priority: Some(Priority::High),
            })
            .expect("add");
        assert_eq!(task.title, "Draft proposal");
        assert_eq!(task.notes, "context");
        assert_eq!(task.subtasks.len(), 1);
        assert_eq!(task.links.len(), 1);
        assert_eq!(task.column, KanbanColumn::Todo);
        assert_eq!(writes.len(), 1);
    }

    #[test]
    fn staging_and_returning_round_trips() {
        let mut board = board();
        let id = add(&mut board, BucketId::Ads, "Launch campaign");

        let writes = board.move_task_to_slot(&id, 3).expect("stage");
        assert_eq!(writes.len(), 2);
        assert!(board.tasks().is_empty());
        let slot = board.slots().get(3).expect("slot");
        assert_eq!(slot.task.as_ref().map(|t| t.column), Some(KanbanColumn::InProgress));
        board.check_invariants().expect("invariants");

        board.return_task_to_bucket(3).expect("return");
        assert_eq!(board.tasks().len(), 1);
        assert_eq!(board.tasks()[0].column, KanbanColumn::Todo);
        let slot = board.slots().get(3).expect("slot");
        assert!(slot.is_empty());
        assert_eq!(slot.timer_state, TimerState::Idle);
        assert_eq!(slot.time_remaining, slot.sprint_duration);
        board.check_invariants().expect("invariants");
    }

    #[test]
    fn staging_into_occupied_slot_is_a_noop() {
        let mut board = board();
        let first = add(&mut board, BucketId::Ads, "first");
        let second = add(&mut board, BucketId::Ads, "second");
        board.move_task_to_slot(&first, 1).expect("stage");

        let writes = board.move_task_to_slot(&second, 1).expect("noop");
        assert!(writes.is_empty());
        assert_eq!(board.tasks().len(), 1);
        assert_eq!(board.tasks()[0].id, second);
    }

    #[test]
    fn staging_unknown_task_or_slot_fails() {
        let mut board = board();
        let id = add(&mut board, BucketId::Ads, "task");
        assert!(board.move_task_to_slot("missing", 1).is_err());
        assert!(board.move_task_to_slot(&id, 9).is_err());
        assert_eq!(board.tasks().len(), 1);
    }

    #[test]
    fn deleting_a_staged_task_empties_the_slot() {
        let mut board = board();
        let id = add(&mut board, BucketId::Music, "Mix track");
        board.move_task_to_slot(&id, 6).expect("stage");

        let writes = board.delete_task(&id).expect("delete");
        assert!(writes.contains(&StoreWrite::DeleteTask(id.clone())));
        assert!(board.slots().get(6).expect("slot").is_empty());
        assert!(board.task(&id).is_none());
        assert!(board.delete_task(&id).is_err());
    }

    #[test]
    fn status_log_is_recorded_and_slot_completed() {
        let mut board = board();
        let id = add(&mut board, BucketId::Content, "Draft proposal");
        board.move_task_to_slot(&id, 2).expect("stage");

        assert!(board.submit_status_log(2, "", "next").is_err());
        assert!(board.slots().get(2).expect("slot").task.is_some());

        board.submit_status_log(2, "wrote intro", "write body").expect("log");
        let task = board.task(&id).expect("task");
        assert_eq!(task.column, KanbanColumn::Done);
        assert_eq!(task.log_entries.len(), 1);
        assert!(task.log_entries[0].text.contains("wrote intro"));
        assert!(board.slots().get(2).expect("slot").is_empty());
    }

    #[test]
    fn column_change_on_staged_task_releases_the_slot() {
        let mut board = board();
        let id = add(&mut board, BucketId::Product, "Spec");
        board.move_task_to_slot(&id, 1).expect("stage");

        assert!(board.set_task_column(&id, KanbanColumn::InProgress).expect("noop").is_empty());
        board.set_task_column(&id, KanbanColumn::Done).expect("done");
        assert!(board.slots().get(1).expect("slot").is_empty());
        assert_eq!(board.task(&id).map(|t| t.column), Some(KanbanColumn::Done));
        board.check_invariants().expect("invariants");
    }

    #[test]
    fn updates_reach_tasks_inside_slots() {
        let mut board = board();
        let id = add(&mut board, BucketId::Website, "Landing page");
        board.move_task_to_slot(&id, 4).expect("stage");
        board
            .update_task(
                &id,
                TaskPatch {
                    title: Some("Landing page v2".to_string()),
                    priority: Some(Priority::Low),
                    ..Default::default()
                },
            )
            .expect("update");
        board.add_subtask(&id, "hero copy").expect("subtask");
        board.toggle_subtask(&id, 0).expect("toggle");
        board.add_link(&id, "https://example.com", Some("ref")).expect("link");

        let slot = board.slots().get(4).expect("slot");
        let task = slot.task.as_ref().expect("task");
        assert_eq!(task.title, "Landing page v2");
        assert_eq!(task.priority, Priority::Low);
        assert_eq!(task.subtask_progress(), (1, 1));
        assert_eq!(task.links.len(), 1);
        assert!(board.add_link(&id, "not a url", None).is_err());
    }

    #[test]
    fn log_entries_can_be_edited_and_list_newest_first() {
        let mut board = board();
        let id = add(&mut board, BucketId::Admin, "Taxes");
        board.add_log_entry(&id, "first").expect("log");
        board.add_log_entry(&id, "second").expect("log");
        let first_id = board.task(&id).expect("task").log_entries[0].id.clone();

        board.edit_log_entry(&id, &first_id, "first, edited").expect("edit");
        let task = board.task(&id).expect("task");
        assert_eq!(task.log_entries[0].text, "first, edited");
        assert!(task.log_entries[0].edited_at.is_some());
        assert_eq!(task.logs_newest_first().len(), 2);
        assert!(board.edit_log_entry(&id, "missing", "x").is_err());
    }

    #[test]
    fn today_tasks_orders_staged_then_in_progress_then_todos() {
        let mut board = board();
        let staged = add(&mut board, BucketId::Finance, "staged");
        let doing = add(&mut board, BucketId::Finance, "doing");
        for index in 0..7 {
            add(&mut board, BucketId::Finance, &format!("todo {}", index));
        }
        board.move_task_to_slot(&staged, 5).expect("stage");
        board.set_task_column(&doing, KanbanColumn::InProgress).expect("column");

        let today = board.today_tasks();
        assert_eq!(today.len(), 7);
        assert_eq!(today[0].id, staged);
        assert_eq!(today[1].id, doing);
    }

    #[test]
    fn records_rebuild_state_without_duplicates() {
        let mut source = board();
        let a = add(&mut source, BucketId::Finance, "a");
        let b = add(&mut source, BucketId::Finance, "b");
        source.move_task_to_slot(&a, 1).expect("stage");
        let mut tasks = source.tasks().to_vec();
        tasks.push(source.task(&a).expect("task").clone());
        let record = super::slot_record(source.slots().get(1).expect("slot"), source.playbook_date());
        let mut duplicate = record.clone();
        duplicate.slot_number = 2;

        let rebuilt = BoardState::from_records(tasks, vec![record, duplicate], source.playbook_date(), TimerConfig::default());
        rebuilt.check_invariants().expect("invariants");
        assert_eq!(rebuilt.tasks().len(), 1);
        assert_eq!(rebuilt.tasks()[0].id, b);
        assert!(rebuilt.slots().get(2).expect("slot").is_empty());
        assert_eq!(rebuilt.slots().get(1).expect("slot").task.as_ref().map(|t| t.id.clone()), Some(a));
    }

    #[test]
    fn duration_presets_come_from_configuration() {
        let mut board = board();
        let id = add(&mut board, BucketId::Admin, "Expenses");
        board.move_task_to_slot(&id, 3).expect("stage");

        assert!(matches!(
            board.apply_duration_preset(3, 1234),
            Err(crate::errors::AppError::Validation(_))
        ));
        let writes = board.apply_duration_preset(3, 25 * 60).expect("preset");
        assert_eq!(writes.len(), 1);
        let slot = board.slots().get(3).expect("slot");
        assert_eq!(slot.sprint_duration, 1500);
        assert_eq!(slot.time_remaining, 1500);
    }

    #[test]
    fn timer_writes_carry_the_staged_task() {
        let mut board = board();
        let id = add(&mut board, BucketId::Admin, "Receipts");
        board.move_task_to_slot(&id, 2).expect("stage");
        board.start_slot(2).expect("start");

        match board.timer_write(2).expect("write") {
            Some(StoreWrite::UpdateSlotTimer {
                task_id, timer_state, ..
            }) => {
                assert_eq!(task_id, id);
                assert_eq!(timer_state, TimerState::Running);
            }
            other => panic!("unexpected write {:?}", other),
        }
        assert!(board.timer_write(4).expect("empty slot").is_none());
    }
}
