use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, ChangeNotice, SlotRecord, StoreTable, Task, TaskLogEntry, TimerState, DEFAULT_SPRINT_SECS,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const CHANGE_FEED_CAPACITY: usize = 256;

/// A single row-level change. Mutations hand the store a batch of these and
/// the batch is committed in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    UpsertTask(Task),
    DeleteTask(String),
    InsertLog { task_id: String, entry: TaskLogEntry },
    UpdateLog { task_id: String, entry: TaskLogEntry },
    UpsertSlot(SlotRecord),
    DeleteSlot { slot_number: u8, playbook_date: NaiveDate },
    /// Countdown refresh for a row that must still hold `task_id`. Never
    /// inserts, so a slot cleared elsewhere stays cleared.
    UpdateSlotTimer {
        slot_number: u8,
        task_id: String,
        timer_state: TimerState,
        time_remaining: u32,
        playbook_date: NaiveDate,
    },
}

impl StoreWrite {
    pub fn table(&self) -> StoreTable {
        match self {
            Self::UpsertTask(_) | Self::DeleteTask(_) => StoreTable::Tasks,
            Self::InsertLog { .. } | Self::UpdateLog { .. } => StoreTable::TaskLogs,
            Self::UpsertSlot(_) | Self::DeleteSlot { .. } | Self::UpdateSlotTimer { .. } => {
                StoreTable::PlaybookSlots
            }
        }
    }

    /// The playbook slot a write touches, if any.
    pub fn slot_number(&self) -> Option<u8> {
        match self {
            Self::UpsertSlot(record) => Some(record.slot_number),
            Self::DeleteSlot { slot_number, .. } | Self::UpdateSlotTimer { slot_number, .. } => Some(*slot_number),
            _ => None,
        }
    }
}

/// Backing store for board sessions. Implementations must apply a write
/// batch atomically and announce every committed batch on the change feed.
pub trait BoardStore: Send + Sync {
    fn load_tasks(&self, user_id: &str) -> AppResult<Vec<Task>>;
    fn load_slots(&self, user_id: &str, playbook_date: NaiveDate) -> AppResult<Vec<SlotRecord>>;
    fn apply(&self, user_id: &str, origin: Option<&str>, writes: &[StoreWrite]) -> AppResult<()>;
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotice>;
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<ChangeNotice>,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let db = Self {
            conn: Mutex::new(conn),
            changes,
        };

        db.ensure_schema_extensions()?;
        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        let conn = self.connection()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'app'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<AppSettings>(&raw).unwrap_or_default()),
            None => Ok(AppSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: AppSettings = serde_json::from_value(merged)
            .map_err(|error| AppError::Validation(format!("Invalid settings: {}", error)))?;

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('app', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    fn connection(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn ensure_schema_extensions(&self) -> AppResult<()> {
        let conn = self.connection()?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(journal_mode = %journal_mode, "database did not switch to WAL");
        }

        // Files created before these columns existed.

        if !column_exists(&conn, "playbook_slots", "sprint_duration")? {
            conn.execute(
                &format!(
                    "ALTER TABLE playbook_slots ADD COLUMN sprint_duration INTEGER NOT NULL DEFAULT {}",
                    DEFAULT_SPRINT_SECS
                ),
                [],
            )?;
        }
        if !column_exists(&conn, "task_logs", "edited_at")? {
            conn.execute("ALTER TABLE task_logs ADD COLUMN edited_at TEXT", [])?;
        }
        Ok(())
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'app'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('app', ?1, ?2)",
                params![
                    serde_json::to_string(&AppSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }
}

impl BoardStore for Database {
    fn load_tasks(&self, user_id: &str) -> AppResult<Vec<Task>> {
        let conn = self.connection()?;

        let mut logs: HashMap<String, Vec<TaskLogEntry>> = HashMap::new();
        {
            let mut statement = conn.prepare(
                "SELECT l.id, l.task_id, l.entry, l.created_at, l.edited_at
                 FROM task_logs l
                 JOIN tasks t ON t.id = l.task_id
                 WHERE t.user_id = ?1
                 ORDER BY l.created_at ASC, l.rowid ASC",
            )?;
            let rows = statement.query_map([user_id], |row| {
                let task_id: String = row.get(1)?;
                let entry = TaskLogEntry {
                    id: row.get(0)?,
                    text: row.get(2)?,
                    created_at: parse_time(&row.get::<_, String>(3)?)?,
                    edited_at: row
                        .get::<_, Option<String>>(4)?
                        .map(|raw| parse_time(&raw))
                        .transpose()?,
                };
                Ok((task_id, entry))
            })?;
            for row in rows {
                let (task_id, entry) = row?;
                logs.entry(task_id).or_default().push(entry);
            }
        }

        let mut statement = conn.prepare(
            "SELECT id, bucket_id, title, notes, subtasks_json, links_json, priority, status, created_at
             FROM tasks
             WHERE user_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = statement.query_map([user_id], parse_task_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            let mut task = row?;
            task.log_entries = logs.remove(&task.id).unwrap_or_default();
            tasks.push(task);
        }
        Ok(tasks)
    }

    fn load_slots(&self, user_id: &str, playbook_date: NaiveDate) -> AppResult<Vec<SlotRecord>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(
            "SELECT slot_number, task_id, timer_state, time_remaining, sprint_duration, playbook_date
             FROM playbook_slots
             WHERE user_id = ?1 AND playbook_date = ?2
             ORDER BY slot_number ASC",
        )?;
        let rows = statement.query_map(params![user_id, playbook_date.to_string()], parse_slot_row)?;
        let mut slots = Vec::new();
        for row in rows {
            slots.push(row?);
        }
        Ok(slots)
    }

    fn apply(&self, user_id: &str, origin: Option<&str>, writes: &[StoreWrite]) -> AppResult<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let mut tables = Vec::new();
        {
            let mut conn = self.connection()?;
            let tx = conn.transaction()?;
            for write in writes {
                apply_write(&tx, user_id, write)?;
                let table = write.table();
                if !tables.contains(&table) {
                    tables.push(table);
                }
            }
            tx.commit()?;
        }

        let notice = ChangeNotice {
            user_id: user_id.to_string(),
            tables,
            origin: origin.map(ToString::to_string),
            committed_at: Utc::now(),
        };
        // No subscribers is not an error.
        let _ = self.changes.send(notice);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.changes.subscribe()
    }
}

fn apply_write(tx: &Transaction<'_>, user_id: &str, write: &StoreWrite) -> AppResult<()> {
    match write {
        StoreWrite::UpsertTask(task) => {
            tx.execute(
                "INSERT INTO tasks (
                   id, user_id, bucket_id, title, notes, subtasks_json, links_json, priority, status, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                   bucket_id = excluded.bucket_id,
                   title = excluded.title,
                   notes = excluded.notes,
                   subtasks_json = excluded.subtasks_json,
                   links_json = excluded.links_json,
                   priority = excluded.priority,
                   status = excluded.status
                 WHERE tasks.user_id = excluded.user_id",
                params![
                    task.id,
                    user_id,
                    task.bucket_id.as_str(),
                    task.title,
                    task.notes,
                    serde_json::to_string(&task.subtasks)?,
                    serde_json::to_string(&task.links)?,
                    task.priority.as_str(),
                    task.column.as_str(),
                    task.created_at.to_rfc3339(),
                ],
            )?;
        }
        StoreWrite::DeleteTask(task_id) => {
            tx.execute(
                "DELETE FROM playbook_slots WHERE user_id = ?1 AND task_id = ?2",
                params![user_id, task_id],
            )?;
            tx.execute("DELETE FROM task_logs WHERE task_id = ?1", [task_id])?;
            let deleted = tx.execute(
                "DELETE FROM tasks WHERE id = ?1 AND user_id = ?2",
                params![task_id, user_id],
            )?;
            if deleted == 0 {
                tracing::debug!(task_id = %task_id, "delete skipped, task row already gone");
            }
        }
        StoreWrite::InsertLog { task_id, entry } => {
            tx.execute(
                "INSERT INTO task_logs (id, task_id, entry, created_at, edited_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.id,
                    task_id,
                    entry.text,
                    entry.created_at.to_rfc3339(),
                    entry.edited_at.map(|at| at.to_rfc3339()),
                ],
            )?;
        }
        StoreWrite::UpdateLog { task_id, entry } => {
            let updated = tx.execute(
                "UPDATE task_logs SET entry = ?1, edited_at = ?2 WHERE id = ?3 AND task_id = ?4",
                params![
                    entry.text,
                    entry.edited_at.map(|at| at.to_rfc3339()),
                    entry.id,
                    task_id
                ],
            )?;
            if updated == 0 {
                return Err(AppError::Store(format!("Log entry {} no longer exists", entry.id)));
            }
        }
        StoreWrite::UpsertSlot(record) => {
            let date = record.playbook_date.to_string();
            // A task occupies at most one slot per day.
            tx.execute(
                "DELETE FROM playbook_slots
                 WHERE user_id = ?1 AND playbook_date = ?2 AND task_id = ?3 AND slot_number != ?4",
                params![user_id, date, record.task_id, record.slot_number],
            )?;
            tx.execute(
                "INSERT INTO playbook_slots (
                   user_id, slot_number, task_id, timer_state, time_remaining, sprint_duration, playbook_date, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(user_id, slot_number, playbook_date) DO UPDATE SET
                   task_id = excluded.task_id,
                   timer_state = excluded.timer_state,
                   time_remaining = excluded.time_remaining,
                   sprint_duration = excluded.sprint_duration,
                   updated_at = excluded.updated_at",
                params![
                    user_id,
                    record.slot_number,
                    record.task_id,
                    record.timer_state.as_str(),
                    record.time_remaining,
                    record.sprint_duration,
                    date,
                    Utc::now().to_rfc3339(),
                ],
            )?;
        }
        StoreWrite::DeleteSlot {
            slot_number,
            playbook_date,
        } => {
            tx.execute(
                "DELETE FROM playbook_slots WHERE user_id = ?1 AND slot_number = ?2 AND playbook_date = ?3",
                params![user_id, slot_number, playbook_date.to_string()],
            )?;
        }
        StoreWrite::UpdateSlotTimer {
            slot_number,
            task_id,
            timer_state,
            time_remaining,
            playbook_date,
        } => {
            let updated = tx.execute(
                "UPDATE playbook_slots
                 SET timer_state = ?1, time_remaining = ?2, updated_at = ?3
                 WHERE user_id = ?4 AND slot_number = ?5 AND playbook_date = ?6 AND task_id = ?7",
                params![
                    timer_state.as_str(),
                    time_remaining,
                    Utc::now().to_rfc3339(),
                    user_id,
                    slot_number,
                    playbook_date.to_string(),
                    task_id,
                ],
            )?;
            if updated == 0 {
                tracing::debug!(slot = slot_number, task_id = %task_id, "timer update skipped, slot changed elsewhere");
            }
        }
    }
    Ok(())
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        bucket_id: parse_enum(&row.get::<_, String>(1)?, 1)?,
        title: row.get(2)?,
        notes: row.get(3)?,
        subtasks: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
        links: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        priority: parse_enum(&row.get::<_, String>(6)?, 6)?,
        column: parse_enum(&row.get::<_, String>(7)?, 7)?,
        created_at: parse_time(&row.get::<_, String>(8)?)?,
        log_entries: Vec::new(),
    })
}

fn parse_slot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SlotRecord> {
    let raw_date: String = row.get(5)?;
    Ok(SlotRecord {
        slot_number: row.get(0)?,
        task_id: row.get(1)?,
        timer_state: parse_enum(&row.get::<_, String>(2)?, 2)?,
        time_remaining: row.get(3)?,
        sprint_duration: row.get(4)?,
        playbook_date: NaiveDate::from_str(&raw_date).map_err(|error| conversion_error(5, error.to_string()))?,
    })
}

fn parse_enum<T>(raw: &str, column: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = AppError>,
{
    T::from_str(raw).map_err(|error| conversion_error(column, error.to_string()))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(0, error.to_string()))
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
