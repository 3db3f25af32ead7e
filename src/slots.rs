use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, LoggingReason, PlaybookSlot, Task, TimerState, DEFAULT_DURATION_PRESETS_SECS,
    DEFAULT_SPRINT_SECS, DEFAULT_WARNING_THRESHOLD_SECS, SLOT_COUNT,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerConfig {
    pub default_sprint_secs: u32,
    pub warning_threshold_secs: u32,
    pub duration_presets_secs: Vec<u32>,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            default_sprint_secs: DEFAULT_SPRINT_SECS,
            warning_threshold_secs: DEFAULT_WARNING_THRESHOLD_SECS,
            duration_presets_secs: DEFAULT_DURATION_PRESETS_SECS.to_vec(),
        }
    }
}

impl TimerConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        let mut presets = settings
            .duration_presets_secs
            .iter()
            .copied()
            .filter(|seconds| *seconds > 0)
            .collect::<Vec<_>>();
        if presets.is_empty() {
            presets = DEFAULT_DURATION_PRESETS_SECS.to_vec();
        }
        presets.sort_unstable();
        presets.dedup();
        Self {
            default_sprint_secs: settings.default_sprint_secs.max(1),
            warning_threshold_secs: settings.warning_threshold_secs,
            duration_presets_secs: presets,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub slot_number: u8,
    pub time_remaining: u32,
    pub entered_logging: Option<LoggingReason>,
}

impl PlaybookSlot {
    pub fn empty(slot_number: u8, sprint_duration: u32) -> Self {
        Self {
            slot_number,
            task: None,
            timer_state: TimerState::Idle,
            time_remaining: sprint_duration,
            sprint_duration,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.task.is_none()
    }

    /// Removes the staged task and returns the slot to its idle default.
    pub fn clear(&mut self, default_sprint_secs: u32) -> Option<Task> {
        let task = self.task.take();
        self.timer_state = TimerState::Idle;
        self.sprint_duration = default_sprint_secs;
        self.time_remaining = default_sprint_secs;
        task
    }

    pub fn stage(&mut self, task: Task) {
        self.task = Some(task);
        self.timer_state = TimerState::Idle;
        self.time_remaining = self.sprint_duration;
    }

    pub fn start(&mut self) -> AppResult<()> {
        self.require_task()?;
        match self.timer_state {
            TimerState::Idle | TimerState::Paused => {
                self.timer_state = TimerState::Running;
                Ok(())
            }
            TimerState::Running => Err(AppError::Validation(format!(
                "Slot {} is already running",
                self.slot_number
            ))),
            TimerState::Logging => Err(AppError::Validation(format!(
                "Slot {} is waiting for a status log",
                self.slot_number
            ))),
        }
    }

    pub fn pause(&mut self) -> AppResult<()> {
        self.require_task()?;
        if self.timer_state != TimerState::Running {
            return Err(AppError::Validation(format!(
                "Slot {} is not running",
                self.slot_number
            )));
        }
        self.timer_state = TimerState::Paused;
        Ok(())
    }

    /// One second of countdown. Only the crossing edge switches to logging;
    /// a slot already in logging is no longer running and ignores ticks.
    pub fn tick(&mut self, warning_threshold_secs: u32) -> Option<LoggingReason> {
        if self.timer_state != TimerState::Running {
            return None;
        }
        let previous = self.time_remaining;
        let next = previous.saturating_sub(1);
        self.time_remaining = next;

        if next == 0 {
            self.timer_state = TimerState::Logging;
            return Some(LoggingReason::Expired);
        }
        if previous > warning_threshold_secs && next <= warning_threshold_secs {
            self.timer_state = TimerState::Logging;
            return Some(LoggingReason::Warning);
        }
        None
    }

    pub fn set_time_remaining(&mut self, seconds: i64) -> AppResult<()> {
        self.require_task()?;
        self.time_remaining = seconds.clamp(0, i64::from(self.sprint_duration)) as u32;
        Ok(())
    }

    pub fn skip(&mut self, delta_seconds: i64) -> AppResult<()> {
        let target = i64::from(self.time_remaining) + delta_seconds;
        self.set_time_remaining(target)
    }

    pub fn apply_preset(&mut self, seconds: u32) -> AppResult<()> {
        self.require_task()?;
        if seconds == 0 {
            return Err(AppError::Validation("Duration preset must be positive".to_string()));
        }
        if self.timer_state == TimerState::Running {
            return self.set_time_remaining(i64::from(seconds));
        }
        self.sprint_duration = seconds;
        self.time_remaining = seconds;
        Ok(())
    }

    pub fn scrub(&mut self, fraction: f64) -> AppResult<()> {
        if !fraction.is_finite() {
            return Err(AppError::Validation("Scrub position must be a number".to_string()));
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let elapsed = (fraction * f64::from(self.sprint_duration)).round() as i64;
        self.set_time_remaining(i64::from(self.sprint_duration) - elapsed)
    }

    fn require_task(&self) -> AppResult<&Task> {
        self.task
            .as_ref()
            .ok_or_else(|| AppError::Validation(format!("Slot {} is empty", self.slot_number)))
    }
}

/// The eight playbook slots. The collection is fixed at construction; slots
/// are addressed by their 1-based number and never added or removed.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotBoard {
    slots: Vec<PlaybookSlot>,
}

impl SlotBoard {
    pub fn new(default_sprint_secs: u32) -> Self {
        Self {
            slots: (1..=SLOT_COUNT)
                .map(|number| PlaybookSlot::empty(number, default_sprint_secs))
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlaybookSlot> {
        self.slots.iter()
    }

    pub fn to_vec(&self) -> Vec<PlaybookSlot> {
        self.slots.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot_number: u8) -> AppResult<&PlaybookSlot> {
        let index = slot_index(slot_number)?;
        Ok(&self.slots[index])
    }

    pub fn get_mut(&mut self, slot_number: u8) -> AppResult<&mut PlaybookSlot> {
        let index = slot_index(slot_number)?;
        Ok(&mut self.slots[index])
    }

    pub fn find_task(&self, task_id: &str) -> Option<u8> {
        self.slots
            .iter()
            .find(|slot| slot.task.as_ref().map(|task| task.id == task_id).unwrap_or(false))
            .map(|slot| slot.slot_number)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.task.as_mut())
            .find(|task| task.id == task_id)
    }

    pub fn empty_slot_numbers(&self) -> Vec<u8> {
        self.slots
            .iter()
            .filter(|slot| slot.is_empty())
            .map(|slot| slot.slot_number)
            .collect()
    }

    pub fn occupied(&self) -> impl Iterator<Item = &PlaybookSlot> {
        self.slots.iter().filter(|slot| !slot.is_empty())
    }

    /// First running slot, else first paused slot.
    pub fn focus_slot(&self) -> Option<&PlaybookSlot> {
        self.occupied()
            .find(|slot| slot.timer_state == TimerState::Running)
            .or_else(|| self.occupied().find(|slot| slot.timer_state == TimerState::Paused))
    }

    pub fn tick(&mut self, warning_threshold_secs: u32) -> Vec<TickReport> {
        self.slots
            .iter_mut()
            .filter(|slot| slot.timer_state == TimerState::Running)
            .map(|slot| {
                let entered_logging = slot.tick(warning_threshold_secs);
                TickReport {
                    slot_number: slot.slot_number,
                    time_remaining: slot.time_remaining,
                    entered_logging,
                }
            })
            .collect()
    }

    /// Moves the staged task of `from` onto `to`, exchanging the two slots'
    /// contents and timer state when `to` is occupied. Returns false when
    /// nothing moved.
    pub fn relocate(&mut self, from: u8, to: u8, default_sprint_secs: u32) -> AppResult<bool> {
        let from_index = slot_index(from)?;
        let to_index = slot_index(to)?;
        if from_index == to_index || self.slots[from_index].is_empty() {
            return Ok(false);
        }

        self.slots.swap(from_index, to_index);
        self.slots[from_index].slot_number = from;
        self.slots[to_index].slot_number = to;
        if self.slots[from_index].is_empty() {
            self.slots[from_index].clear(default_sprint_secs);
        }
        Ok(true)
    }
}

fn slot_index(slot_number: u8) -> AppResult<usize> {
    if !(1..=SLOT_COUNT).contains(&slot_number) {
        return Err(AppError::Validation(format!(
            "Slot number must be between 1 and {}, got {}",
            SLOT_COUNT, slot_number
        )));
    }
    Ok(usize::from(slot_number - 1))
}

pub fn format_clock(seconds: u32) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
