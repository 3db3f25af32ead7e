//! Import of free-text task descriptions written in the line-prefix format
//! (`[ ] item`, `[x] item`, bare URL lines) into structured task fields.

use crate::models::{Subtask, TaskLink};
use once_cell::sync::Lazy;
use regex::Regex;

static CHECKBOX_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*[-*]?\s*\[([ xX])\]\s+(.+?)\s*$").expect("valid checkbox regex")
});

static URL_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:(.+?)\s*[:|]\s+)?(https?://[^\s<>]+)\s*$").expect("valid url regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportedDescription {
    pub notes: String,
    pub subtasks: Vec<Subtask>,
    pub links: Vec<TaskLink>,
}

pub fn import_description(raw: &str) -> ImportedDescription {
    let mut imported = ImportedDescription::default();
    let mut note_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if let Some(caps) = CHECKBOX_LINE.captures(line) {
            let checked = caps.get(1).map(|m| m.as_str() != " ").unwrap_or(false);
            let text = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            imported.subtasks.push(Subtask {
                text: text.to_string(),
                checked,
            });
            continue;
        }
        if let Some(caps) = URL_LINE.captures(line) {
            let url = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            if !imported.links.iter().any(|link| link.url == url) {
                imported.links.push(TaskLink {
                    url: url.to_string(),
                    label: caps.get(1).map(|m| m.as_str().to_string()),
                });
            }
            continue;
        }
        note_lines.push(line);
    }

    imported.notes = note_lines.join("\n").trim().to_string();
    imported
}
