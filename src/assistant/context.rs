use crate::models::{BoardSnapshot, BucketId};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Compact view of the board sent alongside each completion request so
/// the model can refer to tasks by id.
pub fn board_context(snapshot: &BoardSnapshot) -> Value {
    let mut buckets = Map::new();
    for (bucket, tasks) in snapshot.tasks_by_bucket() {
        let entries = tasks
            .into_iter()
            .map(|task| {
                json!({
                    "id": task.id,
                    "title": task.title,
                    "priority": task.priority,
                    "column": task.column,
                })
            })
            .collect::<Vec<_>>();
        buckets.insert(bucket.as_str().to_string(), Value::Array(entries));
    }

    let playbook = snapshot
        .slots
        .iter()
        .filter_map(|slot| {
            let task = slot.task.as_ref()?;
            Some(json!({
                "slot": slot.slot_number,
                "task_id": task.id,
                "title": task.title,
                "bucket": task.bucket_id,
                "timer_state": slot.timer_state,
            }))
        })
        .collect::<Vec<_>>();

    let empty_slots = snapshot
        .slots
        .iter()
        .filter(|slot| slot.task.is_none())
        .map(|slot| slot.slot_number)
        .collect::<Vec<_>>();

    let bucket_labels: BTreeMap<&str, &str> = BucketId::ALL
        .iter()
        .map(|bucket| (bucket.as_str(), bucket.label()))
        .collect();

    json!({
        "buckets": buckets,
        "bucket_labels": bucket_labels,
        "playbook": playbook,
        "empty_slots": empty_slots,
    })
}
