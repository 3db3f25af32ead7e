use super::client::ToolCall;
use crate::errors::{AppError, AppResult};
use crate::models::{BucketId, NewTask, Priority, SLOT_COUNT};
use crate::sync::BoardSession;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{json, Value};

static BUCKET_NAMES: Lazy<Vec<&'static str>> =
    Lazy::new(|| BucketId::ALL.iter().map(|bucket| bucket.as_str()).collect());

static TOOL_SCHEMAS: Lazy<Vec<(&'static str, &'static str, Value)>> = Lazy::new(|| {
    let priority = json!({ "type": "string", "enum": ["low", "medium", "high"] });
    let bucket = json!({ "type": "string", "enum": BUCKET_NAMES.clone() });
    let task_id = json!({ "type": "string", "minLength": 1 });
    vec![
        (
            "create_tasks",
            "Create one or more tasks in the given buckets.",
            json!({
                "type": "object",
                "properties": {
                    "tasks": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "title": { "type": "string", "minLength": 1 },
                                "bucket_id": bucket,
                                "priority": priority,
                                "description": { "type": "string" }
                            },
                            "required": ["title", "bucket_id"]
                        }
                    }
                },
                "required": ["tasks"]
            }),
        ),
        (
            "rename_task",
            "Rename an existing task.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": task_id,
                    "new_title": { "type": "string", "minLength": 1 }
                },
                "required": ["task_id", "new_title"]
            }),
        ),
        (
            "delete_tasks",
            "Delete tasks by id, including tasks staged in the playbook.",
            json!({
                "type": "object",
                "properties": {
                    "task_ids": { "type": "array", "minItems": 1, "items": task_id }
                },
                "required": ["task_ids"]
            }),
        ),
        (
            "move_task_to_slot",
            "Stage a bucket task into an empty playbook slot.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": task_id,
                    "slot_number": { "type": "integer", "minimum": 1, "maximum": SLOT_COUNT }
                },
                "required": ["task_id", "slot_number"]
            }),
        ),
        (
            "update_task_priority",
            "Change the priority of a task.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": task_id,
                    "priority": priority
                },
                "required": ["task_id", "priority"]
            }),
        ),
        (
            "move_task_to_bucket",
            "Move a task to a different bucket.",
            json!({
                "type": "object",
                "properties": {
                    "task_id": task_id,
                    "new_bucket_id": bucket
                },
                "required": ["task_id", "new_bucket_id"]
            }),
        ),
    ]
});

/// Function-calling catalog sent with every first-step request.
pub fn tool_catalog() -> Value {
    Value::Array(
        TOOL_SCHEMAS
            .iter()
            .map(|(name, description, parameters)| {
                json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": description,
                        "parameters": parameters
                    }
                })
            })
            .collect(),
    )
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateTaskArgs {
    pub title: String,
    pub bucket_id: BucketId,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssistantAction {
    CreateTasks(Vec<CreateTaskArgs>),
    RenameTask { task_id: String, new_title: String },
    DeleteTasks(Vec<String>),
    MoveTaskToSlot { task_id: String, slot_number: u8 },
    UpdateTaskPriority { task_id: String, priority: Priority },
    MoveTaskToBucket { task_id: String, bucket: BucketId },
}

#[derive(Deserialize)]
struct CreateTasksArgs {
    tasks: Vec<CreateTaskArgs>,
}

#[derive(Deserialize)]
struct RenameArgs {
    task_id: String,
    new_title: String,
}

#[derive(Deserialize)]
struct DeleteArgs {
    task_ids: Vec<String>,
}

#[derive(Deserialize)]
struct SlotArgs {
    task_id: String,
    slot_number: u8,
}

#[derive(Deserialize)]
struct PriorityArgs {
    task_id: String,
    priority: Priority,
}

#[derive(Deserialize)]
struct BucketArgs {
    task_id: String,
    new_bucket_id: BucketId,
}

/// Decodes and schema-checks one tool call.
pub fn parse_tool_call(call: &ToolCall) -> AppResult<AssistantAction> {
    let name = call.function.name.as_str();
    let (_, _, schema) = TOOL_SCHEMAS
        .iter()
        .find(|(known, _, _)| *known == name)
        .ok_or_else(|| AppError::Validation(format!("Unknown action '{}'", name)))?;

    let arguments = decode_arguments(&call.function.arguments)?;
    validate_arguments(&arguments, schema)?;

    let action = match name {
        "create_tasks" => AssistantAction::CreateTasks(from_args::<CreateTasksArgs>(arguments)?.tasks),
        "rename_task" => {
            let args = from_args::<RenameArgs>(arguments)?;
            AssistantAction::RenameTask {
                task_id: args.task_id,
                new_title: args.new_title,
            }
        }
        "delete_tasks" => AssistantAction::DeleteTasks(from_args::<DeleteArgs>(arguments)?.task_ids),
        "move_task_to_slot" => {
            let args = from_args::<SlotArgs>(arguments)?;
            AssistantAction::MoveTaskToSlot {
                task_id: args.task_id,
                slot_number: args.slot_number,
            }
        }
        "update_task_priority" => {
            let args = from_args::<PriorityArgs>(arguments)?;
            AssistantAction::UpdateTaskPriority {
                task_id: args.task_id,
                priority: args.priority,
            }
        }
        "move_task_to_bucket" => {
            let args = from_args::<BucketArgs>(arguments)?;
            AssistantAction::MoveTaskToBucket {
                task_id: args.task_id,
                bucket: args.new_bucket_id,
            }
        }
        other => return Err(AppError::Validation(format!("Unknown action '{}'", other))),
    };
    Ok(action)
}

fn decode_arguments(raw: &Value) -> AppResult<Value> {
    match raw {
        Value::String(encoded) if encoded.trim().is_empty() => Ok(json!({})),
        Value::String(encoded) => serde_json::from_str(encoded)
            .map_err(|error| AppError::Validation(format!("Arguments are not valid JSON: {}", error))),
        Value::Null => Ok(json!({})),
        other => Ok(other.clone()),
    }
}

fn validate_arguments(arguments: &Value, schema: &Value) -> AppResult<()> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|error| AppError::Internal(format!("Invalid tool schema: {}", error)))?;
    let errors = compiled
        .validate(arguments)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if errors.is_empty() {
        return Ok(());
    }
    Err(AppError::Validation(errors.join("; ")))
}

fn from_args<T: serde::de::DeserializeOwned>(arguments: Value) -> AppResult<T> {
    serde_json::from_value(arguments).map_err(|error| AppError::Validation(error.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub succeeded: bool,
    pub message: String,
}

impl ActionOutcome {
    fn ok(message: String) -> Self {
        Self {
            succeeded: true,
            message,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            succeeded: false,
            message,
        }
    }

    pub fn line(&self) -> String {
        let marker = if self.succeeded { "✅" } else { "❌" };
        format!("{} {}", marker, self.message)
    }
}

/// Runs every tool call in order. A failing call is reported and the rest
/// still run.
pub async fn execute_tool_calls(session: &BoardSession, calls: &[ToolCall]) -> Vec<ActionOutcome> {
    let mut outcomes = Vec::new();
    for call in calls {
        match parse_tool_call(call) {
            Ok(action) => outcomes.extend(execute_action(session, action).await),
            Err(error) => {
                tracing::warn!(tool = %call.function.name, error = %error, "rejected assistant action");
                outcomes.push(ActionOutcome::failed(format!(
                    "Couldn't run {}: {}",
                    call.function.name,
                    error.detail()
                )));
            }
        }
    }
    outcomes
}

pub async fn execute_action(session: &BoardSession, action: AssistantAction) -> Vec<ActionOutcome> {
    match action {
        AssistantAction::CreateTasks(tasks) => {
            let mut outcomes = Vec::with_capacity(tasks.len());
            for args in tasks {
                let new_task = NewTask {
                    bucket_id: Some(args.bucket_id),
                    title: args.title.clone(),
                    description: args.description,
                    priority: args.priority,
                };
                outcomes.push(match session.add_task(new_task).await {
                    Ok(task) => ActionOutcome::ok(format!(
                        "Created \"{}\" in {} ({} priority)",
                        task.title,
                        task.bucket_id.label(),
                        task.priority.as_str()
                    )),
                    Err(error) => ActionOutcome::failed(format!(
                        "Couldn't create \"{}\": {}",
                        args.title.trim(),
                        error.detail()
                    )),
                });
            }
            outcomes
        }
        AssistantAction::RenameTask { task_id, new_title } => {
            let previous = title_of(session, &task_id).await;
            vec![match session.rename_task(&task_id, &new_title).await {
                Ok(()) => ActionOutcome::ok(format!("Renamed \"{}\" to \"{}\"", previous, new_title.trim())),
                Err(error) => ActionOutcome::failed(format!("Couldn't rename \"{}\": {}", previous, error.detail())),
            }]
        }
        AssistantAction::DeleteTasks(task_ids) => {
            let mut outcomes = Vec::with_capacity(task_ids.len());
            for task_id in task_ids {
                let title = title_of(session, &task_id).await;
                outcomes.push(match session.delete_task(&task_id).await {
                    Ok(()) => ActionOutcome::ok(format!("Deleted \"{}\"", title)),
                    Err(error) => ActionOutcome::failed(format!("Couldn't delete \"{}\": {}", title, error.detail())),
                });
            }
            outcomes
        }
        AssistantAction::MoveTaskToSlot { task_id, slot_number } => {
            let title = title_of(session, &task_id).await;
            vec![match session.move_task_to_slot(&task_id, slot_number).await {
                Ok(true) => ActionOutcome::ok(format!("Staged \"{}\" in slot {}", title, slot_number)),
                Ok(false) => ActionOutcome::failed(format!(
                    "Slot {} is already occupied, \"{}\" was not moved",
                    slot_number, title
                )),
                Err(error) => ActionOutcome::failed(format!("Couldn't stage \"{}\": {}", title, error.detail())),
            }]
        }
        AssistantAction::UpdateTaskPriority { task_id, priority } => {
            let title = title_of(session, &task_id).await;
            vec![match session.set_task_priority(&task_id, priority).await {
                Ok(()) => ActionOutcome::ok(format!("Set \"{}\" to {} priority", title, priority.as_str())),
                Err(error) => ActionOutcome::failed(format!(
                    "Couldn't change priority of \"{}\": {}",
                    title,
                    error.detail()
                )),
            }]
        }
        AssistantAction::MoveTaskToBucket { task_id, bucket } => {
            let title = title_of(session, &task_id).await;
            vec![match session.move_task_to_bucket(&task_id, bucket).await {
                Ok(()) => ActionOutcome::ok(format!("Moved \"{}\" to {}", title, bucket.label())),
                Err(error) => ActionOutcome::failed(format!("Couldn't move \"{}\": {}", title, error.detail())),
            }]
        }
    }
}

async fn title_of(session: &BoardSession, task_id: &str) -> String {
    session
        .task(task_id)
        .await
        .map(|task| task.title)
        .unwrap_or_else(|| task_id.to_string())
}
