use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A ClickUp task as returned by the task endpoints. Numeric fields such as
/// `due_date` arrive as decimal strings and must be normalized before
/// comparison.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    /// Epoch milliseconds as a decimal string.
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub custom_item_id: Option<u64>,
    #[serde(default)]
    pub custom_fields: Vec<CustomFieldValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskStatus {
    #[serde(default)]
    pub status: String,
}

/// Priority object on a task; `id` is the rank as a decimal string.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskPriority {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tag {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomFieldValue {
    pub id: String,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateTaskRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<u64>,
    /// Parent task ID when creating a subtask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date_time: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_item_id: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_fields: Vec<CustomFieldPayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomFieldPayload {
    pub id: String,
    pub value: Value,
}

/// Partial update; only fields that differ from the remote task are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateTaskRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markdown_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date_time: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_item_id: Option<u64>,
}

impl UpdateTaskRequest {
    pub fn is_empty(&self) -> bool {
        *self == UpdateTaskRequest::default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AddDependencyRequest {
    pub depends_on: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct List {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub space: Option<SpaceRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizedUser {
    pub id: u64,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserResponse {
    pub user: AuthorizedUser,
}

/// ClickUp error body, e.g. `{"err": "Task not found", "ECODE": "ITEM_013"}`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub err: String,
    #[serde(default, rename = "ECODE")]
    pub ecode: String,
}
