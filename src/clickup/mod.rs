pub mod client;
pub mod types;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ApiError;
use types::{AuthorizedUser, CreateTaskRequest, List, Task, UpdateTaskRequest};

pub use client::ClickUpClient;

/// Remote task-tracker operations the sync engine depends on. The concrete
/// client wraps each call in the retry policy; tests substitute a mock.
#[async_trait]
pub trait RemoteTracker: Send + Sync {
    async fn get_task(&self, task_id: &str) -> Result<Task, ApiError>;
    async fn create_task(&self, list_id: &str, req: &CreateTaskRequest) -> Result<Task, ApiError>;
    async fn update_task(&self, task_id: &str, req: &UpdateTaskRequest) -> Result<Task, ApiError>;
    async fn add_tag(&self, task_id: &str, tag: &str) -> Result<(), ApiError>;
    async fn remove_tag(&self, task_id: &str, tag: &str) -> Result<(), ApiError>;
    /// Idempotently creates a tag at the space level so it can be attached to
    /// tasks. Cached per name for the lifetime of the client.
    async fn ensure_space_tag(&self, space_id: &str, tag: &str) -> Result<(), ApiError>;
    async fn set_custom_field(
        &self,
        task_id: &str,
        field_id: &str,
        value: Value,
    ) -> Result<(), ApiError>;
    /// `task_id` will wait on `depends_on`.
    async fn add_dependency(&self, task_id: &str, depends_on: &str) -> Result<(), ApiError>;
    async fn get_list(&self, list_id: &str) -> Result<List, ApiError>;
    async fn current_user(&self) -> Result<AuthorizedUser, ApiError>;
}
