use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A bean as emitted by `beans list --json`. The sync engine treats beans as
/// read-only; all mutation happens on the ClickUp side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bean {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub status: BeanStatus,
    #[serde(rename = "type")]
    pub bean_type: BeanType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<BeanPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Date-only due date, e.g. "2025-06-15".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Bean IDs this bean blocks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Extension metadata carried by the beans CLI, used to seed the batched
    /// sync state store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<BeanSyncState>,
}

/// Per-integration sync metadata attached to a bean.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeanSyncState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clickup: Option<ClickUpRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClickUpRef {
    #[serde(default)]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeanStatus {
    Draft,
    Todo,
    InProgress,
    Completed,
    Scrapped,
}

impl BeanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeanStatus::Draft => "draft",
            BeanStatus::Todo => "todo",
            BeanStatus::InProgress => "in-progress",
            BeanStatus::Completed => "completed",
            BeanStatus::Scrapped => "scrapped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeanPriority {
    Critical,
    High,
    Normal,
    Low,
    Deferred,
}

impl BeanPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeanPriority::Critical => "critical",
            BeanPriority::High => "high",
            BeanPriority::Normal => "normal",
            BeanPriority::Low => "low",
            BeanPriority::Deferred => "deferred",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeanType {
    Task,
    Bug,
    Feature,
    Epic,
    Chore,
}

impl BeanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeanType::Task => "task",
            BeanType::Bug => "bug",
            BeanType::Feature => "feature",
            BeanType::Epic => "epic",
            BeanType::Chore => "chore",
        }
    }
}

impl Bean {
    /// Linked ClickUp task ID from bean metadata, if any.
    pub fn clickup_task_id(&self) -> Option<&str> {
        let link = self.sync.as_ref()?.clickup.as_ref()?;
        if link.task_id.is_empty() {
            None
        } else {
            Some(&link.task_id)
        }
    }

    /// Last sync timestamp from bean metadata, if any.
    pub fn clickup_synced_at(&self) -> Option<DateTime<Utc>> {
        self.sync.as_ref()?.clickup.as_ref()?.synced_at
    }
}
