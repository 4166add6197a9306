use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = ".beansync.toml";

#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub beans: BeansConfig,
    #[serde(default)]
    pub clickup: ClickUpConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct BeansConfig {
    /// Directory holding the beans collection. Relative paths are resolved
    /// against the config file's directory.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClickUpConfig {
    #[serde(default)]
    pub list_id: String,
    /// Default assignee user ID. `Some(0)` means explicitly unassigned;
    /// `None` falls back to the token owner.
    pub assignee: Option<u64>,
    pub status_mapping: Option<HashMap<String, String>>,
    pub priority_mapping: Option<HashMap<String, u8>>,
    /// Bean type -> ClickUp custom item (task type) ID.
    pub type_mapping: Option<HashMap<String, u64>>,
    pub custom_fields: Option<CustomFieldsMap>,
    pub sync_filter: Option<SyncFilter>,
    /// Sync state backend: "file" (default) or "beans" (extension metadata).
    pub sync_state: Option<String>,
}

/// Bean fields mirrored into ClickUp custom fields, keyed by field UUID.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CustomFieldsMap {
    pub bean_id: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SyncFilter {
    #[serde(default)]
    pub exclude_status: Vec<String>,
}

/// Built-in bean status -> ClickUp status fallback.
pub fn default_status(status: &str) -> Option<&'static str> {
    match status {
        "draft" => Some("backlog"),
        "todo" => Some("to do"),
        "in-progress" => Some("in progress"),
        "completed" => Some("complete"),
        "scrapped" => Some("closed"),
        _ => None,
    }
}

/// Built-in bean priority -> ClickUp rank fallback (1=Urgent .. 4=Low).
pub fn default_priority(priority: &str) -> Option<u8> {
    match priority {
        "critical" => Some(1),
        "high" => Some(2),
        "normal" => Some(3),
        "low" | "deferred" => Some(4),
        _ => None,
    }
}

/// Loaded configuration plus the directory it was found in, which anchors
/// relative beans paths.
pub struct LoadedConfig {
    pub config: AppConfig,
    pub root: PathBuf,
}

impl LoadedConfig {
    pub fn beans_path(&self) -> PathBuf {
        let raw = self.config.beans.path.as_deref().unwrap_or(".beans");
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }
}

/// Searches upward from `start` for a `.beansync.toml`, then falls back to
/// `~/.beansync/config.toml`.
pub fn load_config(start: &Path) -> Result<LoadedConfig> {
    if let Some(path) = find_file_upward(start, CONFIG_FILE) {
        return read_config(&path);
    }

    let home_config = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".beansync")
        .join("config.toml");
    if home_config.exists() {
        return read_config(&home_config);
    }

    Ok(LoadedConfig {
        config: AppConfig::default(),
        root: start.to_path_buf(),
    })
}

fn read_config(path: &Path) -> Result<LoadedConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let root = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(LoadedConfig { config, root })
}

fn find_file_upward(start: &Path, name: &str) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}
