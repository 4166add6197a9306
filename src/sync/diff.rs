//! Pure field-level diffing and mapping. No I/O; the syncer decides what to
//! do with the computed deltas.

use std::collections::{BTreeSet, HashMap};

use chrono::{NaiveDate, TimeZone};
use serde_json::Value;

use crate::clickup::types::{CustomFieldValue, Tag, Task, UpdateTaskRequest};
use crate::config::{self, ClickUpConfig};
use crate::model::bean::{BeanPriority, BeanStatus, BeanType};

/// Remote field values a bean should have, computed once per bean.
#[derive(Debug, Clone, Default)]
pub struct DesiredFields {
    pub name: String,
    pub description: String,
    pub status: Option<String>,
    pub priority: Option<u8>,
    pub due_date: Option<i64>,
    pub custom_item_id: Option<u64>,
}

/// Configured status mapping with key-level fallback to the built-in table.
pub fn map_status(cfg: &ClickUpConfig, status: BeanStatus) -> Option<String> {
    if let Some(mapping) = &cfg.status_mapping {
        if let Some(mapped) = mapping.get(status.as_str()) {
            return Some(mapped.clone());
        }
    }
    config::default_status(status.as_str()).map(str::to_string)
}

pub fn map_priority(cfg: &ClickUpConfig, priority: BeanPriority) -> Option<u8> {
    if let Some(mapping) = &cfg.priority_mapping {
        if let Some(rank) = mapping.get(priority.as_str()) {
            return Some(*rank);
        }
    }
    config::default_priority(priority.as_str())
}

/// Type mapping is configuration-only; unmapped types leave the ClickUp
/// default task type in place.
pub fn map_type(cfg: &ClickUpConfig, bean_type: BeanType) -> Option<u64> {
    cfg.type_mapping
        .as_ref()
        .and_then(|mapping| mapping.get(bean_type.as_str()))
        .copied()
}

/// Converts a date-only due date to epoch milliseconds at midnight in the
/// given timezone. Parsing the date as UTC midnight and reinterpreting it
/// locally would shift the displayed date backward for timezones behind UTC.
pub fn due_date_millis<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Option<i64> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Builds the partial update for an existing task: only fields whose desired
/// value differs from the remote value are set. ClickUp returns dates and
/// priority ranks as decimal strings, so both sides are normalized to
/// integers before comparison.
pub fn build_task_update(current: &Task, desired: &DesiredFields) -> UpdateTaskRequest {
    let mut update = UpdateTaskRequest::default();

    if current.name != desired.name {
        update.name = Some(desired.name.clone());
    }
    if current.description != desired.description {
        update.markdown_description = Some(desired.description.clone());
    }
    if let Some(status) = &desired.status {
        if !current.status.status.eq_ignore_ascii_case(status) {
            update.status = Some(status.clone());
        }
    }
    if let Some(rank) = desired.priority {
        let current_rank = current
            .priority
            .as_ref()
            .and_then(|p| p.id.trim().parse::<u8>().ok());
        if current_rank != Some(rank) {
            update.priority = Some(rank);
        }
    }
    if let Some(due) = desired.due_date {
        let current_due = current
            .due_date
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok());
        if current_due != Some(due) {
            update.due_date = Some(due);
            update.due_date_time = Some(false);
        }
    }
    if let Some(item_id) = desired.custom_item_id {
        if current.custom_item_id != Some(item_id) {
            update.custom_item_id = Some(item_id);
        }
    }

    update
}

/// Symmetric set difference between desired and current tags. Outputs are
/// sorted and duplicate-free.
pub fn diff_tags(desired: &[String], current: &[Tag]) -> (Vec<String>, Vec<String>) {
    let want: BTreeSet<&str> = desired.iter().map(String::as_str).collect();
    let have: BTreeSet<&str> = current.iter().map(|t| t.name.as_str()).collect();

    let to_add = want.difference(&have).map(|s| s.to_string()).collect();
    let to_remove = have.difference(&want).map(|s| s.to_string()).collect();
    (to_add, to_remove)
}

/// Custom field IDs whose remote value differs from the desired value, with
/// the same numeric normalization as dates. Fields absent remotely count as
/// changed.
pub fn diff_custom_fields(
    current: &[CustomFieldValue],
    desired: &HashMap<String, Value>,
) -> Vec<String> {
    let by_id: HashMap<&str, Option<&Value>> = current
        .iter()
        .map(|field| (field.id.as_str(), field.value.as_ref()))
        .collect();

    let mut changed: Vec<String> = desired
        .iter()
        .filter(|(id, want)| match by_id.get(id.as_str()).copied().flatten() {
            Some(have) => !values_equal(have, want),
            None => true,
        })
        .map(|(id, _)| id.clone())
        .collect();
    changed.sort();
    changed
}

fn values_equal(have: &Value, want: &Value) -> bool {
    if have == want {
        return true;
    }
    match (as_integer(have), as_integer(want)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clickup::types::TaskPriority;
    use crate::clickup::types::TaskStatus;
    use chrono::FixedOffset;
    use serde_json::json;

    fn task(name: &str, status: &str) -> Task {
        Task {
            id: "task-1".into(),
            name: name.into(),
            status: TaskStatus {
                status: status.into(),
            },
            ..Task::default()
        }
    }

    fn desired(name: &str, status: &str) -> DesiredFields {
        DesiredFields {
            name: name.into(),
            status: Some(status.into()),
            ..DesiredFields::default()
        }
    }

    #[test]
    fn update_is_empty_when_nothing_changed() {
        let mut current = task("Fix login", "to do");
        current.priority = Some(TaskPriority { id: "2".into() });
        current.due_date = Some("1749963600000".into());

        let want = DesiredFields {
            name: "Fix login".into(),
            status: Some("to do".into()),
            priority: Some(2),
            due_date: Some(1_749_963_600_000),
            ..DesiredFields::default()
        };

        let update = build_task_update(&current, &want);
        assert!(update.is_empty());
    }

    #[test]
    fn string_typed_remote_date_does_not_false_diff() {
        // remote stores the epoch as a string; equal values must not produce
        // an update
        let mut current = task("x", "to do");
        current.due_date = Some(" 1700000000000 ".into());
        let mut want = desired("x", "to do");
        want.due_date = Some(1_700_000_000_000);

        assert!(build_task_update(&current, &want).is_empty());
    }

    #[test]
    fn changed_fields_appear_in_update() {
        let current = task("Old name", "to do");
        let mut want = desired("New name", "in progress");
        want.priority = Some(1);
        want.due_date = Some(1_700_000_000_000);
        want.custom_item_id = Some(1002);

        let update = build_task_update(&current, &want);
        assert_eq!(update.name.as_deref(), Some("New name"));
        assert_eq!(update.status.as_deref(), Some("in progress"));
        assert_eq!(update.priority, Some(1));
        assert_eq!(update.due_date, Some(1_700_000_000_000));
        assert_eq!(update.due_date_time, Some(false));
        assert_eq!(update.custom_item_id, Some(1002));
    }

    #[test]
    fn status_comparison_is_case_insensitive() {
        let current = task("x", "To Do");
        let update = build_task_update(&current, &desired("x", "to do"));
        assert!(update.status.is_none());
    }

    #[test]
    fn due_date_is_local_midnight() {
        // UTC-5: 2025-06-15T00:00:00-05:00 == 2025-06-15T05:00:00Z
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        let millis = due_date_millis(date, &tz).unwrap();
        assert_eq!(millis, 1_749_963_600_000);

        // and in UTC it is plain midnight
        let utc_millis = due_date_millis(date, &chrono::Utc).unwrap();
        assert_eq!(utc_millis, 1_749_945_600_000);
    }

    #[test]
    fn due_date_round_trips_through_local_midnight() {
        let tz = FixedOffset::west_opt(5 * 3600).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 12, 25).unwrap();
        let millis = due_date_millis(date, &tz).unwrap();

        let back = tz
            .timestamp_millis_opt(millis)
            .single()
            .map(|dt| dt.date_naive());
        assert_eq!(back, Some(date));
    }

    #[test]
    fn diff_tags_symmetric_difference() {
        let desired_tags: Vec<String> = vec!["keep".into(), "new".into()];
        let current_tags = vec![
            Tag { name: "keep".into() },
            Tag { name: "old".into() },
        ];

        let (to_add, to_remove) = diff_tags(&desired_tags, &current_tags);
        assert_eq!(to_add, vec!["new"]);
        assert_eq!(to_remove, vec!["old"]);

        // swapping sides swaps the outputs
        let swapped_desired: Vec<String> = vec!["keep".into(), "old".into()];
        let swapped_current = vec![
            Tag { name: "keep".into() },
            Tag { name: "new".into() },
        ];
        let (add2, remove2) = diff_tags(&swapped_desired, &swapped_current);
        assert_eq!(add2, to_remove);
        assert_eq!(remove2, to_add);
        assert!(add2.iter().all(|t| !remove2.contains(t)));
    }

    #[test]
    fn diff_tags_deduplicates() {
        let desired_tags: Vec<String> = vec!["a".into(), "a".into(), "b".into()];
        let (to_add, to_remove) = diff_tags(&desired_tags, &[]);
        assert_eq!(to_add, vec!["a", "b"]);
        assert!(to_remove.is_empty());
    }

    #[test]
    fn diff_custom_fields_normalizes_numeric_strings() {
        let current = vec![
            CustomFieldValue {
                id: "f-created".into(),
                value: Some(json!("1700000000000")),
            },
            CustomFieldValue {
                id: "f-bean".into(),
                value: Some(json!("bean-1")),
            },
        ];
        let desired = HashMap::from([
            ("f-created".to_string(), json!(1_700_000_000_000i64)),
            ("f-bean".to_string(), json!("bean-1")),
            ("f-updated".to_string(), json!(1_700_000_999_000i64)),
        ]);

        let changed = diff_custom_fields(&current, &desired);
        assert_eq!(changed, vec!["f-updated"]);
    }

    #[test]
    fn mapping_falls_back_per_key() {
        let mut cfg = ClickUpConfig::default();
        cfg.status_mapping = Some(HashMap::from([("todo".to_string(), "open".to_string())]));

        // configured key wins
        assert_eq!(map_status(&cfg, BeanStatus::Todo).as_deref(), Some("open"));
        // absent key falls back to the built-in table
        assert_eq!(
            map_status(&cfg, BeanStatus::InProgress).as_deref(),
            Some("in progress")
        );

        assert_eq!(map_priority(&cfg, BeanPriority::High), Some(2));
        // no type mapping configured -> omit the field
        assert_eq!(map_type(&cfg, BeanType::Bug), None);

        cfg.type_mapping = Some(HashMap::from([("bug".to_string(), 77u64)]));
        assert_eq!(map_type(&cfg, BeanType::Bug), Some(77));
    }
}
