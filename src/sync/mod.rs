//! Reconciliation of beans against ClickUp tasks. Runs in passes: roots,
//! then beans whose parent is in the same run, then blocking relationships,
//! with a join barrier between passes so a dependent never needs a parent
//! task ID that does not exist yet.

pub mod diff;
pub mod state;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::clickup::types::{CreateTaskRequest, CustomFieldPayload, Task};
use crate::clickup::RemoteTracker;
use crate::config::{ClickUpConfig, SyncFilter};
use crate::model::bean::Bean;

use self::diff::DesiredFields;
use self::state::SyncStateStore;

/// Per-call allowance used to derive the overall run deadline.
const CALL_ALLOWANCE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    Unchanged,
    Skipped,
    WouldCreate,
    WouldUpdate,
    Error,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Created => "created",
            SyncAction::Updated => "updated",
            SyncAction::Unchanged => "unchanged",
            SyncAction::Skipped => "skipped",
            SyncAction::WouldCreate => "would create",
            SyncAction::WouldUpdate => "would update",
            SyncAction::Error => "error",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of reconciling one bean. Ordered to match the input bean order
/// regardless of completion order.
#[derive(Debug)]
pub struct SyncResult {
    pub bean_id: String,
    pub bean_title: String,
    pub task_id: Option<String>,
    pub task_url: Option<String>,
    pub action: SyncAction,
    pub error: Option<anyhow::Error>,
}

impl SyncResult {
    fn new(bean: &Bean) -> Self {
        SyncResult {
            bean_id: bean.id.clone(),
            bean_title: bean.title.clone(),
            task_id: None,
            task_url: None,
            action: SyncAction::Skipped,
            error: None,
        }
    }

    fn failed(mut self, err: anyhow::Error) -> Self {
        self.action = SyncAction::Error;
        self.error = Some(err);
        self
    }
}

/// Called as each bean finishes with (result, completed, total).
pub type ProgressFn = Box<dyn Fn(&SyncResult, usize, usize) + Send + Sync>;

#[derive(Default)]
pub struct SyncOptions {
    /// Compute intended actions without writing remotely or to the store.
    pub dry_run: bool,
    /// Reconcile even when the bean is unchanged since the last sync.
    pub force: bool,
    pub no_relationships: bool,
    pub list_id: String,
    pub on_progress: Option<ProgressFn>,
}

pub struct Syncer {
    tracker: Arc<dyn RemoteTracker>,
    store: Arc<dyn SyncStateStore>,
    config: ClickUpConfig,
    opts: SyncOptions,
    /// bean ID -> task ID, shared across workers within a pass.
    bean_to_task: Mutex<HashMap<String, String>>,
    completed: Mutex<usize>,
    /// Resolved once per run during prefetch.
    assignees: Vec<u64>,
    space_id: Option<String>,
}

impl Syncer {
    pub fn new(
        tracker: Arc<dyn RemoteTracker>,
        store: Arc<dyn SyncStateStore>,
        config: ClickUpConfig,
        opts: SyncOptions,
    ) -> Self {
        Self {
            tracker,
            store,
            config,
            opts,
            bean_to_task: Mutex::new(HashMap::new()),
            completed: Mutex::new(0),
            assignees: Vec::new(),
            space_id: None,
        }
    }

    /// Reconciles all beans and returns one result per bean, in input order.
    /// Only configuration and state-store flush failures are run-fatal;
    /// everything else is reported per bean.
    pub async fn sync_beans(&mut self, beans: &[Bean]) -> Result<Vec<SyncResult>> {
        if self.opts.list_id.is_empty() {
            bail!("clickup list_id is not configured");
        }

        self.prefetch().await;
        self.preload_links(beans);

        // roots first; a bean is a root when its parent is absent or not in
        // this run
        let syncing: HashSet<&str> = beans.iter().map(|b| b.id.as_str()).collect();
        let mut roots = Vec::new();
        let mut dependents = Vec::new();
        for (idx, bean) in beans.iter().enumerate() {
            match &bean.parent {
                Some(parent) if syncing.contains(parent.as_str()) => dependents.push(idx),
                _ => roots.push(idx),
            }
        }
        info!(
            total = beans.len(),
            roots = roots.len(),
            dependents = dependents.len(),
            "starting sync"
        );

        let total = beans.len();
        let mut slots: Vec<Option<SyncResult>> = Vec::with_capacity(total);
        slots.resize_with(total, || None);

        let this: &Syncer = self;
        for layer in [&roots, &dependents] {
            let futures = layer.iter().map(|&idx| {
                let bean = &beans[idx];
                async move {
                    let result = this.sync_bean(bean).await;
                    if result.error.is_none() && result.action != SyncAction::Skipped {
                        if let Some(task_id) = &result.task_id {
                            this.record_task(&bean.id, task_id);
                        }
                    }
                    this.report_progress(&result, total);
                    (idx, result)
                }
            });
            for (idx, result) in join_all(futures).await {
                slots[idx] = Some(result);
            }
        }

        // relationship pass is best-effort and skipped in preview mode
        if !self.opts.no_relationships && !self.opts.dry_run {
            let futures = beans.iter().map(|bean| async move {
                if let Err(err) = this.sync_relationships(bean).await {
                    warn!(bean = %bean.id, error = %err, "relationship sync failed");
                }
            });
            join_all(futures).await;
        }

        let results: Vec<SyncResult> = slots.into_iter().flatten().collect();

        if !self.opts.dry_run {
            self.store.flush().await.context("flushing sync state")?;
        }
        Ok(results)
    }

    /// Resolves the default assignee and the list's space once per run. Both
    /// are non-fatal: tasks fall back to unassigned, tag pre-registration is
    /// skipped.
    async fn prefetch(&mut self) {
        self.assignees = match self.config.assignee {
            Some(0) => Vec::new(),
            Some(id) => vec![id],
            None => match self.tracker.current_user().await {
                Ok(user) => vec![user.id],
                Err(err) => {
                    warn!(error = %err, "could not resolve token owner, creating unassigned tasks");
                    Vec::new()
                }
            },
        };

        self.space_id = match self.tracker.get_list(&self.opts.list_id).await {
            Ok(list) => list.space.map(|s| s.id),
            Err(err) => {
                warn!(error = %err, "could not fetch list metadata, skipping tag pre-registration");
                None
            }
        };
    }

    fn preload_links(&self, beans: &[Bean]) {
        let mut map = self
            .bean_to_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for bean in beans {
            if let Some(task_id) = self.store.task_id(&bean.id) {
                map.insert(bean.id.clone(), task_id);
            }
        }
    }

    fn record_task(&self, bean_id: &str, task_id: &str) {
        self.bean_to_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bean_id.to_string(), task_id.to_string());
    }

    fn lookup_task(&self, bean_id: &str) -> Option<String> {
        self.bean_to_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(bean_id)
            .cloned()
    }

    fn report_progress(&self, result: &SyncResult, total: usize) {
        if let Some(on_progress) = &self.opts.on_progress {
            let completed = {
                let mut n = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
                *n += 1;
                *n
            };
            on_progress(result, completed, total);
        }
    }

    async fn sync_bean(&self, bean: &Bean) -> SyncResult {
        let mut result = SyncResult::new(bean);
        let desired = self.desired_fields(bean);

        if let Some(task_id) = self.store.task_id(&bean.id) {
            result.task_id = Some(task_id.clone());

            if !self.opts.force && !self.needs_sync(bean) {
                result.action = SyncAction::Skipped;
                return result;
            }

            match self.tracker.get_task(&task_id).await {
                Ok(task) => return self.update_bean_task(bean, &task, &desired, result).await,
                Err(err) if err.is_not_found() => {
                    // the linked task was deleted remotely; unlink and
                    // recreate below
                    debug!(bean = %bean.id, task = %task_id, "linked task gone, unlinking");
                    self.store.clear(&bean.id);
                    result.task_id = None;
                }
                Err(err) => {
                    return result.failed(
                        anyhow::Error::new(err).context(format!("fetching task {task_id}")),
                    );
                }
            }
        }

        self.create_bean_task(bean, &desired, result).await
    }

    async fn update_bean_task(
        &self,
        bean: &Bean,
        task: &Task,
        desired: &DesiredFields,
        mut result: SyncResult,
    ) -> SyncResult {
        result.task_url = Some(task.url.clone());

        if self.opts.dry_run {
            result.action = SyncAction::WouldUpdate;
            return result;
        }

        let update = diff::build_task_update(task, desired);
        let mut changed = false;

        if !update.is_empty() {
            match self.tracker.update_task(&task.id, &update).await {
                Ok(updated) => {
                    if !updated.url.is_empty() {
                        result.task_url = Some(updated.url);
                    }
                    changed = true;
                }
                Err(err) => {
                    return result
                        .failed(anyhow::Error::new(err).context(format!("updating task {}", task.id)));
                }
            }
        }

        if self.sync_tags(&task.id, bean, &task.tags).await {
            changed = true;
        }
        if self.sync_custom_fields(&task.id, bean, task).await {
            changed = true;
        }

        self.store.set_synced_at(&bean.id, Utc::now());
        result.action = if changed {
            SyncAction::Updated
        } else {
            SyncAction::Unchanged
        };
        result
    }

    async fn create_bean_task(
        &self,
        bean: &Bean,
        desired: &DesiredFields,
        mut result: SyncResult,
    ) -> SyncResult {
        if self.opts.dry_run {
            result.action = SyncAction::WouldCreate;
            return result;
        }

        let parent = bean
            .parent
            .as_deref()
            .and_then(|parent| self.lookup_task(parent));

        let req = CreateTaskRequest {
            name: desired.name.clone(),
            markdown_description: if desired.description.is_empty() {
                None
            } else {
                Some(desired.description.clone())
            },
            status: desired.status.clone(),
            priority: desired.priority,
            assignees: self.assignees.clone(),
            parent,
            due_date: desired.due_date,
            due_date_time: desired.due_date.map(|_| false),
            custom_item_id: desired.custom_item_id,
            custom_fields: self.custom_field_payloads(bean),
        };

        let task = match self.tracker.create_task(&self.opts.list_id, &req).await {
            Ok(task) => task,
            Err(err) => {
                return result.failed(anyhow::Error::new(err).context("creating task"));
            }
        };

        result.task_id = Some(task.id.clone());
        result.task_url = Some(task.url.clone());

        // a fresh task has no tags; this is pure additions
        self.sync_tags(&task.id, bean, &[]).await;

        self.store.set_task_id(&bean.id, &task.id);
        self.store.set_synced_at(&bean.id, Utc::now());
        result.action = SyncAction::Created;
        result
    }

    /// Stale check: a linked bean is skipped unless it changed after the last
    /// successful sync.
    fn needs_sync(&self, bean: &Bean) -> bool {
        let Some(synced_at) = self.store.synced_at(&bean.id) else {
            return true;
        };
        match bean.updated_at {
            Some(updated_at) => updated_at > synced_at,
            None => false,
        }
    }

    fn desired_fields(&self, bean: &Bean) -> DesiredFields {
        DesiredFields {
            name: bean.title.clone(),
            description: bean.body.clone(),
            status: diff::map_status(&self.config, bean.status),
            priority: bean
                .priority
                .and_then(|priority| diff::map_priority(&self.config, priority)),
            due_date: bean.due.and_then(|due| diff::due_date_millis(due, &Local)),
            custom_item_id: diff::map_type(&self.config, bean.bean_type),
        }
    }

    /// Reconciles task tags against bean tags. Best-effort: individual tag
    /// failures are logged, not propagated. Returns whether anything changed.
    async fn sync_tags(&self, task_id: &str, bean: &Bean, current: &[crate::clickup::types::Tag]) -> bool {
        let (to_add, to_remove) = diff::diff_tags(&bean.tags, current);
        let mut changed = false;

        for tag in &to_add {
            if let Some(space_id) = &self.space_id {
                if let Err(err) = self.tracker.ensure_space_tag(space_id, tag).await {
                    warn!(%tag, error = %err, "could not ensure space tag");
                }
            }
            match self.tracker.add_tag(task_id, tag).await {
                Ok(()) => changed = true,
                Err(err) => warn!(%tag, task = %task_id, error = %err, "adding tag failed"),
            }
        }
        for tag in &to_remove {
            match self.tracker.remove_tag(task_id, tag).await {
                Ok(()) => changed = true,
                Err(err) => warn!(%tag, task = %task_id, error = %err, "removing tag failed"),
            }
        }
        changed
    }

    /// Pushes configured custom-field values that differ from the task's
    /// current values. Best-effort.
    async fn sync_custom_fields(&self, task_id: &str, bean: &Bean, task: &Task) -> bool {
        let desired = self.desired_custom_fields(bean);
        if desired.is_empty() {
            return false;
        }

        let mut changed = false;
        for field_id in diff::diff_custom_fields(&task.custom_fields, &desired) {
            let Some(value) = desired.get(&field_id) else {
                continue;
            };
            match self
                .tracker
                .set_custom_field(task_id, &field_id, value.clone())
                .await
            {
                Ok(()) => changed = true,
                Err(err) => {
                    warn!(field = %field_id, task = %task_id, error = %err, "setting custom field failed");
                }
            }
        }
        changed
    }

    fn desired_custom_fields(&self, bean: &Bean) -> HashMap<String, Value> {
        let mut fields = HashMap::new();
        let Some(custom) = &self.config.custom_fields else {
            return fields;
        };
        if let Some(id) = &custom.bean_id {
            fields.insert(id.clone(), Value::String(bean.id.clone()));
        }
        if let (Some(id), Some(at)) = (&custom.created_at, bean.created_at) {
            fields.insert(id.clone(), json!(at.timestamp_millis()));
        }
        if let (Some(id), Some(at)) = (&custom.updated_at, bean.updated_at) {
            fields.insert(id.clone(), json!(at.timestamp_millis()));
        }
        fields
    }

    fn custom_field_payloads(&self, bean: &Bean) -> Vec<CustomFieldPayload> {
        let mut payloads: Vec<CustomFieldPayload> = self
            .desired_custom_fields(bean)
            .into_iter()
            .map(|(id, value)| CustomFieldPayload { id, value })
            .collect();
        payloads.sort_by(|a, b| a.id.cmp(&b.id));
        payloads
    }

    /// A bean with `blocking: [B, C]` makes B and C wait on this bean's task.
    async fn sync_relationships(&self, bean: &Bean) -> Result<()> {
        let Some(task_id) = self.lookup_task(&bean.id) else {
            return Ok(());
        };

        for blocked_id in &bean.blocking {
            let Some(blocked_task) = self.lookup_task(blocked_id) else {
                continue;
            };
            if let Err(err) = self.tracker.add_dependency(&blocked_task, &task_id).await {
                // the edge may already exist; keep going
                warn!(
                    blocked = %blocked_task,
                    depends_on = %task_id,
                    error = %err,
                    "adding dependency failed"
                );
            }
        }
        Ok(())
    }
}

/// Overall wall-clock deadline for a run, derived from the worst-case remote
/// call count. Past it, in-flight calls fail fast instead of retrying.
pub fn run_deadline(bean_count: usize) -> Instant {
    let calls = (bean_count as u32).saturating_mul(4).saturating_add(2);
    Instant::now() + CALL_ALLOWANCE.saturating_mul(calls)
}

/// Drops beans whose status is excluded by the sync filter.
pub fn filter_beans(beans: Vec<Bean>, filter: Option<&SyncFilter>) -> Vec<Bean> {
    let Some(filter) = filter else {
        return beans;
    };
    beans
        .into_iter()
        .filter(|bean| {
            !filter
                .exclude_status
                .iter()
                .any(|status| status == bean.status.as_str())
        })
        .collect()
}
