//! Persistence of bean -> ClickUp task links. Two interchangeable backends:
//! a JSON file rewritten atomically on every mutation, and a deferred store
//! that batches writes into the beans CLI's extension metadata so a run
//! issues O(1) metadata calls instead of one per bean.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::model::bean::Bean;
use crate::source::{MetadataSink, SyncMetadataOp};

pub const SYNC_FILE_NAME: &str = ".sync.json";
pub const CURRENT_VERSION: u32 = 1;

/// Link between one bean and its ClickUp task. At most one live link per
/// bean; cleared before a replacement task may be created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncLink {
    #[serde(default)]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncData {
    version: u32,
    #[serde(default)]
    links: HashMap<String, SyncLink>,
}

impl Default for SyncData {
    fn default() -> Self {
        SyncData {
            version: CURRENT_VERSION,
            links: HashMap::new(),
        }
    }
}

/// Shared link storage. Workers call this concurrently, so implementations
/// use interior locking; `flush` is the only fallible operation.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    fn task_id(&self, bean_id: &str) -> Option<String>;
    fn synced_at(&self, bean_id: &str) -> Option<DateTime<Utc>>;
    fn set_task_id(&self, bean_id: &str, task_id: &str);
    fn set_synced_at(&self, bean_id: &str, at: DateTime<Utc>);
    fn clear(&self, bean_id: &str);
    async fn flush(&self) -> Result<()>;
}

struct FileStoreInner {
    data: SyncData,
    /// First persistence failure, surfaced by `flush` since mutators have no
    /// error channel.
    write_err: Option<anyhow::Error>,
}

/// Immediate-persistence store: every mutation rewrites the state file via
/// temp file + atomic rename, so a crash never leaves a half-written file.
pub struct FileStore {
    path: PathBuf,
    inner: RwLock<FileStoreInner>,
}

impl FileStore {
    /// Loads or creates the sync state file inside the beans directory.
    pub fn load(beans_path: &Path) -> Result<Self> {
        let path = beans_path.join(SYNC_FILE_NAME);
        let data = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SyncData::default(),
            Err(err) => {
                return Err(anyhow!(err).context(format!("reading {}", path.display())))
            }
        };

        Ok(Self {
            path,
            inner: RwLock::new(FileStoreInner {
                data,
                write_err: None,
            }),
        })
    }

    fn mutate(&self, apply: impl FnOnce(&mut SyncData)) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut inner.data);
        if let Err(err) = persist(&self.path, &inner.data) {
            if inner.write_err.is_none() {
                inner.write_err = Some(err);
            }
        }
    }
}

fn persist(path: &Path, data: &SyncData) -> Result<()> {
    let json = serde_json::to_string_pretty(data).context("encoding sync state")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))
}

#[async_trait]
impl SyncStateStore for FileStore {
    fn task_id(&self, bean_id: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .data
            .links
            .get(bean_id)
            .filter(|link| !link.task_id.is_empty())
            .map(|link| link.task_id.clone())
    }

    fn synced_at(&self, bean_id: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.data.links.get(bean_id).and_then(|link| link.synced_at)
    }

    fn set_task_id(&self, bean_id: &str, task_id: &str) {
        self.mutate(|data| {
            data.links.entry(bean_id.to_string()).or_default().task_id = task_id.to_string();
        });
    }

    fn set_synced_at(&self, bean_id: &str, at: DateTime<Utc>) {
        self.mutate(|data| {
            data.links.entry(bean_id.to_string()).or_default().synced_at = Some(at);
        });
    }

    fn clear(&self, bean_id: &str) {
        self.mutate(|data| {
            data.links.remove(bean_id);
        });
    }

    async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.write_err.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct BatchedInner {
    cache: HashMap<String, SyncLink>,
    /// Mutation log; `None` marks a removal. Deduplicated at flush time.
    ops: Vec<(String, Option<SyncLink>)>,
}

/// Deferred store over the beans CLI's extension metadata. Mutations hit an
/// in-memory cache; `flush` collapses the log (last write per bean wins) into
/// one batched set call plus one remove call per cleared bean.
pub struct BatchedStore<S: MetadataSink> {
    sink: S,
    inner: RwLock<BatchedInner>,
}

impl<S: MetadataSink> BatchedStore<S> {
    /// Creates a store seeded from the sync metadata the beans already carry.
    pub fn new(sink: S, beans: &[Bean]) -> Self {
        let mut cache = HashMap::new();
        for bean in beans {
            let task_id = bean.clickup_task_id();
            let synced_at = bean.clickup_synced_at();
            if task_id.is_some() || synced_at.is_some() {
                cache.insert(
                    bean.id.clone(),
                    SyncLink {
                        task_id: task_id.unwrap_or_default().to_string(),
                        synced_at,
                    },
                );
            }
        }
        Self {
            sink,
            inner: RwLock::new(BatchedInner {
                cache,
                ops: Vec::new(),
            }),
        }
    }

    fn record(&self, bean_id: &str, apply: impl FnOnce(&mut SyncLink)) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let link = inner.cache.entry(bean_id.to_string()).or_default();
        apply(link);
        let snapshot = link.clone();
        inner.ops.push((bean_id.to_string(), Some(snapshot)));
    }
}

#[async_trait]
impl<S: MetadataSink> SyncStateStore for BatchedStore<S> {
    fn task_id(&self, bean_id: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .cache
            .get(bean_id)
            .filter(|link| !link.task_id.is_empty())
            .map(|link| link.task_id.clone())
    }

    fn synced_at(&self, bean_id: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.cache.get(bean_id).and_then(|link| link.synced_at)
    }

    fn set_task_id(&self, bean_id: &str, task_id: &str) {
        self.record(bean_id, |link| link.task_id = task_id.to_string());
    }

    fn set_synced_at(&self, bean_id: &str, at: DateTime<Utc>) {
        self.record(bean_id, |link| link.synced_at = Some(at));
    }

    fn clear(&self, bean_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.cache.remove(bean_id);
        inner.ops.push((bean_id.to_string(), None));
    }

    async fn flush(&self) -> Result<()> {
        let ops = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut inner.ops)
        };
        if ops.is_empty() {
            return Ok(());
        }

        // last operation per bean wins
        let mut last: HashMap<&str, Option<&SyncLink>> = HashMap::new();
        for (bean_id, link) in &ops {
            last.insert(bean_id.as_str(), link.as_ref());
        }

        let mut sets = Vec::new();
        let mut removes = Vec::new();
        for (bean_id, link) in last {
            match link {
                Some(link) => sets.push(SyncMetadataOp {
                    bean_id: bean_id.to_string(),
                    task_id: link.task_id.clone(),
                    synced_at: link
                        .synced_at
                        .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
                }),
                None => removes.push(bean_id.to_string()),
            }
        }
        sets.sort_by(|a, b| a.bean_id.cmp(&b.bean_id));
        removes.sort();

        let outcome = async {
            self.sink.set_sync_batch(&sets).await?;
            for bean_id in &removes {
                self.sink.remove_sync(bean_id).await?;
            }
            Ok(())
        }
        .await;

        // on failure put the log back so the next flush retries these ops
        if outcome.is_err() {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let newer = std::mem::take(&mut inner.ops);
            inner.ops = ops;
            inner.ops.extend(newer);
        }
        outcome
    }
}
