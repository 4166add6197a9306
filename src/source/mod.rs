use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

use crate::model::bean::Bean;

/// Destination for sync metadata writes issued by the batched state store.
/// Implemented by [`BeansClient`] over the beans CLI; tests use a recording
/// mock.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    /// Writes all links in one batched call.
    async fn set_sync_batch(&self, ops: &[SyncMetadataOp]) -> Result<()>;
    /// Removes the sync metadata for a single bean.
    async fn remove_sync(&self, bean_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncMetadataOp {
    pub bean_id: String,
    pub task_id: String,
    /// RFC 3339, omitted when the bean was linked but never fully synced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<String>,
}

/// Wrapper around the `beans` CLI. Bean records are fetched as JSON; the
/// extension subcommands back the batched sync state store.
pub struct BeansClient {
    beans_path: Option<String>,
}

impl BeansClient {
    pub fn new(beans_path: Option<String>) -> Self {
        Self { beans_path }
    }

    async fn exec(&self, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = Command::new("beans");
        cmd.args(args);
        if let Some(path) = &self.beans_path {
            cmd.args(["--beans-path", path]);
        }
        let out = cmd.output().await.context("running beans CLI")?;
        if !out.status.success() {
            bail!(
                "beans {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(out.stdout)
    }

    /// Returns all beans in the collection.
    pub async fn list(&self) -> Result<Vec<Bean>> {
        let out = self.exec(&["list", "--json", "--full"]).await?;
        serde_json::from_slice(&out).context("parsing beans JSON")
    }

    /// Returns one bean by ID. A missing bean fails this request only.
    pub async fn get(&self, id: &str) -> Result<Bean> {
        // `beans show --json` with one ID returns a single object, not an array
        let out = self.exec(&["show", "--json", id]).await?;
        let bean: Bean = serde_json::from_slice(&out).context("parsing bean JSON")?;
        if bean.id.is_empty() {
            bail!("bean not found: {id}");
        }
        Ok(bean)
    }

    pub async fn get_many(&self, ids: &[String]) -> Result<Vec<Bean>> {
        match ids {
            [] => Ok(Vec::new()),
            [id] => Ok(vec![self.get(id).await?]),
            _ => {
                let mut args = vec!["show", "--json"];
                args.extend(ids.iter().map(String::as_str));
                let out = self.exec(&args).await?;
                serde_json::from_slice(&out).context("parsing beans JSON")
            }
        }
    }
}

#[async_trait]
impl MetadataSink for BeansClient {
    async fn set_sync_batch(&self, ops: &[SyncMetadataOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_string(ops).context("encoding sync metadata")?;
        self.exec(&["extension", "set-batch", "--plugin", "clickup", "--json", &payload])
            .await?;
        Ok(())
    }

    async fn remove_sync(&self, bean_id: &str) -> Result<()> {
        self.exec(&["extension", "remove", "--plugin", "clickup", bean_id])
            .await?;
        Ok(())
    }
}
