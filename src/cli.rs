use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use crate::clickup::ClickUpClient;
use crate::config::{self, LoadedConfig};
use crate::source::BeansClient;
use crate::sync::state::{BatchedStore, FileStore, SyncStateStore};
use crate::sync::{self, ProgressFn, SyncOptions, SyncResult, Syncer};

#[derive(Debug, Default, PartialEq)]
pub struct SyncArgs {
    /// Specific beans to sync; empty means the whole collection.
    pub bean_ids: Vec<String>,
    pub dry_run: bool,
    pub force: bool,
    pub no_relationships: bool,
    pub json: bool,
}

#[derive(Debug, PartialEq)]
pub struct UnlinkArgs {
    pub bean_id: String,
    pub json: bool,
}

/// Parse CLI args for `beansync sync` and reconcile beans into ClickUp.
pub async fn handle_sync(args: &[String]) -> Result<()> {
    let parsed = parse_sync_args(args)?;

    let token = std::env::var("CLICKUP_TOKEN")
        .ok()
        .filter(|t| !t.is_empty());
    let Some(token) = token else {
        bail!("CLICKUP_TOKEN is not set. Export a personal API token first.");
    };

    let cwd = std::env::current_dir().context("resolving current directory")?;
    let loaded = config::load_config(&cwd)?;
    let clickup = loaded.config.clickup.clone();
    if clickup.list_id.is_empty() {
        bail!(
            "No ClickUp list configured. Set list_id under [clickup] in {}",
            config::CONFIG_FILE
        );
    }

    let beans_client = beans_client(&loaded);
    let beans = if parsed.bean_ids.is_empty() {
        beans_client.list().await?
    } else {
        beans_client.get_many(&parsed.bean_ids).await?
    };
    let beans = sync::filter_beans(beans, clickup.sync_filter.as_ref());
    if beans.is_empty() {
        println!("Nothing to sync.");
        return Ok(());
    }

    let store: Arc<dyn SyncStateStore> = match clickup.sync_state.as_deref() {
        Some("beans") => Arc::new(BatchedStore::new(self::beans_client(&loaded), &beans)),
        _ => Arc::new(FileStore::load(&loaded.beans_path())?),
    };

    let tracker = Arc::new(
        ClickUpClient::new(token).with_deadline(sync::run_deadline(beans.len())),
    );

    let on_progress: Option<ProgressFn> = if parsed.json {
        None
    } else {
        Some(Box::new(|result: &SyncResult, completed, total| {
            match &result.error {
                Some(err) => {
                    println!("[{completed}/{total}] {} {}: {err:#}", result.action, result.bean_id)
                }
                None => println!("[{completed}/{total}] {} {}", result.action, result.bean_id),
            }
        }))
    };

    let opts = SyncOptions {
        dry_run: parsed.dry_run,
        force: parsed.force,
        no_relationships: parsed.no_relationships,
        list_id: clickup.list_id.clone(),
        on_progress,
    };

    let mut syncer = Syncer::new(tracker, store, clickup, opts);
    let results = syncer.sync_beans(&beans).await?;

    if parsed.json {
        println!("{}", serde_json::to_string_pretty(&json_results(&results))?);
    } else {
        println!("{}", summarize(&results));
    }

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    if failed > 0 {
        bail!("{failed} of {} beans failed to sync", results.len());
    }
    Ok(())
}

/// Parse CLI args for `beansync unlink` and drop the bean's task link without
/// touching the remote task.
pub async fn handle_unlink(args: &[String]) -> Result<()> {
    let parsed = parse_unlink_args(args)?;

    let cwd = std::env::current_dir().context("resolving current directory")?;
    let loaded = config::load_config(&cwd)?;

    let store: Arc<dyn SyncStateStore> = match loaded.config.clickup.sync_state.as_deref() {
        Some("beans") => {
            let bean = beans_client(&loaded).get(&parsed.bean_id).await?;
            Arc::new(BatchedStore::new(beans_client(&loaded), &[bean]))
        }
        _ => Arc::new(FileStore::load(&loaded.beans_path())?),
    };

    let task_id = store.task_id(&parsed.bean_id);
    if task_id.is_some() {
        store.clear(&parsed.bean_id);
        store.flush().await.context("flushing sync state")?;
    }

    if parsed.json {
        let payload = json!({
            "bean_id": parsed.bean_id,
            "task_id": task_id,
            "unlinked": task_id.is_some(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        match task_id {
            Some(task_id) => println!("Unlinked {} from task {task_id}", parsed.bean_id),
            None => println!("{} is not linked to a task", parsed.bean_id),
        }
    }
    Ok(())
}

fn beans_client(loaded: &LoadedConfig) -> BeansClient {
    BeansClient::new(Some(loaded.beans_path().to_string_lossy().into_owned()))
}

/// Parse `beansync sync` arguments.
///
/// Supported forms:
///   beansync sync
///   beansync sync bean-1 bean-2
///   beansync sync --dry-run --json
///   beansync sync bean-1 --force --no-relationships
pub fn parse_sync_args(args: &[String]) -> Result<SyncArgs> {
    let mut parsed = SyncArgs::default();
    for arg in args {
        match arg.as_str() {
            "--dry-run" | "-n" => parsed.dry_run = true,
            "--force" | "-f" => parsed.force = true,
            "--no-relationships" => parsed.no_relationships = true,
            "--json" => parsed.json = true,
            flag if flag.starts_with('-') => bail!("Unknown flag for sync: {flag}"),
            id => parsed.bean_ids.push(id.to_string()),
        }
    }
    Ok(parsed)
}

/// Parse `beansync unlink` arguments: exactly one bean ID plus optional --json.
pub fn parse_unlink_args(args: &[String]) -> Result<UnlinkArgs> {
    let mut bean_ids = Vec::new();
    let mut json = false;
    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            flag if flag.starts_with('-') => bail!("Unknown flag for unlink: {flag}"),
            id => bean_ids.push(id.to_string()),
        }
    }
    match bean_ids.len() {
        1 => Ok(UnlinkArgs {
            bean_id: bean_ids.remove(0),
            json,
        }),
        0 => bail!("Usage: beansync unlink <bean-id> [--json]"),
        _ => bail!("unlink takes exactly one bean ID"),
    }
}

fn json_results(results: &[SyncResult]) -> Vec<Value> {
    results
        .iter()
        .map(|result| {
            json!({
                "bean_id": result.bean_id,
                "title": result.bean_title,
                "task_id": result.task_id,
                "task_url": result.task_url,
                "action": result.action,
                "error": result.error.as_ref().map(|err| format!("{err:#}")),
            })
        })
        .collect()
}

/// One line per action seen, e.g. "3 created, 1 skipped, 1 error".
fn summarize(results: &[SyncResult]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for result in results {
        *counts.entry(result.action.as_str()).or_default() += 1;
    }
    counts
        .iter()
        .map(|(action, count)| format!("{count} {action}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn print_help() {
    println!("beansync — reconcile beans work items into ClickUp\n");
    println!("USAGE:");
    println!("  beansync sync [bean-id ...]   Sync beans to the configured ClickUp list");
    println!("  beansync unlink <bean-id>     Forget a bean's task link (no remote change)");
    println!();
    println!("SYNC OPTIONS:");
    println!("  -n, --dry-run        Report what would change without writing");
    println!("  -f, --force          Sync even beans that are unchanged since last sync");
    println!("      --no-relationships  Skip the dependency pass");
    println!("      --json           Emit per-bean results as JSON");
    println!();
    println!("ENVIRONMENT:");
    println!("  CLICKUP_TOKEN        Personal API token (required for sync)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncAction;

    fn args(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_sync_defaults() {
        let parsed = parse_sync_args(&args(&[])).unwrap();
        assert_eq!(parsed, SyncArgs::default());
    }

    #[test]
    fn parse_sync_bean_ids_and_flags() {
        let parsed =
            parse_sync_args(&args(&["bean-1", "--force", "bean-2", "--dry-run"])).unwrap();
        assert_eq!(parsed.bean_ids, vec!["bean-1", "bean-2"]);
        assert!(parsed.force);
        assert!(parsed.dry_run);
        assert!(!parsed.json);
    }

    #[test]
    fn parse_sync_short_flags() {
        let parsed = parse_sync_args(&args(&["-n", "-f"])).unwrap();
        assert!(parsed.dry_run);
        assert!(parsed.force);
    }

    #[test]
    fn parse_sync_unknown_flag_fails() {
        let result = parse_sync_args(&args(&["--frob"]));
        assert!(result.unwrap_err().to_string().contains("--frob"));
    }

    #[test]
    fn parse_unlink_single_id() {
        let parsed = parse_unlink_args(&args(&["bean-1"])).unwrap();
        assert_eq!(parsed.bean_id, "bean-1");
        assert!(!parsed.json);
    }

    #[test]
    fn parse_unlink_with_json() {
        let parsed = parse_unlink_args(&args(&["--json", "bean-1"])).unwrap();
        assert_eq!(parsed.bean_id, "bean-1");
        assert!(parsed.json);
    }

    #[test]
    fn parse_unlink_requires_exactly_one_id() {
        assert!(parse_unlink_args(&args(&[])).is_err());
        assert!(parse_unlink_args(&args(&["a", "b"])).is_err());
    }

    #[test]
    fn summary_counts_actions_in_order() {
        let mk = |id: &str, action: SyncAction| {
            let mut result = SyncResult {
                bean_id: id.into(),
                bean_title: id.into(),
                task_id: None,
                task_url: None,
                action,
                error: None,
            };
            if action == SyncAction::Error {
                result.error = Some(anyhow::anyhow!("boom"));
            }
            result
        };
        let results = vec![
            mk("a", SyncAction::Created),
            mk("b", SyncAction::Created),
            mk("c", SyncAction::Skipped),
            mk("d", SyncAction::Error),
        ];
        assert_eq!(summarize(&results), "2 created, 1 error, 1 skipped");
    }
}
