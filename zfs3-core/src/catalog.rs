/*!
The remote side of a snapshot chain.

Every backup run leaves a `manifest.json` record next to its chunks. The catalog loads
those records, evaluates whether each backup can be restored from its chain of
parents, and plans which local snapshots still need uploading.
*/

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::manifest::{BackupRun, MANIFEST_FILE_NAME};
use crate::snapshot::{split_snapshot_name, LocalSnapshots};
use crate::store::ObjectStore;
use crate::{BackupError, Result};

/// Whether a remote backup can be restored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainHealth {
    Ok,
    /// Following parents leads back to a backup already visited
    CycleDetected,
    /// The backup is incremental and its parent is not stored
    MissingParent,
    /// Some ancestor is missing or unusable
    ParentBroken,
    /// The run itself did not succeed
    Incomplete,
}

impl ChainHealth {
    pub fn is_ok(&self) -> bool {
        matches!(self, ChainHealth::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainHealth::Ok => "ok",
            ChainHealth::CycleDetected => "cycle detected",
            ChainHealth::MissingParent => "missing parent",
            ChainHealth::ParentBroken => "parent broken",
            ChainHealth::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for ChainHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot scheduled for upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedBackup {
    pub snapshot: String,
    /// Base of the incremental stream; `None` sends the full snapshot
    pub parent: Option<String>,
}

/// Remote backups that have to be received, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestorePlan {
    pub runs: Vec<BackupRun>,
    /// Newest snapshot of the chain that already exists locally, if the walk stopped there
    pub present_locally: Option<String>,
}

/// One row of the local vs remote status listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub name: String,
    /// Parent snapshot tag for incremental backups
    pub parent: Option<String>,
    /// `full`, `incremental`, or `missing` when only the local snapshot exists
    pub kind: String,
    /// `None` when nothing is stored remotely
    pub health: Option<ChainHealth>,
    pub local: bool,
    /// Uncompressed size of the stored stream
    pub size: Option<u64>,
}

/// Backup records keyed by snapshot name
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    runs: BTreeMap<String, BackupRun>,
}

/// Name a run is known by in a chain: its snapshot, or the dataset id for plain uploads
fn snapshot_name(run: &BackupRun) -> &str {
    run.lineage
        .as_ref()
        .map(|lineage| lineage.snapshot.as_str())
        .unwrap_or(&run.dataset_id)
}

fn tag(name: &str) -> String {
    split_snapshot_name(name).map(|(_, tag)| tag).unwrap_or(name).to_string()
}

impl Catalog {
    pub fn from_runs<I: IntoIterator<Item = BackupRun>>(runs: I) -> Self {
        let runs = runs
            .into_iter()
            .map(|run| (snapshot_name(&run).to_string(), run))
            .collect();
        Self { runs }
    }

    /// Load every record stored under `{key_prefix}/{name_prefix}`
    ///
    /// `name_prefix` is usually `dataset@snapshot_prefix`. Records that vanish between
    /// listing and reading are skipped.
    pub async fn load(store: &Arc<dyn ObjectStore>, key_prefix: &str, name_prefix: &str) -> Result<Self> {
        let prefix = format!("{}/{}", key_prefix.trim_end_matches('/'), name_prefix);
        let suffix = format!("/{MANIFEST_FILE_NAME}");
        let mut runs = Vec::new();
        for key in store.list(&prefix).await? {
            if !key.ends_with(&suffix) {
                continue;
            }
            match store.get_object(&key).await {
                Ok(data) => {
                    let run = BackupRun::from_json(&data)?;
                    debug!(key = %key, status = run.outcome.status(), "Loaded backup record");
                    runs.push(run);
                }
                Err(BackupError::NotFound(_)) => warn!(key = %key, "Backup record disappeared while loading"),
                Err(e) => return Err(e),
            }
        }
        info!(prefix = %prefix, records = runs.len(), "Loaded remote catalog");
        Ok(Self::from_runs(runs))
    }

    pub fn get(&self, name: &str) -> Option<&BackupRun> {
        self.runs.get(name)
    }

    /// Records sorted by snapshot name
    pub fn list(&self) -> impl Iterator<Item = &BackupRun> {
        self.runs.values()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Evaluate the chain of `name`; `None` if it is not stored
    pub fn health(&self, name: &str) -> Option<ChainHealth> {
        let mut current = name;
        let mut run = self.get(current)?;
        let mut visited = HashSet::new();
        let mut first = true;
        let broken = |first: bool, own: ChainHealth| if first { own } else { ChainHealth::ParentBroken };

        loop {
            if !run.outcome.is_success() {
                return Some(broken(first, ChainHealth::Incomplete));
            }
            let parent = match &run.lineage {
                None => return Some(ChainHealth::Ok),
                Some(lineage) if lineage.is_full => return Some(ChainHealth::Ok),
                Some(lineage) => lineage.parent.as_deref(),
            };
            if !visited.insert(current) {
                return Some(ChainHealth::CycleDetected);
            }
            match parent.and_then(|p| self.get(p).map(|run| (p, run))) {
                Some((parent_name, parent_run)) => {
                    current = parent_name;
                    run = parent_run;
                    first = false;
                }
                None => return Some(broken(first, ChainHealth::MissingParent)),
            }
        }
    }

    /// Plan an incremental backup of `snapshot`, or the newest local snapshot
    ///
    /// Walks from the chosen snapshot towards older ones until one is already stored,
    /// and returns the ones in between oldest first. The oldest local snapshot is sent
    /// in full. Snapshots whose stored run did not succeed are planned again.
    ///
    /// # Errors
    /// `NotFound` if there is nothing to back up, `Chain` if the stored snapshot the
    /// walk ends at cannot be restored.
    pub fn plan_incremental(&self, local: &LocalSnapshots, snapshot: Option<&str>) -> Result<Vec<PlannedBackup>> {
        let mut current = select(local, snapshot)?.name.as_str();
        let mut plan = Vec::new();
        loop {
            match self.health(current) {
                Some(ChainHealth::Ok) => break,
                // an interrupted upload of this snapshot is simply redone
                None | Some(ChainHealth::Incomplete) => {}
                Some(health) => {
                    return Err(BackupError::chain(format!(
                        "broken snapshot detected {current}, reason: '{health}'"
                    )))
                }
            }
            let parent = local.parent_of(current).map(|p| p.name.as_str());
            plan.push(PlannedBackup {
                snapshot: current.to_string(),
                parent: parent.map(str::to_string),
            });
            match parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        plan.reverse();
        info!(planned = plan.len(), "Planned incremental backup");
        Ok(plan)
    }

    /// Backups to receive, oldest first, to restore `name`
    ///
    /// Stops early at a snapshot that already exists locally.
    pub fn plan_restore(&self, local: &LocalSnapshots, name: &str) -> Result<RestorePlan> {
        let mut run = self
            .get(name)
            .ok_or_else(|| BackupError::not_found(format!("no backup of snapshot {name}")))?;
        let mut plan = RestorePlan::default();
        loop {
            let current = snapshot_name(run);
            if local.get(current).is_some() {
                plan.present_locally = Some(current.to_string());
                break;
            }
            let health = self.health(current).unwrap_or(ChainHealth::MissingParent);
            if !health.is_ok() {
                return Err(BackupError::chain(format!(
                    "broken snapshot detected {current}, reason: '{health}'"
                )));
            }
            plan.runs.push(run.clone());
            match run.lineage.as_ref().filter(|l| !l.is_full).and_then(|l| l.parent.as_deref()) {
                // a healthy incremental always has a stored parent
                Some(parent) => match self.get(parent) {
                    Some(parent_run) => run = parent_run,
                    None => break,
                },
                None => break,
            }
        }
        plan.runs.reverse();
        Ok(plan)
    }

    /// Pair local snapshots with remote backups
    ///
    /// Local snapshots come first in local order, then backups that only exist remotely.
    pub fn status(&self, local: &LocalSnapshots) -> Vec<SnapshotStatus> {
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for snapshot in local.iter() {
            seen.insert(snapshot.name.as_str());
            rows.push(match self.get(&snapshot.name) {
                Some(run) => self.remote_status(run, true),
                None => SnapshotStatus {
                    name: snapshot.tag().to_string(),
                    parent: None,
                    kind: "missing".to_string(),
                    health: None,
                    local: true,
                    size: None,
                },
            });
        }
        for (name, run) in &self.runs {
            if !seen.contains(name.as_str()) {
                rows.push(self.remote_status(run, false));
            }
        }
        rows
    }

    fn remote_status(&self, run: &BackupRun, local: bool) -> SnapshotStatus {
        let name = snapshot_name(run);
        let lineage = run.lineage.as_ref();
        let is_full = lineage.map(|l| l.is_full).unwrap_or(true);
        SnapshotStatus {
            name: tag(name),
            parent: lineage.and_then(|l| l.parent.as_deref()).map(tag),
            kind: if is_full { "full" } else { "incremental" }.to_string(),
            health: self.health(name),
            local,
            size: Some(run.manifest().total_size),
        }
    }
}

fn select<'a>(local: &'a LocalSnapshots, snapshot: Option<&str>) -> Result<&'a crate::snapshot::LocalSnapshot> {
    match snapshot {
        Some(name) => local
            .get(name)
            .ok_or_else(|| BackupError::not_found(format!("failed to get the snapshot {name}"))),
        None => local
            .latest()
            .ok_or_else(|| BackupError::not_found("nothing to back up: no local snapshot matches the prefix")),
    }
}

/// Plan a full backup of `snapshot`, or the newest local snapshot
pub fn plan_full(local: &LocalSnapshots, snapshot: Option<&str>) -> Result<PlannedBackup> {
    Ok(PlannedBackup {
        snapshot: select(local, snapshot)?.name.clone(),
        parent: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::manifest::{Lineage, ManifestBuilder, RunOutcome};
    use crate::snapshot::LocalSnapshot;
    use chrono::Utc;

    fn run(name: &str, parent: Option<&str>, success: bool) -> BackupRun {
        let mut builder = ManifestBuilder::new(name);
        builder.set_chunk_count(0).unwrap();
        let manifest = builder.partial();
        let outcome = if success {
            RunOutcome::Succeeded { manifest }
        } else {
            RunOutcome::Aborted {
                reason: "Backup cancelled".to_string(),
                manifest,
            }
        };
        let lineage = match parent {
            Some(parent) => Lineage::incremental(name, parent),
            None => Lineage::full(name),
        };
        BackupRun::new(name, &RunConfig::default(), Utc::now(), outcome).with_lineage(lineage)
    }

    fn local(names: &[&str]) -> LocalSnapshots {
        LocalSnapshots::new(
            names
                .iter()
                .map(|name| LocalSnapshot {
                    name: name.to_string(),
                    used: "0".into(),
                    refer: "0".into(),
                    mountpoint: "-".into(),
                    written: "0".into(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_chain_health() {
        let catalog = Catalog::from_runs([
            run("t@1", None, true),
            run("t@2", Some("t@1"), true),
            run("t@4", Some("t@3"), true),
            run("t@5", Some("t@4"), true),
            run("t@6", Some("t@7"), true),
            run("t@7", Some("t@6"), true),
            run("t@8", Some("t@7"), true),
            run("t@9", None, false),
            run("t@10", Some("t@9"), true),
        ]);
        assert_eq!(catalog.health("t@1"), Some(ChainHealth::Ok));
        assert_eq!(catalog.health("t@2"), Some(ChainHealth::Ok));
        assert_eq!(catalog.health("t@4"), Some(ChainHealth::MissingParent));
        assert_eq!(catalog.health("t@5"), Some(ChainHealth::ParentBroken));
        assert_eq!(catalog.health("t@6"), Some(ChainHealth::CycleDetected));
        assert_eq!(catalog.health("t@8"), Some(ChainHealth::CycleDetected));
        assert_eq!(catalog.health("t@9"), Some(ChainHealth::Incomplete));
        assert_eq!(catalog.health("t@10"), Some(ChainHealth::ParentBroken));
        assert_eq!(catalog.health("t@3"), None);
    }

    #[test]
    fn test_plan_incremental_uploads_missing_oldest_first() {
        let catalog = Catalog::from_runs([run("t@1", None, true)]);
        let plan = catalog
            .plan_incremental(&local(&["t@1", "t@2", "t@3"]), None)
            .unwrap();
        assert_eq!(
            plan,
            vec![
                PlannedBackup {
                    snapshot: "t@2".into(),
                    parent: Some("t@1".into())
                },
                PlannedBackup {
                    snapshot: "t@3".into(),
                    parent: Some("t@2".into())
                },
            ]
        );
    }

    #[test]
    fn test_plan_incremental_from_empty_remote_starts_with_full() {
        let plan = Catalog::default()
            .plan_incremental(&local(&["t@1", "t@2", "t@3"]), Some("t@2"))
            .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].parent, None);
        assert_eq!(plan[1].parent.as_deref(), Some("t@1"));
    }

    #[test]
    fn test_plan_incremental_up_to_date_is_empty() {
        let catalog = Catalog::from_runs([run("t@1", None, true), run("t@2", Some("t@1"), true)]);
        assert!(catalog.plan_incremental(&local(&["t@1", "t@2"]), None).unwrap().is_empty());
    }

    #[test]
    fn test_plan_incremental_refuses_broken_chain() {
        let catalog = Catalog::from_runs([run("t@2", Some("t@1"), true)]);
        let result = catalog.plan_incremental(&local(&["t@1", "t@2", "t@3"]), None);
        assert!(matches!(result, Err(BackupError::Chain(msg)) if msg.contains("missing parent")));
    }

    #[test]
    fn test_plan_incremental_redoes_interrupted_upload() {
        let catalog = Catalog::from_runs([run("t@1", None, true), run("t@2", Some("t@1"), false)]);
        let plan = catalog.plan_incremental(&local(&["t@1", "t@2"]), None).unwrap();
        assert_eq!(
            plan,
            vec![PlannedBackup {
                snapshot: "t@2".into(),
                parent: Some("t@1".into())
            }]
        );
    }

    #[test]
    fn test_plan_without_snapshots() {
        assert!(matches!(
            Catalog::default().plan_incremental(&local(&[]), None),
            Err(BackupError::NotFound(_))
        ));
        assert!(matches!(plan_full(&local(&["t@1"]), Some("t@9")), Err(BackupError::NotFound(_))));
        assert_eq!(plan_full(&local(&["t@1", "t@2"]), None).unwrap().snapshot, "t@2");
    }

    #[test]
    fn test_plan_restore() {
        let catalog = Catalog::from_runs([
            run("t@1", None, true),
            run("t@2", Some("t@1"), true),
            run("t@3", Some("t@2"), true),
        ]);
        let plan = catalog.plan_restore(&local(&[]), "t@3").unwrap();
        let names: Vec<&str> = plan.runs.iter().map(snapshot_name).collect();
        assert_eq!(names, ["t@1", "t@2", "t@3"]);
        assert_eq!(plan.present_locally, None);

        let plan = catalog.plan_restore(&local(&["t@1"]), "t@3").unwrap();
        assert_eq!(plan.runs.len(), 2);
        assert_eq!(plan.present_locally.as_deref(), Some("t@1"));

        assert!(matches!(catalog.plan_restore(&local(&[]), "t@9"), Err(BackupError::NotFound(_))));
    }

    #[test]
    fn test_status_pairs_local_and_remote() {
        let catalog = Catalog::from_runs([run("t@0", None, true), run("t@1", Some("t@0"), true)]);
        let rows = catalog.status(&local(&["t@1", "t@2"]));
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].name, "1");
        assert_eq!(rows[0].kind, "incremental");
        assert_eq!(rows[0].parent.as_deref(), Some("0"));
        assert_eq!(rows[0].health, Some(ChainHealth::Ok));
        assert!(rows[0].local);

        assert_eq!(rows[1].name, "2");
        assert_eq!(rows[1].kind, "missing");
        assert_eq!(rows[1].health, None);

        assert_eq!(rows[2].name, "0");
        assert_eq!(rows[2].kind, "full");
        assert!(!rows[2].local);
        assert_eq!(rows[2].size, Some(0));
    }
}
