/*!
zfs3 CLI - chunked streaming backups of ZFS snapshots to S3-compatible storage.

`put` uploads an arbitrary stream, `backup` sends local snapshots (incremental by
default), `status` compares local and remote snapshots, `verify` re-reads stored chunks
and `restore` receives a backup chain back into ZFS.

Options fall back to `ZFS3_*` environment variables, then to built-in defaults.
*/

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zfs3_core::config::{DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_STORAGE_CLASS};
use zfs3_core::manifest::manifest_key;
use zfs3_core::observability::{init_logging, UploadMetrics, DEFAULT_LOG_DIRECTIVE};
use zfs3_core::{
    open_store, optimize_chunk_size, parse_size, plan_full, BackupError, BackupRun, Catalog, CompressorKind,
    Credentials, Lineage, ObjectStore, Orchestrator, Restorer, RunConfig, RunOutcome, SnapshotSource, StoreConfig,
    ZfsSendSource,
};

const EXIT_USAGE: u8 = 1;
const EXIT_VERIFY_FAILED: u8 = 2;
const EXIT_INTERNAL: u8 = 70;

#[derive(Parser)]
#[command(name = "zfs3")]
#[command(about = "Chunked streaming backups of ZFS snapshots to S3-compatible storage")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true, env = "ZFS3_LOG_JSON")]
    log_json: bool,

    /// Write upload metrics in Prometheus text format to this file when done
    #[arg(long, global = true, env = "ZFS3_METRICS_FILE")]
    metrics_file: Option<PathBuf>,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    dataset: DatasetArgs,

    #[command(flatten)]
    tuning: TuningArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct StoreArgs {
    /// S3 bucket holding the backups
    #[arg(long, global = true, env = "ZFS3_BUCKET")]
    bucket: Option<String>,

    /// Keep backups in a local directory instead of S3
    #[arg(long, global = true, env = "ZFS3_LOCAL_DIR")]
    local_dir: Option<PathBuf>,

    /// Key prefix for all objects
    #[arg(long, global = true, env = "ZFS3_S3_PREFIX", default_value = "zfs3backup/")]
    s3_prefix: String,

    /// S3-compatible endpoint URL, or `aws`
    #[arg(long, global = true, env = "ZFS3_ENDPOINT", default_value = "aws")]
    endpoint: String,

    #[arg(long, global = true, env = "ZFS3_REGION")]
    region: Option<String>,

    /// Profile from the shared AWS config files
    #[arg(long = "aws-profile", global = true, env = "ZFS3_PROFILE")]
    profile: Option<String>,

    #[arg(long, global = true, env = "ZFS3_ACCESS_KEY_ID")]
    access_key_id: Option<String>,

    #[arg(long, global = true, env = "ZFS3_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: Option<String>,
}

impl StoreArgs {
    fn store_config(&self) -> anyhow::Result<StoreConfig> {
        if let Some(dir) = &self.local_dir {
            return Ok(StoreConfig::local(dir));
        }
        let bucket = self
            .bucket
            .clone()
            .ok_or_else(|| anyhow!("Configuration error! ZFS3_BUCKET is not set (use --bucket or --local-dir)"))?;

        let credentials = match (&self.access_key_id, &self.secret_access_key, &self.profile) {
            (Some(access_key_id), Some(secret_access_key), _) => Credentials::Static {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                session_token: None,
            },
            (Some(_), None, _) | (None, Some(_), _) => {
                return Err(anyhow!("both an access key id and a secret access key are required"))
            }
            (None, None, Some(profile)) => Credentials::Profile(profile.clone()),
            (None, None, None) => Credentials::Environment,
        };

        let mut config = StoreConfig::s3_with_bucket(bucket)
            .with_endpoint(self.endpoint.as_str())
            .with_credentials(credentials);
        if let Some(region) = &self.region {
            config = config.with_region(region.as_str());
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
struct DatasetArgs {
    /// ZFS dataset to operate on
    #[arg(long, alias = "dataset", global = true, env = "ZFS3_FILESYSTEM")]
    filesystem: Option<String>,

    /// Only operate on snapshots whose name starts with this prefix
    #[arg(long, global = true, env = "ZFS3_SNAPSHOT_PREFIX", default_value = "zfs-auto-snap:daily")]
    snapshot_prefix: String,
}

#[derive(Args, Debug, Clone)]
struct TuningArgs {
    /// Chunk size such as 64M; derived from the stream size estimate when omitted
    #[arg(long, global = true, env = "ZFS3_CHUNK_SIZE", value_parser = parse_size_arg)]
    chunk_size: Option<u64>,

    /// Uploads in flight at the same time
    #[arg(long, global = true, env = "ZFS3_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Retries per chunk after its first attempt
    #[arg(long, global = true, env = "ZFS3_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    #[arg(long, global = true, env = "ZFS3_STORAGE_CLASS", default_value = DEFAULT_STORAGE_CLASS)]
    storage_class: String,

    /// Chunks buffered between the reader and the uploaders
    #[arg(long, global = true, env = "ZFS3_QUEUE_DEPTH")]
    queue_depth: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a stream from stdin or a file
    Put {
        /// Name the stream is stored under
        name: String,
        /// Read from this file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Estimated stream size such as 12G, used to pick the chunk size
        #[arg(long, value_parser = parse_size_arg)]
        estimated: Option<u64>,
        #[arg(long, env = "ZFS3_COMPRESSOR", default_value = "parallel")]
        compressor: CompressorKind,
        /// Skip chunks an earlier run of the same name already stored
        #[arg(long)]
        resume: bool,
        /// Run the pipeline against memory without writing anything remotely
        #[arg(long)]
        dry_run: bool,
    },
    /// Back up local snapshots
    Backup {
        /// Snapshot to back up; defaults to the latest
        #[arg(long)]
        snapshot: Option<String>,
        /// Send the snapshot in full
        #[arg(long, conflicts_with = "incremental")]
        full: bool,
        /// Send every snapshot missing remotely as an increment; the default
        #[arg(long)]
        incremental: bool,
        #[arg(long, env = "ZFS3_COMPRESSOR", default_value = "parallel")]
        compressor: CompressorKind,
        #[arg(long)]
        dry_run: bool,
        /// Machine readable output
        #[arg(long)]
        parseable: bool,
    },
    /// Show local and remote snapshots side by side
    Status,
    /// Re-read every chunk of a backup and check its checksum
    Verify {
        /// Snapshot tag, full snapshot name, or the name given to `put`
        snapshot: String,
    },
    /// Restore a snapshot and the chain it depends on
    Restore {
        /// Snapshot tag or full snapshot name
        snapshot: String,
        /// Force rollback of the filesystem (zfs recv -F)
        #[arg(long)]
        force: bool,
        /// Show what would be received
        #[arg(long)]
        dry_run: bool,
        /// Write the stream of this one backup to a file (`-` for stdout) instead of zfs recv
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PARENT")]
    parent: String,
    #[tabled(rename = "TYPE")]
    kind: String,
    #[tabled(rename = "HEALTH")]
    health: String,
    #[tabled(rename = "LOCAL STATE")]
    local_state: String,
    #[tabled(rename = "SIZE")]
    size: String,
}

#[derive(Tabled)]
struct IssueRow {
    #[tabled(rename = "Sequence")]
    sequence: u64,
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Problem")]
    problem: String,
}

fn parse_size_arg(value: &str) -> Result<u64, String> {
    parse_size(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let directive = if cli.verbose {
        "zfs3=debug,zfs3_core=debug"
    } else {
        DEFAULT_LOG_DIRECTIVE
    };
    if let Err(e) = init_logging(cli.log_json, directive) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling uploads");
                cancel.cancel();
            }
        }
    });

    let app = App {
        store: cli.store,
        dataset: cli.dataset,
        tuning: cli.tuning,
        cancel,
    };
    let result = app.execute(cli.command).await;

    if let Some(path) = &cli.metrics_file {
        if let Err(e) = write_metrics(path) {
            warn!("Failed to write metrics to {}: {e:#}", path.display());
        }
    }

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(error_exit_code(&e))
        }
    }
}

fn error_exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<BackupError>() {
        Some(e) if e.is_internal() => EXIT_INTERNAL,
        _ => EXIT_USAGE,
    }
}

fn outcome_exit_code(outcome: &RunOutcome) -> ExitCode {
    ExitCode::from(u8::try_from(outcome.exit_code()).unwrap_or(EXIT_INTERNAL))
}

fn write_metrics(path: &Path) -> anyhow::Result<()> {
    let text = UploadMetrics::global()?.gather_metrics()?;
    std::fs::write(path, text)?;
    Ok(())
}

struct App {
    store: StoreArgs,
    dataset: DatasetArgs,
    tuning: TuningArgs,
    cancel: CancellationToken,
}

impl App {
    async fn execute(&self, command: Commands) -> anyhow::Result<ExitCode> {
        match command {
            Commands::Put {
                name,
                file,
                estimated,
                compressor,
                resume,
                dry_run,
            } => self.put(&name, file.as_deref(), estimated, compressor, resume, dry_run).await,
            Commands::Backup {
                snapshot,
                full,
                incremental: _,
                compressor,
                dry_run,
                parseable,
            } => self.backup(snapshot.as_deref(), full, compressor, dry_run, parseable).await,
            Commands::Status => self.status().await,
            Commands::Verify { snapshot } => self.verify(&snapshot).await,
            Commands::Restore {
                snapshot,
                force,
                dry_run,
                output,
            } => self.restore(&snapshot, force, dry_run, output.as_deref()).await,
        }
    }

    fn key_prefix(&self) -> &str {
        self.store.s3_prefix.trim_end_matches('/')
    }

    fn dataset(&self) -> anyhow::Result<&str> {
        self.dataset
            .filesystem
            .as_deref()
            .ok_or_else(|| anyhow!("Configuration error! ZFS3_FILESYSTEM is not set (use --filesystem)"))
    }

    /// `tag` becomes `dataset@tag`; full names and names without a dataset pass through
    fn snapshot_name(&self, snapshot: &str) -> String {
        match (&self.dataset.filesystem, snapshot.contains('@')) {
            (Some(dataset), false) => format!("{dataset}@{snapshot}"),
            _ => snapshot.to_string(),
        }
    }

    fn run_config(&self, compressor: CompressorKind, estimated: Option<u64>) -> RunConfig {
        let chunk_size = self
            .tuning
            .chunk_size
            .or_else(|| estimated.map(optimize_chunk_size))
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        RunConfig {
            chunk_size,
            concurrency: self.tuning.concurrency,
            max_retries: self.tuning.max_retries,
            compressor,
            storage_class: self.tuning.storage_class.clone(),
            key_prefix: self.key_prefix().to_string(),
            queue_depth: self.tuning.queue_depth,
            ..RunConfig::default()
        }
    }

    async fn remote_store(&self) -> anyhow::Result<Arc<dyn ObjectStore>> {
        let config = self.store.store_config()?;
        Ok(open_store(&config).await?)
    }

    /// Where uploads go: the configured store, or memory for dry runs
    async fn upload_store(&self, dry_run: bool) -> anyhow::Result<Arc<dyn ObjectStore>> {
        if dry_run {
            info!("Dry run, chunks are kept in memory");
            Ok(open_store(&StoreConfig::memory()).await?)
        } else {
            self.remote_store().await
        }
    }

    async fn load_record(&self, store: &Arc<dyn ObjectStore>, name: &str) -> anyhow::Result<Option<BackupRun>> {
        match store.get_object(&manifest_key(self.key_prefix(), name)).await {
            Ok(data) => Ok(Some(BackupRun::from_json(&data)?)),
            Err(BackupError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(
        &self,
        name: &str,
        file: Option<&Path>,
        estimated: Option<u64>,
        compressor: CompressorKind,
        resume: bool,
        dry_run: bool,
    ) -> anyhow::Result<ExitCode> {
        let reader: Box<dyn AsyncRead + Send + Unpin> = match file {
            Some(path) => Box::new(
                tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?,
            ),
            None => Box::new(tokio::io::stdin()),
        };

        let store = self.upload_store(dry_run).await?;
        let mut orchestrator = Orchestrator::new(self.run_config(compressor, estimated), Arc::clone(&store))?
            .with_cancellation(self.cancel.clone());
        if resume {
            if let Some(previous) = self.load_record(&store, name).await? {
                info!(dataset_id = name, status = previous.outcome.status(), "Resuming from previous run");
                orchestrator = orchestrator.resume_from(previous.manifest().clone());
            }
        }

        let run = orchestrator.run_and_record(name, reader, None).await?;
        // stdout carries only the record
        println!("{}", serde_json::to_string_pretty(&run)?);
        if !run.outcome.is_success() {
            report_run(&run, false);
        }
        Ok(outcome_exit_code(&run.outcome))
    }

    async fn backup(
        &self,
        snapshot: Option<&str>,
        full: bool,
        compressor: CompressorKind,
        dry_run: bool,
        parseable: bool,
    ) -> anyhow::Result<ExitCode> {
        let dataset = self.dataset()?;
        let source = ZfsSendSource::new();
        let local = source.list_snapshots(dataset, &self.dataset.snapshot_prefix).await?;
        let remote = self.remote_store().await?;
        let catalog = Catalog::load(
            &remote,
            self.key_prefix(),
            &format!("{dataset}@{}", self.dataset.snapshot_prefix),
        )
        .await?;

        let snapshot = snapshot.map(|s| self.snapshot_name(s));
        let plan = if full {
            vec![plan_full(&local, snapshot.as_deref()).map_err(|e| no_snapshot_hint(e, dataset, &self.dataset.snapshot_prefix))?]
        } else {
            catalog
                .plan_incremental(&local, snapshot.as_deref())
                .map_err(|e| no_snapshot_hint(e, dataset, &self.dataset.snapshot_prefix))?
        };
        if plan.is_empty() {
            if !parseable {
                println!("Nothing to back up, every snapshot up to the requested one is stored");
            }
            return Ok(ExitCode::SUCCESS);
        }

        let store = if dry_run { self.upload_store(true).await? } else { remote };
        for planned in plan {
            let parent = planned.parent.as_deref();
            let estimated = source.estimate_size(&planned.snapshot, parent).await?;
            let lineage = match parent {
                Some(parent) => Lineage::incremental(&planned.snapshot, parent),
                None => Lineage::full(&planned.snapshot),
            }
            .with_estimated_size(estimated);

            let mut orchestrator = Orchestrator::new(self.run_config(compressor, Some(estimated)), Arc::clone(&store))?
                .with_cancellation(self.cancel.clone());
            if let Some(previous) = catalog.get(&planned.snapshot).filter(|run| !run.outcome.is_success()) {
                orchestrator = orchestrator.resume_from(previous.manifest().clone());
            }

            info!(snapshot = %planned.snapshot, parent = ?parent, estimated, "Backing up snapshot");
            let stream = source.open_stream(&planned.snapshot, parent).await?;
            let run = orchestrator
                .run_and_record(&planned.snapshot, stream, Some(lineage))
                .await?;
            report_run(&run, parseable);

            // later increments depend on this one
            if !run.outcome.is_success() {
                return Ok(outcome_exit_code(&run.outcome));
            }
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn status(&self) -> anyhow::Result<ExitCode> {
        let dataset = self.dataset()?;
        let prefix = &self.dataset.snapshot_prefix;
        let store = self.remote_store().await?;
        println!(
            "Checking backup status for: {dataset}@{prefix}* on {}/{}\n",
            store.describe(),
            self.key_prefix()
        );

        let local = ZfsSendSource::new().list_snapshots(dataset, prefix).await?;
        let catalog = Catalog::load(&store, self.key_prefix(), &format!("{dataset}@{prefix}")).await?;

        let mut rows: Vec<StatusRow> = catalog
            .status(&local)
            .into_iter()
            .map(|status| StatusRow {
                name: status.name,
                parent: status.parent.unwrap_or_else(|| "-".to_string()),
                kind: status.kind,
                health: status.health.map(|h| h.to_string()).unwrap_or_else(|| "-".to_string()),
                local_state: if status.local { "ok" } else { "missing" }.to_string(),
                size: status.size.map(format_size).unwrap_or_default(),
            })
            .collect();
        if rows.is_empty() {
            println!("No snapshots found");
        } else {
            rows.sort_by(|a, b| a.name.cmp(&b.name));
            println!("{}", Table::new(rows));
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn verify(&self, snapshot: &str) -> anyhow::Result<ExitCode> {
        let name = self.snapshot_name(snapshot);
        let store = self.remote_store().await?;
        let run = self
            .load_record(&store, &name)
            .await?
            .ok_or_else(|| BackupError::not_found(format!("no backup named {name}")))?;

        info!("Verifying backup: {}", name);
        let report = Restorer::new(store)
            .with_concurrency(self.tuning.concurrency)
            .verify(run.manifest())
            .await?;

        println!(
            "Backup {name} ({}, finished {})",
            run.outcome.status(),
            format_timestamp(&run.finished_at)
        );
        if report.is_ok() && run.outcome.is_success() {
            println!("✓ All {} chunks verified", report.checked);
            return Ok(ExitCode::SUCCESS);
        }

        if !report.issues.is_empty() {
            let rows: Vec<IssueRow> = report
                .issues
                .iter()
                .map(|issue| IssueRow {
                    sequence: issue.sequence,
                    key: issue.key.clone(),
                    problem: serde_json::to_string(&issue.problem).unwrap_or_else(|_| format!("{:?}", issue.problem)),
                })
                .collect();
            println!("{}", Table::new(rows));
        }
        if !report.missing_from_manifest.is_empty() {
            println!("✗ Never committed: {:?}", report.missing_from_manifest);
        }
        println!("✗ {} of {} stored chunks failed verification", report.issues.len(), report.checked);
        Ok(ExitCode::from(EXIT_VERIFY_FAILED))
    }

    async fn restore(
        &self,
        snapshot: &str,
        force: bool,
        dry_run: bool,
        output: Option<&Path>,
    ) -> anyhow::Result<ExitCode> {
        let name = self.snapshot_name(snapshot);
        let store = self.remote_store().await?;
        let restorer = Restorer::new(Arc::clone(&store)).with_concurrency(self.tuning.concurrency);

        if let Some(output) = output {
            let run = self
                .load_record(&store, &name)
                .await?
                .ok_or_else(|| BackupError::not_found(format!("no backup named {name}")))?;
            let mut writer: Box<dyn AsyncWrite + Send + Unpin> = if output == Path::new("-") {
                Box::new(tokio::io::stdout())
            } else {
                Box::new(
                    tokio::fs::File::create(output)
                        .await
                        .with_context(|| format!("failed to create {}", output.display()))?,
                )
            };
            restorer.restore(&run, &mut writer).await?;
            return Ok(ExitCode::SUCCESS);
        }

        let (dataset, _) = name
            .split_once('@')
            .ok_or_else(|| anyhow!("'{name}' is not a snapshot name; pass --filesystem or dataset@snapshot"))?;
        let source = ZfsSendSource::new();
        if !force && source.dataset_exists(dataset).await? {
            eprintln!("The dataset: {dataset} already exists locally; if you choose to overwrite it specify '--force'");
            return Ok(ExitCode::from(EXIT_USAGE));
        }

        let local = source.list_snapshots(dataset, "").await?;
        let catalog = Catalog::load(&store, self.key_prefix(), &format!("{dataset}@")).await?;
        let plan = catalog.plan_restore(&local, &name)?;
        if let Some(present) = &plan.present_locally {
            println!("Snapshot {present} already exists locally. If you'd like to roll back to it you can run 'zfs rollback {present}'");
        }

        for run in &plan.runs {
            let target = run.lineage.as_ref().map(|l| l.snapshot.as_str()).unwrap_or(&run.dataset_id);
            if dry_run {
                println!(
                    "would receive {target} ({}, {})",
                    if run.lineage.as_ref().map_or(true, |l| l.is_full) { "full" } else { "incremental" },
                    format_size(run.manifest().total_size)
                );
                continue;
            }
            let mut sink = source.receive(target, force)?;
            restorer.restore(run, &mut sink).await?;
            sink.finish().await?;
            println!("Restored {target}");
        }
        Ok(ExitCode::SUCCESS)
    }
}

fn no_snapshot_hint(error: BackupError, dataset: &str, prefix: &str) -> anyhow::Error {
    match error {
        BackupError::NotFound(msg) => anyhow!(
            "{msg}. Nothing to back up for filesystem '{dataset}'; is ZFS3_SNAPSHOT_PREFIX='{prefix}' correct?"
        ),
        other => other.into(),
    }
}

fn report_run(run: &BackupRun, parseable: bool) {
    let manifest = run.manifest();
    match &run.outcome {
        RunOutcome::Succeeded { .. } => {
            if parseable {
                println!("{}\x00{}", run.dataset_id, manifest.total_size);
            } else {
                println!(
                    "Successfully backed up {}: {} in {} chunks",
                    run.dataset_id,
                    format_size(manifest.total_size),
                    manifest.chunk_count
                );
            }
        }
        RunOutcome::PartiallyFailed { failures, .. } => {
            eprintln!(
                "Backup of {} partially failed: {} of {} chunks could not be stored",
                run.dataset_id,
                failures.len(),
                manifest.chunk_count
            );
            for failure in failures {
                eprintln!(
                    "  chunk {} after {} attempts: {}",
                    failure.sequence, failure.attempts, failure.last_error
                );
            }
        }
        RunOutcome::Aborted { reason, .. } => {
            eprintln!("Backup of {} aborted: {reason}", run.dataset_id);
        }
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: &chrono::DateTime<chrono::Utc>) -> String {
    timestamp
        .with_timezone(&chrono::Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zfs3_core::{MemoryObjectStore, StoreBackend};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("zfs3").chain(args.iter().copied())).unwrap()
    }

    fn app(cli: Cli) -> App {
        App {
            store: cli.store,
            dataset: cli.dataset,
            tuning: cli.tuning,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_parse_backup_arguments() {
        let cli = parse(&[
            "--bucket",
            "backups",
            "--filesystem",
            "tank/data",
            "backup",
            "--full",
            "--compressor",
            "none",
            "--parseable",
        ]);
        match cli.command {
            Commands::Backup {
                full,
                compressor,
                parseable,
                ..
            } => {
                assert!(full);
                assert!(parseable);
                assert_eq!(compressor, CompressorKind::Identity);
            }
            _ => panic!("expected backup"),
        }
        assert_eq!(cli.dataset.filesystem.as_deref(), Some("tank/data"));
    }

    #[test]
    fn test_full_conflicts_with_incremental() {
        let result = Cli::try_parse_from(["zfs3", "backup", "--full", "--incremental"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_sizes_are_parsed() {
        let cli = parse(&["--chunk-size", "16M", "put", "data", "--estimated", "2G"]);
        assert_eq!(cli.tuning.chunk_size, Some(16 * 1024 * 1024));
        assert!(Cli::try_parse_from(["zfs3", "--chunk-size", "lots", "status"]).is_err());
    }

    #[test]
    fn test_run_config_chunk_size_selection() {
        let explicit = app(parse(&["--chunk-size", "1M", "status"]));
        assert_eq!(
            explicit.run_config(CompressorKind::Single, Some(1 << 40)).chunk_size,
            1024 * 1024
        );

        let derived = app(parse(&["status"]));
        assert_eq!(
            derived.run_config(CompressorKind::Single, Some(1 << 40)).chunk_size,
            optimize_chunk_size(1 << 40)
        );
        let config = derived.run_config(CompressorKind::Parallel, None);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.key_prefix, "zfs3backup");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_config_selection() {
        let local = parse(&["--local-dir", "/tmp/zfs3", "status"]);
        assert_eq!(local.store.store_config().unwrap().backend, StoreBackend::Local);

        let s3 = parse(&[
            "--bucket",
            "b",
            "--endpoint",
            "https://s3.wasabisys.com",
            "--aws-profile",
            "backup",
            "status",
        ]);
        let config = s3.store.store_config().unwrap();
        assert_eq!(config.endpoint.as_deref(), Some("https://s3.wasabisys.com"));
        assert_eq!(config.credentials, Credentials::Profile("backup".to_string()));

        let half_keys = parse(&["--bucket", "b", "--access-key-id", "AKIA", "status"]);
        assert!(half_keys.store.store_config().is_err());
    }

    #[test]
    fn test_snapshot_name_resolution() {
        let with_dataset = app(parse(&["--filesystem", "tank/data", "status"]));
        assert_eq!(with_dataset.snapshot_name("daily-1"), "tank/data@daily-1");
        assert_eq!(with_dataset.snapshot_name("pool@x"), "pool@x");

        let without = app(parse(&["status"]));
        assert_eq!(without.snapshot_name("stream"), "stream");
        assert!(without.dataset().is_err());
    }

    #[test]
    fn test_error_exit_codes() {
        let internal = anyhow::Error::from(BackupError::DuplicateCommit(3));
        assert_eq!(error_exit_code(&internal), EXIT_INTERNAL);
        let usage = anyhow::Error::from(BackupError::validation("bad"));
        assert_eq!(error_exit_code(&usage), EXIT_USAGE);
        assert_eq!(error_exit_code(&anyhow!("plain")), EXIT_USAGE);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[tokio::test]
    async fn test_put_file_to_local_dir_and_verify() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("stream.bin");
        std::fs::write(&input, vec![5u8; 10_000]).unwrap();
        let store_dir = dir.path().join("store");
        let store_arg = store_dir.to_str().unwrap();

        let cli = parse(&["--local-dir", store_arg, "--chunk-size", "4K", "put", "stream", "-f", input.to_str().unwrap()]);
        let app = app_with_command(cli);
        let code = app.0.execute(app.1).await.unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        assert!(store_dir.join("zfs3backup/stream/manifest.json").exists());

        let cli = parse(&["--local-dir", store_arg, "verify", "stream"]);
        let app = app_with_command(cli);
        assert_eq!(app.0.execute(app.1).await.unwrap(), ExitCode::SUCCESS);
    }

    #[tokio::test]
    async fn test_dry_run_put_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let input = dir.path().join("stream.bin");
        std::fs::write(&input, vec![1u8; 100]).unwrap();
        let store_dir = dir.path().join("store");

        let cli = parse(&[
            "--local-dir",
            store_dir.to_str().unwrap(),
            "put",
            "stream",
            "--dry-run",
            "-f",
            input.to_str().unwrap(),
        ]);
        let app = app_with_command(cli);
        assert_eq!(app.0.execute(app.1).await.unwrap(), ExitCode::SUCCESS);
        assert!(!store_dir.join("zfs3backup/stream/manifest.json").exists());
    }

    #[tokio::test]
    async fn test_load_record_missing_is_none() {
        let app = app(parse(&["status"]));
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        assert!(app.load_record(&store, "nothing").await.unwrap().is_none());
    }

    fn app_with_command(cli: Cli) -> (App, Commands) {
        let command = cli.command;
        (
            App {
                store: cli.store,
                dataset: cli.dataset,
                tuning: cli.tuning,
                cancel: CancellationToken::new(),
            },
            command,
        )
    }
}
