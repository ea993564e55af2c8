//! Synchronization runs: source registry, snapshot reconciliation, run
//! reports and scheduling.

pub mod reconcile;
pub mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lobbysync_adapters::{
    parse_meeting_rows, parse_register_rows, AdapterContext, AdapterError, AliasMap,
    FixtureSource, HttpJsonSource, RejectedRow, SnapshotKind, SnapshotSource,
};
use lobbysync_storage::{FetcherConfig, HttpFetcher, StateFile, Store, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use reconcile::{
    merge_display_names, reconcile_meetings, reconcile_register, record_unmatched,
    resolve_unmatched, upsert_child, SyncStats,
};
pub use snapshot::{fetch_snapshot, FailedPage, Snapshot};

pub const CRATE_NAME: &str = "lobbysync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("root listing of {source_id} is unavailable")]
    RootUnavailable {
        source_id: String,
        #[source]
        source: AdapterError,
    },
    #[error("no enabled source matches {0:?}")]
    UnknownSource(String),
    #[error("no sources given for a {0} run")]
    NoSources(SnapshotKind),
    #[error("source {source_id} serves {found} snapshots, not {expected}")]
    KindMismatch {
        source_id: String,
        expected: SnapshotKind,
        found: SnapshotKind,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Fixture,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub kind: SnapshotKind,
    pub mode: SourceMode,
    pub enabled: bool,
    #[serde(default)]
    pub root_url: Option<String>,
    #[serde(default)]
    pub bundle_path: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|source| source.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub state_path: PathBuf,
    pub reports_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron_register: String,
    pub sync_cron_meetings: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("LOBBYSYNC_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let mut config = Self::for_workspace(workspace_root);
        if let Ok(path) = std::env::var("LOBBYSYNC_STATE_PATH") {
            config.state_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("LOBBYSYNC_REPORTS_DIR") {
            config.reports_dir = PathBuf::from(dir);
        }
        config.scheduler_enabled = std::env::var("LOBBYSYNC_SCHEDULER_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        if let Ok(cron) = std::env::var("SYNC_CRON_REGISTER") {
            config.sync_cron_register = cron;
        }
        if let Ok(cron) = std::env::var("SYNC_CRON_MEETINGS") {
            config.sync_cron_meetings = cron;
        }
        if let Ok(user_agent) = std::env::var("LOBBYSYNC_USER_AGENT") {
            config.user_agent = user_agent;
        }
        config.http_timeout_secs = std::env::var("LOBBYSYNC_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.http_timeout_secs);
        config.web_port = std::env::var("LOBBYSYNC_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.web_port);
        config
    }

    /// Defaults with state and reports kept under `workspace_root`.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            state_path: workspace_root.join("state").join("lobbysync.json"),
            reports_dir: workspace_root.join("reports"),
            workspace_root,
            scheduler_enabled: false,
            sync_cron_register: "0 0 5 * * *".to_string(),
            sync_cron_meetings: "0 30 5 * * *".to_string(),
            user_agent: "lobbysync/0.1".to_string(),
            http_timeout_secs: 30,
            web_port: 8000,
        }
    }
}

/// Outcome of one run over every source of a kind, written to
/// `reports/<run_id>/run_summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source_ids: Vec<String>,
    pub kind: SnapshotKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_total: usize,
    pub stats: SyncStats,
    pub state_hash: String,
}

/// Runs snapshots into the shared store. Runs are serialized: each one
/// commits the whole store, so two in flight would overwrite each other.
///
/// A run covers every source of one snapshot kind. Presence is judged
/// against the union of their rows, so one source never deactivates what
/// another of the same kind still lists.
pub struct SyncRunner {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    store: Arc<RwLock<Store>>,
    state_file: StateFile,
    aliases: AliasMap,
    run_lock: Mutex<()>,
}

impl SyncRunner {
    /// Load the persisted state and the alias map for `config`.
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let state_file = StateFile::new(config.state_path.clone());
        let store = state_file.load().await?;
        Self::with_store(config, Arc::new(RwLock::new(store)))
    }

    pub fn with_store(config: SyncConfig, store: Arc<RwLock<Store>>) -> Result<Self> {
        let http = HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let aliases = AliasMap::load(config.workspace_root.join("aliases.yaml"))?;
        Ok(Self {
            state_file: StateFile::new(config.state_path.clone()),
            config,
            http: Arc::new(http),
            store,
            aliases,
            run_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<RwLock<Store>> {
        self.store.clone()
    }

    pub fn build_source(&self, source: &SourceConfig) -> Result<Arc<dyn SnapshotSource>> {
        match source.mode {
            SourceMode::Fixture => {
                let relative = source.bundle_path.clone().unwrap_or_else(|| {
                    PathBuf::from("fixtures")
                        .join(&source.source_id)
                        .join("sample")
                        .join("bundle.json")
                });
                Ok(Arc::new(FixtureSource::from_path(
                    source.source_id.clone(),
                    source.kind,
                    self.config.workspace_root.join(relative),
                )))
            }
            SourceMode::Http => {
                let root_url = source
                    .root_url
                    .clone()
                    .with_context(|| format!("http source {} has no root_url", source.source_id))?;
                Ok(Arc::new(HttpJsonSource::new(
                    source.source_id.clone(),
                    source.kind,
                    root_url,
                    self.http.clone(),
                )))
            }
        }
    }

    /// Run every enabled source, one run per kind, register first. Naming
    /// `source_id` runs the kind that source serves, together with the other
    /// enabled sources of that kind.
    pub async fn run_configured(&self, source_id: Option<&str>) -> Result<Vec<RunSummary>> {
        let registry = SourceRegistry::load(&self.config.workspace_root).await?;
        let kind = match source_id {
            None => None,
            Some(id) => match registry.enabled().find(|source| source.source_id == id) {
                Some(source) => Some(source.kind),
                None => return Err(SyncError::UnknownSource(id.to_string()).into()),
            },
        };
        let selected = registry
            .enabled()
            .filter(|source| kind.map_or(true, |kind| source.kind == kind))
            .cloned()
            .collect::<Vec<_>>();
        self.run_sources(&selected).await
    }

    pub async fn run_kind(&self, kind: SnapshotKind) -> Result<Vec<RunSummary>> {
        let registry = SourceRegistry::load(&self.config.workspace_root).await?;
        let selected = registry
            .enabled()
            .filter(|source| source.kind == kind)
            .cloned()
            .collect::<Vec<_>>();
        self.run_sources(&selected).await
    }

    async fn run_sources(&self, sources: &[SourceConfig]) -> Result<Vec<RunSummary>> {
        let mut summaries = Vec::new();
        for kind in [SnapshotKind::Register, SnapshotKind::Meetings] {
            let group = sources
                .iter()
                .filter(|source| source.kind == kind)
                .collect::<Vec<_>>();
            if group.is_empty() {
                continue;
            }
            let built = group
                .iter()
                .map(|config| self.build_source(config))
                .collect::<Result<Vec<_>>>()?;
            let ids = group
                .iter()
                .map(|config| config.source_id.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let summary = self
                .run_kind_sources(kind, built)
                .await
                .with_context(|| format!("syncing {kind} from {ids}"))?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Run a single source as the only source of its kind.
    pub async fn run_source(&self, source: Arc<dyn SnapshotSource>) -> Result<RunSummary> {
        self.run_kind_sources(source.kind(), vec![source]).await
    }

    /// Fetch the full snapshot of every source of `kind`, reconcile their
    /// union in a single unit of work, persist and commit.
    pub async fn run_kind_sources(
        &self,
        kind: SnapshotKind,
        sources: Vec<Arc<dyn SnapshotSource>>,
    ) -> Result<RunSummary> {
        if sources.is_empty() {
            return Err(SyncError::NoSources(kind).into());
        }
        if let Some(other) = sources.iter().find(|source| source.kind() != kind) {
            return Err(SyncError::KindMismatch {
                source_id: other.source_id().to_string(),
                expected: kind,
                found: other.kind(),
            }
            .into());
        }

        let _running = self.run_lock.lock().await;
        let ctx = AdapterContext::new();
        let source_ids = sources
            .iter()
            .map(|source| source.source_id().to_string())
            .collect::<Vec<_>>();
        let span = info_span!(
            "sync_run",
            run_id = %ctx.run_id,
            %kind,
            sources = %source_ids.join(",")
        );
        self.run_kind_inner(kind, sources, source_ids, ctx)
            .instrument(span)
            .await
    }

    async fn run_kind_inner(
        &self,
        kind: SnapshotKind,
        sources: Vec<Arc<dyn SnapshotSource>>,
        source_ids: Vec<String>,
        ctx: AdapterContext,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let mut snapshot = Snapshot::default();
        for source in sources {
            let part = fetch_snapshot(source, &ctx).await?;
            snapshot.rows.extend(part.rows);
            snapshot.pages_total += part.pages_total;
            snapshot.failed_pages.extend(part.failed_pages);
        }

        let mut stats = SyncStats {
            pages_failed: snapshot.failed_pages.len(),
            ..SyncStats::default()
        };
        let mut uow = self.store.read().await.begin();
        match kind {
            SnapshotKind::Register => {
                let batch = parse_register_rows(&snapshot.rows);
                log_rejected(&batch.rejected);
                stats.rejected = batch.rejected.len();
                reconcile_register(&mut uow, &batch.records, &mut stats);
            }
            SnapshotKind::Meetings => {
                let batch = parse_meeting_rows(&snapshot.rows, &self.aliases);
                log_rejected(&batch.rejected);
                stats.rejected = batch.rejected.len();
                reconcile_meetings(&mut uow, &batch.records, &mut stats);
            }
        }

        // The shared store only moves forward once the committed state is on
        // disk.
        let saved = {
            let mut store = self.store.write().await;
            let mut next = Store::clone(&store);
            let commit = next.commit(uow).map_err(SyncError::from)?;
            stats.deactivated = commit.deactivated;
            stats.audit_records = commit.audit_records;
            let saved = self.state_file.save(&next).await?;
            *store = next;
            saved
        };

        let summary = RunSummary {
            run_id: ctx.run_id,
            source_ids,
            kind,
            started_at,
            finished_at: Utc::now(),
            pages_total: snapshot.pages_total,
            stats,
            state_hash: saved.content_hash,
        };
        write_run_summary(&self.config.reports_dir, &summary).await?;
        info!(
            created = stats.created,
            updated = stats.updated,
            unchanged = stats.unchanged,
            deactivated = stats.deactivated,
            rejected = stats.rejected,
            audit_records = stats.audit_records,
            "sync run committed"
        );
        Ok(summary)
    }

    /// One cron job per snapshot kind, each running that kind's sources.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for (kind, cron) in [
            (SnapshotKind::Register, &self.config.sync_cron_register),
            (SnapshotKind::Meetings, &self.config.sync_cron_meetings),
        ] {
            let runner = Arc::clone(self);
            let job = Job::new_async(cron, move |_uuid, _l| {
                let runner = runner.clone();
                Box::pin(async move {
                    match runner.run_kind(kind).await {
                        Ok(summaries) => info!(%kind, runs = summaries.len(), "scheduled sync finished"),
                        Err(err) => warn!(%kind, error = %format!("{err:#}"), "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

fn log_rejected(rejected: &[RejectedRow]) {
    for row in rejected {
        warn!(index = row.index, kind = %row.kind, error = %row.error, "rejected snapshot row");
    }
}

async fn write_run_summary(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("run_summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub async fn run_sync_once_from_env(source_id: Option<&str>) -> Result<Vec<RunSummary>> {
    let runner = SyncRunner::new(SyncConfig::from_env()).await?;
    runner.run_configured(source_id).await
}

/// Run summaries under `reports_dir`, newest first. A missing directory
/// has no runs.
pub fn load_run_summaries(reports_dir: &Path, limit: usize) -> Result<Vec<RunSummary>> {
    if !reports_dir.exists() {
        return Ok(Vec::new());
    }
    let mut summaries = Vec::new();
    let entries = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?;
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path().join("run_summary.json");
        if !path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: RunSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
    summaries.truncate(limit);
    Ok(summaries)
}

/// Markdown digest of the latest `runs` run summaries, newest first.
pub fn report_runs_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let summaries = load_run_summaries(reports_dir, runs.max(1))?;
    let mut lines = vec!["# lobbysync runs".to_string(), String::new()];
    for summary in summaries {
        let stats = summary.stats;
        lines.push(format!(
            "## Run `{}` ({} / {})",
            summary.run_id,
            summary.source_ids.join(", "),
            summary.kind
        ));
        lines.push(format!("- finished: {}", summary.finished_at));
        lines.push(format!(
            "- pages: {} ({} failed)",
            summary.pages_total, stats.pages_failed
        ));
        lines.push(format!(
            "- created {}, updated {}, unchanged {}, reactivated {}, deactivated {}",
            stats.created, stats.updated, stats.unchanged, stats.reactivated, stats.deactivated
        ));
        lines.push(format!(
            "- rejected rows {}, write failures {}, audit records {}",
            stats.rejected, stats.write_failures, stats.audit_records
        ));
        lines.push(format!("- state: `{}`", summary.state_hash));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn test_config(scratch: &Path) -> SyncConfig {
        SyncConfig {
            state_path: scratch.join("state.json"),
            reports_dir: scratch.join("reports"),
            ..SyncConfig::for_workspace(workspace_root())
        }
    }

    #[test]
    fn source_registry_parses() {
        let text = std::fs::read_to_string(workspace_root().join("sources.yaml")).unwrap();
        let registry: SourceRegistry = serde_yaml::from_str(&text).unwrap();
        assert!(registry.enabled().any(|s| s.kind == SnapshotKind::Register));
        assert!(registry.enabled().any(|s| s.kind == SnapshotKind::Meetings));
    }

    #[tokio::test]
    async fn configured_fixture_sources_sync_and_report() {
        let scratch = tempdir().expect("tempdir");
        let config = test_config(scratch.path());
        let runner = SyncRunner::new(config.clone()).await.expect("runner");

        let summaries = runner.run_configured(None).await.expect("sync");
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].kind, SnapshotKind::Register);
        assert!(summaries[0].stats.created > 0);
        assert!(config.state_path.exists());

        let markdown = report_runs_markdown(5, &config.reports_dir).expect("report");
        assert!(markdown.contains(&summaries[1].run_id.to_string()));

        let reloaded = SyncRunner::new(config).await.expect("reload");
        let again = reloaded.run_configured(None).await.expect("sync again");
        assert!(again.iter().all(|s| s.stats.audit_records == 0));
        assert_eq!(again[1].state_hash, summaries[1].state_hash);
    }

    #[tokio::test]
    async fn unknown_source_is_an_error() {
        let scratch = tempdir().expect("tempdir");
        let runner = SyncRunner::new(test_config(scratch.path())).await.expect("runner");
        let err = runner.run_configured(Some("nope")).await.unwrap_err();
        assert!(err.downcast_ref::<SyncError>().is_some());
    }

    #[tokio::test]
    async fn scheduler_is_off_by_default() {
        let scratch = tempdir().expect("tempdir");
        let runner = Arc::new(SyncRunner::new(test_config(scratch.path())).await.expect("runner"));
        assert!(runner.maybe_build_scheduler().await.expect("scheduler").is_none());
    }
}
