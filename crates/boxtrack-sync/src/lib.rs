//! Sync pipeline orchestration: discover, enrich, join, filter, merge, persist.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use boxtrack_adapters::{
    MovieSource, SourceError, TmdbConfig, TmdbSource, DEFAULT_API_BASE_URL,
    DEFAULT_IMAGE_BASE_URL, DEFAULT_LANGUAGE,
};
use boxtrack_core::{left_join, DiscoveryWindow, MovieId, MovieRecord};
use boxtrack_storage::{DatasetStore, HttpClientConfig, HttpFetcher, Pacer, PacingPolicy, StoredDataset};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "boxtrack-sync";

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("TMDB_API_KEY is not configured")]
    MissingCredential,
    #[error("invalid discovery window: starts {start_days} days ago, ends {end_days} days ago")]
    InvalidWindow { start_days: u32, end_days: u32 },
    #[error("discovery query failed")]
    Discovery(#[source] SourceError),
    #[error("dataset storage failed")]
    Storage(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Init,
    Discover,
    Enrich,
    Join,
    Filter,
    LoadExisting,
    Merge,
    Persist,
    Done,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Init => "init",
            SyncStage::Discover => "discover",
            SyncStage::Enrich => "enrich",
            SyncStage::Join => "join",
            SyncStage::Filter => "filter",
            SyncStage::LoadExisting => "load_existing",
            SyncStage::Merge => "merge",
            SyncStage::Persist => "persist",
            SyncStage::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_key: Option<String>,
    pub api_base_url: String,
    pub image_base_url: String,
    pub language: String,
    pub window_start_days: u32,
    pub window_end_days: u32,
    pub dataset_path: PathBuf,
    pub reports_dir: PathBuf,
    pub pacing: PacingPolicy,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SyncConfig::from_env`], falling back to `KEY=value` pairs from a dotenv file.
    /// Process variables take precedence; a missing file is ignored.
    pub fn from_env_and_dotenv(path: &Path) -> Result<Self> {
        let file = read_dotenv(path)?;
        if !file.is_empty() {
            info!(path = %path.display(), vars = file.len(), "loaded dotenv file");
        }
        Ok(Self::from_lookup(|key| {
            std::env::var(key).ok().or_else(|| file.get(key).cloned())
        }))
    }

    /// Build a config from any key/value source; unset or unparseable values use defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_key: lookup("TMDB_API_KEY")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            api_base_url: lookup("TMDB_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            image_base_url: lookup("TMDB_IMAGE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_IMAGE_BASE_URL.to_string()),
            language: lookup("TMDB_LANGUAGE").unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            window_start_days: parse_var(&lookup, "BOXTRACK_WINDOW_START_DAYS").unwrap_or(60),
            window_end_days: parse_var(&lookup, "BOXTRACK_WINDOW_END_DAYS").unwrap_or(10),
            dataset_path: lookup("BOXTRACK_DATASET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/final_movie_analysis_data.parquet")),
            reports_dir: lookup("BOXTRACK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("reports")),
            pacing: PacingPolicy {
                min_interval: Duration::from_millis(
                    parse_var(&lookup, "BOXTRACK_REQUEST_INTERVAL_MS").unwrap_or(300),
                ),
            },
            http_timeout_secs: parse_var(&lookup, "BOXTRACK_HTTP_TIMEOUT_SECS").unwrap_or(10),
            user_agent: lookup("BOXTRACK_USER_AGENT")
                .unwrap_or_else(|| "boxtrack/0.1".to_string()),
            scheduler_enabled: lookup("BOXTRACK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: lookup("BOXTRACK_SYNC_CRON_1")
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: lookup("BOXTRACK_SYNC_CRON_2").filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn credential(&self) -> Result<&str, SyncError> {
        self.api_key.as_deref().ok_or(SyncError::MissingCredential)
    }

    /// Resolve the discovery window for `today`. Inverted or out-of-range offsets are rejected.
    pub fn window(&self, today: NaiveDate) -> Result<DiscoveryWindow, SyncError> {
        let invalid = || SyncError::InvalidWindow {
            start_days: self.window_start_days,
            end_days: self.window_end_days,
        };
        if self.window_start_days < self.window_end_days {
            return Err(invalid());
        }
        DiscoveryWindow::trailing(today, self.window_start_days, self.window_end_days)
            .ok_or_else(invalid)
    }

    pub fn manifest_path(&self) -> PathBuf {
        let mut name = self
            .dataset_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "dataset".into());
        name.push(".manifest.json");
        self.dataset_path.with_file_name(name)
    }
}

/// Read the pairs of a dotenv file without touching the process environment.
pub fn read_dotenv(path: &Path) -> Result<HashMap<String, String>> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(err) if err.not_found() => return Ok(HashMap::new()),
        Err(err) => return Err(err).with_context(|| format!("opening {}", path.display())),
    };
    iter.map(|item| item.with_context(|| format!("parsing {}", path.display())))
        .collect()
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

/// Outcome of the quality filter. `dropped + output == input` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterReport {
    pub input: usize,
    pub dropped: usize,
    pub output: usize,
    pub zero_budget: usize,
    pub zero_revenue: usize,
    pub zero_vote_average: usize,
    pub zero_popularity: usize,
    pub missing_release_date: usize,
}

/// Drops rows whose zero financials or audience metrics mark them as unreported.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityFilter;

impl QualityFilter {
    pub fn passes(record: &MovieRecord) -> bool {
        record.budget > 0
            && record.revenue > 0
            && record.vote_average > 0.0
            && record.popularity > 0.0
            && record.release_date.is_some()
    }

    pub fn apply(&self, records: Vec<MovieRecord>) -> (Vec<MovieRecord>, FilterReport) {
        let mut report = FilterReport {
            input: records.len(),
            ..FilterReport::default()
        };

        let kept = records
            .into_iter()
            .filter(|record| {
                report.zero_budget += usize::from(record.budget == 0);
                report.zero_revenue += usize::from(record.revenue == 0);
                report.zero_vote_average += usize::from(!(record.vote_average > 0.0));
                report.zero_popularity += usize::from(!(record.popularity > 0.0));
                report.missing_release_date += usize::from(record.release_date.is_none());
                Self::passes(record)
            })
            .collect::<Vec<_>>();

        report.output = kept.len();
        report.dropped = report.input - report.output;
        (kept, report)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub existing: usize,
    pub incoming: usize,
    /// Distinct incoming ids that overwrote an existing row.
    pub replaced: usize,
    /// Distinct incoming ids new to the dataset.
    pub added: usize,
    pub total: usize,
}

/// Last-wins merge: concatenate `existing ++ incoming` and keep the final row per id.
pub fn merge(existing: Option<Vec<MovieRecord>>, incoming: Vec<MovieRecord>) -> Vec<MovieRecord> {
    merge_with_report(existing, incoming).0
}

pub fn merge_with_report(
    existing: Option<Vec<MovieRecord>>,
    incoming: Vec<MovieRecord>,
) -> (Vec<MovieRecord>, MergeReport) {
    let existing = existing.unwrap_or_default();
    let existing_ids: HashSet<MovieId> = existing.iter().map(|r| r.id).collect();
    let incoming_ids: HashSet<MovieId> = incoming.iter().map(|r| r.id).collect();

    let mut report = MergeReport {
        existing: existing.len(),
        incoming: incoming.len(),
        replaced: incoming_ids.intersection(&existing_ids).count(),
        added: incoming_ids.difference(&existing_ids).count(),
        total: 0,
    };

    let combined = existing.into_iter().chain(incoming).collect::<Vec<_>>();
    let last_index: HashMap<MovieId, usize> = combined
        .iter()
        .enumerate()
        .map(|(idx, record)| (record.id, idx))
        .collect();

    let merged = combined
        .into_iter()
        .enumerate()
        .filter(|(idx, record)| last_index.get(&record.id) == Some(idx))
        .map(|(_, record)| record)
        .collect::<Vec<_>>();

    report.total = merged.len();
    (merged, report)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: DiscoveryWindow,
    pub discovered: usize,
    pub enriched: usize,
    pub detail_failures: usize,
    pub filter: FilterReport,
    pub merge: MergeReport,
    pub total_rows: usize,
    pub dataset_path: String,
    pub dataset_sha256: String,
    pub reports_dir: Option<String>,
}

impl SyncRunSummary {
    pub fn render_brief(&self) -> String {
        format!(
            "# boxtrack run brief\n\n- Run ID: `{}`\n- Source: {}\n- Started: {}\n- Finished: {}\n- Window: {} .. {}\n\n## Counts\n- Discovered: {}\n- Enriched: {}\n- Detail failures: {}\n- Filter input: {}\n- Dropped by quality filter: {}\n- Passed quality filter: {}\n- Replaced rows: {}\n- Added rows: {}\n- Total unique movies: {}\n\n## Dataset\n- Path: `{}`\n- sha256: `{}`\n",
            self.run_id,
            self.source_id,
            self.started_at,
            self.finished_at,
            self.window.start_param(),
            self.window.end_param(),
            self.discovered,
            self.enriched,
            self.detail_failures,
            self.filter.input,
            self.filter.dropped,
            self.filter.output,
            self.merge.replaced,
            self.merge.added,
            self.total_rows,
            self.dataset_path,
            self.dataset_sha256,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub written_at: DateTime<Utc>,
    pub dataset: String,
    pub rows: usize,
    pub bytes: u64,
    pub sha256: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn MovieSource>,
    store: DatasetStore,
    filter: QualityFilter,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Box<dyn MovieSource>) -> Self {
        let store = DatasetStore::new(config.dataset_path.clone());
        Self {
            config,
            source,
            store,
            filter: QualityFilter,
        }
    }

    /// Wire the live TMDB source. Fails before any client is built when the credential is absent.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let api_key = config.credential()?.to_string();
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let source = TmdbSource::new(
            http,
            TmdbConfig {
                api_key,
                api_base_url: config.api_base_url.clone(),
                image_base_url: config.image_base_url.clone(),
                language: config.language.clone(),
            },
        );
        Ok(Self::new(config, Box::new(source)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_once_at(Utc::now().date_naive()).await
    }

    pub async fn run_once_at(&self, today: NaiveDate) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let source_id = self.source.source_id();

        info!(%run_id, stage = %SyncStage::Init, source_id, "starting sync run");
        self.config.credential()?;
        let window = self.config.window(today)?;

        info!(
            %run_id,
            stage = %SyncStage::Discover,
            start = %window.start_param(),
            end = %window.end_param(),
            "discovering movies"
        );
        let candidates = self
            .source
            .discover(&window)
            .await
            .map_err(SyncError::Discovery)?;
        let discovered = candidates.len();

        info!(%run_id, stage = %SyncStage::Enrich, candidates = discovered, "fetching details");
        let mut pacer = Pacer::new(self.config.pacing);
        let mut details = Vec::with_capacity(discovered);
        let mut detail_failures = 0usize;
        for candidate in &candidates {
            pacer.wait().await;
            match self.source.fetch_detail(candidate.id).await {
                Ok(detail) => details.push(detail),
                Err(err) => {
                    detail_failures += 1;
                    warn!(%run_id, movie_id = candidate.id, error = %err, "detail fetch failed; keeping candidate without detail");
                }
            }
        }
        let enriched = details.len();

        info!(%run_id, stage = %SyncStage::Join, "joining candidates with details");
        let joined = left_join(candidates, details);

        let (filtered, filter_report) = self.filter.apply(joined);
        info!(
            %run_id,
            stage = %SyncStage::Filter,
            input = filter_report.input,
            dropped = filter_report.dropped,
            output = filter_report.output,
            "quality filter applied"
        );

        let existing = self.store.load().map_err(SyncError::Storage)?;
        match &existing {
            Some(rows) => info!(%run_id, stage = %SyncStage::LoadExisting, rows = rows.len(), path = %self.store.path().display(), "merging with existing dataset"),
            None => info!(%run_id, stage = %SyncStage::LoadExisting, path = %self.store.path().display(), "no existing dataset; creating it"),
        }

        let (merged, merge_report) = merge_with_report(existing, filtered.clone());
        info!(
            %run_id,
            stage = %SyncStage::Merge,
            replaced = merge_report.replaced,
            added = merge_report.added,
            total = merge_report.total,
            "merged incoming rows"
        );

        let stored = self.store.save(&merged).map_err(SyncError::Storage)?;
        info!(%run_id, stage = %SyncStage::Persist, rows = stored.rows, "dataset persisted");

        if let Err(err) = self.write_manifest(run_id, &stored).await {
            warn!(%run_id, error = %format!("{err:#}"), "failed to write dataset manifest");
        }

        let mut summary = SyncRunSummary {
            run_id,
            source_id: source_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            window,
            discovered,
            enriched,
            detail_failures,
            filter: filter_report,
            merge: merge_report,
            total_rows: stored.rows,
            dataset_path: stored.path.display().to_string(),
            dataset_sha256: stored.content_hash.clone(),
            reports_dir: None,
        };

        match self.write_reports(&summary, &filtered).await {
            Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
            Err(err) => warn!(%run_id, error = %format!("{err:#}"), "failed to write run reports"),
        }

        info!(%run_id, stage = %SyncStage::Done, total = summary.total_rows, "sync run complete");
        Ok(summary)
    }

    async fn write_manifest(&self, run_id: Uuid, stored: &StoredDataset) -> Result<PathBuf> {
        let manifest = DatasetManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id,
            written_at: Utc::now(),
            dataset: stored.path.display().to_string(),
            rows: stored.rows,
            bytes: stored.byte_size as u64,
            sha256: stored.content_hash.clone(),
        };
        let manifest_path = self.config.manifest_path();
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing dataset manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }

    async fn write_reports(
        &self,
        summary: &SyncRunSummary,
        incoming: &[MovieRecord],
    ) -> Result<PathBuf> {
        let run_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        fs::write(run_dir.join("run_brief.md"), summary.render_brief())
            .await
            .context("writing run_brief.md")?;

        let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
            "summary": summary,
            "incoming": incoming,
        }))
        .context("serializing run delta")?;
        fs::write(run_dir.join("run_delta.json"), delta_json)
            .await
            .context("writing run_delta.json")?;

        Ok(run_dir)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env())?;
    pipeline.run_once().await
}

/// Register the pipeline on the configured cron expressions. Overlapping ticks are skipped.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let crons = std::iter::once(pipeline.config().sync_cron_1.clone())
        .chain(pipeline.config().sync_cron_2.clone())
        .collect::<Vec<_>>();

    for cron in &crons {
        let pipeline = Arc::clone(&pipeline);
        let running = Arc::clone(&running);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let running = Arc::clone(&running);
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("previous sync run still in progress; skipping scheduled tick");
                    return;
                };
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        total = summary.total_rows,
                        "scheduled sync complete"
                    ),
                    Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Markdown digest of the most recent run reports, newest first.
///
/// A reports directory that does not exist yet yields a digest with no runs.
pub fn report_recent_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let dir = match std::fs::read_dir(reports_root) {
        Ok(dir) => Some(dir),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", reports_root.display()))
        }
    };
    let mut entries = dir
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let delta_path = entry.path().join("run_delta.json");
            let text = std::fs::read_to_string(&delta_path).ok()?;
            let delta: RunDelta = serde_json::from_str(&text).ok()?;
            Some((delta.summary, entry.path()))
        })
        .collect::<Vec<_>>();
    entries.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# boxtrack recent runs".to_string(), String::new()];
    if entries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
        lines.push(String::new());
    }
    for (summary, dir) in entries.into_iter().take(runs) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- window: {} .. {}",
            summary.window.start_param(),
            summary.window.end_param()
        ));
        lines.push(format!(
            "- discovered: {} (enriched {}, detail failures {})",
            summary.discovered, summary.enriched, summary.detail_failures
        ));
        lines.push(format!(
            "- quality filter: {} in, {} dropped, {} kept",
            summary.filter.input, summary.filter.dropped, summary.filter.output
        ));
        lines.push(format!(
            "- merge: {} replaced, {} added",
            summary.merge.replaced, summary.merge.added
        ));
        lines.push(format!("- total unique movies: {}", summary.total_rows));
        let brief_path = dir.join("run_brief.md");
        if brief_path.exists() {
            lines.push(format!("- brief: `{}`", brief_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[derive(Debug, Deserialize)]
struct RunDelta {
    summary: SyncRunSummary,
}
