//! Sync run orchestration: listing walk, detail retrieval, reconciliation and
//! sink writes, plus the run report.

mod reconcile;
mod sink;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use civilview_core::{ListingStub, PropertyIdentifier, PropertyRecord};
use civilview_portal::{DetailFetcher, ListingFetcher, ParsedProperty, PortalConfig};
use civilview_storage::{BackoffPolicy, CacheStore, HttpClientConfig, HttpFetcher, PageSource};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use reconcile::{
    reconcile, Observation, ReconcileAction, Reconciliation, RecordPatch,
};
pub use sink::{
    AirtableConfig, AirtableSink, MemorySink, RecordSink, SinkError, SinkWrite, AIRTABLE_API_ROOT,
};

pub const CRATE_NAME: &str = "civilview-sync";

pub const DEFAULT_AIRTABLE_BASE_ID: &str = "appBbpDBlH7vjRYF3";
pub const DEFAULT_AIRTABLE_TABLE_ID: &str = "tblhFcS1EPGZNi5di";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub airtable_api_key: Option<String>,
    pub airtable_base_id: String,
    pub airtable_table_id: String,
    pub search_url: String,
    pub base_url: String,
    pub city_filter: Option<String>,
    pub cache_dir: PathBuf,
    pub cache_ttl: Duration,
    pub max_pages: u32,
    /// Detail pages fetched concurrently per listing page, 1 to 4.
    pub concurrency: usize,
    pub request_interval: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub reports_dir: PathBuf,
    pub log_file: PathBuf,
    pub structural_min_sample: usize,
    pub structural_max_ratio: f64,
}

fn parsed_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable setting");
                default
            }
        },
        None => default,
    }
}

/// Scheme and host of `url`, e.g. `https://salesweb.civilview.com`.
fn origin_of(url: &str) -> String {
    let after_scheme = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[after_scheme..].find('/') {
        Some(i) => url[..after_scheme + i].to_string(),
        None => url.to_string(),
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let search_url = lookup("CIVILVIEW_SEARCH_URL")
            .unwrap_or_else(|| civilview_portal::DEFAULT_SEARCH_URL.to_string());
        let city_filter = match lookup("CIVILVIEW_CITY") {
            Some(city) if city.trim().is_empty() => None,
            Some(city) => Some(city.trim().to_string()),
            None => Some("JERSEY CITY".to_string()),
        };
        Self {
            airtable_api_key: lookup("AIRTABLE_API_KEY").filter(|k| !k.trim().is_empty()),
            airtable_base_id: lookup("AIRTABLE_BASE_ID")
                .unwrap_or_else(|| DEFAULT_AIRTABLE_BASE_ID.to_string()),
            airtable_table_id: lookup("AIRTABLE_TABLE_ID")
                .unwrap_or_else(|| DEFAULT_AIRTABLE_TABLE_ID.to_string()),
            base_url: origin_of(&search_url),
            search_url,
            city_filter,
            cache_dir: lookup("CIVILVIEW_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("property_details_cache")),
            cache_ttl: Duration::from_secs(parsed_or(&lookup, "CIVILVIEW_CACHE_TTL_SECS", 86_400)),
            max_pages: parsed_or(&lookup, "CIVILVIEW_MAX_PAGES", 50),
            concurrency: parsed_or(&lookup, "CIVILVIEW_CONCURRENCY", 3usize).clamp(1, 4),
            request_interval: Duration::from_millis(parsed_or(
                &lookup,
                "CIVILVIEW_REQUEST_INTERVAL_MS",
                500,
            )),
            http_timeout: Duration::from_secs(parsed_or(&lookup, "CIVILVIEW_HTTP_TIMEOUT_SECS", 20)),
            user_agent: lookup("CIVILVIEW_USER_AGENT")
                .unwrap_or_else(|| format!("civilview-sync/{}", env!("CARGO_PKG_VERSION"))),
            reports_dir: lookup("CIVILVIEW_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("reports")),
            log_file: lookup("CIVILVIEW_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("property_scraper.log")),
            structural_min_sample: 10,
            structural_max_ratio: 0.5,
        }
    }

    pub fn portal_config(&self) -> PortalConfig {
        PortalConfig {
            base_url: self.base_url.clone(),
            search_url: self.search_url.clone(),
            city_filter: self.city_filter.clone(),
            max_pages: self.max_pages,
            ..PortalConfig::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            max_in_flight: self.concurrency,
            min_request_interval: self.request_interval,
            ..HttpClientConfig::default()
        }
    }

    pub fn cache_store(&self) -> CacheStore {
        CacheStore::with_ttl(self.cache_dir.clone(), self.cache_ttl)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Degraded,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Degraded => "degraded",
            RunOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Fetch,
    Structural,
    History,
    Sink,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertyFailure {
    pub identifier: PropertyIdentifier,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub pages: usize,
    pub listings: usize,
    pub cache_evicted: usize,
    pub details_attempted: usize,
    pub cache_hits: usize,
    pub fetched_live: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub fields_retained: usize,
    pub fetch_failures: usize,
    pub structural_failures: usize,
    pub history_failures: usize,
    pub sink_failures: usize,
}

impl RunCounters {
    fn failed_properties(&self) -> usize {
        self.fetch_failures + self.structural_failures + self.history_failures + self.sink_failures
    }

    fn structural_ratio(&self) -> f64 {
        if self.details_attempted == 0 {
            0.0
        } else {
            self.structural_failures as f64 / self.details_attempted as f64
        }
    }
}

/// Per-run state threaded through the pipeline.
#[derive(Debug)]
struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    counters: RunCounters,
    failures: Vec<PropertyFailure>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            counters: RunCounters::default(),
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, identifier: &PropertyIdentifier, kind: FailureKind, reason: String) {
        match kind {
            FailureKind::Fetch => self.counters.fetch_failures += 1,
            FailureKind::Structural => self.counters.structural_failures += 1,
            FailureKind::History => self.counters.history_failures += 1,
            FailureKind::Sink => self.counters.sink_failures += 1,
        }
        warn!(%identifier, ?kind, %reason, "property skipped");
        self.failures.push(PropertyFailure {
            identifier: identifier.clone(),
            kind,
            reason,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub abort_reason: Option<String>,
    pub counters: RunCounters,
    pub failures: Vec<PropertyFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub abort_reason: Option<String>,
    pub counters: RunCounters,
    pub failures: Vec<PropertyFailure>,
    pub report_path: PathBuf,
}

pub struct SyncPipeline {
    config: SyncConfig,
    listings: ListingFetcher,
    details: DetailFetcher,
    sink: Arc<dyn RecordSink>,
    sink_backoff: BackoffPolicy,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, sink: Arc<dyn RecordSink>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::with_source(config, Arc::new(http), sink))
    }

    /// Builds a pipeline over any page source, e.g. a browser renderer.
    pub fn with_source(
        config: SyncConfig,
        source: Arc<dyn PageSource>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            listings: ListingFetcher::new(source.clone(), config.portal_config()),
            details: DetailFetcher::new(source, config.cache_store()),
            config,
            sink,
            sink_backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_sink_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.sink_backoff = backoff;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let mut ctx = RunContext::new();
        let span = info_span!("sync_run", run_id = %ctx.run_id);

        let abort_reason = async {
            info!(search_url = %self.config.search_url, "sync run starting");
            match self.details.cache().evict_expired().await {
                Ok(n) => ctx.counters.cache_evicted = n,
                Err(err) => warn!(error = %err, "cache eviction failed; continuing"),
            }
            self.walk(&mut ctx).await
        }
        .instrument(span)
        .await;

        let outcome = if abort_reason.is_some() {
            RunOutcome::Failed
        } else if ctx.counters.failed_properties() > 0 {
            RunOutcome::Degraded
        } else {
            RunOutcome::Success
        };

        let report = RunReport {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            outcome,
            abort_reason,
            counters: ctx.counters,
            failures: ctx.failures,
        };
        let report_path = self.write_report(&report).await?;
        info!(
            run_id = %report.run_id,
            ?outcome,
            created = report.counters.created,
            updated = report.counters.updated,
            unchanged = report.counters.unchanged,
            failed = report.failures.len(),
            "sync run finished"
        );

        Ok(SyncRunSummary {
            run_id: report.run_id,
            started_at: report.started_at,
            finished_at: report.finished_at,
            outcome: report.outcome,
            abort_reason: report.abort_reason,
            counters: report.counters,
            failures: report.failures,
            report_path,
        })
    }

    /// Returns the abort reason when the run cannot complete.
    async fn walk(&self, ctx: &mut RunContext) -> Option<String> {
        let mut pages = self.listings.fetch_current_listings();
        loop {
            let stubs = match pages.next_page().await {
                Ok(Some(stubs)) => stubs,
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "listing walk aborted");
                    return Some(err.to_string());
                }
            };
            ctx.counters.pages += 1;
            ctx.counters.listings += stubs.len();
            self.process_page(ctx, &stubs).await;

            if ctx.counters.details_attempted >= self.config.structural_min_sample {
                if let Some(reason) = self.structural_abort(&ctx.counters) {
                    return Some(reason);
                }
            }
        }
        self.structural_abort(&ctx.counters)
    }

    fn structural_abort(&self, counters: &RunCounters) -> Option<String> {
        let ratio = counters.structural_ratio();
        if ratio <= self.config.structural_max_ratio {
            return None;
        }
        let reason = format!(
            "{} of {} detail pages failed structural parsing; the portal layout has likely changed",
            counters.structural_failures, counters.details_attempted
        );
        error!(ratio, %reason, "structural failure threshold crossed");
        Some(reason)
    }

    async fn process_page(&self, ctx: &mut RunContext, stubs: &[ListingStub]) {
        let results = stream::iter(
            stubs
                .iter()
                .map(|stub| async move { (stub, self.details.fetch_and_parse(stub).await) }),
        )
        .buffered(self.config.concurrency.clamp(1, 4))
        .collect::<Vec<_>>()
        .await;

        for (stub, result) in results {
            ctx.counters.details_attempted += 1;
            match result {
                Ok(parsed) => {
                    if parsed.from_cache {
                        ctx.counters.cache_hits += 1;
                    } else {
                        ctx.counters.fetched_live += 1;
                    }
                    self.apply(ctx, parsed).await;
                }
                Err(err) if err.is_structural() => {
                    ctx.fail(&stub.identifier, FailureKind::Structural, err.to_string());
                }
                Err(err) => ctx.fail(&stub.identifier, FailureKind::Fetch, err.to_string()),
            }
        }
    }

    async fn apply(&self, ctx: &mut RunContext, parsed: ParsedProperty) {
        let identifier = parsed.record.sheriff_number.clone();
        let prior = match self
            .sink_backoff
            .retry(
                |_| self.sink.find_by_identifier(&identifier),
                SinkError::is_retryable,
            )
            .await
        {
            Ok(prior) => prior,
            Err(err) => return ctx.fail(&identifier, FailureKind::Sink, err.to_string()),
        };

        let observation = Observation::now(parsed.portal_status);
        let outcome = match reconcile(parsed.record, prior.as_ref(), &observation) {
            Ok(outcome) => outcome,
            Err(err) => return ctx.fail(&identifier, FailureKind::History, err.to_string()),
        };
        ctx.counters.fields_retained += outcome.retained.len();

        let written = match (outcome.action, outcome.patch()) {
            (ReconcileAction::Noop, _) => {
                debug!(%identifier, "unchanged");
                ctx.counters.unchanged += 1;
                return;
            }
            (ReconcileAction::Create, _) => {
                self.sink_backoff
                    .retry(
                        |attempt| self.create_once(&outcome.record, attempt),
                        SinkError::is_retryable,
                    )
                    .await
            }
            (ReconcileAction::Update, Some(patch)) => {
                self.sink_backoff
                    .retry(
                        |_| self.sink.update(&identifier, &patch),
                        SinkError::is_retryable,
                    )
                    .await
            }
            (ReconcileAction::Update, None) => Ok(()),
        };

        match written {
            Ok(()) if outcome.action == ReconcileAction::Create => {
                info!(%identifier, "created");
                ctx.counters.created += 1;
            }
            Ok(()) => {
                let fields = outcome
                    .changes
                    .iter()
                    .map(|c| c.field.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                info!(%identifier, %fields, "updated");
                ctx.counters.updated += 1;
            }
            Err(err) => ctx.fail(&identifier, FailureKind::Sink, err.to_string()),
        }
    }

    /// A failed create may still have landed, e.g. when only the response was
    /// lost. Retries look the identifier up first and never post a second row.
    async fn create_once(&self, record: &PropertyRecord, attempt: usize) -> Result<(), SinkError> {
        if attempt > 0
            && self
                .sink
                .find_by_identifier(&record.sheriff_number)
                .await?
                .is_some()
        {
            warn!(identifier = %record.sheriff_number, "earlier create attempt landed; not repeating it");
            return Ok(());
        }
        self.sink.create(record).await
    }

    async fn write_report(&self, report: &RunReport) -> Result<PathBuf> {
        let dir = self.config.reports_dir.join(report.run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("run_report.json");
        let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// Builds the sink the config asks for and runs one sync.
pub async fn run_sync_once(config: SyncConfig, dry_run: bool) -> Result<SyncRunSummary> {
    let sink: Arc<dyn RecordSink> = if dry_run {
        info!("dry run: writes go to an in-memory sink");
        Arc::new(MemorySink::new())
    } else {
        let api_key = config
            .airtable_api_key
            .clone()
            .context("AIRTABLE_API_KEY is required unless --dry-run is given")?;
        Arc::new(AirtableSink::new(AirtableConfig::new(
            api_key,
            config.airtable_base_id.clone(),
            config.airtable_table_id.clone(),
        ))?)
    };
    SyncPipeline::new(config, sink)?.run_once().await
}
