use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument as _;
use url::Url;

use crate::app::pool::WorkerPool;
use crate::app::store::Store;
use crate::audit::{Actor, AuditEntry, AuditSink};
use crate::config::Settings;
use crate::dedup::{self, Admission};
use crate::discover::{self, Candidate, Discovery};
use crate::error::{FetchError, IngestError};
use crate::extract::{self, ExtractStage, Extracted, StageObserver, TracingObserver};
use crate::fetch::{self, Fetched, Fetcher, HostThrottle};
use crate::gate::{PushCounters, PushGate};
use crate::model::{Document, RunStats, Source, SourceKind, TransportHint};
use crate::notify::{Notifier, PushMessage};
use crate::text::char_len;

/// Where a source is within one run.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourcePhase {
    Idle,
    Fetching,
    Extracting,
    Filtering,
    Gating,
    Done,
    Errored,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceReport {
    pub source_id: String,
    pub name: String,
    pub phase: SourcePhase,
    pub stats: RunStats,
    pub last_error: Option<String>,
    pub is_active: bool,
    pub needs_review: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: RunStats,
    pub sources: Vec<SourceReport>,
}

impl RunReport {
    /// Some sources failed while others made progress.
    pub fn is_partial(&self) -> bool {
        let errored = self
            .sources
            .iter()
            .filter(|s| s.phase == SourcePhase::Errored || s.stats.errors > 0)
            .count();
        errored > 0 && errored < self.sources.len()
    }
}

/// What stop-loss did to a source after its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopLoss {
    Clean,
    PendingReview,
    Disabled,
}

/// Quarantines failing sources and flags silent ones.
pub fn apply_stop_loss(
    source: &mut Source,
    stats: &RunStats,
    last_error: Option<&IngestError>,
    zero_fetch_disable_after: Option<u32>,
    now: DateTime<Utc>,
) -> StopLoss {
    if stats.errors > 0 {
        source.is_active = false;
        let line = match last_error {
            Some(err) => err.last_error_line(now),
            None => format!(
                "errors={} at={}",
                stats.errors,
                now.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
        };
        source.last_error = Some(format!("AutoDisabled:{line}"));
        return StopLoss::Disabled;
    }

    if stats.fetched == 0 {
        source.needs_review = true;
        source.zero_fetch_streak += 1;
        let streak = source.zero_fetch_streak;
        if let Some(limit) = zero_fetch_disable_after
            && streak >= limit
        {
            source.is_active = false;
            source.last_error = Some(format!("AutoDisabled:ZeroFetch streak={streak}"));
            return StopLoss::Disabled;
        }
        source.last_error = Some(format!(
            "PendingReview:NoCandidates streak={streak} at={}",
            now.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        return StopLoss::PendingReview;
    }

    source.last_error = None;
    source.needs_review = false;
    source.zero_fetch_streak = 0;
    StopLoss::Clean
}

/// Everything a source worker produced before gating.
#[derive(Debug)]
struct Harvest {
    source: Source,
    phase: SourcePhase,
    stats: RunStats,
    accepted: Vec<Document>,
    last_error: Option<IngestError>,
    budget_exceeded: bool,
}

impl Harvest {
    fn new(source: Source) -> Self {
        Self {
            source,
            phase: SourcePhase::Idle,
            stats: RunStats::default(),
            accepted: Vec::new(),
            last_error: None,
            budget_exceeded: false,
        }
    }

    fn enter(&mut self, phase: SourcePhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "phase");
        self.phase = phase;
    }

    /// Counts an error; repeated budget overruns count once.
    fn record(&mut self, err: IngestError) {
        if err.is_budget_exceeded() {
            if self.budget_exceeded {
                return;
            }
            self.budget_exceeded = true;
        }
        tracing::warn!(tag = %err.tag(), error = ?err, "ingest error");
        self.stats.errors += 1;
        self.last_error = Some(err);
    }
}

/// Shared by every worker of one run.
struct RunContext {
    fetcher: Fetcher,
    throttle: HostThrottle,
    pool: WorkerPool,
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    observer: Arc<dyn StageObserver>,
    request_timeout: std::time::Duration,
    source_budget: std::time::Duration,
    min_content_chars: usize,
    freshness_window: chrono::Duration,
}

impl RunContext {
    /// Waits for the host's turn first; the connection permit covers the request only.
    async fn fetch(
        &self,
        url: &Url,
        transport: TransportHint,
        deadline: Instant,
    ) -> anyhow::Result<Result<Fetched, FetchError>> {
        if let Err(err) = self.throttle.wait_turn(url, deadline).await {
            return Ok(Err(err));
        }
        let _permit = self.pool.fetch_permit().await?;
        Ok(self
            .fetcher
            .fetch(url, transport, self.request_timeout, deadline)
            .await)
    }

    /// Persists an admitted document and records the admission.
    async fn persist_admitted(
        &self,
        doc: &Document,
        action: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if !self
            .store
            .insert_if_absent(doc)
            .await
            .with_context(|| format!("store document {}", doc.id))?
        {
            return Ok(false);
        }
        let entry = AuditEntry::new(&Actor::DEDUP, action, now)
            .source(&doc.source_id)
            .document(&doc.id)
            .after(serde_json::json!({
                "id": doc.id,
                "canonical_url": doc.canonical_url,
                "status": doc.status,
                "skip_reason": doc.skip_reason,
            }));
        self.audit
            .record(entry)
            .await
            .with_context(|| format!("record admission of {}", doc.id))?;
        Ok(true)
    }
}

pub struct Orchestrator {
    settings: Settings,
    fetcher: Fetcher,
    store: Arc<dyn Store>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    observer: Arc<dyn StageObserver>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        store: Arc<dyn Store>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            settings,
            fetcher: Fetcher::new()?,
            store,
            audit,
            notifier,
            observer: Arc::new(TracingObserver),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Runs every due source once.
    pub async fn run_once(&self, now: DateTime<Utc>) -> anyhow::Result<RunReport> {
        let mut due: Vec<Source> = self
            .store
            .list_sources()
            .await
            .context("list sources")?
            .into_iter()
            .filter(|source| source.is_due(now))
            .collect();
        due.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        tracing::info!(due = due.len(), "run start");

        let ctx = Arc::new(RunContext {
            fetcher: self.fetcher.clone(),
            throttle: HostThrottle::new(self.settings.host_interval()),
            pool: WorkerPool::new(self.settings.concurrency),
            store: Arc::clone(&self.store),
            audit: Arc::clone(&self.audit),
            observer: Arc::clone(&self.observer),
            request_timeout: self.settings.request_timeout(),
            source_budget: self.settings.source_budget(),
            min_content_chars: self.settings.min_content_chars,
            freshness_window: self.settings.freshness_window(),
        });

        let mut workers = JoinSet::new();
        for (order, source) in due.into_iter().enumerate() {
            let ctx = Arc::clone(&ctx);
            let span = tracing::info_span!("source", id = %source.id, name = %source.name);
            ctx.pool.clone().spawn(
                &mut workers,
                async move {
                    let harvest = harvest_source(&ctx, source, now).await?;
                    Ok((order, harvest))
                }
                .instrument(span),
            );
        }

        let mut harvests = Vec::new();
        while let Some(joined) = workers.join_next().await {
            harvests.push(joined.context("join source worker")??);
        }
        harvests.sort_by_key(|(order, _)| *order);

        let limits = self.settings.gate_limits();
        let gate = PushGate::new(
            limits,
            Arc::new(PushCounters::new(&limits)),
            Arc::clone(&self.audit),
        );

        let mut report = RunReport {
            started_at: now,
            finished_at: now,
            totals: RunStats::default(),
            sources: Vec::new(),
        };
        for (_, harvest) in harvests {
            let span = tracing::info_span!("source", id = %harvest.source.id);
            let source_report = self.finish_source(&gate, harvest, now).instrument(span).await?;
            report.totals.absorb(&source_report.stats);
            report.sources.push(source_report);
        }
        report.finished_at = Utc::now();

        tracing::info!(
            sources = report.sources.len(),
            fetched = report.totals.fetched,
            upserted = report.totals.upserted,
            pushed = report.totals.pushed,
            errors = report.totals.errors,
            "run done"
        );
        Ok(report)
    }

    /// Gating, delivery, stop-loss, and the single write of the source row.
    async fn finish_source(
        &self,
        gate: &PushGate,
        mut harvest: Harvest,
        now: DateTime<Utc>,
    ) -> anyhow::Result<SourceReport> {
        let source_id = harvest.source.id.clone();
        let max_attempts = self.settings.max_push_attempts;

        if harvest.phase != SourcePhase::Errored {
            harvest.enter(SourcePhase::Gating);
        }

        let since = now - self.settings.gate_limits().window;
        let pushed_before = self
            .store
            .push_times_since(&source_id, since)
            .await
            .context("read push history")?;
        gate.counters().seed_source(&source_id, pushed_before);

        let mut eligible = self
            .store
            .retry_candidates(&source_id, max_attempts)
            .await
            .context("read push retries")?;
        let new_count = harvest.accepted.len();
        eligible.append(&mut harvest.accepted);

        let outcome = gate
            .gate(eligible, &harvest.source, new_count, now)
            .await
            .context("gate documents")?;
        for doc in &outcome.skipped {
            self.store.put_document(doc).await?;
        }
        harvest.stats.skipped_by_limit += outcome.skipped.len() as u32;

        for mut doc in outcome.to_push {
            let message = PushMessage::new(&harvest.source, &doc);
            match self.notifier.push(&message).await {
                Ok(()) => {
                    doc.pushed_at = Some(now);
                    harvest.stats.pushed += 1;
                }
                Err(err) => {
                    doc.push_attempts += 1;
                    let failure = IngestError::PushFailure {
                        document_id: doc.id.clone(),
                        reason: format!("{err:#}"),
                    };
                    tracing::warn!(
                        document_id = %doc.id,
                        attempts = doc.push_attempts,
                        max_attempts,
                        error = %failure.last_error_line(now),
                        "push failed"
                    );
                    let entry = AuditEntry::new(&Actor::PUSH_GATE, "push_failed", now)
                        .source(&source_id)
                        .document(&doc.id)
                        .important(true)
                        .after(serde_json::json!({
                            "push_attempts": doc.push_attempts,
                            "error": format!("{err:#}"),
                        }));
                    self.audit
                        .record(entry)
                        .await
                        .context("record push failure")?;
                }
            }
            self.store.put_document(&doc).await?;
        }

        let mut source = harvest.source;
        let was_active = source.is_active;
        let verdict = apply_stop_loss(
            &mut source,
            &harvest.stats,
            harvest.last_error.as_ref(),
            self.settings.zero_fetch_disable_after,
            now,
        );
        if verdict == StopLoss::Disabled && was_active {
            tracing::warn!(last_error = ?source.last_error, "source auto-disabled");
            let entry = AuditEntry::new(&Actor::ORCHESTRATOR, "source:auto_disable", now)
                .source(&source.id)
                .important(true)
                .before(serde_json::json!({ "is_active": true }))
                .after(serde_json::json!({
                    "is_active": false,
                    "last_error": source.last_error,
                }));
            self.audit
                .record(entry)
                .await
                .context("record auto-disable")?;
        }
        source.last_fetched_at = Some(now);
        source.last_run = Some(harvest.stats);
        self.store
            .save_source(&source)
            .await
            .with_context(|| format!("save source {}", source.id))?;

        let phase = match harvest.phase {
            SourcePhase::Errored => SourcePhase::Errored,
            _ => SourcePhase::Done,
        };
        tracing::info!(?phase, stats = ?harvest.stats, ?verdict, "source done");

        Ok(SourceReport {
            source_id: source.id,
            name: source.name,
            phase,
            stats: harvest.stats,
            last_error: source.last_error,
            is_active: source.is_active,
            needs_review: source.needs_review,
        })
    }
}

/// Listing fetch, discovery, detail fetches, extraction and admission for one source.
async fn harvest_source(
    ctx: &Arc<RunContext>,
    source: Source,
    now: DateTime<Utc>,
) -> anyhow::Result<Harvest> {
    let deadline = Instant::now() + ctx.source_budget;
    let mut harvest = Harvest::new(source);

    harvest.enter(SourcePhase::Fetching);
    let discovery = match discover_candidates(ctx, &harvest.source, deadline).await? {
        Ok(discovery) => discovery,
        Err(err) => {
            harvest.record(err);
            harvest.enter(SourcePhase::Errored);
            return Ok(harvest);
        }
    };
    harvest.stats.fetched = discovery.candidates.len() as u32;

    let mut known = ctx
        .store
        .canonical_urls(&harvest.source.id)
        .await
        .context("read known documents")?;

    harvest.enter(SourcePhase::Extracting);
    let results = extract_candidates(ctx, &harvest.source, discovery.candidates, &known, deadline)
        .await?;

    harvest.enter(SourcePhase::Filtering);
    for (candidate, result) in results {
        let extracted = match result {
            CandidateResult::Known => {
                harvest.stats.dedup_skipped += 1;
                continue;
            }
            CandidateResult::Failed(err) => {
                harvest.record(err);
                continue;
            }
            CandidateResult::Extracted(extracted) => extracted,
        };

        match dedup::admit(
            &candidate,
            extracted,
            &harvest.source,
            &mut known,
            ctx.freshness_window,
            now,
        ) {
            Admission::DuplicateSkip { canonical_url } => {
                tracing::debug!(%canonical_url, "duplicate");
                harvest.stats.dedup_skipped += 1;
            }
            Admission::TooOldSkip(doc) => {
                harvest.stats.skipped_too_old += 1;
                if ctx.persist_admitted(&doc, "admit:too_old", now).await? {
                    harvest.stats.upserted += 1;
                }
            }
            Admission::Accepted(doc) => {
                if ctx.persist_admitted(&doc, "admit", now).await? {
                    harvest.stats.upserted += 1;
                    harvest.accepted.push(doc);
                } else {
                    harvest.stats.dedup_skipped += 1;
                }
            }
        }
    }

    Ok(harvest)
}

/// Fetches every listing URL and merges what they link to.
///
/// The outer error is infrastructure; the inner one is the source's own failure.
async fn discover_candidates(
    ctx: &Arc<RunContext>,
    source: &Source,
    deadline: Instant,
) -> anyhow::Result<Result<Discovery, IngestError>> {
    let mut merged = Discovery::default();
    for raw in source.listing_urls() {
        let url = match Url::parse(raw.trim()) {
            Ok(url) => url,
            Err(err) => {
                return Ok(Err(IngestError::Parse {
                    url: raw,
                    reason: format!("listing url: {err}"),
                }));
            }
        };

        let fetched = match ctx.fetch(&url, source.crawl.transport, deadline).await? {
            Ok(fetched) => fetched,
            Err(err) => return Ok(Err(err.into())),
        };

        let discovery = match discover::discover(&fetched.body, &fetched.final_url, source) {
            Ok(discovery) => discovery,
            Err(err) => return Ok(Err(err)),
        };
        if source.kind == SourceKind::Html
            && let Some(err) = fetch::classify_listing(
                url.as_str(),
                &fetched.body,
                discovery.anchors_seen,
                source.crawl.requires_js,
            )
        {
            return Ok(Err(err.into()));
        }
        tracing::debug!(
            url = %url,
            anchors = discovery.anchors_seen,
            candidates = discovery.candidates.len(),
            "listing"
        );
        merged.merge(discovery);
    }
    Ok(Ok(merged))
}

#[derive(Debug)]
enum CandidateResult {
    Known,
    Extracted(Extracted),
    Failed(IngestError),
}

/// Detail fetches run in parallel; results come back in listing order.
async fn extract_candidates(
    ctx: &Arc<RunContext>,
    source: &Source,
    candidates: Vec<Candidate>,
    known: &HashSet<String>,
    deadline: Instant,
) -> anyhow::Result<Vec<(Candidate, CandidateResult)>> {
    let mut slots: Vec<Option<CandidateResult>> = Vec::with_capacity(candidates.len());
    let mut tasks = JoinSet::new();

    for (index, candidate) in candidates.iter().enumerate() {
        if dedup::is_known(&candidate.url, source, known) {
            slots.push(Some(CandidateResult::Known));
            continue;
        }
        if let Some(body) = &candidate.body_hint
            && char_len(body) >= ctx.min_content_chars
        {
            slots.push(Some(CandidateResult::Extracted(Extracted {
                title: candidate.title_hint.clone(),
                published_at: candidate.published_hint,
                body: body.clone(),
                attachments: Vec::new(),
                stage: ExtractStage::Feed,
            })));
            continue;
        }

        slots.push(None);
        let ctx = Arc::clone(ctx);
        let url = candidate.url.clone();
        let transport = source.crawl.transport;
        let crawl = source.crawl.clone();
        tasks.spawn(
            async move {
                let fetched = match ctx.fetch(&url, transport, deadline).await? {
                    Ok(fetched) => fetched,
                    Err(err) => return Ok((index, CandidateResult::Failed(err.into()))),
                };

                let observer = Arc::clone(&ctx.observer);
                let min_chars = ctx.min_content_chars;
                let result = tokio::task::spawn_blocking(move || {
                    extract::extract(&fetched.body, &url, &crawl, min_chars, observer.as_ref())
                        .map_err(|err| IngestError::extract(url.as_str(), err))
                })
                .await
                .context("join extraction task")?;

                let result = match result {
                    Ok(extracted) => CandidateResult::Extracted(extracted),
                    Err(err) => CandidateResult::Failed(err),
                };
                Ok::<_, anyhow::Error>((index, result))
            }
            .in_current_span(),
        );
    }

    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.context("join detail task")??;
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(result);
        }
    }

    Ok(candidates
        .into_iter()
        .zip(slots)
        .map(|(candidate, slot)| {
            let result = slot.unwrap_or_else(|| {
                CandidateResult::Failed(IngestError::Fetch(FetchError::BudgetExceeded {
                    url: candidate.url.to_string(),
                }))
            });
            (candidate, result)
        })
        .collect())
}
