use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{RunStats, Source, SourceKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceHealth {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub is_active: bool,
    pub needs_review: bool,
    pub priority: i32,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Classification of `last_error`, e.g. `AutoDisabled:TimeoutError`.
    pub error_tag: Option<String>,
    pub last_run: Option<RunStats>,
}

impl SourceHealth {
    fn from_source(source: &Source) -> Self {
        Self {
            id: source.id.clone(),
            name: source.name.clone(),
            kind: source.kind,
            is_active: source.is_active,
            needs_review: source.needs_review,
            priority: source.priority,
            last_fetched_at: source.last_fetched_at,
            last_error: source.last_error.clone(),
            error_tag: source.last_error.as_deref().map(error_tag),
            last_run: source.last_run,
        }
    }

    fn last_run_errors(&self) -> u32 {
        self.last_run.map(|stats| stats.errors).unwrap_or(0)
    }

    fn is_erroring(&self) -> bool {
        self.last_run_errors() > 0
            || self
                .last_error
                .as_deref()
                .is_some_and(|e| e.starts_with("AutoDisabled:"))
    }
}

/// `last_error` up to its context fields.
pub fn error_tag(last_error: &str) -> String {
    last_error
        .split(" url=")
        .next()
        .unwrap_or(last_error)
        .split(" at=")
        .next()
        .unwrap_or(last_error)
        .to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSummary {
    pub generated_at: DateTime<Utc>,
    pub sources_total: usize,
    pub active: usize,
    pub disabled: usize,
    pub needs_review: usize,
    /// Sum of every source's last-run statistics.
    pub last_run_totals: RunStats,
    pub top_erroring: Vec<SourceHealth>,
    pub sources: Vec<SourceHealth>,
}

impl HealthSummary {
    pub fn build(sources: &[Source], top_n: usize, now: DateTime<Utc>) -> Self {
        let mut rows: Vec<SourceHealth> = sources.iter().map(SourceHealth::from_source).collect();
        rows.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        let mut totals = RunStats::default();
        for stats in rows.iter().filter_map(|row| row.last_run.as_ref()) {
            totals.absorb(stats);
        }

        let mut erroring: Vec<SourceHealth> =
            rows.iter().filter(|row| row.is_erroring()).cloned().collect();
        erroring.sort_by(|a, b| {
            b.last_run_errors()
                .cmp(&a.last_run_errors())
                .then_with(|| a.is_active.cmp(&b.is_active))
                .then_with(|| b.last_fetched_at.cmp(&a.last_fetched_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        erroring.truncate(top_n);

        Self {
            generated_at: now,
            sources_total: rows.len(),
            active: rows.iter().filter(|row| row.is_active).count(),
            disabled: rows.iter().filter(|row| !row.is_active).count(),
            needs_review: rows.iter().filter(|row| row.needs_review).count(),
            last_run_totals: totals,
            top_erroring: erroring,
            sources: rows,
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let t = &self.last_run_totals;
        let _ = writeln!(
            out,
            "sources: {} ({} active, {} disabled, {} need review)",
            self.sources_total, self.active, self.disabled, self.needs_review
        );
        let _ = writeln!(
            out,
            "last runs: fetched={} upserted={} pushed={} dedup={} too_old={} limited={} errors={}",
            t.fetched,
            t.upserted,
            t.pushed,
            t.dedup_skipped,
            t.skipped_too_old,
            t.skipped_by_limit,
            t.errors
        );
        if self.top_erroring.is_empty() {
            out.push_str("no erroring sources\n");
            return out;
        }
        out.push_str("top erroring sources:\n");
        for row in &self.top_erroring {
            let fetched = row
                .last_fetched_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_else(|| "never".to_owned());
            let _ = writeln!(
                out,
                "  {} {} errors={} active={} last={} {}",
                row.id,
                row.name,
                row.last_run_errors(),
                row.is_active,
                fetched,
                row.error_tag.as_deref().unwrap_or("-")
            );
        }
        out
    }

    pub async fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        crate::app::store::write_json_atomic(path, self).await
    }
}
