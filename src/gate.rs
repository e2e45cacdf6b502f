use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{Actor, AuditEntry, AuditSink};
use crate::model::{Document, PushSkip, Source};

/// What happens to a source's new documents when a run accepts more than the threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BigBatchPolicy {
    Suppress,
    /// The `keep` most recent documents stay eligible.
    Sample { keep: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateLimits {
    pub per_task: usize,
    pub per_source_window: usize,
    pub window: Duration,
    pub big_batch_threshold: usize,
    pub big_batch: BigBatchPolicy,
}

#[derive(Debug, Default)]
struct CounterState {
    pushed: usize,
    per_source: HashMap<String, Vec<DateTime<Utc>>>,
}

/// Push quotas for one ingest run.
#[derive(Debug)]
pub struct PushCounters {
    per_task: usize,
    per_source_window: usize,
    window: Duration,
    state: Mutex<CounterState>,
}

impl PushCounters {
    pub fn new(limits: &GateLimits) -> Self {
        Self {
            per_task: limits.per_task,
            per_source_window: limits.per_source_window,
            window: limits.window,
            state: Mutex::new(CounterState::default()),
        }
    }

    /// Records pushes made before this run, so the rolling window spans runs.
    pub fn seed_source(&self, source_id: &str, pushed_at: impl IntoIterator<Item = DateTime<Utc>>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .per_source
            .entry(source_id.to_owned())
            .or_default()
            .extend(pushed_at);
    }

    /// Checks both limits and books one push if they allow it.
    pub fn try_reserve(&self, source_id: &str, now: DateTime<Utc>) -> Result<(), PushSkip> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.pushed >= self.per_task {
            return Err(PushSkip::PerTaskLimit);
        }
        let window = self.window;
        let times = state.per_source.entry(source_id.to_owned()).or_default();
        times.retain(|t| now.signed_duration_since(*t) < window);
        if times.len() >= self.per_source_window {
            return Err(PushSkip::PerSourceWindow);
        }
        times.push(now);
        state.pushed += 1;
        Ok(())
    }

    pub fn pushed(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pushed
    }
}

#[derive(Debug, Default)]
pub struct GateOutcome {
    pub to_push: Vec<Document>,
    /// Held-back documents, `push_skip` already set.
    pub skipped: Vec<Document>,
}

impl GateOutcome {
    pub fn skipped_by(&self, reason: PushSkip) -> usize {
        self.skipped
            .iter()
            .filter(|doc| doc.push_skip == Some(reason))
            .count()
    }
}

pub struct PushGate {
    limits: GateLimits,
    counters: Arc<PushCounters>,
    audit: Arc<dyn AuditSink>,
}

impl PushGate {
    pub fn new(limits: GateLimits, counters: Arc<PushCounters>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            limits,
            counters,
            audit,
        }
    }

    pub fn counters(&self) -> &Arc<PushCounters> {
        &self.counters
    }

    /// Decides which of `eligible` are forwarded.
    ///
    /// Retries (documents with earlier failed attempts) go first, then new documents newest
    /// first. `new_count` is the number of documents the source accepted in this run.
    pub async fn gate(
        &self,
        mut eligible: Vec<Document>,
        source: &Source,
        new_count: usize,
        now: DateTime<Utc>,
    ) -> anyhow::Result<GateOutcome> {
        eligible.sort_by(|a, b| {
            (a.push_attempts == 0, Reverse(a.reference_time()), &a.canonical_url).cmp(&(
                b.push_attempts == 0,
                Reverse(b.reference_time()),
                &b.canonical_url,
            ))
        });

        let big_batch = new_count > self.limits.big_batch_threshold;
        if big_batch {
            tracing::info!(
                source_id = %source.id,
                new_count,
                threshold = self.limits.big_batch_threshold,
                policy = ?self.limits.big_batch,
                "big batch; downgrading"
            );
        }
        let mut sampled = 0;
        let mut outcome = GateOutcome::default();

        for mut doc in eligible {
            let is_new = doc.push_attempts == 0;
            let downgraded = big_batch
                && is_new
                && match self.limits.big_batch {
                    BigBatchPolicy::Suppress => true,
                    BigBatchPolicy::Sample { keep } => {
                        sampled += 1;
                        sampled > keep
                    }
                };

            let decision = if downgraded {
                Err(PushSkip::DowngradedBigBatch)
            } else {
                self.counters.try_reserve(&source.id, now)
            };

            let entry = AuditEntry::new(&Actor::PUSH_GATE, "", now)
                .source(&source.id)
                .document(&doc.id);
            let entry = match decision {
                Ok(()) => AuditEntry {
                    action: "push".to_owned(),
                    ..entry.important(true)
                },
                Err(reason) => AuditEntry {
                    action: format!("skip:{}", reason.as_str()),
                    ..entry.after(serde_json::json!({ "push_skip": reason }))
                },
            };
            self.audit
                .record(entry)
                .await
                .with_context(|| format!("record gate decision for {}", doc.id))?;

            match decision {
                Ok(()) => outcome.to_push.push(doc),
                Err(reason) => {
                    tracing::debug!(document_id = %doc.id, reason = reason.as_str(), "push skipped");
                    doc.push_skip = Some(reason);
                    outcome.skipped.push(doc);
                }
            }
        }

        Ok(outcome)
    }
}
