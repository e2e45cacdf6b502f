use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use url::Url;

use crate::discover::Candidate;
use crate::extract::Extracted;
use crate::model::{Document, DocumentStatus, LinkPolicy, Source};

const TRACKING_PARAMS: &[&str] = &[
    "spm", "fbclid", "gclid", "yclid", "mc_cid", "mc_eid", "_hsenc", "_hsmi", "from", "share",
    "ref",
];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Canonical form of a document URL. Scheme and host case and default ports are already
/// normalized by `Url` itself; this drops the fragment, tracking parameters and empty queries.
pub fn canonical_url(url: &Url) -> Url {
    let mut url = url.clone();
    url.set_fragment(None);

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let kept: Vec<&(String, String)> = pairs.iter().filter(|(k, _)| !is_tracking_param(k)).collect();

    if kept.is_empty() {
        url.set_query(None);
    } else if kept.len() != pairs.len() {
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    url
}

/// Identity under which a candidate is deduplicated for `source`.
pub fn canonical_identity(url: &Url, source: &Source) -> String {
    match source.crawl.link_policy {
        LinkPolicy::TrustDiscoveredLinks => canonical_url(url).to_string(),
        LinkPolicy::ForceCanonicalToRoot => match Url::parse(source.root_url.trim()) {
            Ok(root) => canonical_url(&root).to_string(),
            Err(_) => source.root_url.trim().to_owned(),
        },
    }
}

pub fn is_known(url: &Url, source: &Source, known: &HashSet<String>) -> bool {
    known.contains(&canonical_identity(url, source))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// New and fresh; persisted as `PENDING`.
    Accepted(Document),
    DuplicateSkip { canonical_url: String },
    /// New but outside the age window; persisted as `SKIPPED`, never pushed.
    TooOldSkip(Document),
}

/// Decides whether an extracted candidate becomes a new document.
///
/// `known` is the set of canonical URLs already stored for the source; admitted and too-old
/// documents are added to it so later candidates of the same run see them.
pub fn admit(
    candidate: &Candidate,
    extracted: Extracted,
    source: &Source,
    known: &mut HashSet<String>,
    window: Duration,
    now: DateTime<Utc>,
) -> Admission {
    let canonical = canonical_identity(&candidate.url, source);
    if known.contains(&canonical) {
        return Admission::DuplicateSkip {
            canonical_url: canonical,
        };
    }
    known.insert(canonical.clone());

    let title = extracted
        .title
        .or_else(|| candidate.title_hint.clone())
        .unwrap_or_else(|| candidate.url.to_string());
    let mut document = Document {
        id: Document::id_for(&source.id, &canonical),
        source_id: source.id.clone(),
        url: candidate.url.to_string(),
        canonical_url: canonical,
        title,
        published_at: extracted.published_at.or(candidate.published_hint),
        observed_at: now,
        raw_text: extracted.body,
        attachments: extracted.attachments,
        status: DocumentStatus::Pending,
        digest: None,
        skip_reason: None,
        pushed_at: None,
        push_skip: None,
        push_attempts: 0,
    };

    let age = now.signed_duration_since(document.reference_time());
    if age > window {
        document.status = DocumentStatus::Skipped;
        document.skip_reason = Some(format!(
            "TooOld: age={}s window={}s",
            age.num_seconds(),
            window.num_seconds()
        ));
        return Admission::TooOldSkip(document);
    }
    Admission::Accepted(document)
}
