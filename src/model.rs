use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceKind {
    Rss,
    Html,
}

/// Which HTTP profile the fetcher uses for a source.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportHint {
    #[default]
    Default,
    /// Browser-like headers over HTTP/1.1, for sites that reject the default client.
    Browser,
}

/// How far discovered links are trusted as document identities.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkPolicy {
    #[default]
    TrustDiscoveredLinks,
    /// Every candidate's canonical identity becomes the source root URL.
    ForceCanonicalToRoot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrawlConfig {
    /// Listing pages. Empty means the root URL is the only listing.
    pub list_urls: Vec<String>,
    /// Regex a detail link must match (HTML sources).
    pub detail_pattern: Option<String>,
    pub title_selector: Option<String>,
    pub date_selector: Option<String>,
    pub content_selector: Option<String>,
    pub secondary_selectors: Vec<String>,
    pub attachment_selector: Option<String>,
    pub transport: TransportHint,
    pub link_policy: LinkPolicy,
    /// The listing is known to be rendered client-side.
    pub requires_js: bool,
    /// Offset applied to dates scraped without a zone.
    pub utc_offset_hours: i8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub root_url: String,
    pub crawl: CrawlConfig,
    pub is_active: bool,
    pub priority: i32,
    pub fetch_interval_minutes: u32,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_run: Option<RunStats>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub zero_fetch_streak: u32,
}

impl Source {
    /// Lower-cased scheme and host, default port dropped. Unparsable input is only trimmed.
    pub fn normalize_root_url(root_url: &str) -> String {
        let trimmed = root_url.trim();
        match url::Url::parse(trimmed) {
            Ok(url) => url.to_string(),
            Err(_) => trimmed.to_owned(),
        }
    }

    pub fn id_for_root_url(root_url: &str) -> String {
        let digest = sha2::Sha256::digest(Self::normalize_root_url(root_url).as_bytes());
        format!("s_{}", &hex::encode(digest)[..16])
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        match self.last_fetched_at {
            None => true,
            Some(last) => {
                now.signed_duration_since(last)
                    >= Duration::minutes(i64::from(self.fetch_interval_minutes))
            }
        }
    }

    pub fn listing_urls(&self) -> Vec<String> {
        if self.crawl.list_urls.is_empty() {
            vec![self.root_url.clone()]
        } else {
            self.crawl.list_urls.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Attachment {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentDigest {
    pub summary: String,
    pub key_points: Vec<String>,
    pub attachments: Vec<Attachment>,
}

/// Why the push gate held a document back. Final for that document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PushSkip {
    #[serde(rename = "SKIP_PER_TASK_LIMIT")]
    PerTaskLimit,
    #[serde(rename = "SKIP_PER_SOURCE_WINDOW")]
    PerSourceWindow,
    #[serde(rename = "DOWNGRADED_BIG_BATCH")]
    DowngradedBigBatch,
}

impl PushSkip {
    pub fn as_str(self) -> &'static str {
        match self {
            PushSkip::PerTaskLimit => "SKIP_PER_TASK_LIMIT",
            PushSkip::PerSourceWindow => "SKIP_PER_SOURCE_WINDOW",
            PushSkip::DowngradedBigBatch => "DOWNGRADED_BIG_BATCH",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub canonical_url: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    pub raw_text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub status: DocumentStatus,
    pub digest: Option<DocumentDigest>,
    pub skip_reason: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub push_skip: Option<PushSkip>,
    #[serde(default)]
    pub push_attempts: u32,
}

impl Document {
    pub fn id_for(source_id: &str, canonical_url: &str) -> String {
        let mut hasher = sha2::Sha256::new();
        hasher.update(source_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical_url.as_bytes());
        format!("d_{}", hex::encode(hasher.finalize()))
    }

    /// Timestamp used for the age window and recency ordering.
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.observed_at)
    }

    /// Still waiting for a delivery attempt that can succeed.
    pub fn awaits_push(&self, max_attempts: u32) -> bool {
        matches!(
            self.status,
            DocumentStatus::Pending | DocumentStatus::Approved
        ) && self.pushed_at.is_none()
            && self.push_skip.is_none()
            && self.push_attempts > 0
            && self.push_attempts < max_attempts
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStats {
    pub fetched: u32,
    pub upserted: u32,
    pub pushed: u32,
    pub dedup_skipped: u32,
    pub skipped_too_old: u32,
    pub skipped_by_limit: u32,
    pub errors: u32,
}

impl RunStats {
    pub fn absorb(&mut self, other: &RunStats) {
        self.fetched += other.fetched;
        self.upserted += other.upserted;
        self.pushed += other.pushed;
        self.dedup_skipped += other.dedup_skipped;
        self.skipped_too_old += other.skipped_too_old;
        self.skipped_by_limit += other.skipped_by_limit;
        self.errors += other.errors;
    }
}
