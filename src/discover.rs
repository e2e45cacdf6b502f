use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::dedup::canonical_url;
use crate::error::IngestError;
use crate::model::{CrawlConfig, Source, SourceKind};
use crate::text::{element_text, html_to_text, normalize_whitespace};

static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("static selector"));

static PAGINATION_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|/)(?:list|index)[_-]?\d+\.(?:htm|html|shtml|psp)$")
        .expect("static regex")
});

const PAGINATION_QUERY_KEYS: &[&str] = &["page", "pageno", "pageindex", "pagenum"];

const EXCLUDED_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "wps", "zip", "rar", "7z", "gz", "jpg",
    "jpeg", "png", "gif", "bmp", "svg", "webp", "mp3", "mp4", "avi", "mov", "apk", "exe",
];

const NAVIGATION_PHRASES: &[&str] = &[
    "more", "next", "prev", "previous", "更多", "查看更多", "下页", "下一页", "上页", "上一页",
    "尾页", "首页", "»", "›", "«", "‹",
];

/// Anchor texts longer than this are titles, not pager buttons.
const NAVIGATION_TEXT_MAX_CHARS: usize = 12;

/// Second-level suffixes under which the registrable domain has three labels.
const SECOND_LEVEL_SUFFIXES: &[&str] = &[
    "com.cn", "net.cn", "org.cn", "gov.cn", "edu.cn", "ac.cn", "co.uk", "org.uk", "ac.uk",
    "gov.uk", "com.au", "gov.au", "com.hk", "gov.hk", "co.jp", "com.tw", "gov.tw",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub url: Url,
    pub title_hint: Option<String>,
    pub published_hint: Option<DateTime<Utc>>,
    /// Feed-provided body text, if any.
    pub body_hint: Option<String>,
}

impl Candidate {
    fn from_url(url: Url) -> Self {
        Self {
            url,
            title_hint: None,
            published_hint: None,
            body_hint: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    /// Raw anchors (HTML) or entries (RSS) seen before any filtering.
    pub anchors_seen: usize,
    pub candidates: Vec<Candidate>,
}

impl Discovery {
    /// Appends `other`, keeping the first occurrence of every URL.
    pub fn merge(&mut self, other: Discovery) {
        self.anchors_seen += other.anchors_seen;
        let mut seen: HashSet<String> = self
            .candidates
            .iter()
            .map(|c| c.url.as_str().to_owned())
            .collect();
        for candidate in other.candidates {
            if seen.insert(candidate.url.as_str().to_owned()) {
                self.candidates.push(candidate);
            }
        }
    }
}

pub fn discover(body: &str, base_url: &Url, source: &Source) -> Result<Discovery, IngestError> {
    match source.kind {
        SourceKind::Rss => discover_feed(body, base_url),
        SourceKind::Html => discover_listing(body, base_url, &source.crawl),
    }
}

fn discover_feed(body: &str, base_url: &Url) -> Result<Discovery, IngestError> {
    let feed = feed_rs::parser::parse(body.as_bytes()).map_err(|err| IngestError::Parse {
        url: base_url.to_string(),
        reason: format!("feed: {err}"),
    })?;

    let mut discovery = Discovery {
        anchors_seen: feed.entries.len(),
        candidates: Vec::new(),
    };
    let mut seen = HashSet::new();

    for entry in feed.entries {
        let link = entry
            .links
            .first()
            .map(|link| link.href.clone())
            .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()));
        let Some(link) = link else {
            continue;
        };
        let Ok(mut url) = base_url.join(link.trim()) else {
            continue;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }
        url.set_fragment(None);
        if !seen.insert(url.as_str().to_owned()) {
            continue;
        }

        let body_hint = entry
            .content
            .and_then(|content| content.body)
            .or_else(|| entry.summary.map(|summary| summary.content))
            .map(|html| html_to_text(&html))
            .filter(|text| !text.is_empty());

        discovery.candidates.push(Candidate {
            url,
            title_hint: entry
                .title
                .map(|title| html_to_text(&title.content))
                .filter(|title| !title.is_empty()),
            published_hint: entry.published.or(entry.updated),
            body_hint,
        });
    }

    Ok(discovery)
}

fn discover_listing(
    body: &str,
    base_url: &Url,
    crawl: &CrawlConfig,
) -> Result<Discovery, IngestError> {
    let pattern = crawl
        .detail_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|err| IngestError::Parse {
            url: base_url.to_string(),
            reason: format!("detail pattern: {err}"),
        })?;

    let listing = canonical_url(base_url);
    let document = Html::parse_document(body);
    let mut discovery = Discovery::default();
    let mut seen = HashSet::new();

    for anchor in document.select(&ANCHOR) {
        discovery.anchors_seen += 1;

        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('#') || has_non_web_scheme(href) {
            continue;
        }
        let Ok(mut url) = base_url.join(href) else {
            continue;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }
        url.set_fragment(None);

        if !is_same_site(&url, base_url) || has_excluded_extension(&url) {
            continue;
        }
        if let Some(pattern) = &pattern
            && !pattern.is_match(url.as_str())
        {
            continue;
        }
        if is_same_page(&canonical_url(&url), &listing) {
            continue;
        }
        if looks_like_pagination(&url) {
            continue;
        }
        let text = element_text(&anchor);
        if is_navigation_text(&text) {
            continue;
        }
        if !seen.insert(url.as_str().to_owned()) {
            continue;
        }

        let title_hint = if text.is_empty() {
            anchor.value().attr("title").map(normalize_whitespace)
        } else {
            Some(text)
        };
        let mut candidate = Candidate::from_url(url);
        candidate.title_hint = title_hint.filter(|t| !t.is_empty());
        discovery.candidates.push(candidate);
    }

    Ok(discovery)
}

fn has_non_web_scheme(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
}

fn has_excluded_extension(url: &Url) -> bool {
    let last = url.path().rsplit('/').next().unwrap_or_default();
    let Some((_, ext)) = last.rsplit_once('.') else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    EXCLUDED_EXTENSIONS.contains(&ext.as_str())
}

fn is_same_page(a: &Url, b: &Url) -> bool {
    if a == b {
        return true;
    }
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
        && a.query() == b.query()
        && a.path().trim_end_matches('/') == b.path().trim_end_matches('/')
}

pub fn looks_like_pagination(url: &Url) -> bool {
    if PAGINATION_PATH.is_match(url.path()) {
        return true;
    }
    url.query_pairs().any(|(key, _)| {
        let key = key.to_ascii_lowercase();
        PAGINATION_QUERY_KEYS.contains(&key.as_str())
    })
}

pub fn is_navigation_text(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() || lower.chars().count() > NAVIGATION_TEXT_MAX_CHARS {
        return false;
    }
    NAVIGATION_PHRASES.iter().any(|phrase| {
        if phrase.chars().all(|c| c.is_ascii_alphabetic()) {
            lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|token| token == *phrase)
        } else {
            lower.contains(phrase)
        }
    })
}

pub fn registrable_domain(host: &str) -> String {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host;
    }
    let last_two = labels[labels.len() - 2..].join(".");
    let keep = if SECOND_LEVEL_SUFFIXES.contains(&last_two.as_str()) {
        3
    } else {
        2
    };
    labels[labels.len().saturating_sub(keep)..].join(".")
}

fn is_same_site(url: &Url, base: &Url) -> bool {
    let (Some(host), Some(base_host)) = (url.host_str(), base.host_str()) else {
        return false;
    };
    if host.eq_ignore_ascii_case(base_host) {
        return true;
    }
    registrable_domain(host) == registrable_domain(base_host)
}
