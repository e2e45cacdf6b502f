use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone as _, Utc};
use readability_js::{Readability, ReadabilityError, ReadabilityOptions};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::ExtractError;
use crate::model::{Attachment, CrawlConfig};
use crate::text::{char_len, element_text, normalize_whitespace};

pub const DEFAULT_MIN_CONTENT_CHARS: usize = 300;

static NOISE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        "nav, header, footer, aside, script, style, noscript, iframe, form, \
         div[class*='comment'], div[id*='comment'], section[class*='comment'], \
         div[class*='share'], div[class*='breadcrumb']",
    )
    .expect("static selector")
});

static MAIN_CONTENT: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "article",
        "main",
        "[role='main']",
        "#content",
        "#main",
        ".content",
        ".main",
        ".post-content",
        ".entry-content",
        ".article-content",
        ".TRS_Editor",
    ]
    .iter()
    .filter_map(|s| Selector::parse(s).ok())
    .collect()
});

static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("static selector"));
static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("static selector"));
static H1: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("static selector"));
static BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("static selector"));

static PUBLISHED_META: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "meta[property='article:published_time']",
        "meta[name='PubDate']",
        "meta[name='pubdate']",
        "meta[name='publishdate']",
        "meta[itemprop='datePublished']",
    ]
    .iter()
    .filter_map(|s| Selector::parse(s).ok())
    .collect()
});

static DATE_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{4})\s*[-/.年]\s*(\d{1,2})\s*[-/.月]\s*(\d{1,2})\s*日?(?:\s*(\d{1,2}):(\d{2})(?::(\d{2}))?)?",
    )
    .expect("static regex")
});

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "wps", "et", "ofd", "txt", "csv", "zip",
    "rar", "7z",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractStage {
    /// Configured content selector.
    Primary,
    /// Union of configured secondary selectors.
    Secondary,
    /// Readability, or the main-content heuristic when readability fails.
    Readability,
    /// Body supplied by the feed entry; no detail page involved.
    Feed,
}

/// Notified once per extraction stage that actually runs.
pub trait StageObserver: Send + Sync {
    fn stage_invoked(&self, url: &str, stage: ExtractStage, chars: usize);
}

#[derive(Debug, Default)]
pub struct TracingObserver;

impl StageObserver for TracingObserver {
    fn stage_invoked(&self, url: &str, stage: ExtractStage, chars: usize) {
        tracing::trace!(url, ?stage, chars, "extract stage");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub title: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub stage: ExtractStage,
}

#[derive(Debug, Default)]
struct Region {
    text: String,
    attachments: Vec<Attachment>,
}

impl Region {
    fn chars(&self) -> usize {
        char_len(&self.text)
    }
}

/// Turns a detail page into title, date, body and attachments.
pub fn extract(
    html: &str,
    page_url: &Url,
    config: &CrawlConfig,
    min_chars: usize,
    observer: &dyn StageObserver,
) -> Result<Extracted, ExtractError> {
    let document = Html::parse_document(html);
    let stripped = strip_noise(&document);
    let attachment_selector = config.attachment_selector.as_deref().and_then(parse_selector);
    let url = page_url.as_str();
    let mut best = 0;

    let mut winner: Option<(Region, ExtractStage, Option<String>)> = None;

    if let Some(selector) = config.content_selector.as_deref().and_then(parse_selector) {
        let elements: Vec<_> = stripped.select(&selector).collect();
        let region = region_from(&elements, page_url, attachment_selector.as_ref());
        observer.stage_invoked(url, ExtractStage::Primary, region.chars());
        best = best.max(region.chars());
        if region.chars() >= min_chars {
            winner = Some((region, ExtractStage::Primary, None));
        }
    }

    if winner.is_none() && !config.secondary_selectors.is_empty() {
        let mut elements = Vec::new();
        for selector in config.secondary_selectors.iter().filter_map(|s| parse_selector(s)) {
            elements.extend(stripped.select(&selector));
        }
        let region = region_from(&elements, page_url, attachment_selector.as_ref());
        observer.stage_invoked(url, ExtractStage::Secondary, region.chars());
        best = best.max(region.chars());
        if region.chars() >= min_chars {
            winner = Some((region, ExtractStage::Secondary, None));
        }
    }

    if winner.is_none() {
        let (region, title) = match readability_region(html, page_url, attachment_selector.as_ref())
        {
            Some(found) => found,
            None => (
                main_content_region(&document, page_url, attachment_selector.as_ref()),
                None,
            ),
        };
        observer.stage_invoked(url, ExtractStage::Readability, region.chars());
        best = best.max(region.chars());
        if region.chars() >= min_chars {
            winner = Some((region, ExtractStage::Readability, title));
        }
    }

    let Some((region, stage, readability_title)) = winner else {
        return Err(ExtractError::InsufficientContent { chars: best });
    };

    let title = config
        .title_selector
        .as_deref()
        .and_then(|s| first_text(&document, s))
        .or(readability_title.filter(|t| !t.is_empty()))
        .or_else(|| first_text_with(&document, &TITLE))
        .or_else(|| first_text_with(&document, &H1));

    let offset = config.utc_offset_hours;
    let published_at = config
        .date_selector
        .as_deref()
        .and_then(|s| first_text(&document, s))
        .and_then(|text| parse_date_text(&text, offset))
        .or_else(|| meta_published(&document, offset))
        .or_else(|| parse_date_text(&region.text, offset));

    Ok(Extracted {
        title,
        published_at,
        body: region.text,
        attachments: region.attachments,
        stage,
    })
}

fn parse_selector(raw: &str) -> Option<Selector> {
    match Selector::parse(raw) {
        Ok(selector) => Some(selector),
        Err(err) => {
            tracing::warn!(selector = raw, %err, "ignoring unparsable selector");
            None
        }
    }
}

/// Detached nodes stay in the arena `Html::select` walks, so the cleaned tree is re-parsed.
fn strip_noise(document: &Html) -> Html {
    let mut stripped = document.clone();
    let noise: Vec<_> = stripped.select(&NOISE).map(|element| element.id()).collect();
    for id in noise {
        if let Some(mut node) = stripped.tree.get_mut(id) {
            node.detach();
        }
    }
    Html::parse_document(&stripped.root_element().html())
}

fn region_from(
    elements: &[ElementRef<'_>],
    page_url: &Url,
    attachment_selector: Option<&Selector>,
) -> Region {
    let text = normalize_whitespace(
        &elements
            .iter()
            .map(element_text)
            .collect::<Vec<_>>()
            .join(" "),
    );
    let mut attachments = Vec::new();
    let mut seen = HashSet::new();
    for element in elements {
        collect_attachments(element, page_url, attachment_selector, &mut seen, &mut attachments);
    }
    Region { text, attachments }
}

fn collect_attachments(
    scope: &ElementRef<'_>,
    page_url: &Url,
    selector: Option<&Selector>,
    seen: &mut HashSet<String>,
    out: &mut Vec<Attachment>,
) {
    let matched: Vec<ElementRef<'_>> = match selector {
        Some(selector) => scope.select(selector).collect(),
        None => scope.select(&ANCHOR).collect(),
    };
    for element in matched {
        let links: Vec<ElementRef<'_>> = if element.value().attr("href").is_some() {
            vec![element]
        } else {
            element.select(&ANCHOR).collect()
        };
        for link in links {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let Ok(mut url) = page_url.join(href.trim()) else {
                continue;
            };
            if url.scheme() != "http" && url.scheme() != "https" {
                continue;
            }
            url.set_fragment(None);
            if selector.is_none() && !is_document_link(&url) {
                continue;
            }
            if !seen.insert(url.to_string()) {
                continue;
            }
            let text = element_text(&link);
            let name = if text.is_empty() {
                file_name(&url)
            } else {
                text
            };
            out.push(Attachment {
                name,
                url: url.to_string(),
            });
        }
    }
}

fn is_document_link(url: &Url) -> bool {
    let name = file_name(url);
    name.rsplit_once('.')
        .map(|(_, ext)| DOCUMENT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn file_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default()
        .to_owned()
}

fn readability_region(
    html: &str,
    page_url: &Url,
    attachment_selector: Option<&Selector>,
) -> Option<(Region, Option<String>)> {
    let readability = match Readability::new() {
        Ok(readability) => readability,
        Err(err) => {
            tracing::debug!(?err, "readability unavailable; using main-content heuristic");
            return None;
        }
    };
    let (title, content) = match parse_article(&readability, html, page_url.as_str()) {
        Ok(parts) => parts,
        Err(err) => {
            tracing::debug!(url = %page_url, ?err, "readability failed; using main-content heuristic");
            return None;
        }
    };

    let fragment = Html::parse_fragment(&content);
    let root = fragment.root_element();
    let region = region_from(&[root], page_url, attachment_selector);
    let title = normalize_whitespace(&title);
    Some((region, (!title.is_empty()).then_some(title)))
}

/// Title and content HTML, retrying with looser options when the readerable check fails.
fn parse_article(
    readability: &Readability,
    html: &str,
    url: &str,
) -> Result<(String, String), ReadabilityError> {
    match readability.parse_with_url(html, url) {
        Ok(article) => Ok((article.title, article.content)),
        Err(ReadabilityError::ReadabilityCheckFailed) => {
            let options = ReadabilityOptions::new()
                .char_threshold(0)
                .nb_top_candidates(10)
                .link_density_modifier(2.0);
            let article = readability.parse_with_options(html, Some(url), Some(options))?;
            Ok((article.title, article.content))
        }
        Err(err) => Err(err),
    }
}

fn main_content_region(
    document: &Html,
    page_url: &Url,
    attachment_selector: Option<&Selector>,
) -> Region {
    let mut best = Region::default();
    for selector in MAIN_CONTENT.iter().chain(std::iter::once(&*BODY)) {
        if let Some(element) = document.select(selector).next() {
            let region = region_from(&[element], page_url, attachment_selector);
            if region.chars() > best.chars() {
                best = region;
            }
            if !best.text.is_empty() {
                break;
            }
        }
    }
    best
}

fn first_text(document: &Html, raw_selector: &str) -> Option<String> {
    let selector = parse_selector(raw_selector)?;
    first_text_with(document, &selector)
}

fn first_text_with(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .map(|element| element_text(&element))
        .find(|text| !text.is_empty())
}

fn meta_published(document: &Html, offset_hours: i8) -> Option<DateTime<Utc>> {
    PUBLISHED_META.iter().find_map(|selector| {
        document
            .select(selector)
            .filter_map(|meta| meta.value().attr("content"))
            .find_map(|content| parse_date_text(content, offset_hours))
    })
}

/// First timestamp found in `text`. RFC 3339 values keep their zone; bare dates are read in
/// `offset_hours`.
pub fn parse_date_text(text: &str, offset_hours: i8) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }

    let caps = DATE_LIKE.captures(trimmed)?;
    let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let year = i32::try_from(number(1)?).ok()?;
    if !(1990..=2100).contains(&year) {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year, number(2)?, number(3)?)?;
    let time = match number(4) {
        Some(hour) => NaiveTime::from_hms_opt(hour, number(5)?, number(6).unwrap_or(0))?,
        None => NaiveTime::MIN,
    };
    let offset = FixedOffset::east_opt(i32::from(offset_hours) * 3600)?;
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .map(|local| local.with_timezone(&Utc))
}
