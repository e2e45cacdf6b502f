use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context as _;
use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::app::store::SourceStore;
use crate::extract::DEFAULT_MIN_CONTENT_CHARS;
use crate::fetch::MIN_HOST_INTERVAL;
use crate::gate::{BigBatchPolicy, GateLimits};
use crate::model::{CrawlConfig, Source, SourceKind};
use crate::summarize::{DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL};

const ENV_PREFIX: &str = "SOURCEWATCH_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// Source workers, and outbound requests, in flight at once.
    pub concurrency: usize,
    pub freshness_window_hours: u32,
    pub per_task_push_limit: usize,
    pub per_source_push_limit: usize,
    pub per_source_window_hours: u32,
    pub big_batch_threshold: usize,
    pub big_batch: BigBatchPolicy,
    /// Wall-clock budget of one source per run.
    pub source_budget_secs: u64,
    pub request_timeout_secs: u64,
    pub host_interval_ms: u64,
    pub min_content_chars: usize,
    /// Disable a source after this many consecutive runs without candidates. `None` never does.
    pub zero_fetch_disable_after: Option<u32>,
    pub max_push_attempts: u32,
    pub health_top_n: usize,
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub watch_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("sourcewatch-data"),
            concurrency: 5,
            freshness_window_hours: 7 * 24,
            per_task_push_limit: 20,
            per_source_push_limit: 5,
            per_source_window_hours: 24,
            big_batch_threshold: 10,
            big_batch: BigBatchPolicy::Sample { keep: 3 },
            source_budget_secs: 120,
            request_timeout_secs: 20,
            host_interval_ms: 500,
            min_content_chars: DEFAULT_MIN_CONTENT_CHARS,
            zero_fetch_disable_after: None,
            max_push_attempts: 3,
            health_top_n: 5,
            webhook_url: None,
            webhook_timeout_secs: 10,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_owned(),
            openai_api_key: None,
            openai_model: DEFAULT_OPENAI_MODEL.to_owned(),
            watch_interval_secs: 60,
        }
    }
}

impl Settings {
    /// Defaults, then the YAML file (if any), then `SOURCEWATCH_*` variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config: {}", path.display()))?;
                Self::from_yaml(&raw).with_context(|| format!("parse config: {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).context("parse settings yaml")
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|value| !value.trim().is_empty())
        };

        if let Some(dir) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = var("WEBHOOK_URL") {
            self.webhook_url = Some(url);
        }
        if let Some(key) = var("OPENAI_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.openai_api_key = Some(key);
        }
        if let Some(model) = var("OPENAI_MODEL") {
            self.openai_model = model;
        }
        if let Some(base) = var("OPENAI_BASE_URL") {
            self.openai_base_url = base;
        }
        parse_var(&var, "CONCURRENCY", &mut self.concurrency)?;
        parse_var(&var, "FRESHNESS_WINDOW_HOURS", &mut self.freshness_window_hours)?;
        parse_var(&var, "PER_TASK_PUSH_LIMIT", &mut self.per_task_push_limit)?;
        parse_var(&var, "PER_SOURCE_PUSH_LIMIT", &mut self.per_source_push_limit)?;
        parse_var(&var, "SOURCE_BUDGET_SECS", &mut self.source_budget_secs)?;
        parse_var(&var, "REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs)?;
        if let Some(raw) = var("ZERO_FETCH_DISABLE_AFTER") {
            self.zero_fetch_disable_after = match raw.trim() {
                "off" | "none" | "0" => None,
                value => Some(value.parse().with_context(|| {
                    format!("invalid {ENV_PREFIX}ZERO_FETCH_DISABLE_AFTER={raw:?}")
                })?),
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be > 0");
        }
        if self.max_push_attempts == 0 {
            anyhow::bail!("max_push_attempts must be > 0");
        }
        if self.source_budget_secs == 0 || self.request_timeout_secs == 0 {
            anyhow::bail!("source_budget_secs and request_timeout_secs must be > 0");
        }
        if let Some(url) = &self.webhook_url {
            parse_http_url(url).context("webhook_url")?;
        }
        Ok(())
    }

    pub fn gate_limits(&self) -> GateLimits {
        GateLimits {
            per_task: self.per_task_push_limit,
            per_source_window: self.per_source_push_limit,
            window: chrono::Duration::hours(i64::from(self.per_source_window_hours)),
            big_batch_threshold: self.big_batch_threshold,
            big_batch: self.big_batch,
        }
    }

    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.freshness_window_hours))
    }

    pub fn source_budget(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.source_budget_secs)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn host_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.host_interval_ms).max(MIN_HOST_INTERVAL)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("audit.jsonl")
    }

    pub fn health_path(&self) -> PathBuf {
        self.data_dir.join("health.json")
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str, slot: &mut T) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = var(name) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {ENV_PREFIX}{name}={raw:?}"))?;
    }
    Ok(())
}

fn parse_http_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid url: {raw}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => anyhow::bail!("unsupported url scheme {other:?}: {raw}"),
    }
}

/// One source as written in a sources YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
    pub name: String,
    pub kind: SourceKind,
    pub root_url: String,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_minutes: u32,
}

fn default_active() -> bool {
    true
}

fn default_fetch_interval() -> u32 {
    60
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceFile {
    sources: Vec<SourceSpec>,
}

impl SourceSpec {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("name is empty");
        }
        parse_http_url(&self.root_url).context("root_url")?;
        for list_url in &self.crawl.list_urls {
            parse_http_url(list_url).context("list_urls")?;
        }
        if let Some(pattern) = &self.crawl.detail_pattern {
            Regex::new(pattern).with_context(|| format!("detail_pattern {pattern:?}"))?;
        }
        let selectors = [
            &self.crawl.title_selector,
            &self.crawl.date_selector,
            &self.crawl.content_selector,
            &self.crawl.attachment_selector,
        ];
        for selector in selectors
            .into_iter()
            .flatten()
            .chain(self.crawl.secondary_selectors.iter())
        {
            Selector::parse(selector)
                .map_err(|err| anyhow::anyhow!("selector {selector:?}: {err}"))?;
        }
        if !(-12..=14).contains(&self.crawl.utc_offset_hours) {
            anyhow::bail!("utc_offset_hours out of range: {}", self.crawl.utc_offset_hours);
        }
        if self.fetch_interval_minutes == 0 {
            anyhow::bail!("fetch_interval_minutes must be > 0");
        }
        Ok(())
    }

    /// Builds the stored source. An existing row keeps its run state and active flag.
    pub fn apply(self, existing: Option<Source>) -> Source {
        let root_url = Source::normalize_root_url(&self.root_url);
        match existing {
            Some(mut source) => {
                source.name = self.name;
                source.kind = self.kind;
                source.root_url = root_url;
                source.crawl = self.crawl;
                source.priority = self.priority;
                source.fetch_interval_minutes = self.fetch_interval_minutes;
                source
            }
            None => Source {
                id: Source::id_for_root_url(&root_url),
                name: self.name,
                kind: self.kind,
                root_url,
                crawl: self.crawl,
                is_active: self.active,
                priority: self.priority,
                fetch_interval_minutes: self.fetch_interval_minutes,
                last_fetched_at: None,
                last_error: None,
                last_run: None,
                needs_review: false,
                zero_fetch_streak: 0,
            },
        }
    }
}

pub fn parse_source_specs(raw: &str) -> anyhow::Result<Vec<SourceSpec>> {
    let file: SourceFile = serde_yaml::from_str(raw).context("parse sources yaml")?;
    let mut seen = std::collections::HashSet::new();
    for spec in &file.sources {
        spec.validate()
            .with_context(|| format!("invalid source {:?}", spec.name))?;
        if !seen.insert(Source::normalize_root_url(&spec.root_url)) {
            anyhow::bail!("duplicate root_url: {}", spec.root_url);
        }
    }
    Ok(file.sources)
}

pub fn load_source_specs(path: &Path) -> anyhow::Result<Vec<SourceSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read sources: {}", path.display()))?;
    parse_source_specs(&raw).with_context(|| format!("load sources: {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
    Unchanged,
}

/// Upserts each spec by root URL.
pub async fn import_sources<S>(
    store: &S,
    specs: Vec<SourceSpec>,
) -> anyhow::Result<Vec<(Source, Upsert)>>
where
    S: SourceStore + ?Sized,
{
    let mut results = Vec::with_capacity(specs.len());
    for spec in specs {
        let id = Source::id_for_root_url(&spec.root_url);
        let existing = store
            .get_source(&id)
            .await
            .with_context(|| format!("read source {id}"))?;
        let outcome = match &existing {
            None => Upsert::Created,
            Some(_) => Upsert::Updated,
        };
        let before = existing.clone();
        let source = spec.apply(existing);
        let outcome = if before.as_ref() == Some(&source) {
            Upsert::Unchanged
        } else {
            store.save_source(&source).await?;
            outcome
        };
        tracing::info!(source_id = %source.id, name = %source.name, ?outcome, "source import");
        results.push((source, outcome));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::app::store::MemoryStore;

    const SOURCES: &str = r#"
sources:
  - name: Ministry notices
    kind: HTML
    root_url: https://www.moa.example.cn/gk/tzgg/
    priority: 10
    crawl:
      detail_pattern: '/gk/tzgg/\d{6}/t\d+_\d+\.htm$'
      content_selector: .TRS_Editor
      secondary_selectors: [".pages-date", ".article p"]
      transport: browser
      utc_offset_hours: 8
  - name: Central bank feed
    kind: RSS
    root_url: https://bank.example.org/rss.xml
"#;

    #[test]
    fn settings_defaults_then_file_then_env() -> anyhow::Result<()> {
        let mut settings = Settings::from_yaml(
            "concurrency: 3\nbig_batch:\n  mode: suppress\nzero_fetch_disable_after: 4\n",
        )?;
        assert_eq!(settings.concurrency, 3);
        assert_eq!(settings.big_batch, BigBatchPolicy::Suppress);
        assert_eq!(settings.per_task_push_limit, 20);

        let env: HashMap<&str, &str> = [
            ("SOURCEWATCH_CONCURRENCY", "8"),
            ("SOURCEWATCH_WEBHOOK_URL", "http://127.0.0.1:9/hook"),
            ("SOURCEWATCH_ZERO_FETCH_DISABLE_AFTER", "off"),
            ("OPENAI_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();
        settings.apply_env(|key| env.get(key).map(|v| (*v).to_owned()))?;

        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.webhook_url.as_deref(), Some("http://127.0.0.1:9/hook"));
        assert_eq!(settings.zero_fetch_disable_after, None);
        assert_eq!(settings.openai_api_key.as_deref(), Some("sk-test"));
        settings.validate()
    }

    #[test]
    fn bad_env_values_are_reported() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(|key| (key == "SOURCEWATCH_CONCURRENCY").then(|| "many".to_owned()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("SOURCEWATCH_CONCURRENCY"));
    }

    #[test]
    fn unknown_settings_keys_are_rejected() {
        assert!(Settings::from_yaml("concurency: 3\n").is_err());
    }

    #[test]
    fn source_specs_parse_and_validate() -> anyhow::Result<()> {
        let specs = parse_source_specs(SOURCES)?;
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].crawl.secondary_selectors.len(), 2);
        assert!(specs[1].active);
        assert_eq!(specs[1].fetch_interval_minutes, 60);

        let bad_regex = SOURCES.replace(r"\d{6}", "(");
        assert!(parse_source_specs(&bad_regex).is_err());

        let bad_scheme = SOURCES.replace("https://bank", "ftp://bank");
        assert!(parse_source_specs(&bad_scheme).is_err());
        Ok(())
    }

    #[test]
    fn root_urls_differing_only_in_case_or_default_port_are_duplicates() {
        let raw = "sources:\n  - name: A\n    kind: RSS\n    root_url: https://Example.org/feed.xml\n  - name: B\n    kind: RSS\n    root_url: https://example.org:443/feed.xml\n";
        let err = parse_source_specs(raw).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate root_url"));
    }

    #[tokio::test]
    async fn import_upserts_by_root_url_and_keeps_run_state() -> anyhow::Result<()> {
        let store = MemoryStore::default();
        let first = import_sources(&store, parse_source_specs(SOURCES)?).await?;
        assert!(first.iter().all(|(_, outcome)| *outcome == Upsert::Created));

        let id = first[0].0.id.clone();
        let mut disabled = first[0].0.clone();
        disabled.is_active = false;
        disabled.last_error = Some("AutoDisabled:TimeoutError".to_owned());
        store.save_source(&disabled).await?;

        let renamed = SOURCES.replace("Ministry notices", "Ministry notices (new)");
        let second = import_sources(&store, parse_source_specs(&renamed)?).await?;
        assert_eq!(second[0].1, Upsert::Updated);
        assert_eq!(second[1].1, Upsert::Unchanged);

        let stored = store.get_source(&id).await?.expect("source");
        assert_eq!(stored.name, "Ministry notices (new)");
        assert!(!stored.is_active);
        assert_eq!(stored.last_error.as_deref(), Some("AutoDisabled:TimeoutError"));
        assert_eq!(store.list_sources().await?.len(), 2);
        Ok(())
    }
}
