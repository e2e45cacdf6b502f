mod support;

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use sourcewatch::app::App;
use sourcewatch::app::orchestrator::{RunReport, SourcePhase, SourceReport};
use sourcewatch::config::{self, Settings};
use sourcewatch::health::HealthSummary;
use sourcewatch::model::{DocumentStatus, Source};

use serde_json::Value;
use support::{Page, StubSite, StubWebhook, article, listing, sources_yaml};

fn settings(data_dir: &std::path::Path, webhook: &StubWebhook) -> Settings {
    Settings {
        data_dir: data_dir.to_path_buf(),
        webhook_url: Some(webhook.url.clone()),
        request_timeout_secs: 5,
        source_budget_secs: 30,
        ..Settings::default()
    }
}

async fn import(app: &App, entries: &[(&str, &str)]) -> anyhow::Result<Vec<Source>> {
    import_yaml(app, &sources_yaml(entries)).await
}

async fn import_yaml(app: &App, yaml: &str) -> anyhow::Result<Vec<Source>> {
    let specs = config::parse_source_specs(yaml)?;
    let imported = config::import_sources(app.store.as_ref(), specs).await?;
    Ok(imported.into_iter().map(|(source, _)| source).collect())
}

fn report_for<'a>(report: &'a RunReport, source: &Source) -> &'a SourceReport {
    report
        .sources
        .iter()
        .find(|s| s.source_id == source.id)
        .expect("source in report")
}

fn audit_entries(data_dir: &std::path::Path) -> anyhow::Result<Vec<Value>> {
    let raw = std::fs::read_to_string(data_dir.join("audit.jsonl"))?;
    raw.lines()
        .map(|line| Ok::<Value, anyhow::Error>(serde_json::from_str(line)?))
        .collect()
}

fn news_site(count: usize) -> StubSite {
    let published = Utc::now() - TimeDelta::hours(1);
    let links: Vec<(String, String)> = (1..=count)
        .map(|i| (format!("/news/{i}.html"), format!("Irrigation subsidy notice {i}")))
        .collect();
    let anchors: Vec<(&str, &str)> = links
        .iter()
        .map(|(href, text)| (href.as_str(), text.as_str()))
        .collect();

    let mut pages = vec![("/news/", Page::ok(listing(&anchors)))];
    for (href, text) in &anchors {
        pages.push((*href, Page::ok(article(text, published))));
    }
    StubSite::spawn(pages)
}

#[tokio::test]
async fn second_run_deduplicates_and_pushes_nothing_new() -> anyhow::Result<()> {
    let site = news_site(3);
    let webhook = StubWebhook::spawn();
    let data_dir = tempfile::tempdir()?;
    let app = App::from_settings(settings(data_dir.path(), &webhook))?;
    let sources = import(&app, &[("Notices", site.url("/news/").as_str())]).await?;

    let now = Utc::now();
    let first = app.orchestrator.run_once(now).await?;
    let stats = report_for(&first, &sources[0]).stats;
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.upserted, 3);
    assert_eq!(stats.pushed, 3);
    assert_eq!(stats.errors, 0);
    assert_eq!(webhook.received().len(), 3);

    let documents = app.store.list_documents(&sources[0].id).await?;
    assert_eq!(documents.len(), 3);
    assert!(documents.iter().all(|doc| doc.status == DocumentStatus::Pending));
    assert!(documents.iter().all(|doc| doc.pushed_at.is_some()));
    assert!(documents.iter().all(|doc| doc.raw_text.chars().count() >= 300));
    assert!(
        documents
            .iter()
            .any(|doc| doc.title == "Irrigation subsidy notice 2")
    );

    let second = app.orchestrator.run_once(now + TimeDelta::hours(2)).await?;
    let stats = report_for(&second, &sources[0]).stats;
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.upserted, 0);
    assert_eq!(stats.dedup_skipped, 3);
    assert_eq!(stats.pushed, 0);
    assert_eq!(webhook.received().len(), 3);
    assert_eq!(site.hits("/news/1.html"), 1);
    assert_eq!(app.store.list_documents(&sources[0].id).await?.len(), 3);

    let admissions: Vec<Value> = audit_entries(data_dir.path())?
        .into_iter()
        .filter(|entry| entry["action"] == "admit")
        .collect();
    assert_eq!(admissions.len(), 3);
    for entry in &admissions {
        assert_eq!(entry["actor"], "system:dedup");
        assert_eq!(entry["important"], false);
        assert_eq!(entry["source_id"].as_str(), Some(sources[0].id.as_str()));
        assert_eq!(entry["after"]["status"], "PENDING");
        assert!(entry["after"]["skip_reason"].is_null());
    }
    Ok(())
}

#[tokio::test]
async fn feed_entries_with_full_text_skip_detail_fetches() -> anyhow::Result<()> {
    let published = (Utc::now() - TimeDelta::hours(1)).to_rfc2822();
    let description = "The provincial office published revised guidance for irrigation \
        subsidies, covering eligibility, application windows and the documents applicants \
        must submit before the end of the quarter. "
        .repeat(3);
    let items: String = (1..=2)
        .map(|i| {
            format!(
                "<item><title>Feed notice {i}</title><link>{{BASE}}/news/{i}.html</link>\
                 <pubDate>{published}</pubDate><description>{description}</description></item>"
            )
        })
        .collect();
    let feed = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <rss version=\"2.0\"><channel><title>Notices</title><link>{{BASE}}/</link>\
         <description>Notices</description>{items}</channel></rss>"
    );
    let site = StubSite::spawn(vec![("/feed.xml", Page::ok(feed))]);
    let webhook = StubWebhook::spawn();
    let data_dir = tempfile::tempdir()?;
    let app = App::from_settings(settings(data_dir.path(), &webhook))?;
    let yaml = format!(
        "sources:\n  - name: Feed\n    kind: RSS\n    root_url: {}\n",
        site.url("/feed.xml")
    );
    let sources = import_yaml(&app, &yaml).await?;

    let report = app.orchestrator.run_once(Utc::now()).await?;
    let source = report_for(&report, &sources[0]);
    assert_eq!(source.phase, SourcePhase::Done);
    assert_eq!(source.stats.fetched, 2);
    assert_eq!(source.stats.upserted, 2);
    assert_eq!(source.stats.pushed, 2);
    assert_eq!(source.stats.errors, 0);
    assert_eq!(site.hits("/feed.xml"), 1);
    assert_eq!(site.hits("/news/1.html"), 0);
    assert_eq!(site.hits("/news/2.html"), 0);

    let documents = app.store.list_documents(&sources[0].id).await?;
    assert_eq!(documents.len(), 2);
    assert!(documents.iter().any(|doc| doc.title == "Feed notice 1"));
    assert!(documents.iter().all(|doc| doc.raw_text.chars().count() >= 300));
    assert!(documents.iter().all(|doc| doc.published_at.is_some()));
    assert_eq!(webhook.received().len(), 2);

    let admitted = audit_entries(data_dir.path())?
        .into_iter()
        .filter(|entry| entry["action"] == "admit" && entry["actor"] == "system:dedup")
        .count();
    assert_eq!(admitted, 2);
    Ok(())
}

#[tokio::test]
async fn forced_root_identity_keeps_one_document_per_source() -> anyhow::Result<()> {
    let site = news_site(3);
    let webhook = StubWebhook::spawn();
    let data_dir = tempfile::tempdir()?;
    let app = App::from_settings(settings(data_dir.path(), &webhook))?;
    let yaml = format!(
        "sources:\n  - name: Bulletin\n    kind: HTML\n    root_url: {}\n    crawl:\n      detail_pattern: '/news/\\d+\\.html$'\n      content_selector: .article\n      title_selector: h1\n      link_policy: force_canonical_to_root\n",
        site.url("/news/")
    );
    let sources = import_yaml(&app, &yaml).await?;

    let now = Utc::now();
    let first = app.orchestrator.run_once(now).await?;
    let stats = report_for(&first, &sources[0]).stats;
    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.upserted, 1);
    assert_eq!(stats.dedup_skipped, 2);
    assert_eq!(stats.pushed, 1);

    let documents = app.store.list_documents(&sources[0].id).await?;
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].canonical_url, site.url("/news/"));

    let second = app.orchestrator.run_once(now + TimeDelta::hours(2)).await?;
    let stats = report_for(&second, &sources[0]).stats;
    assert_eq!(stats.upserted, 0);
    assert_eq!(stats.dedup_skipped, 3);
    assert_eq!(stats.pushed, 0);
    assert_eq!(app.store.list_documents(&sources[0].id).await?.len(), 1);
    assert_eq!(webhook.received().len(), 1);
    Ok(())
}

#[tokio::test]
async fn blocked_listing_disables_only_that_source() -> anyhow::Result<()> {
    let published = Utc::now() - TimeDelta::hours(1);
    let site = StubSite::spawn(vec![
        (
            "/news/",
            Page::ok(listing(&[("/news/1.html", "Irrigation subsidy notice 1")])),
        ),
        (
            "/news/1.html",
            Page::ok(article("Irrigation subsidy notice 1", published)),
        ),
        ("/blocked/", Page::status(403, "Forbidden")),
    ]);
    let webhook = StubWebhook::spawn();
    let data_dir = tempfile::tempdir()?;
    let app = App::from_settings(settings(data_dir.path(), &webhook))?;
    let sources = import(
        &app,
        &[
            ("Notices", site.url("/news/").as_str()),
            ("Blocked", site.url("/blocked/").as_str()),
        ],
    )
    .await?;
    let (healthy, blocked) = (&sources[0], &sources[1]);

    let report = app.orchestrator.run_once(Utc::now()).await?;
    assert!(report.is_partial());

    let blocked_report = report_for(&report, blocked);
    assert_eq!(blocked_report.phase, SourcePhase::Errored);
    assert_eq!(blocked_report.stats.errors, 1);
    assert!(!blocked_report.is_active);

    let healthy_report = report_for(&report, healthy);
    assert_eq!(healthy_report.phase, SourcePhase::Done);
    assert_eq!(healthy_report.stats.pushed, 1);
    assert!(healthy_report.is_active);

    let stored = app.store.get_source(&blocked.id).await?.expect("stored");
    assert!(!stored.is_active);
    let last_error = stored.last_error.clone().unwrap_or_default();
    assert!(
        last_error.starts_with("AutoDisabled:WAFBlocked:HTTP 403"),
        "{last_error}"
    );

    let health = HealthSummary::build(&app.store.list_sources().await?, 5, Utc::now());
    assert_eq!(health.disabled, 1);
    assert_eq!(health.top_erroring.len(), 1);
    assert_eq!(health.top_erroring[0].id, blocked.id);
    assert_eq!(
        health.top_erroring[0].error_tag.as_deref(),
        Some("AutoDisabled:WAFBlocked:HTTP 403")
    );

    // A disabled source is not run again until re-enabled.
    let next = app
        .orchestrator
        .run_once(Utc::now() + TimeDelta::hours(2))
        .await?;
    assert!(next.sources.iter().all(|s| s.source_id != blocked.id));
    assert_eq!(site.hits("/blocked/"), 1);

    let audit = std::fs::read_to_string(data_dir.path().join("audit.jsonl"))?;
    assert!(audit.contains("source:auto_disable"));
    Ok(())
}

#[tokio::test]
async fn slow_details_exhaust_the_budget_once() -> anyhow::Result<()> {
    let published = Utc::now() - TimeDelta::hours(1);
    let site = StubSite::spawn(vec![
        (
            "/news/",
            Page::ok(listing(&[
                ("/news/1.html", "Irrigation subsidy notice 1"),
                ("/news/2.html", "Irrigation subsidy notice 2"),
            ])),
        ),
        (
            "/news/1.html",
            Page::ok(article("Irrigation subsidy notice 1", published))
                .delayed(Duration::from_secs(3)),
        ),
        (
            "/news/2.html",
            Page::ok(article("Irrigation subsidy notice 2", published)),
        ),
    ]);
    let webhook = StubWebhook::spawn();
    let data_dir = tempfile::tempdir()?;
    let app = App::from_settings(Settings {
        source_budget_secs: 1,
        ..settings(data_dir.path(), &webhook)
    })?;
    let sources = import(&app, &[("Notices", site.url("/news/").as_str())]).await?;

    let report = app.orchestrator.run_once(Utc::now()).await?;
    let source = report_for(&report, &sources[0]);
    assert_eq!(source.stats.fetched, 2);
    assert_eq!(source.stats.errors, 1);
    assert_eq!(source.stats.pushed, 0);
    assert!(!source.is_active);
    assert!(
        source
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with("AutoDisabled:BudgetExceeded")),
        "{:?}",
        source.last_error
    );
    assert!(webhook.received().is_empty());
    Ok(())
}

#[tokio::test]
async fn spa_shell_listing_is_a_dynamic_site() -> anyhow::Result<()> {
    let site = StubSite::spawn(vec![(
        "/news/",
        Page::ok(
            "<!doctype html><html><head><title>App</title></head>\
             <body><div id=\"app\"></div><script src=\"/app.js\"></script></body></html>",
        ),
    )]);
    let webhook = StubWebhook::spawn();
    let data_dir = tempfile::tempdir()?;
    let app = App::from_settings(settings(data_dir.path(), &webhook))?;
    let sources = import(&app, &[("Spa", site.url("/news/").as_str())]).await?;

    let report = app.orchestrator.run_once(Utc::now()).await?;
    let source = report_for(&report, &sources[0]);
    assert_eq!(source.phase, SourcePhase::Errored);
    assert_eq!(source.stats.errors, 1);
    assert!(
        source
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with("AutoDisabled:DynamicSite:")),
        "{:?}",
        source.last_error
    );
    Ok(())
}

#[tokio::test]
async fn failed_push_is_retried_on_the_next_run() -> anyhow::Result<()> {
    let site = news_site(1);
    let webhook = StubWebhook::spawn();
    webhook.set_failing(true);
    let data_dir = tempfile::tempdir()?;
    let app = App::from_settings(settings(data_dir.path(), &webhook))?;
    let sources = import(&app, &[("Notices", site.url("/news/").as_str())]).await?;

    let now = Utc::now();
    let first = app.orchestrator.run_once(now).await?;
    let stats = report_for(&first, &sources[0]).stats;
    assert_eq!(stats.upserted, 1);
    assert_eq!(stats.pushed, 0);
    assert_eq!(stats.errors, 0);
    assert_eq!(webhook.attempts(), 1);

    let documents = app.store.list_documents(&sources[0].id).await?;
    assert_eq!(documents[0].push_attempts, 1);
    assert!(documents[0].pushed_at.is_none());
    let stored = app.store.get_source(&sources[0].id).await?.expect("stored");
    assert!(stored.is_active);

    webhook.set_failing(false);
    let second = app.orchestrator.run_once(now + TimeDelta::hours(2)).await?;
    let stats = report_for(&second, &sources[0]).stats;
    assert_eq!(stats.upserted, 0);
    assert_eq!(stats.pushed, 1);

    let received = webhook.received();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0]["title"].as_str(),
        Some("Irrigation subsidy notice 1")
    );
    let documents = app.store.list_documents(&sources[0].id).await?;
    assert!(documents[0].pushed_at.is_some());
    Ok(())
}
