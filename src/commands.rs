use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;

use crate::app::App;
use crate::app::orchestrator::RunReport;
use crate::audit::{Actor, AuditEntry};
use crate::cli::{
    DigestArgs, EnableArgs, HealthArgs, ImportArgs, ListArgs, ReviewArgs, RunArgs, WatchArgs,
};
use crate::config::{self, Settings};
use crate::health::HealthSummary;
use crate::model::DocumentStatus;
use crate::summarize::{OpenAiSummarizer, Summarizer};

pub async fn run(settings: Settings, args: RunArgs) -> anyhow::Result<()> {
    let app = App::from_settings(settings)?;
    let report = app.orchestrator.run_once(Utc::now()).await?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize run report")?
        );
    } else {
        print!("{}", render_report(&report));
    }
    Ok(())
}

pub async fn watch(settings: Settings, args: WatchArgs) -> anyhow::Result<()> {
    let interval = Duration::from_secs(args.interval_secs.unwrap_or(settings.watch_interval_secs));
    let health_path = settings.health_path();
    let top_n = settings.health_top_n;
    let app = App::from_settings(settings)?;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; stopping");
                return Ok(());
            }
        }

        match app.orchestrator.run_once(Utc::now()).await {
            Ok(report) => tracing::info!(
                sources = report.sources.len(),
                pushed = report.totals.pushed,
                errors = report.totals.errors,
                "tick done"
            ),
            Err(err) => tracing::error!(error = %format!("{err:#}"), "tick failed"),
        }

        let sources = app.store.list_sources().await.context("list sources")?;
        HealthSummary::build(&sources, top_n, Utc::now())
            .write_json(&health_path)
            .await
            .context("write health summary")?;

        ticks += 1;
        if args.max_ticks.is_some_and(|max| ticks >= max) {
            return Ok(());
        }
    }
}

pub async fn health(settings: Settings, args: HealthArgs) -> anyhow::Result<()> {
    let top_n = args.top.unwrap_or(settings.health_top_n);
    let app = App::from_settings(settings)?;
    let sources = app.store.list_sources().await.context("list sources")?;
    let summary = HealthSummary::build(&sources, top_n, Utc::now());

    if let Some(out) = &args.out {
        summary
            .write_json(out)
            .await
            .with_context(|| format!("write health summary: {}", out.display()))?;
    }
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize health summary")?
        );
    } else {
        print!("{}", summary.render_text());
    }
    Ok(())
}

pub async fn import_sources(settings: Settings, args: ImportArgs) -> anyhow::Result<()> {
    let specs = config::load_source_specs(&args.file)?;
    let app = App::from_settings(settings)?;
    let results = config::import_sources(app.store.as_ref(), specs).await?;
    for (source, outcome) in results {
        println!("{:?}\t{}\t{}", outcome, source.id, source.root_url);
    }
    Ok(())
}

pub async fn list_sources(settings: Settings, args: ListArgs) -> anyhow::Result<()> {
    let app = App::from_settings(settings)?;
    let sources = app.store.list_sources().await.context("list sources")?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&sources).context("serialize sources")?
        );
        return Ok(());
    }
    for source in sources {
        let state = match (source.is_active, source.needs_review) {
            (false, _) => "disabled",
            (true, true) => "review",
            (true, false) => "active",
        };
        println!(
            "{}\t{:?}\t{}\t{}\t{}",
            source.id, source.kind, state, source.name, source.root_url
        );
    }
    Ok(())
}

pub async fn enable_source(settings: Settings, args: EnableArgs) -> anyhow::Result<()> {
    let app = App::from_settings(settings)?;
    let Some(mut source) = app.store.get_source(&args.source_id).await? else {
        anyhow::bail!("unknown source: {}", args.source_id);
    };
    let before = serde_json::json!({
        "is_active": source.is_active,
        "last_error": source.last_error,
    });
    source.is_active = true;
    source.needs_review = false;
    source.zero_fetch_streak = 0;
    source.last_error = None;
    app.store.save_source(&source).await?;
    app.audit
        .record(
            AuditEntry::new(&Actor::Human(operator()), "source:enable", Utc::now())
                .source(&source.id)
                .important(true)
                .before(before)
                .after(serde_json::json!({ "is_active": true })),
        )
        .await?;
    println!("enabled {}", source.id);
    Ok(())
}

pub async fn review(settings: Settings, args: ReviewArgs) -> anyhow::Result<()> {
    let app = App::from_settings(settings)?;
    let Some(mut document) = app
        .store
        .get_document(&args.source, &args.document)
        .await?
    else {
        anyhow::bail!("unknown document {} of source {}", args.document, args.source);
    };

    let status = if args.approve {
        DocumentStatus::Approved
    } else {
        DocumentStatus::Rejected
    };
    let before = document.status;
    document.status = status;
    app.store.put_document(&document).await?;

    let action = if args.approve {
        "review:approve"
    } else {
        "review:reject"
    };
    app.audit
        .record(
            AuditEntry::new(&Actor::Human(args.reviewer.clone()), action, Utc::now())
                .source(&document.source_id)
                .document(&document.id)
                .important(true)
                .before(serde_json::json!({ "status": before }))
                .after(serde_json::json!({ "status": status })),
        )
        .await?;
    println!("{} {:?}", document.id, status);
    Ok(())
}

pub async fn digest(settings: Settings, args: DigestArgs) -> anyhow::Result<()> {
    let api_key = settings
        .openai_api_key
        .clone()
        .context("an OpenAI API key is required (OPENAI_API_KEY or SOURCEWATCH_OPENAI_API_KEY)")?;
    let summarizer = OpenAiSummarizer::new(&settings.openai_base_url, api_key, &settings.openai_model);
    let app = App::from_settings(settings)?;
    let Some(source) = app.store.get_source(&args.source).await? else {
        anyhow::bail!("unknown source: {}", args.source);
    };

    let documents = app
        .store
        .list_documents(&args.source)
        .await
        .context("list documents")?;
    let targets: Vec<_> = documents
        .into_iter()
        .filter(|doc| args.document.as_deref().is_none_or(|id| doc.id == id))
        .filter(|doc| doc.status != DocumentStatus::Skipped)
        .filter(|doc| args.force || doc.digest.is_none())
        .take(args.limit)
        .collect();

    let mut done = 0;
    for mut document in targets {
        match summarizer.summarize(&source, &document).await {
            Ok(digest) => {
                document.digest = Some(digest);
                app.store.put_document(&document).await?;
                done += 1;
                println!("{}\t{}", document.id, document.title);
            }
            Err(err) => {
                tracing::warn!(document_id = %document.id, error = %format!("{err:#}"), "summarize failed");
            }
        }
    }
    tracing::info!(summarized = done, "digest done");
    Ok(())
}

fn operator() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_owned())
}

fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    for source in &report.sources {
        let s = &source.stats;
        out.push_str(&format!(
            "{}\t{:?}\tfetched={} upserted={} pushed={} dedup={} too_old={} limited={} errors={}{}\n",
            source.source_id,
            source.phase,
            s.fetched,
            s.upserted,
            s.pushed,
            s.dedup_skipped,
            s.skipped_too_old,
            s.skipped_by_limit,
            s.errors,
            source
                .last_error
                .as_deref()
                .map(|e| format!("\t{e}"))
                .unwrap_or_default(),
        ));
    }
    let t = &report.totals;
    out.push_str(&format!(
        "total: sources={} fetched={} upserted={} pushed={} errors={}\n",
        report.sources.len(),
        t.fetched,
        t.upserted,
        t.pushed,
        t.errors
    ));
    out
}
