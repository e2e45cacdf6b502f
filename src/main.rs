use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use sourcewatch::cli::{Cli, Command, SourcesCommand};
use sourcewatch::commands;
use sourcewatch::config::Settings;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    sourcewatch::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let mut settings = Settings::load(cli.config.as_deref()).context("load settings")?;
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }

    match cli.command {
        Command::Run(args) => commands::run(settings, args).await.context("run")?,
        Command::Watch(args) => commands::watch(settings, args).await.context("watch")?,
        Command::Health(args) => commands::health(settings, args).await.context("health")?,
        Command::Sources {
            command: SourcesCommand::Import(args),
        } => commands::import_sources(settings, args)
            .await
            .context("sources import")?,
        Command::Sources {
            command: SourcesCommand::List(args),
        } => commands::list_sources(settings, args)
            .await
            .context("sources list")?,
        Command::Sources {
            command: SourcesCommand::Enable(args),
        } => commands::enable_source(settings, args)
            .await
            .context("sources enable")?,
        Command::Review(args) => commands::review(settings, args).await.context("review")?,
        Command::Digest(args) => commands::digest(settings, args).await.context("digest")?,
    }

    Ok(())
}
