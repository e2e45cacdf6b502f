use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;

use sourcewatch::app::App;
use sourcewatch::app::http::{AppState, router};
use sourcewatch::config::Settings;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Settings YAML file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    sourcewatch::logging::init()?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting sourcewatch-app");

    let mut settings = Settings::load(args.config.as_deref()).context("load settings")?;
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }
    let health_path = settings.health_path();
    let top_n = settings.health_top_n;
    let app = App::from_settings(settings)?;

    let state = AppState::new(app.orchestrator, app.store, top_n, Some(health_path));
    let router = router(state);

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}
