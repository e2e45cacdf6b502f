pub mod http;
pub mod orchestrator;
pub mod pool;
pub mod store;

use std::sync::Arc;

use crate::audit::{AuditSink, JsonlAuditSink};
use crate::config::Settings;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};

use self::orchestrator::Orchestrator;
use self::store::{LocalFsStore, Store};

/// Collaborators wired from settings, shared by the CLI and the app server.
pub struct App {
    pub settings: Settings,
    pub store: Arc<dyn Store>,
    pub audit: Arc<dyn AuditSink>,
    pub orchestrator: Arc<Orchestrator>,
}

impl App {
    pub fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let store: Arc<dyn Store> = Arc::new(LocalFsStore::new(&settings.data_dir));
        let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::new(settings.audit_log_path()));
        let notifier = notifier_for(&settings)?;
        let orchestrator = Orchestrator::new(
            settings.clone(),
            Arc::clone(&store),
            Arc::clone(&audit),
            notifier,
        )?;
        Ok(Self {
            settings,
            store,
            audit,
            orchestrator: Arc::new(orchestrator),
        })
    }
}

pub fn notifier_for(settings: &Settings) -> anyhow::Result<Arc<dyn Notifier>> {
    match &settings.webhook_url {
        Some(url) => {
            tracing::info!(webhook = %url, "pushing to webhook");
            Ok(Arc::new(WebhookNotifier::new(
                url.clone(),
                std::time::Duration::from_secs(settings.webhook_timeout_secs),
            )?))
        }
        None => {
            tracing::info!("no webhook configured; pushes are logged only");
            Ok(Arc::new(LogNotifier))
        }
    }
}
