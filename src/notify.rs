use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{Attachment, Document, Source};

/// Body of one push to the downstream channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PushMessage {
    pub document_id: String,
    pub source_id: String,
    pub source_name: String,
    pub title: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl PushMessage {
    pub fn new(source: &Source, document: &Document) -> Self {
        Self {
            document_id: document.id.clone(),
            source_id: source.id.clone(),
            source_name: source.name.clone(),
            title: document.title.clone(),
            url: document.url.clone(),
            published_at: document.published_at,
            summary: document.digest.as_ref().map(|digest| digest.summary.clone()),
            attachments: document.attachments.clone(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn push(&self, message: &PushMessage) -> anyhow::Result<()>;
}

/// POSTs each message as JSON; any non-2xx answer is a failure.
pub struct WebhookNotifier {
    url: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build webhook http client")?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn push(&self, message: &PushMessage) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(&self.url)
            .json(message)
            .send()
            .await
            .context("send webhook request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %body, "webhook returned non-success");
            anyhow::bail!("webhook returned {status}");
        }
        Ok(())
    }
}

/// Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn push(&self, message: &PushMessage) -> anyhow::Result<()> {
        tracing::info!(
            document_id = %message.document_id,
            source_id = %message.source_id,
            title = %message.title,
            url = %message.url,
            "push"
        );
        Ok(())
    }
}
