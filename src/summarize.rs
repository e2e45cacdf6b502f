use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;

use crate::model::{Document, DocumentDigest, Source};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Body characters sent to the model; longer documents are cut.
const MAX_INPUT_CHARS: usize = 12_000;

const INSTRUCTIONS: &str = "You summarize official notices and news items for a monitoring feed. \
Reply with a single JSON object and nothing else, shaped as \
{\"summary\": string, \"key_points\": [string]}. The summary is at most three sentences in the \
language of the document. key_points lists at most five short facts (dates, amounts, deadlines, \
affected parties).";

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, source: &Source, document: &Document)
    -> anyhow::Result<DocumentDigest>;
}

/// Summaries through the OpenAI Responses API.
pub struct OpenAiSummarizer {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiSummarizer {
    pub fn new(base_url: &str, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: responses_endpoint(base_url),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(
        &self,
        source: &Source,
        document: &Document,
    ) -> anyhow::Result<DocumentDigest> {
        let input = prompt_input(source, document);

        let request = serde_json::json!({
            "model": self.model,
            "instructions": INSTRUCTIONS,
            "input": input,
            "text": { "format": { "type": "json_object" } },
            "store": false,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        let raw = response.text().await.context("read OpenAI response body")?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or_else(|| raw.clone());
            anyhow::bail!("OpenAI API error ({status}): {message}");
        }

        let value: serde_json::Value =
            serde_json::from_str(&raw).context("parse OpenAI response")?;
        let text = extract_output_text(&value).context("extract output text")?;
        let reply = parse_digest_reply(&text)?;

        Ok(DocumentDigest {
            summary: reply.summary,
            key_points: reply.key_points,
            attachments: document.attachments.clone(),
        })
    }
}

fn prompt_input(source: &Source, document: &Document) -> String {
    let body: String = document.raw_text.chars().take(MAX_INPUT_CHARS).collect();
    format!(
        "Source: {}\nTitle: {}\nURL: {}\n\n{}",
        source.name, document.title, document.url, body
    )
}

pub fn responses_endpoint(base_url: &str) -> String {
    format!("{}/responses", base_url.trim_end_matches('/'))
}

#[derive(Debug, Deserialize)]
struct DigestReply {
    summary: String,
    #[serde(default)]
    key_points: Vec<String>,
}

/// Models sometimes wrap the object in a code fence; only the outermost braces are parsed.
fn parse_digest_reply(text: &str) -> anyhow::Result<DigestReply> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => anyhow::bail!("model reply has no JSON object"),
    };
    let reply: DigestReply = serde_json::from_str(json).context("parse digest JSON")?;
    if reply.summary.trim().is_empty() {
        anyhow::bail!("model returned an empty summary");
    }
    Ok(reply)
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    Some(value.get("error")?.get("message")?.as_str()?.to_owned())
}

fn extract_output_text(value: &serde_json::Value) -> anyhow::Result<String> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing `output` array in response"))?;

    let text: String = output
        .iter()
        .filter(|item| item.get("type").and_then(|v| v.as_str()) == Some("message"))
        .filter_map(|item| item.get("content").and_then(|v| v.as_array()))
        .flatten()
        .filter(|part| part.get("type").and_then(|v| v.as_str()) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
        .collect();

    if text.trim().is_empty() {
        anyhow::bail!("OpenAI output text is empty");
    }
    Ok(text)
}
