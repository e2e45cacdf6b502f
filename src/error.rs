use chrono::{DateTime, SecondsFormat, Utc};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("WAFBlocked:{reason}")]
    WafBlocked {
        reason: String,
        url: String,
        status: Option<u16>,
    },
    #[error("DynamicSite:{reason}")]
    DynamicSite { reason: String, url: String },
    #[error("TimeoutError")]
    Timeout { url: String },
    #[error("BudgetExceeded")]
    BudgetExceeded { url: String },
    #[error("NetworkError:{reason}")]
    Network {
        reason: String,
        url: String,
        status: Option<u16>,
    },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::WafBlocked { url, .. }
            | FetchError::DynamicSite { url, .. }
            | FetchError::Timeout { url }
            | FetchError::BudgetExceeded { url }
            | FetchError::Network { url, .. } => url,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::WafBlocked { status, .. } | FetchError::Network { status, .. } => *status,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("insufficient content ({chars} chars)")]
    InsufficientContent { chars: usize },
}

/// Everything that can go wrong for one candidate or one source during a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("ParseError")]
    Parse { url: String, reason: String },
    #[error("ParseError")]
    InsufficientContent { url: String, chars: usize },
    #[error("PushFailure")]
    PushFailure { document_id: String, reason: String },
}

impl IngestError {
    pub fn extract(url: &str, err: ExtractError) -> Self {
        match err {
            ExtractError::InsufficientContent { chars } => IngestError::InsufficientContent {
                url: url.to_owned(),
                chars,
            },
        }
    }

    /// Classification tag, e.g. `WAFBlocked:HTTP 403`.
    pub fn tag(&self) -> String {
        self.to_string()
    }

    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, IngestError::Fetch(FetchError::BudgetExceeded { .. }))
    }

    /// Free-text line stored in a source's `last_error`.
    pub fn last_error_line(&self, at: DateTime<Utc>) -> String {
        let mut line = self.tag();
        match self {
            IngestError::Fetch(err) => {
                line.push_str(&format!(" url={}", err.url()));
                if let Some(status) = err.status() {
                    line.push_str(&format!(" status={status}"));
                }
            }
            IngestError::Parse { url, reason } => {
                line.push_str(&format!(" url={url} reason={reason}"));
            }
            IngestError::InsufficientContent { url, chars } => {
                line.push_str(&format!(" url={url} reason=insufficient content ({chars} chars)"));
            }
            IngestError::PushFailure {
                document_id,
                reason,
            } => {
                line.push_str(&format!(" document={document_id} reason={reason}"));
            }
        }
        line.push_str(&format!(
            " at={}",
            at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn last_error_line_carries_tag_context_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 5, 4, 3, 2, 1).unwrap();
        let err = IngestError::from(FetchError::WafBlocked {
            reason: "HTTP 412".to_owned(),
            url: "https://gov.example.cn/list.htm".to_owned(),
            status: Some(412),
        });
        assert_eq!(
            err.last_error_line(at),
            "WAFBlocked:HTTP 412 url=https://gov.example.cn/list.htm status=412 at=2026-05-04T03:02:01Z"
        );
    }

    #[test]
    fn tags_follow_classification_names() {
        let timeout = IngestError::from(FetchError::Timeout {
            url: "https://a.example/".to_owned(),
        });
        assert_eq!(timeout.tag(), "TimeoutError");

        let budget = IngestError::from(FetchError::BudgetExceeded {
            url: "https://a.example/".to_owned(),
        });
        assert_eq!(budget.tag(), "BudgetExceeded");
        assert!(budget.is_budget_exceeded());

        let thin = IngestError::extract(
            "https://a.example/1.html",
            ExtractError::InsufficientContent { chars: 12 },
        );
        assert_eq!(thin.tag(), "ParseError");
    }
}
