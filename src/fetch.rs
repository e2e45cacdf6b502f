use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context as _;
use std::sync::LazyLock;

use encoding_rs::{Encoding, UTF_8};
use regex::Regex;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio::time::Instant;
use url::Url;

use crate::error::FetchError;
use crate::model::TransportHint;

/// Hosts are never hit more often than this, whatever the configuration says.
pub const MIN_HOST_INTERVAL: Duration = Duration::from_millis(500);

/// 2xx bodies below this size that carry a challenge marker are interstitials, not content.
const INTERSTITIAL_MAX_BYTES: usize = 4096;

const DEFAULT_USER_AGENT: &str = "sourcewatch/0.1";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf_chl_opt",
    "challenge-platform",
    "Just a moment...",
    "__jsl_clearance",
    "acw_sc__v2",
    "$_ts=window",
    "yunsuo_session_verify",
    "wzws_cid",
    "Please enable JavaScript and cookies",
];

const SPA_SHELL_MARKERS: &[&str] = &[
    "<div id=\"app\"></div>",
    "<div id=\"root\"></div>",
    "window.__INITIAL_STATE__",
    "ng-app",
    "You need to enable JavaScript",
];

/// Per-host request spacing shared by every worker of one run.
#[derive(Debug)]
pub struct HostThrottle {
    interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_HOST_INTERVAL),
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Books the next free slot for `host` at or after `now`.
    ///
    /// Returns `None` without booking when that slot would not start before `deadline`.
    pub fn reserve_before(&self, host: &str, now: Instant, deadline: Instant) -> Option<Instant> {
        let mut slots = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
        let at = match slots.get(host) {
            Some(next) if *next > now => *next,
            _ => now,
        };
        if at >= deadline {
            return None;
        }
        slots.insert(host.to_owned(), at + self.interval);
        Some(at)
    }

    /// Sleeps until `url`'s host may be hit again.
    ///
    /// Fails with `BudgetExceeded`, without sleeping, when that turn would not come before `deadline`.
    pub async fn wait_turn(&self, url: &Url, deadline: Instant) -> Result<(), FetchError> {
        let now = Instant::now();
        let host = url.host_str().unwrap_or_default();
        let slot = if now >= deadline {
            None
        } else {
            self.reserve_before(host, now, deadline)
        };
        let Some(slot) = slot else {
            return Err(FetchError::BudgetExceeded {
                url: url.to_string(),
            });
        };
        tokio::time::sleep_until(slot).await;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub body: String,
    pub final_url: Url,
    pub status: u16,
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    default_client: reqwest::Client,
    browser_client: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> anyhow::Result<Self> {
        let default_client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build default http client")?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        let browser_client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(headers)
            .http1_only()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build browser-profile http client")?;

        Ok(Self {
            default_client,
            browser_client,
        })
    }

    /// GET `url` under the per-call `timeout` and the run `deadline`.
    ///
    /// Host spacing is the caller's job (`HostThrottle::wait_turn`), so that no connection
    /// permit is held while waiting for a turn.
    pub async fn fetch(
        &self,
        url: &Url,
        transport: TransportHint,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<Fetched, FetchError> {
        let url_str = url.to_string();
        let budget_exceeded = || FetchError::BudgetExceeded {
            url: url_str.clone(),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(budget_exceeded());
        }
        let cut_by_deadline = remaining < timeout;
        let limit = timeout.min(remaining);

        let client = match transport {
            TransportHint::Default => &self.default_client,
            TransportHint::Browser => &self.browser_client,
        };

        tracing::debug!(url = %url, ?transport, ?limit, "fetch");
        let attempt = tokio::time::timeout(limit, async {
            let response = client.get(url.clone()).send().await?;
            let status = response.status().as_u16();
            let final_url = response.url().clone();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, final_url, decode_body(content_type.as_deref(), &bytes)))
        })
        .await;

        let (status, final_url, body) = match attempt {
            Err(_) if cut_by_deadline => return Err(budget_exceeded()),
            Err(_) => return Err(FetchError::Timeout { url: url_str.clone() }),
            Ok(Err(err)) => return Err(classify_transport_error(&url_str, &err)),
            Ok(Ok(parts)) => parts,
        };

        classify_response(&url_str, status, &body)?;
        Ok(Fetched {
            body,
            final_url,
            status,
        })
    }
}

/// How far into the body a `<meta>` charset declaration is looked for.
const META_SNIFF_BYTES: usize = 2048;

static META_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?\s*([a-z0-9_:.\-]+)"#).expect("static regex")
});

/// Decodes a response body: header charset, then `<meta>` charset, then UTF-8.
pub fn decode_body(content_type: Option<&str>, bytes: &[u8]) -> String {
    let from_header = content_type
        .and_then(|value| {
            value
                .split(';')
                .filter_map(|param| param.trim().split_once('='))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
                .map(|(_, label)| label.trim().trim_matches('"').to_owned())
        })
        .and_then(|label| Encoding::for_label(label.as_bytes()));
    let encoding = from_header
        .or_else(|| {
            let head = String::from_utf8_lossy(&bytes[..bytes.len().min(META_SNIFF_BYTES)]);
            META_CHARSET
                .captures(&head)
                .and_then(|caps| caps.get(1))
                .and_then(|label| Encoding::for_label(label.as_str().as_bytes()))
        })
        .unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

fn classify_transport_error(url: &str, err: &reqwest::Error) -> FetchError {
    tracing::debug!(url, ?err, "transport error");
    if err.is_timeout() {
        return FetchError::Timeout {
            url: url.to_owned(),
        };
    }
    let reason = if err.is_connect() {
        "connect"
    } else if err.is_redirect() {
        "redirect"
    } else if err.is_body() || err.is_decode() {
        "body"
    } else {
        "request"
    };
    FetchError::Network {
        reason: reason.to_owned(),
        url: url.to_owned(),
        status: None,
    }
}

pub fn challenge_marker(body: &str) -> Option<&'static str> {
    CHALLENGE_MARKERS
        .iter()
        .copied()
        .find(|marker| body.contains(marker))
}

/// Maps an HTTP response onto the fetch error taxonomy. `Ok` means usable content.
pub fn classify_response(url: &str, status: u16, body: &str) -> Result<(), FetchError> {
    if matches!(status, 403 | 412) {
        return Err(FetchError::WafBlocked {
            reason: format!("HTTP {status}"),
            url: url.to_owned(),
            status: Some(status),
        });
    }

    if !(200..300).contains(&status) {
        if let Some(marker) = challenge_marker(body) {
            return Err(FetchError::WafBlocked {
                reason: marker.to_owned(),
                url: url.to_owned(),
                status: Some(status),
            });
        }
        return Err(FetchError::Network {
            reason: format!("HTTP {status}"),
            url: url.to_owned(),
            status: Some(status),
        });
    }

    if body.len() < INTERSTITIAL_MAX_BYTES
        && let Some(marker) = challenge_marker(body)
    {
        return Err(FetchError::WafBlocked {
            reason: marker.to_owned(),
            url: url.to_owned(),
            status: Some(status),
        });
    }

    Ok(())
}

/// A listing page without a single anchor is a rendering problem when the site is known
/// (or looks) to build its DOM client-side. Heuristic only: an honestly empty listing on such
/// a site is classified the same way.
pub fn classify_listing(
    url: &str,
    body: &str,
    anchors_seen: usize,
    requires_js: bool,
) -> Option<FetchError> {
    if anchors_seen > 0 {
        return None;
    }
    if requires_js {
        return Some(FetchError::DynamicSite {
            reason: "no anchors on js-rendered listing".to_owned(),
            url: url.to_owned(),
        });
    }
    SPA_SHELL_MARKERS
        .iter()
        .find(|marker| body.contains(*marker))
        .map(|marker| FetchError::DynamicSite {
            reason: format!("spa shell ({marker})"),
            url: url.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_spaces_requests_per_host() {
        let throttle = HostThrottle::new(Duration::from_millis(500));
        let now = Instant::now();
        let far = now + Duration::from_secs(60);

        let first = throttle.reserve_before("a.example", now, far);
        let second = throttle.reserve_before("a.example", now, far);
        let other = throttle.reserve_before("b.example", now, far);

        assert_eq!(first, Some(now));
        assert_eq!(second, Some(now + Duration::from_millis(500)));
        assert_eq!(other, Some(now));
    }

    #[test]
    fn throttle_never_goes_below_floor() {
        let throttle = HostThrottle::new(Duration::from_millis(10));
        assert_eq!(throttle.interval(), MIN_HOST_INTERVAL);
    }

    #[test]
    fn throttle_refuses_slots_past_deadline() {
        let throttle = HostThrottle::new(Duration::from_millis(500));
        let now = Instant::now();
        let deadline = now + Duration::from_millis(300);

        assert_eq!(throttle.reserve_before("a.example", now, deadline), Some(now));
        assert_eq!(throttle.reserve_before("a.example", now, deadline), None);
        // the refused call did not book anything
        let later = now + Duration::from_millis(500);
        assert_eq!(
            throttle.reserve_before("a.example", later, later + Duration::from_secs(1)),
            Some(later)
        );
    }

    #[tokio::test]
    async fn wait_turn_refuses_past_deadline_without_sleeping() -> anyhow::Result<()> {
        let throttle = HostThrottle::new(Duration::from_millis(500));
        let url = Url::parse("https://a.example/1.html")?;
        let deadline = Instant::now() + Duration::from_millis(200);

        throttle.wait_turn(&url, deadline).await?;
        let started = Instant::now();
        let err = throttle.wait_turn(&url, deadline).await.unwrap_err();
        assert_eq!(err.to_string(), "BudgetExceeded");
        assert!(started.elapsed() < Duration::from_millis(100));
        Ok(())
    }

    #[test]
    fn meta_charset_decodes_gbk_pages() {
        // "通知" in GBK
        let mut bytes = b"<html><head><meta http-equiv=\"Content-Type\" content=\"text/html; charset=gb2312\"></head><body>".to_vec();
        bytes.extend_from_slice(&[0xCD, 0xA8, 0xD6, 0xAA]);
        bytes.extend_from_slice(b"</body></html>");

        assert!(decode_body(Some("text/html"), &bytes).contains("通知"));
        assert!(decode_body(None, &bytes).contains("通知"));
    }

    #[test]
    fn header_charset_wins_and_utf8_is_default() {
        let utf8 = "<html><meta charset=\"gbk\"><body>通知</body></html>".as_bytes();
        assert!(decode_body(Some("text/html; charset=UTF-8"), utf8).contains("通知"));
        assert!(decode_body(None, "<p>plain é</p>".as_bytes()).contains("é"));
    }

    #[test]
    fn forbidden_and_precondition_failed_are_waf() {
        for status in [403, 412] {
            let err = classify_response("https://x.example/", status, "<html></html>").unwrap_err();
            assert_eq!(err.to_string(), format!("WAFBlocked:HTTP {status}"));
        }
    }

    #[test]
    fn challenge_body_on_error_status_is_waf() {
        let body = "<html><script>var cf_chl_opt = {};</script></html>";
        let err = classify_response("https://x.example/", 503, body).unwrap_err();
        assert_eq!(err.to_string(), "WAFBlocked:cf_chl_opt");
    }

    #[test]
    fn plain_error_status_is_network_error() {
        let err = classify_response("https://x.example/", 502, "bad gateway").unwrap_err();
        assert_eq!(err.to_string(), "NetworkError:HTTP 502");
        assert_eq!(err.status(), Some(502));
    }

    #[test]
    fn small_ok_interstitial_is_waf_but_large_page_is_content() {
        let interstitial = "<html><title>Just a moment...</title></html>";
        assert!(classify_response("https://x.example/", 200, interstitial).is_err());

        let article = format!("<html><body><p>Just a moment...</p>{}</body></html>", "x".repeat(5000));
        assert!(classify_response("https://x.example/", 200, &article).is_ok());
    }

    #[test]
    fn empty_listing_on_js_site_is_dynamic() {
        let err = classify_listing("https://x.example/list", "<html><body></body></html>", 0, true)
            .expect("dynamic site");
        assert!(err.to_string().starts_with("DynamicSite:"));
    }

    #[test]
    fn empty_listing_without_hint_or_shell_is_not_an_error() {
        assert!(
            classify_listing("https://x.example/list", "<html><body><p>none</p></body></html>", 0, false)
                .is_none()
        );
    }

    #[test]
    fn spa_shell_without_hint_is_dynamic() {
        let body = "<html><body><div id=\"app\"></div><script src=\"/app.js\"></script></body></html>";
        assert!(classify_listing("https://x.example/list", body, 0, false).is_some());
        assert!(classify_listing("https://x.example/list", body, 3, false).is_none());
    }
}
