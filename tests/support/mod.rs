#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct Page {
    pub status: u16,
    pub body: String,
    pub delay: Option<Duration>,
}

impl Page {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: None,
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Static pages keyed by path. `{BASE}` in a body is replaced with the server's base URL.
pub struct StubSite {
    pub base_url: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StubSite {
    pub fn spawn(pages: Vec<(&str, Page)>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start stub site");
        let base_url = format!("http://{}", server.server_addr());

        let pages: HashMap<String, Page> = pages
            .into_iter()
            .map(|(path, mut page)| {
                page.body = page.body.replace("{BASE}", &base_url);
                (path.to_owned(), page)
            })
            .collect();
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let hits_in_server = Arc::clone(&hits);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let path = request.url().split('?').next().unwrap_or("").to_owned();
                *hits_in_server.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

                let Some(page) = pages.get(&path) else {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                };
                if let Some(delay) = page.delay {
                    thread::sleep(delay);
                }
                let response = tiny_http::Response::from_string(page.body.clone())
                    .with_status_code(page.status)
                    .with_header(
                        tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/html; charset=utf-8"[..],
                        )
                        .unwrap(),
                    );
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl Drop for StubSite {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Records every JSON body posted to it; answers 500 while `failing` is set.
pub struct StubWebhook {
    pub url: String,
    received: Arc<Mutex<Vec<Value>>>,
    failing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StubWebhook {
    pub fn spawn() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start stub webhook");
        let url = format!("http://{}/hook", server.server_addr());

        let received = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicUsize::new(0));
        let (received_in, failing_in, attempts_in) = (
            Arc::clone(&received),
            Arc::clone(&failing),
            Arc::clone(&attempts),
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                if request.method() != &tiny_http::Method::Post || request.url() != "/hook" {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }
                attempts_in.fetch_add(1, Ordering::SeqCst);

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(
                        tiny_http::Response::from_string("invalid request body")
                            .with_status_code(400),
                    );
                    continue;
                }

                if failing_in.load(Ordering::SeqCst) {
                    let _ = request.respond(
                        tiny_http::Response::from_string("unavailable").with_status_code(500),
                    );
                    continue;
                }

                match serde_json::from_str::<Value>(&body) {
                    Ok(value) => {
                        received_in.lock().unwrap().push(value);
                        let _ = request.respond(tiny_http::Response::from_string("ok"));
                    }
                    Err(_) => {
                        let _ = request.respond(
                            tiny_http::Response::from_string("invalid json").with_status_code(400),
                        );
                    }
                }
            }
        });

        Self {
            url,
            received,
            failing,
            attempts,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Drop for StubWebhook {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn listing(links: &[(&str, &str)]) -> String {
    let anchors: String = links
        .iter()
        .map(|(href, text)| format!("      <li><a href=\"{href}\">{text}</a></li>\n"))
        .collect();
    format!(
        r#"<!doctype html>
<html>
  <head><title>Notices</title></head>
  <body>
    <nav><a href="/">Home</a></nav>
    <ul class="list">
{anchors}    </ul>
  </body>
</html>
"#
    )
}

/// A detail page with a long `.article` body and a machine-readable publish time.
pub fn article(title: &str, published_at: DateTime<Utc>) -> String {
    let paragraph = format!(
        "<p>{title}: the provincial office published revised guidance for irrigation \
         subsidies, covering eligibility, application windows and the documents applicants \
         must submit before the end of the quarter.</p>"
    );
    format!(
        r#"<!doctype html>
<html>
  <head>
    <title>{title} - Notices</title>
    <meta property="article:published_time" content="{published}">
  </head>
  <body>
    <header>Site header</header>
    <h1>{title}</h1>
    <div class="article">
      {paragraph}
      {paragraph}
      {paragraph}
    </div>
    <footer>Footer links</footer>
  </body>
</html>
"#,
        published = published_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

pub fn sources_yaml(entries: &[(&str, &str)]) -> String {
    let mut out = String::from("sources:\n");
    for (name, root_url) in entries {
        out.push_str(&format!(
            "  - name: {name}\n    kind: HTML\n    root_url: {root_url}\n    crawl:\n      detail_pattern: '/news/\\d+\\.html$'\n      content_selector: .article\n      title_selector: h1\n"
        ));
    }
    out
}
