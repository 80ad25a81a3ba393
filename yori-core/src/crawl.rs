use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use url::Url;
use yori_scanner::error::Result;
use yori_scanner::{
    BrowserDriver, Cookie, CrawlError, Crawler, CrawlerOptions, Event, EventName, HandlerOutcome,
    Request, SessionState, Trigger,
};

/// Options for configuring a crawl operation
pub struct CrawlOptions {
    pub url: String,
    pub crawler: CrawlerOptions,
    pub show_progress_bars: bool,
    /// Cancelling this token stops the crawl at its next checkpoint.
    pub stop: Option<CancellationToken>,
}

impl CrawlOptions {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            crawler: CrawlerOptions::default(),
            show_progress_bars: false,
            stop: None,
        }
    }
}

/// A DOM subtree inserted in response to a triggered event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomChange {
    pub root: String,
    pub trigger: Option<Trigger>,
}

/// Something discovered while crawling, reported as it happens
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlFinding {
    Request(Request),
    DomChange(DomChange),
    Redirect(String),
}

/// Everything collected from one crawl session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlReport {
    pub target_url: String,
    pub redirect: Option<String>,
    pub state: SessionState,
    pub started_at: i64,
    pub finished_at: i64,
    pub events_triggered: usize,
    pub requests: Vec<Request>,
    pub dom_changes: Vec<DomChange>,
    pub errors: Vec<CrawlError>,
    pub cookies: Vec<Cookie>,
}

impl CrawlReport {
    pub fn requests_of(&self, request_type: yori_scanner::RequestType) -> Vec<&Request> {
        self.requests
            .iter()
            .filter(|r| r.request_type == request_type)
            .collect()
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at - self.started_at
    }
}

/// Callback for reporting crawl progress
pub type CrawlProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Callback for reporting individual findings as they come in
pub type CrawlResultCallback = Arc<dyn Fn(CrawlFinding) + Send + Sync>;

/// Extract the path component from a URL
pub fn extract_url_path(url: &str) -> String {
    Url::parse(url)
        .ok()
        .map(|u| {
            let path = u.path().to_string();
            if path.is_empty() || path == "/" {
                "/".to_string()
            } else {
                path
            }
        })
        .unwrap_or_else(|| url.to_string())
}

const REQUEST_EVENTS: [EventName; 6] = [
    EventName::Xhr,
    EventName::Fetch,
    EventName::Jsonp,
    EventName::WebSocket,
    EventName::FormSubmit,
    EventName::Navigation,
];

#[derive(Default)]
struct Collected {
    requests: Vec<Request>,
    dom_changes: Vec<DomChange>,
    redirect: Option<String>,
}

fn lock(collected: &Mutex<Collected>) -> std::sync::MutexGuard<'_, Collected> {
    collected.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Crawl one page through `driver` and collect what it does.
///
/// Requests, DOM changes and redirects are passed to `result_callback` as
/// they are observed; lifecycle messages go to `progress_callback`. The
/// browser page is closed before returning, whether or not the crawl
/// succeeded.
pub async fn execute_crawl(
    options: CrawlOptions,
    driver: Arc<dyn BrowserDriver>,
    progress_callback: Option<CrawlProgressCallback>,
    result_callback: Option<CrawlResultCallback>,
) -> Result<CrawlReport> {
    let CrawlOptions {
        url,
        crawler: crawler_options,
        show_progress_bars,
        stop,
    } = options;

    let progress = move |message: String| {
        if let Some(ref callback) = progress_callback {
            callback(message);
        }
    };

    // Set up single progress bar for overall crawl progress (only if enabled)
    let progress_bar = if show_progress_bars {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message("Starting crawl...");
        Some(Arc::new(pb))
    } else {
        None
    };

    let started_at = chrono::Utc::now().timestamp_millis();
    let crawler = Crawler::launch(&url, crawler_options, driver).await?;
    progress(format!("Crawling {}", crawler.target_url()));

    let collected = Arc::new(Mutex::new(Collected::default()));
    let events_triggered = Arc::new(AtomicUsize::new(0));

    for name in REQUEST_EVENTS {
        let collected = collected.clone();
        let result_callback = result_callback.clone();
        crawler.bus().add(
            name,
            Arc::new(move |event: &Event, _: &Crawler| {
                if let Some(request) = event.request() {
                    lock(&collected).requests.push(request.clone());
                    if let Some(ref callback) = result_callback {
                        callback(CrawlFinding::Request(request.clone()));
                    }
                }
                Ok(HandlerOutcome::Continue)
            }),
        );
    }

    {
        let collected = collected.clone();
        let result_callback = result_callback.clone();
        crawler.bus().add(
            EventName::NewDom,
            Arc::new(move |event: &Event, _: &Crawler| {
                if let Event::NewDom { root_node, trigger } = event {
                    let change = DomChange {
                        root: root_node.clone(),
                        trigger: trigger.clone(),
                    };
                    lock(&collected).dom_changes.push(change.clone());
                    if let Some(ref callback) = result_callback {
                        callback(CrawlFinding::DomChange(change));
                    }
                }
                Ok(HandlerOutcome::Continue)
            }),
        );
    }

    {
        let collected = collected.clone();
        let result_callback = result_callback.clone();
        crawler.bus().add(
            EventName::Redirect,
            Arc::new(move |event: &Event, _: &Crawler| {
                if let Event::Redirect { url } = event {
                    lock(&collected).redirect = Some(url.clone());
                    if let Some(ref callback) = result_callback {
                        callback(CrawlFinding::Redirect(url.clone()));
                    }
                }
                Ok(HandlerOutcome::Continue)
            }),
        );
    }

    {
        let events_triggered = events_triggered.clone();
        let pb_clone = progress_bar.clone();
        crawler.bus().add(
            EventName::EventTriggered,
            Arc::new(move |_: &Event, _: &Crawler| {
                let count = events_triggered.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(ref pb) = pb_clone {
                    pb.set_message(format!("Crawling... {} events triggered", count));
                    pb.tick();
                }
                Ok(HandlerOutcome::Continue)
            }),
        );
    }

    // Honour an external stop request before each element and event
    if let Some(token) = stop {
        for name in [EventName::CrawlElement, EventName::TriggerEvent] {
            let token = token.clone();
            crawler.bus().add(
                name,
                Arc::new(move |_: &Event, crawler: &Crawler| {
                    if token.is_cancelled() {
                        crawler.stop();
                    }
                    Ok(HandlerOutcome::Continue)
                }),
            );
        }
    }

    let outcome = run_session(&crawler).await;

    let cookies = match crawler.cookies().await {
        Ok(cookies) => cookies,
        Err(e) => {
            progress(format!("[!]  Could not read cookies: {}", e));
            Vec::new()
        }
    };
    let state = crawler.state();
    let errors = crawler.errors();
    let redirect = crawler.redirect();

    if let Err(e) = crawler.close().await {
        progress(format!("[!]  Failed to close page: {}", e));
    }

    // Finish progress bar (only if enabled)
    if let Some(ref pb) = progress_bar {
        let total = events_triggered.load(Ordering::Relaxed);
        pb.finish_with_message(format!("Crawl complete! {} events triggered", total));
    }

    outcome?;

    let Collected {
        requests,
        dom_changes,
        redirect: observed_redirect,
    } = std::mem::take(&mut *lock(&collected));

    Ok(CrawlReport {
        target_url: url,
        redirect: redirect.or(observed_redirect),
        state,
        started_at,
        finished_at: chrono::Utc::now().timestamp_millis(),
        events_triggered: events_triggered.load(Ordering::Relaxed),
        requests,
        dom_changes,
        errors,
        cookies,
    })
}

async fn run_session(crawler: &Crawler) -> Result<()> {
    crawler.load().await?;
    crawler.start().await
}
