use crate::browser::{BindingCall, BrowserDriver};
use crate::dedup::DomDeduplicator;
use crate::error::{Result, ScanError};
use crate::events::{Event, EventBus, EventHandler, EventName, HandlerOutcome, invoke};
use crate::options::{CrawlerOptions, generate_input_values, matches_excluded_url, normalize_url};
use crate::probe::{self, BINDING_NAME};
use crate::request::{Cookie, CrawlError, PendingRequest, Request, Trigger};
use crate::session::{Session, SessionState};
use crate::tracker::PendingRequestTracker;
use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_CLICK_TIMEOUT: Duration = Duration::from_secs(5);
const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CLICK_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const COOKIE_LIFETIME_SECS: i64 = 60 * 60 * 24 * 365;

/// Message the probe sends through the binding.
#[derive(Debug, Deserialize)]
struct BridgeMessage {
    id: u64,
    name: String,
    #[serde(default)]
    params: Value,
}

enum NavigationTarget<'a> {
    Url(&'a str),
    Reload,
}

struct CrawlerInner {
    options: CrawlerOptions,
    excluded_urls: Vec<Regex>,
    input_values: BTreeMap<String, String>,
    driver: Arc<dyn BrowserDriver>,
    session: RwLock<Session>,
    bus: EventBus,
    dedup: Mutex<DomDeduplicator>,
    tracker: PendingRequestTracker,
    sent_requests: Mutex<HashSet<String>>,
    /// Handler failure raised while answering the probe, surfaced by the
    /// running crawl at its next checkpoint.
    bridge_error: Mutex<Option<ScanError>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for CrawlerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drives one page through a target site.
///
/// Cheap to clone; clones share the same session. Handlers receive a
/// reference to the crawler and may call any synchronous method on it,
/// including [`Crawler::stop`].
#[derive(Clone)]
pub struct Crawler {
    inner: Arc<CrawlerInner>,
}

impl Crawler {
    /// Prepare the browser page for crawling `url`.
    ///
    /// Exposes the probe binding, injects the probe with the serialized
    /// options and generated input values, applies cookies, headers and the
    /// user agent, and starts the background tasks. Nothing is navigated yet.
    pub async fn launch(
        url: &str,
        options: CrawlerOptions,
        driver: Arc<dyn BrowserDriver>,
    ) -> Result<Self> {
        let target_url = normalize_url(url);
        Url::parse(&target_url)
            .map_err(|e| ScanError::InvalidUrl(format!("{}: {}", target_url, e)))?;

        let excluded_urls = options.excluded_url_patterns()?;
        let input_values = generate_input_values(&options.random_seed);
        let dedup = DomDeduplicator::with_thresholds(
            options.elements_diff_threshold,
            options.simhash_threshold,
        );
        let session = Session::new(target_url.clone(), options.override_post_message);

        let crawler = Self {
            inner: Arc::new(CrawlerInner {
                options,
                excluded_urls,
                input_values,
                driver,
                session: RwLock::new(session),
                bus: EventBus::new(),
                dedup: Mutex::new(dedup),
                tracker: PendingRequestTracker::new(),
                sent_requests: Mutex::new(HashSet::new()),
                bridge_error: Mutex::new(None),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        crawler.spawn_background_tasks();
        crawler.bootstrap_page().await?;

        info!("Crawler ready for {}", target_url);
        Ok(crawler)
    }

    fn spawn_background_tasks(&self) {
        let drain = self
            .inner
            .tracker
            .spawn_drain(self.inner.shutdown.child_token());
        let bridge = self.spawn_bridge();
        let watcher = self.spawn_target_watcher();
        self.lock_tasks().extend([drain, bridge, watcher]);
    }

    async fn bootstrap_page(&self) -> Result<()> {
        let driver = &self.inner.driver;
        let options = &self.inner.options;

        driver.expose_binding(BINDING_NAME).await?;
        let script = probe::bootstrap_script(options, &self.inner.input_values)?;
        driver.evaluate_on_new_document(&script).await?;
        driver.evaluate(&script).await?;

        let cookies = with_cookie_defaults(
            &options.set_cookies,
            &self.target_url(),
            chrono::Utc::now().timestamp(),
        );
        if !cookies.is_empty() {
            driver.set_cookies(&cookies).await?;
        }

        let mut headers = options.extra_headers.clone();
        if let Some(ref referer) = options.referer {
            headers.insert("Referer".to_string(), referer.clone());
        }
        if !headers.is_empty() {
            driver.set_extra_headers(&headers).await?;
        }

        if let Some(ref user_agent) = options.user_agent {
            driver.set_user_agent(user_agent).await?;
        }

        debug!("Page bootstrapped for {}", self.target_url());
        Ok(())
    }

    // Handler registration

    /// Install the override handler for `name`, replacing any previous one.
    pub fn on<F>(&self, name: &str, handler: F) -> Result<EventName>
    where
        F: Fn(&Event, &Crawler) -> anyhow::Result<HandlerOutcome> + Send + Sync + 'static,
    {
        self.set_handler(name, Arc::new(handler))
    }

    pub fn set_handler(&self, name: &str, handler: EventHandler) -> Result<EventName> {
        self.write_session().registry.register(name, handler)
    }

    /// Remove the override handler for `name`. Returns whether one was set.
    pub fn remove_event(&self, name: &str) -> Result<bool> {
        self.write_session().registry.unregister(name)
    }

    /// Passive listeners, notified before the override handler.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Deliver `event` to bus listeners, then to the override handler whose
    /// outcome is returned.
    pub fn dispatch(&self, event: &Event) -> Result<HandlerOutcome> {
        self.inner.bus.dispatch(event, self)?;

        let handler = self.read_session().registry.handler(event.name());
        match handler {
            Some(handler) => invoke(&handler, event, self),
            None => Ok(HandlerOutcome::Continue),
        }
    }

    // Navigation

    pub async fn load(&self) -> Result<()> {
        let url = self.target_url();
        info!("Loading {}", url);
        self.navigate_to(NavigationTarget::Url(&url)).await?;
        self.after_navigation(Some(&url)).await
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        self.require_loaded("navigate")?;
        let url = normalize_url(url);
        self.navigate_to(NavigationTarget::Url(&url)).await?;
        self.after_navigation(Some(&url)).await
    }

    pub async fn reload(&self) -> Result<()> {
        self.require_loaded("reload")?;
        self.navigate_to(NavigationTarget::Reload).await?;
        self.after_navigation(None).await
    }

    /// Click `selector` and treat the outcome as a navigation.
    ///
    /// Completes once `until_selector` matches or a click lands without
    /// error; after a click the remaining time is spent waiting for
    /// `until_selector` (or the document) to settle. Failed clicks are
    /// retried until `timeout` (default 5 s) runs out, which is the only
    /// failure recorded as a navigation error.
    pub async fn click_to_navigate(
        &self,
        selector: &str,
        timeout: Option<Duration>,
        until_selector: Option<&str>,
    ) -> Result<()> {
        self.require_loaded("navigate")?;
        if self.inner.driver.query_selector_count(selector).await? == 0 {
            return Err(ScanError::ElementNotFound(selector.to_string()));
        }

        let timeout = timeout.unwrap_or(DEFAULT_CLICK_TIMEOUT);
        let deadline = Instant::now() + timeout;
        self.discard_idle_bridge_error();

        self.write_session().navigation_intent = true;
        let outcome = self.click_until(selector, deadline, until_selector).await;
        self.write_session().navigation_intent = false;

        match outcome {
            Ok(()) => self.after_navigation(None).await,
            Err(e) => {
                self.write_session().record_navigation_error();
                Err(e)
            }
        }
    }

    async fn click_until(
        &self,
        selector: &str,
        deadline: Instant,
        until_selector: Option<&str>,
    ) -> Result<()> {
        let timed_out = || ScanError::Navigation {
            url: selector.to_string(),
            reason: "navigation timeout".to_string(),
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }

            let appeared = async {
                match until_selector {
                    Some(until) => self.wait_for_selector(until, deadline).await,
                    None => futures::future::pending::<bool>().await,
                }
            };

            let clicked = tokio::select! {
                result = tokio::time::timeout(remaining, self.inner.driver.click(selector)) => {
                    match result {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            debug!("Click on {} failed: {}", selector, e);
                            false
                        }
                        Err(_) => false,
                    }
                }
                found = appeared => {
                    return if found { Ok(()) } else { Err(timed_out()) };
                }
            };

            if clicked {
                let settled = match until_selector {
                    Some(until) => self.wait_for_selector(until, deadline).await,
                    None => self.wait_for_document(deadline).await,
                };
                if !settled {
                    debug!("Clicked {} but the page did not settle before the deadline", selector);
                }
                return Ok(());
            }

            sleep(CLICK_RETRY_INTERVAL.min(remaining)).await;
        }
    }

    async fn wait_for_selector(&self, selector: &str, deadline: Instant) -> bool {
        loop {
            if let Ok(count) = self.inner.driver.query_selector_count(selector).await {
                if count > 0 {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn wait_for_document(&self, deadline: Instant) -> bool {
        loop {
            // Evaluation fails while the old document is being torn down.
            if let Ok(Value::Bool(true)) = self.inner.driver.evaluate(probe::HAS_DOCUMENT_ELEMENT).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn navigate_to(&self, target: NavigationTarget<'_>) -> Result<()> {
        self.discard_idle_bridge_error();
        let previous = {
            let mut session = self.write_session();
            session.navigation_intent = true;
            std::mem::replace(&mut session.state, SessionState::Loading)
        };

        let timeout = self.inner.options.navigation_timeout();
        let (url, result) = match target {
            NavigationTarget::Url(url) => (url, self.inner.driver.navigate(url, timeout).await),
            NavigationTarget::Reload => ("reload", self.inner.driver.reload(timeout).await),
        };

        {
            let mut session = self.write_session();
            session.navigation_intent = false;
            if result.is_err() {
                session.state = previous;
                session.record_navigation_error();
            }
        }

        let Err(e) = result else {
            return Ok(());
        };
        warn!("Navigation to {} failed: {}", url, e);
        self.dispatch(&Event::EarlyDetach)?;

        Err(match e {
            ScanError::Navigation { .. } => e,
            other => ScanError::Navigation {
                url: url.to_string(),
                reason: other.to_string(),
            },
        })
    }

    async fn after_navigation(&self, requested: Option<&str>) -> Result<()> {
        let has_root = self
            .inner
            .driver
            .evaluate(probe::HAS_DOCUMENT_ELEMENT)
            .await?;
        if has_root != Value::Bool(true) {
            return Err(ScanError::ElementNotFound("html".to_string()));
        }

        self.lock_dedup().reset();
        self.set_state(SessionState::Loaded);

        if let Some(requested) = requested {
            self.check_redirect(requested).await?;
        }

        self.dispatch(&Event::DomContentLoaded)?;
        self.wait_for_requests().await;
        if let Some(e) = self.take_bridge_error() {
            return Err(e);
        }
        self.dispatch(&Event::PageInitialized)?;

        self.inner
            .driver
            .evaluate(&probe::start_mutation_observer())
            .await?;
        Ok(())
    }

    async fn check_redirect(&self, requested: &str) -> Result<()> {
        let location = match self.inner.driver.evaluate(probe::LOCATION_HREF).await {
            Ok(Value::String(location)) => location,
            Ok(_) => return Ok(()),
            Err(e) => {
                debug!("Could not read document location: {}", e);
                return Ok(());
            }
        };

        if same_document(&location, requested) {
            return Ok(());
        }
        info!("Redirected from {} to {}", requested, location);
        self.write_session().redirect = Some(location.clone());
        self.dispatch(&Event::Redirect { url: location })?;
        Ok(())
    }

    /// Wait until the page has no reported requests in flight, then for
    /// pending JSONP scripts and WebSocket handshakes.
    async fn wait_for_requests(&self) {
        self.inner
            .tracker
            .wait_for_quiescence(self.inner.options.ajax_timeout())
            .await;
        if let Err(e) = self
            .inner
            .driver
            .evaluate(&probe::wait_async_requests())
            .await
        {
            debug!("Waiting for JSONP/WebSocket requests failed: {}", e);
        }
    }

    // Crawling

    /// Crawl the loaded page, loading it first if needed.
    ///
    /// Each call gets a fresh cancellation token, so a previous `stop` does
    /// not carry over. Per-element failures are logged and skipped; handler
    /// failures abort the crawl.
    pub async fn start(&self) -> Result<()> {
        self.discard_idle_bridge_error();
        if !self.is_loaded() {
            self.load().await?;
        }

        let cancel = CancellationToken::new();
        {
            let mut session = self.write_session();
            session.cancel = cancel.clone();
            session.state = SessionState::Crawling;
        }

        info!("Crawling {}", self.target_url());
        let result = self.run(&cancel).await;

        let state = if cancel.is_cancelled() || result.is_err() {
            SessionState::Stopped
        } else {
            SessionState::Done
        };
        self.set_state(state);
        info!("Crawl of {} finished ({})", self.target_url(), state);
        result
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        if self.dispatch(&Event::Start)?.is_cancel() {
            debug!("Crawl cancelled by start handler");
            return Ok(());
        }

        if self.inner.options.fill_values {
            self.fill_inputs(None).await;
        }

        self.crawl_dom(None, 0, cancel).await
    }

    /// Stop the running crawl at its next checkpoint.
    pub fn stop(&self) {
        info!("Stop requested");
        self.read_session().cancel.cancel();
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<bool> {
        if let Some(e) = self.take_bridge_error() {
            return Err(e);
        }
        Ok(cancel.is_cancelled())
    }

    fn crawl_dom<'a>(
        &'a self,
        root: Option<&'a str>,
        level: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let elements = match self.dom_tree(root).await {
                Ok(elements) => elements,
                Err(e) => {
                    warn!("Could not list elements under {}: {}", root.unwrap_or("html"), e);
                    return Ok(());
                }
            };
            debug!("Level {}: {} element(s)", level, elements.len());

            for selector in elements {
                if self.checkpoint(cancel)? {
                    debug!("Crawl stopped before {}", selector);
                    break;
                }
                if let Err(e) = self.crawl_element(&selector, level, cancel).await {
                    if e.is_handler_error() {
                        return Err(e);
                    }
                    warn!("Skipping {}: {}", selector, e);
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn crawl_element(
        &self,
        selector: &str,
        level: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let crawl_event = Event::CrawlElement {
            element: selector.to_string(),
        };
        if self.dispatch(&crawl_event)?.is_cancel() {
            return Ok(());
        }
        if !self.inner.options.trigger_events {
            return Ok(());
        }

        let events: Vec<String> = serde_json::from_value(
            self.inner
                .driver
                .evaluate(&probe::events_for_element(selector)?)
                .await?,
        )
        .unwrap_or_default();

        for event in events {
            if self.checkpoint(cancel)? {
                break;
            }

            let trigger_event = Event::TriggerEvent {
                element: selector.to_string(),
                event: event.clone(),
            };
            if self.dispatch(&trigger_event)?.is_cancel() {
                continue;
            }

            self.inner
                .driver
                .evaluate(&probe::trigger_element_event(selector, &event)?)
                .await?;

            self.dispatch(&Event::EventTriggered {
                element: selector.to_string(),
                event: event.clone(),
            })?;

            self.wait_for_requests().await;

            let trigger = Trigger {
                element: selector.to_string(),
                event,
            };
            self.process_new_dom(&trigger, level, cancel).await?;
        }
        Ok(())
    }

    async fn process_new_dom(
        &self,
        trigger: &Trigger,
        level: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while let Some(root) = self.pop_mutation().await? {
            if self.inner.options.skip_duplicate_content {
                let tags: Vec<String> = serde_json::from_value(
                    self.inner
                        .driver
                        .evaluate(&probe::dom_tag_list(Some(&root))?)
                        .await?,
                )
                .unwrap_or_default();
                let total_mutations = self.total_dom_mutations().await?;

                let result = self.lock_dedup().add_node(&tags, total_mutations);
                if !result.added {
                    debug!(
                        "Skipping DOM state under {} already seen {} time(s)",
                        root, result.seen_count
                    );
                    continue;
                }
            }

            self.dispatch(&Event::NewDom {
                root_node: root.clone(),
                trigger: Some(trigger.clone()),
            })?;

            if level < self.inner.options.maximum_recursion {
                if self.inner.options.fill_values {
                    self.fill_inputs(Some(&root)).await;
                }
                self.crawl_dom(Some(&root), level + 1, cancel).await?;
            } else {
                debug!("Maximum recursion reached at {}", root);
            }

            if self.checkpoint(cancel)? {
                break;
            }
        }
        Ok(())
    }

    async fn fill_inputs(&self, root: Option<&str>) {
        let expression = match probe::fill_input_values(root) {
            Ok(expression) => expression,
            Err(e) => {
                warn!("Could not build input fill script: {}", e);
                return;
            }
        };
        match self.inner.driver.evaluate(&expression).await {
            Ok(filled) => debug!("Filled {} input(s) under {}", filled, root.unwrap_or("html")),
            Err(e) => warn!("Filling inputs under {} failed: {}", root.unwrap_or("html"), e),
        }
    }

    async fn dom_tree(&self, root: Option<&str>) -> Result<Vec<String>> {
        let value = self.inner.driver.evaluate(&probe::dom_tree(root)?).await?;
        let selectors: Vec<String> = serde_json::from_value(value)?;
        Ok(selectors.into_iter().filter(|s| !s.is_empty()).collect())
    }

    // Probe bridge

    fn spawn_bridge(&self) -> JoinHandle<()> {
        let mut calls = self.inner.driver.subscribe_bindings();
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let call = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    call = calls.recv() => call,
                };
                match call {
                    Ok(call) => {
                        let Some(crawler) = upgrade(&weak) else {
                            break;
                        };
                        crawler.handle_binding_call(call).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} probe message(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_binding_call(&self, call: BindingCall) {
        if call.name != BINDING_NAME {
            return;
        }
        let message: BridgeMessage = match serde_json::from_str(&call.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed probe message: {}", e);
                return;
            }
        };

        let reply = match self.handle_probe_event(message.id, &message.name, &message.params) {
            Ok(outcome) => outcome.to_value(),
            Err(e) if e.is_handler_error() => {
                warn!("{}", e);
                self.set_bridge_error(e);
                Value::Bool(true)
            }
            Err(e) => {
                debug!("Ignoring probe event '{}': {}", message.name, e);
                Value::Bool(true)
            }
        };

        if let Err(e) = self
            .inner
            .driver
            .evaluate(&probe::reply(message.id, &reply))
            .await
        {
            debug!("Could not reply to probe message {}: {}", message.id, e);
        }
    }

    fn handle_probe_event(&self, id: u64, name: &str, params: &Value) -> Result<HandlerOutcome> {
        let event = Event::from_probe(name, params)?;

        if let Some(request) = event.request() {
            if matches_excluded_url(&request.url, &self.inner.excluded_urls) {
                debug!("Excluded {}", request.url);
                return Ok(HandlerOutcome::Continue);
            }
            if event.is_request_start() {
                self.inner.tracker.push(PendingRequest {
                    request_id: id.to_string(),
                    url: request.url.clone(),
                    request_type: request.request_type,
                });
                if !self.mark_sent(request) {
                    debug!("Already seen {}", request.key());
                    return Ok(HandlerOutcome::Continue);
                }
            }
        }

        if let Event::Redirect { ref url } = event {
            self.write_session().redirect = Some(url.clone());
        }

        self.dispatch(&event)
    }

    /// Record a request key. Returns false when it was already recorded.
    fn mark_sent(&self, request: &Request) -> bool {
        self.inner
            .sent_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.key())
    }

    fn set_bridge_error(&self, error: ScanError) {
        let mut slot = self
            .inner
            .bridge_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Drop a handler failure raised while no call was running.
    fn discard_idle_bridge_error(&self) {
        if let Some(e) = self.take_bridge_error() {
            debug!("Discarding handler failure raised while idle: {}", e);
        }
    }

    fn take_bridge_error(&self) -> Option<ScanError> {
        self.inner
            .bridge_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn spawn_target_watcher(&self) -> JoinHandle<()> {
        let mut targets = self.inner.driver.subscribe_targets();
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let target = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    target = targets.recv() => target,
                };
                match target {
                    Ok(target) if target.is_popup() => {
                        let Some(crawler) = upgrade(&weak) else {
                            break;
                        };
                        let allowed = crawler.read_session().allow_new_windows;
                        if allowed {
                            continue;
                        }
                        info!("Closing new window {}", target.url);
                        if let Err(e) = crawler.inner.driver.close_target(&target.target_id).await {
                            debug!("Could not close {}: {}", target.target_id, e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} target notification(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    // Pages

    /// Replace the main page with a fresh one, optionally retargeting the
    /// session. The crawler is back to `Idle` and must be loaded again.
    pub async fn new_page(&self, url: Option<&str>) -> Result<()> {
        self.inner.driver.open_page().await?;
        {
            let mut session = self.write_session();
            if let Some(url) = url {
                session.target_url = normalize_url(url);
            }
            session.state = SessionState::Idle;
            session.redirect = None;
        }
        self.inner.tracker.clear();
        self.lock_dedup().reset();
        self.bootstrap_page().await
    }

    /// Open an independent target that is exempt from new-window blocking.
    pub async fn new_detached_page(&self, url: &str) -> Result<String> {
        self.write_session().allow_new_windows = true;
        let result = self.inner.driver.create_target(url).await;
        self.write_session().allow_new_windows = false;
        result
    }

    /// Stop background work and close the page.
    pub async fn close(&self) -> Result<()> {
        self.stop();
        self.inner.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.driver.close().await
    }

    // Accessors

    pub fn errors(&self) -> Vec<CrawlError> {
        self.read_session().errors.clone()
    }

    /// Current cookies of the page, also cached on the session.
    pub async fn cookies(&self) -> Result<Vec<Cookie>> {
        let cookies = self.inner.driver.cookies().await?;
        self.write_session().cookies = cookies.clone();
        Ok(cookies)
    }

    pub fn redirect(&self) -> Option<String> {
        self.read_session().redirect.clone()
    }

    pub fn state(&self) -> SessionState {
        self.read_session().state
    }

    pub fn is_loaded(&self) -> bool {
        self.state().is_loaded()
    }

    pub fn target_url(&self) -> String {
        self.read_session().target_url.clone()
    }

    pub fn options(&self) -> &CrawlerOptions {
        &self.inner.options
    }

    pub fn input_values(&self) -> &BTreeMap<String, String> {
        &self.inner.input_values
    }

    pub fn driver(&self) -> Arc<dyn BrowserDriver> {
        Arc::clone(&self.inner.driver)
    }

    /// Number of distinct DOM states recorded since the last navigation.
    pub fn dom_state_count(&self) -> usize {
        self.lock_dedup().node_count()
    }

    /// Canonical probe selector of the element matched by `selector`.
    pub async fn element_selector(&self, selector: &str) -> Result<Option<String>> {
        let value = self
            .inner
            .driver
            .evaluate(&probe::element_selector(selector)?)
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    pub async fn total_dom_mutations(&self) -> Result<u64> {
        let value = self
            .inner
            .driver
            .evaluate(&probe::total_dom_mutations())
            .await?;
        Ok(value.as_u64().unwrap_or(0))
    }

    /// Selector of the next root of newly inserted DOM, if any.
    pub async fn pop_mutation(&self) -> Result<Option<String>> {
        let value = self.inner.driver.evaluate(&probe::pop_mutation()).await?;
        Ok(value
            .as_str()
            .filter(|selector| !selector.is_empty())
            .map(str::to_string))
    }

    fn require_loaded(&self, operation: &'static str) -> Result<()> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(ScanError::NotLoaded(operation))
        }
    }

    fn set_state(&self, state: SessionState) {
        self.write_session().state = state;
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Session> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, Session> {
        self.inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_dedup(&self) -> MutexGuard<'_, DomDeduplicator> {
        self.inner
            .dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn upgrade(weak: &Weak<CrawlerInner>) -> Option<Crawler> {
    weak.upgrade().map(|inner| Crawler { inner })
}

/// Cookies with an expiry one year out when unset, and the target's host and
/// URL when no domain or URL is given.
pub fn with_cookie_defaults(cookies: &[Cookie], target_url: &str, now: i64) -> Vec<Cookie> {
    let host = Url::parse(target_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));

    cookies
        .iter()
        .cloned()
        .map(|mut cookie| {
            if cookie.expires == 0 {
                cookie.expires = now + COOKIE_LIFETIME_SECS;
            }
            if cookie.url.is_none() || cookie.domain.is_empty() {
                if let Some(ref host) = host {
                    cookie.domain = host.clone();
                    cookie.url = Some(target_url.to_string());
                }
            }
            cookie
        })
        .collect()
}

/// Whether two URLs name the same document, ignoring fragments.
fn same_document(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(mut a), Ok(mut b)) => {
            a.set_fragment(None);
            b.set_fragment(None);
            a == b
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::TargetInfo;
    use crate::scripted::ScriptedBrowser;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TARGET: &str = "https://example.com/";

    async fn launch(browser: &Arc<ScriptedBrowser>, options: CrawlerOptions) -> Crawler {
        Crawler::launch(TARGET, options, browser.clone())
            .await
            .unwrap()
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn binding_message(id: u64, name: &str, params: Value) -> Value {
        json!({"id": id, "name": name, "params": params})
    }

    fn xhr_params(url: &str) -> Value {
        json!({"request": {"type": "xhr", "method": "GET", "url": url}})
    }

    #[test]
    fn test_cookie_defaults() {
        let cookies = vec![Cookie {
            name: "sid".to_string(),
            value: "1".to_string(),
            ..Cookie::default()
        }];
        let out = with_cookie_defaults(&cookies, "https://example.com/app", 1000);
        assert_eq!(out[0].expires, 1000 + COOKIE_LIFETIME_SECS);
        assert_eq!(out[0].domain, "example.com");
        assert_eq!(out[0].url.as_deref(), Some("https://example.com/app"));
    }

    #[test]
    fn test_cookie_defaults_keep_explicit_values() {
        let cookies = vec![Cookie {
            name: "sid".to_string(),
            value: "1".to_string(),
            domain: "api.example.com".to_string(),
            url: Some("https://api.example.com/".to_string()),
            expires: 42,
            ..Cookie::default()
        }];
        let out = with_cookie_defaults(&cookies, "https://example.com/", 1000);
        assert_eq!(out[0], cookies[0]);
    }

    #[test]
    fn test_same_document_ignores_fragment() {
        assert!(same_document("https://a.test/x#top", "https://a.test/x"));
        assert!(!same_document("https://a.test/login", "https://a.test/x"));
    }

    #[tokio::test]
    async fn test_launch_bootstraps_page() {
        let browser = Arc::new(ScriptedBrowser::new());
        let options = CrawlerOptions {
            referer: Some("https://ref.test/".to_string()),
            user_agent: Some("yori-test".to_string()),
            ..CrawlerOptions::default()
        };
        let crawler = Crawler::launch("example.com", options, browser.clone())
            .await
            .unwrap();

        assert_eq!(crawler.target_url(), "http://example.com");
        assert_eq!(crawler.state(), SessionState::Idle);
        assert_eq!(browser.exposed_bindings(), vec![BINDING_NAME.to_string()]);
        assert_eq!(browser.new_document_scripts().len(), 1);
        assert!(browser.new_document_scripts()[0].contains("window.__PROBE__ = probe"));
        assert_eq!(
            browser.headers().get("Referer").map(String::as_str),
            Some("https://ref.test/")
        );
        assert_eq!(browser.user_agent().as_deref(), Some("yori-test"));
    }

    #[tokio::test]
    async fn test_launch_rejects_bad_exclusion_pattern() {
        let browser = Arc::new(ScriptedBrowser::new());
        let options = CrawlerOptions {
            excluded_urls: vec!["(".to_string()],
            ..CrawlerOptions::default()
        };
        let result = Crawler::launch(TARGET, options, browser).await;
        assert!(matches!(result, Err(ScanError::ParseError(_))));
    }

    #[tokio::test]
    async fn test_load_dispatches_lifecycle_events() {
        let browser = Arc::new(ScriptedBrowser::new());
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        for name in [EventName::DomContentLoaded, EventName::PageInitialized] {
            let order = order.clone();
            crawler.bus().add(
                name,
                Arc::new(move |event: &Event, _: &Crawler| {
                    order.lock().unwrap().push(event.name());
                    Ok(HandlerOutcome::Continue)
                }),
            );
        }

        crawler.load().await.unwrap();
        assert!(crawler.is_loaded());
        assert_eq!(browser.navigations(), vec![TARGET.to_string()]);
        assert_eq!(
            *order.lock().unwrap(),
            vec![EventName::DomContentLoaded, EventName::PageInitialized]
        );
        assert_eq!(browser.evaluation_count("p._newMutationObserver("), 1);
    }

    #[tokio::test]
    async fn test_load_failure_records_one_error() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.fail_navigation(true);
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        let result = crawler.load().await;
        assert!(matches!(result, Err(ScanError::Navigation { .. })));
        assert_eq!(crawler.errors(), vec![CrawlError::navigation_aborted()]);
        assert!(!crawler.is_loaded());
    }

    #[tokio::test]
    async fn test_navigate_requires_load() {
        let browser = Arc::new(ScriptedBrowser::new());
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        assert!(matches!(
            crawler.navigate("https://example.com/other").await,
            Err(ScanError::NotLoaded("navigate"))
        ));
        assert!(matches!(
            crawler.reload().await,
            Err(ScanError::NotLoaded("reload"))
        ));
        assert!(browser.navigations().is_empty());
    }

    #[tokio::test]
    async fn test_navigate_failure_records_one_error_per_call() {
        let browser = Arc::new(ScriptedBrowser::new());
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler.load().await.unwrap();

        browser.fail_navigation(true);
        assert!(crawler.navigate("https://example.com/a").await.is_err());
        assert_eq!(crawler.errors().len(), 1);
        assert!(crawler.reload().await.is_err());
        assert_eq!(crawler.errors().len(), 2);
        assert!(crawler.is_loaded());
    }

    #[tokio::test]
    async fn test_redirect_is_recorded() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond(probe::LOCATION_HREF, json!("https://example.com/login"));
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        let seen = counter();
        let seen_clone = seen.clone();
        crawler
            .on("redirect", move |event, _| {
                if let Event::Redirect { url } = event {
                    assert_eq!(url, "https://example.com/login");
                    seen_clone.fetch_add(1, Ordering::SeqCst);
                }
                Ok(HandlerOutcome::Continue)
            })
            .unwrap();

        crawler.load().await.unwrap();
        assert_eq!(crawler.redirect().as_deref(), Some("https://example.com/login"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_triggers_events_in_document_order() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond_sequence("p.getDomTree(", vec![json!(["#a", "#b"])]);
        browser.respond("p.getEventsForElement(", json!(["click", "mouseup"]));
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        let triggered = Arc::new(Mutex::new(Vec::new()));
        let triggered_clone = triggered.clone();
        crawler
            .on("eventtriggered", move |event, _| {
                if let Event::EventTriggered { element, event } = event {
                    triggered_clone
                        .lock()
                        .unwrap()
                        .push(format!("{}:{}", element, event));
                }
                Ok(HandlerOutcome::Continue)
            })
            .unwrap();

        crawler.start().await.unwrap();
        assert_eq!(crawler.state(), SessionState::Done);
        assert_eq!(
            *triggered.lock().unwrap(),
            vec!["#a:click", "#a:mouseup", "#b:click", "#b:mouseup"]
        );
        assert_eq!(browser.evaluation_count("p.fillInputValues(document.documentElement)"), 1);
    }

    #[tokio::test]
    async fn test_start_cancelled_by_start_handler() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond("p.getDomTree(", json!(["#a"]));
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler
            .on("start", |_, _| Ok(HandlerOutcome::Cancel))
            .unwrap();

        crawler.start().await.unwrap();
        assert_eq!(browser.evaluation_count("p.getDomTree("), 0);
        assert_eq!(crawler.state(), SessionState::Done);
    }

    #[tokio::test]
    async fn test_crawl_element_and_trigger_cancel() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond_sequence("p.getDomTree(", vec![json!(["#skip", "#keep"])]);
        browser.respond("p.getEventsForElement(", json!(["click", "dblclick"]));
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        crawler
            .on("crawlelement", |event, _| match event {
                Event::CrawlElement { element } if element == "#skip" => Ok(HandlerOutcome::Cancel),
                _ => Ok(HandlerOutcome::Continue),
            })
            .unwrap();
        crawler
            .on("triggerevent", |event, _| match event {
                Event::TriggerEvent { event, .. } if event == "dblclick" => Ok(HandlerOutcome::Cancel),
                _ => Ok(HandlerOutcome::Continue),
            })
            .unwrap();

        crawler.start().await.unwrap();
        assert_eq!(browser.evaluation_count("p.triggerElementEvent("), 1);
        assert_eq!(browser.evaluation_count("p.resolve(\"#skip\")"), 0);
    }

    #[tokio::test]
    async fn test_stop_halts_traversal() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond_sequence("p.getDomTree(", vec![json!(["#a", "#b", "#c"])]);
        browser.respond("p.getEventsForElement(", json!(["click", "change"]));
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        crawler
            .on("eventtriggered", |_, crawler| {
                crawler.stop();
                Ok(HandlerOutcome::Continue)
            })
            .unwrap();

        crawler.start().await.unwrap();
        assert_eq!(crawler.state(), SessionState::Stopped);
        assert_eq!(browser.evaluation_count("p.triggerElementEvent("), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond("p.getDomTree(", json!(["#a"]));
        browser.respond("p.getEventsForElement(", json!(["click"]));
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        crawler.load().await.unwrap();
        crawler.stop();
        crawler.start().await.unwrap();
        assert_eq!(crawler.state(), SessionState::Done);
        assert_eq!(browser.evaluation_count("p.triggerElementEvent("), 1);
    }

    #[tokio::test]
    async fn test_handler_error_aborts_start() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond_sequence("p.getDomTree(", vec![json!(["#a", "#b"])]);
        browser.respond("p.getEventsForElement(", json!(["click"]));
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        crawler
            .on("triggerevent", |_, _| Err(anyhow::anyhow!("handler exploded")))
            .unwrap();

        let result = crawler.start().await;
        assert!(matches!(result, Err(ScanError::Handler { ref event, .. }) if event == "triggerevent"));
        assert_eq!(browser.evaluation_count("p.triggerElementEvent("), 0);
        assert_eq!(crawler.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_element_failures_are_swallowed() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond_sequence("p.getDomTree(", vec![json!(["#broken", "#ok"])]);
        browser.respond("p.getEventsForElement(", json!(["click"]));
        browser.fail("p.resolve(\"#broken\")", "TypeError: el is null");
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        crawler.start().await.unwrap();
        assert_eq!(crawler.state(), SessionState::Done);
        assert_eq!(browser.evaluation_count("p.triggerElementEvent(el, \"click\")"), 1);
    }

    #[tokio::test]
    async fn test_new_dom_is_deduplicated() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond_sequence("p.getDomTree(", vec![json!(["#a", "#b"])]);
        browser.respond("p.getEventsForElement(", json!(["click"]));
        browser.respond_sequence(
            "p.popMutation(",
            vec![json!("#list1"), Value::Null, json!("#list2"), Value::Null],
        );
        browser.respond("p.getDomTagList(", json!(["UL class", "LI", "LI", "LI", "A href"]));
        browser.respond("p.totalDOMMutations", json!(5));
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        let roots = Arc::new(Mutex::new(Vec::new()));
        let roots_clone = roots.clone();
        crawler
            .on("newdom", move |event, _| {
                if let Event::NewDom { root_node, trigger } = event {
                    assert_eq!(trigger.as_ref().map(|t| t.event.as_str()), Some("click"));
                    roots_clone.lock().unwrap().push(root_node.clone());
                }
                Ok(HandlerOutcome::Continue)
            })
            .unwrap();

        crawler.start().await.unwrap();
        assert_eq!(*roots.lock().unwrap(), vec!["#list1".to_string()]);
        assert_eq!(crawler.dom_state_count(), 1);
        assert_eq!(browser.evaluation_count("p.fillInputValues(p.resolve(\"#list1\"))"), 1);
    }

    #[tokio::test]
    async fn test_new_dom_without_dedup() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond_sequence("p.getDomTree(", vec![json!(["#a", "#b"])]);
        browser.respond("p.getEventsForElement(", json!(["click"]));
        browser.respond_sequence(
            "p.popMutation(",
            vec![json!("#list1"), Value::Null, json!("#list2"), Value::Null],
        );
        let options = CrawlerOptions {
            skip_duplicate_content: false,
            ..CrawlerOptions::default()
        };
        let crawler = launch(&browser, options).await;

        let count = counter();
        let count_clone = count.clone();
        crawler
            .on("newdom", move |_, _| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Continue)
            })
            .unwrap();

        crawler.start().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(browser.evaluation_count("p.getDomTagList("), 0);
    }

    #[tokio::test]
    async fn test_maximum_recursion_limits_depth() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond_sequence("p.getDomTree(", vec![json!(["#a"])]);
        browser.respond("p.getEventsForElement(", json!(["click"]));
        browser.respond_sequence("p.popMutation(", vec![json!("#panel"), Value::Null]);
        let options = CrawlerOptions {
            maximum_recursion: 0,
            skip_duplicate_content: false,
            ..CrawlerOptions::default()
        };
        let crawler = launch(&browser, options).await;

        crawler.start().await.unwrap();
        assert_eq!(browser.evaluation_count("p.getDomTree("), 1);
    }

    #[tokio::test]
    async fn test_registration_rejections() {
        let browser = Arc::new(ScriptedBrowser::new());
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        assert!(matches!(
            crawler.on("bogus", |_, _| Ok(HandlerOutcome::Continue)),
            Err(ScanError::UnknownEvent(_))
        ));
        assert!(matches!(
            crawler.on("postmessage", |_, _| Ok(HandlerOutcome::Continue)),
            Err(ScanError::PostMessageDisabled)
        ));
        assert!(!crawler.remove_event("postmessage").unwrap());
    }

    #[tokio::test]
    async fn test_postmessage_opt_in() {
        let browser = Arc::new(ScriptedBrowser::new());
        let options = CrawlerOptions {
            override_post_message: true,
            ..CrawlerOptions::default()
        };
        let crawler = launch(&browser, options).await;

        crawler
            .on("postMessage", |_, _| Ok(HandlerOutcome::Reply(json!({"rewritten": true}))))
            .unwrap();
        browser.emit_binding(
            BINDING_NAME,
            binding_message(3, "postMessage", json!({"destination": "window", "message": "hi", "targetOrigin": "*"})),
        );

        assert!(
            browser
                .wait_for_evaluation("p.__reply(3, {\"rewritten\":true})", Duration::from_secs(2))
                .await
        );
        assert!(crawler.remove_event("postmessage").unwrap());
    }

    #[tokio::test]
    async fn test_fill_input_cancel_is_replied() {
        let browser = Arc::new(ScriptedBrowser::new());
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler
            .on("fillinput", |_, _| Ok(HandlerOutcome::Cancel))
            .unwrap();

        browser.emit_binding(BINDING_NAME, binding_message(7, "fillinput", json!({"element": "#q"})));
        assert!(
            browser
                .wait_for_evaluation("p.__reply(7, false)", Duration::from_secs(2))
                .await
        );

        browser.emit_binding(BINDING_NAME, binding_message(8, "fillInput", json!({"element": "#q"})));
        assert!(
            browser
                .wait_for_evaluation("p.__reply(8, false)", Duration::from_secs(2))
                .await
        );
    }

    #[tokio::test]
    async fn test_duplicate_requests_are_dispatched_once() {
        let browser = Arc::new(ScriptedBrowser::new());
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        let seen = counter();
        let seen_clone = seen.clone();
        crawler.bus().add(
            EventName::Xhr,
            Arc::new(move |_: &Event, _: &Crawler| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Continue)
            }),
        );

        browser.emit_binding(BINDING_NAME, binding_message(1, "xhr", xhr_params("https://example.com/api")));
        browser.emit_binding(BINDING_NAME, binding_message(2, "xhr", xhr_params("https://example.com/api")));
        browser.emit_binding(BINDING_NAME, binding_message(3, "xhr", xhr_params("https://example.com/other")));

        assert!(
            browser
                .wait_for_evaluation("p.__reply(3, true)", Duration::from_secs(2))
                .await
        );
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(browser.evaluation_count("p.__reply("), 3);
    }

    #[tokio::test]
    async fn test_excluded_requests_are_not_dispatched() {
        let browser = Arc::new(ScriptedBrowser::new());
        let options = CrawlerOptions {
            excluded_urls: vec!["logout".to_string()],
            ..CrawlerOptions::default()
        };
        let crawler = launch(&browser, options).await;

        let seen = counter();
        let seen_clone = seen.clone();
        crawler
            .on("xhr", move |_, _| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerOutcome::Continue)
            })
            .unwrap();

        browser.emit_binding(BINDING_NAME, binding_message(1, "xhr", xhr_params("https://example.com/logout")));
        assert!(
            browser
                .wait_for_evaluation("p.__reply(1, true)", Duration::from_secs(2))
                .await
        );
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_idle_handler_error_is_discarded_by_start() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond("p.getDomTree(", json!(["#a"]));
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler.load().await.unwrap();

        crawler
            .on("xhr", |_, _| Err(anyhow::anyhow!("bad request")))
            .unwrap();
        browser.emit_binding(BINDING_NAME, binding_message(1, "xhr", xhr_params("https://example.com/api")));
        assert!(
            browser
                .wait_for_evaluation("p.__reply(1, true)", Duration::from_secs(2))
                .await
        );

        // The error raised while idle is cleared when the next crawl begins.
        crawler.start().await.unwrap();
        assert_eq!(crawler.state(), SessionState::Done);
    }

    #[tokio::test]
    async fn test_load_fails_when_page_event_handler_fails() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.emit_on_evaluation(
            "p.waitJsonp()",
            BINDING_NAME,
            binding_message(1, "xhr", xhr_params("https://example.com/api/boot")),
        );
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler
            .on("xhr", |_, _| Err(anyhow::anyhow!("bad request")))
            .unwrap();

        let result = crawler.load().await;
        assert!(matches!(result, Err(ScanError::Handler { .. })));
        assert_eq!(browser.evaluation_count("p.__reply(1, true)"), 1);
        assert_eq!(browser.evaluation_count("p._newMutationObserver("), 0);
    }

    #[tokio::test]
    async fn test_start_fails_when_handler_fails_during_auto_load() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond("p.getDomTree(", json!(["#a"]));
        browser.respond("p.getEventsForElement(", json!(["click"]));
        browser.emit_on_evaluation(
            "p.waitJsonp()",
            BINDING_NAME,
            binding_message(1, "xhr", xhr_params("https://example.com/api/boot")),
        );
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler
            .on("xhr", |_, _| Err(anyhow::anyhow!("bad request")))
            .unwrap();

        let result = crawler.start().await;
        assert!(result.unwrap_err().is_handler_error());
        assert_ne!(crawler.state(), SessionState::Done);
        assert_eq!(browser.evaluation_count("p.triggerElementEvent("), 0);
    }

    #[tokio::test]
    async fn test_popups_are_closed_unless_allowed() {
        let browser = Arc::new(ScriptedBrowser::new());
        let _crawler = launch(&browser, CrawlerOptions::default()).await;

        browser.emit_target(TargetInfo {
            target_id: "POPUP".to_string(),
            target_type: "page".to_string(),
            url: "https://ads.test/".to_string(),
            opener_id: Some("MAIN".to_string()),
        });
        browser.emit_target(TargetInfo {
            target_id: "WORKER".to_string(),
            target_type: "service_worker".to_string(),
            url: "https://example.com/sw.js".to_string(),
            opener_id: None,
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while browser.closed_targets().is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(browser.closed_targets(), vec!["POPUP".to_string()]);
    }

    #[tokio::test]
    async fn test_new_detached_page() {
        let browser = Arc::new(ScriptedBrowser::new());
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        let id = crawler.new_detached_page("https://example.com/other").await.unwrap();
        assert_eq!(id, "TARGET-1");
        assert!(!crawler.read_session().allow_new_windows);
    }

    #[tokio::test]
    async fn test_new_page_resets_session() {
        let browser = Arc::new(ScriptedBrowser::new());
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler.load().await.unwrap();

        crawler.new_page(Some("https://other.test/")).await.unwrap();
        assert_eq!(crawler.state(), SessionState::Idle);
        assert_eq!(crawler.target_url(), "https://other.test/");
        assert_eq!(browser.opened_pages(), 2);
        assert_eq!(browser.new_document_scripts().len(), 2);
    }

    #[tokio::test]
    async fn test_click_to_navigate_missing_element() {
        let browser = Arc::new(ScriptedBrowser::new());
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler.load().await.unwrap();

        let result = crawler.click_to_navigate("#nope", None, None).await;
        assert!(matches!(result, Err(ScanError::ElementNotFound(_))));
        assert!(crawler.errors().is_empty());
    }

    #[tokio::test]
    async fn test_click_to_navigate_retries_failed_clicks() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.set_selector_count("#next", 1);
        browser.fail_clicks(2);
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler.load().await.unwrap();

        crawler
            .click_to_navigate("#next", Some(Duration::from_secs(5)), None)
            .await
            .unwrap();
        assert_eq!(browser.clicks(), 3);
        assert!(crawler.errors().is_empty());
    }

    #[tokio::test]
    async fn test_click_to_navigate_until_selector() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.set_selector_count("#next", 1);
        browser.set_selector_count("#dashboard", 1);
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler.load().await.unwrap();

        crawler
            .click_to_navigate("#next", Some(Duration::from_secs(1)), Some("#dashboard"))
            .await
            .unwrap();
        assert!(crawler.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_to_navigate_timeout_records_error() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.set_selector_count("#next", 1);
        browser.fail_clicks(usize::MAX);
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler.load().await.unwrap();

        let result = crawler
            .click_to_navigate("#next", Some(Duration::from_millis(500)), None)
            .await;
        assert!(matches!(result, Err(ScanError::Navigation { .. })));
        assert!(browser.clicks() > 1);
        assert_eq!(crawler.errors(), vec![CrawlError::navigation_aborted()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_to_navigate_completed_click_is_enough() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.set_selector_count("#next", 1);
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler.load().await.unwrap();

        crawler
            .click_to_navigate("#next", Some(Duration::from_millis(500)), Some("#never"))
            .await
            .unwrap();
        assert_eq!(browser.clicks(), 1);
        assert!(crawler.errors().is_empty());
    }

    #[tokio::test]
    async fn test_accessors_read_probe_results() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.respond("p.resolve(\"div.card\")", json!("html > body > div:nth-of-type(2)"));
        browser.respond("p.totalDOMMutations", json!(12));
        browser.respond_sequence("p.popMutation(", vec![json!("#added")]);
        let crawler = launch(&browser, CrawlerOptions::default()).await;

        assert_eq!(
            crawler.element_selector("div.card").await.unwrap().as_deref(),
            Some("html > body > div:nth-of-type(2)")
        );
        assert_eq!(crawler.total_dom_mutations().await.unwrap(), 12);
        assert_eq!(crawler.pop_mutation().await.unwrap().as_deref(), Some("#added"));
        assert_eq!(crawler.pop_mutation().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cookies_are_cached() {
        let browser = Arc::new(ScriptedBrowser::new());
        let options = CrawlerOptions {
            set_cookies: vec![Cookie {
                name: "sid".to_string(),
                value: "abc".to_string(),
                ..Cookie::default()
            }],
            ..CrawlerOptions::default()
        };
        let crawler = launch(&browser, options).await;

        let cookies = crawler.cookies().await.unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].domain, "example.com");
        assert_eq!(crawler.read_session().cookies, cookies);
    }

    #[tokio::test]
    async fn test_close_stops_background_tasks() {
        let browser = Arc::new(ScriptedBrowser::new());
        let crawler = launch(&browser, CrawlerOptions::default()).await;
        crawler.close().await.unwrap();
        assert!(browser.is_closed());
        assert!(crawler.lock_tasks().is_empty());
    }
}
