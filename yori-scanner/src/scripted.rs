//! In-memory [`BrowserDriver`] that answers evaluations from canned rules.
//!
//! Used to exercise the crawler without a browser. An evaluated expression
//! is matched by substring against the registered rules, most recently added
//! first; each rule replays a queue of values and then falls back to its
//! fixed value, if any. Unmatched expressions evaluate to `null`.

use crate::browser::{BindingCall, BrowserDriver, TargetInfo};
use crate::error::{Result, ScanError};
use crate::request::Cookie;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

struct Rule {
    pattern: String,
    queue: VecDeque<Value>,
    fixed: Option<Value>,
    error: Option<String>,
}

impl Rule {
    fn answer(&mut self) -> Option<Result<Value>> {
        if let Some(ref message) = self.error {
            return Some(Err(ScanError::JsException(message.clone())));
        }
        if let Some(value) = self.queue.pop_front() {
            return Some(Ok(value));
        }
        self.fixed.clone().map(Ok)
    }
}

pub struct ScriptedBrowser {
    rules: Mutex<Vec<Rule>>,
    evaluated: Mutex<Vec<String>>,
    navigations: Mutex<Vec<String>>,
    new_document_scripts: Mutex<Vec<String>>,
    exposed_bindings: Mutex<Vec<String>>,
    cookies: Mutex<Vec<Cookie>>,
    headers: Mutex<BTreeMap<String, String>>,
    user_agent: Mutex<Option<String>>,
    selector_counts: Mutex<HashMap<String, usize>>,
    closed_targets: Mutex<Vec<String>>,
    hooks: Mutex<Vec<(String, BindingCall)>>,
    fail_navigation: AtomicBool,
    click_failures: AtomicUsize,
    clicks: AtomicUsize,
    opened_pages: AtomicUsize,
    next_target: AtomicU64,
    closed: AtomicBool,
    bindings: broadcast::Sender<BindingCall>,
    targets: broadcast::Sender<TargetInfo>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        let (bindings, _) = broadcast::channel(256);
        let (targets, _) = broadcast::channel(64);
        let browser = Self {
            rules: Mutex::new(Vec::new()),
            evaluated: Mutex::new(Vec::new()),
            navigations: Mutex::new(Vec::new()),
            new_document_scripts: Mutex::new(Vec::new()),
            exposed_bindings: Mutex::new(Vec::new()),
            cookies: Mutex::new(Vec::new()),
            headers: Mutex::new(BTreeMap::new()),
            user_agent: Mutex::new(None),
            selector_counts: Mutex::new(HashMap::new()),
            closed_targets: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
            fail_navigation: AtomicBool::new(false),
            click_failures: AtomicUsize::new(0),
            clicks: AtomicUsize::new(0),
            opened_pages: AtomicUsize::new(1),
            next_target: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            bindings,
            targets,
        };
        browser.respond("!!document.documentElement", json!(true));
        browser
    }

    /// Answer every matching evaluation with `value`.
    pub fn respond(&self, pattern: &str, value: Value) -> &Self {
        self.push_rule(Rule {
            pattern: pattern.to_string(),
            queue: VecDeque::new(),
            fixed: Some(value),
            error: None,
        })
    }

    /// Answer matching evaluations with `values` in order, then fall through
    /// to older rules.
    pub fn respond_sequence(&self, pattern: &str, values: Vec<Value>) -> &Self {
        self.push_rule(Rule {
            pattern: pattern.to_string(),
            queue: values.into(),
            fixed: None,
            error: None,
        })
    }

    /// Make matching evaluations throw.
    pub fn fail(&self, pattern: &str, message: &str) -> &Self {
        self.push_rule(Rule {
            pattern: pattern.to_string(),
            queue: VecDeque::new(),
            fixed: None,
            error: Some(message.to_string()),
        })
    }

    fn push_rule(&self, rule: Rule) -> &Self {
        lock(&self.rules).push(rule);
        self
    }

    pub fn set_selector_count(&self, selector: &str, count: usize) {
        lock(&self.selector_counts).insert(selector.to_string(), count);
    }

    pub fn fail_navigation(&self, fail: bool) {
        self.fail_navigation.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` clicks fail.
    pub fn fail_clicks(&self, n: usize) {
        self.click_failures.store(n, Ordering::SeqCst);
    }

    /// Simulate the page calling an exposed binding.
    pub fn emit_binding(&self, name: &str, payload: Value) {
        let _ = self.bindings.send(BindingCall {
            name: name.to_string(),
            payload: payload.to_string(),
        });
    }

    /// Call binding `name` once, the first time an expression containing
    /// `pattern` is evaluated. The evaluation yields before answering so the
    /// call is handled first.
    pub fn emit_on_evaluation(&self, pattern: &str, name: &str, payload: Value) {
        lock(&self.hooks).push((
            pattern.to_string(),
            BindingCall {
                name: name.to_string(),
                payload: payload.to_string(),
            },
        ));
    }

    pub fn emit_target(&self, target: TargetInfo) {
        let _ = self.targets.send(target);
    }

    pub fn evaluated(&self) -> Vec<String> {
        lock(&self.evaluated).clone()
    }

    /// Number of evaluated expressions containing `pattern`.
    pub fn evaluation_count(&self, pattern: &str) -> usize {
        lock(&self.evaluated)
            .iter()
            .filter(|e| e.contains(pattern))
            .count()
    }

    /// Poll until an expression containing `pattern` has been evaluated.
    pub async fn wait_for_evaluation(&self, pattern: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.evaluation_count(pattern) > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.evaluation_count(pattern) > 0
    }

    pub fn navigations(&self) -> Vec<String> {
        lock(&self.navigations).clone()
    }

    pub fn new_document_scripts(&self) -> Vec<String> {
        lock(&self.new_document_scripts).clone()
    }

    pub fn exposed_bindings(&self) -> Vec<String> {
        lock(&self.exposed_bindings).clone()
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        lock(&self.headers).clone()
    }

    pub fn user_agent(&self) -> Option<String> {
        lock(&self.user_agent).clone()
    }

    pub fn closed_targets(&self) -> Vec<String> {
        lock(&self.closed_targets).clone()
    }

    pub fn clicks(&self) -> usize {
        self.clicks.load(Ordering::SeqCst)
    }

    pub fn opened_pages(&self) -> usize {
        self.opened_pages.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn fire_hooks(&self, expression: &str) -> bool {
        let fired: Vec<BindingCall> = {
            let mut hooks = lock(&self.hooks);
            let (fired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *hooks)
                .into_iter()
                .partition(|(pattern, _)| expression.contains(pattern.as_str()));
            *hooks = kept;
            fired.into_iter().map(|(_, call)| call).collect()
        };
        for call in &fired {
            let _ = self.bindings.send(call.clone());
        }
        !fired.is_empty()
    }

    fn answer(&self, expression: &str) -> Result<Value> {
        let mut rules = lock(&self.rules);
        for rule in rules.iter_mut().rev() {
            if !expression.contains(&rule.pattern) {
                continue;
            }
            if let Some(answer) = rule.answer() {
                return answer;
            }
        }
        Ok(Value::Null)
    }

    fn check_navigation(&self, url: &str) -> Result<()> {
        if self.fail_navigation.load(Ordering::SeqCst) {
            return Err(ScanError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_CONNECTION_REFUSED".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ScriptedBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserDriver for ScriptedBrowser {
    async fn open_page(&self) -> Result<()> {
        self.opened_pages.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<()> {
        lock(&self.navigations).push(url.to_string());
        self.check_navigation(url)
    }

    async fn reload(&self, _timeout: Duration) -> Result<()> {
        lock(&self.navigations).push("reload".to_string());
        self.check_navigation("reload")
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        lock(&self.evaluated).push(expression.to_string());
        if self.fire_hooks(expression) {
            tokio::task::yield_now().await;
        }
        self.answer(expression)
    }

    async fn evaluate_on_new_document(&self, source: &str) -> Result<()> {
        lock(&self.new_document_scripts).push(source.to_string());
        Ok(())
    }

    async fn query_selector_count(&self, selector: &str) -> Result<usize> {
        Ok(lock(&self.selector_counts)
            .get(selector)
            .copied()
            .unwrap_or(0))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.clicks.fetch_add(1, Ordering::SeqCst);
        let failures = self.click_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.click_failures.store(failures - 1, Ordering::SeqCst);
            return Err(ScanError::Other(format!("click on {} intercepted", selector)));
        }
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        Ok(lock(&self.cookies).clone())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        lock(&self.cookies).extend_from_slice(cookies);
        Ok(())
    }

    async fn set_extra_headers(&self, headers: &BTreeMap<String, String>) -> Result<()> {
        *lock(&self.headers) = headers.clone();
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        *lock(&self.user_agent) = Some(user_agent.to_string());
        Ok(())
    }

    async fn expose_binding(&self, name: &str) -> Result<()> {
        lock(&self.exposed_bindings).push(name.to_string());
        Ok(())
    }

    fn subscribe_bindings(&self) -> broadcast::Receiver<BindingCall> {
        self.bindings.subscribe()
    }

    fn subscribe_targets(&self) -> broadcast::Receiver<TargetInfo> {
        self.targets.subscribe()
    }

    async fn create_target(&self, _url: &str) -> Result<String> {
        let id = self.next_target.fetch_add(1, Ordering::SeqCst);
        Ok(format!("TARGET-{}", id))
    }

    async fn close_target(&self, target_id: &str) -> Result<()> {
        lock(&self.closed_targets).push(target_id.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
