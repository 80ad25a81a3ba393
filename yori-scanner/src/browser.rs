//! The browser-control surface the crawler is written against.

use crate::error::Result;
use crate::request::Cookie;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::broadcast;

/// A call made by page script to an exposed binding.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingCall {
    pub name: String,
    pub payload: String,
}

/// A browser target (tab, popup, worker) that has just been created.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetInfo {
    pub target_id: String,
    pub target_type: String,
    pub url: String,
    /// Set when the target was opened by another page, e.g. `window.open`.
    pub opener_id: Option<String>,
}

impl TargetInfo {
    pub fn is_popup(&self) -> bool {
        self.target_type == "page" && self.opener_id.is_some()
    }
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Replace the main page with a fresh blank one.
    async fn open_page(&self) -> Result<()>;

    /// Navigate the main page and wait for its load event.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;

    async fn reload(&self, timeout: Duration) -> Result<()>;

    /// Evaluate an expression in the main page, awaiting promises and
    /// returning the result by value.
    async fn evaluate(&self, expression: &str) -> Result<Value>;

    async fn evaluate_on_new_document(&self, source: &str) -> Result<()>;

    async fn query_selector_count(&self, selector: &str) -> Result<usize>;

    async fn click(&self, selector: &str) -> Result<()>;

    async fn cookies(&self) -> Result<Vec<Cookie>>;

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()>;

    async fn set_extra_headers(&self, headers: &BTreeMap<String, String>) -> Result<()>;

    async fn set_user_agent(&self, user_agent: &str) -> Result<()>;

    /// Expose `window.<name>(payload)` to page script.
    async fn expose_binding(&self, name: &str) -> Result<()>;

    fn subscribe_bindings(&self) -> broadcast::Receiver<BindingCall>;

    fn subscribe_targets(&self) -> broadcast::Receiver<TargetInfo>;

    /// Open a new top-level target and return its id.
    async fn create_target(&self, url: &str) -> Result<String>;

    async fn close_target(&self, target_id: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
