use crate::events::HandlerRegistry;
use crate::request::{Cookie, CrawlError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Loading,
    Loaded,
    Crawling,
    Stopped,
    Done,
}

impl SessionState {
    /// True once a page has finished loading, including after a crawl ended.
    pub fn is_loaded(&self) -> bool {
        matches!(
            self,
            SessionState::Loaded | SessionState::Crawling | SessionState::Stopped | SessionState::Done
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Loading => "loading",
            SessionState::Loaded => "loaded",
            SessionState::Crawling => "crawling",
            SessionState::Stopped => "stopped",
            SessionState::Done => "done",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state of one crawl session, guarded by the crawler's lock.
pub(crate) struct Session {
    pub target_url: String,
    pub state: SessionState,
    pub navigation_intent: bool,
    pub allow_new_windows: bool,
    pub cookies: Vec<Cookie>,
    pub errors: Vec<CrawlError>,
    pub redirect: Option<String>,
    pub registry: HandlerRegistry,
    /// Token of the current (or last) `start` call.
    pub cancel: CancellationToken,
}

impl Session {
    pub fn new(target_url: String, allow_post_message: bool) -> Self {
        Self {
            target_url,
            state: SessionState::Idle,
            navigation_intent: false,
            allow_new_windows: false,
            cookies: Vec::new(),
            errors: Vec::new(),
            redirect: None,
            registry: HandlerRegistry::new(allow_post_message),
            cancel: CancellationToken::new(),
        }
    }

    pub fn record_navigation_error(&mut self) {
        self.errors.push(CrawlError::navigation_aborted());
    }
}
