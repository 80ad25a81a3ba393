use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Xhr,
    Fetch,
    Jsonp,
    WebSocket,
    Form,
    Navigation,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Xhr => "xhr",
            RequestType::Fetch => "fetch",
            RequestType::Jsonp => "jsonp",
            RequestType::WebSocket => "websocket",
            RequestType::Form => "form",
            RequestType::Navigation => "navigation",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The element and DOM event that caused a request or a DOM change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trigger {
    pub element: String,
    pub event: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Request {
    pub fn new(request_type: RequestType, method: &str, url: &str) -> Self {
        Self {
            request_type,
            method: method.to_string(),
            url: url.to_string(),
            data: None,
            trigger: None,
            extra_headers: BTreeMap::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_data(mut self, data: &str) -> Self {
        self.data = Some(data.to_string());
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Identity used to suppress duplicate requests: type, method, URL,
    /// payload and trigger concatenated without separators.
    pub fn key(&self) -> String {
        let mut key = format!("{}{}{}", self.request_type, self.method, self.url);
        if let Some(ref data) = self.data {
            key.push_str(data);
        }
        if let Some(ref trigger) = self.trigger {
            key.push_str(&trigger.element);
            key.push_str(&trigger.event);
        }
        key
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.request_type, self.method, self.url)?;
        if let Some(ref data) = self.data {
            write!(f, "\nData: {}", data)?;
        }
        if let Some(ref trigger) = self.trigger {
            write!(f, "\nTrigger: {} on {}", trigger.event, trigger.element)?;
        }
        Ok(())
    }
}

/// An asynchronous page operation reported as started by the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub request_id: String,
    pub url: String,
    pub request_type: RequestType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub expires: i64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub url: Option<String>,
}

/// An entry of the session error log, e.g. `("navigation", "navigation aborted")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlError {
    pub kind: String,
    pub message: String,
}

impl CrawlError {
    pub fn new(kind: &str, message: &str) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }

    pub fn navigation_aborted() -> Self {
        Self::new("navigation", "navigation aborted")
    }
}
