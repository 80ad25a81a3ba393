//! Event names, typed event payloads and the two handler mechanisms.
//!
//! Both mechanisms share [`ListenerTable`] for storage. The override registry
//! keeps exactly one handler per name and its outcome steers the crawl
//! (cancel default behaviour, reply to the page, abort on error). The
//! [`EventBus`] keeps any number of listeners per name and is purely
//! observational: outcomes are collected but never consulted by the crawler.

use crate::crawler::Crawler;
use crate::error::{Result, ScanError};
use crate::request::{Request, Trigger};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventName {
    Start,
    Xhr,
    XhrCompleted,
    Fetch,
    FetchCompleted,
    Jsonp,
    JsonpCompleted,
    WebSocket,
    WebSocketMessage,
    WebSocketSend,
    FormSubmit,
    FillInput,
    NewDom,
    Navigation,
    DomContentLoaded,
    Redirect,
    EarlyDetach,
    TriggerEvent,
    EventTriggered,
    PageInitialized,
    CrawlElement,
    PostMessage,
}

impl EventName {
    pub const ALL: [EventName; 22] = [
        EventName::Start,
        EventName::Xhr,
        EventName::XhrCompleted,
        EventName::Fetch,
        EventName::FetchCompleted,
        EventName::Jsonp,
        EventName::JsonpCompleted,
        EventName::WebSocket,
        EventName::WebSocketMessage,
        EventName::WebSocketSend,
        EventName::FormSubmit,
        EventName::FillInput,
        EventName::NewDom,
        EventName::Navigation,
        EventName::DomContentLoaded,
        EventName::Redirect,
        EventName::EarlyDetach,
        EventName::TriggerEvent,
        EventName::EventTriggered,
        EventName::PageInitialized,
        EventName::CrawlElement,
        EventName::PostMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Start => "start",
            EventName::Xhr => "xhr",
            EventName::XhrCompleted => "xhrcompleted",
            EventName::Fetch => "fetch",
            EventName::FetchCompleted => "fetchcompleted",
            EventName::Jsonp => "jsonp",
            EventName::JsonpCompleted => "jsonpcompleted",
            EventName::WebSocket => "websocket",
            EventName::WebSocketMessage => "websocketmessage",
            EventName::WebSocketSend => "websocketsend",
            EventName::FormSubmit => "formsubmit",
            EventName::FillInput => "fillinput",
            EventName::NewDom => "newdom",
            EventName::Navigation => "navigation",
            EventName::DomContentLoaded => "domcontentloaded",
            EventName::Redirect => "redirect",
            EventName::EarlyDetach => "earlydetach",
            EventName::TriggerEvent => "triggerevent",
            EventName::EventTriggered => "eventtriggered",
            EventName::PageInitialized => "pageinitialized",
            EventName::CrawlElement => "crawlelement",
            EventName::PostMessage => "postmessage",
        }
    }
}

impl FromStr for EventName {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_lowercase();
        EventName::ALL
            .into_iter()
            .find(|name| name.as_str() == lowered)
            .ok_or_else(|| ScanError::UnknownEvent(s.to_string()))
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An occurrence delivered to handlers, carrying only the fields relevant
/// to its name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Event {
    Start,
    Xhr {
        request: Request,
    },
    XhrCompleted {
        request: Request,
        response: Option<String>,
    },
    Fetch {
        request: Request,
    },
    FetchCompleted {
        request: Request,
        response: Option<String>,
    },
    Jsonp {
        request: Request,
    },
    JsonpCompleted {
        request: Request,
        script: Option<String>,
        timed_out: bool,
    },
    WebSocket {
        request: Request,
    },
    WebSocketMessage {
        request: Request,
        message: String,
    },
    WebSocketSend {
        request: Request,
        message: String,
    },
    FormSubmit {
        request: Request,
        form: String,
    },
    FillInput {
        element: String,
    },
    NewDom {
        root_node: String,
        trigger: Option<Trigger>,
    },
    Navigation {
        request: Request,
    },
    DomContentLoaded,
    Redirect {
        url: String,
    },
    EarlyDetach,
    TriggerEvent {
        element: String,
        event: String,
    },
    EventTriggered {
        element: String,
        event: String,
    },
    PageInitialized,
    CrawlElement {
        element: String,
    },
    PostMessage {
        destination: Option<String>,
        message: Value,
        target_origin: Option<String>,
    },
}

/// Loose shape of the parameters the probe sends with an event.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ProbeParams {
    request: Option<Request>,
    response: Option<String>,
    element: Option<String>,
    event: Option<String>,
    message: Option<Value>,
    form: Option<String>,
    script: Option<String>,
    timedout: bool,
    url: Option<String>,
    root_node: Option<String>,
    trigger: Option<Trigger>,
    destination: Option<String>,
    target_origin: Option<String>,
}

fn required<T>(value: Option<T>, event: EventName, field: &str) -> Result<T> {
    value.ok_or_else(|| ScanError::ParseError(format!("'{}' event without '{}'", event, field)))
}

fn message_text(message: Option<Value>) -> String {
    match message {
        Some(Value::String(text)) => text,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::Start => EventName::Start,
            Event::Xhr { .. } => EventName::Xhr,
            Event::XhrCompleted { .. } => EventName::XhrCompleted,
            Event::Fetch { .. } => EventName::Fetch,
            Event::FetchCompleted { .. } => EventName::FetchCompleted,
            Event::Jsonp { .. } => EventName::Jsonp,
            Event::JsonpCompleted { .. } => EventName::JsonpCompleted,
            Event::WebSocket { .. } => EventName::WebSocket,
            Event::WebSocketMessage { .. } => EventName::WebSocketMessage,
            Event::WebSocketSend { .. } => EventName::WebSocketSend,
            Event::FormSubmit { .. } => EventName::FormSubmit,
            Event::FillInput { .. } => EventName::FillInput,
            Event::NewDom { .. } => EventName::NewDom,
            Event::Navigation { .. } => EventName::Navigation,
            Event::DomContentLoaded => EventName::DomContentLoaded,
            Event::Redirect { .. } => EventName::Redirect,
            Event::EarlyDetach => EventName::EarlyDetach,
            Event::TriggerEvent { .. } => EventName::TriggerEvent,
            Event::EventTriggered { .. } => EventName::EventTriggered,
            Event::PageInitialized => EventName::PageInitialized,
            Event::CrawlElement { .. } => EventName::CrawlElement,
            Event::PostMessage { .. } => EventName::PostMessage,
        }
    }

    /// The request carried by request-bearing events.
    pub fn request(&self) -> Option<&Request> {
        match self {
            Event::Xhr { request }
            | Event::XhrCompleted { request, .. }
            | Event::Fetch { request }
            | Event::FetchCompleted { request, .. }
            | Event::Jsonp { request }
            | Event::JsonpCompleted { request, .. }
            | Event::WebSocket { request }
            | Event::WebSocketMessage { request, .. }
            | Event::WebSocketSend { request, .. }
            | Event::FormSubmit { request, .. }
            | Event::Navigation { request } => Some(request),
            _ => None,
        }
    }

    /// True for events announcing that a new request was issued.
    pub fn is_request_start(&self) -> bool {
        matches!(
            self,
            Event::Xhr { .. }
                | Event::Fetch { .. }
                | Event::Jsonp { .. }
                | Event::WebSocket { .. }
                | Event::FormSubmit { .. }
                | Event::Navigation { .. }
        )
    }

    /// Build a typed event from the name and parameter object sent by the probe.
    pub fn from_probe(name: &str, params: &Value) -> Result<Event> {
        let name: EventName = name.parse()?;
        let params: ProbeParams = if params.is_null() {
            ProbeParams::default()
        } else {
            serde_json::from_value(params.clone())?
        };

        let event = match name {
            EventName::Start => Event::Start,
            EventName::Xhr => Event::Xhr {
                request: required(params.request, name, "request")?,
            },
            EventName::XhrCompleted => Event::XhrCompleted {
                request: required(params.request, name, "request")?,
                response: params.response,
            },
            EventName::Fetch => Event::Fetch {
                request: required(params.request, name, "request")?,
            },
            EventName::FetchCompleted => Event::FetchCompleted {
                request: required(params.request, name, "request")?,
                response: params.response,
            },
            EventName::Jsonp => Event::Jsonp {
                request: required(params.request, name, "request")?,
            },
            EventName::JsonpCompleted => Event::JsonpCompleted {
                request: required(params.request, name, "request")?,
                script: params.script,
                timed_out: params.timedout,
            },
            EventName::WebSocket => Event::WebSocket {
                request: required(params.request, name, "request")?,
            },
            EventName::WebSocketMessage => Event::WebSocketMessage {
                request: required(params.request, name, "request")?,
                message: message_text(params.message),
            },
            EventName::WebSocketSend => Event::WebSocketSend {
                request: required(params.request, name, "request")?,
                message: message_text(params.message),
            },
            EventName::FormSubmit => Event::FormSubmit {
                request: required(params.request, name, "request")?,
                form: params.form.unwrap_or_default(),
            },
            EventName::FillInput => Event::FillInput {
                element: required(params.element, name, "element")?,
            },
            EventName::NewDom => Event::NewDom {
                root_node: required(params.root_node, name, "rootNode")?,
                trigger: params.trigger,
            },
            EventName::Navigation => Event::Navigation {
                request: required(params.request, name, "request")?,
            },
            EventName::DomContentLoaded => Event::DomContentLoaded,
            EventName::Redirect => Event::Redirect {
                url: required(params.url, name, "url")?,
            },
            EventName::EarlyDetach => Event::EarlyDetach,
            EventName::TriggerEvent => Event::TriggerEvent {
                element: required(params.element, name, "element")?,
                event: required(params.event, name, "event")?,
            },
            EventName::EventTriggered => Event::EventTriggered {
                element: required(params.element, name, "element")?,
                event: required(params.event, name, "event")?,
            },
            EventName::PageInitialized => Event::PageInitialized,
            EventName::CrawlElement => Event::CrawlElement {
                element: required(params.element, name, "element")?,
            },
            EventName::PostMessage => Event::PostMessage {
                destination: params.destination,
                message: params.message.unwrap_or(Value::Null),
                target_origin: params.target_origin,
            },
        };

        Ok(event)
    }
}

/// What a handler asks the crawler (or the page) to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Continue,
    /// Skip the default behaviour, e.g. do not fill an input the handler filled itself.
    Cancel,
    /// Hand a replacement value back to the page (`websocketsend`, `postmessage`).
    Reply(Value),
}

impl HandlerOutcome {
    pub fn is_cancel(&self) -> bool {
        matches!(self, HandlerOutcome::Cancel)
    }

    /// Value returned to the in-page caller.
    pub fn to_value(&self) -> Value {
        match self {
            HandlerOutcome::Continue => Value::Bool(true),
            HandlerOutcome::Cancel => Value::Bool(false),
            HandlerOutcome::Reply(value) => value.clone(),
        }
    }
}

pub type EventHandler =
    Arc<dyn Fn(&Event, &Crawler) -> anyhow::Result<HandlerOutcome> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered listeners per event name.
#[derive(Clone, Default)]
pub struct ListenerTable {
    listeners: HashMap<EventName, Vec<(ListenerId, EventHandler)>>,
    next_id: u64,
}

impl ListenerTable {
    pub fn push(&mut self, name: EventName, handler: EventHandler) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.entry(name).or_default().push((id, handler));
        id
    }

    /// Drop every listener for `name` and install `handler` alone.
    pub fn replace(&mut self, name: EventName, handler: EventHandler) -> ListenerId {
        self.listeners.remove(&name);
        self.push(name, handler)
    }

    pub fn remove(&mut self, name: EventName, id: ListenerId) -> bool {
        let Some(list) = self.listeners.get_mut(&name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(listener_id, _)| *listener_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.listeners.remove(&name);
        }
        removed
    }

    pub fn remove_all(&mut self, name: EventName) -> bool {
        self.listeners.remove(&name).is_some()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn contains(&self, name: EventName) -> bool {
        self.listeners.get(&name).is_some_and(|l| !l.is_empty())
    }

    pub fn len(&self, name: EventName) -> usize {
        self.listeners.get(&name).map_or(0, Vec::len)
    }

    /// Handlers for `name` in registration order, cloned so they can run
    /// without holding any lock around the table.
    pub fn handlers(&self, name: EventName) -> Vec<EventHandler> {
        self.listeners
            .get(&name)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }
}

/// One authoritative handler per event name.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    table: ListenerTable,
    allow_post_message: bool,
}

impl HandlerRegistry {
    pub fn new(allow_post_message: bool) -> Self {
        Self {
            table: ListenerTable::default(),
            allow_post_message,
        }
    }

    /// Install `handler` for `name`, replacing any previous one. Unknown
    /// names and `postmessage` without opt-in are rejected and leave the
    /// registry untouched.
    pub fn register(&mut self, name: &str, handler: EventHandler) -> Result<EventName> {
        let event_name: EventName = name.parse()?;
        if event_name == EventName::PostMessage && !self.allow_post_message {
            return Err(ScanError::PostMessageDisabled);
        }
        self.table.replace(event_name, handler);
        Ok(event_name)
    }

    pub fn unregister(&mut self, name: &str) -> Result<bool> {
        let event_name: EventName = name.parse()?;
        Ok(self.table.remove_all(event_name))
    }

    pub fn handler(&self, name: EventName) -> Option<EventHandler> {
        self.table.handlers(name).into_iter().next()
    }

    pub fn is_registered(&self, name: EventName) -> bool {
        self.table.contains(name)
    }
}

/// Run a handler, turning its error into [`ScanError::Handler`].
pub fn invoke(handler: &EventHandler, event: &Event, crawler: &Crawler) -> Result<HandlerOutcome> {
    handler(event, crawler).map_err(|source| ScanError::Handler {
        event: event.name().to_string(),
        source,
    })
}

/// Any number of passive listeners per event name.
#[derive(Default)]
pub struct EventBus {
    table: RwLock<ListenerTable>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: EventName, handler: EventHandler) -> ListenerId {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name, handler)
    }

    pub fn remove(&self, name: EventName, id: ListenerId) -> bool {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name, id)
    }

    pub fn has_listeners(&self, name: EventName) -> bool {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Remove the listeners of one event, or of every event with `None`.
    pub fn clear(&self, name: Option<EventName>) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        match name {
            Some(name) => {
                table.remove_all(name);
            }
            None => table.clear(),
        }
    }

    /// Invoke every listener for the event in registration order. The first
    /// error stops the dispatch and is returned.
    pub fn dispatch(&self, event: &Event, crawler: &Crawler) -> Result<Vec<HandlerOutcome>> {
        let handlers = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers(event.name());

        handlers
            .iter()
            .map(|handler| invoke(handler, event, crawler))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestType;
    use serde_json::json;

    fn noop() -> EventHandler {
        Arc::new(|_, _| Ok(HandlerOutcome::Continue))
    }

    #[test]
    fn test_event_name_parse_case_insensitive() {
        assert_eq!("XHR".parse::<EventName>().unwrap(), EventName::Xhr);
        assert_eq!(
            "jsonpCompleted".parse::<EventName>().unwrap(),
            EventName::JsonpCompleted
        );
        assert_eq!(
            "WebSocketSend".parse::<EventName>().unwrap(),
            EventName::WebSocketSend
        );
    }

    #[test]
    fn test_event_name_unknown() {
        assert!(matches!(
            "click".parse::<EventName>(),
            Err(ScanError::UnknownEvent(name)) if name == "click"
        ));
    }

    #[test]
    fn test_event_name_round_trip_all() {
        for name in EventName::ALL {
            assert_eq!(name.as_str().parse::<EventName>().unwrap(), name);
        }
    }

    #[test]
    fn test_from_probe_xhr() {
        let params = json!({
            "request": {
                "type": "xhr",
                "method": "POST",
                "url": "https://example.com/api",
                "data": "a=1",
                "trigger": {"element": "#send", "event": "click"}
            }
        });
        let event = Event::from_probe("xhr", &params).unwrap();
        assert_eq!(event.name(), EventName::Xhr);
        assert!(event.is_request_start());
        let request = event.request().unwrap();
        assert_eq!(request.request_type, RequestType::Xhr);
        assert_eq!(request.data.as_deref(), Some("a=1"));
    }

    #[test]
    fn test_from_probe_jsonp_completed_timeout() {
        let params = json!({
            "request": {"type": "jsonp", "method": "GET", "url": "https://x.test/cb?f=1"},
            "timedout": true
        });
        match Event::from_probe("jsonpCompleted", &params).unwrap() {
            Event::JsonpCompleted { timed_out, .. } => assert!(timed_out),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_from_probe_unit_events() {
        assert_eq!(Event::from_probe("start", &json!({})).unwrap(), Event::Start);
        assert_eq!(
            Event::from_probe("pageinitialized", &Value::Null).unwrap(),
            Event::PageInitialized
        );
    }

    #[test]
    fn test_from_probe_missing_field() {
        assert!(matches!(
            Event::from_probe("fillinput", &json!({})),
            Err(ScanError::ParseError(_))
        ));
    }

    #[test]
    fn test_from_probe_websocket_message_non_string() {
        let params = json!({
            "request": {"type": "websocket", "method": "GET", "url": "ws://x.test/"},
            "message": {"op": 1}
        });
        match Event::from_probe("websocketmessage", &params).unwrap() {
            Event::WebSocketMessage { message, .. } => assert_eq!(message, r#"{"op":1}"#),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_outcome_values() {
        assert_eq!(HandlerOutcome::Continue.to_value(), json!(true));
        assert_eq!(HandlerOutcome::Cancel.to_value(), json!(false));
        assert_eq!(HandlerOutcome::Reply(json!("x")).to_value(), json!("x"));
        assert!(HandlerOutcome::Cancel.is_cancel());
    }

    #[test]
    fn test_registry_rejects_unknown_name() {
        let mut registry = HandlerRegistry::new(false);
        assert!(registry.register("nonsense", noop()).is_err());
        assert!(EventName::ALL.iter().all(|n| !registry.is_registered(*n)));
    }

    #[test]
    fn test_registry_postmessage_requires_opt_in() {
        let mut registry = HandlerRegistry::new(false);
        assert!(matches!(
            registry.register("postmessage", noop()),
            Err(ScanError::PostMessageDisabled)
        ));
        assert!(!registry.is_registered(EventName::PostMessage));

        let mut registry = HandlerRegistry::new(true);
        assert_eq!(
            registry.register("PostMessage", noop()).unwrap(),
            EventName::PostMessage
        );
        assert!(registry.is_registered(EventName::PostMessage));
    }

    #[test]
    fn test_registry_replaces_handler() {
        let mut registry = HandlerRegistry::new(false);
        registry.register("xhr", noop()).unwrap();
        registry
            .register("XHR", Arc::new(|_, _| Ok(HandlerOutcome::Cancel)))
            .unwrap();
        assert!(registry.is_registered(EventName::Xhr));
        assert_eq!(registry.table.len(EventName::Xhr), 1);
    }

    #[test]
    fn test_registry_unregister() {
        let mut registry = HandlerRegistry::new(false);
        registry.register("newdom", noop()).unwrap();
        assert!(registry.unregister("newdom").unwrap());
        assert!(!registry.unregister("newdom").unwrap());
        assert!(registry.unregister("bogus").is_err());
    }

    #[test]
    fn test_listener_table_order_and_remove() {
        let mut table = ListenerTable::default();
        let first = table.push(EventName::Xhr, noop());
        let second = table.push(EventName::Xhr, noop());
        assert_ne!(first, second);
        assert_eq!(table.len(EventName::Xhr), 2);

        assert!(table.remove(EventName::Xhr, first));
        assert!(!table.remove(EventName::Xhr, first));
        assert_eq!(table.len(EventName::Xhr), 1);

        assert!(table.remove(EventName::Xhr, second));
        assert!(!table.contains(EventName::Xhr));
    }

    async fn bus_crawler() -> Crawler {
        let browser = Arc::new(crate::scripted::ScriptedBrowser::new());
        Crawler::launch("https://example.com/", crate::options::CrawlerOptions::default(), browser)
            .await
            .unwrap()
    }

    fn recording(
        calls: &Arc<std::sync::Mutex<Vec<u32>>>,
        tag: u32,
        outcome: HandlerOutcome,
    ) -> EventHandler {
        let calls = calls.clone();
        Arc::new(move |_, _| {
            calls.lock().unwrap().push(tag);
            Ok(outcome.clone())
        })
    }

    #[tokio::test]
    async fn test_bus_runs_listeners_in_registration_order() {
        let crawler = bus_crawler().await;
        let bus = EventBus::new();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        bus.add(EventName::Start, recording(&calls, 1, HandlerOutcome::Continue));
        bus.add(EventName::Start, recording(&calls, 2, HandlerOutcome::Cancel));
        bus.add(EventName::Start, recording(&calls, 3, HandlerOutcome::Reply(json!("x"))));
        bus.add(EventName::Xhr, recording(&calls, 9, HandlerOutcome::Continue));

        let outcomes = bus.dispatch(&Event::Start, &crawler).unwrap();
        assert_eq!(
            outcomes,
            vec![
                HandlerOutcome::Continue,
                HandlerOutcome::Cancel,
                HandlerOutcome::Reply(json!("x")),
            ]
        );
        assert_eq!(*calls.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_bus_first_error_stops_dispatch() {
        let crawler = bus_crawler().await;
        let bus = EventBus::new();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        bus.add(EventName::Start, recording(&calls, 1, HandlerOutcome::Continue));
        bus.add(
            EventName::Start,
            Arc::new(|_, _| Err(anyhow::anyhow!("listener failed"))),
        );
        bus.add(EventName::Start, recording(&calls, 3, HandlerOutcome::Continue));

        let result = bus.dispatch(&Event::Start, &crawler);
        assert!(matches!(
            result,
            Err(ScanError::Handler { ref event, .. }) if event == "start"
        ));
        assert_eq!(*calls.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_bus_remove_and_clear() {
        let crawler = bus_crawler().await;
        let bus = EventBus::new();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = bus.add(EventName::Start, recording(&calls, 1, HandlerOutcome::Continue));
        bus.add(EventName::Start, recording(&calls, 2, HandlerOutcome::Continue));
        bus.add(EventName::Xhr, noop());
        bus.add(EventName::Fetch, noop());

        assert!(bus.remove(EventName::Start, first));
        assert!(!bus.remove(EventName::Start, first));
        bus.dispatch(&Event::Start, &crawler).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![2]);

        bus.clear(Some(EventName::Xhr));
        assert!(!bus.has_listeners(EventName::Xhr));
        assert!(bus.has_listeners(EventName::Fetch));
        assert!(bus.has_listeners(EventName::Start));

        bus.clear(None);
        assert!(!bus.has_listeners(EventName::Fetch));
        assert!(!bus.has_listeners(EventName::Start));
        assert!(bus.dispatch(&Event::Start, &crawler).unwrap().is_empty());
    }
}
