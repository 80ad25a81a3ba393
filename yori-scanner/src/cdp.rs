//! Chrome DevTools Protocol backend.
//!
//! [`CdpClient`] is a JSON-RPC connection to one DevTools WebSocket: commands
//! carry an incrementing id, responses are routed back to the waiting caller
//! and events are fanned out on a broadcast channel. [`CdpBrowser`] holds a
//! browser-level connection for target management plus a page-level
//! connection for the main page, and implements [`BrowserDriver`].
//!
//! The browser is not launched here; Chromium must already be running with
//! `--remote-debugging-port`.

use crate::browser::{BindingCall, BrowserDriver, TargetInfo};
use crate::error::{Result, ScanError};
use crate::request::Cookie;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 1024;
const PAGE_DOMAINS: [&str; 4] = ["Page", "Runtime", "Network", "DOM"];

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<CdpResponse>>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Serialize)]
struct CdpCommand<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Clone)]
pub struct CdpResponse {
    pub id: u64,
    pub result: Option<Value>,
    pub error: Option<CdpResponseError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdpResponseError {
    pub code: i64,
    pub message: String,
}

pub fn parse_cdp_response(json: &Value) -> Option<CdpResponse> {
    let id = json.get("id")?.as_u64()?;
    Some(CdpResponse {
        id,
        result: json.get("result").cloned(),
        error: json
            .get("error")
            .and_then(|e| serde_json::from_value(e.clone()).ok()),
    })
}

pub fn parse_cdp_event(json: &Value) -> Option<CdpEvent> {
    if json.get("id").is_some() {
        return None;
    }
    Some(CdpEvent {
        method: json.get("method")?.as_str()?.to_string(),
        params: json.get("params").cloned().unwrap_or(Value::Null),
    })
}

pub struct CdpClient {
    url: String,
    next_id: AtomicU64,
    pending: PendingMap,
    writer: Mutex<WsSink>,
    events: broadcast::Sender<CdpEvent>,
    reader: JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        debug!("Connecting to DevTools WebSocket {}", ws_url);

        let (stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| ScanError::ConnectionFailed {
                url: ws_url.to_string(),
                reason: e.to_string(),
            })?;
        let (writer, reader) = stream.split();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending), events.clone()));

        Ok(Self {
            url: ws_url.to_string(),
            next_id: AtomicU64::new(1),
            pending,
            writer: Mutex::new(writer),
            events,
            reader,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.send_with_timeout(method, params, COMMAND_TIMEOUT)
            .await
    }

    pub async fn send_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let text = serde_json::to_string(&CdpCommand { id, method, params })?;

        // Registered before sending so a fast response cannot be missed.
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        debug!("-> {} #{}", method, id);
        let sent = self
            .writer
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(ScanError::Protocol {
                code: -1,
                message: format!("failed to send '{}': {}", method, e),
            });
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(ScanError::Protocol {
                    code: -1,
                    message: "response channel closed".to_string(),
                });
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(ScanError::Timeout {
                    method: method.to_string(),
                    duration: timeout,
                });
            }
        };

        if let Some(error) = response.error {
            return Err(ScanError::Protocol {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    pub async fn close(&self) {
        if let Err(e) = self.writer.lock().await.close().await {
            debug!("Closing {} failed: {}", self.url, e);
        }
        self.reader.abort();
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: SplitStream<WsStream>,
    pending: PendingMap,
    events: broadcast::Sender<CdpEvent>,
) {
    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("DevTools connection error: {}", e);
                break;
            }
        };

        let json: Value = match serde_json::from_str(&text) {
            Ok(json) => json,
            Err(e) => {
                warn!("Unparseable DevTools message: {}", e);
                continue;
            }
        };

        if let Some(response) = parse_cdp_response(&json) {
            if let Some(tx) = pending.lock().await.remove(&response.id) {
                let _ = tx.send(response);
            }
        } else if let Some(event) = parse_cdp_event(&json) {
            // No subscribers is not an error.
            let _ = events.send(event);
        }
    }

    for (id, tx) in pending.lock().await.drain() {
        let _ = tx.send(CdpResponse {
            id,
            result: None,
            error: Some(CdpResponseError {
                code: -1,
                message: "DevTools connection closed".to_string(),
            }),
        });
    }
}

/// Wait for the next event named `method`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<CdpEvent>,
    method: &str,
    timeout: Duration,
) -> Result<CdpEvent> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.method == method => return Ok(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    return Err(ScanError::Protocol {
                        code: -1,
                        message: "DevTools connection closed".to_string(),
                    });
                }
            }
        }
    };

    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| ScanError::Timeout {
            method: method.to_string(),
            duration: timeout,
        })?
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "Browser", default)]
    pub browser: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTarget {
    pub id: String,
    #[serde(rename = "type", default)]
    pub target_type: String,
    #[serde(default)]
    pub url: String,
    pub web_socket_debugger_url: String,
}

fn http_base(endpoint: &str) -> String {
    endpoint.trim_end_matches('/').to_string()
}

pub async fn fetch_version(http: &reqwest::Client, endpoint: &str) -> Result<VersionInfo> {
    let url = format!("{}/json/version", http_base(endpoint));
    let info = http
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json::<VersionInfo>()
        .await?;
    Ok(info)
}

pub async fn new_page_target(http: &reqwest::Client, endpoint: &str) -> Result<PageTarget> {
    let url = format!("{}/json/new?about:blank", http_base(endpoint));
    let target = http
        .put(&url)
        .send()
        .await?
        .error_for_status()?
        .json::<PageTarget>()
        .await?;
    Ok(target)
}

/// Value of a `Runtime.evaluate` result, or the exception it raised.
pub fn evaluation_value(result: &Value) -> Result<Value> {
    if let Some(details) = result.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .or_else(|| details.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("uncaught exception");
        return Err(ScanError::JsException(message.to_string()));
    }
    Ok(result
        .pointer("/result/value")
        .cloned()
        .unwrap_or(Value::Null))
}

/// Centre point of a DevTools box-model quad `[x1, y1, ..., x4, y4]`.
pub fn quad_center(quad: &Value) -> Option<(f64, f64)> {
    let points: Vec<f64> = quad.as_array()?.iter().filter_map(Value::as_f64).collect();
    if points.len() != 8 {
        return None;
    }
    let x = points.iter().step_by(2).sum::<f64>() / 4.0;
    let y = points.iter().skip(1).step_by(2).sum::<f64>() / 4.0;
    Some((x, y))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdpCookie {
    name: String,
    value: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    expires: f64,
    #[serde(default)]
    http_only: bool,
    #[serde(default)]
    secure: bool,
}

impl From<CdpCookie> for Cookie {
    fn from(c: CdpCookie) -> Self {
        Cookie {
            name: c.name,
            value: c.value,
            domain: c.domain,
            path: c.path,
            expires: c.expires as i64,
            http_only: c.http_only,
            secure: c.secure,
            url: None,
        }
    }
}

pub fn parse_cookies(result: &Value) -> Result<Vec<Cookie>> {
    let cookies = result.get("cookies").cloned().unwrap_or(Value::Array(vec![]));
    let cookies: Vec<CdpCookie> = serde_json::from_value(cookies)?;
    Ok(cookies.into_iter().map(Cookie::from).collect())
}

/// `Network.CookieParam` for a cookie; empty fields are left to the browser.
pub fn cookie_param(cookie: &Cookie) -> Value {
    let mut param = json!({
        "name": cookie.name,
        "value": cookie.value,
        "httpOnly": cookie.http_only,
        "secure": cookie.secure,
    });
    if let Some(ref url) = cookie.url {
        param["url"] = json!(url);
    }
    if !cookie.domain.is_empty() {
        param["domain"] = json!(cookie.domain);
    }
    if !cookie.path.is_empty() {
        param["path"] = json!(cookie.path);
    }
    if cookie.expires > 0 {
        param["expires"] = json!(cookie.expires);
    }
    param
}

pub fn parse_target_info(params: &Value) -> Option<TargetInfo> {
    let info = params.get("targetInfo")?;
    Some(TargetInfo {
        target_id: info.get("targetId")?.as_str()?.to_string(),
        target_type: info
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        url: info
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        opener_id: info
            .get("openerId")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn spawn_forwarder<T, F>(
    mut events: broadcast::Receiver<CdpEvent>,
    out: broadcast::Sender<T>,
    convert: F,
) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    F: Fn(&CdpEvent) -> Option<T> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(item) = convert(&event) {
                        let _ = out.send(item);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} DevTools event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn binding_call(event: &CdpEvent) -> Option<BindingCall> {
    if event.method != "Runtime.bindingCalled" {
        return None;
    }
    Some(BindingCall {
        name: event.params.get("name")?.as_str()?.to_string(),
        payload: event.params.get("payload")?.as_str()?.to_string(),
    })
}

fn created_target(event: &CdpEvent) -> Option<TargetInfo> {
    if event.method != "Target.targetCreated" {
        return None;
    }
    parse_target_info(&event.params)
}

struct PageSession {
    target_id: String,
    client: CdpClient,
    forwarder: JoinHandle<()>,
}

impl Drop for PageSession {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

pub struct CdpBrowser {
    endpoint: String,
    http: reqwest::Client,
    browser: CdpClient,
    target_forwarder: JoinHandle<()>,
    page: RwLock<Option<Arc<PageSession>>>,
    bindings: broadcast::Sender<BindingCall>,
    targets: broadcast::Sender<TargetInfo>,
}

impl CdpBrowser {
    /// Attach to a running Chromium through its HTTP debugging endpoint,
    /// e.g. `http://127.0.0.1:9222`, and open the main page.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let http = reqwest::Client::new();
        let version = fetch_version(&http, endpoint).await?;
        info!("Attached to {} at {}", version.browser, endpoint);

        let browser = CdpClient::connect(&version.web_socket_debugger_url).await?;
        let (bindings, _) = broadcast::channel(EVENT_CAPACITY);
        let (targets, _) = broadcast::channel(EVENT_CAPACITY);
        let target_forwarder = spawn_forwarder(browser.subscribe(), targets.clone(), created_target);
        browser
            .send("Target.setDiscoverTargets", json!({"discover": true}))
            .await?;

        let cdp = Self {
            endpoint: endpoint.to_string(),
            http,
            browser,
            target_forwarder,
            page: RwLock::new(None),
            bindings,
            targets,
        };
        cdp.open_page().await?;
        Ok(cdp)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Target id of the main page.
    pub fn page_id(&self) -> Option<String> {
        self.page
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| p.target_id.clone())
    }

    fn page(&self) -> Result<Arc<PageSession>> {
        self.page
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ScanError::Other("no page is open".to_string()))
    }

    async fn navigate_with(
        &self,
        method: &str,
        params: Value,
        url: &str,
        timeout: Duration,
    ) -> Result<()> {
        let page = self.page()?;
        let mut events = page.client.subscribe();

        let result = page.client.send(method, params).await?;
        if let Some(reason) = result
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
        {
            return Err(ScanError::Navigation {
                url: url.to_string(),
                reason: reason.to_string(),
            });
        }

        wait_for_event(&mut events, "Page.loadEventFired", timeout)
            .await
            .map_err(|e| match e {
                ScanError::Timeout { duration, .. } => ScanError::Navigation {
                    url: url.to_string(),
                    reason: format!("page did not load within {:?}", duration),
                },
                other => other,
            })?;
        Ok(())
    }
}

#[async_trait]
impl BrowserDriver for CdpBrowser {
    async fn open_page(&self) -> Result<()> {
        let target = new_page_target(&self.http, &self.endpoint).await?;
        debug!("Opened page target {} ({})", target.id, target.target_type);

        let client = CdpClient::connect(&target.web_socket_debugger_url).await?;
        for domain in PAGE_DOMAINS {
            client.send(&format!("{}.enable", domain), json!({})).await?;
        }
        let forwarder = spawn_forwarder(client.subscribe(), self.bindings.clone(), binding_call);

        let session = Arc::new(PageSession {
            target_id: target.id,
            client,
            forwarder,
        });
        let previous = self
            .page
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(session);

        if let Some(previous) = previous {
            previous.client.close().await;
            if let Err(e) = self.close_target(&previous.target_id).await {
                debug!("Closing previous page {} failed: {}", previous.target_id, e);
            }
        }
        Ok(())
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        self.navigate_with("Page.navigate", json!({"url": url}), url, timeout)
            .await
    }

    async fn reload(&self, timeout: Duration) -> Result<()> {
        self.navigate_with("Page.reload", json!({}), "reload", timeout)
            .await
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        let page = self.page()?;
        let result = page
            .client
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;
        evaluation_value(&result)
    }

    async fn evaluate_on_new_document(&self, source: &str) -> Result<()> {
        self.page()?
            .client
            .send(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({"source": source}),
            )
            .await?;
        Ok(())
    }

    async fn query_selector_count(&self, selector: &str) -> Result<usize> {
        let expression = format!(
            "document.querySelectorAll({}).length",
            serde_json::to_string(selector)?
        );
        let count = self.evaluate(&expression).await?;
        Ok(count.as_u64().unwrap_or(0) as usize)
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let page = self.page()?;
        let client = &page.client;
        let not_found = || ScanError::ElementNotFound(selector.to_string());

        let document = client.send("DOM.getDocument", json!({"depth": 0})).await?;
        let root = document
            .pointer("/root/nodeId")
            .and_then(Value::as_i64)
            .ok_or_else(not_found)?;
        let found = client
            .send(
                "DOM.querySelector",
                json!({"nodeId": root, "selector": selector}),
            )
            .await?;
        let node_id = found
            .get("nodeId")
            .and_then(Value::as_i64)
            .filter(|id| *id != 0)
            .ok_or_else(not_found)?;

        client
            .send("DOM.scrollIntoViewIfNeeded", json!({"nodeId": node_id}))
            .await?;
        let model = client
            .send("DOM.getBoxModel", json!({"nodeId": node_id}))
            .await?;
        let (x, y) = model
            .pointer("/model/content")
            .and_then(quad_center)
            .ok_or_else(not_found)?;

        for event_type in ["mousePressed", "mouseReleased"] {
            client
                .send(
                    "Input.dispatchMouseEvent",
                    json!({
                        "type": event_type,
                        "x": x,
                        "y": y,
                        "button": "left",
                        "clickCount": 1,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let result = self
            .page()?
            .client
            .send("Network.getCookies", json!({}))
            .await?;
        parse_cookies(&result)
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        if cookies.is_empty() {
            return Ok(());
        }
        let params: Vec<Value> = cookies.iter().map(cookie_param).collect();
        self.page()?
            .client
            .send("Network.setCookies", json!({"cookies": params}))
            .await?;
        Ok(())
    }

    async fn set_extra_headers(&self, headers: &BTreeMap<String, String>) -> Result<()> {
        self.page()?
            .client
            .send("Network.setExtraHTTPHeaders", json!({"headers": headers}))
            .await?;
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> Result<()> {
        self.page()?
            .client
            .send(
                "Network.setUserAgentOverride",
                json!({"userAgent": user_agent}),
            )
            .await?;
        Ok(())
    }

    async fn expose_binding(&self, name: &str) -> Result<()> {
        self.page()?
            .client
            .send("Runtime.addBinding", json!({"name": name}))
            .await?;
        Ok(())
    }

    fn subscribe_bindings(&self) -> broadcast::Receiver<BindingCall> {
        self.bindings.subscribe()
    }

    fn subscribe_targets(&self) -> broadcast::Receiver<TargetInfo> {
        self.targets.subscribe()
    }

    async fn create_target(&self, url: &str) -> Result<String> {
        let result = self
            .browser
            .send("Target.createTarget", json!({"url": url}))
            .await?;
        result
            .get("targetId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ScanError::Protocol {
                code: -1,
                message: "Target.createTarget returned no targetId".to_string(),
            })
    }

    async fn close_target(&self, target_id: &str) -> Result<()> {
        self.browser
            .send("Target.closeTarget", json!({"targetId": target_id}))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let page = self
            .page
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(page) = page {
            page.client.close().await;
            self.close_target(&page.target_id).await?;
        }
        self.target_forwarder.abort();
        self.browser.close().await;
        info!("Detached from {}", self.endpoint);
        Ok(())
    }
}
