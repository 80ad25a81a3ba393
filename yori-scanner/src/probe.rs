//! Page-side instrumentation and the expressions the crawler evaluates
//! against it.
//!
//! Elements never cross the DevTools boundary as handles. The host refers to
//! them by the selector the probe computed (`getElementSelector`) and the
//! probe turns selectors back into elements with `resolve`.

use crate::error::Result;
use crate::options::CrawlerOptions;
use serde_json::Value;
use std::collections::BTreeMap;

pub const PROBE_SOURCE: &str = include_str!("probe.js");

/// Binding the probe calls with `{id, name, params}` payloads.
pub const BINDING_NAME: &str = "__yoriProbeEvent";

/// Elements carrying this attribute, and their subtrees, are not crawled.
pub const EXCLUDED_ATTRIBUTE: &str = "data-yori-crawl-excluded";

/// Probe source with the options, generated input values and binding name
/// substituted in.
pub fn bootstrap_script(
    options: &CrawlerOptions,
    input_values: &BTreeMap<String, String>,
) -> Result<String> {
    Ok(PROBE_SOURCE
        .replace("__YORI_OPTIONS__", &serde_json::to_string(options)?)
        .replace("__YORI_INPUT_VALUES__", &serde_json::to_string(input_values)?)
        .replace("__YORI_BINDING__", &js_string(BINDING_NAME)?))
}

pub fn js_string(s: &str) -> Result<String> {
    Ok(serde_json::to_string(s)?)
}

fn with_probe(body: &str, fallback: &str) -> String {
    format!(
        "(() => {{ const p = window.__PROBE__; if (!p) return {}; {} }})()",
        fallback, body
    )
}

/// Element expression for a selector; `None` is the document element.
fn element(selector: Option<&str>) -> Result<String> {
    match selector {
        Some(selector) => Ok(format!("p.resolve({})", js_string(selector)?)),
        None => Ok("document.documentElement".to_string()),
    }
}

pub fn fill_input_values(selector: Option<&str>) -> Result<String> {
    Ok(with_probe(
        &format!("return p.fillInputValues({});", element(selector)?),
        "0",
    ))
}

/// Selectors of the subtree below `selector` in depth-first pre-order.
pub fn dom_tree(selector: Option<&str>) -> Result<String> {
    Ok(with_probe(
        &format!(
            "const el = {}; return el ? p.getDomTree(el) : [];",
            element(selector)?
        ),
        "[]",
    ))
}

pub fn events_for_element(selector: &str) -> Result<String> {
    Ok(with_probe(
        &format!(
            "return p.getEventsForElement({});",
            element(Some(selector))?
        ),
        "[]",
    ))
}

pub fn trigger_element_event(selector: &str, event: &str) -> Result<String> {
    Ok(with_probe(
        &format!(
            "const el = {}; if (!el) return null; return p.triggerElementEvent(el, {});",
            element(Some(selector))?,
            js_string(event)?
        ),
        "false",
    ))
}

pub fn element_selector(selector: &str) -> Result<String> {
    Ok(with_probe(
        &format!(
            "const el = {}; return el ? p.getElementSelector(el) : null;",
            element(Some(selector))?
        ),
        "null",
    ))
}

pub fn dom_tag_list(selector: Option<&str>) -> Result<String> {
    Ok(with_probe(
        &format!(
            "const el = {}; return el ? p.getDomTagList(el) : [];",
            element(selector)?
        ),
        "[]",
    ))
}

pub fn pop_mutation() -> String {
    with_probe(
        "const el = p.popMutation(); return el ? p.getElementSelector(el) : null;",
        "null",
    )
}

pub fn total_dom_mutations() -> String {
    with_probe("return p.totalDOMMutations;", "0")
}

pub fn start_mutation_observer() -> String {
    with_probe(
        "p.resetMutations(); p._newMutationObserver(document.documentElement); return true;",
        "false",
    )
}

pub fn wait_async_requests() -> String {
    with_probe(
        "return Promise.all([p.waitJsonp(), p.waitWebsocket()]).then(() => true);",
        "true",
    )
}

pub fn reply(id: u64, value: &Value) -> String {
    with_probe(&format!("p.__reply({}, {}); return true;", id, value), "false")
}

pub const LOCATION_HREF: &str = "document.location.href";

pub const HAS_DOCUMENT_ELEMENT: &str = "!!document.documentElement";
