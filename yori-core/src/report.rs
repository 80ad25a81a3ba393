// Report generation from collected crawl results

use crate::crawl::{CrawlReport, extract_url_path};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use yori_scanner::{Request, RequestType};

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

const REQUEST_TYPES: [RequestType; 6] = [
    RequestType::Xhr,
    RequestType::Fetch,
    RequestType::Jsonp,
    RequestType::WebSocket,
    RequestType::Form,
    RequestType::Navigation,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportFormat {
    Text,
    Json,
    Markdown,
}

impl ReportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            "markdown" | "md" => Some(ReportFormat::Markdown),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Text => "txt",
            ReportFormat::Json => "json",
            ReportFormat::Markdown => "md",
        }
    }
}

pub fn generate_report(report: &CrawlReport, format: ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Text => Ok(generate_text_report(report)),
        ReportFormat::Json => generate_json_report(report),
        ReportFormat::Markdown => Ok(generate_markdown_report(report)),
    }
}

pub fn generate_text_report(report: &CrawlReport) -> String {
    let mut out = String::new();

    // Header
    out.push_str(RULE);
    out.push_str("                           YORI CRAWL REPORT\n");
    out.push_str(RULE);
    out.push('\n');

    out.push_str(&format!("Target:       {}\n", report.target_url));
    if let Some(ref redirect) = report.redirect {
        out.push_str(&format!("Redirected:   {}\n", redirect));
    }
    out.push_str(&format!("Status:       {}\n", status_to_string(report)));
    out.push_str(&format!("Crawl Date:   {}\n", format_timestamp(report.started_at)));
    out.push_str(&format!("Duration:     {:.1} seconds\n", report.duration_ms() as f64 / 1000.0));
    out.push('\n');

    // Summary
    out.push_str(RULE);
    out.push_str("SUMMARY\n");
    out.push_str(RULE);
    out.push('\n');
    out.push_str(&format!("  Requests found:    {}\n", report.requests.len()));
    for (request_type, count) in count_by_type(&report.requests) {
        out.push_str(&format!("    {:<12} {}\n", request_type, count));
    }
    out.push_str(&format!("  DOM changes:       {}\n", report.dom_changes.len()));
    out.push_str(&format!("  Events triggered:  {}\n", report.events_triggered));
    out.push_str(&format!("  Errors:            {}\n", report.errors.len()));
    out.push('\n');

    if !report.requests.is_empty() {
        out.push_str(RULE);
        out.push_str("REQUESTS\n");
        out.push_str(RULE);
        out.push('\n');

        for (host, requests) in group_by_host(&report.requests) {
            out.push_str(&format!("## {}\n", host));
            for request in requests {
                out.push_str(&format!(
                    "  [{}] {} {}\n",
                    request.request_type,
                    request.method,
                    extract_url_path(&request.url)
                ));
                if let Some(ref data) = request.data {
                    out.push_str(&format!("      data: {}\n", data));
                }
                if let Some(ref trigger) = request.trigger {
                    out.push_str(&format!("      trigger: {} on {}\n", trigger.event, trigger.element));
                }
            }
            out.push('\n');
        }
    }

    if !report.dom_changes.is_empty() {
        out.push_str(RULE);
        out.push_str("DOM CHANGES\n");
        out.push_str(RULE);
        out.push('\n');
        for change in &report.dom_changes {
            match change.trigger {
                Some(ref trigger) => out.push_str(&format!(
                    "  {}  (after {} on {})\n",
                    change.root, trigger.event, trigger.element
                )),
                None => out.push_str(&format!("  {}\n", change.root)),
            }
        }
        out.push('\n');
    }

    if !report.errors.is_empty() {
        out.push_str(RULE);
        out.push_str("ERRORS\n");
        out.push_str(RULE);
        out.push('\n');
        for error in &report.errors {
            out.push_str(&format!("  [{}] {}\n", error.kind, error.message));
        }
        out.push('\n');
    }

    // Footer
    out.push_str(RULE);
    out.push_str("                             End of Report\n");
    out.push_str(RULE);
    out.push_str("\nGenerated by Yori - a browser-driven crawler\n");
    out.push_str("For authorized security testing only.\n\n");

    out
}

pub fn generate_json_report(report: &CrawlReport) -> Result<String, serde_json::Error> {
    let json_report = serde_json::json!({
        "report": {
            "metadata": {
                "generator": "Yori",
                "version": env!("CARGO_PKG_VERSION"),
                "generated_at": chrono::Utc::now().to_rfc3339(),
                "format": "json",
                "disclaimer": "For authorized security testing only"
            },
            "session": {
                "target": report.target_url,
                "redirect": report.redirect,
                "state": report.state,
                "start_time": format_iso8601_timestamp(report.started_at),
                "end_time": format_iso8601_timestamp(report.finished_at),
                "duration_ms": report.duration_ms()
            },
            "summary": {
                "total_requests": report.requests.len(),
                "requests_by_type": count_by_type(&report.requests),
                "dom_changes": report.dom_changes.len(),
                "events_triggered": report.events_triggered,
                "errors": report.errors.len()
            },
            "requests": report.requests,
            "dom_changes": report.dom_changes,
            "errors": report.errors,
            "cookies": report.cookies
        }
    });

    serde_json::to_string_pretty(&json_report)
}

pub fn generate_markdown_report(report: &CrawlReport) -> String {
    let mut out = String::new();

    out.push_str("# Yori Crawl Report\n\n");
    out.push_str(&format!("- **Target:** {}\n", report.target_url));
    if let Some(ref redirect) = report.redirect {
        out.push_str(&format!("- **Redirected:** {}\n", redirect));
    }
    out.push_str(&format!("- **Status:** {}\n", status_to_string(report)));
    out.push_str(&format!("- **Crawl date:** {}\n", format_timestamp(report.started_at)));
    out.push_str(&format!("- **Events triggered:** {}\n\n", report.events_triggered));

    out.push_str("## Summary\n\n");
    out.push_str("| Type | Requests |\n|---|---|\n");
    for (request_type, count) in count_by_type(&report.requests) {
        out.push_str(&format!("| {} | {} |\n", request_type, count));
    }
    out.push_str(&format!("| **total** | **{}** |\n\n", report.requests.len()));

    if !report.requests.is_empty() {
        out.push_str("## Requests\n\n");
        out.push_str("| Type | Method | URL | Trigger |\n|---|---|---|---|\n");
        for request in &report.requests {
            let trigger = request
                .trigger
                .as_ref()
                .map(|t| format!("`{}` on `{}`", t.event, escape_cell(&t.element)))
                .unwrap_or_default();
            out.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                request.request_type,
                request.method,
                escape_cell(&request.url),
                trigger
            ));
        }
        out.push('\n');
    }

    if !report.dom_changes.is_empty() {
        out.push_str("## DOM changes\n\n");
        for change in &report.dom_changes {
            match change.trigger {
                Some(ref trigger) => out.push_str(&format!(
                    "- `{}` after `{}` on `{}`\n",
                    change.root, trigger.event, trigger.element
                )),
                None => out.push_str(&format!("- `{}`\n", change.root)),
            }
        }
        out.push('\n');
    }

    if !report.errors.is_empty() {
        out.push_str("## Errors\n\n");
        for error in &report.errors {
            out.push_str(&format!("- **{}**: {}\n", error.kind, error.message));
        }
        out.push('\n');
    }

    out.push_str("---\n_Generated by Yori. For authorized security testing only._\n");
    out
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

// Helper functions

fn status_to_string(report: &CrawlReport) -> &'static str {
    match report.state {
        yori_scanner::SessionState::Done => "Completed",
        yori_scanner::SessionState::Stopped => "Stopped",
        yori_scanner::SessionState::Crawling => "Running",
        _ => "Incomplete",
    }
}

/// Non-zero request counts keyed by type name.
fn count_by_type(requests: &[Request]) -> BTreeMap<&'static str, usize> {
    REQUEST_TYPES
        .iter()
        .map(|t| (t.as_str(), requests.iter().filter(|r| r.request_type == *t).count()))
        .filter(|(_, count)| *count > 0)
        .collect()
}

fn group_by_host(requests: &[Request]) -> BTreeMap<String, Vec<&Request>> {
    let mut by_host: BTreeMap<String, Vec<&Request>> = BTreeMap::new();
    for request in requests {
        let host = url::Url::parse(&request.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        by_host.entry(host).or_default().push(request);
    }
    by_host
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

fn format_timestamp(timestamp_ms: i64) -> String {
    use chrono::{DateTime, Utc};
    let datetime = DateTime::<Utc>::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now);
    datetime.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_iso8601_timestamp(timestamp_ms: i64) -> String {
    use chrono::{DateTime, Utc};
    let datetime = DateTime::<Utc>::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now);
    datetime.to_rfc3339()
}
