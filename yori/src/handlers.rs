use anyhow::{Context, Result, anyhow, bail};
use clap::ArgMatches;
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use yori_core::crawl::{
    CrawlFinding, CrawlOptions, CrawlProgressCallback, CrawlResultCallback, execute_crawl,
};
use yori_core::report::{ReportFormat, generate_report, save_report};
use yori_scanner::{CdpBrowser, Cookie, CrawlerOptions};

pub const OPTIONS_FILE_NAME: &str = "options.json";

pub fn print_banner() {
    println!(
        "{} {}",
        "yori".bright_cyan().bold(),
        env!("CARGO_PKG_VERSION").bright_black()
    );
    println!("{}", "browser-driven crawler for dynamic web applications".bright_black());
    println!();
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

/// Install the fmt subscriber on stderr. `-v` raises the level to debug,
/// `-vv` to trace; `--quiet` keeps only errors.
pub fn init_tracing(verbosity: u8, quiet: bool) {
    let level = match (quiet, verbosity) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::INFO,
        (false, 1) => Level::DEBUG,
        (false, _) => Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

// Helper functions for crawl handler

/// Parse a `Name: value` header argument
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid header '{}': expected 'Name: value'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Invalid header '{}': empty name", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Parse a `name=value` cookie argument
pub fn parse_cookie(raw: &str) -> Result<Cookie> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid cookie '{}': expected 'name=value'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Invalid cookie '{}': empty name", raw);
    }
    Ok(Cookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        path: "/".to_string(),
        ..Cookie::default()
    })
}

/// Crawler options from the `--config` file (or defaults), with the command
/// line flags applied on top.
pub fn build_crawler_options(args: &ArgMatches) -> Result<CrawlerOptions> {
    let mut options = match args.get_one::<String>("config") {
        Some(path) => CrawlerOptions::from_file(path)
            .with_context(|| format!("Failed to load options from {}", path))?,
        None => CrawlerOptions::default(),
    };

    if let Some(headers) = args.get_many::<String>("header") {
        for raw in headers {
            let (name, value) = parse_header(raw)?;
            options.extra_headers.insert(name, value);
        }
    }
    if let Some(cookies) = args.get_many::<String>("cookie") {
        for raw in cookies {
            options.set_cookies.push(parse_cookie(raw)?);
        }
    }
    if let Some(patterns) = args.get_many::<String>("exclude") {
        options.excluded_urls.extend(patterns.cloned());
    }
    if let Some(user_agent) = args.get_one::<String>("user-agent") {
        options.user_agent = Some(user_agent.clone());
    }
    if let Some(referer) = args.get_one::<String>("referer") {
        options.referer = Some(referer.clone());
    }
    if let Some(seed) = args.get_one::<String>("seed") {
        options.random_seed = seed.clone();
    }
    if let Some(depth) = args.get_one::<usize>("max-recursion") {
        options.maximum_recursion = *depth;
    }
    if args.get_flag("no-fill") {
        options.fill_values = false;
    }
    if args.get_flag("no-trigger") {
        options.trigger_events = false;
    }
    if args.get_flag("keep-duplicates") {
        options.skip_duplicate_content = false;
    }
    if args.get_flag("post-message") {
        options.override_post_message = true;
    }

    // Fail on bad patterns before a browser is involved
    options.excluded_url_patterns()?;
    Ok(options)
}

pub fn report_format(args: &ArgMatches) -> ReportFormat {
    args.get_one::<String>("format")
        .and_then(|f| ReportFormat::from_str(f))
        .unwrap_or(ReportFormat::Text)
}

pub fn format_finding(finding: &CrawlFinding) -> String {
    match finding {
        CrawlFinding::Request(request) => {
            let mut line = format!(
                "{} {} {}",
                format!("[{}]", request.request_type).green().bold(),
                request.method.bright_white(),
                request.url
            );
            if let Some(ref trigger) = request.trigger {
                line.push_str(&format!(
                    " {}",
                    format!("({} on {})", trigger.event, trigger.element).bright_black()
                ));
            }
            line
        }
        CrawlFinding::DomChange(change) => {
            format!("{} {}", "[newdom]".cyan().bold(), change.root)
        }
        CrawlFinding::Redirect(url) => {
            format!("{} {}", "[redirect]".yellow().bold(), url)
        }
    }
}

pub fn handle_init(args: &ArgMatches) -> Result<()> {
    let dir = args
        .get_one::<String>("PATH")
        .map(String::as_str)
        .unwrap_or("~/.config/yori/");
    let force = args.get_flag("force");
    let config_dir = PathBuf::from(shellexpand::tilde(dir).as_ref());
    let options_path = write_default_options(&config_dir, force)?;

    print_divider();
    println!("{}", "  INITIALIZATION COMPLETE".green().bold());
    print_divider();
    println!(
        "{} Options file: {}",
        "✓".green().bold(),
        options_path.display().to_string().bright_white()
    );
    println!(
        "{} Use it with: yori crawl --config {} -u <URL>",
        "→".blue(),
        options_path.display()
    );
    Ok(())
}

/// Write the default crawler options as pretty JSON into `dir`.
pub fn write_default_options(dir: &Path, force: bool) -> Result<PathBuf> {
    let path = dir.join(OPTIONS_FILE_NAME);
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let json = serde_json::to_string_pretty(&CrawlerOptions::default())?;
    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

pub async fn handle_crawl(sub_matches: &ArgMatches, quiet: bool) -> Result<()> {
    let url = sub_matches
        .get_one::<String>("url")
        .ok_or_else(|| anyhow!("--url is required"))?;
    let devtools = sub_matches
        .get_one::<String>("devtools")
        .map(String::as_str)
        .unwrap_or(crate::commands::DEFAULT_DEVTOOLS);
    let crawler_options = build_crawler_options(sub_matches)?;
    let format = report_format(sub_matches);
    let output = sub_matches.get_one::<PathBuf>("output");

    if !quiet {
        println!("\n🕷️  Crawling {}", url.bright_white());
        println!("DevTools: {}", devtools);
        println!("Max recursion: {}", crawler_options.maximum_recursion);
        println!(
            "Fill inputs: {}  Trigger events: {}\n",
            crawler_options.fill_values, crawler_options.trigger_events
        );
    }

    let browser = CdpBrowser::connect(devtools)
        .await
        .with_context(|| format!("Failed to connect to DevTools at {}", devtools))?;

    // First Ctrl-C stops the crawl at its next checkpoint
    let stop = CancellationToken::new();
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} Stopping crawl...", "→".yellow().bold());
            stop_clone.cancel();
        }
    });

    let options = CrawlOptions {
        url: url.clone(),
        crawler: crawler_options,
        show_progress_bars: !quiet,
        stop: Some(stop),
    };

    let progress_callback: CrawlProgressCallback = Arc::new(|msg: String| {
        eprintln!("{}", msg);
    });
    let result_callback: Option<CrawlResultCallback> = if quiet {
        None
    } else {
        Some(Arc::new(|finding: CrawlFinding| {
            println!("{}", format_finding(&finding));
        }))
    };

    let report = execute_crawl(
        options,
        Arc::new(browser),
        Some(progress_callback),
        result_callback,
    )
    .await
    .context("Crawl failed")?;

    if !quiet {
        println!(
            "\n{} Crawl {}: {} request(s), {} DOM change(s), {} event(s) triggered\n",
            "✓".green().bold(),
            report.state,
            report.requests.len(),
            report.dom_changes.len(),
            report.events_triggered
        );
    }

    let content = generate_report(&report, format)?;
    match output {
        Some(path) => {
            save_report(&content, path)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            if !quiet {
                println!(
                    "{} Report saved: {}",
                    "✓".green().bold(),
                    path.display().to_string().bright_white()
                );
            }
        }
        None => print!("{}", content),
    }
    Ok(())
}
