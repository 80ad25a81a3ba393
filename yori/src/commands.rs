use clap::{ArgAction, arg, command};

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);

pub const DEFAULT_DEVTOOLS: &str = "http://127.0.0.1:9222";

pub fn command_argument_builder() -> clap::Command {
    clap::Command::new("yori")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("yori")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .arg(
            arg!(-v --"verbose" "Increase log verbosity (-v debug, -vv trace)")
                .action(ArgAction::Count)
                .global(true),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Writes a crawler options file with the default settings")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Directory to store the options file in")
                        .default_value("~/.config/yori/"),
                )
                .arg(
                    arg!(-f --"force")
                        .help("Overwrite an existing options file")
                        .required(false),
                ),
        )
        .subcommand(
            command!("crawl")
                .about(
                    "Drive a Chromium page through a target, triggering events and recording \
                the requests and DOM changes they cause.",
                )
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(true)
                        .help("The URL to crawl (http:// is assumed when no scheme is given)"),
                )
                .arg(
                    arg!(-d --"devtools" <ENDPOINT>)
                        .required(false)
                        .help("DevTools HTTP endpoint of a Chromium started with --remote-debugging-port")
                        .default_value(DEFAULT_DEVTOOLS),
                )
                .arg(
                    arg!(-c --"config" <PATH>)
                        .required(false)
                        .help("JSON crawler options file (see `yori init`)"),
                )
                .arg(
                    arg!(-H --"header" <HEADER>)
                        .required(false)
                        .help("Extra request header as 'Name: value' (repeatable)")
                        .action(ArgAction::Append),
                )
                .arg(
                    arg!(-C --"cookie" <COOKIE>)
                        .required(false)
                        .help("Cookie to set before loading as 'name=value' (repeatable)")
                        .action(ArgAction::Append),
                )
                .arg(
                    arg!(-x --"exclude" <REGEX>)
                        .required(false)
                        .help("Do not report requests whose URL matches this pattern (repeatable)")
                        .action(ArgAction::Append),
                )
                .arg(
                    arg!(--"user-agent" <AGENT>)
                        .required(false)
                        .help("Override the browser user agent"),
                )
                .arg(
                    arg!(--"referer" <URL>)
                        .required(false)
                        .help("Referer header sent with every request"),
                )
                .arg(
                    arg!(--"seed" <SEED>)
                        .required(false)
                        .help("Seed for the generated form input values"),
                )
                .arg(
                    arg!(--"max-recursion" <DEPTH>)
                        .required(false)
                        .help("How deep to crawl DOM inserted by triggered events")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"no-fill")
                        .required(false)
                        .help("Do not fill form inputs")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"no-trigger")
                        .required(false)
                        .help("Do not trigger element events")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"keep-duplicates")
                        .required(false)
                        .help("Crawl DOM changes even when they look like ones already seen")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"post-message")
                        .required(false)
                        .help("Report window.postMessage calls")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save report to file (default: display to screen)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json, markdown")
                        .value_parser(["text", "json", "markdown"])
                        .default_value("text"),
                ),
        )
}
