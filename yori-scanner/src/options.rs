use crate::dedup::{DEFAULT_ELEMENTS_DIFF_THRESHOLD, DEFAULT_SIMHASH_THRESHOLD};
use crate::error::{Result, ScanError};
use crate::request::Cookie;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Maps an input `name` pattern to the kind of value to type into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMatch {
    pub name: String,
    pub value: String,
}

impl InputMatch {
    fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Crawler configuration.
///
/// Serialized in camelCase because the same JSON is injected into the page
/// for the probe script to read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlerOptions {
    pub check_ajax: bool,
    pub check_fetch: bool,
    pub check_websockets: bool,
    pub check_script_insertion: bool,
    pub fill_values: bool,
    pub trigger_events: bool,
    #[serde(rename = "ajaxTimeout")]
    pub ajax_timeout_ms: u64,
    #[serde(rename = "navigationTimeout")]
    pub navigation_timeout_ms: u64,
    pub maximum_recursion: usize,
    pub maximum_ajax_chain: usize,
    pub random_seed: String,
    pub input_name_match_value: Vec<InputMatch>,
    pub events_map: BTreeMap<String, Vec<String>>,
    pub mouse_events: Vec<String>,
    pub simulate_real_events: bool,
    pub override_post_message: bool,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub extra_headers: BTreeMap<String, String>,
    pub set_cookies: Vec<Cookie>,
    /// Regular expressions; requests whose URL matches are not dispatched.
    pub excluded_urls: Vec<String>,
    pub skip_duplicate_content: bool,
    pub elements_diff_threshold: f64,
    pub simhash_threshold: f64,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        let events_map = [
            ("button", &["click", "dblclick", "keydown", "keyup", "mouseup", "mousedown"][..]),
            ("select", &["change", "click", "dblclick", "keydown", "keyup", "mouseup", "mousedown"][..]),
            ("input", &["change", "click", "dblclick", "blur", "focus", "keydown", "keyup", "mouseup", "mousedown"][..]),
            ("a", &["click", "dblclick", "keydown", "keyup", "mouseup", "mousedown"][..]),
            ("textarea", &["change", "click", "dblclick", "blur", "focus", "keydown", "keyup", "mouseup", "mousedown"][..]),
            ("span", &["click", "dblclick", "mouseup", "mousedown"][..]),
            ("td", &["click", "dblclick", "mouseup", "mousedown"][..]),
            ("tr", &["click", "dblclick", "mouseup", "mousedown"][..]),
            ("div", &["click", "dblclick", "mouseup", "mousedown"][..]),
        ]
        .into_iter()
        .map(|(selector, events)| {
            (
                selector.to_string(),
                events.iter().map(|e| e.to_string()).collect(),
            )
        })
        .collect();

        Self {
            check_ajax: true,
            check_fetch: true,
            check_websockets: true,
            check_script_insertion: true,
            fill_values: true,
            trigger_events: true,
            ajax_timeout_ms: 3000,
            navigation_timeout_ms: 20000,
            maximum_recursion: 15,
            maximum_ajax_chain: 30,
            random_seed: "IsHOulDb34RaNd0MsTR1ngbUt1mN0t".to_string(),
            input_name_match_value: vec![
                InputMatch::new("mail", "email"),
                InputMatch::new("((number)|(phone))|(^tel)", "number"),
                InputMatch::new("(date)|(birth)", "humandate"),
                InputMatch::new("((month)|(day))|(^mon$)", "month"),
                InputMatch::new("year", "year"),
                InputMatch::new("url", "url"),
                InputMatch::new("firstname", "firstname"),
                InputMatch::new("(surname)|(lastname)", "surname"),
            ],
            events_map,
            mouse_events: vec!["click".to_string()],
            simulate_real_events: true,
            override_post_message: false,
            referer: None,
            user_agent: None,
            extra_headers: BTreeMap::new(),
            set_cookies: Vec::new(),
            excluded_urls: Vec::new(),
            skip_duplicate_content: true,
            elements_diff_threshold: DEFAULT_ELEMENTS_DIFF_THRESHOLD,
            simhash_threshold: DEFAULT_SIMHASH_THRESHOLD,
        }
    }
}

impl CrawlerOptions {
    /// Load options from a JSON file. Missing fields keep their defaults and
    /// a leading `~` in the path is expanded.
    pub fn from_file(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path);
        let content = fs::read_to_string(Path::new(expanded.as_ref()))?;
        let options = serde_json::from_str(&content)?;
        Ok(options)
    }

    pub fn ajax_timeout(&self) -> Duration {
        Duration::from_millis(self.ajax_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    /// Compile `excluded_urls`, failing on the first invalid pattern.
    pub fn excluded_url_patterns(&self) -> Result<Vec<Regex>> {
        self.excluded_urls
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ScanError::ParseError(format!("invalid excluded URL pattern '{}': {}", pattern, e))
                })
            })
            .collect()
    }
}

/// Prefix `http://` when the target has no scheme.
pub fn normalize_url(target: &str) -> String {
    let target = target.trim();
    if target.len() < 4 || !target.to_lowercase().starts_with("http") {
        return format!("http://{}", target);
    }
    target.to_string()
}

pub fn matches_excluded_url(url: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|p| p.is_match(url))
}

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SYMBOLS: &[&str] = &["!", "#", "&", "^", ";", ".", ",", "?", "%", "$", "*"];
const MONTHS: &[&str] = &["01", "02", "03", "04", "05", "06", "07", "08", "09", "10", "11", "12"];
const YEARS: &[&str] = &["1982", "1989", "1990", "1994", "1995", "1996"];
const NAMES: &[&str] = &[
    "james", "john", "robert", "michael", "william", "david", "richard", "charles", "joseph",
    "thomas", "christopher", "daniel", "paul", "mark", "donald", "george", "kenneth",
];
const SURNAMES: &[&str] = &[
    "anderson", "thomas", "jackson", "white", "harris", "martin", "thompson", "garcia",
    "martinez", "robinson", "clark", "rodriguez", "lewis", "lee", "walker", "hall",
];
const DOMAINS: &[&str] = &[".com", ".org", ".net", ".it", ".tv", ".de", ".fr"];

/// Deterministic pseudo-random source cycling over the seed's characters.
struct SeededPicker {
    seed: Vec<usize>,
    current: usize,
}

impl SeededPicker {
    fn new(seed: &str) -> Self {
        Self {
            seed: seed.chars().map(|c| c as usize).collect(),
            current: 0,
        }
    }

    fn next(&mut self, max: usize) -> usize {
        if self.seed.is_empty() || max == 0 {
            return 0;
        }
        let value = self.seed[self.current] % max;
        self.current = (self.current + 1) % self.seed.len();
        value
    }

    fn pick<'a>(&mut self, items: &[&'a str]) -> &'a str {
        if items.is_empty() {
            return "";
        }
        items[self.next(items.len())]
    }

    fn string(&mut self, len: usize) -> String {
        (0..len)
            .map(|_| LETTERS[self.next(LETTERS.len())] as char)
            .collect()
    }

    fn digits(&mut self, len: usize) -> String {
        (0..len)
            .map(|_| char::from(b'0' + self.next(10) as u8))
            .collect()
    }
}

/// Values typed into form inputs, keyed by input kind. The same seed always
/// produces the same values.
///
/// Values are drawn from the seed in a fixed order, so changing the order
/// below changes what every seed produces.
pub fn generate_input_values(seed: &str) -> BTreeMap<String, String> {
    let mut picker = SeededPicker::new(seed);
    let mut values = BTreeMap::new();

    values.insert("string".to_string(), picker.string(8));
    values.insert("number".to_string(), picker.digits(3));
    values.insert("month".to_string(), picker.pick(MONTHS).to_string());
    values.insert("year".to_string(), picker.pick(YEARS).to_string());

    let date = format!(
        "{}-{}-{}",
        picker.pick(YEARS),
        picker.pick(MONTHS),
        picker.pick(MONTHS)
    );
    values.insert("color".to_string(), format!("#{}", picker.string(6)));
    values.insert(
        "week".to_string(),
        format!("{}-W{}", picker.pick(YEARS), picker.pick(&MONTHS[..6])),
    );
    let time = format!("{}:{}", picker.pick(MONTHS), picker.pick(MONTHS));
    values.insert("datetimeLocal".to_string(), format!("{}T{}", date, time));
    values.insert("date".to_string(), date);
    values.insert("time".to_string(), time);

    let domain = format!("{}{}", picker.string(12).to_lowercase(), picker.pick(DOMAINS));
    let surname = picker.pick(SURNAMES).to_string();
    let firstname = picker.pick(NAMES).to_string();
    values.insert(
        "email".to_string(),
        format!("{}.{}@{}", firstname, surname, domain),
    );
    values.insert("url".to_string(), format!("http://www.{}", domain));
    values.insert("domain".to_string(), domain);

    values.insert(
        "humandate".to_string(),
        format!(
            "{}/{}/{}",
            picker.pick(MONTHS),
            picker.pick(MONTHS),
            picker.pick(YEARS)
        ),
    );
    values.insert(
        "password".to_string(),
        format!(
            "{}{}{}{}{}",
            picker.string(3),
            picker.pick(SYMBOLS),
            picker.string(2),
            picker.string(3),
            picker.string(2)
        ),
    );
    values.insert("lastname".to_string(), surname.clone());
    values.insert("surname".to_string(), surname);
    values.insert("firstname".to_string(), firstname);
    values.insert(
        "tel".to_string(),
        format!("+{} {}", picker.digits(1), picker.digits(10)),
    );

    values
}
