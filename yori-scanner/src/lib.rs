pub mod browser;
pub mod cdp;
pub mod crawler;
pub mod dedup;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod options;
pub mod probe;
pub mod request;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;
pub mod session;
pub mod tracker;

pub use browser::{BindingCall, BrowserDriver, TargetInfo};
pub use cdp::CdpBrowser;
pub use crawler::Crawler;
pub use error::ScanError;
pub use events::{Event, EventName, HandlerOutcome};
pub use options::CrawlerOptions;
pub use request::{Cookie, CrawlError, Request, RequestType, Trigger};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedBrowser;
pub use session::SessionState;
