pub mod commands;
pub mod handlers;

pub use commands::command_argument_builder;
pub use handlers::{build_crawler_options, parse_cookie, parse_header, write_default_options};
