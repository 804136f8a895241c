//! tracing-subscriber setup for the binary.
//!
//! - `CATPIPE_LOG`: filter directive (e.g. `debug`, `catpipe=trace`)
//! - `CATPIPE_LOG_FORMAT`: `text` or `json`
//!
//! Both fall back to the values passed on the command line. Output goes to
//! stderr so stdout only carries chat lines.

use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "CATPIPE_LOG";
pub const LOG_FORMAT_ENV: &str = "CATPIPE_LOG_FORMAT";

pub fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let format = std::env::var(LOG_FORMAT_ENV).unwrap_or_else(|_| format.to_string());

    match format.as_str() {
        "json" => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_current_span(true)
            .init(),
        _ => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init(),
    }
}

pub fn is_valid_format(format: &str) -> bool {
    matches!(format, "text" | "json")
}
