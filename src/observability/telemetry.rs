//! Telemetry & Observability
//!
//! Structured logging for the authority and the server adapter.
//! Features:
//! - Configurable log levels via RUST_LOG
//! - Compact human-readable or JSON output on stderr
//! - Sanitizing of participant-supplied strings
//! - Redaction of credential tokens before logging

use clap::ValueEnum;
use regex::Regex;
use std::fmt;
use std::sync::{Once, OnceLock};
use tracing::info_span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Sanitize a string for safe log output by escaping control characters.
/// Display names and element ids come from participants; a newline in one
/// must not forge a log line.
pub fn sanitize_for_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1b' => out.push_str("\\e"),
            '\x00' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

static TOKEN_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

fn token_patterns() -> &'static Vec<Regex> {
    TOKEN_PATTERNS.get_or_init(|| {
        vec![
            // Signed participant tokens: <expiry>.<hex signature>
            Regex::new(r"\b\d{9,}\.[0-9a-fA-F]{16,}\b").expect("invalid token regex"),
            // Token fields in serialized records
            Regex::new(r#"("token"\s*:\s*")[^"]*(")"#).expect("invalid token field regex"),
            // Bearer tokens
            Regex::new(r"(?i)Bearer\s+[A-Za-z0-9_\-\.]{8,}").expect("invalid bearer regex"),
        ]
    })
}

/// Mask credential tokens in a string (typically a raw client message)
/// before it is logged.
pub fn redact_token(input: &str) -> String {
    let patterns = token_patterns();
    let mut result = patterns[0].replace_all(input, "[REDACTED]").to_string();
    result = patterns[1].replace_all(&result, "${1}[REDACTED]${2}").to_string();
    patterns[2].replace_all(&result, "Bearer [REDACTED]").to_string()
}

/// Initialize global tracing subscriber.
/// Only enables tracing if RUST_LOG is explicitly set, keeping CLI output
/// clean otherwise.
pub fn init_tracing(format: LogFormat) {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        init_tracing_with_filter(&filter, format);
    }
}

/// Initialize with custom filter string. Later calls are ignored.
pub fn init_tracing_with_filter(filter: &str, format: LogFormat) {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter_layer = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));

        let result = match format {
            LogFormat::Compact => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_level(true)
                    .compact()
                    .with_writer(std::io::stderr);
                tracing_subscriber::registry()
                    .with(filter_layer)
                    .with(fmt_layer)
                    .try_init()
            }
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr);
                tracing_subscriber::registry()
                    .with(filter_layer)
                    .with(fmt_layer)
                    .try_init()
            }
        };
        let _ = result;
    });
}

/// Span covering one client connection.
pub fn connection_span(peer: &str, connection: &str) -> tracing::Span {
    info_span!("connection", peer = %sanitize_for_log(peer), connection = %connection)
}

/// Initialize tracing for tests with a simple subscriber
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
