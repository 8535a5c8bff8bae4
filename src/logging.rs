//! Structured logging configuration.
//!
//! Uses `tracing` with `tracing-subscriber` for configurable log levels
//! and structured output.
//!
//! ## Environment Variables
//!
//! - `TALKY_LOG` or `RUST_LOG`: log filter (e.g. `talky_gateway=debug,warn`)
//! - `TALKY_LOG_FORMAT`: output format (`pretty`, `compact`, `json`)
//!
//! ```bash
//! TALKY_LOG=talky_gateway=debug,warn talky-gateway --prompt "hello"
//! ```

use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

const DEFAULT_FILTER: &str = "talky_gateway=info,warn";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable with colors and indentation
    #[default]
    Pretty,
    /// Compact single-line output
    Compact,
    /// JSON output for log aggregation
    Json,
}

impl LogFormat {
    /// Parse from string (case-insensitive). Unknown values fall back to pretty.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive (e.g. "debug", "talky_gateway=debug,tokio_tungstenite=warn")
    pub filter: String,
    pub format: LogFormat,
    /// Include span events (enter/exit)
    pub with_spans: bool,
    /// Include file/line in logs
    pub with_file: bool,
    pub with_thread_ids: bool,
    /// Include target (module path)
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Pretty,
            with_spans: false,
            with_file: false,
            with_thread_ids: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let filter = std::env::var("TALKY_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string());

        let format = std::env::var("TALKY_LOG_FORMAT")
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        Self {
            filter,
            format,
            ..Default::default()
        }
    }

    /// Verbose configuration used by the CLI's `--verbose` flag.
    pub fn debug() -> Self {
        Self {
            filter: "talky_gateway=debug,info".to_string(),
            with_file: true,
            ..Default::default()
        }
    }

    /// JSON output with span events, for running under a supervisor.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            with_spans: true,
            ..Default::default()
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. Later calls are ignored, so tests and embedding
/// pipelines that already installed a subscriber keep theirs.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let span_events = if config.with_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file)
            .with_line_number(config.with_file)
            .with_thread_ids(config.with_thread_ids)
            .with_target(config.with_target)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file)
            .with_line_number(config.with_file)
            .with_thread_ids(config.with_thread_ids)
            .with_target(config.with_target)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file)
            .with_line_number(config.with_file)
            .with_thread_ids(config.with_thread_ids)
            .with_target(config.with_target)
            .boxed(),
    };

    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .try_init();
}

/// Convenience for `init(LogConfig::from_env())`.
pub fn init_from_env() {
    init(LogConfig::from_env());
}

/// Shorten user or model text for log lines.
pub(crate) fn preview(text: &str) -> String {
    const MAX: usize = 100;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
