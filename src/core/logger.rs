// Structured Logging for FX Sniper
// tracing + tracing-subscriber, RUST_LOG aware

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;
use std::sync::Once;

static INIT: Once = Once::new();

/// Map a config-style level name onto a tracing level (unknown => INFO)
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "INFO" => Level::INFO,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Setup structured logging for the entire application. Only the first call installs a subscriber.
pub fn setup_logging(log_level: Option<&str>, json_format: Option<bool>, console_output: Option<bool>) {
    let log_level_str = log_level.unwrap_or("INFO");
    let json_format = json_format.unwrap_or(false);
    let console_output = console_output.unwrap_or(true);
    let level = parse_level(log_level_str);

    INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env().add_directive(level.into());
        // Suppress noisy transport crates
        for noisy in ["tokio_tungstenite=warn", "tungstenite=warn", "native_tls=warn"] {
            if let Ok(directive) = noisy.parse::<Directive>() {
                filter = filter.add_directive(directive);
            }
        }

        let installed = if !console_output {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::sink)
                .try_init()
        } else if json_format {
            tracing_subscriber::fmt()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_env_filter(filter)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(filter)
                .try_init()
        };

        if installed.is_ok() {
            tracing::info!(log_level = %log_level_str, json = json_format, "Logging initialized");
        }
    });
}

/// Create a span for a named operation (scan cycles, restarts)
pub fn create_span(name: &str, level: Level) -> tracing::Span {
    match level {
        Level::TRACE => tracing::trace_span!(target: "fx_sniper", "op", name = %name),
        Level::DEBUG => tracing::debug_span!(target: "fx_sniper", "op", name = %name),
        Level::INFO => tracing::info_span!(target: "fx_sniper", "op", name = %name),
        Level::WARN => tracing::warn_span!(target: "fx_sniper", "op", name = %name),
        Level::ERROR => tracing::error_span!(target: "fx_sniper", "op", name = %name),
    }
}
