use tracing_subscriber::{fmt, EnvFilter};

/// Output format for the daemon's logs. Plain is for terminals; JSON is
/// for log shippers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    /// Parse the `log_format` config value. Anything unrecognized falls
    /// back to plain output.
    pub fn from_config(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Plain,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_level` when set. Safe to call multiple
/// times (e.g. in tests); later calls are no-ops.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let installed = match format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Plain => builder.try_init().is_ok(),
    };

    if installed {
        tracing::info!(service = service_name, ?format, "logging initialised");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
