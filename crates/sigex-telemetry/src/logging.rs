//! Structured logging initialization.
//!
//! Pipeline events carry `correlation_id`, `instrument`, `side` and, on the
//! probe path, `variation` and `classification` as fields. The JSON format
//! flattens them to top-level keys so log queries can filter on them.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{TelemetryError, TelemetryResult};

/// Workspace crates logged at `debug` by default.
const PIPELINE_CRATES: &[&str] = &[
    "sigex_core",
    "sigex_persistence",
    "sigex_gate",
    "sigex_executor",
    "sigex_telemetry",
    "sigex_bot",
];

/// HTTP stack used by the webhook notifier; only its warnings are useful.
const QUIET_CRATES: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event, fields flattened.
    Json,
    /// Human-readable, for terminals.
    Pretty,
}

impl LogFormat {
    /// `production` selects JSON; anything else, or unset, selects pretty.
    pub fn from_rust_env(value: Option<&str>) -> Self {
        match value {
            Some("production") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// `info` overall, `debug` for the pipeline crates, `warn` for the HTTP stack.
pub fn default_directives() -> String {
    let mut directives = vec!["info".to_string()];
    directives.extend(PIPELINE_CRATES.iter().map(|c| format!("{c}=debug")));
    directives.extend(QUIET_CRATES.iter().map(|c| format!("{c}=warn")));
    directives.join(",")
}

/// Install the global subscriber. `RUST_LOG` replaces the default filter;
/// `RUST_ENV=production` switches to JSON.
pub fn init_logging() -> TelemetryResult<()> {
    let rust_env = std::env::var("RUST_ENV").ok();
    let format = LogFormat::from_rust_env(rust_env.as_deref());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives()))
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().compact().with_target(true))
            .try_init(),
    };
    result.map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_cover_every_pipeline_crate() {
        let directives = default_directives();
        assert!(directives.starts_with("info,"));
        for krate in PIPELINE_CRATES {
            assert!(directives.contains(&format!("{krate}=debug")), "{krate} missing");
        }
        assert!(directives.contains("reqwest=warn"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_format_from_rust_env() {
        assert_eq!(LogFormat::from_rust_env(Some("production")), LogFormat::Json);
        assert_eq!(LogFormat::from_rust_env(Some("staging")), LogFormat::Pretty);
        assert_eq!(LogFormat::from_rust_env(None), LogFormat::Pretty);
    }
}
