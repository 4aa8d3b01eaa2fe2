//! Log subscriber setup.
//!
//! Set `HIGGS_LOG_FORMAT=json` for JSON lines suitable for log aggregation;
//! anything else gives human-readable output. `RUST_LOG` controls levels
//! (default: info).

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

const LOG_FORMAT_ENV: &str = "HIGGS_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

fn env_filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")))
}

fn fmt_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Pretty => Box::new(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false),
        ),
        LogFormat::Json => Box::new(
            fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        ),
    }
}

/// Install the global subscriber using `RUST_LOG` and `HIGGS_LOG_FORMAT`.
///
/// Panics if a subscriber is already installed; use [`try_init`] where that
/// can happen.
pub fn init() {
    init_with_level_and_format(None, LogFormat::from_env());
}

/// `level` is used when `RUST_LOG` is unset.
pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) {
    tracing_subscriber::registry()
        .with(fmt_layer(format))
        .with(env_filter(level))
        .init();
}

/// Like [`init`], but reports a second initialisation as an error instead of panicking.
pub fn try_init(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt_layer(LogFormat::from_env()))
        .with(env_filter(Some(level)))
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging subscriber init failed: {e}"))
}
