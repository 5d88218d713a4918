use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_FILTER: &str = "coopmat_bench=info";
pub const QUIET_FILTER: &str = "coopmat_bench=warn";

pub struct TraceOptions {
    /// Used when RUST_LOG is not set.
    pub default_filter: String,
    pub ansi: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            default_filter: DEFAULT_FILTER.to_string(),
            ansi: true,
        }
    }
}

impl TraceOptions {
    pub fn quiet() -> Self {
        Self {
            default_filter: QUIET_FILTER.to_string(),
            ..Self::default()
        }
    }
}

/// RUST_LOG wins over the default filter; an unparsable default falls back
/// to info-level logging for this crate.
pub fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init(options: TraceOptions) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(&options.default_filter))
        .with(tracing_subscriber::fmt::layer().with_ansi(options.ansi).with_target(false))
        .try_init()
        .is_ok()
}
