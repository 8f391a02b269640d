use tracing_subscriber::{filter::Directive, fmt::format::FmtSpan, EnvFilter};

use crate::env::{EnvConfig, LogConfig};

const DEFAULT_DIRECTIVES: &str = "metawin_analysis=info,serve=info,dashboard_cli=info";
const PERF_DIRECTIVE: &str = "metawin_analysis::performance=debug";

/// Filtering follows `RUST_LOG`, defaulting to info for this crate. `LOG_PERF` adds the timing
/// events on top of either.
fn env_filter(config: &LogConfig) -> EnvFilter {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    match PERF_DIRECTIVE.parse::<Directive>() {
        Ok(directive) if config.log_perf => env_filter.add_directive(directive),
        _ => env_filter,
    }
}

/// Installs the global subscriber.
pub fn init(config: &LogConfig) {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter(config));

    let builder = if config.log_perf {
        builder.with_span_events(FmtSpan::CLOSE)
    } else {
        builder
    };

    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    };
}

/// Sets up logging from the environment, then reads the rest of the configuration so its
/// lookups are logged.
pub fn init_from_env() -> anyhow::Result<EnvConfig> {
    init(&LogConfig::from_env());
    EnvConfig::from_env()
}
