// Tracing subscriber initialization for the CLI

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise the configured level directive is
/// used, falling back to `info` if it does not parse.
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
