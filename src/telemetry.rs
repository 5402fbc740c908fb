use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Initialize tracing.
///
/// `default_level` comes from `--log-level`; `RUST_LOG` wins when set so
/// operators can raise verbosity per module without new flags.
pub fn init(default_level: &str) {
    let logger = tracing_subscriber::fmt::layer().compact();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default().with(env_filter).with(logger).init();
}
