use tracing_subscriber::{EnvFilter, prelude::*, util::TryInitError};

/// Install the global fmt subscriber with the engine crates at `level` and everything else
/// at `warn`. A set `RUST_LOG` replaces the whole filter.
pub fn init_tracing(level: &str) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_string(level)))
        .unwrap_or_else(|_| EnvFilter::new(filter_string("info")));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .try_init()
}

fn filter_string(level: &str) -> String {
    format!(
        "warn,executors={level},services={level},local_deployment={level},utils={level}"
    )
}
