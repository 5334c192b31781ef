use tracing_subscriber::prelude::*;

/// Filter applied when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "wsrun=info,wsrun_core=info";

/// Install the global subscriber. Logs go to stderr so stdout only carries
/// script output.
pub(crate) fn initialize_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let init_result = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();

    if let Err(err) = init_result {
        tracing::warn!(error = %err, "tracing already initialized; skipping setup");
    }
}
