use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `LOCKBOX_LOG` takes a tracing filter
/// expression; the default is info-level everywhere.
pub fn init() {
    let filter = EnvFilter::try_from_env("LOCKBOX_LOG")
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
