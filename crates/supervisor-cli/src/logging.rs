use tracing_subscriber::EnvFilter;

/// Initialises the process-wide `tracing` subscriber. `-v` raises the
/// default level; `RUST_LOG` always wins when set, matching the common
/// pack idiom of layering an explicit verbosity flag over env-filter
/// defaults.
pub fn init(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
