use tracing_subscriber::EnvFilter;

// reqwest and its transport stack log every connection at debug.
const NOISY_CRATES: &str = ",hyper_util=warn,reqwest=warn,rustls=warn";

/// Install the global subscriber. `RUST_LOG` overrides `default_level`. Events go to
/// stderr so the followed service log owns stdout.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level}{NOISY_CRATES}")));
    // A second call (tests, embedded use) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
