use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. Safe to call more than once.
pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("douplus_sync=info"));

  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .try_init();
}
