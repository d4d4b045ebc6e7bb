use tracing_subscriber::EnvFilter;

/// Installs the JSON log subscriber once per process. Later calls are no-ops.
pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .json()
    .try_init();
}
