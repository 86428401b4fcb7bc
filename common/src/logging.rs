use tracing_subscriber::EnvFilter;

/// Install the JSON line-per-event subscriber. Level defaults to `info`
/// unless `RUST_LOG` narrows it.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_target(false)
        .with_env_filter(filter)
        .init();
}
