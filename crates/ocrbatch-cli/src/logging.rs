use tracing_subscriber::EnvFilter;

/// Initialize the structured log stream.
///
/// `RUST_LOG` wins when set; otherwise the `--log-level` flag applies
/// to the ocrbatch crates while dependencies stay at `warn`. Record
/// keys and batch ids arrive as fields, so targets are noise and stay
/// off.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,ocrbatch_cli={log_level},ocrbatch_engine={log_level},ocrbatch_state={log_level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
