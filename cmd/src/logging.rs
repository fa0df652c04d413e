//! Tracing initialization for the demo binary.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber with `level` as the default for all
/// wireline crates. `RUST_LOG` still wins when set.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,wireline={level},wireline_session={level},wireline_http={level},wireline_executor={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}
