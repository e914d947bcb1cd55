// src/logging.rs - tracing subscriber setup for the binary
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Log level for a `-v` count: 0 = info, 1 = debug, 2+ = trace.
pub fn level_for(verbosity: u8) -> tracing::Level {
    match verbosity {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins over the `-v` count when set.
///
/// Safe to call twice; the second call is ignored.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level_for(verbosity)).into()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();
}
