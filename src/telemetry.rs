use tracing_subscriber::EnvFilter;

use crate::settings::{LogFormat, LogSettings};

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(log: &LogSettings) {
  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter(&log.level))
    .with_target(true);

  // Already installed when called twice (tests); keep the first one.
  let _ = match log.format {
    LogFormat::Json => builder.json().try_init(),
    LogFormat::Pretty => builder.pretty().try_init(),
    LogFormat::Compact => builder.compact().try_init(),
  };
}

fn filter(level: &str) -> EnvFilter {
  EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(level))
    .unwrap_or_else(|_| EnvFilter::new("info"))
}
