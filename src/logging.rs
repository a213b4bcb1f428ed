//! Logging setup powered by tracing-subscriber
//!
//! The library itself only emits `tracing` events; applications (and tests)
//! call `init_logging` once to get them printed.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered at `level` unless `RUST_LOG` is set.
///
/// Returns false when a global subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| build_env_filter(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .try_init()
        .is_ok()
}

fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("kvindex={}", level)).unwrap_or_else(|_| EnvFilter::new("kvindex=info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        let first = init_logging("debug");
        // A second install always reports the subscriber already exists
        assert!(!init_logging("debug"));
        let _ = first;
    }
}
