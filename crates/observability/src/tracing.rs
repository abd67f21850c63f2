//! Tracing initialization.
//!
//! Logs are JSON lines with timestamps. `RUST_LOG` overrides the default
//! directive, e.g. `RUST_LOG=jobwire_streams=debug,info`.

use tracing_subscriber::EnvFilter;

/// Initialize tracing, falling back to `default_directive` when `RUST_LOG`
/// is unset or unparsable.
///
/// Safe to call multiple times (subsequent calls are no-ops). Returns
/// whether this call installed the subscriber.
pub fn init_with_default(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialization_is_a_no_op() {
        init_with_default("debug");
        assert!(!init_with_default("debug"));
    }
}
