// Logging module for structured logging using the tracing crate

use std::error::Error;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber for structured logging.
///
/// The subscriber is configured with:
/// - JSON formatting for easy parsing by log aggregation systems
/// - `RUST_LOG`-style env filtering, defaulting to `info`
/// - Output to stdout
///
/// Call once at application startup; a second call returns an error from
/// the global subscriber registry.
///
/// # Examples
///
/// ```no_run
/// use aquamark::logging::init_subscriber;
///
/// init_subscriber().expect("Failed to initialize logging");
/// tracing::info!("Engine starting");
/// ```
pub fn init_subscriber() -> Result<(), Box<dyn Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_subscriber_is_callable() {
        // First call may succeed or fail depending on test ordering; the
        // second must fail because the global subscriber is already set.
        let first = init_subscriber();
        let second = init_subscriber();
        assert!(first.is_ok() || second.is_err());
    }
}
