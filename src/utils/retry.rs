//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Delay used once a backoff sequence is exhausted.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Backoff between consumer reconnection attempts.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Max attempts: 20, after which callers wait `MAX_RECONNECT_DELAY`
/// - Jitter enabled
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(MAX_RECONNECT_DELAY)
        .with_max_times(20)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_reconnect_backoff_grows() {
        let delays: Vec<Duration> = reconnect_backoff().build().take(5).collect();

        assert_eq!(delays.len(), 5);
        assert!(delays[0] >= Duration::from_millis(100));
        assert!(delays[4] >= Duration::from_millis(1_600));
    }

    #[test]
    fn test_reconnect_backoff_is_bounded_in_attempts() {
        assert_eq!(reconnect_backoff().build().count(), 20);
    }
}
