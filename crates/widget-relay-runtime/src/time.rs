//! Tokio-backed time source
//!
//! Timestamps are milliseconds since the source was created, measured on
//! the tokio clock so paused-time tests advance it deterministically.

use std::time::Duration;

use tokio::time::Instant;
use widget_relay_core::{TimeSource, Timestamp};

#[derive(Debug, Clone, Copy)]
pub struct TokioTimeSource {
    origin: Instant,
}

impl TokioTimeSource {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Tokio instant corresponding to a session timestamp
    pub fn instant_at(&self, at: Timestamp) -> Instant {
        self.origin + Duration::from_millis(at.as_millis())
    }
}

impl Default for TokioTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TokioTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.origin.elapsed().as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_follows_tokio_clock() {
        let time = TokioTimeSource::new();
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(time.now(), Timestamp::new(250));
        assert_eq!(
            time.instant_at(Timestamp::new(1_000)) - time.instant_at(Timestamp::new(0)),
            Duration::from_secs(1)
        );
    }
}
