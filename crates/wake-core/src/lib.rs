//! wakewatch core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the wakewatch core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod session {
    //! Detection session identifiers.

    use uuid::Uuid;

    /// Opaque id tagging one detector run in logs (UUID v4, hyphenated).
    pub fn new_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn ids_are_hyphenated_and_distinct() {
            let a = new_session_id();
            assert_eq!(a.len(), 36);
            assert_eq!(a.matches('-').count(), 4);
            assert_ne!(a, new_session_id());
        }
    }
}

pub mod config {
    //! Detector configuration: checkpoint period and drift margin.

    use std::time::Duration;
    use thiserror::Error;

    /// Environment variable holding the checkpoint period in milliseconds.
    pub const PERIOD_ENV: &str = "WAKEWATCH_PERIOD_MS";
    /// Environment variable holding the drift margin in milliseconds.
    pub const MARGIN_ENV: &str = "WAKEWATCH_MARGIN_MS";

    /// Errors raised while loading or validating a configuration.
    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum ConfigError {
        /// An environment variable did not hold a whole number of milliseconds.
        #[error("{var}: expected whole milliseconds, got {value:?}")]
        InvalidMillis {
            /// Variable name.
            var: &'static str,
            /// Raw value as read.
            value: String,
        },
        /// The checkpoint period was zero.
        #[error("period must be positive")]
        ZeroPeriod,
    }

    /// Timing parameters of a detector.
    ///
    /// `period` is the cadence of each leg's checkpoints; the effective
    /// response time is half of it since the two legs run half a period out
    /// of phase. `margin` is how far past a checkpoint a leg must wake before
    /// the drift counts as a sleep/wake event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DetectorConfig {
        /// Checkpoint cadence of each leg.
        pub period: Duration,
        /// Largest drift past a checkpoint that is still ignored.
        pub margin: Duration,
    }

    impl Default for DetectorConfig {
        fn default() -> Self {
            Self { period: Duration::from_secs(1), margin: Duration::from_millis(500) }
        }
    }

    impl DetectorConfig {
        /// Build a config without validation. `period` must be positive.
        pub const fn new(period: Duration, margin: Duration) -> Self {
            Self { period, margin }
        }

        /// Replace the period with `ms` milliseconds.
        #[must_use]
        pub const fn with_period_ms(mut self, ms: u64) -> Self {
            self.period = Duration::from_millis(ms);
            self
        }

        /// Replace the margin with `ms` milliseconds.
        #[must_use]
        pub const fn with_margin_ms(mut self, ms: u64) -> Self {
            self.margin = Duration::from_millis(ms);
            self
        }

        /// Reject configurations the detector cannot run with.
        pub fn validate(&self) -> Result<(), ConfigError> {
            if self.period.is_zero() {
                return Err(ConfigError::ZeroPeriod);
            }
            Ok(())
        }

        /// Load from `WAKEWATCH_PERIOD_MS` / `WAKEWATCH_MARGIN_MS`, falling back
        /// to defaults for unset variables.
        pub fn from_env() -> Result<Self, ConfigError> {
            Self::from_lookup(|key| std::env::var(key).ok())
        }

        /// Same as [`DetectorConfig::from_env`] with a caller-supplied lookup.
        pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
        where
            F: Fn(&str) -> Option<String>,
        {
            let defaults = Self::default();
            let period = read_millis(&lookup, PERIOD_ENV)?.unwrap_or(defaults.period);
            let margin = read_millis(&lookup, MARGIN_ENV)?.unwrap_or(defaults.margin);
            let cfg = Self::new(period, margin);
            cfg.validate()?;
            Ok(cfg)
        }
    }

    fn read_millis<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(raw) = lookup(var) else {
            return Ok(None);
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        match trimmed.parse::<u64>() {
            Ok(ms) => Ok(Some(Duration::from_millis(ms))),
            Err(_) => Err(ConfigError::InvalidMillis { var, value: raw }),
        }
    }

}

pub mod record {
    //! Serializable record of one detected wake event.

    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

    fn millis(d: Duration) -> u64 {
        u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
    }

    /// One detected sleep/wake event as reported to users.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct WakeRecord {
        /// Monotonic sequence number within the process.
        pub seq: u64,
        /// Wall-clock time the event was observed (millis since epoch).
        pub detected_at_ms: u64,
        /// Estimated sleep length in milliseconds.
        pub slept_ms: u64,
    }

    impl WakeRecord {
        /// Stamp a freshly detected sleep duration.
        pub fn new(slept: Duration) -> Self {
            let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            Self {
                seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
                detected_at_ms: millis(since_epoch),
                slept_ms: millis(slept),
            }
        }

        /// The estimated sleep length.
        pub const fn slept(&self) -> Duration {
            Duration::from_millis(self.slept_ms)
        }

        /// Serialize as a single JSON line (no trailing newline).
        pub fn to_json_line(&self) -> serde_json::Result<String> {
            serde_json::to_string(self)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn truncates_to_millis() {
            let r = WakeRecord::new(Duration::from_micros(3_600_000_999));
            assert_eq!(r.slept_ms, 3_600_000);
            assert_eq!(r.slept(), Duration::from_secs(3_600));
        }

        #[test]
        fn sequence_grows() {
            let a = WakeRecord::new(Duration::ZERO);
            let b = WakeRecord::new(Duration::ZERO);
            assert!(b.seq > a.seq);
        }

        #[test]
        fn json_line_fields() {
            let r = WakeRecord { seq: 7, detected_at_ms: 1, slept_ms: 250 };
            let line = r.to_json_line().unwrap();
            assert_eq!(line, r#"{"seq":7,"detected_at_ms":1,"slept_ms":250}"#);
            let back: WakeRecord = serde_json::from_str(&line).unwrap();
            assert_eq!(back, r);
        }
    }
}
