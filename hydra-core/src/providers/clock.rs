//! Clock provider for time abstraction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Provider trait for wall-clock time.
pub trait ClockProvider: Send + Sync {
    /// Get the current system time as milliseconds since UNIX epoch.
    fn system_time_millis(&self) -> u64;

    /// Check if this is a mock clock.
    fn is_mock(&self) -> bool;
}

/// Real clock that uses system time.
#[derive(Debug, Clone, Default)]
pub struct RealClock;

impl RealClock {
    /// Create a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl ClockProvider for RealClock {
    fn system_time_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn is_mock(&self) -> bool {
        false
    }
}

/// Mock clock for testing with controllable time.
///
/// The clock only moves when told to via [`MockClock::advance`].
#[derive(Debug, Default)]
pub struct MockClock {
    system_time_millis: AtomicU64,
}

impl MockClock {
    /// Create a mock clock starting at the epoch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock clock at the given milliseconds since epoch.
    pub fn at_millis(millis: u64) -> Self {
        Self {
            system_time_millis: AtomicU64::new(millis),
        }
    }

    /// Create a mock clock fixed at the specified RFC 3339 time.
    ///
    /// # Example
    ///
    /// ```
    /// use hydra_core::providers::{ClockProvider, MockClock};
    ///
    /// let clock = MockClock::fixed("2024-01-15T10:30:00Z").unwrap();
    /// assert_eq!(clock.system_time_millis(), 1_705_314_600_000);
    /// ```
    pub fn fixed(iso_time: &str) -> Result<Self, chrono::ParseError> {
        let dt = chrono::DateTime::parse_from_rfc3339(iso_time)?;
        Ok(Self::at_millis(dt.timestamp_millis().max(0) as u64))
    }

    /// Advance time by the specified duration.
    pub fn advance(&self, duration: Duration) {
        self.system_time_millis
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl ClockProvider for MockClock {
    fn system_time_millis(&self) -> u64 {
        self.system_time_millis.load(Ordering::SeqCst)
    }

    fn is_mock(&self) -> bool {
        true
    }
}
