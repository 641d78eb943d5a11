// =============================================================================
// Clock — wall-clock source and the fixed display zone
// =============================================================================
//
// Every phase comparison goes through a `Clock` so tests can pin time. The
// display zone is a constant offset (UTC+2 by default); DST is deliberately
// not applied, matching what the feed producer writes.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use parking_lot::RwLock;

/// Default display offset in seconds (UTC+2, "Kyiv").
pub const DEFAULT_DISPLAY_OFFSET_SECS: i32 = 2 * 3600;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn name(&self) -> &str {
        "Clock"
    }
}

/// Real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn name(&self) -> &str {
        "SystemClock"
    }
}

/// Hand-driven clock for deterministic tests and replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(RwLock::new(start)),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.current.write() = t;
    }

    pub fn advance(&self, by: Duration) {
        let mut cur = self.current.write();
        *cur += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read()
    }

    fn name(&self) -> &str {
        "ManualClock"
    }
}

/// Fixed-offset zone used for everything a user reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayZone {
    offset: FixedOffset,
}

impl DisplayZone {
    /// Build a zone from an offset in seconds east of UTC. Out-of-range
    /// offsets fall back to the default.
    pub fn from_offset_secs(secs: i32) -> Self {
        let offset = FixedOffset::east_opt(secs).unwrap_or_else(Self::default_offset);
        Self { offset }
    }

    fn default_offset() -> FixedOffset {
        FixedOffset::east_opt(DEFAULT_DISPLAY_OFFSET_SECS).expect("UTC+2 is a valid offset")
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Convert an instant to civil time in the display zone.
    pub fn to_display(&self, t: DateTime<Utc>) -> DateTime<FixedOffset> {
        t.with_timezone(&self.offset)
    }

    /// `HH:MM` in the display zone.
    pub fn hhmm(&self, t: DateTime<Utc>) -> String {
        self.to_display(t).format("%H:%M").to_string()
    }
}

impl Default for DisplayZone {
    fn default() -> Self {
        Self::from_offset_secs(DEFAULT_DISPLAY_OFFSET_SECS)
    }
}
