// =============================================================================
// Selection Policy — which feed records make it onto the board
// =============================================================================
//
// Pure function of (records, now, policy). Rules, applied in order:
//   1. Confidence:  drop records below `confidence_threshold`.
//   2. Age:         drop records whose `generated_at` is missing or older than
//                   `max_age` (when a limit is set).
//   3. Order:       newest `generated_at` first; ties keep feed order.
//   4. Cap:         keep at most `max_displayed`.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::feed::SignalRecord;

/// Filtering / ordering / capping parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionPolicy {
    pub confidence_threshold: f64,
    pub max_displayed: usize,
    /// `None` means records never age out.
    pub max_age: Option<Duration>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.70,
            max_displayed: 6,
            max_age: Some(Duration::minutes(10)),
        }
    }
}

impl SelectionPolicy {
    /// Select the ordered subset of `records` worth displaying at `now`.
    pub fn select(&self, records: &[SignalRecord], now: DateTime<Utc>) -> Vec<SignalRecord> {
        let mut kept: Vec<(DateTime<Utc>, &SignalRecord)> = records
            .iter()
            .filter(|r| {
                let pass = r.confidence >= self.confidence_threshold;
                if !pass {
                    debug!(key = %r.key, confidence = r.confidence, "below confidence threshold");
                }
                pass
            })
            .filter_map(|r| {
                let Some(generated) = r.generated_at else {
                    debug!(key = %r.key, "no generated_at, treated as expired");
                    return None;
                };
                if self.is_too_old(generated, now) {
                    debug!(key = %r.key, generated_at = %generated, "older than max age");
                    return None;
                }
                Some((generated, r))
            })
            .collect();

        // `sort_by` is stable, so equal timestamps keep feed order.
        kept.sort_by(|a, b| b.0.cmp(&a.0));
        kept.truncate(self.max_displayed);

        kept.into_iter().map(|(_, r)| r.clone()).collect()
    }

    fn is_too_old(&self, generated: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.max_age {
            Some(limit) => now - generated > limit,
            None => false,
        }
    }
}
