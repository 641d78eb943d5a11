// =============================================================================
// Signal Lifecycle — per-signal phase machine
// =============================================================================
//
// Life-cycle:
//   WaitingForEntry  ->  Active  ->  AwaitingFeedback  ->  Retired
//   Degraded (entry time unusable; never retired by timing)
//
// Boundaries, all half-open:
//   now <  entry                         -> WaitingForEntry
//   entry  <= now < expiry               -> Active
//   expiry <= now < expiry + window      -> AwaitingFeedback
//   now >= expiry + window, or verdict   -> Retired
//
// The phase is re-derived from the timestamps on every tick rather than
// stepped from the previous phase. A lifecycle first observed long after its
// expiry therefore lands directly in AwaitingFeedback or Retired; the tick
// reports that jump as a single transition. Retired is sticky.
//
// `tick` is idempotent: the same `now` yields the same view, and the
// feedback prompt fires at most once per lifecycle.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::DisplayZone;
use crate::feed::{SignalKey, SignalRecord};
use crate::feedback::FeedbackError;
use crate::types::{Phase, Verdict};

/// Instants the phase machine compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    entry: DateTime<Utc>,
    expiry: DateTime<Utc>,
    retire: DateTime<Utc>,
}

/// What a dashboard shows for one signal at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickView {
    pub phase: Phase,
    /// Whole seconds left in the current phase, never negative.
    pub time_remaining_secs: u64,
    pub display_text: String,
}

/// A phase change observed by `tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// `None` on the first tick.
    pub from: Option<Phase>,
    pub to: Phase,
}

/// Result of one `tick`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub view: TickView,
    pub transition: Option<Transition>,
    /// True exactly once: on the first tick that observes AwaitingFeedback.
    pub prompt_feedback: bool,
}

/// Mutable state for one displayed signal.
#[derive(Debug, Clone)]
pub struct SignalLifecycle {
    record: SignalRecord,
    zone: DisplayZone,
    bounds: Option<Bounds>,
    last_phase: Option<Phase>,
    verdict: Option<Verdict>,
    prompted: bool,
}

impl SignalLifecycle {
    pub fn new(record: SignalRecord, feedback_window: Duration, zone: DisplayZone) -> Self {
        let bounds = compute_bounds(&record, feedback_window);
        if bounds.is_none() && record.entry_at.is_some() {
            warn!(
                key = %record.key,
                duration_minutes = record.duration_minutes,
                "signal timing overflowed — displayed as degraded"
            );
        }
        Self {
            record,
            zone,
            bounds,
            last_phase: None,
            verdict: None,
            prompted: false,
        }
    }

    pub fn key(&self) -> &SignalKey {
        &self.record.key
    }

    pub fn record(&self) -> &SignalRecord {
        &self.record
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    pub fn expiry_at(&self) -> Option<DateTime<Utc>> {
        self.bounds.map(|b| b.expiry)
    }

    /// Whether the trade has concluded at `now` (feedback is owed).
    pub fn has_concluded(&self, now: DateTime<Utc>) -> bool {
        matches!(self.bounds, Some(b) if now >= b.expiry)
    }

    /// Phase at `now`, derived from timestamps alone.
    pub fn phase_at(&self, now: DateTime<Utc>) -> Phase {
        if self.verdict.is_some() || self.last_phase == Some(Phase::Retired) {
            return Phase::Retired;
        }
        let Some(b) = self.bounds else {
            return Phase::Degraded;
        };
        if now < b.entry {
            Phase::WaitingForEntry
        } else if now < b.expiry {
            Phase::Active
        } else if now < b.retire {
            Phase::AwaitingFeedback
        } else {
            Phase::Retired
        }
    }

    /// Read-only view at `now`.
    pub fn view(&self, now: DateTime<Utc>) -> TickView {
        self.view_for(self.phase_at(now), now)
    }

    /// Advance to `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let phase = self.phase_at(now);

        let transition = if self.last_phase != Some(phase) {
            debug!(key = %self.record.key, from = ?self.last_phase, to = %phase, "signal phase changed");
            Some(Transition {
                from: self.last_phase,
                to: phase,
            })
        } else {
            None
        };

        let prompt_feedback = phase == Phase::AwaitingFeedback && !self.prompted;
        if prompt_feedback {
            self.prompted = true;
        }

        self.last_phase = Some(phase);

        TickOutcome {
            view: self.view_for(phase, now),
            transition,
            prompt_feedback,
        }
    }

    /// Accept a user verdict. Only possible while AwaitingFeedback; the first
    /// verdict is final.
    pub fn submit_feedback(&mut self, verdict: Verdict, now: DateTime<Utc>) -> Result<(), FeedbackError> {
        if verdict == Verdict::Unset {
            return Err(FeedbackError::UnsetVerdict);
        }
        if self.verdict.is_some() {
            return Err(FeedbackError::AlreadyRecorded(self.record.key.to_string()));
        }
        let phase = self.phase_at(now);
        if phase != Phase::AwaitingFeedback {
            return Err(FeedbackError::NotOpen {
                key: self.record.key.to_string(),
                phase,
            });
        }
        self.verdict = Some(verdict);
        self.last_phase = Some(Phase::Retired);
        Ok(())
    }

    fn view_for(&self, phase: Phase, now: DateTime<Utc>) -> TickView {
        let (remaining, text) = match (phase, self.bounds) {
            (Phase::WaitingForEntry, Some(b)) => {
                let left = whole_secs(b.entry - now);
                (left, format!("Entry at {} in {}", self.zone.hhmm(b.entry), mmss(left)))
            }
            (Phase::Active, Some(b)) => {
                let left = whole_secs(b.expiry - now);
                (left, format!("Active, {} left", mmss(left)))
            }
            (Phase::AwaitingFeedback, Some(b)) => {
                let left = whole_secs(b.retire - now);
                (left, format!("Awaiting feedback ({left} s)"))
            }
            (Phase::Degraded, _) => {
                let text = match &self.record.entry_raw {
                    Some(raw) => format!("Entry time unavailable ({raw})"),
                    None => "Entry time unavailable".to_string(),
                };
                (0, text)
            }
            _ => (0, "Completed".to_string()),
        };

        TickView {
            phase,
            time_remaining_secs: remaining,
            display_text: text,
        }
    }
}

fn compute_bounds(record: &SignalRecord, feedback_window: Duration) -> Option<Bounds> {
    let entry = record.entry_at?;
    let expiry = record.expiry_at()?;
    let retire = expiry.checked_add_signed(feedback_window.max(Duration::zero()))?;
    Some(Bounds { entry, expiry, retire })
}

/// Floor to whole seconds, clamped at zero.
fn whole_secs(d: Duration) -> u64 {
    d.num_seconds().max(0) as u64
}

fn mmss(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
