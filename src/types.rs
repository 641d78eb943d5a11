// =============================================================================
// Shared types used across the signal deck
// =============================================================================

use serde::{Deserialize, Serialize};

/// Recommended trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Parse the feed's direction token. Accepts the CALL/PUT aliases the
    /// dashboard shows next to UP/DOWN.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "UP" | "CALL" | "BUY" => Some(Self::Up),
            "DOWN" | "PUT" | "SELL" => Some(Self::Down),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
        }
    }
}

/// Phase of a displayed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    WaitingForEntry,
    Active,
    AwaitingFeedback,
    Retired,
    /// Entry time could not be resolved; shown with placeholder text.
    Degraded,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Retired)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WaitingForEntry => write!(f, "WaitingForEntry"),
            Self::Active => write!(f, "Active"),
            Self::AwaitingFeedback => write!(f, "AwaitingFeedback"),
            Self::Retired => write!(f, "Retired"),
            Self::Degraded => write!(f, "Degraded"),
        }
    }
}

/// User judgment on a completed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Correct,
    Incorrect,
    Skipped,
    /// No user action before the feedback window lapsed.
    Unset,
}

impl Default for Verdict {
    fn default() -> Self {
        Self::Unset
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Correct => write!(f, "Correct"),
            Self::Incorrect => write!(f, "Incorrect"),
            Self::Skipped => write!(f, "Skipped"),
            Self::Unset => write!(f, "Unset"),
        }
    }
}

/// Why a lifecycle left the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetireReason {
    /// The user submitted a verdict.
    Feedback,
    /// The feedback window lapsed.
    Timeout,
    /// The record vanished from the latest selection.
    Deselected,
    Shutdown,
}

impl std::fmt::Display for RetireReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Feedback => write!(f, "Feedback"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Deselected => write!(f, "Deselected"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}
