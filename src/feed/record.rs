// =============================================================================
// Feed Records — wire format and normalisation into `SignalRecord`
// =============================================================================
//
// The feed is a JSON document written by an external producer. Its records
// are loosely typed: timestamps come with or without an offset, the entry
// time is either an absolute instant or a bare "HH:MM" in the display zone,
// and `reason` may be a plain string or a per-language map.
//
// Ingestion rules:
//   - Each record is decoded on its own; one malformed record is dropped and
//     reported, the rest of the batch survives.
//   - Entry times are resolved to an absolute instant here, once. The
//     lifecycle never sees the string form.
//   - An entry time that cannot be resolved does not reject the record; it
//     yields a record with `entry_at == None`, shown as degraded.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::clock::DisplayZone;
use crate::types::Direction;

// =============================================================================
// Wire format
// =============================================================================

/// Top-level feed document. Records stay as raw JSON so that a single bad
/// record cannot fail the whole decode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedDocument {
    #[serde(default)]
    pub last_update: Option<String>,
    #[serde(default)]
    pub last_update_utc: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub total_signals: Option<u64>,
    #[serde(default)]
    pub active_signals: Option<u64>,
    #[serde(default)]
    pub signals: Vec<serde_json::Value>,
}

impl FeedDocument {
    /// Instant of the producer's last write, preferring the UTC field.
    pub fn last_update_at(&self, zone: DisplayZone) -> Option<DateTime<Utc>> {
        self.last_update_utc
            .as_deref()
            .and_then(|s| parse_instant(s, zone))
            .or_else(|| self.last_update.as_deref().and_then(|s| parse_instant(s, zone)))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawSignal {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    asset: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    generated_at: Option<String>,
    #[serde(default)]
    generated_at_utc: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    entry_time: Option<String>,
    #[serde(default)]
    entry_timestamp: Option<String>,
    #[serde(default)]
    entry_time_utc: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    reason: Option<Reason>,
}

/// Free-text rationale, either a single string or one per language code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reason {
    Text(String),
    Localized(BTreeMap<String, String>),
}

impl Reason {
    /// Text for `lang`, falling back to English and then to any variant.
    pub fn text_for(&self, lang: &str) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            Self::Localized(map) => map
                .get(lang)
                .or_else(|| map.get("en"))
                .or_else(|| map.values().next())
                .map(String::as_str),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Why a single feed record was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("record has an unexpected shape: {0}")]
    Shape(String),

    #[error("record is missing `{0}`")]
    MissingField(&'static str),

    #[error("unknown direction `{0}`")]
    InvalidDirection(String),

    #[error("confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("duration {0} is not a positive number of minutes")]
    InvalidDuration(f64),
}

// =============================================================================
// SignalKey
// =============================================================================

/// Stable identity of a signal across polls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalKey(String);

impl SignalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key derived from content when the feed supplies no `id`:
    /// first 16 hex chars of SHA-256 over `asset|generated_at`.
    pub fn synthesize(asset: &str, generated_at: Option<DateTime<Utc>>) -> Self {
        let stamp = generated_at.map(|t| t.to_rfc3339()).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(asset.as_bytes());
        hasher.update(b"|");
        hasher.update(stamp.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SignalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// SignalRecord
// =============================================================================

/// A normalised, immutable feed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub key: SignalKey,
    /// `id` as supplied by the feed, if any.
    pub external_id: Option<String>,
    pub asset: String,
    pub direction: Direction,
    pub confidence: f64,
    /// `None` means the record is treated as already expired by selection.
    pub generated_at: Option<DateTime<Utc>>,
    /// Resolved entry instant; `None` when the feed's value was unusable.
    pub entry_at: Option<DateTime<Utc>>,
    /// Entry time as written by the feed, kept for placeholder display.
    pub entry_raw: Option<String>,
    pub duration_minutes: f64,
    pub reason: Option<Reason>,
}

impl SignalRecord {
    /// Trade length, `None` if it does not fit a `chrono::Duration`.
    pub fn duration(&self) -> Option<Duration> {
        Duration::try_seconds((self.duration_minutes * 60.0).round() as i64)
    }

    /// `entry_at + duration`.
    pub fn expiry_at(&self) -> Option<DateTime<Utc>> {
        self.entry_at?.checked_add_signed(self.duration()?)
    }
}

/// Knobs that normalisation needs from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub zone: DisplayZone,
    pub default_duration_minutes: f64,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            zone: DisplayZone::default(),
            default_duration_minutes: 2.0,
        }
    }
}

/// Result of normalising a whole feed document.
#[derive(Debug, Default)]
pub struct Ingested {
    pub records: Vec<SignalRecord>,
    /// `(index in feed array, reason)` for every dropped record.
    pub rejected: Vec<(usize, RecordError)>,
}

/// Normalise every record of `doc`, isolating failures per record.
pub fn ingest(doc: &FeedDocument, opts: IngestOptions) -> Ingested {
    let mut out = Ingested::default();
    for (idx, value) in doc.signals.iter().enumerate() {
        match normalize(value, opts) {
            Ok(record) => out.records.push(record),
            Err(e) => {
                debug!(index = idx, error = %e, "feed record dropped");
                out.rejected.push((idx, e));
            }
        }
    }
    out
}

/// Normalise one raw JSON record.
pub fn normalize(value: &serde_json::Value, opts: IngestOptions) -> Result<SignalRecord, RecordError> {
    let raw: RawSignal =
        serde_json::from_value(value.clone()).map_err(|e| RecordError::Shape(e.to_string()))?;

    let asset = raw
        .asset
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .ok_or(RecordError::MissingField("asset"))?;

    let direction_raw = raw.direction.ok_or(RecordError::MissingField("direction"))?;
    let direction =
        Direction::parse(&direction_raw).ok_or(RecordError::InvalidDirection(direction_raw))?;

    let confidence = raw.confidence.ok_or(RecordError::MissingField("confidence"))?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(RecordError::ConfidenceOutOfRange(confidence));
    }

    let duration_minutes = raw.duration.unwrap_or(opts.default_duration_minutes);
    if !duration_minutes.is_finite() || duration_minutes <= 0.0 {
        return Err(RecordError::InvalidDuration(duration_minutes));
    }

    let generated_at = [&raw.generated_at_utc, &raw.generated_at, &raw.timestamp]
        .into_iter()
        .flatten()
        .find_map(|s| parse_instant(s, opts.zone));

    let absolute_entry = [&raw.entry_timestamp, &raw.entry_time_utc]
        .into_iter()
        .flatten()
        .find_map(|s| parse_instant(s, opts.zone));

    let entry_at = absolute_entry.or_else(|| {
        let hhmm = raw.entry_time.as_deref()?;
        let gen = generated_at?;
        resolve_time_of_day(hhmm, gen, opts.zone)
    });

    let entry_raw = raw
        .entry_time
        .or(raw.entry_timestamp)
        .or(raw.entry_time_utc);

    let external_id = raw.id.and_then(|v| match v {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    let key = match &external_id {
        Some(id) => SignalKey::new(id.clone()),
        None => SignalKey::synthesize(&asset, generated_at),
    };

    Ok(SignalRecord {
        key,
        external_id,
        asset,
        direction,
        confidence,
        generated_at,
        entry_at,
        entry_raw,
        duration_minutes,
        reason: raw.reason,
    })
}

// =============================================================================
// Time parsing helpers
// =============================================================================

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parse an ISO-8601 instant. Strings without an offset are read as civil
/// time in the display zone.
pub fn parse_instant(raw: &str, zone: DisplayZone) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS.iter().find_map(|fmt| {
        let naive = NaiveDateTime::parse_from_str(raw, fmt).ok()?;
        zone.offset()
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

/// Parse a strict `H:MM`/`HH:MM` time of day (00:00–23:59).
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let (h, m) = raw.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    if !h.bytes().all(|b| b.is_ascii_digit()) || !m.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Combine a display-zone time of day with the display-zone date of
/// `generated_at`. If that lands before the generation minute the entry is
/// taken to be on the following day.
///
/// The comparison is at minute precision: `HH:MM` carries no seconds, so a
/// signal generated at 10:02:30 for entry "10:02" stays on the same day
/// (entry already open) instead of rolling to tomorrow.
pub fn resolve_time_of_day(
    hhmm: &str,
    generated_at: DateTime<Utc>,
    zone: DisplayZone,
) -> Option<DateTime<Utc>> {
    let time = parse_time_of_day(hhmm)?;
    let gen_local = zone.to_display(generated_at);
    let gen_minute = gen_local.with_second(0)?.with_nanosecond(0)?;

    let candidate = zone
        .offset()
        .from_local_datetime(&gen_local.date_naive().and_time(time))
        .single()?;

    let entry = if candidate < gen_minute {
        candidate + Duration::days(1)
    } else {
        candidate
    };
    Some(entry.with_timezone(&Utc))
}
