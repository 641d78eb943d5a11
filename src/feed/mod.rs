// =============================================================================
// Feed Module
// =============================================================================
//
// Everything between the producer's JSON file and the selection policy:
// - Wire format and per-record normalisation
// - HTTP fetch with cache busting
// - Last-known-good snapshot on disk

pub mod cache;
pub mod client;
pub mod record;

pub use cache::SnapshotCache;
pub use client::FeedClient;
pub use record::{ingest, FeedDocument, IngestOptions, SignalKey, SignalRecord};
