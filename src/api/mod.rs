// =============================================================================
// HTTP API Module
// =============================================================================
//
// JSON endpoints consumed by the dashboard, plus the bearer-token extractor
// guarding remote generation.

pub mod auth;
pub mod rest;
