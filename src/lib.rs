//! Ear-worn biosensor subsystem: discovery, pairing, telemetry decoding,
//! aggregation into records and status publishing.

pub mod domain;
pub mod infrastructure;
pub mod presentation;

/// Tracing target for events that belong on the remote diagnostics channel.
pub const DIAGNOSTICS_TARGET: &str = "inear_link::diagnostics";
