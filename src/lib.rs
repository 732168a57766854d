//! Confgate - a control plane for embedded proxy engine workers
//!
//! This library provides a single-process control-plane service that:
//! - Accepts raw configuration documents over an HTTP control API
//! - Derives a stable fingerprint from each document's trimmed bytes
//! - Runs at most one engine worker per fingerprint at any time
//! - Replaces a running worker atomically when its document is resubmitted
//! - Starts workers asynchronously and retracts entries whose start fails
//! - Reports live fingerprints and their listening port ranges for diagnostics

pub mod config;
pub mod control;
pub mod document;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod lifecycle;
pub mod registry;
pub mod worker;
