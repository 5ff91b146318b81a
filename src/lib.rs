//! Turnstile - Distributed Admission Control
//!
//! This crate decides, per caller and per policy, whether a unit of work may
//! proceed. Limiter instances share no memory; the only coordination point
//! is a remote counter store, so admission stays correct across independent
//! processes. Three strategies (fixed window, sliding window, token bucket)
//! evaluate usage snapshots, and a quarantine extension blocks repeat
//! offenders for a fixed duration. An axum middleware adapter translates
//! outcomes into the usual 429-with-headers transport contract.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod limit;
