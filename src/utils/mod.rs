//! Shared helpers: tracing setup, shutdown signals and retry backoffs.

pub mod bootstrap;
pub mod retry;
