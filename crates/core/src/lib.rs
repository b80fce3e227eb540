//! Shared runtime plumbing for Tidemesh binaries and tests.
//!
//! The mesh crate only emits `tracing` events; this crate owns how those
//! events are collected and rendered.

pub mod logging;

pub use logging::LogFormat;
