//! Shared dispatch workloads used by benches, the CLI and reporting.
//!
//! Keeping the workloads in one place means Criterion benches and `dynsite run`
//! always measure the same call patterns.

pub mod scenarios;
