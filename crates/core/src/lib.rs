//! Core domain types for the sdrelay generation worker.
//!
//! Holds the typed job model validated at intake, the terminal
//! [`JobOutcome`](outcome::JobOutcome) every job resolves to, and small
//! helpers shared by the worker crates. Has no I/O and no internal
//! dependencies.

pub mod error;
pub mod job;
pub mod outcome;
pub mod sanitize;
pub mod stage;
pub mod types;
