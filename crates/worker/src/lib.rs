//! Queue worker: configuration, worker identities, and the bounded
//! dispatcher that runs one job per delivery and acknowledges it after.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod registry;
