//! Shared library surface for the emulator binary and its tests.

pub mod config;
pub mod guard;
pub mod loops;
pub mod orchestrator;
pub mod pool;
pub mod publisher;
pub mod rate_limit;
pub mod registration;
pub mod session;
pub mod stats;
pub mod summary;

#[cfg(test)]
mod testing;
