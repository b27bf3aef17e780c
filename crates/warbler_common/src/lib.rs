//! Shared types, errors, configuration and timing primitives for Warbler.

pub mod clock;
pub mod config;
pub mod error;
pub mod signal;
pub mod types;
