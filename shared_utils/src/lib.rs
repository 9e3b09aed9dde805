//! Shared utilities for Veil components.
//!
//! This crate provides functionality used by both the server control plane
//! and the client runtime: configuration, logging, key handling, atomic state
//! files and system command execution.

pub mod command;
pub mod config;
pub mod keys;
pub mod logging;
pub mod persist;

// Re-export commonly used items for convenience
pub use config::{Config, Role};
pub use keys::{KeyPair, KeyProvider, X25519KeyProvider};
