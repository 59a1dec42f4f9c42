//! Configuration
//!
//! Filesystem roots and the shared error taxonomy.

pub mod config;
pub mod types;
