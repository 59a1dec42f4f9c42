//! Utilities
//!
//! Single-shot I/O helpers shared by the kernel clients.

pub mod io;
