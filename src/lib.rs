//! aabridge: userspace bridge to the AppArmor kernel interfaces
//! Confinement transitions, label and access queries, and the compiled policy cache
//!
//! # Architecture
//!
//! This crate is organized by the kernel surface each part talks to:
//!
//! ## Kernel Interfaces ([`kernel`])
//! - [`kernel::probe`]: Module availability and `/proc/<tid>/attr` layout selection
//! - [`kernel::procattr`]: change_hat, change_profile, stacking, task confinement reads
//! - [`kernel::confinement`]: `label (mode)` parsing
//! - [`kernel::peer`]: Peer confinement over `SO_PEERSEC`
//! - [`kernel::query`]: Access queries through `.access`
//! - [`kernel::interface`]: Policy load, replace and remove
//!
//! ## Policy Storage ([`policy`])
//! - [`policy::features`]: Kernel feature set fingerprints
//! - [`policy::cache`]: Feature keyed cache directories of compiled policy
//! - [`policy::blacklist`]: Files never loaded from a policy directory
//!
//! ## Safety ([`safety`])
//! - [`safety::secret`]: Zeroed command buffers for magic tokens
//! - [`safety::cleanup`]: Symlink safe directory clearing
//!
//! ## Observability ([`observability`])
//! - [`observability::logging`]: env_logger setup, `LIBAPPARMOR_DEBUG`
//!
//! ## Configuration ([`config`])
//! - [`config::config`]: Filesystem roots, JSON loading
//! - [`config::types`]: Error taxonomy and shared types
//!
//! ## Utilities ([`utils`])
//! - [`utils::io`]: Single shot read/write helpers, errno access
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::fake_kernel`]: Scratch proc/sys/securityfs trees
//! - [`testing::race_proof`]: Concurrent first-caller harness
//!
//! # Design Principles
//!
//! 1. **One round trip** - Every operation is a single write or a bounded read loop
//! 2. **Errors keep their errno** - Nothing rewrites the OS error on the way out
//! 3. **Latch on success only** - Probes are cached once definitive, retried otherwise
//! 4. **Secrets die in place** - Token buffers are zeroed on every exit path

// Kernel Interfaces
pub mod kernel;

// Policy Storage
pub mod policy;

// Safety
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// Testing Infrastructure
pub mod testing;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use kernel::confinement::ConfinementContext;
pub use kernel::probe::{ModuleStatus, ProcAttrTemplate, Prober};
pub use policy::{FeatureSet, PolicyCache};
