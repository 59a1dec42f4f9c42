//! Compiled policy storage
//!
//! Feature set fingerprints, the on-disk policy cache, and the rules for
//! which files in a policy directory are loaded.

pub mod blacklist;
pub mod cache;
pub mod features;

pub use cache::PolicyCache;
pub use features::FeatureSet;
