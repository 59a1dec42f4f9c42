//! Safety and cleanup
//!
//! Secret scrubbing and cache directory clearing.

pub mod cleanup;
pub mod secret;
