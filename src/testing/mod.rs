//! Testing infrastructure
//!
//! Fake kernel trees and concurrent first-caller harnesses.

pub mod fake_kernel;
pub mod race_proof;

pub use fake_kernel::FakeKernel;
pub use race_proof::*;
