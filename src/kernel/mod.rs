//! Thin wrappers around the AppArmor kernel interfaces.
//!
//! Raw syscalls carry explicit SAFETY comments.
//! Dependency direction: probe -> confinement -> procattr/peer -> query -> interface

pub mod confinement;
pub mod interface;
pub mod peer;
pub mod probe;
pub mod procattr;
pub mod query;
