//! Observability
//!
//! Diagnostics go through the `log` facade; see [`logging`].

pub mod logging;
