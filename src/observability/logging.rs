/// Logging setup
///
/// The library only emits through the `log` facade. Binaries and tests call
/// [`init`] to route records to stderr via env_logger; `RUST_LOG` selects the
/// level, and a non-empty `LIBAPPARMOR_DEBUG` forces debug output.
use once_cell::sync::Lazy;

/// Environment variable that turns on debug output
pub const DEBUG_ENV_VAR: &str = "LIBAPPARMOR_DEBUG";

static DEBUG_REQUESTED: Lazy<bool> = Lazy::new(|| {
    std::env::var_os(DEBUG_ENV_VAR).map_or(false, |v| !v.is_empty())
});

/// Whether `LIBAPPARMOR_DEBUG` was set when first checked
pub fn debug_requested() -> bool {
    *DEBUG_REQUESTED
}

fn builder() -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if debug_requested() {
        builder.filter_module("aabridge", log::LevelFilter::Debug);
    }
    builder
}

/// Install the stderr logger. Later calls are ignored.
pub fn init() {
    if builder().try_init().is_ok() {
        log::debug!("Logging initialized (debug forced: {})", debug_requested());
    }
}

/// Logger for test binaries: captured output, never fails on re-init.
pub fn init_for_tests() {
    let _ = builder().is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_for_tests();
        init();
        init();
        log::info!("still alive");
    }
}
