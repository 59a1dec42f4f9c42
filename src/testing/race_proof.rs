/// Concurrent first-caller races
///
/// Releases many threads at once against a one-shot initializer and collects
/// what each of them observed, so tests can assert that every caller saw the
/// same latched result.
use std::sync::Barrier;
use std::thread;

/// Race proof configuration
#[derive(Debug, Clone)]
pub struct RaceProofConfig {
    /// Threads released simultaneously
    pub threads: usize,
}

impl Default for RaceProofConfig {
    fn default() -> Self {
        RaceProofConfig { threads: 16 }
    }
}

/// Race proof result
#[derive(Debug, Clone)]
pub struct RaceProofResult<T> {
    /// Threads that took part
    pub iterations: usize,

    /// Value observed by each thread that completed
    pub outcomes: Vec<T>,

    /// Threads that panicked
    pub failures: usize,
}

impl<T: PartialEq> RaceProofResult<T> {
    /// Every thread finished and all of them observed the same value.
    pub fn is_pass(&self) -> bool {
        self.failures == 0
            && self.outcomes.len() == self.iterations
            && self.outcomes.windows(2).all(|pair| pair[0] == pair[1])
    }

    pub fn first(&self) -> Option<&T> {
        self.outcomes.first()
    }
}

/// Run `probe` on `config.threads` threads released through one barrier.
pub fn race_first_callers<T, F>(config: &RaceProofConfig, probe: F) -> RaceProofResult<T>
where
    T: Send,
    F: Fn() -> T + Sync,
{
    let barrier = Barrier::new(config.threads);
    let mut result = RaceProofResult {
        iterations: config.threads,
        outcomes: Vec::with_capacity(config.threads),
        failures: 0,
    };

    thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    probe()
                })
            })
            .collect();

        for handle in handles {
            match handle.join() {
                Ok(outcome) => result.outcomes.push(outcome),
                Err(_) => result.failures += 1,
            }
        }
    });

    log::debug!(
        "Race proof: {} threads, {} failures",
        result.iterations,
        result.failures
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::OnceCell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_once_cell_initializes_once_under_race() {
        let cell = OnceCell::new();
        let calls = AtomicUsize::new(0);

        let result = race_first_callers(&RaceProofConfig::default(), || {
            *cell.get_or_init(|| calls.fetch_add(1, Ordering::SeqCst))
        });

        assert!(result.is_pass());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_divergent_outcomes_fail() {
        let counter = AtomicUsize::new(0);
        let result = race_first_callers(&RaceProofConfig { threads: 4 }, || {
            counter.fetch_add(1, Ordering::SeqCst)
        });
        assert!(!result.is_pass());
    }
}
