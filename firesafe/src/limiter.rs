//! Per-source read ceilings.
//!
//! Every batch reserves its requested size before it is fetched. A
//! reservation that would push a source past its ceiling is refused without
//! touching the counter, so `reads_used` never exceeds the ceiling and never
//! decreases. Reservations are not refunded when a batch comes back short:
//! with ceiling `C` and batch size `B` exactly `C / B` batches run.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::config::ExportConfig;
use crate::sources::SourceKind;

#[derive(Debug)]
struct Counter {
    used: AtomicU64,
    ceiling: Option<u64>,
}

impl Counter {
    fn new(ceiling: Option<u64>) -> Self {
        Self {
            used: AtomicU64::new(0),
            ceiling,
        }
    }
}

/// Read budget for one run, shared by all sources.
#[derive(Debug)]
pub struct SafetyLimiter {
    counters: [Counter; 4],
}

impl SafetyLimiter {
    /// Build a limiter from explicit ceilings; sources not listed are unlimited.
    pub fn new(ceilings: impl IntoIterator<Item = (SourceKind, Option<u64>)>) -> Self {
        let mut limits: [Option<u64>; 4] = [None; 4];
        for (kind, ceiling) in ceilings {
            limits[slot(kind)] = ceiling;
        }
        Self {
            counters: limits.map(Counter::new),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(std::iter::empty())
    }

    pub fn from_config(config: &ExportConfig) -> Self {
        Self::new(config.max_reads_per_source())
    }

    /// Reserve `count` reads for `kind`.
    ///
    /// Returns `false`, leaving the counter untouched, when the reservation
    /// would exceed the ceiling.
    pub fn check_and_reserve(&self, kind: SourceKind, count: u64) -> bool {
        let counter = &self.counters[slot(kind)];
        let ceiling = counter.ceiling;
        let result = counter
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(count)?;
                match ceiling {
                    Some(max) if next > max => None,
                    _ => Some(next),
                }
            });

        match result {
            Ok(previous) => {
                debug!(source = %kind, used = previous + count, "Reserved reads");
                true
            }
            Err(used) => {
                debug!(source = %kind, used, count, ?ceiling, "Read reservation refused");
                false
            }
        }
    }

    pub fn reads_used(&self, kind: SourceKind) -> u64 {
        self.counters[slot(kind)].used.load(Ordering::Acquire)
    }

    pub fn ceiling(&self, kind: SourceKind) -> Option<u64> {
        self.counters[slot(kind)].ceiling
    }

    /// Reads still available, `None` when unlimited.
    pub fn remaining(&self, kind: SourceKind) -> Option<u64> {
        self.ceiling(kind)
            .map(|max| max.saturating_sub(self.reads_used(kind)))
    }
}

fn slot(kind: SourceKind) -> usize {
    match kind {
        SourceKind::Firestore => 0,
        SourceKind::Auth => 1,
        SourceKind::Storage => 2,
        SourceKind::RealtimeDb => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_exact_batch_count() {
        let limiter = SafetyLimiter::new([(SourceKind::Firestore, Some(4))]);
        assert!(limiter.check_and_reserve(SourceKind::Firestore, 2));
        assert!(limiter.check_and_reserve(SourceKind::Firestore, 2));
        assert!(!limiter.check_and_reserve(SourceKind::Firestore, 2));
        assert_eq!(limiter.reads_used(SourceKind::Firestore), 4);
    }

    #[test]
    fn test_refusal_leaves_counter_untouched() {
        let limiter = SafetyLimiter::new([(SourceKind::Auth, Some(10))]);
        assert!(limiter.check_and_reserve(SourceKind::Auth, 7));
        assert!(!limiter.check_and_reserve(SourceKind::Auth, 4));
        assert_eq!(limiter.reads_used(SourceKind::Auth), 7);
        assert!(limiter.check_and_reserve(SourceKind::Auth, 3));
        assert_eq!(limiter.remaining(SourceKind::Auth), Some(0));
    }

    #[test]
    fn test_unlimited_sources() {
        let limiter = SafetyLimiter::new([(SourceKind::Firestore, Some(1))]);
        for _ in 0..100 {
            assert!(limiter.check_and_reserve(SourceKind::Storage, 1000));
        }
        assert_eq!(limiter.remaining(SourceKind::Storage), None);
    }

    #[test]
    fn test_counter_overflow_is_refused() {
        let limiter = SafetyLimiter::unlimited();
        assert!(limiter.check_and_reserve(SourceKind::RealtimeDb, u64::MAX));
        assert!(!limiter.check_and_reserve(SourceKind::RealtimeDb, 1));
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_ceiling() {
        let limiter = Arc::new(SafetyLimiter::new([(SourceKind::Firestore, Some(1000))]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    let mut granted = 0u64;
                    while limiter.check_and_reserve(SourceKind::Firestore, 7) {
                        granted += 1;
                    }
                    granted
                })
            })
            .collect();

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1000 / 7);
        assert_eq!(limiter.reads_used(SourceKind::Firestore), (1000 / 7) * 7);
    }

    #[test]
    fn test_from_config() {
        let config = ExportConfig::for_project("p");
        let limiter = SafetyLimiter::from_config(&config);
        assert_eq!(limiter.ceiling(SourceKind::Firestore), Some(50_000));
        assert_eq!(limiter.ceiling(SourceKind::RealtimeDb), None);
    }
}
