//! Process-wide counters for the compression engine.
//!
//! Incremented silently at the call site; [`Metrics::flush`] emits the
//! current values as one `info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    compressions: AtomicU64,
    fallbacks: AtomicU64,
    degraded_backgrounds: AtomicU64,
    quotes_rejected: AtomicU64,
    items_merged: AtomicU64,
    items_evicted: AtomicU64,
    forced_resets: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            compressions: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            degraded_backgrounds: AtomicU64::new(0),
            quotes_rejected: AtomicU64::new(0),
            items_merged: AtomicU64::new(0),
            items_evicted: AtomicU64::new(0),
            forced_resets: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, by: u64, name: &'static str) {
        if by == 0 {
            return;
        }
        counter.fetch_add(by, Ordering::Relaxed);
        tracing::trace!(metric = name, by, "counter incremented");
    }

    pub fn inc_compressions(&self) {
        Self::bump(&self.compressions, 1, "compressions");
    }

    pub fn inc_fallbacks(&self) {
        Self::bump(&self.fallbacks, 1, "fallbacks");
    }

    pub fn inc_degraded_backgrounds(&self) {
        Self::bump(&self.degraded_backgrounds, 1, "degraded_backgrounds");
    }

    pub fn inc_quotes_rejected(&self) {
        Self::bump(&self.quotes_rejected, 1, "quotes_rejected");
    }

    pub fn add_items_merged(&self, n: u64) {
        Self::bump(&self.items_merged, n, "items_merged");
    }

    pub fn add_items_evicted(&self, n: u64) {
        Self::bump(&self.items_evicted, n, "items_evicted");
    }

    pub fn inc_forced_resets(&self) {
        Self::bump(&self.forced_resets, 1, "forced_resets");
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            compressions = self.compressions(),
            fallbacks = self.fallbacks(),
            degraded_backgrounds = self.degraded_backgrounds(),
            quotes_rejected = self.quotes_rejected(),
            items_merged = self.items_merged(),
            items_evicted = self.items_evicted(),
            forced_resets = self.forced_resets(),
        );
    }

    pub fn compressions(&self) -> u64 {
        self.compressions.load(Ordering::Relaxed)
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn degraded_backgrounds(&self) -> u64 {
        self.degraded_backgrounds.load(Ordering::Relaxed)
    }

    pub fn quotes_rejected(&self) -> u64 {
        self.quotes_rejected.load(Ordering::Relaxed)
    }

    pub fn items_merged(&self) -> u64 {
        self.items_merged.load(Ordering::Relaxed)
    }

    pub fn items_evicted(&self) -> u64 {
        self.items_evicted.load(Ordering::Relaxed)
    }

    pub fn forced_resets(&self) -> u64 {
        self.forced_resets.load(Ordering::Relaxed)
    }

    /// Zero every counter (tests).
    pub fn reset(&self) {
        for counter in [
            &self.compressions,
            &self.fallbacks,
            &self.degraded_backgrounds,
            &self.quotes_rejected,
            &self.items_merged,
            &self.items_evicted,
            &self.forced_resets,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::new();
        m.inc_compressions();
        m.inc_compressions();
        m.inc_fallbacks();
        m.add_items_merged(3);
        m.add_items_evicted(0);
        assert_eq!(m.compressions(), 2);
        assert_eq!(m.fallbacks(), 1);
        assert_eq!(m.items_merged(), 3);
        assert_eq!(m.items_evicted(), 0);
    }

    #[test]
    fn test_reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_degraded_backgrounds();
        m.inc_quotes_rejected();
        m.inc_forced_resets();
        m.reset();
        assert_eq!(m.degraded_backgrounds(), 0);
        assert_eq!(m.quotes_rejected(), 0);
        assert_eq!(m.forced_resets(), 0);
    }
}
