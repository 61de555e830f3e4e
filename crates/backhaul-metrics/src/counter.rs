use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A closed set of labels for a [`ReasonCounter`]
pub trait FailureReason: Copy + Eq + 'static {
    const ALL: &'static [Self];

    fn as_str(self) -> &'static str;

    fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|reason| *reason == self)
            .unwrap_or(0)
    }
}

/// Monotonic counter partitioned by reason
#[derive(Debug)]
pub struct ReasonCounter<R> {
    counts: Vec<AtomicU64>,
    _reason: PhantomData<R>,
}

impl<R: FailureReason> ReasonCounter<R> {
    pub fn new() -> Self {
        Self {
            counts: R::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
            _reason: PhantomData,
        }
    }

    pub fn inc(&self, reason: R) {
        self.counts[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, reason: R) -> u64 {
        self.counts[reason.index()].load(Ordering::Relaxed)
    }

    /// `(label, value)` for every reason, in declaration order
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        R::ALL
            .iter()
            .map(|reason| (reason.as_str(), self.get(*reason)))
            .collect()
    }

    pub fn reset(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }
}

impl<R: FailureReason> Default for ReasonCounter<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Value that goes up and down
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.set(0);
    }
}
