use alloc::vec::Vec;
use core::cmp::min;

/// Exponential poll interval bounded by a watchdog.
///
/// Callers check [`Backoff::expired`] before every wait and sleep for
/// [`Backoff::next_interval`] microseconds otherwise, so the total time spent
/// never exceeds the watchdog by more than one capped interval.
#[derive(Debug, Clone)]
pub struct Backoff {
    interval_us: u32,
    max_us: u32,
    elapsed_us: u64,
    watchdog_us: u64,
}

impl Backoff {
    pub fn new(min_us: u32, max_us: u32, watchdog_us: u64) -> Backoff {
        Backoff {
            interval_us: min_us.max(1),
            max_us,
            elapsed_us: 0,
            watchdog_us,
        }
    }

    pub fn expired(&self) -> bool {
        self.elapsed_us > self.watchdog_us
    }

    pub fn next_interval(&mut self) -> u32 {
        let delay = self.interval_us;
        self.elapsed_us += u64::from(delay);
        self.interval_us = min(delay.saturating_mul(2), self.max_us);
        delay
    }

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_us
    }
}

/// Drop the elements of `items` last-first.
pub fn drop_reverse<T>(mut items: Vec<T>) {
    while let Some(item) = items.pop() {
        drop(item);
    }
}

/// Runs a cleanup closure on drop unless disarmed.
pub struct OnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> OnDrop<F> {
    pub fn new(cleanup: F) -> OnDrop<F> {
        OnDrop(Some(cleanup))
    }

    pub fn disarm(mut self) {
        self.0 = None;
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}

/// Round `value` up to a multiple of the power of two `align`.
pub const fn p2roundup(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
