use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of scheduling time, in seconds.
/// The manager reads it once per pass and whenever a task is (re)armed.
pub trait Clock: Send + Sync {
    /// Get the current time in seconds (monotonic).
    fn now(&self) -> f64;
}

/// Wall clock measured from the moment the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// A clock that only moves when told to.
/// Frame-driven hosts advance it once per frame; tests use it to make delays deterministic.
#[derive(Debug, Default)]
pub struct ManualClock {
    // f64 bit pattern
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(0.0)
    }

    pub fn starting_at(time: f64) -> Self {
        Self {
            bits: AtomicU64::new(time.to_bits()),
        }
    }

    pub fn set(&self, time: f64) {
        self.bits.store(time.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, dt: f64) {
        let _ = self
            .bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some((f64::from_bits(bits) + dt).to_bits())
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), 0.0);

        clock.advance(0.25);
        clock.advance(0.25);
        assert_eq!(clock.now(), 0.5);

        clock.set(10.0);
        assert_eq!(clock.now(), 10.0);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
