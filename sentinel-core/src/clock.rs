/// Monotonic millisecond time as the probation timers see it.
///
/// Wall-clock time is usually not synchronised this early in boot, so every
/// timer here is a difference of two readings of a free-running counter. The
/// counter is 32 bits and wraps after ~49 days; differences are taken with
/// wrapping subtraction so a wrap in the middle of probation is harmless.
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Millis(pub u32);

impl Millis {
    /// Time from `earlier` to `self`, correct across one counter wrap.
    pub fn elapsed_since(self, earlier: Millis) -> Duration {
        Duration::from_millis(self.0.wrapping_sub(earlier.0) as u64)
    }

    pub fn wrapping_add(self, delta: Duration) -> Millis {
        Millis(self.0.wrapping_add(delta.as_millis() as u32))
    }
}

pub trait MonotonicClock {
    fn now(&self) -> Millis;
}

impl<C: MonotonicClock + ?Sized> MonotonicClock for &C {
    fn now(&self) -> Millis {
        (**self).now()
    }
}

/// Hand-driven clock for tests. Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u32>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(ms: u32) -> Self {
        Self {
            now: Rc::new(Cell::new(ms)),
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.now.set(Millis(self.now.get()).wrapping_add(delta).0);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }
}

impl MonotonicClock for ManualClock {
    fn now(&self) -> Millis {
        Millis(self.now.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_clones_share_time() {
        let clock = ManualClock::new();
        let handle = clock.clone();
        handle.advance_secs(5);
        assert_eq!(clock.now(), Millis(5_000));
    }

    #[test]
    fn test_elapsed_across_wrap() {
        let before = Millis(u32::MAX - 499);
        let after = before.wrapping_add(Duration::from_millis(1_500));
        assert_eq!(after, Millis(1_000));
        assert_eq!(after.elapsed_since(before), Duration::from_millis(1_500));
    }

    proptest! {
        #[test]
        fn prop_elapsed_independent_of_origin(origin in any::<u32>(), delta in 0u32..=u32::MAX) {
            let start = Millis(origin);
            let end = start.wrapping_add(Duration::from_millis(delta as u64));
            prop_assert_eq!(end.elapsed_since(start), Duration::from_millis(delta as u64));
        }
    }
}
