//! Where the loop takes its time from.

#[cfg(test)]
use std::cell::Cell;
#[cfg(test)]
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// The time source of a loop.
///
/// Timestamps are durations since the source's own epoch. All deadlines
/// inside the loop are absolute in this scale; callers only ever pass
/// relative durations.
#[derive(Debug, Clone)]
pub enum Clock {
    /// The monotonic clock, anchored at some instant. Never jumps, which is
    /// why [detect](#method.detect) picks it whenever it can.
    Monotonic(Instant),
    /// The wall clock. Someone can set it backwards under our hands, so the
    /// loop runs its deadline correction when driven by this one.
    Wall,
    #[cfg(test)]
    Manual(Rc<Cell<Duration>>),
}

impl Clock {
    /// Probe for the best clock available.
    ///
    /// Rust guarantees a monotonic `Instant` everywhere we run, so the probe
    /// always ends up with it.
    pub fn detect() -> Clock {
        Clock::Monotonic(Instant::now())
    }

    pub fn read(&self) -> Duration {
        match *self {
            Clock::Monotonic(anchor) => anchor.elapsed(),
            Clock::Wall => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::new(0, 0)),
            #[cfg(test)]
            Clock::Manual(ref time) => time.get(),
        }
    }

    /// Can the readings go backwards?
    pub fn is_monotonic(&self) -> bool {
        match *self {
            Clock::Monotonic(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_advances() {
        let clock = Clock::detect();
        assert!(clock.is_monotonic());
        let first = clock.read();
        let second = clock.read();
        assert!(second >= first);
    }

    #[test]
    fn manual_is_controlled() {
        let time = Rc::new(Cell::new(Duration::new(5, 0)));
        let clock = Clock::Manual(time.clone());
        assert!(!clock.is_monotonic());
        assert_eq!(Duration::new(5, 0), clock.read());
        time.set(Duration::new(2, 0));
        assert_eq!(Duration::new(2, 0), clock.read());
    }
}
