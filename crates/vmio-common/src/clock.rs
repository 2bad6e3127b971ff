//! Per-request timing
//!
//! A [`Clock`] accumulates wall time into named phases ("read",
//! "write", "zero", ...). Handlers run each I/O phase under the clock
//! and log the totals when the request completes.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, Default)]
struct Stopwatch {
    total: Duration,
    count: u64,
}

/// Accumulates named phase stopwatches.
#[derive(Default)]
pub struct Clock {
    // Phases in first-use order, so log output is stable.
    phases: Mutex<Vec<(&'static str, Stopwatch)>>,
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a phase; time is accumulated when the returned guard drops.
    #[must_use]
    pub fn run(&self, name: &'static str) -> ClockGuard<'_> {
        ClockGuard {
            clock: self,
            name,
            started: Instant::now(),
        }
    }

    fn add(&self, name: &'static str, elapsed: Duration) {
        let mut phases = self.phases.lock();
        if let Some((_, sw)) = phases.iter_mut().find(|(n, _)| *n == name) {
            sw.total += elapsed;
            sw.count += 1;
        } else {
            phases.push((
                name,
                Stopwatch {
                    total: elapsed,
                    count: 1,
                },
            ));
        }
    }

    /// Total time accumulated for a phase.
    #[must_use]
    pub fn total(&self, name: &'static str) -> Duration {
        self.phases
            .lock()
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, sw)| sw.total)
            .unwrap_or_default()
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phases = self.phases.lock();
        write!(f, "[")?;
        for (i, (name, sw)) in phases.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:.6}/{}", name, sw.total.as_secs_f64(), sw.count)?;
        }
        write!(f, "]")
    }
}

/// Guard returned by [`Clock::run`].
pub struct ClockGuard<'a> {
    clock: &'a Clock,
    name: &'static str,
    started: Instant,
}

impl Drop for ClockGuard<'_> {
    fn drop(&mut self) {
        self.clock.add(self.name, self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates() {
        let clock = Clock::new();
        {
            let _guard = clock.run("read");
        }
        {
            let _guard = clock.run("read");
        }
        let phases = clock.phases.lock();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].1.count, 2);
    }

    #[test]
    fn test_display_order() {
        let clock = Clock::new();
        drop(clock.run("read"));
        drop(clock.run("write"));
        let text = format!("{clock}");
        let read = text.find("read=").unwrap();
        let write = text.find("write=").unwrap();
        assert!(read < write);
    }

    #[test]
    fn test_total_unknown_phase() {
        let clock = Clock::new();
        assert_eq!(clock.total("flush"), Duration::ZERO);
    }
}
