// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tracing::warn;

use crate::{
    error::{Error, Result},
    playsync::RunFlag,
};

/// The last stretch of every pacing sleep is spun rather than parked.
const SPIN_MARGIN: Duration = Duration::from_millis(1);

/// True if the rate is positive and one tick at that rate lasts a representable duration.
pub fn valid_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0 && Duration::try_from_secs_f64(1.0 / rate).is_ok()
}

/// Returns the instant `seconds` after `start`, if it can be represented.
pub fn instant_after(start: Instant, seconds: f64) -> Option<Instant> {
    Duration::try_from_secs_f64(seconds)
        .ok()
        .and_then(|offset| start.checked_add(offset))
}

/// Returns the deadline of tick `i` at the given rate.
pub fn tick_deadline(start: Instant, i: u64, rate: f64) -> Result<Instant> {
    instant_after(start, i as f64 / rate).ok_or(Error::InvalidTickRate(rate))
}

/// Sleeps until the deadline, parking first and spinning the last stretch. Wakes early if
/// the flag is lowered. Returns true if the flag is still raised.
pub fn sleep_until(flag: &RunFlag, deadline: Instant) -> bool {
    let now = Instant::now();
    if deadline > now + SPIN_MARGIN && !flag.sleep_until(deadline - SPIN_MARGIN) {
        return false;
    }
    let now = Instant::now();
    if deadline > now {
        spin_sleep::sleep(deadline - now);
    }
    flag.is_running()
}

/// Waits for fixed-rate deadlines computed from a start instant, so delays never accumulate.
pub struct Interval {
    rate: f64,
    start: Option<Instant>,
    ticks: u64,
}

impl Interval {
    pub fn new(rate: f64) -> Interval {
        Interval {
            rate,
            start: None,
            ticks: 0,
        }
    }

    /// The first call returns immediately and fixes the start. Later calls sleep until the
    /// next deadline.
    pub fn wait(&mut self) -> Result<()> {
        let start = *self.start.get_or_insert_with(Instant::now);
        let deadline = tick_deadline(start, self.ticks, self.rate)?;
        self.ticks += 1;
        let now = Instant::now();
        if deadline > now {
            spin_sleep::sleep(deadline - now);
        }
        Ok(())
    }
}

/// Tick counters of one run, readable while the run goes on.
#[derive(Clone, Default)]
pub struct TickStats {
    ticks: Arc<AtomicU64>,
    late: Arc<AtomicU64>,
}

impl TickStats {
    pub fn new() -> TickStats {
        TickStats::default()
    }

    pub fn reset(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.late.store(0, Ordering::Relaxed);
    }

    /// Number of records dispatched.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Number of ticks whose deadline had already passed.
    pub fn late(&self) -> u64 {
        self.late.load(Ordering::Relaxed)
    }

    pub(crate) fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_late(&self) {
        self.late.fetch_add(1, Ordering::Relaxed);
    }
}

/// Paces the merge/dispatch loop: tick `i` is due at `t0 + i / rate`.
///
/// Overdue ticks are dispatched immediately, back to back, and counted as late. No extra ticks
/// are added to make up for the delay.
pub struct Pacer {
    rate: f64,
    t0: Instant,
    next: u64,
    flag: RunFlag,
    stats: TickStats,
}

impl Pacer {
    /// Starts pacing now. Tick 0 is due immediately.
    pub fn start(rate: f64, flag: RunFlag, stats: TickStats) -> Pacer {
        Pacer {
            rate,
            t0: Instant::now(),
            next: 1,
            flag,
            stats,
        }
    }

    /// Records the dispatch of the current tick, then waits for the next deadline. Returns
    /// false if the run flag was lowered while waiting.
    pub fn wait_next(&mut self) -> Result<bool> {
        self.stats.record_tick();
        let deadline = tick_deadline(self.t0, self.next, self.rate)?;
        self.next += 1;

        let now = Instant::now();
        if deadline <= now {
            let late = now - deadline;
            self.stats.record_late();
            warn!(late = late.as_secs_f64(), tick = self.next - 1, "Tick is late");
            return Ok(self.flag.is_running());
        }

        Ok(sleep_until(&self.flag, deadline))
    }
}

#[cfg(test)]
mod test {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use crate::playsync::RunFlag;

    use super::*;

    #[test]
    fn test_interval_does_not_drift() {
        let mut interval = Interval::new(100.0);
        let start = Instant::now();
        for i in 0..10 {
            interval.wait().unwrap();
            // Simulate a slow consumer on one iteration.
            if i == 3 {
                thread::sleep(Duration::from_millis(25));
            }
        }
        // Ten ticks at 100 Hz are due at 90ms, regardless of the delayed iteration.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(200), "{:?}", elapsed);
    }

    #[test]
    fn test_pacer_counts_late_ticks() {
        let flag = RunFlag::new();
        flag.raise();
        let stats = TickStats::new();
        let mut pacer = Pacer::start(100.0, flag.clone(), stats.clone());

        assert!(pacer.wait_next().unwrap());
        thread::sleep(Duration::from_millis(35));
        // Ticks 2 and 3 are overdue and are dispatched back to back without waiting.
        assert!(pacer.wait_next().unwrap());
        assert!(pacer.wait_next().unwrap());
        assert_eq!(3, stats.ticks());
        assert!(stats.late() >= 2);

        flag.lower();
        assert!(!pacer.wait_next().unwrap());
    }

    #[test]
    fn test_tick_deadline() {
        let start = Instant::now();
        assert_eq!(
            start + Duration::from_millis(200),
            tick_deadline(start, 1, 5.0).unwrap()
        );
        assert_eq!(start, tick_deadline(start, 0, 5.0).unwrap());
        assert!(matches!(
            tick_deadline(start, 1, 1e-20),
            Err(Error::InvalidTickRate(_))
        ));
        assert!(matches!(
            tick_deadline(start, 0, 0.0),
            Err(Error::InvalidTickRate(_))
        ));
    }

    #[test]
    fn test_valid_rate() {
        assert!(valid_rate(50.0));
        assert!(valid_rate(1e-3));
        assert!(!valid_rate(0.0));
        assert!(!valid_rate(-1.0));
        assert!(!valid_rate(f64::NAN));
        assert!(!valid_rate(f64::INFINITY));
        assert!(!valid_rate(1e-20));
        assert!(!valid_rate(f64::MIN_POSITIVE));
    }

    #[test]
    fn test_unpaceable_rate_is_an_error() {
        let mut interval = Interval::new(0.0);
        assert!(matches!(interval.wait(), Err(Error::InvalidTickRate(_))));

        let flag = RunFlag::new();
        flag.raise();
        // The period is representable but the first deadline overflows the clock.
        let mut pacer = Pacer::start(1e-19, flag, TickStats::new());
        assert!(matches!(pacer.wait_next(), Err(Error::InvalidTickRate(_))));
    }
}
