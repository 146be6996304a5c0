// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

use crate::error::{Error, Result};
use crate::time::{NANOS_PER_SEC, TimeInterval};

/// Nanoseconds per scheduler quantum of the global clock.
pub const DEFAULT_QUANTUM_NS: u32 = 1_000_000;

/// How a sub-quantum remainder is treated when converting a [`TimeInterval`]
/// into quantums.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QuantumRounding {
    TowardZero,
    AwayFromZero,
}

/// The kernel time base, driven by the periodic quantum timer.
///
/// Each quantum tick bumps a 32-bit quantum counter and advances
/// `current_time` by [`MonotonicClock::ns_per_quantum`]. Readers combine the
/// accumulated quanta with the elapsed nanoseconds the tick source has
/// recorded past them, retrying whenever a quantum transition slips in
/// between the loads. The read path takes no lock; it is called from
/// scheduler wait-deadline computation and must stay that way.
#[derive(Debug)]
pub struct MonotonicClock {
    ns_per_quantum: u32,
    current_quantum: AtomicU32,
    /// Whole quanta accumulated so far, in nanoseconds. A single word so a
    /// reader can never observe a torn seconds/nanoseconds pair.
    current_time_ns: AtomicU64,
    /// Host stand-in for the chipset quantum timer.
    epoch: Instant,
}

lazy_static! {
    static ref GLOBAL_CLOCK: Arc<MonotonicClock> = MonotonicClock::start(DEFAULT_QUANTUM_NS)
        .expect("failed to start the global quantum timer");
}

// === impl MonotonicClock ===

impl MonotonicClock {
    /// Creates a clock that is not ticked by anything yet. [`MonotonicClock::tick`]
    /// must be driven externally, exactly once per elapsed quantum.
    #[must_use]
    pub fn new(ns_per_quantum: u32) -> MonotonicClock {
        debug_assert!(ns_per_quantum > 0 && u64::from(ns_per_quantum) <= NANOS_PER_SEC);
        MonotonicClock {
            ns_per_quantum,
            current_quantum: AtomicU32::new(0),
            current_time_ns: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Creates a clock and spawns its quantum timer.
    ///
    /// The timer thread stands in for the quantum interrupt handler: it fires
    /// once per quantum boundary, catching up on boundaries it overslept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the timer thread cannot be spawned.
    pub fn start(ns_per_quantum: u32) -> Result<Arc<MonotonicClock>> {
        let clock = Arc::new(Self::new(ns_per_quantum));
        let quantum = Duration::from_nanos(u64::from(ns_per_quantum));

        let timer = Arc::clone(&clock);
        thread::Builder::new()
            .name("quantum-timer".into())
            .spawn(move || {
                let mut next = timer.epoch + quantum;
                loop {
                    let now = Instant::now();
                    if now < next {
                        thread::sleep(next - now);
                    }
                    while next <= Instant::now() {
                        timer.tick();
                        next += quantum;
                    }
                }
            })
            .map_err(|_| Error::OutOfMemory)?;

        tracing::debug!(ns_per_quantum, "monotonic clock started");
        Ok(clock)
    }

    /// The clock backing the dispatch subsystem.
    pub fn global() -> &'static Arc<MonotonicClock> {
        &GLOBAL_CLOCK
    }

    #[must_use]
    pub const fn ns_per_quantum(&self) -> u32 {
        self.ns_per_quantum
    }

    /// The quantum timer interrupt handler. Must be called by a single driver
    /// (the timer thread, or a test ticking manually).
    pub fn tick(&self) {
        self.current_quantum.fetch_add(1, Ordering::Release);
        self.current_time_ns
            .fetch_add(u64::from(self.ns_per_quantum), Ordering::Release);
    }

    /// Returns the current time.
    ///
    /// Lock-free: loads the accumulated quantum time, adds the nanoseconds
    /// the tick source has run past it and retries if the quantum counter
    /// moved during the computation.
    pub fn current_time(&self) -> TimeInterval {
        loop {
            let quantum = self.current_quantum.load(Ordering::Acquire);
            let quanta_ns = self.current_time_ns.load(Ordering::Acquire);

            // `current_time_ns` always holds whole quanta, so everything the
            // tick source has recorded past it is the intra-quantum remainder.
            let elapsed_ns = self.epoch.elapsed().as_nanos() as u64;
            let in_quantum = elapsed_ns.saturating_sub(quanta_ns);

            if self.current_quantum.load(Ordering::Acquire) == quantum {
                let total = quanta_ns + in_quantum;
                return TimeInterval::new(
                    (total / NANOS_PER_SEC) as i64,
                    (total % NANOS_PER_SEC) as u32,
                );
            }
        }
    }

    /// Converts a time interval into quantums.
    ///
    /// [`QuantumRounding::AwayFromZero`] bumps the result by one quantum when
    /// the quantum boundary lies below the requested interval.
    #[must_use]
    pub fn quantums_from_interval(&self, interval: TimeInterval, rounding: QuantumRounding) -> i64 {
        let nanos = interval.as_nanos();
        let quants = nanos / i128::from(self.ns_per_quantum);

        let quants = match rounding {
            QuantumRounding::TowardZero => quants,
            QuantumRounding::AwayFromZero => {
                if quants * i128::from(self.ns_per_quantum) < nanos {
                    quants + 1
                } else {
                    quants
                }
            }
        };

        quants.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }

    /// Converts a quantum count into a time interval.
    #[must_use]
    pub fn interval_from_quantums(&self, quants: i64) -> TimeInterval {
        let nanos = i128::from(quants) * i128::from(self.ns_per_quantum);
        TimeInterval::from_nanos(nanos.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64)
    }

    /// Spin-waits until `deadline`.
    ///
    /// Returns `true` if the delay was performed. Delays longer than a
    /// millisecond return `false` immediately; those belong on a scheduler
    /// wait.
    pub fn delay_until(&self, deadline: TimeInterval) -> bool {
        let delta = deadline - self.current_time();
        if delta > TimeInterval::from_millis(1) {
            return false;
        }

        while self.current_time() < deadline {
            core::hint::spin_loop();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_accumulate_quanta() {
        let clock = MonotonicClock::new(250_000_000);
        for _ in 0..6 {
            clock.tick();
        }
        // 6 * 250ms of quanta have been accumulated, plus however long the
        // host took to get here.
        let t = clock.current_time();
        assert!(t >= TimeInterval::new(1, 500_000_000));
        assert!(t < TimeInterval::from_secs(2));
    }

    #[test]
    fn reads_are_monotonic() {
        let clock = Arc::new(MonotonicClock::new(10_000));
        let ticker = Arc::clone(&clock);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stopped = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            while !stopped.load(Ordering::Relaxed) {
                ticker.tick();
                std::thread::sleep(Duration::from_micros(50));
            }
        });

        let mut prev = clock.current_time();
        for _ in 0..100_000 {
            let now = clock.current_time();
            assert!(now >= prev);
            prev = now;
        }

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn quantum_conversion_rounding() {
        let clock = MonotonicClock::new(1_000_000);

        let t = TimeInterval::from_micros(2_500);
        assert_eq!(clock.quantums_from_interval(t, QuantumRounding::TowardZero), 2);
        assert_eq!(
            clock.quantums_from_interval(t, QuantumRounding::AwayFromZero),
            3
        );

        let exact = TimeInterval::from_millis(4);
        assert_eq!(
            clock.quantums_from_interval(exact, QuantumRounding::AwayFromZero),
            4
        );

        // Truncation already moves negative intervals toward zero.
        let neg = TimeInterval::from_micros(-2_500);
        assert_eq!(
            clock.quantums_from_interval(neg, QuantumRounding::TowardZero),
            -2
        );
    }

    #[test]
    fn quantums_roundtrip() {
        let clock = MonotonicClock::new(1_000_000);
        let t = clock.interval_from_quantums(1_500);
        assert_eq!(t, TimeInterval::from_millis(1_500));
        assert_eq!(
            clock.quantums_from_interval(t, QuantumRounding::TowardZero),
            1_500
        );
    }

    #[test]
    fn short_delays_spin() {
        let clock = MonotonicClock::global();
        let deadline = clock.current_time() + TimeInterval::from_micros(200);
        assert!(clock.delay_until(deadline));
        assert!(clock.current_time() >= deadline);

        let far = clock.current_time() + TimeInterval::from_secs(1);
        assert!(!clock.delay_until(far));
    }
}
