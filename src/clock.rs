use crate::wire::PtpTimestamp;
use std::time::Instant;

/// Source of the monotonic timestamps this protocol correlates. Unlike
/// `pendulum::clock::ClockSource` (which produces wall-clock NTP time for a
/// stratum announcement), this system only ever measures *differences*
/// between timestamps it generated itself, so a monotonic clock is the
/// right source — there is no stratum or reference identifier to report.
pub trait ClockSource {
    /// Current time as a wire-ready [`PtpTimestamp`] (already split into
    /// seconds/nanoseconds, ready for big-endian placement on the wire).
    fn now(&self) -> PtpTimestamp;
}

/// High-resolution monotonic clock, anchored at construction time so that
/// `seconds` stays small and `PtpTimestamp`'s 32-bit seconds field does not
/// wrap for the lifetime of a single run.
#[cfg(target_os = "linux")]
pub struct MonotonicClock {
    epoch: (i64, i64),
}

#[cfg(not(target_os = "linux"))]
pub struct MonotonicClock {
    epoch: Instant,
}

#[cfg(target_os = "linux")]
impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            epoch: Self::raw_now(),
        }
    }

    fn raw_now() -> (i64, i64) {
        use libc::{clock_gettime, timespec, CLOCK_MONOTONIC};
        use std::mem::MaybeUninit;

        unsafe {
            let mut ts = MaybeUninit::<timespec>::uninit();
            if clock_gettime(CLOCK_MONOTONIC, ts.as_mut_ptr()) == 0 {
                let ts = ts.assume_init();
                (ts.tv_sec as i64, ts.tv_nsec as i64)
            } else {
                // CLOCK_MONOTONIC is unavailable; std's Instant is our only
                // other handle on monotonic time.
                let fallback_ns = Instant::now().elapsed().as_nanos() as i64;
                (0, fallback_ns)
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl ClockSource for MonotonicClock {
    fn now(&self) -> PtpTimestamp {
        let (secs, nanos) = Self::raw_now();
        let (epoch_secs, epoch_nanos) = self.epoch;
        let mut delta_secs = secs - epoch_secs;
        let mut delta_nanos = nanos - epoch_nanos;
        if delta_nanos < 0 {
            delta_nanos += 1_000_000_000;
            delta_secs -= 1;
        }
        PtpTimestamp::new(delta_secs.max(0) as u32, delta_nanos as u32)
    }
}

#[cfg(not(target_os = "linux"))]
impl ClockSource for MonotonicClock {
    fn now(&self) -> PtpTimestamp {
        let elapsed = self.epoch.elapsed();
        PtpTimestamp::new(elapsed.as_secs() as u32, elapsed.subsec_nanos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let t1 = clock.now().to_nanos();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let t2 = clock.now().to_nanos();
        assert!(t2 > t1);
    }
}
