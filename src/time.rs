//! A monotonic time source shared by every timed wait in this crate.
//!
//! Grounded on `dispenso/platform.h` + `dispenso/timing.cpp`: a single
//! monotonic seconds-since-some-epoch clock, with the hardware-counter path
//! preferred and a `std::time::Instant` fallback. Rust's `Instant` is already
//! the fallback the C++ implementation reaches for when no cheaper tick
//! source is available, so we use it directly rather than reinventing a
//! `rdtsc` reader — the platform-specific ticker referenced in spec §1's
//! Non-goals is an external collaborator, not something this crate owns.

use std::sync::OnceLock;
use std::time::Instant;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

fn process_start() -> Instant {
    *PROCESS_START.get_or_init(Instant::now)
}

/// Monotonic seconds since an arbitrary, process-local epoch (first call to
/// any `taskloom` timing function). Never decreases.
pub fn now() -> f64 {
    process_start().elapsed().as_secs_f64()
}

/// Converts a `now()`-domain absolute time into a `std::time::Duration` to
/// wait from the current instant, clamped to zero if already in the past.
pub fn duration_until(abs_time: f64) -> std::time::Duration {
    let remaining = abs_time - now();
    if remaining <= 0.0 {
        std::time::Duration::ZERO
    } else {
        std::time::Duration::from_secs_f64(remaining)
    }
}

/// Hints to the CPU that we're in a busy-wait spin loop (`pause` on x86,
/// `yield` on aarch64). Matches `dispenso::detail::cpuRelax`.
#[inline]
pub fn cpu_relax() {
    std::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_non_decreasing() {
        let mut last = now();
        for _ in 0..1000 {
            let cur = now();
            assert!(cur >= last);
            last = cur;
        }
    }

    #[test]
    fn duration_until_past_is_zero() {
        assert_eq!(duration_until(now() - 10.0), std::time::Duration::ZERO);
    }
}
