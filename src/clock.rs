//! Alarm timer and wall-clock sampling.
//!
//! The broker paces its periodic work (driver heartbeats, idle reaping) off a
//! one-shot one-second `ITIMER_REAL`. The kernel delivers `SIGALRM` when it
//! fires; the signal bridge latches it and the engine rearms the timer once
//! the tick has been observed, so exactly one tick is pending at any time
//! while the engine runs.

use std::time::{SystemTime, UNIX_EPOCH};

/// Arm a one-shot real-time timer that delivers `SIGALRM` after one second.
pub fn arm_alarm() {
    set_real_timer(1, 0);
}

/// Cancel any pending `SIGALRM` delivery.
pub fn cancel_alarm() {
    set_real_timer(0, 0);
}

fn set_real_timer(sec: i64, usec: i64) {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: sec as libc::time_t,
            tv_usec: usec as libc::suseconds_t,
        },
    };

    // setitimer only fails on invalid arguments, which cannot happen here.
    unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
}

/// Current wall-clock time in whole seconds since the Unix epoch.
///
/// Idle accounting only ever compares these values; a clock stepped before
/// the epoch reads as zero rather than panicking.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Seconds elapsed from `then` to `now`, clamped at zero.
///
/// The wall clock may be stepped backwards under us; a negative delta counts
/// as no idle time at all.
pub fn elapsed(now: i64, then: i64) -> i64 {
    (now - then).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_now_is_sane() {
        // 2020-01-01 as a floor; anything earlier means the clock source broke.
        assert!(unix_now() > 1_577_836_800);
    }

    #[test]
    fn elapsed_clamps_negative_deltas() {
        assert_eq!(elapsed(100, 100), 0);
        assert_eq!(elapsed(105, 100), 5);
        assert_eq!(elapsed(100, 105), 0);
    }
}
