//! Monotonic-raw microsecond clock used for slot timestamps and timeouts (§6).

/// Microseconds since an arbitrary, monotonic epoch.
///
/// Uses `CLOCK_MONOTONIC_RAW` where available (unaffected by NTP
/// slewing), falling back to `CLOCK_MONOTONIC` on platforms that don't
/// expose the raw variant.
pub fn now_micros() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let clock_id = monotonic_raw_clock_id();
    // SAFETY: `ts` is a valid, writable `timespec` on the stack.
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    if rc != 0 {
        // Fall back to CLOCK_MONOTONIC if the raw variant isn't supported.
        // SAFETY: same as above.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000)
        .saturating_add((ts.tv_nsec as u64) / 1_000)
}

#[cfg(target_os = "linux")]
fn monotonic_raw_clock_id() -> libc::clockid_t {
    libc::CLOCK_MONOTONIC_RAW
}

#[cfg(not(target_os = "linux"))]
fn monotonic_raw_clock_id() -> libc::clockid_t {
    libc::CLOCK_MONOTONIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_non_decreasing() {
        let a = now_micros();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = now_micros();
        assert!(b >= a);
    }

    #[test]
    fn reports_real_elapsed_time() {
        let a = now_micros();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let b = now_micros();
        assert!(b - a >= 15_000, "elapsed={}us", b - a);
    }
}
