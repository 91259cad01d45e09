//! Time values derived from the Posix [`clock_gettime`] function.
//!
//! Functions returning seconds come as `f64`; functions with names followed
//! by "64" return a 64-bit number of nanoseconds.
//!
//! - [`time()`] / [`time64()`] — wall clock time
//! - [`monotonic()`] / [`monotonic64()`] — monotonic time, suitable for
//!   measuring intervals
//!
//! [`clock_gettime`]: http://pubs.opengroup.org/onlinepubs/9699919799/functions/clock_getres.html

use std::time::Duration;

/// A timeout long enough to never expire in practice (100 years).
/// Passing it to any of the blocking operations means "wait forever".
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[inline]
fn gettime(clock: libc::clockid_t) -> (i64, i64) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_REALTIME/CLOCK_MONOTONIC never fail on supported platforms.
    unsafe { libc::clock_gettime(clock, &mut ts) };
    (ts.tv_sec as i64, ts.tv_nsec as i64)
}

/// The wall clock time in seconds since the epoch.
#[inline]
pub fn time() -> f64 {
    let (s, ns) = gettime(libc::CLOCK_REALTIME);
    s as f64 + ns as f64 / 1e9
}

/// The wall clock time in nanoseconds since the epoch.
#[inline]
pub fn time64() -> u64 {
    let (s, ns) = gettime(libc::CLOCK_REALTIME);
    s as u64 * 1_000_000_000 + ns as u64
}

/// The monotonic time in seconds. Unlike [`time()`] it never goes backwards.
#[inline]
pub fn monotonic() -> f64 {
    let (s, ns) = gettime(libc::CLOCK_MONOTONIC);
    s as f64 + ns as f64 / 1e9
}

/// The monotonic time in nanoseconds.
#[inline]
pub fn monotonic64() -> u64 {
    let (s, ns) = gettime(libc::CLOCK_MONOTONIC);
    s as u64 * 1_000_000_000 + ns as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backwards() {
        let a = monotonic();
        let b = monotonic();
        assert!(b >= a);
        let a64 = monotonic64();
        let b64 = monotonic64();
        assert!(b64 >= a64);
    }
}
