//! Microsecond clock used to stamp leaf and buffer updates.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the unix epoch.
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_micros() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic_enough() {
        let first = now_us();
        let second = now_us();
        assert!(second >= first);
        assert!(first > 1_500_000_000_000_000); // past 2017, sanity
    }
}
