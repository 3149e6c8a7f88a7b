use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds. Timestamps in stored
/// records (`createdOn`, `expires`, `last_access`, ...) all use this base.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A random alphanumeric string of `len` bytes, from the thread RNG.
/// Used for access tokens, device ids, salts, and UIA session ids.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_strings_have_requested_length() {
        assert_eq!(random_string(10).len(), 10);
        assert_eq!(random_string(64).len(), 64);
        assert_eq!(random_string(0).len(), 0);
    }

    #[test]
    fn random_strings_are_alphanumeric() {
        assert!(random_string(256).chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn random_strings_do_not_repeat() {
        assert_ne!(random_string(64), random_string(64));
    }

    #[test]
    fn now_ms_is_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: we are past 2020 and before 2100.
        assert!(a > 1_577_836_800_000);
        assert!(a < 4_102_444_800_000);
    }
}
