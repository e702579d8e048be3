//! Replay detection.
//!
//! The log may deliver a committed entry more than once (restart,
//! re-application by a new leader). Every record carries the index of the
//! entry that last wrote it, so a record whose version is at or past the
//! incoming index already reflects that entry.

/// Whether applying the entry at `log_index` would repeat work already
/// reflected by a record last written at `stored_version`.
#[must_use]
pub const fn is_replay(stored_version: u64, log_index: u64) -> bool {
    stored_version >= log_index
}

/// Replay check against an optional stored version
#[must_use]
pub fn is_replay_of(stored_version: Option<u64>, log_index: u64) -> bool {
    stored_version.is_some_and(|v| is_replay(v, log_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_replay() {
        assert!(!is_replay(4, 5));
        assert!(is_replay(5, 5));
        assert!(is_replay(9, 5));
        assert!(!is_replay(0, 1));
    }

    #[test]
    fn test_is_replay_of_missing() {
        assert!(!is_replay_of(None, 1));
        assert!(is_replay_of(Some(7), 7));
        assert!(!is_replay_of(Some(6), 7));
    }
}
