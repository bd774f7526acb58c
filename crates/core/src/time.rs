//! Wall-clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since the Unix epoch.
///
/// A clock set before 1970 reads as zero, which every expiry check treats as
/// "already expired".
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
