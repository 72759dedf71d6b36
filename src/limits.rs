/// Group synchronization guardrails.
///
/// These constants bound membership growth, transfer sizes, and retry
/// behavior so a misbehaving server or a very large group cannot pin the
/// client's resources.

use std::time::Duration;

/// Hard cap on full + invited members per group. Checked before any network
/// call when building an outgoing change.
pub const MAX_GROUP_SIZE_HARD_LIMIT: usize = 1001;

/// Soft cap at which the UI should start warning about group size.
pub const MAX_GROUP_SIZE_RECOMMENDED: usize = 151;

/// Max entries in the banned-member list. Adding bans beyond this evicts the
/// least-recently banned entries.
pub const MAX_BANNED_MEMBERS: usize = 100;

/// Max plaintext title length in bytes.
pub const MAX_TITLE_BYTES: usize = 1024;

/// Max plaintext description length in bytes.
pub const MAX_DESCRIPTION_BYTES: usize = 8192;

/// Max encrypted avatar size accepted for download or upload.
pub const MAX_AVATAR_BYTES: usize = 3 * 1024 * 1024;

/// Concurrent avatar transfers, process-wide.
pub const MAX_CONCURRENT_AVATAR_TRANSFERS: usize = 3;

/// Attempts per service request on retryable failures (network, 401).
pub const SERVICE_REQUEST_RETRIES: u32 = 3;

/// Base delay for exponential backoff between service request attempts.
pub const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Ceiling for a single backoff delay.
pub const BACKOFF_MAX: Duration = Duration::from_secs(8);

/// Domain-level timeout wrapping a whole update or refresh attempt.
/// Distinct from any transport-level timeout.
pub const GROUP_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum interval between successful throttled refreshes of one group.
pub const REFRESH_THROTTLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A group not refreshed for this long is a candidate for opportunistic
/// background refresh.
pub const AUTO_REFRESH_MAX_AGE_MS: i64 = 7 * 24 * 3600 * 1000;

/// Capacity of the process-wide decrypted-field cache.
pub const DECRYPT_CACHE_CAPACITY: usize = 10_000;

/// Capacity of the invite-link preview cache.
pub const PREVIEW_CACHE_CAPACITY: usize = 32;

/// Capacity of the per-group last-successful-refresh map.
pub const LAST_REFRESH_CACHE_CAPACITY: usize = 256;

/// Capacity of the fetched-change-page cache.
pub const CHANGE_PAGE_CACHE_CAPACITY: usize = 5;

/// Group size status for a proposed membership count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSizeStatus {
    /// Under the recommended cap.
    Ok,
    /// Over the recommended cap but still accepted.
    OverRecommended,
    /// Over the hard cap; the change must be rejected.
    OverHardLimit,
}

/// Check a proposed full-or-invited member count against the caps.
pub fn check_group_size(member_count: usize) -> GroupSizeStatus {
    if member_count > MAX_GROUP_SIZE_HARD_LIMIT {
        GroupSizeStatus::OverHardLimit
    } else if member_count > MAX_GROUP_SIZE_RECOMMENDED {
        GroupSizeStatus::OverRecommended
    } else {
        GroupSizeStatus::Ok
    }
}

/// Backoff delay for the given zero-based attempt index.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shifted = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(8));
    shifted.min(BACKOFF_MAX)
}
