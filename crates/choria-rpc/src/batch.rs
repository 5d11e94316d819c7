//! Batch partitioning and pacing.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Splits `targets` into consecutive groups of at most `size` nodes.
///
/// A size of zero yields a single group holding every target. Groups are
/// disjoint and together hold every target exactly once, in order.
pub fn in_groups(targets: &[String], size: usize) -> Vec<Vec<String>> {
    if targets.is_empty() {
        return Vec::new();
    }

    if size == 0 {
        return vec![targets.to_vec()];
    }

    targets.chunks(size).map(|c| c.to_vec()).collect()
}

/// Sleeps for `duration` unless `token` is cancelled first.
///
/// Returns false when the sleep was interrupted.
pub async fn interruptible_sleep(token: &CancellationToken, duration: Duration) -> bool {
    if token.is_cancelled() {
        return false;
    }

    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
