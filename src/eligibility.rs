use crate::model::ChannelCandidate;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Decide whether a candidate may be funded right now.
///
/// A peer with an active or pending channel is never eligible, regardless
/// of its rejection history. Otherwise every recorded rejection must be
/// retryable and, when its reason defines a cooldown, the cooldown must
/// have elapsed. A single permanently-blocking or still-cooling rejection
/// disqualifies the candidate.
///
/// Pure function; callable concurrently.
pub fn is_eligible(
    candidate: &ChannelCandidate,
    open_peer_pubkeys: &HashSet<String>,
    now: DateTime<Utc>,
) -> bool {
    if open_peer_pubkeys.contains(&candidate.pubkey) {
        return false;
    }

    candidate.rejections.iter().all(|rej| {
        if !rej.reason.is_retryable() {
            return false;
        }
        match rej.reason.cooldown() {
            Some(cooldown) => now - rej.date >= cooldown,
            None => true,
        }
    })
}
