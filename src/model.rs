use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Source tag for manually pinned candidates. Outranks every other signal.
pub const SOURCE_MANUAL: &str = "manual";

/// A peer under consideration for a funded channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelCandidate {
    /// Node public key (hex, compressed secp256k1). Stable identity.
    pub pubkey: String,
    /// Display alias, refreshed freely.
    #[serde(default)]
    pub alias: String,
    /// Discovery-origin tags. Never empty; accumulates across collectors.
    pub sources: BTreeSet<String>,
    /// First-seen timestamp. Immutable once set; re-discovery must not reset it.
    pub added_at: DateTime<Utc>,
    /// Public channel count from the graph.
    #[serde(default)]
    pub channels: u64,
    /// Total public capacity from the graph.
    #[serde(default)]
    pub capacity_sats: u64,
    /// Last graph update seen for this node.
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    /// Hop count from our own node, when a graph crawl computed one.
    #[serde(default)]
    pub distance: Option<u32>,
    /// Prior channel lifecycles with this peer, deduplicated by channel id.
    #[serde(default)]
    pub history: Vec<ChannelLifecycle>,
    /// Append-only rejection log. Never pruned.
    #[serde(default)]
    pub rejections: Vec<Rejection>,
    /// Learned channel-size floor. Monotonically non-decreasing: always the
    /// max `min_channel_size` across all min_channel_size rejections.
    #[serde(default)]
    pub min_channel_size: Option<u64>,
}

impl ChannelCandidate {
    pub fn new(pubkey: impl Into<String>, source: impl Into<String>) -> Self {
        let mut sources = BTreeSet::new();
        sources.insert(source.into());
        Self {
            pubkey: pubkey.into(),
            alias: String::new(),
            sources,
            added_at: Utc::now(),
            channels: 0,
            capacity_sats: 0,
            last_update: None,
            distance: None,
            history: Vec::new(),
            rejections: Vec::new(),
            min_channel_size: None,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.sources.contains(SOURCE_MANUAL)
    }

    /// Cumulative forwarding fees earned across all prior channels.
    pub fn fees_earned_msat(&self) -> u64 {
        self.history.iter().map(|h| h.fees_earned_msat).sum()
    }

    /// The smallest amount this peer can be funded at under current policy.
    pub fn effective_minimum(&self, default_size_sats: u64) -> u64 {
        self.min_channel_size.unwrap_or(0).max(default_size_sats)
    }

    /// Graph-centrality proxy used as a ranking signal.
    pub fn centrality(&self) -> u64 {
        self.capacity_sats.saturating_mul(self.channels)
    }
}

/// One prior channel lifecycle with a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelLifecycle {
    pub channel_id: String,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    pub capacity_sats: u64,
    #[serde(default)]
    pub fees_earned_msat: u64,
}

/// A recorded open failure. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub date: DateTime<Utc>,
    pub reason: RejectionReason,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub min_channel_size: Option<u64>,
}

impl Rejection {
    pub fn new(reason: RejectionReason) -> Self {
        Self {
            date: Utc::now(),
            reason,
            details: None,
            min_channel_size: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_min_channel_size(mut self, min: u64) -> Self {
        self.min_channel_size = Some(min);
        self
    }
}

/// Why a peer rejected (or failed) a channel open.
///
/// The retryability and cooldown of each reason are static policy for the
/// lifetime of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Peer wants a larger channel. Retry immediately with a bumped amount.
    MinChannelSize,
    /// Peer does not support anchor outputs.
    NoAnchors,
    /// Could not establish a transport connection.
    FailedToConnect,
    /// Peer appears offline.
    NotOnline,
    /// No known network address for the peer.
    NoAddress,
    /// Peer explicitly declined the channel.
    Rejected,
    /// Peer does not route.
    NoRouting,
    /// Peer enforces custom requirements we do not meet.
    CustomRequirements,
    /// Peer cooperatively closed on us before.
    CoopClose,
    /// Peer-side pending-channel limit hit. Transient.
    TooManyPending,
    /// The whole batch aborted for a reason not attributable to this peer.
    BatchFailed,
    /// Remote internal error.
    InternalError,
}

impl RejectionReason {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RejectionReason::MinChannelSize
                | RejectionReason::FailedToConnect
                | RejectionReason::NotOnline
                | RejectionReason::TooManyPending
                | RejectionReason::BatchFailed
                | RejectionReason::InternalError
        )
    }

    /// Cooldown before a retryable rejection stops blocking eligibility.
    /// None means retry immediately.
    pub fn cooldown(&self) -> Option<Duration> {
        match self {
            RejectionReason::FailedToConnect => Some(Duration::days(1)),
            RejectionReason::NotOnline => Some(Duration::days(7)),
            RejectionReason::TooManyPending => Some(Duration::days(1)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::MinChannelSize => "min_channel_size",
            RejectionReason::NoAnchors => "no_anchors",
            RejectionReason::FailedToConnect => "failed_to_connect",
            RejectionReason::NotOnline => "not_online",
            RejectionReason::NoAddress => "no_address",
            RejectionReason::Rejected => "rejected",
            RejectionReason::NoRouting => "no_routing",
            RejectionReason::CustomRequirements => "custom_requirements",
            RejectionReason::CoopClose => "coop_close",
            RejectionReason::TooManyPending => "too_many_pending",
            RejectionReason::BatchFailed => "batch_failed",
            RejectionReason::InternalError => "internal_error",
        }
    }
}

impl std::str::FromStr for RejectionReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min_channel_size" => Ok(RejectionReason::MinChannelSize),
            "no_anchors" => Ok(RejectionReason::NoAnchors),
            "failed_to_connect" => Ok(RejectionReason::FailedToConnect),
            "not_online" => Ok(RejectionReason::NotOnline),
            "no_address" => Ok(RejectionReason::NoAddress),
            "rejected" => Ok(RejectionReason::Rejected),
            "no_routing" => Ok(RejectionReason::NoRouting),
            "custom_requirements" => Ok(RejectionReason::CustomRequirements),
            "coop_close" => Ok(RejectionReason::CoopClose),
            "too_many_pending" => Ok(RejectionReason::TooManyPending),
            "batch_failed" => Ok(RejectionReason::BatchFailed),
            "internal_error" => Ok(RejectionReason::InternalError),
            other => anyhow::bail!("unknown rejection reason: {}", other),
        }
    }
}

/// A concrete spending plan produced by the allocation planner.
///
/// Accounting rule: `total_amount_sats` is the total budget consumed
/// including the per-channel anchor reserve, while each planned channel's
/// `amount_sats` is the funding amount only. The invariant
/// `total_amount_sats + remaining_budget_sats == budget_sats` holds at
/// creation and across all plan mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPlan {
    pub budget_sats: u64,
    pub default_size_sats: u64,
    pub max_size_sats: u64,
    pub channels: Vec<PlannedChannel>,
    pub total_amount_sats: u64,
    pub remaining_budget_sats: u64,
    pub created_at: DateTime<Utc>,
}

/// One channel in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedChannel {
    pub pubkey: String,
    pub alias: String,
    pub amount_sats: u64,
    /// True iff the amount was bumped above the default by a learned or
    /// declared minimum.
    pub minimum_enforced: bool,
}

/// Terminal outcome for one attempted peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenResult {
    pub pubkey: String,
    pub success: bool,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<RejectionReason>,
    #[serde(default)]
    pub detected_minimum: Option<u64>,
}

impl OpenResult {
    pub fn ok(pubkey: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            success: true,
            channel_id: Some(channel_id.into()),
            error: None,
            rejection_reason: None,
            detected_minimum: None,
        }
    }

    pub fn failed(
        pubkey: impl Into<String>,
        reason: RejectionReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            pubkey: pubkey.into(),
            success: false,
            channel_id: None,
            error: Some(error.into()),
            rejection_reason: Some(reason),
            detected_minimum: None,
        }
    }
}

/// Immutable audit record, one per execution attempt (including partial or
/// aborted ones).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenHistory {
    pub date: DateTime<Utc>,
    pub plan: OpenPlan,
    pub results: Vec<OpenResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_policy_table() {
        use RejectionReason::*;
        // Retryable
        for r in [MinChannelSize, FailedToConnect, NotOnline, TooManyPending, BatchFailed, InternalError] {
            assert!(r.is_retryable(), "{:?} should be retryable", r);
        }
        // Permanent
        for r in [NoAnchors, NoAddress, Rejected, NoRouting, CustomRequirements, CoopClose] {
            assert!(!r.is_retryable(), "{:?} should be permanent", r);
        }
        // Cooldowns
        assert_eq!(FailedToConnect.cooldown(), Some(Duration::days(1)));
        assert_eq!(NotOnline.cooldown(), Some(Duration::days(7)));
        assert_eq!(TooManyPending.cooldown(), Some(Duration::days(1)));
        assert_eq!(MinChannelSize.cooldown(), None);
        assert_eq!(BatchFailed.cooldown(), None);
    }

    #[test]
    fn test_reason_roundtrip() {
        use std::str::FromStr;
        for r in [
            RejectionReason::MinChannelSize,
            RejectionReason::NoAnchors,
            RejectionReason::FailedToConnect,
            RejectionReason::NotOnline,
            RejectionReason::NoAddress,
            RejectionReason::Rejected,
            RejectionReason::NoRouting,
            RejectionReason::CustomRequirements,
            RejectionReason::CoopClose,
            RejectionReason::TooManyPending,
            RejectionReason::BatchFailed,
            RejectionReason::InternalError,
        ] {
            assert_eq!(RejectionReason::from_str(r.as_str()).unwrap(), r);
        }
        assert!(RejectionReason::from_str("bogus").is_err());
    }

    #[test]
    fn test_effective_minimum() {
        let mut c = ChannelCandidate::new("02aa", "graph");
        assert_eq!(c.effective_minimum(100_000), 100_000);
        c.min_channel_size = Some(250_000);
        assert_eq!(c.effective_minimum(100_000), 250_000);
        c.min_channel_size = Some(50_000);
        assert_eq!(c.effective_minimum(100_000), 100_000);
    }

    #[test]
    fn test_fees_earned_sums_history() {
        let mut c = ChannelCandidate::new("02aa", "graph");
        assert_eq!(c.fees_earned_msat(), 0);
        c.history.push(ChannelLifecycle {
            channel_id: "a:0".to_string(),
            opened_at: Utc::now(),
            closed_at: None,
            capacity_sats: 1_000_000,
            fees_earned_msat: 1500,
        });
        c.history.push(ChannelLifecycle {
            channel_id: "b:1".to_string(),
            opened_at: Utc::now(),
            closed_at: Some(Utc::now()),
            capacity_sats: 500_000,
            fees_earned_msat: 500,
        });
        assert_eq!(c.fees_earned_msat(), 2000);
    }

    #[test]
    fn test_serde_snake_case_reason() {
        let json = serde_json::to_string(&RejectionReason::MinChannelSize).unwrap();
        assert_eq!(json, "\"min_channel_size\"");
        let back: RejectionReason = serde_json::from_str("\"too_many_pending\"").unwrap();
        assert_eq!(back, RejectionReason::TooManyPending);
    }
}
