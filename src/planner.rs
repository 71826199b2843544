use crate::eligibility::is_eligible;
use crate::model::{ChannelCandidate, OpenPlan, PlannedChannel};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Fixed per-channel surcharge reserved on top of the funding amount to
/// cover on-chain anchor reserve requirements.
pub const ANCHOR_RESERVE_SATS: u64 = 2500;

/// Errors from plan mutation operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("no candidate with pubkey {0}")]
    CandidateNotFound(String),
    #[error("index {index} out of range (plan has {len} channels)")]
    InvalidIndex { index: usize, len: usize },
    #[error("amount {required_sats} sat exceeds remaining budget {remaining_sats} sat")]
    InsufficientBudget { required_sats: u64, remaining_sats: u64 },
}

/// Build a spending plan: filter to eligible and fundable candidates, rank
/// them by signal quality, then greedily pack the budget.
///
/// The walk skips candidates that no longer fit instead of terminating, so
/// a smaller candidate further down the ranking can still be funded. It
/// stops entirely once the remainder cannot cover even a default-sized
/// channel plus its reserve.
///
/// This is deliberately not a knapsack solver: funding the best-ranked
/// peers matters more than consuming the last satoshi.
pub fn create_plan(
    budget_sats: u64,
    default_size_sats: u64,
    max_size_sats: u64,
    candidates: &[ChannelCandidate],
    open_peer_pubkeys: &HashSet<String>,
    now: DateTime<Utc>,
) -> OpenPlan {
    let mut fundable: Vec<&ChannelCandidate> = candidates
        .iter()
        .filter(|c| is_eligible(c, open_peer_pubkeys, now))
        .filter(|c| c.effective_minimum(default_size_sats) <= max_size_sats)
        .collect();

    fundable.sort_by(|a, b| compare_signal(b, a));

    let mut channels = Vec::new();
    let mut remaining = budget_sats;

    for candidate in fundable {
        let amount = candidate.effective_minimum(default_size_sats);
        let required = amount + ANCHOR_RESERVE_SATS;
        if required > remaining {
            continue;
        }
        channels.push(PlannedChannel {
            pubkey: candidate.pubkey.clone(),
            alias: candidate.alias.clone(),
            amount_sats: amount,
            minimum_enforced: amount > default_size_sats,
        });
        remaining -= required;
        if remaining < default_size_sats + ANCHOR_RESERVE_SATS {
            break;
        }
    }

    OpenPlan {
        budget_sats,
        default_size_sats,
        max_size_sats,
        channels,
        total_amount_sats: budget_sats - remaining,
        remaining_budget_sats: remaining,
        created_at: now,
    }
}

/// Signal-quality total order: manual tag, then cumulative fees earned,
/// then number of distinct discovery sources, then graph centrality, then
/// recency of first sighting as the final tie-break.
fn compare_signal(a: &ChannelCandidate, b: &ChannelCandidate) -> Ordering {
    a.is_manual()
        .cmp(&b.is_manual())
        .then_with(|| a.fees_earned_msat().cmp(&b.fees_earned_msat()))
        .then_with(|| a.sources.len().cmp(&b.sources.len()))
        .then_with(|| a.centrality().cmp(&b.centrality()))
        .then_with(|| a.added_at.cmp(&b.added_at))
}

/// Add a channel to an existing plan. The default amount is the candidate's
/// effective minimum. Used during interactive adjustment, not the
/// convergence loop.
pub fn add_to_plan(
    plan: &mut OpenPlan,
    candidates: &[ChannelCandidate],
    pubkey: &str,
    amount_sats: Option<u64>,
) -> Result<(), PlanError> {
    let candidate = candidates
        .iter()
        .find(|c| c.pubkey == pubkey)
        .ok_or_else(|| PlanError::CandidateNotFound(pubkey.to_string()))?;

    let amount = amount_sats.unwrap_or_else(|| candidate.effective_minimum(plan.default_size_sats));
    let required = amount + ANCHOR_RESERVE_SATS;
    if required > plan.remaining_budget_sats {
        return Err(PlanError::InsufficientBudget {
            required_sats: required,
            remaining_sats: plan.remaining_budget_sats,
        });
    }

    plan.channels.push(PlannedChannel {
        pubkey: candidate.pubkey.clone(),
        alias: candidate.alias.clone(),
        amount_sats: amount,
        minimum_enforced: amount > plan.default_size_sats,
    });
    plan.remaining_budget_sats -= required;
    plan.total_amount_sats += required;
    Ok(())
}

/// Remove a channel by index, refunding its amount and reserve.
pub fn remove_from_plan(plan: &mut OpenPlan, index: usize) -> Result<PlannedChannel, PlanError> {
    if index >= plan.channels.len() {
        return Err(PlanError::InvalidIndex {
            index,
            len: plan.channels.len(),
        });
    }
    let removed = plan.channels.remove(index);
    let refund = removed.amount_sats + ANCHOR_RESERVE_SATS;
    plan.remaining_budget_sats += refund;
    plan.total_amount_sats -= refund;
    Ok(removed)
}

/// Change the amount of a planned channel. The reserve is unchanged since
/// the channel count is unchanged.
pub fn resize_in_plan(plan: &mut OpenPlan, index: usize, new_amount_sats: u64) -> Result<(), PlanError> {
    if index >= plan.channels.len() {
        return Err(PlanError::InvalidIndex {
            index,
            len: plan.channels.len(),
        });
    }
    let current = plan.channels[index].amount_sats;
    if new_amount_sats > current {
        let delta = new_amount_sats - current;
        if delta > plan.remaining_budget_sats {
            return Err(PlanError::InsufficientBudget {
                required_sats: delta,
                remaining_sats: plan.remaining_budget_sats,
            });
        }
        plan.remaining_budget_sats -= delta;
        plan.total_amount_sats += delta;
    } else {
        let delta = current - new_amount_sats;
        plan.remaining_budget_sats += delta;
        plan.total_amount_sats -= delta;
    }
    let ch = &mut plan.channels[index];
    ch.amount_sats = new_amount_sats;
    ch.minimum_enforced = new_amount_sats > plan.default_size_sats;
    Ok(())
}
