pub mod funding;
pub mod verify;

use crate::classify::{parse_open_error, RemoteError};
use crate::client::{BatchOpenPeer, NodeClient, PendingChannel};
use crate::db::Database;
use crate::model::{OpenHistory, OpenPlan, OpenResult, Rejection, RejectionReason};
use crate::planner::create_plan;
use crate::store::{CandidateStore, HistoryStore};
use chrono::Utc;
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Hard cap on convergence iterations.
pub const MAX_ITERATIONS: usize = 5;

/// Synthetic channel id used for dry-run results.
const DRY_RUN_CHANNEL_ID: &str = "dry-run";

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub fee_rate_sat_per_vb: u64,
    pub dry_run: bool,
}

/// What the caller gets back: one terminal result per attempted peer,
/// plus the batch-level error on fatal paths.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<OpenResult>,
    pub fatal: Option<String>,
}

/// Drives a plan to completion against the node.
///
/// Owns the lifecycle of the in-flight plan: the convergence loop replaces
/// it wholesale on every iteration that records a failure, re-reading the
/// candidate store so freshly written rejections are observed and freed
/// budget backfills the next-best eligible candidates.
pub struct ExecutionEngine<'a> {
    client: Arc<dyn NodeClient>,
    db: &'a Database,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(client: Arc<dyn NodeClient>, db: &'a Database) -> Self {
        Self { client, db }
    }

    pub async fn execute_plan(
        &self,
        plan: OpenPlan,
        opts: &ExecuteOptions,
    ) -> anyhow::Result<BatchOutcome> {
        if opts.dry_run {
            info!(
                "Open: dry-run, synthesizing {} results without side effects",
                plan.channels.len()
            );
            let results = plan
                .channels
                .iter()
                .map(|c| OpenResult::ok(&c.pubkey, DRY_RUN_CHANNEL_ID))
                .collect();
            return Ok(BatchOutcome { results, fatal: None });
        }

        let store = CandidateStore::new(self.db);
        let history = HistoryStore::new(self.db);

        let mut plan = plan;
        let mut connected: HashSet<String> = HashSet::new();
        let mut failures: Vec<OpenResult> = Vec::new();
        let mut pending: Option<Vec<PendingChannel>> = None;

        for iteration in 1..=MAX_ITERATIONS {
            if plan.channels.is_empty() {
                info!("Open: no channels left to attempt");
                break;
            }
            info!(
                "Open: iteration {}/{}: {} channels, {} sat total",
                iteration,
                MAX_ITERATIONS,
                plan.channels.len(),
                plan.total_amount_sats
            );

            // VERIFY: probe connectivity for peers not already connected.
            let to_probe: Vec<String> = plan
                .channels
                .iter()
                .map(|c| c.pubkey.clone())
                .filter(|p| !connected.contains(p))
                .collect();
            let (now_connected, probe_failures) =
                verify::probe_connectivity(self.client.clone(), &to_probe).await;
            connected.extend(now_connected);

            if !probe_failures.is_empty() {
                for failure in &probe_failures {
                    warn!(
                        "Open: {} failed verification ({}): {}",
                        failure.pubkey,
                        failure.reason.as_str(),
                        failure.details
                    );
                    store.add_rejection(
                        &failure.pubkey,
                        &Rejection::new(failure.reason).with_details(&failure.details),
                    )?;
                    record_result(
                        &mut failures,
                        OpenResult::failed(&failure.pubkey, failure.reason, &failure.details),
                    );
                }
                plan = self.replan(&plan).await?;
                continue;
            }

            // INITIATE: one call for all verified peers, broadcast deferred.
            let peers: Vec<BatchOpenPeer> = plan
                .channels
                .iter()
                .map(|c| BatchOpenPeer {
                    pubkey: c.pubkey.clone(),
                    amount_sats: c.amount_sats,
                })
                .collect();
            match self.client.batch_open_channels(&peers).await {
                Ok(stubs) => {
                    pending = Some(stubs);
                    break;
                }
                Err(e) => {
                    let classified = parse_open_error(&RemoteError::from(&e));
                    let implicated = classified
                        .pubkey
                        .as_ref()
                        .filter(|pk| plan.channels.iter().any(|c| &&c.pubkey == pk))
                        .cloned();
                    match implicated {
                        Some(pubkey) => {
                            warn!(
                                "Open: initiation implicated {} ({}): {}",
                                pubkey,
                                classified.reason.as_str(),
                                classified.details
                            );
                            let mut rejection = Rejection::new(classified.reason)
                                .with_details(&classified.details);
                            if let Some(min) = classified.min_size {
                                rejection = rejection.with_min_channel_size(min);
                            }
                            store.add_rejection(&pubkey, &rejection)?;
                            let mut result = OpenResult::failed(
                                &pubkey,
                                classified.reason,
                                &classified.details,
                            );
                            result.detected_minimum = classified.min_size;
                            record_result(&mut failures, result);
                            plan = self.replan(&plan).await?;
                            continue;
                        }
                        None => {
                            // Not attributable to one peer; silently dropping
                            // arbitrary participants would be wrong. Abort.
                            error!("Open: batch initiation failed: {}", classified.details);
                            let mut results = failures;
                            for channel in &plan.channels {
                                record_result(
                                    &mut results,
                                    OpenResult::failed(
                                        &channel.pubkey,
                                        RejectionReason::BatchFailed,
                                        &classified.details,
                                    ),
                                );
                            }
                            history.append(&OpenHistory {
                                date: Utc::now(),
                                plan: plan.clone(),
                                results: results.clone(),
                            })?;
                            return Ok(BatchOutcome {
                                results,
                                fatal: Some(classified.details),
                            });
                        }
                    }
                }
            }
        }

        let Some(pending) = pending else {
            warn!("Open: convergence loop ended without a clean initiation");
            let outcome = BatchOutcome { results: failures, fatal: None };
            history.append(&OpenHistory {
                date: Utc::now(),
                plan: plan.clone(),
                results: outcome.results.clone(),
            })?;
            return Ok(outcome);
        };

        // Funding protocol: run exactly once, never retried mid-step.
        match funding::run(&self.client, &pending, opts.fee_rate_sat_per_vb).await {
            Ok(()) => {
                let mut results = failures;
                for stub in &pending {
                    record_result(&mut results, OpenResult::ok(&stub.pubkey, &stub.pending_id));
                }
                info!("Open: batch complete, {} channels funded", pending.len());
                history.append(&OpenHistory {
                    date: Utc::now(),
                    plan: plan.clone(),
                    results: results.clone(),
                })?;
                Ok(BatchOutcome { results, fatal: None })
            }
            Err(err @ (funding::FundingError::Fund(_) | funding::FundingError::Sign(_))) => {
                let msg = err.message().to_string();
                error!("Open: funding aborted before broadcast: {}", msg);
                funding::cancel_stubs(&self.client, &pending).await;
                let mut results = failures;
                for stub in &pending {
                    store.add_rejection(
                        &stub.pubkey,
                        &Rejection::new(RejectionReason::BatchFailed).with_details(&msg),
                    )?;
                    record_result(
                        &mut results,
                        OpenResult::failed(&stub.pubkey, RejectionReason::BatchFailed, &msg),
                    );
                }
                history.append(&OpenHistory {
                    date: Utc::now(),
                    plan: plan.clone(),
                    results: results.clone(),
                })?;
                Ok(BatchOutcome { results, fatal: Some(msg) })
            }
            Err(funding::FundingError::Broadcast(msg)) => {
                // Inconsistency window: the transaction may already be
                // on-chain even though the confirming call failed. Stubs are
                // not cancelled and no reconciliation is attempted.
                error!("Open: broadcast step failed: {}", msg);
                let mut results = failures;
                for stub in &pending {
                    record_result(
                        &mut results,
                        OpenResult::failed(&stub.pubkey, RejectionReason::InternalError, &msg),
                    );
                }
                history.append(&OpenHistory {
                    date: Utc::now(),
                    plan: plan.clone(),
                    results: results.clone(),
                })?;
                Ok(BatchOutcome { results, fatal: Some(msg) })
            }
        }
    }

    /// Rebuild the plan from the freshly reloaded candidate store, so the
    /// rejections written this iteration are observed and freed budget
    /// backfills the next-best eligible candidates.
    async fn replan(&self, plan: &OpenPlan) -> anyhow::Result<OpenPlan> {
        let store = CandidateStore::new(self.db);
        let candidates = store.load()?;
        let open_peers: HashSet<String> =
            self.client.get_open_channels().await?.into_iter().collect();
        let next = create_plan(
            plan.budget_sats,
            plan.default_size_sats,
            plan.max_size_sats,
            &candidates,
            &open_peers,
            Utc::now(),
        );
        info!(
            "Open: re-planned {} channels, {} sat remaining",
            next.channels.len(),
            next.remaining_budget_sats
        );
        Ok(next)
    }
}

/// Keep at most one terminal result per pubkey, latest wins. A peer that
/// failed an earlier iteration and then succeeded (or failed differently)
/// after a re-plan must not appear twice.
fn record_result(results: &mut Vec<OpenResult>, result: OpenResult) {
    results.retain(|r| r.pubkey != result.pubkey);
    results.push(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockNodeClient;
    use crate::eligibility::is_eligible;
    use crate::model::ChannelCandidate;
    use chrono::Duration;

    fn pk(n: u8) -> String {
        format!("02{:064x}", n)
    }

    fn opts() -> ExecuteOptions {
        ExecuteOptions { fee_rate_sat_per_vb: 2, dry_run: false }
    }

    /// Seed the store with candidates pk(1)..=pk(n), ranked in that order
    /// by recency of first sighting.
    fn seed_candidates(db: &Database, n: u8) {
        let store = CandidateStore::new(db);
        for i in 1..=n {
            let mut c = ChannelCandidate::new(pk(i), "graph");
            c.added_at = Utc::now() - Duration::days(i as i64);
            store.upsert(&c).unwrap();
        }
    }

    fn plan_from_store(db: &Database, budget: u64) -> OpenPlan {
        let candidates = CandidateStore::new(db).load().unwrap();
        create_plan(budget, 100_000, 1_000_000, &candidates, &HashSet::new(), Utc::now())
    }

    fn mock_with_peers(n: u8) -> MockNodeClient {
        let mut mock = MockNodeClient::new();
        for i in 1..=n {
            mock = mock.with_peer(&pk(i));
        }
        mock
    }

    #[tokio::test]
    async fn test_happy_path_batch() {
        let db = Database::open_in_memory().unwrap();
        seed_candidates(&db, 2);
        let plan = plan_from_store(&db, 205_000);
        assert_eq!(plan.channels.len(), 2);

        let mock = mock_with_peers(2);
        let finalize_calls = mock.finalize_calls.clone();
        let engine = ExecutionEngine::new(Arc::new(mock), &db);

        let outcome = engine.execute_plan(plan, &opts()).await.unwrap();
        assert!(outcome.fatal.is_none());
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| r.success));
        assert_eq!(finalize_calls.lock().unwrap().len(), 1);

        // Exactly one audit record
        assert_eq!(HistoryStore::new(&db).load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_verify_failure_replans_and_backfills() {
        let db = Database::open_in_memory().unwrap();
        seed_candidates(&db, 4);
        // Budget for exactly 3 channels; initial plan takes pk1..pk3.
        let plan = plan_from_store(&db, 307_500);
        let planned: Vec<String> = plan.channels.iter().map(|c| c.pubkey.clone()).collect();
        assert_eq!(planned, vec![pk(1), pk(2), pk(3)]);

        let mut mock = mock_with_peers(4);
        mock.connect_failures
            .insert(pk(2), "connection refused".to_string());
        let batch_open_calls = mock.batch_open_calls.clone();
        let engine = ExecutionEngine::new(Arc::new(mock), &db);

        let outcome = engine.execute_plan(plan, &opts()).await.unwrap();
        assert!(outcome.fatal.is_none());

        // pk2 failed terminally; pk4 backfilled the freed budget.
        let failed: Vec<&OpenResult> =
            outcome.results.iter().filter(|r| !r.success).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].pubkey, pk(2));
        assert_eq!(failed[0].rejection_reason, Some(RejectionReason::FailedToConnect));

        let succeeded: HashSet<String> = outcome
            .results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.pubkey.clone())
            .collect();
        assert_eq!(
            succeeded,
            [pk(1), pk(3), pk(4)].into_iter().collect::<HashSet<_>>()
        );

        // The rejection is persisted and cools pk2 down.
        let store = CandidateStore::new(&db);
        let rejected = store.get(&pk(2)).unwrap().unwrap();
        assert_eq!(rejected.rejections.len(), 1);
        assert!(!is_eligible(&rejected, &HashSet::new(), Utc::now()));
        // Cooldown window: still ineligible tomorrow minus a minute
        assert!(!is_eligible(
            &rejected,
            &HashSet::new(),
            Utc::now() + Duration::days(1) - Duration::minutes(1)
        ));

        // The single successful initiation covered the backfilled set.
        let calls = batch_open_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let attempted: HashSet<String> =
            calls[0].iter().map(|p| p.pubkey.clone()).collect();
        assert!(attempted.contains(&pk(4)));
        assert!(!attempted.contains(&pk(2)));
    }

    #[tokio::test]
    async fn test_initiate_min_size_bumps_and_retries() {
        let db = Database::open_in_memory().unwrap();
        seed_candidates(&db, 1);
        let plan = plan_from_store(&db, 600_000);
        assert_eq!(plan.channels[0].amount_sats, 100_000);

        let mock = mock_with_peers(1);
        mock.push_batch_open_error(&format!(
            "peer {} declined: chan size of 100000sat is below min chan size of 500000sat",
            pk(1)
        ));
        let batch_open_calls = mock.batch_open_calls.clone();
        let engine = ExecutionEngine::new(Arc::new(mock), &db);

        let outcome = engine.execute_plan(plan, &opts()).await.unwrap();
        assert!(outcome.fatal.is_none());
        assert_eq!(outcome.results.len(), 1);
        assert!(outcome.results[0].success, "{:?}", outcome.results[0]);

        // Learned minimum persisted, second attempt bumped.
        let store = CandidateStore::new(&db);
        assert_eq!(store.get(&pk(1)).unwrap().unwrap().min_channel_size, Some(500_000));
        let calls = batch_open_calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][0].amount_sats, 100_000);
        assert_eq!(calls[1][0].amount_sats, 500_000);
    }

    #[tokio::test]
    async fn test_initiate_non_attributable_is_fatal() {
        let db = Database::open_in_memory().unwrap();
        seed_candidates(&db, 2);
        let plan = plan_from_store(&db, 205_000);

        let mock = mock_with_peers(2);
        mock.push_batch_open_error("insufficient funds for batch transaction");
        let fund_calls = mock.fund_calls.clone();
        let engine = ExecutionEngine::new(Arc::new(mock), &db);

        let outcome = engine.execute_plan(plan, &opts()).await.unwrap();
        assert!(outcome.fatal.is_some());
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| !r.success));
        assert!(outcome
            .results
            .iter()
            .all(|r| r.rejection_reason == Some(RejectionReason::BatchFailed)));

        // No funding transaction was built; audit record still written.
        assert!(fund_calls.lock().unwrap().is_empty());
        assert_eq!(HistoryStore::new(&db).load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fund_failure_cancels_stubs() {
        let db = Database::open_in_memory().unwrap();
        seed_candidates(&db, 2);
        let plan = plan_from_store(&db, 205_000);

        let mut mock = mock_with_peers(2);
        mock.fund_error = Some("wallet has insufficient confirmed funds".to_string());
        let cancel_calls = mock.cancel_calls.clone();
        let engine = ExecutionEngine::new(Arc::new(mock), &db);

        let outcome = engine.execute_plan(plan, &opts()).await.unwrap();
        assert!(outcome.fatal.is_some());
        assert!(outcome.results.iter().all(|r| !r.success));
        assert_eq!(cancel_calls.lock().unwrap().len(), 2);

        // Participants stay retryable via batch_failed rejections.
        let store = CandidateStore::new(&db);
        let c = store.get(&pk(1)).unwrap().unwrap();
        assert_eq!(c.rejections[0].reason, RejectionReason::BatchFailed);
        assert!(is_eligible(&c, &HashSet::new(), Utc::now()));
    }

    #[tokio::test]
    async fn test_broadcast_failure_marks_failed_without_cancel() {
        let db = Database::open_in_memory().unwrap();
        seed_candidates(&db, 1);
        let plan = plan_from_store(&db, 150_000);

        let mut mock = mock_with_peers(1);
        mock.finalize_error = Some("rpc connection lost during finalize".to_string());
        let cancel_calls = mock.cancel_calls.clone();
        let engine = ExecutionEngine::new(Arc::new(mock), &db);

        let outcome = engine.execute_plan(plan, &opts()).await.unwrap();
        assert!(outcome.fatal.is_some());
        assert_eq!(
            outcome.results[0].rejection_reason,
            Some(RejectionReason::InternalError)
        );
        // The transaction may already be on-chain, so stubs are left alone.
        // (No reconciliation is attempted either; the true outcome stays
        // ambiguous by design of the current protocol.)
        assert!(cancel_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_no_side_effects() {
        let db = Database::open_in_memory().unwrap();
        seed_candidates(&db, 2);
        let plan = plan_from_store(&db, 205_000);

        let mock = mock_with_peers(2);
        let connect_calls = mock.connect_calls.clone();
        let batch_open_calls = mock.batch_open_calls.clone();
        let engine = ExecutionEngine::new(Arc::new(mock), &db);

        let outcome = engine
            .execute_plan(plan, &ExecuteOptions { fee_rate_sat_per_vb: 2, dry_run: true })
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| r.success));
        assert!(outcome
            .results
            .iter()
            .all(|r| r.channel_id.as_deref() == Some(DRY_RUN_CHANNEL_ID)));

        // Zero network calls, zero store writes
        assert!(connect_calls.lock().unwrap().is_empty());
        assert!(batch_open_calls.lock().unwrap().is_empty());
        assert!(HistoryStore::new(&db).load().unwrap().is_empty());
        let rejections: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM rejections", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rejections, 0);
    }

    #[tokio::test]
    async fn test_iteration_cap_stops_convergence() {
        let db = Database::open_in_memory().unwrap();
        seed_candidates(&db, 1);
        let plan = plan_from_store(&db, 150_000);

        let mock = mock_with_peers(1);
        // internal_error has no cooldown, so the peer re-enters every
        // re-plan until the cap trips.
        for _ in 0..MAX_ITERATIONS {
            mock.push_batch_open_error(&format!("remote canceled funding: peer {}", pk(1)));
        }
        let batch_open_calls = mock.batch_open_calls.clone();
        let fund_calls = mock.fund_calls.clone();
        let engine = ExecutionEngine::new(Arc::new(mock), &db);

        let outcome = engine.execute_plan(plan, &opts()).await.unwrap();
        assert!(outcome.fatal.is_none());
        assert_eq!(outcome.results.len(), 1);
        assert!(!outcome.results[0].success);
        assert_eq!(
            outcome.results[0].rejection_reason,
            Some(RejectionReason::InternalError)
        );
        assert_eq!(batch_open_calls.lock().unwrap().len(), MAX_ITERATIONS);
        // No funding transaction was ever built
        assert!(fund_calls.lock().unwrap().is_empty());
        assert_eq!(HistoryStore::new(&db).load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_plan_short_circuits() {
        let db = Database::open_in_memory().unwrap();
        let plan = plan_from_store(&db, 500_000);
        assert!(plan.channels.is_empty());

        let mock = MockNodeClient::new();
        let batch_open_calls = mock.batch_open_calls.clone();
        let engine = ExecutionEngine::new(Arc::new(mock), &db);

        let outcome = engine.execute_plan(plan, &opts()).await.unwrap();
        assert!(outcome.results.is_empty());
        assert!(outcome.fatal.is_none());
        assert!(batch_open_calls.lock().unwrap().is_empty());
    }
}
