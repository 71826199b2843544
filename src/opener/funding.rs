use crate::client::{NodeClient, PendingChannel, TxOutput};
use log::{info, warn};
use std::sync::Arc;

/// Where the funding protocol failed. The engine maps this to per-attempt
/// results and cleanup policy.
#[derive(Debug)]
pub enum FundingError {
    /// Building the funding transaction failed. Stubs are still cancellable.
    Fund(String),
    /// Signing failed. Stubs are still cancellable.
    Sign(String),
    /// Finalize/broadcast failed. The transaction may or may not be
    /// on-chain; stubs must not be cancelled.
    Broadcast(String),
}

impl FundingError {
    pub fn message(&self) -> &str {
        match self {
            FundingError::Fund(m) | FundingError::Sign(m) | FundingError::Broadcast(m) => m,
        }
    }
}

/// Run the funding protocol exactly once: build one transaction paying
/// every pending channel's funding address, sign it, attach it to the
/// pending channels, and broadcast if the transport handed back a raw
/// transaction. No step is retried.
pub async fn run(
    client: &Arc<dyn NodeClient>,
    pending: &[PendingChannel],
    fee_rate_sat_per_vb: u64,
) -> Result<(), FundingError> {
    let outputs: Vec<TxOutput> = pending
        .iter()
        .map(|p| TxOutput {
            address: p.funding_address.clone(),
            amount_sats: p.amount_sats,
        })
        .collect();

    info!(
        "Funding: building transaction with {} outputs at {} sat/vB",
        outputs.len(),
        fee_rate_sat_per_vb
    );
    let unsigned_psbt = client
        .fund_transaction(&outputs, fee_rate_sat_per_vb)
        .await
        .map_err(|e| FundingError::Fund(format!("{:#}", e)))?;

    let signed = client
        .sign_transaction(&unsigned_psbt)
        .await
        .map_err(|e| FundingError::Sign(format!("{:#}", e)))?;

    let pending_ids: Vec<String> = pending.iter().map(|p| p.pending_id.clone()).collect();
    client
        .finalize_pending_channels(&pending_ids, &signed.signed_psbt)
        .await
        .map_err(|e| FundingError::Broadcast(format!("{:#}", e)))?;

    // Some transports require an explicit publish when broadcast was
    // deferred at initiation.
    if let Some(raw_tx) = &signed.raw_tx {
        client
            .broadcast_transaction(raw_tx)
            .await
            .map_err(|e| FundingError::Broadcast(format!("{:#}", e)))?;
    }

    info!("Funding: transaction broadcast for {} channels", pending.len());
    Ok(())
}

/// Best-effort cancellation of pending channel stubs. Individual cancel
/// failures are swallowed: a stub without funding has no on-chain
/// footprint, so an orphaned one costs nothing.
pub async fn cancel_stubs(client: &Arc<dyn NodeClient>, pending: &[PendingChannel]) {
    for stub in pending {
        match client.cancel_pending_channel(&stub.pending_id).await {
            Ok(()) => info!("Cancelled pending channel {}", stub.pending_id),
            Err(e) => warn!(
                "Failed to cancel pending channel {} (orphaned): {:#}",
                stub.pending_id, e
            ),
        }
    }
}
