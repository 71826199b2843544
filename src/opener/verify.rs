use crate::client::NodeClient;
use crate::model::RejectionReason;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Probes run concurrently within a batch of this size; batches run
/// sequentially. Bounds simultaneous outbound attempts through a possibly
/// rate-limited transport such as Tor.
pub const VERIFY_BATCH_SIZE: usize = 3;

/// Per-address connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A failed connectivity probe, ready to be recorded as a rejection.
#[derive(Debug, Clone)]
pub struct ProbeFailure {
    pub pubkey: String,
    pub reason: RejectionReason,
    pub details: String,
}

/// Probe connectivity to every listed peer. Returns the pubkeys that
/// connected and the failures for everyone else.
pub async fn probe_connectivity(
    client: Arc<dyn NodeClient>,
    pubkeys: &[String],
) -> (Vec<String>, Vec<ProbeFailure>) {
    let mut connected = Vec::new();
    let mut failures = Vec::new();

    for batch in pubkeys.chunks(VERIFY_BATCH_SIZE) {
        debug!("Verify: probing batch of {}", batch.len());
        let handles: Vec<_> = batch
            .iter()
            .map(|pubkey| {
                let client = client.clone();
                let pubkey = pubkey.clone();
                tokio::spawn(async move { probe_one(client, pubkey).await })
            })
            .collect();

        for handle in handles {
            match handle.await {
                Ok(Ok(pubkey)) => connected.push(pubkey),
                Ok(Err(failure)) => failures.push(failure),
                Err(e) => warn!("Verify: probe task failed: {}", e),
            }
        }
    }

    (connected, failures)
}

/// Probe one peer: look up its addresses, then try each sequentially until
/// one connects.
async fn probe_one(client: Arc<dyn NodeClient>, pubkey: String) -> Result<String, ProbeFailure> {
    let addresses = match client.get_node_addresses(&pubkey).await {
        Ok(addrs) => addrs,
        Err(e) => {
            return Err(ProbeFailure {
                pubkey,
                reason: RejectionReason::NotOnline,
                details: format!("address lookup failed: {:#}", e),
            });
        }
    };

    if addresses.is_empty() {
        return Err(ProbeFailure {
            pubkey,
            reason: RejectionReason::NoAddress,
            details: "no known network addresses".to_string(),
        });
    }

    let mut last_error = String::new();
    for address in &addresses {
        match timeout(CONNECT_TIMEOUT, client.connect_peer(&pubkey, address)).await {
            Ok(Ok(())) => {
                info!("Verify: connected to {} at {}", pubkey, address);
                return Ok(pubkey);
            }
            Ok(Err(e)) => {
                debug!("Verify: connect to {} at {} failed: {:#}", pubkey, address, e);
                last_error = format!("{}: {:#}", address, e);
            }
            Err(_) => {
                debug!("Verify: connect to {} at {} timed out", pubkey, address);
                last_error = format!("{}: connect timed out", address);
            }
        }
    }

    Err(ProbeFailure {
        pubkey,
        reason: RejectionReason::FailedToConnect,
        details: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockNodeClient;

    fn pk(n: u8) -> String {
        format!("02{:064x}", n)
    }

    #[tokio::test]
    async fn test_all_connect() {
        let mock = MockNodeClient::new().with_peer(&pk(1)).with_peer(&pk(2));
        let connect_calls = mock.connect_calls.clone();
        let client: Arc<dyn NodeClient> = Arc::new(mock);

        let (connected, failures) = probe_connectivity(client, &[pk(1), pk(2)]).await;
        assert_eq!(connected.len(), 2);
        assert!(failures.is_empty());
        assert_eq!(connect_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_node_is_not_online() {
        // No address entry: the graph lookup itself errors.
        let client: Arc<dyn NodeClient> = Arc::new(MockNodeClient::new());
        let (connected, failures) = probe_connectivity(client, &[pk(1)]).await;
        assert!(connected.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].reason, RejectionReason::NotOnline);
    }

    #[tokio::test]
    async fn test_empty_address_list_is_no_address() {
        let mut mock = MockNodeClient::new();
        mock.addresses.insert(pk(1), Vec::new());
        let client: Arc<dyn NodeClient> = Arc::new(mock);

        let (_, failures) = probe_connectivity(client, &[pk(1)]).await;
        assert_eq!(failures[0].reason, RejectionReason::NoAddress);
    }

    #[tokio::test]
    async fn test_connect_refused_is_failed_to_connect() {
        let mut mock = MockNodeClient::new().with_peer(&pk(1));
        mock.connect_failures
            .insert(pk(1), "connection refused".to_string());
        let client: Arc<dyn NodeClient> = Arc::new(mock);

        let (_, failures) = probe_connectivity(client, &[pk(1)]).await;
        assert_eq!(failures[0].reason, RejectionReason::FailedToConnect);
        assert!(failures[0].details.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_tries_addresses_sequentially_until_success() {
        // Two addresses; the mock succeeds on any, so exactly one attempt
        // should be made.
        let mut mock = MockNodeClient::new();
        mock.addresses.insert(
            pk(1),
            vec!["a.onion:9735".to_string(), "b.onion:9735".to_string()],
        );
        let connect_calls = mock.connect_calls.clone();
        let client: Arc<dyn NodeClient> = Arc::new(mock);

        let (connected, _) = probe_connectivity(client, &[pk(1)]).await;
        assert_eq!(connected, vec![pk(1)]);
        let calls = connect_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "a.onion:9735");
    }

    #[tokio::test]
    async fn test_large_set_probed_in_batches() {
        let mut mock = MockNodeClient::new();
        let pubkeys: Vec<String> = (1..=7).map(pk).collect();
        for p in &pubkeys {
            mock.addresses
                .insert(p.clone(), vec![format!("{}.onion:9735", &p[..8])]);
        }
        let client: Arc<dyn NodeClient> = Arc::new(mock);

        let (connected, failures) = probe_connectivity(client, &pubkeys).await;
        assert_eq!(connected.len(), 7);
        assert!(failures.is_empty());
    }
}
