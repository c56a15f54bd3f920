/// Matured-Block Event Persister
///
/// Bridges the P2P layer's stream of matured counter-chain deposit batches
/// into the store. A batch is only recorded when its height matches the
/// store's cursor; batches ahead of the cursor trigger a re-request of the
/// missing heights, rate-limited per height so a chatty peer cannot make
/// us spam the network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::extractor::Deposit;
use crate::store::CrossChainTransferStore;

/// One batch of deposits that matured at a single counter-chain height.
#[derive(Debug, Clone)]
pub struct MaturedBlockDeposits {
    pub block_height: i32,
    pub deposits: Vec<Deposit>,
}

/// Seam to the P2P layer: ask peers for matured blocks from a height on.
pub trait MaturedBlockRequester: Send + Sync {
    fn request_blocks(&self, from_height: i32);
}

const REREQUEST_INTERVAL: Duration = Duration::from_secs(30);

pub struct MaturedBlockPersister {
    store: Arc<CrossChainTransferStore>,
    requester: Arc<dyn MaturedBlockRequester>,
    receiver: mpsc::Receiver<MaturedBlockDeposits>,
    last_request: HashMap<i32, Instant>,
}

impl MaturedBlockPersister {
    pub fn new(
        store: Arc<CrossChainTransferStore>,
        requester: Arc<dyn MaturedBlockRequester>,
        receiver: mpsc::Receiver<MaturedBlockDeposits>,
    ) -> Self {
        Self {
            store,
            requester,
            receiver,
            last_request: HashMap::new(),
        }
    }

    /// Drain the stream until the sender side closes.
    pub async fn run(mut self) {
        while let Some(batch) = self.receiver.recv().await {
            if let Err(e) = self.handle(batch).await {
                warn!(error = %e, "Failed to persist matured deposits");
            }
        }
        debug!("Matured block stream closed");
    }

    async fn handle(
        &mut self,
        batch: MaturedBlockDeposits,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let expected = self.store.next_matured_block_height().await;

        if batch.block_height < expected {
            debug!(
                height = batch.block_height,
                expected, "Stale matured batch ignored"
            );
            return Ok(());
        }

        if batch.block_height > expected {
            // A gap: we missed at least one height. Ask for it again,
            // but at most once per 30 seconds per height.
            self.maybe_request(expected);
            return Ok(());
        }

        info!(
            height = batch.block_height,
            deposits = batch.deposits.len(),
            "Recording matured deposits"
        );
        self.store
            .record_latest_mature_deposits(&batch.deposits)
            .await?;

        // Retry heights stuck behind a suspension as soon as the next
        // batch can be served.
        self.maybe_request(self.store.next_matured_block_height().await);
        Ok(())
    }

    fn maybe_request(&mut self, from_height: i32) {
        if mark_request_due(&mut self.last_request, from_height, Instant::now()) {
            self.requester.request_blocks(from_height);
        }
    }
}

/// True when a request for this height is due; records the attempt and
/// prunes entries old enough to never suppress anything again.
fn mark_request_due(last_request: &mut HashMap<i32, Instant>, height: i32, now: Instant) -> bool {
    let due = last_request
        .get(&height)
        .map(|at| now.duration_since(*at) >= REREQUEST_INTERVAL)
        .unwrap_or(true);
    if due {
        last_request.insert(height, now);
        last_request.retain(|_, at| now.duration_since(*at) < 2 * REREQUEST_INTERVAL);
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rerequest_is_rate_limited_per_height() {
        let mut last_request: HashMap<i32, Instant> = HashMap::new();
        let start = Instant::now();

        assert!(mark_request_due(&mut last_request, 5, start));
        assert!(!mark_request_due(&mut last_request, 5, start));
        assert!(mark_request_due(&mut last_request, 6, start));
    }

    #[test]
    fn rerequest_allowed_again_after_interval() {
        let mut last_request: HashMap<i32, Instant> = HashMap::new();
        let start = Instant::now();

        assert!(mark_request_due(&mut last_request, 5, start));
        assert!(!mark_request_due(&mut last_request, 5, start + Duration::from_secs(10)));
        assert!(mark_request_due(&mut last_request, 5, start + REREQUEST_INTERVAL));
    }
}
