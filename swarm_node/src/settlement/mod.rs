// Settlement module for the Swarm node
//
// Debts above the early payment threshold are paid off by a single worker
// task reading a bounded queue fed by accounting. The worker first asks the
// refresher (pseudosettle) to cancel as much debt as the time allowance
// permits, then pays what is left through the settlement capability and
// reports completion back to accounting, which clears the single-flight flag.

use crate::accounting::{Accounting, SettlementRequest};
use crate::error::{NodeError, Result};
use crate::types::Address;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod pseudosettle;

pub use pseudosettle::Pseudosettle;

/// Out-of-band payment capability
#[async_trait]
pub trait Settlement: Send + Sync {
    /// Pay `amount` to `peer`
    async fn pay(&self, peer: &Address, amount: u64) -> Result<()>;
}

/// In-band debt cancellation capability
#[async_trait]
pub trait Refresher: Send + Sync {
    /// Ask `peer` to cancel up to `amount` of our debt; returns what it accepted
    async fn refresh(&self, peer: &Address, amount: u64) -> Result<u64>;
}

/// Ledgers of the nodes in one process, used for in-process payments
#[derive(Default)]
pub struct SettlementDirectory {
    ledgers: DashMap<Address, Weak<Accounting>>,
}

impl SettlementDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a node's ledger reachable for payments
    pub fn register(&self, overlay: Address, accounting: &Arc<Accounting>) {
        self.ledgers.insert(overlay, Arc::downgrade(accounting));
    }

    fn ledger(&self, overlay: &Address) -> Option<Arc<Accounting>> {
        self.ledgers.get(overlay).and_then(|l| l.upgrade())
    }
}

/// Settlement delivering payments straight into the payee's ledger
pub struct InProcessSettlement {
    overlay: Address,
    directory: Arc<SettlementDirectory>,
}

impl InProcessSettlement {
    pub fn new(overlay: Address, directory: Arc<SettlementDirectory>) -> Self {
        Self { overlay, directory }
    }
}

#[async_trait]
impl Settlement for InProcessSettlement {
    async fn pay(&self, peer: &Address, amount: u64) -> Result<()> {
        let ledger = self
            .directory
            .ledger(peer)
            .ok_or_else(|| NodeError::Settlement(format!("no ledger for {}", peer)))?;
        ledger.notify_payment_received(&self.overlay, amount);
        Ok(())
    }
}

/// Handle of the settlement worker task
pub struct SettlementWorker {
    handle: JoinHandle<()>,
}

impl SettlementWorker {
    /// Start the worker and route accounting's settlement requests to it
    pub fn spawn(
        accounting: Arc<Accounting>,
        refresher: Option<Arc<dyn Refresher>>,
        settlement: Option<Arc<dyn Settlement>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel(accounting.config().settlement_queue_size);
        accounting.set_settlement_queue(tx);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = rx.recv() => match request {
                        Some(request) => {
                            settle(&accounting, refresher.as_deref(), settlement.as_deref(), request).await;
                        }
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("settlement worker stopped");
        });

        Self { handle }
    }

    /// Wait for the worker to exit
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

/// Pay off our debt to one peer
pub async fn settle(
    accounting: &Accounting,
    refresher: Option<&dyn Refresher>,
    settlement: Option<&dyn Settlement>,
    request: SettlementRequest,
) {
    let peer = request.peer;
    let mut result: Result<()> = Ok(());
    let mut paid = 0;

    if let Some(refresher) = refresher {
        let debt = accounting.debt(&peer);
        if debt > 0 {
            match refresher.refresh(&peer, debt).await {
                Ok(accepted) => debug!(peer = %peer, debt, accepted, "refreshment accepted"),
                Err(e) => debug!(peer = %peer, error = %e, "refreshment failed"),
            }
        }
    }

    let threshold = accounting
        .peer_snapshot(&peer)
        .map(|s| s.payment_threshold)
        .unwrap_or(accounting.config().payment_threshold);
    let remaining = accounting.debt(&peer);
    if remaining > accounting.early_payment_threshold(threshold) {
        match settlement {
            Some(settlement) => {
                info!(peer = %peer, amount = remaining, "paying debt");
                result = settlement.pay(&peer, remaining).await;
                paid = remaining;
            }
            None => {
                warn!(peer = %peer, debt = remaining, "debt above early payment threshold and no settlement configured");
            }
        }
    }

    if result.is_err() {
        paid = 0;
    }
    accounting.notify_payment_sent(&peer, paid, result);
}
