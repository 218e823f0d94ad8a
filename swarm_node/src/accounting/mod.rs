// Accounting module for the Swarm node
//
// Per-peer ledger metering every forwarded chunk. A positive balance means
// the peer owes us, a negative balance means we owe the peer.
//
// Outgoing operations reserve the expected price with the peer before the
// stream is opened and either credit (commit) or release it afterwards.
// Incoming operations shadow-reserve the price we will debit the requester
// and debit once the response is written. `CreditAction` and `DebitAction`
// tie each reservation to a guard so no exit path can leak it.
//
// Every record sits behind its own lock; a process-wide lock only guards
// record creation. Blocklist, disconnect and settlement side effects are
// decided under the record lock and performed after it is released.

use crate::config::AccountingConfig;
use crate::error::{NodeError, Result};
use crate::metrics::AccountingMetrics;
use crate::p2p::headers::SettlementTerms;
use crate::p2p::{Blocklister, Disconnecter};
use crate::types::Address;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Reason given when a debtor crosses its payment threshold
pub const CROSSING_THRESHOLD_REASON: &str = "crossing threshold";

/// Reason given when a debtor exceeds the disconnect threshold
pub const DISCONNECT_THRESHOLD_REASON: &str = "exceeding disconnect threshold";

/// Reason given when settlement with a peer keeps failing
pub const SETTLEMENT_FAILURE_REASON: &str = "repeated settlement failures";

/// Request for the settlement worker to pay our debt to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementRequest {
    /// Creditor
    pub peer: Address,
}

/// Ledger entry for one peer
#[derive(Debug, Clone)]
struct PeerRecord {
    balance: i64,
    surplus: u64,
    reserved: u64,
    shadow_reserved: u64,
    ghost: u64,
    /// Threshold the peer applies to us
    payment_threshold: u64,
    /// Threshold we apply to the peer
    payment_threshold_for_peer: u64,
    payment_ongoing: bool,
    /// Last accepted inbound refreshment, unix seconds
    refreshment_timestamp: i64,
    threshold_blocklisted: bool,
    disconnected_for_debt: bool,
    settlement_failures: u32,
    full_node: bool,
    connected: bool,
    terms: SettlementTerms,
}

impl PeerRecord {
    fn new(config: &AccountingConfig) -> Self {
        Self {
            balance: 0,
            surplus: 0,
            reserved: 0,
            shadow_reserved: 0,
            ghost: 0,
            payment_threshold: config.payment_threshold,
            payment_threshold_for_peer: config.payment_threshold,
            payment_ongoing: false,
            refreshment_timestamp: 0,
            threshold_blocklisted: false,
            disconnected_for_debt: false,
            settlement_failures: 0,
            full_node: true,
            connected: false,
            terms: SettlementTerms::default(),
        }
    }

    /// What we owe the peer
    fn debt(&self) -> u64 {
        if self.balance < 0 {
            self.balance.unsigned_abs()
        } else {
            0
        }
    }

    /// What the peer owes us
    fn credit_balance(&self) -> u64 {
        if self.balance > 0 {
            self.balance as u64
        } else {
            0
        }
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            balance: self.balance,
            surplus: self.surplus,
            reserved_balance: self.reserved,
            shadow_reserved_balance: self.shadow_reserved,
            ghost_balance: self.ghost,
            payment_threshold: self.payment_threshold,
            payment_threshold_for_peer: self.payment_threshold_for_peer,
            payment_ongoing: self.payment_ongoing,
            refreshment_timestamp: self.refreshment_timestamp,
            full_node: self.full_node,
            connected: self.connected,
            exchange_rate: self.terms.exchange_rate,
            deduction: self.terms.deduction,
        }
    }
}

/// Point-in-time view of a peer's ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub balance: i64,
    pub surplus: u64,
    pub reserved_balance: u64,
    pub shadow_reserved_balance: u64,
    pub ghost_balance: u64,
    pub payment_threshold: u64,
    pub payment_threshold_for_peer: u64,
    pub payment_ongoing: bool,
    pub refreshment_timestamp: i64,
    pub full_node: bool,
    pub connected: bool,
    /// Last exchange rate the peer announced in stream headers; informational
    /// only, balances are kept in accounting units
    pub exchange_rate: u64,
    /// Last deduction the peer announced; informational only
    pub deduction: u64,
}

/// Side effect decided under a record lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Penalty {
    Blocklist(&'static str),
    Disconnect(&'static str),
}

/// Per-peer credit and debit ledger
pub struct Accounting {
    config: AccountingConfig,
    peers: DashMap<Address, Arc<Mutex<PeerRecord>>>,
    create_lock: Mutex<()>,
    blocklister: Arc<dyn Blocklister>,
    disconnecter: Arc<dyn Disconnecter>,
    settlement_queue: RwLock<Option<mpsc::Sender<SettlementRequest>>>,
    metrics: Arc<AccountingMetrics>,
}

impl Accounting {
    /// Create a ledger
    pub fn new(
        config: AccountingConfig,
        blocklister: Arc<dyn Blocklister>,
        disconnecter: Arc<dyn Disconnecter>,
        metrics: Arc<AccountingMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            peers: DashMap::new(),
            create_lock: Mutex::new(()),
            blocklister,
            disconnecter,
            settlement_queue: RwLock::new(None),
            metrics,
        })
    }

    /// Route settlement requests to a worker
    pub fn set_settlement_queue(&self, queue: mpsc::Sender<SettlementRequest>) {
        *self.settlement_queue.write() = Some(queue);
    }

    /// Configuration in use
    pub fn config(&self) -> &AccountingConfig {
        &self.config
    }

    /// Counters of the ledger
    pub fn metrics(&self) -> &Arc<AccountingMetrics> {
        &self.metrics
    }

    /// Debt at which we start paying a creditor with the given threshold
    pub fn early_payment_threshold(&self, payment_threshold: u64) -> u64 {
        payment_threshold.saturating_sub(2 * self.config.light_factor)
    }

    /// Debt at which a debtor with the given threshold is disconnected
    pub fn disconnect_threshold(&self, payment_threshold_for_peer: u64) -> u64 {
        payment_threshold_for_peer.saturating_mul(self.config.disconnect_factor)
    }

    /// Threshold we apply to light peers
    pub fn light_payment_threshold(&self) -> u64 {
        self.config.payment_threshold / self.config.light_factor
    }

    fn tolerance(&self, payment_threshold_for_peer: u64) -> u64 {
        payment_threshold_for_peer.saturating_mul(self.config.payment_tolerance_percent) / 100
    }

    fn record(&self, peer: &Address) -> Arc<Mutex<PeerRecord>> {
        if let Some(record) = self.peers.get(peer) {
            return record.value().clone();
        }

        let _guard = self.create_lock.lock();
        self.peers
            .entry(*peer)
            .or_insert_with(|| Arc::new(Mutex::new(PeerRecord::new(&self.config))))
            .value()
            .clone()
    }

    fn existing(&self, peer: &Address) -> Result<Arc<Mutex<PeerRecord>>> {
        self.peers
            .get(peer)
            .map(|r| r.value().clone())
            .ok_or_else(|| NodeError::NotFound(format!("no accounting record for {}", peer)))
    }

    /// Reserve `price` of outgoing debt with `peer`.
    ///
    /// Fails with `Overdraft` when our debt plus everything in flight would
    /// exceed the threshold the peer applies to us. Nothing changes on failure.
    pub fn reserve(&self, peer: &Address, price: u64) -> Result<()> {
        let record = self.record(peer);
        let settle = {
            let mut r = record.lock();
            let expected_debt = r.debt().saturating_add(r.reserved).saturating_add(price);
            if expected_debt > r.payment_threshold {
                self.metrics.overdrafts.inc();
                debug!(peer = %peer, price, expected_debt, "reserve refused");
                return Err(NodeError::Overdraft(peer.to_string()));
            }
            r.reserved += price;
            self.metrics.reserves.inc();

            let early = self.early_payment_threshold(r.payment_threshold);
            let settle = r.debt() > 0 && expected_debt > early && !r.payment_ongoing;
            if settle {
                r.payment_ongoing = true;
            }
            settle
        };

        if settle {
            self.dispatch_settlement(peer);
        }
        Ok(())
    }

    /// Give back a reservation without committing it
    pub fn release(&self, peer: &Address, price: u64) {
        let record = self.record(peer);
        let mut r = record.lock();
        if r.reserved < price {
            error!(peer = %peer, price, reserved = r.reserved, "release exceeds reservation");
            r.reserved = 0;
        } else {
            r.reserved -= price;
        }
    }

    /// Commit a reservation: we now owe `peer` another `price`
    pub fn credit(&self, peer: &Address, price: u64, originated: bool) -> Result<()> {
        let record = self.record(peer);
        let settle = {
            let mut r = record.lock();
            if r.reserved < price {
                return Err(NodeError::Accounting(format!(
                    "credit of {} with {} reserved for {}",
                    price, r.reserved, peer
                )));
            }
            r.reserved -= price;
            r.balance = r.balance.saturating_sub(price as i64);

            self.metrics.credits.inc();
            self.metrics.credited_amount.add(price);
            debug!(peer = %peer, price, originated, balance = r.balance, "credited");

            let early = self.early_payment_threshold(r.payment_threshold);
            let settle = r.debt() > early && !r.payment_ongoing;
            if settle {
                r.payment_ongoing = true;
            }
            settle
        };

        if settle {
            self.dispatch_settlement(peer);
        }
        Ok(())
    }

    /// Reserve `price` of incoming debt from `peer`.
    ///
    /// Fails with `Overdraft` when what the peer owes plus everything in
    /// flight would exceed its disconnect threshold.
    pub fn shadow_reserve(&self, peer: &Address, price: u64) -> Result<()> {
        let record = self.record(peer);
        let mut r = record.lock();
        let exposure = r
            .credit_balance()
            .saturating_add(r.shadow_reserved)
            .saturating_add(price);
        if exposure > self.disconnect_threshold(r.payment_threshold_for_peer) {
            self.metrics.overdrafts.inc();
            debug!(peer = %peer, price, exposure, "shadow reserve refused");
            return Err(NodeError::Overdraft(peer.to_string()));
        }
        r.shadow_reserved += price;
        Ok(())
    }

    /// Give back an incoming reservation
    pub fn shadow_release(&self, peer: &Address, price: u64) {
        let record = self.record(peer);
        let mut r = record.lock();
        if r.shadow_reserved < price {
            error!(peer = %peer, price, shadow_reserved = r.shadow_reserved, "shadow release exceeds reservation");
            r.shadow_reserved = 0;
        } else {
            r.shadow_reserved -= price;
        }
    }

    /// `peer` owes us another `price`
    pub fn debit(&self, peer: &Address, price: u64) -> Result<()> {
        self.apply_debit(peer, price, false)
    }

    fn apply_debit(&self, peer: &Address, price: u64, release_shadow: bool) -> Result<()> {
        let record = self.record(peer);
        let penalties = {
            let mut r = record.lock();
            if release_shadow {
                r.shadow_reserved = r.shadow_reserved.saturating_sub(price);
            }

            let from_surplus = r.surplus.min(price);
            r.surplus -= from_surplus;
            let remaining = price - from_surplus;

            let disconnect_threshold = self.disconnect_threshold(r.payment_threshold_for_peer);
            let new_balance = r.balance.saturating_add(remaining as i64);
            let mut penalties = Vec::new();

            if new_balance > disconnect_threshold as i64 {
                let excess = (new_balance - disconnect_threshold as i64) as u64;
                r.ghost = r.ghost.saturating_add(excess);
                r.balance = disconnect_threshold as i64;
                self.metrics.ghost_amount.add(excess);
                if !r.disconnected_for_debt {
                    r.disconnected_for_debt = true;
                    penalties.push(Penalty::Disconnect(DISCONNECT_THRESHOLD_REASON));
                }
            } else {
                r.balance = new_balance;
            }

            let blocklist_at = r
                .payment_threshold_for_peer
                .saturating_add(self.tolerance(r.payment_threshold_for_peer));
            if r.balance > blocklist_at as i64 && !r.threshold_blocklisted {
                r.threshold_blocklisted = true;
                penalties.push(Penalty::Blocklist(CROSSING_THRESHOLD_REASON));
            }

            self.metrics.debits.inc();
            self.metrics.debited_amount.add(price);
            debug!(peer = %peer, price, from_surplus, balance = r.balance, "debited");
            penalties
        };

        for penalty in penalties {
            self.penalise(peer, penalty);
        }
        Ok(())
    }

    fn penalise(&self, peer: &Address, penalty: Penalty) {
        let result = match penalty {
            Penalty::Blocklist(reason) => {
                self.metrics.threshold_blocklists.inc();
                warn!(peer = %peer, reason, "blocklisting debtor");
                self.blocklister
                    .blocklist(peer, self.config.block_duration(), reason)
            }
            Penalty::Disconnect(reason) => {
                self.metrics.debt_disconnects.inc();
                warn!(peer = %peer, reason, "disconnecting debtor");
                self.disconnecter.disconnect(peer, reason)
            }
        };
        if let Err(e) = result {
            warn!(peer = %peer, error = %e, "failed to penalise peer");
        }
    }

    fn dispatch_settlement(&self, peer: &Address) {
        let sent = match self.settlement_queue.read().as_ref() {
            Some(queue) => match queue.try_send(SettlementRequest { peer: *peer }) {
                Ok(()) => true,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "settlement queue rejected request");
                    false
                }
            },
            None => {
                debug!(peer = %peer, "no settlement worker configured");
                false
            }
        };

        if sent {
            self.metrics.settlements_dispatched.inc();
            debug!(peer = %peer, "settlement dispatched");
        } else if let Some(record) = self.peers.get(peer).map(|r| r.value().clone()) {
            record.lock().payment_ongoing = false;
        }
    }

    /// Record the threshold `peer` applies to us
    pub fn announce_payment_threshold(&self, peer: &Address, threshold: u64) {
        let record = self.record(peer);
        record.lock().payment_threshold = threshold;
        debug!(peer = %peer, threshold, "payment threshold announced");
    }

    /// Record the settlement terms announced in stream headers.
    ///
    /// The terms are surfaced in `PeerSnapshot` and never change a balance.
    pub fn record_settlement_terms(&self, peer: &Address, terms: SettlementTerms) {
        let record = self.record(peer);
        record.lock().terms = terms;
    }

    /// An out-of-band payment from `peer` arrived.
    ///
    /// The amount first cancels what the peer owes; the rest becomes surplus
    /// absorbing future debits.
    pub fn notify_payment_received(&self, peer: &Address, amount: u64) {
        let record = self.record(peer);
        let mut r = record.lock();
        let applied = r.credit_balance().min(amount);
        r.balance -= applied as i64;
        r.surplus = r.surplus.saturating_add(amount - applied);

        self.metrics.payments_received.inc();
        info!(peer = %peer, amount, applied, surplus = r.surplus, "payment received");
    }

    /// A settlement attempt for `peer` completed.
    ///
    /// On success the paid amount reduces our debt. The single-flight flag is
    /// always cleared; repeated failures blocklist the peer.
    pub fn notify_payment_sent(&self, peer: &Address, amount: u64, result: Result<()>) {
        let record = self.record(peer);
        let penalty = {
            let mut r = record.lock();
            r.payment_ongoing = false;
            match result {
                Ok(()) => {
                    r.balance = r.balance.saturating_add(amount as i64);
                    r.settlement_failures = 0;
                    if amount > 0 {
                        info!(peer = %peer, amount, balance = r.balance, "payment sent");
                    }
                    None
                }
                Err(e) => {
                    r.settlement_failures += 1;
                    self.metrics.settlement_failures.inc();
                    warn!(peer = %peer, amount, failures = r.settlement_failures, error = %e, "payment failed");
                    if r.settlement_failures >= self.config.max_settlement_failures {
                        r.settlement_failures = 0;
                        Some(Penalty::Blocklist(SETTLEMENT_FAILURE_REASON))
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(penalty) = penalty {
            self.penalise(peer, penalty);
        }
    }

    /// An inbound refreshment from `peer` asks to cancel `amount` of its debt.
    ///
    /// The allowance is the time since the last accepted refreshment times
    /// the lower of the announced and our own refresh rate. The timestamp
    /// must strictly increase. Returns the accepted amount.
    pub fn notify_refreshment_received(
        &self,
        peer: &Address,
        amount: u64,
        timestamp: i64,
        announced_rate: u64,
    ) -> Result<u64> {
        let record = self.record(peer);
        let mut r = record.lock();
        if timestamp <= r.refreshment_timestamp {
            return Err(NodeError::Settlement(format!(
                "refreshment timestamp {} not after {}",
                timestamp, r.refreshment_timestamp
            )));
        }

        let own_rate = if r.full_node {
            self.config.refresh_rate
        } else {
            self.config.light_refresh_rate
        };
        let rate = announced_rate.min(own_rate);
        let elapsed = if r.refreshment_timestamp == 0 {
            1
        } else {
            (timestamp - r.refreshment_timestamp) as u64
        };
        let allowance = elapsed.saturating_mul(rate);

        let accepted = amount.min(allowance).min(r.credit_balance());
        r.balance -= accepted as i64;
        r.refreshment_timestamp = timestamp;

        self.metrics.refreshments_received.inc();
        debug!(peer = %peer, amount, allowance, accepted, "refreshment received");
        Ok(accepted)
    }

    /// `peer` accepted our refreshment of `accepted` at `timestamp`
    pub fn notify_refreshment_sent(&self, peer: &Address, accepted: u64, timestamp: i64) {
        let record = self.record(peer);
        let mut r = record.lock();
        r.balance = r.balance.saturating_add(accepted as i64);
        self.metrics.refreshments_sent.inc();
        debug!(peer = %peer, accepted, timestamp, balance = r.balance, "refreshment sent");
    }

    /// A peer connected; reconnection resets the single-shot penalties
    pub fn connect(&self, peer: &Address, full_node: bool) {
        let record = self.record(peer);
        let mut r = record.lock();
        r.full_node = full_node;
        r.payment_threshold_for_peer = if full_node {
            self.config.payment_threshold
        } else {
            self.light_payment_threshold()
        };
        r.threshold_blocklisted = false;
        r.disconnected_for_debt = false;
        r.settlement_failures = 0;
        r.connected = true;
    }

    /// A peer disconnected; its balances are kept
    pub fn disconnect(&self, peer: &Address) {
        if let Some(record) = self.peers.get(peer).map(|r| r.value().clone()) {
            let mut r = record.lock();
            r.connected = false;
            if r.reserved > 0 || r.shadow_reserved > 0 {
                debug!(
                    peer = %peer,
                    reserved = r.reserved,
                    shadow_reserved = r.shadow_reserved,
                    "peer disconnected with operations in flight"
                );
            }
        }
    }

    /// Reserve with `peer` and return a guard that credits on `apply` and
    /// releases when dropped
    pub fn prepare_credit(
        self: &Arc<Self>,
        peer: &Address,
        price: u64,
        originated: bool,
    ) -> Result<CreditAction> {
        self.reserve(peer, price)?;
        Ok(CreditAction {
            accounting: self.clone(),
            peer: *peer,
            price,
            originated,
            applied: false,
        })
    }

    /// Shadow-reserve with `peer` and return a guard that debits on `apply`
    /// and releases when dropped
    pub fn prepare_debit(self: &Arc<Self>, peer: &Address, price: u64) -> Result<DebitAction> {
        self.shadow_reserve(peer, price)?;
        Ok(DebitAction {
            accounting: self.clone(),
            peer: *peer,
            price,
            applied: false,
        })
    }

    /// Current balance with `peer`
    pub fn balance(&self, peer: &Address) -> Result<i64> {
        Ok(self.existing(peer)?.lock().balance)
    }

    /// Surplus carried for `peer`
    pub fn surplus_balance(&self, peer: &Address) -> Result<u64> {
        Ok(self.existing(peer)?.lock().surplus)
    }

    /// Outgoing reservations with `peer`
    pub fn reserved_balance(&self, peer: &Address) -> Result<u64> {
        Ok(self.existing(peer)?.lock().reserved)
    }

    /// Incoming reservations with `peer`
    pub fn shadow_reserved_balance(&self, peer: &Address) -> Result<u64> {
        Ok(self.existing(peer)?.lock().shadow_reserved)
    }

    /// Debt of `peer` dropped above its disconnect threshold
    pub fn ghost_balance(&self, peer: &Address) -> Result<u64> {
        Ok(self.existing(peer)?.lock().ghost)
    }

    /// What we owe `peer`
    pub fn debt(&self, peer: &Address) -> u64 {
        self.peers
            .get(peer)
            .map(|r| r.value().clone())
            .map(|r| r.lock().debt())
            .unwrap_or(0)
    }

    /// Full ledger entry for `peer`
    pub fn peer_snapshot(&self, peer: &Address) -> Result<PeerSnapshot> {
        Ok(self.existing(peer)?.lock().snapshot())
    }

    /// Balances of all known peers
    pub fn balances(&self) -> HashMap<Address, i64> {
        let records: Vec<(Address, Arc<Mutex<PeerRecord>>)> = self
            .peers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        records
            .into_iter()
            .map(|(peer, record)| (peer, record.lock().balance))
            .collect()
    }

    /// Ledger entries of all known peers
    pub fn snapshots(&self) -> HashMap<Address, PeerSnapshot> {
        let records: Vec<(Address, Arc<Mutex<PeerRecord>>)> = self
            .peers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        records
            .into_iter()
            .map(|(peer, record)| (peer, record.lock().snapshot()))
            .collect()
    }
}

/// Outgoing reservation awaiting its outcome
pub struct CreditAction {
    accounting: Arc<Accounting>,
    peer: Address,
    price: u64,
    originated: bool,
    applied: bool,
}

impl CreditAction {
    /// Creditor
    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// Reserved price
    pub fn price(&self) -> u64 {
        self.price
    }

    /// Commit the reservation as debt to the peer
    pub fn apply(mut self) -> Result<()> {
        self.applied = true;
        self.accounting.credit(&self.peer, self.price, self.originated)
    }
}

impl Drop for CreditAction {
    fn drop(&mut self) {
        if !self.applied {
            self.accounting.release(&self.peer, self.price);
        }
    }
}

/// Incoming reservation awaiting its outcome
pub struct DebitAction {
    accounting: Arc<Accounting>,
    peer: Address,
    price: u64,
    applied: bool,
}

impl DebitAction {
    /// Debtor
    pub fn peer(&self) -> &Address {
        &self.peer
    }

    /// Reserved price
    pub fn price(&self) -> u64 {
        self.price
    }

    /// Commit the reservation as the peer's debt
    pub fn apply(mut self) -> Result<()> {
        self.applied = true;
        self.accounting.apply_debit(&self.peer, self.price, true)
    }
}

impl Drop for DebitAction {
    fn drop(&mut self) {
        if !self.applied {
            self.accounting.shadow_release(&self.peer, self.price);
        }
    }
}
