use super::{LedgerBackend, LedgerFault, TxHash, TxReceipt};
use crate::contract::{LedgerRecord, RegistryEvent, ReportRegistry};
use crate::credential::{keccak256, Address, SigningCredential};
use crate::digest::ReportDigest;
use crate::status::ReportStatus;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

enum Call {
    Store {
        report_id: String,
        digest: ReportDigest,
        stored_at: u64,
    },
    UpdateStatus {
        report_id: String,
        status: ReportStatus,
    },
}

struct QueuedTx {
    tx_hash: TxHash,
    from: Address,
    call: Call,
    visible_at: Instant,
}

struct ChainState {
    /// State as of the latest included block.
    registry: ReportRegistry,
    /// State with every queued transaction applied; submissions are
    /// checked against it before they are queued.
    projected: ReportRegistry,
    block_number: u64,
    nonces: HashMap<Address, u64>,
    queue: VecDeque<QueuedTx>,
    receipts: HashMap<TxHash, TxReceipt>,
    store_txs: HashMap<String, TxHash>,
}

impl ChainState {
    /// Includes queued transactions whose time has come, in submission order.
    fn settle(&mut self, now: Instant) {
        while self.queue.front().map_or(false, |tx| tx.visible_at <= now) {
            if let Some(tx) = self.queue.pop_front() {
                self.include(tx);
            }
        }
    }

    fn include(&mut self, tx: QueuedTx) {
        self.block_number += 1;
        let applied = match tx.call {
            Call::Store {
                report_id,
                digest,
                stored_at,
            } => {
                let applied = self
                    .registry
                    .store_digest(tx.from, &report_id, digest, stored_at);
                if applied.is_ok() {
                    self.store_txs.insert(report_id, tx.tx_hash);
                }
                applied
            }
            Call::UpdateStatus { report_id, status } => {
                self.registry.update_status(tx.from, &report_id, status)
            }
        };
        self.receipts.insert(
            tx.tx_hash,
            TxReceipt {
                tx_hash: tx.tx_hash,
                block_number: self.block_number,
                from: tx.from,
                success: applied.is_ok(),
                revert_reason: applied.err().map(|err| err.to_string()),
            },
        );
    }

    fn enqueue(
        &mut self,
        from: Address,
        payload: &[u8],
        call: Call,
        visible_at: Instant,
    ) -> TxHash {
        let nonce = self.nonces.entry(from).or_insert(0);
        let mut preimage = Vec::with_capacity(20 + 8 + payload.len());
        preimage.extend_from_slice(from.as_bytes());
        preimage.extend_from_slice(&nonce.to_be_bytes());
        preimage.extend_from_slice(payload);
        *nonce += 1;
        let tx_hash = TxHash::from_bytes(keccak256(&preimage));
        self.queue.push_back(QueuedTx {
            tx_hash,
            from,
            call,
            visible_at,
        });
        tx_hash
    }
}

/// Single-process ledger hosting a [`ReportRegistry`].
///
/// One mutex around the whole chain state gives every call a single global
/// order, the same guarantee a real ledger provides.  Calls that would
/// revert are rejected at submission, the way a node's gas estimation
/// rejects them.  Accepted transactions wait in a queue and take effect in
/// submission order once included; `with_inclusion_delay` sets how long
/// that takes, imitating block time.  Until then reads see neither the
/// stored digest nor a receipt.
pub struct InMemoryLedger {
    state: Mutex<ChainState>,
    inclusion_delay: Duration,
    reachable: AtomicBool,
}

impl InMemoryLedger {
    /// Deploys a fresh registry owned by `admin`.
    pub fn new(admin: Address) -> Self {
        Self {
            state: Mutex::new(ChainState {
                registry: ReportRegistry::new(admin),
                projected: ReportRegistry::new(admin),
                block_number: 0,
                nonces: HashMap::new(),
                queue: VecDeque::new(),
                receipts: HashMap::new(),
                store_txs: HashMap::new(),
            }),
            inclusion_delay: Duration::ZERO,
            reachable: AtomicBool::new(true),
        }
    }

    /// Delays inclusion by `delay` after each submission.
    pub fn with_inclusion_delay(mut self, delay: Duration) -> Self {
        self.inclusion_delay = delay;
        self
    }

    /// Toggles whether the simulated node answers at all.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Admin principal of the hosted registry.
    pub fn admin(&self) -> Result<Address, LedgerFault> {
        Ok(self.lock()?.registry.admin())
    }

    /// Events emitted by included transactions so far.
    pub fn events(&self) -> Result<Vec<RegistryEvent>, LedgerFault> {
        Ok(self.lock()?.registry.events().to_vec())
    }

    /// Height of the latest block.
    pub fn block_number(&self) -> Result<u64, LedgerFault> {
        Ok(self.lock()?.block_number)
    }

    /// Transactions accepted but not yet included.
    pub fn queued(&self) -> Result<usize, LedgerFault> {
        Ok(self.lock()?.queue.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChainState>, LedgerFault> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(LedgerFault::Unreachable("node is not responding".into()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| LedgerFault::Rpc("ledger state poisoned".into()))?;
        state.settle(Instant::now());
        Ok(state)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl LedgerBackend for InMemoryLedger {
    fn submit_store_digest(
        &self,
        credential: &SigningCredential,
        report_id: &str,
        digest: &ReportDigest,
    ) -> Result<TxHash, LedgerFault> {
        let from = credential.address();
        let stored_at = unix_now();
        let mut state = self.lock()?;
        state
            .projected
            .store_digest(from, report_id, *digest, stored_at)?;
        state.projected.drain_events();
        let mut payload = b"storeHash".to_vec();
        payload.extend_from_slice(report_id.as_bytes());
        payload.extend_from_slice(digest.as_bytes());
        let call = Call::Store {
            report_id: report_id.to_string(),
            digest: *digest,
            stored_at,
        };
        let visible_at = Instant::now() + self.inclusion_delay;
        let tx_hash = state.enqueue(from, &payload, call, visible_at);
        state.settle(Instant::now());
        Ok(tx_hash)
    }

    fn receipt(&self, tx: &TxHash) -> Result<Option<TxReceipt>, LedgerFault> {
        Ok(self.lock()?.receipts.get(tx).cloned())
    }

    fn get_report(&self, report_id: &str) -> Result<LedgerRecord, LedgerFault> {
        Ok(self.lock()?.registry.get_record(report_id)?.clone())
    }

    fn verify_hash(&self, report_id: &str, digest: &ReportDigest) -> Result<bool, LedgerFault> {
        Ok(self.lock()?.registry.verify_digest(report_id, digest)?)
    }

    fn submit_update_status(
        &self,
        credential: &SigningCredential,
        report_id: &str,
        status: &ReportStatus,
    ) -> Result<TxHash, LedgerFault> {
        let from = credential.address();
        let mut state = self.lock()?;
        state
            .projected
            .update_status(from, report_id, status.clone())?;
        state.projected.drain_events();
        let mut payload = b"updateStatus".to_vec();
        payload.extend_from_slice(report_id.as_bytes());
        payload.extend_from_slice(status.as_str().as_bytes());
        let call = Call::UpdateStatus {
            report_id: report_id.to_string(),
            status: status.clone(),
        };
        let visible_at = Instant::now() + self.inclusion_delay;
        let tx_hash = state.enqueue(from, &payload, call, visible_at);
        state.settle(Instant::now());
        Ok(tx_hash)
    }

    fn find_store_tx(&self, report_id: &str) -> Result<Option<TxHash>, LedgerFault> {
        Ok(self.lock()?.store_txs.get(report_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(byte: u8) -> ReportDigest {
        ReportDigest::from_bytes([byte; 32])
    }

    #[test]
    fn store_produces_receipt_and_record() {
        let admin = SigningCredential::random();
        let user = SigningCredential::random();
        let ledger = InMemoryLedger::new(admin.address());
        let tx = ledger
            .submit_store_digest(&user, "RPT001", &digest(1))
            .unwrap();
        let receipt = ledger.receipt(&tx).unwrap().unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.from, user.address());
        assert_eq!(receipt.block_number, 1);
        let record = ledger.get_report("RPT001").unwrap();
        assert_eq!(record.submitter, user.address());
        assert!(record.stored_at > 0);
        assert_eq!(ledger.find_store_tx("RPT001").unwrap(), Some(tx));
    }

    #[test]
    fn duplicate_store_is_rejected_before_inclusion() {
        let admin = SigningCredential::random();
        let ledger = InMemoryLedger::new(admin.address());
        ledger
            .submit_store_digest(&admin, "RPT001", &digest(1))
            .unwrap();
        assert_eq!(
            ledger.submit_store_digest(&admin, "RPT001", &digest(2)),
            Err(LedgerFault::AlreadyStored)
        );
        assert_eq!(ledger.block_number().unwrap(), 1);
        assert!(ledger.verify_hash("RPT001", &digest(1)).unwrap());
    }

    #[test]
    fn status_updates_require_admin() {
        let admin = SigningCredential::random();
        let user = SigningCredential::random();
        let ledger = InMemoryLedger::new(admin.address());
        ledger
            .submit_store_digest(&user, "RPT001", &digest(1))
            .unwrap();
        assert_eq!(
            ledger.submit_update_status(&user, "RPT001", &ReportStatus::Resolved),
            Err(LedgerFault::Unauthorized)
        );
        ledger
            .submit_update_status(&admin, "RPT001", &ReportStatus::Resolved)
            .unwrap();
        assert_eq!(
            ledger.get_report("RPT001").unwrap().status,
            ReportStatus::Resolved
        );
    }

    #[test]
    fn queued_store_is_invisible_until_included() {
        let admin = SigningCredential::random();
        let ledger =
            InMemoryLedger::new(admin.address()).with_inclusion_delay(Duration::from_millis(100));
        let tx = ledger
            .submit_store_digest(&admin, "RPT001", &digest(1))
            .unwrap();
        assert_eq!(ledger.receipt(&tx).unwrap(), None);
        assert_eq!(ledger.find_store_tx("RPT001").unwrap(), None);
        assert_eq!(ledger.get_report("RPT001"), Err(LedgerFault::NotFound));
        assert_eq!(
            ledger.verify_hash("RPT001", &digest(1)),
            Err(LedgerFault::NotFound)
        );
        assert_eq!(ledger.block_number().unwrap(), 0);
        assert_eq!(ledger.queued().unwrap(), 1);
        assert!(ledger.events().unwrap().is_empty());

        // A second store for the same id is refused while the first is queued.
        assert_eq!(
            ledger.submit_store_digest(&admin, "RPT001", &digest(2)),
            Err(LedgerFault::AlreadyStored)
        );

        std::thread::sleep(Duration::from_millis(150));
        let receipt = ledger.receipt(&tx).unwrap().unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.block_number, 1);
        assert!(ledger.verify_hash("RPT001", &digest(1)).unwrap());
        assert_eq!(ledger.find_store_tx("RPT001").unwrap(), Some(tx));
        assert_eq!(ledger.queued().unwrap(), 0);
    }

    #[test]
    fn queued_transactions_apply_in_submission_order() {
        let admin = SigningCredential::random();
        let ledger =
            InMemoryLedger::new(admin.address()).with_inclusion_delay(Duration::from_millis(50));
        let store = ledger
            .submit_store_digest(&admin, "RPT001", &digest(1))
            .unwrap();
        let status = ledger
            .submit_update_status(&admin, "RPT001", &ReportStatus::Resolved)
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let first = ledger.receipt(&store).unwrap().unwrap();
        let second = ledger.receipt(&status).unwrap().unwrap();
        assert!(first.block_number < second.block_number);
        assert_eq!(
            ledger.get_report("RPT001").unwrap().status,
            ReportStatus::Resolved
        );
    }

    #[test]
    fn unreachable_node_fails_every_call() {
        let admin = SigningCredential::random();
        let ledger = InMemoryLedger::new(admin.address());
        ledger.set_reachable(false);
        assert!(matches!(
            ledger.get_report("RPT001"),
            Err(LedgerFault::Unreachable(_))
        ));
        assert!(matches!(
            ledger.submit_store_digest(&admin, "RPT001", &digest(1)),
            Err(LedgerFault::Unreachable(_))
        ));
        ledger.set_reachable(true);
        assert_eq!(ledger.get_report("RPT001"), Err(LedgerFault::NotFound));
    }
}
