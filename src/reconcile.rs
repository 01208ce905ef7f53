//! Report intake and anchoring reconciliation.
//!
//! The off-chain record is written first and is never rolled back because
//! anchoring went wrong.  Anchoring runs as a detached task whose outcome is
//! written back onto the record; records that end up without a proof are
//! picked up again by [`ReportDesk::reconcile_pass`].  At most one anchoring
//! attempt per report id is in flight at any time.

use crate::anchor::{AnchorClient, AnchorFailure, ConfirmationProof};
use crate::digest::{CanonicalReport, DigestError, ReportDigest};
use crate::ledger::TxHash;
use crate::status::ReportStatus;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Where a record stands with respect to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorState {
    /// A confirmation proof is attached.
    Anchored,
    /// A transaction was submitted but its inclusion was not observed.
    Pending,
    /// No anchoring has succeeded yet.
    Unanchored,
}

/// Off-chain report record as kept by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    /// Canonical fields the digest commits to.
    pub report: CanonicalReport,
    /// Digest computed at submission.
    pub digest: ReportDigest,
    /// Locally managed status.
    pub status: ReportStatus,
    /// Set once when anchoring is confirmed.
    pub proof: Option<ConfirmationProof>,
    /// Transaction submitted but not yet seen included.
    pub pending_tx: Option<TxHash>,
    /// Most recent anchoring failure, for operators.
    pub last_anchor_error: Option<String>,
    /// The ledger already holds a different digest for this id.
    #[serde(default)]
    pub anchor_conflict: bool,
    /// Creation time in unix milliseconds.
    pub created_at: u64,
}

impl ReportRecord {
    /// Builds a fresh, unanchored record.
    pub fn new(report: CanonicalReport, digest: ReportDigest, created_at: u64) -> Self {
        Self {
            report,
            digest,
            status: ReportStatus::Pending,
            proof: None,
            pending_tx: None,
            last_anchor_error: None,
            anchor_conflict: false,
            created_at,
        }
    }

    /// Report identifier.
    pub fn report_id(&self) -> &str {
        &self.report.report_id
    }

    /// Derived anchoring state.
    pub fn anchor_state(&self) -> AnchorState {
        match (&self.proof, &self.pending_tx) {
            (Some(_), _) => AnchorState::Anchored,
            (None, Some(_)) => AnchorState::Pending,
            (None, None) => AnchorState::Unanchored,
        }
    }
}

/// Record store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A record with this id already exists.
    #[error("report {0} already exists")]
    Duplicate(String),
    /// No record with this id.
    #[error("report {0} not found")]
    NotFound(String),
    /// The backing store is unusable.
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence for off-chain report records.
pub trait ReportStore: Send + Sync {
    /// Inserts a new record; fails on a duplicate id.
    fn insert(&self, record: ReportRecord) -> Result<(), StoreError>;

    /// Fetches one record.
    fn get(&self, report_id: &str) -> Result<ReportRecord, StoreError>;

    /// Every record, newest first.
    fn list(&self) -> Result<Vec<ReportRecord>, StoreError>;

    /// Overwrites the local status.
    fn update_status(
        &self,
        report_id: &str,
        status: ReportStatus,
    ) -> Result<ReportRecord, StoreError>;

    /// Attaches a proof.  Returns `false` and changes nothing when a proof
    /// is already present.
    fn attach_proof(&self, report_id: &str, proof: ConfirmationProof) -> Result<bool, StoreError>;

    /// Remembers a submitted transaction that has not been seen included.
    fn record_pending(&self, report_id: &str, tx: TxHash) -> Result<(), StoreError>;

    /// Remembers why the latest anchoring attempt failed.
    fn record_failure(&self, report_id: &str, failure: &AnchorFailure) -> Result<(), StoreError>;

    /// Removes the record.
    fn delete(&self, report_id: &str) -> Result<ReportRecord, StoreError>;

    /// Records without a proof, oldest first.
    fn unanchored(&self) -> Result<Vec<ReportRecord>, StoreError>;
}

/// Process-local [`ReportStore`].
#[derive(Default)]
pub struct MemoryReportStore {
    records: Mutex<HashMap<String, ReportRecord>>,
}

impl MemoryReportStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ReportRecord>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("record store poisoned".into()))
    }

    fn modify<T>(
        &self,
        report_id: &str,
        f: impl FnOnce(&mut ReportRecord) -> T,
    ) -> Result<T, StoreError> {
        let mut records = self.lock()?;
        let record = records
            .get_mut(report_id)
            .ok_or_else(|| StoreError::NotFound(report_id.to_string()))?;
        Ok(f(record))
    }
}

impl ReportStore for MemoryReportStore {
    fn insert(&self, record: ReportRecord) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        let id = record.report_id().to_string();
        if records.contains_key(&id) {
            return Err(StoreError::Duplicate(id));
        }
        records.insert(id, record);
        Ok(())
    }

    fn get(&self, report_id: &str) -> Result<ReportRecord, StoreError> {
        self.lock()?
            .get(report_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(report_id.to_string()))
    }

    fn list(&self) -> Result<Vec<ReportRecord>, StoreError> {
        let mut all: Vec<ReportRecord> = self.lock()?.values().cloned().collect();
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.report_id().cmp(a.report_id()))
        });
        Ok(all)
    }

    fn update_status(
        &self,
        report_id: &str,
        status: ReportStatus,
    ) -> Result<ReportRecord, StoreError> {
        self.modify(report_id, |record| {
            record.status = status;
            record.clone()
        })
    }

    fn attach_proof(&self, report_id: &str, proof: ConfirmationProof) -> Result<bool, StoreError> {
        self.modify(report_id, |record| {
            if record.proof.is_some() {
                return false;
            }
            record.proof = Some(proof);
            record.pending_tx = None;
            record.last_anchor_error = None;
            record.anchor_conflict = false;
            true
        })
    }

    fn record_pending(&self, report_id: &str, tx: TxHash) -> Result<(), StoreError> {
        self.modify(report_id, |record| {
            if record.proof.is_none() {
                record.pending_tx = Some(tx);
            }
        })
    }

    fn record_failure(&self, report_id: &str, failure: &AnchorFailure) -> Result<(), StoreError> {
        self.modify(report_id, |record| {
            record.last_anchor_error = Some(failure.to_string());
            if *failure == AnchorFailure::AlreadyStored {
                record.anchor_conflict = true;
            }
        })
    }

    fn delete(&self, report_id: &str) -> Result<ReportRecord, StoreError> {
        self.lock()?
            .remove(report_id)
            .ok_or_else(|| StoreError::NotFound(report_id.to_string()))
    }

    fn unanchored(&self) -> Result<Vec<ReportRecord>, StoreError> {
        let mut pending: Vec<ReportRecord> = self
            .lock()?
            .values()
            .filter(|record| record.proof.is_none())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.report_id().cmp(b.report_id()))
        });
        Ok(pending)
    }
}

/// Evidence upload failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    /// Nothing to upload.
    #[error("evidence is empty")]
    Empty,
    /// The pinning service rejected or dropped the upload.
    #[error("evidence upload failed: {0}")]
    Service(String),
}

/// Content-addressed evidence storage.
pub trait EvidenceUploader: Send + Sync {
    /// Stores `bytes` and returns their content identifier.
    fn upload(&self, bytes: &[u8]) -> Result<String, UploadError>;
}

/// Uploader that stores nothing and names content by its SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256ContentIds;

impl EvidenceUploader for Sha256ContentIds {
    fn upload(&self, bytes: &[u8]) -> Result<String, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(bytes))))
    }
}

/// Issues millisecond-timestamp report ids that never repeat in-process.
#[derive(Debug, Default)]
pub struct ReportIdGenerator {
    last: AtomicU64,
}

impl ReportIdGenerator {
    /// Fresh generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id as unix milliseconds, bumped past the previous one if needed.
    pub fn next_millis(&self) -> u64 {
        let now = unix_millis();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }

    /// Next id in its decimal text form.
    pub fn next_id(&self) -> String {
        self.next_millis().to_string()
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Reporter-supplied fields of a new report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReport {
    /// Free-text incident description.
    pub description: String,
    /// Where the incident happened.
    pub location: String,
    /// Incident category.
    pub category: String,
}

/// Failures of desk operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeskError {
    /// A field was missing or blank.
    #[error(transparent)]
    InvalidInput(#[from] DigestError),
    /// Evidence could not be uploaded.
    #[error(transparent)]
    Upload(#[from] UploadError),
    /// The record store refused the record.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The ledger call failed.
    #[error(transparent)]
    Anchor(#[from] AnchorFailure),
}

/// Tallies from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Records that now carry a proof.
    pub anchored: usize,
    /// Records whose transaction is still waiting for inclusion.
    pub still_pending: usize,
    /// Records whose attempt failed outright, conflicts included.
    pub failed: usize,
}

struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(&self.id);
        }
    }
}

enum Attempt {
    Fresh,
    Resume(Option<TxHash>),
}

enum Outcome {
    Anchored,
    Pending,
    Failed,
}

/// Intake front for reports: store first, anchor in the background.
#[derive(Clone)]
pub struct ReportDesk {
    store: Arc<dyn ReportStore>,
    uploader: Arc<dyn EvidenceUploader>,
    client: Arc<AnchorClient>,
    ids: Arc<ReportIdGenerator>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ReportDesk {
    /// Wires the desk to its collaborators.
    pub fn new(
        store: Arc<dyn ReportStore>,
        uploader: Arc<dyn EvidenceUploader>,
        client: Arc<AnchorClient>,
    ) -> Self {
        Self {
            store,
            uploader,
            client,
            ids: Arc::new(ReportIdGenerator::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Record store handle.
    pub fn store(&self) -> Arc<dyn ReportStore> {
        Arc::clone(&self.store)
    }

    /// Accepts a report.
    ///
    /// Returns as soon as the record is stored.  The handle resolves with the
    /// anchoring outcome, which is also written back to the store; dropping
    /// it does not cancel anything.  Must be called inside a tokio runtime.
    pub async fn submit(
        &self,
        new: NewReport,
        evidence: &[u8],
    ) -> Result<(ReportRecord, JoinHandle<Result<ConfirmationProof, AnchorFailure>>), DeskError>
    {
        for (field, value) in [
            ("description", &new.description),
            ("location", &new.location),
            ("category", &new.category),
        ] {
            if value.trim().is_empty() {
                return Err(DigestError::InvalidInput { field }.into());
            }
        }
        let content_id = self.uploader.upload(evidence)?;
        let created_at = self.ids.next_millis();
        let report = CanonicalReport::new(
            created_at.to_string(),
            new.description,
            new.location,
            new.category,
            content_id,
        );
        let digest = report.digest()?;
        let record = ReportRecord::new(report, digest, created_at);
        self.store.insert(record.clone())?;
        info!(report_id = record.report_id(), digest = %digest, "report stored");

        let guard = self.claim(record.report_id());
        let desk = self.clone();
        let id = record.report_id().to_string();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            desk.attempt(&id, digest, Attempt::Fresh).await.1
        });
        Ok((record, handle))
    }

    /// Retries anchoring for every record without a proof.
    ///
    /// Ids are processed concurrently, each at most once.  Records with an
    /// attempt already in flight or a known conflict are skipped.
    pub async fn reconcile_pass(&self) -> Result<ReconcileSummary, StoreError> {
        let mut attempts = Vec::new();
        for record in self.store.unanchored()? {
            if record.anchor_conflict {
                continue;
            }
            let Some(guard) = self.try_claim(record.report_id()) else {
                continue;
            };
            let desk = self.clone();
            attempts.push(tokio::spawn(async move {
                let _guard = guard;
                desk.attempt(
                    record.report_id(),
                    record.digest,
                    Attempt::Resume(record.pending_tx),
                )
                .await
                .0
            }));
        }

        let mut summary = ReconcileSummary::default();
        for attempt in attempts {
            match attempt.await {
                Ok(Outcome::Anchored) => summary.anchored += 1,
                Ok(Outcome::Pending) => summary.still_pending += 1,
                Ok(Outcome::Failed) => summary.failed += 1,
                Err(err) => {
                    warn!(error = %err, "reconcile task aborted");
                    summary.failed += 1;
                }
            }
        }
        info!(
            anchored = summary.anchored,
            still_pending = summary.still_pending,
            failed = summary.failed,
            "reconcile pass finished"
        );
        Ok(summary)
    }

    /// Changes the local status only.
    pub fn update_status(
        &self,
        report_id: &str,
        status: ReportStatus,
    ) -> Result<ReportRecord, StoreError> {
        self.store.update_status(report_id, status)
    }

    /// Pushes the record's current status to the ledger.  Needs the admin
    /// credential.
    pub async fn propagate_status(
        &self,
        report_id: &str,
    ) -> Result<ConfirmationProof, DeskError> {
        let record = self.store.get(report_id)?;
        Ok(self.client.push_status(report_id, &record.status).await?)
    }

    /// Deletes the off-chain record.  Anything anchored stays on the ledger.
    pub fn delete(&self, report_id: &str) -> Result<ReportRecord, StoreError> {
        let removed = self.store.delete(report_id)?;
        info!(
            report_id,
            anchored = removed.proof.is_some(),
            "report deleted from record store"
        );
        Ok(removed)
    }

    fn claim(&self, report_id: &str) -> InFlight {
        if let Ok(mut ids) = self.in_flight.lock() {
            ids.insert(report_id.to_string());
        }
        InFlight {
            ids: Arc::clone(&self.in_flight),
            id: report_id.to_string(),
        }
    }

    fn try_claim(&self, report_id: &str) -> Option<InFlight> {
        let mut ids = self.in_flight.lock().ok()?;
        if !ids.insert(report_id.to_string()) {
            return None;
        }
        Some(InFlight {
            ids: Arc::clone(&self.in_flight),
            id: report_id.to_string(),
        })
    }

    async fn attempt(
        &self,
        report_id: &str,
        digest: ReportDigest,
        attempt: Attempt,
    ) -> (Outcome, Result<ConfirmationProof, AnchorFailure>) {
        let result = match attempt {
            Attempt::Fresh => self.client.anchor(report_id, digest).await,
            Attempt::Resume(pending_tx) => self.client.resume(report_id, digest, pending_tx).await,
        };
        let outcome = match &result {
            Ok(proof) => {
                if let Err(err) = self.store.attach_proof(report_id, proof.clone()) {
                    warn!(report_id, error = %err, "could not attach proof to record");
                }
                Outcome::Anchored
            }
            Err(failure) => {
                if let Some(tx) = failure.pending_tx() {
                    if let Err(err) = self.store.record_pending(report_id, tx) {
                        warn!(report_id, error = %err, "could not record pending transaction");
                    }
                }
                if let Err(err) = self.store.record_failure(report_id, failure) {
                    warn!(report_id, error = %err, "could not record anchor failure");
                }
                match failure {
                    AnchorFailure::AlreadyStored => {
                        error!(report_id, "ledger holds a different digest for this report");
                        Outcome::Failed
                    }
                    AnchorFailure::Timeout { pending_tx } => {
                        warn!(
                            report_id,
                            pending_tx = ?pending_tx,
                            "anchoring not confirmed in time, record kept"
                        );
                        Outcome::Pending
                    }
                    other => {
                        warn!(report_id, error = %other, "anchoring failed, record kept");
                        Outcome::Failed
                    }
                }
            }
        };
        (outcome, result)
    }
}
