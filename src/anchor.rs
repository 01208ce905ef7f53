//! Anchor client: submits report digests to the ledger and waits for
//! inclusion.
//!
//! Ledger calls are blocking and slow, so each one runs on a
//! `spawn_blocking` worker and the caller only awaits it under a deadline.
//! When the deadline passes the client gives up waiting and reports
//! [`AnchorFailure::Timeout`] carrying the pending transaction hash, but the
//! worker and the submitted transaction are left alone.  [`AnchorClient::resume`]
//! picks such a transaction up again by querying instead of resubmitting.
//!
//! Failures are values.  None of them says anything about whether the
//! off-chain record should exist; that decision belongs to the caller.

use crate::config::AnchorSettings;
use crate::credential::{Address, SigningCredential};
use crate::digest::ReportDigest;
use crate::ledger::{LedgerBackend, LedgerFault, TxHash, TxReceipt};
use crate::status::ReportStatus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Proof that a digest was included on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationProof {
    /// Transaction that stored the digest.
    pub tx_hash: TxHash,
    /// Block the transaction landed in.
    pub block_number: u64,
    /// Principal that signed the transaction.
    pub submitter: Address,
}

impl From<TxReceipt> for ConfirmationProof {
    fn from(receipt: TxReceipt) -> Self {
        Self {
            tx_hash: receipt.tx_hash,
            block_number: receipt.block_number,
            submitter: receipt.from,
        }
    }
}

/// Why an anchoring attempt did not produce a proof.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnchorFailure {
    /// The request was malformed; nothing was sent.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The report id already carries a different anchoring.
    #[error("report id already has a digest on the ledger")]
    AlreadyStored,
    /// The credential is not the contract admin.
    #[error("credential is not authorized for this call")]
    Unauthorized,
    /// The ledger has no record for the report id.
    #[error("report not found on ledger")]
    NotFound,
    /// Confirmation did not arrive in time.
    #[error("timed out waiting for confirmation")]
    Timeout {
        /// Transaction that may still be included later.
        pending_tx: Option<TxHash>,
    },
    /// The ledger node could not be reached.
    #[error("ledger unreachable: {0}")]
    Unreachable(String),
    /// The signer cannot pay for the transaction.
    #[error("insufficient funds")]
    InsufficientFunds,
    /// The contract reverted for another reason.
    #[error("reverted: {0}")]
    Reverted(String),
    /// The digest is anchored but the storing transaction could not be located.
    #[error("digest is anchored but its transaction could not be located")]
    ProofUnavailable,
    /// The blocking worker died.
    #[error("anchor worker failed: {0}")]
    Worker(String),
}

impl AnchorFailure {
    /// True for transient faults that a later reconciliation pass may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Unreachable(_)
                | Self::InsufficientFunds
                | Self::Reverted(_)
                | Self::ProofUnavailable
                | Self::Worker(_)
        )
    }

    /// Transaction hash a later pass should re-check, if any.
    pub fn pending_tx(&self) -> Option<TxHash> {
        match self {
            Self::Timeout { pending_tx } => *pending_tx,
            _ => None,
        }
    }
}

impl From<LedgerFault> for AnchorFailure {
    fn from(fault: LedgerFault) -> Self {
        match fault {
            LedgerFault::AlreadyStored => Self::AlreadyStored,
            LedgerFault::NotFound => Self::NotFound,
            LedgerFault::Unauthorized => Self::Unauthorized,
            LedgerFault::InvalidInput(reason) => Self::InvalidInput(reason),
            LedgerFault::Reverted(reason) => Self::Reverted(reason),
            LedgerFault::InsufficientFunds => Self::InsufficientFunds,
            LedgerFault::Unreachable(reason) => Self::Unreachable(reason),
            LedgerFault::Rpc(reason) => Self::Unreachable(reason),
        }
    }
}

/// Submits digests with a held signing credential.
pub struct AnchorClient {
    ledger: Arc<dyn LedgerBackend>,
    credential: Arc<SigningCredential>,
    settings: AnchorSettings,
}

impl AnchorClient {
    /// Builds a client around a ledger backend and the process credential.
    pub fn new(
        ledger: Arc<dyn LedgerBackend>,
        credential: Arc<SigningCredential>,
        settings: AnchorSettings,
    ) -> Self {
        Self {
            ledger,
            credential,
            settings,
        }
    }

    /// Address transactions are signed for.
    pub fn submitter(&self) -> Address {
        self.credential.address()
    }

    /// Shared ledger handle.
    pub fn ledger(&self) -> Arc<dyn LedgerBackend> {
        Arc::clone(&self.ledger)
    }

    /// Anchors `digest` under the configured confirmation timeout.
    pub async fn anchor(
        &self,
        report_id: &str,
        digest: ReportDigest,
    ) -> Result<ConfirmationProof, AnchorFailure> {
        self.anchor_with_timeout(report_id, digest, self.settings.confirm_timeout)
            .await
    }

    /// Anchors `digest`, giving up on confirmation after `limit`.
    pub async fn anchor_with_timeout(
        &self,
        report_id: &str,
        digest: ReportDigest,
        limit: Duration,
    ) -> Result<ConfirmationProof, AnchorFailure> {
        if report_id.trim().is_empty() {
            return Err(AnchorFailure::InvalidInput("empty report id".into()));
        }
        let deadline = Instant::now() + limit;
        info!(report_id, digest = %digest, "submitting digest to ledger");
        let id = report_id.to_string();
        let tx = self
            .call(deadline, move |ledger, credential| {
                ledger.submit_store_digest(credential, &id, &digest)
            })
            .await??;
        debug!(report_id, tx_hash = %tx, "digest submitted, awaiting inclusion");
        let proof = self.await_receipt(tx, deadline).await?;
        info!(
            report_id,
            tx_hash = %proof.tx_hash,
            block = proof.block_number,
            "digest anchored"
        );
        Ok(proof)
    }

    /// Picks up an earlier attempt for `report_id`.
    ///
    /// A known pending transaction is re-checked first.  Otherwise the ledger
    /// record decides: same digest means the earlier submission landed and
    /// only its transaction needs locating, no record means a fresh
    /// submission, a different digest is a conflict.  A fresh submission
    /// refused as already stored reads the record again before calling it
    /// a conflict.
    pub async fn resume(
        &self,
        report_id: &str,
        digest: ReportDigest,
        pending_tx: Option<TxHash>,
    ) -> Result<ConfirmationProof, AnchorFailure> {
        let deadline = Instant::now() + self.settings.confirm_timeout;
        if let Some(tx) = pending_tx {
            let receipt = self
                .call(deadline, move |ledger, _| ledger.receipt(&tx))
                .await
                .map_err(|failure| with_pending(failure, tx))??;
            match receipt {
                Some(receipt) if receipt.success => return Ok(receipt.into()),
                Some(receipt) => {
                    warn!(
                        report_id,
                        tx_hash = %tx,
                        reason = receipt.revert_reason.as_deref().unwrap_or("unknown"),
                        "pending anchor transaction reverted"
                    );
                }
                None => {
                    return Err(AnchorFailure::Timeout {
                        pending_tx: Some(tx),
                    })
                }
            }
        }

        let id = report_id.to_string();
        let record = self
            .call(deadline, move |ledger, _| ledger.get_report(&id))
            .await?;
        match record {
            Ok(record) => self.locate(report_id, digest, record.digest, deadline).await,
            Err(LedgerFault::NotFound) => match self.anchor(report_id, digest).await {
                Err(AnchorFailure::AlreadyStored) => self.recheck(report_id, digest).await,
                other => other,
            },
            Err(fault) => Err(fault.into()),
        }
    }

    /// A store was refused after the ledger had no record; the earlier
    /// submission may have landed in between.
    async fn recheck(
        &self,
        report_id: &str,
        digest: ReportDigest,
    ) -> Result<ConfirmationProof, AnchorFailure> {
        let deadline = Instant::now() + self.settings.confirm_timeout;
        let id = report_id.to_string();
        match self
            .call(deadline, move |ledger, _| ledger.get_report(&id))
            .await?
        {
            Ok(record) => self.locate(report_id, digest, record.digest, deadline).await,
            // Accepted elsewhere but not yet included.
            Err(LedgerFault::NotFound) => Err(AnchorFailure::Timeout { pending_tx: None }),
            Err(fault) => Err(fault.into()),
        }
    }

    /// Finds the proof for a digest the ledger already holds.
    async fn locate(
        &self,
        report_id: &str,
        digest: ReportDigest,
        anchored: ReportDigest,
        deadline: Instant,
    ) -> Result<ConfirmationProof, AnchorFailure> {
        if anchored != digest {
            return Err(AnchorFailure::AlreadyStored);
        }
        debug!(report_id, "digest already on ledger, locating its transaction");
        let id = report_id.to_string();
        let tx = self
            .call(deadline, move |ledger, _| ledger.find_store_tx(&id))
            .await??
            .ok_or(AnchorFailure::ProofUnavailable)?;
        self.await_receipt(tx, deadline).await
    }

    /// Pushes a status change to the ledger; only succeeds for the admin.
    pub async fn push_status(
        &self,
        report_id: &str,
        status: &ReportStatus,
    ) -> Result<ConfirmationProof, AnchorFailure> {
        if report_id.trim().is_empty() {
            return Err(AnchorFailure::InvalidInput("empty report id".into()));
        }
        let deadline = Instant::now() + self.settings.confirm_timeout;
        let id = report_id.to_string();
        let new_status = status.clone();
        let tx = self
            .call(deadline, move |ledger, credential| {
                ledger.submit_update_status(credential, &id, &new_status)
            })
            .await??;
        let proof = self.await_receipt(tx, deadline).await?;
        info!(report_id, status = %status, tx_hash = %proof.tx_hash, "status pushed to ledger");
        Ok(proof)
    }

    async fn await_receipt(
        &self,
        tx: TxHash,
        deadline: Instant,
    ) -> Result<ConfirmationProof, AnchorFailure> {
        let timed_out = AnchorFailure::Timeout {
            pending_tx: Some(tx),
        };
        loop {
            match self
                .call(deadline, move |ledger, _| ledger.receipt(&tx))
                .await
                .map_err(|failure| with_pending(failure, tx))?
            {
                Ok(Some(receipt)) if receipt.success => return Ok(receipt.into()),
                Ok(Some(receipt)) => {
                    let reason = receipt.revert_reason.unwrap_or_default();
                    return Err(LedgerFault::from_revert_reason(&reason).into());
                }
                Ok(None) => {}
                Err(fault) => {
                    warn!(tx_hash = %tx, error = %fault, "receipt poll failed, retrying");
                }
            }
            if Instant::now() + self.settings.poll_interval >= deadline {
                time::sleep_until(deadline).await;
                return Err(timed_out);
            }
            time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn call<T, F>(&self, deadline: Instant, f: F) -> Result<Result<T, LedgerFault>, AnchorFailure>
    where
        T: Send + 'static,
        F: FnOnce(&dyn LedgerBackend, &SigningCredential) -> Result<T, LedgerFault>
            + Send
            + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        let credential = Arc::clone(&self.credential);
        let worker = task::spawn_blocking(move || f(ledger.as_ref(), credential.as_ref()));
        match time::timeout_at(deadline, worker).await {
            Err(_) => Err(AnchorFailure::Timeout { pending_tx: None }),
            Ok(Err(join)) => Err(AnchorFailure::Worker(join.to_string())),
            Ok(Ok(result)) => Ok(result),
        }
    }
}

/// Attaches `tx` to a timeout; other failures pass through.
fn with_pending(failure: AnchorFailure, tx: TxHash) -> AnchorFailure {
    match failure {
        AnchorFailure::Timeout { .. } => AnchorFailure::Timeout {
            pending_tx: Some(tx),
        },
        other => other,
    }
}
