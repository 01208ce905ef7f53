//! Ledger access: the backend trait the anchor client and verifier share,
//! plus the transaction and fault types that cross it.
//!
//! Backends are synchronous.  Callers that must not block (the anchor
//! client) move calls onto `tokio::task::spawn_blocking`; readers that are
//! happy to block (the verifier, the CLI) call straight through.

mod memory;

pub use memory::InMemoryLedger;

use crate::contract::{ContractError, LedgerRecord};
use crate::credential::{Address, SigningCredential};
use crate::digest::ReportDigest;
use crate::status::ReportStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Ledger transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxHash([u8; 32]);

impl TxHash {
    /// Wraps raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

impl FromStr for TxHash {
    type Err = LedgerFault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let raw = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(raw).map_err(|err| LedgerFault::Rpc(err.to_string()))?;
        if bytes.len() != 32 {
            return Err(LedgerFault::Rpc(format!(
                "transaction hash must be 32 bytes, found {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl Serialize for TxHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusion receipt for a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    /// Transaction the receipt belongs to.
    pub tx_hash: TxHash,
    /// Block the transaction was included in.
    pub block_number: u64,
    /// Sender of the transaction.
    pub from: Address,
    /// Whether execution succeeded.
    pub success: bool,
    /// Revert reason when `success` is false and the node reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
}

/// Faults surfaced by a ledger backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerFault {
    /// The report id already has a digest on the ledger.
    #[error("digest already stored for this report")]
    AlreadyStored,
    /// The ledger has no record for the report id.
    #[error("report not found on ledger")]
    NotFound,
    /// The sender is not the contract admin.
    #[error("caller is not the contract admin")]
    Unauthorized,
    /// The call arguments were rejected before execution.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The contract reverted for another reason.
    #[error("transaction reverted: {0}")]
    Reverted(String),
    /// The sender cannot pay for the transaction.
    #[error("insufficient funds for gas")]
    InsufficientFunds,
    /// The node could not be reached.
    #[error("ledger node unreachable: {0}")]
    Unreachable(String),
    /// The node answered with something unusable.
    #[error("ledger rpc error: {0}")]
    Rpc(String),
}

impl LedgerFault {
    /// Maps a contract revert reason string onto a fault.
    pub fn from_revert_reason(reason: &str) -> Self {
        if reason.contains(crate::contract::REVERT_ALREADY_STORED) {
            Self::AlreadyStored
        } else if reason.contains(crate::contract::REVERT_ONLY_ADMIN) {
            Self::Unauthorized
        } else if reason.contains(crate::contract::REVERT_NOT_FOUND) {
            Self::NotFound
        } else {
            Self::Reverted(reason.to_string())
        }
    }
}

impl From<ContractError> for LedgerFault {
    fn from(err: ContractError) -> Self {
        match err {
            ContractError::AlreadyStored => Self::AlreadyStored,
            ContractError::NotFound => Self::NotFound,
            ContractError::Unauthorized => Self::Unauthorized,
            ContractError::InvalidInput(reason) => Self::InvalidInput(reason),
        }
    }
}

/// Minimal surface of a ledger hosting the report registry contract.
pub trait LedgerBackend: Send + Sync {
    /// Submits a `storeHash` transaction signed by `credential`.
    fn submit_store_digest(
        &self,
        credential: &SigningCredential,
        report_id: &str,
        digest: &ReportDigest,
    ) -> Result<TxHash, LedgerFault>;

    /// Returns the receipt once the transaction is included, `None` before.
    fn receipt(&self, tx: &TxHash) -> Result<Option<TxReceipt>, LedgerFault>;

    /// Reads the stored record.
    fn get_report(&self, report_id: &str) -> Result<LedgerRecord, LedgerFault>;

    /// Compares `digest` with the stored digest.
    fn verify_hash(&self, report_id: &str, digest: &ReportDigest) -> Result<bool, LedgerFault>;

    /// Submits an `updateStatus` transaction signed by `credential`.
    fn submit_update_status(
        &self,
        credential: &SigningCredential,
        report_id: &str,
        status: &ReportStatus,
    ) -> Result<TxHash, LedgerFault>;

    /// Locates the transaction that stored `report_id`, when the backend can.
    fn find_store_tx(&self, _report_id: &str) -> Result<Option<TxHash>, LedgerFault> {
        Ok(None)
    }
}
