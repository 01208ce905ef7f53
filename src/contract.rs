//! The report registry contract as a plain state machine.
//!
//! Each report identifier is either unset or stored.  Storing is a one-way
//! transition: once a digest is bound to an identifier it can never be
//! replaced, which is what makes the anchored value evidence.  The status
//! field inside a stored record may change, but only when the caller is the
//! admin principal fixed at construction.
//!
//! The registry does not lock anything itself.  Whoever hosts it (the ledger
//! node, or [`InMemoryLedger`](crate::ledger::InMemoryLedger) in tests)
//! applies calls one at a time in a single global order.

use crate::credential::Address;
use crate::digest::ReportDigest;
use crate::status::ReportStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Revert reason emitted when a report id already has a digest.
pub const REVERT_ALREADY_STORED: &str = "Hash already stored for this report";
/// Revert reason emitted when a non-admin changes status.
pub const REVERT_ONLY_ADMIN: &str = "Only admin can call this";
/// Revert reason emitted for unknown report ids.
pub const REVERT_NOT_FOUND: &str = "Report not found";

/// Authoritative per-report record held by the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Digest bound to the report id; immutable after creation.
    pub digest: ReportDigest,
    /// Principal that submitted the digest.
    pub submitter: Address,
    /// Block timestamp (unix seconds) of the storing transaction.
    pub stored_at: u64,
    /// Admin-controlled status.
    pub status: ReportStatus,
}

/// Events emitted by successful state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A digest was bound to a report id.
    HashStored {
        /// Report identifier.
        report_id: String,
        /// Stored digest.
        digest: ReportDigest,
        /// Submitting principal.
        submitter: Address,
    },
    /// The admin changed a report's status.
    StatusUpdated {
        /// Report identifier.
        report_id: String,
        /// New status.
        status: ReportStatus,
    },
}

/// Reasons a contract call reverts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    /// The report id already has a digest.
    #[error("Hash already stored for this report")]
    AlreadyStored,
    /// No digest is stored for the report id.
    #[error("Report not found")]
    NotFound,
    /// The caller is not the admin principal.
    #[error("Only admin can call this")]
    Unauthorized,
    /// Malformed call arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// In-process model of the report registry contract.
#[derive(Debug, Clone)]
pub struct ReportRegistry {
    admin: Address,
    records: HashMap<String, LedgerRecord>,
    events: Vec<RegistryEvent>,
}

impl ReportRegistry {
    /// Deploys a registry owned by `admin`.
    pub fn new(admin: Address) -> Self {
        Self {
            admin,
            records: HashMap::new(),
            events: Vec::new(),
        }
    }

    /// The admin principal fixed at deployment.
    pub fn admin(&self) -> Address {
        self.admin
    }

    /// Binds `digest` to `report_id`; reverts with `AlreadyStored` if bound.
    pub fn store_digest(
        &mut self,
        caller: Address,
        report_id: &str,
        digest: ReportDigest,
        now: u64,
    ) -> Result<(), ContractError> {
        if report_id.is_empty() {
            return Err(ContractError::InvalidInput("empty report id".into()));
        }
        if self.records.contains_key(report_id) {
            return Err(ContractError::AlreadyStored);
        }
        self.records.insert(
            report_id.to_string(),
            LedgerRecord {
                digest,
                submitter: caller,
                stored_at: now,
                status: ReportStatus::Pending,
            },
        );
        self.events.push(RegistryEvent::HashStored {
            report_id: report_id.to_string(),
            digest,
            submitter: caller,
        });
        Ok(())
    }

    /// Returns the stored record.
    pub fn get_record(&self, report_id: &str) -> Result<&LedgerRecord, ContractError> {
        self.records.get(report_id).ok_or(ContractError::NotFound)
    }

    /// True iff `candidate` equals the stored digest.
    pub fn verify_digest(
        &self,
        report_id: &str,
        candidate: &ReportDigest,
    ) -> Result<bool, ContractError> {
        Ok(self.get_record(report_id)?.digest == *candidate)
    }

    /// Overwrites the status of a stored report; admin only.
    pub fn update_status(
        &mut self,
        caller: Address,
        report_id: &str,
        status: ReportStatus,
    ) -> Result<(), ContractError> {
        if caller != self.admin {
            return Err(ContractError::Unauthorized);
        }
        let record = self
            .records
            .get_mut(report_id)
            .ok_or(ContractError::NotFound)?;
        record.status = status.clone();
        self.events.push(RegistryEvent::StatusUpdated {
            report_id: report_id.to_string(),
            status,
        });
        Ok(())
    }

    /// Every event emitted so far, oldest first.
    pub fn events(&self) -> &[RegistryEvent] {
        &self.events
    }

    /// Takes the event log, leaving it empty.  Stored records are unaffected.
    pub fn drain_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Number of stored reports.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
