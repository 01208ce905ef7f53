//! Verification of off-chain records against anchored digests.
//!
//! A verifier only reads.  It recomputes the digest from the fields it is
//! handed and asks the ledger whether that digest is the one bound to the
//! report id.

use crate::contract::LedgerRecord;
use crate::digest::{CanonicalReport, DigestError, DigestVersion, ReportDigest};
use crate::ledger::{LedgerBackend, LedgerFault};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Outcome of comparing a record with the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationResult {
    /// The recomputed digest equals the anchored one.
    Match,
    /// A digest is anchored for the id but differs from the recomputed one.
    Mismatch,
    /// Nothing is anchored for the id.
    NotAnchored,
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Match => "match",
            Self::Mismatch => "mismatch",
            Self::NotAnchored => "not anchored",
        })
    }
}

/// Errors that prevent a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// The supplied fields cannot be digested.
    #[error(transparent)]
    InvalidInput(#[from] DigestError),
    /// The ledger could not answer.
    #[error("ledger query failed: {0}")]
    Ledger(LedgerFault),
}

/// Verdict plus the data it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// The verdict.
    pub result: VerificationResult,
    /// Digest recomputed from the supplied fields.
    pub computed: ReportDigest,
    /// Ledger record for the id, when one exists.
    pub anchored: Option<LedgerRecord>,
}

/// Read-only checker over a ledger backend.
#[derive(Clone)]
pub struct Verifier {
    ledger: Arc<dyn LedgerBackend>,
}

impl Verifier {
    /// Wraps a ledger handle.
    pub fn new(ledger: Arc<dyn LedgerBackend>) -> Self {
        Self { ledger }
    }

    /// Verifies `report` with the current digest encoding.
    pub fn verify(&self, report: &CanonicalReport) -> Result<VerificationResult, VerifyError> {
        self.verify_with(report, DigestVersion::V1)
    }

    /// Verifies from loose fields.
    pub fn verify_fields(
        &self,
        report_id: &str,
        description: &str,
        location: &str,
        category: &str,
        evidence_content_id: &str,
    ) -> Result<VerificationResult, VerifyError> {
        self.verify(&CanonicalReport::new(
            report_id,
            description,
            location,
            category,
            evidence_content_id,
        ))
    }

    /// Verifies `report` with an explicit encoding, for legacy anchors.
    pub fn verify_with(
        &self,
        report: &CanonicalReport,
        version: DigestVersion,
    ) -> Result<VerificationResult, VerifyError> {
        let computed = report.digest_with(version)?;
        let result = match self.ledger.verify_hash(&report.report_id, &computed) {
            Ok(true) => VerificationResult::Match,
            Ok(false) => VerificationResult::Mismatch,
            Err(LedgerFault::NotFound) => VerificationResult::NotAnchored,
            Err(fault) => return Err(VerifyError::Ledger(fault)),
        };
        debug!(report_id = %report.report_id, %result, "verified report");
        Ok(result)
    }

    /// Like [`Verifier::verify`] but also returns the anchored record.
    pub fn inspect(&self, report: &CanonicalReport) -> Result<VerificationReport, VerifyError> {
        let computed = report.digest()?;
        let anchored = match self.ledger.get_report(&report.report_id) {
            Ok(record) => Some(record),
            Err(LedgerFault::NotFound) => None,
            Err(fault) => return Err(VerifyError::Ledger(fault)),
        };
        let result = match &anchored {
            Some(record) if record.digest == computed => VerificationResult::Match,
            Some(_) => VerificationResult::Mismatch,
            None => VerificationResult::NotAnchored,
        };
        Ok(VerificationReport {
            result,
            computed,
            anchored,
        })
    }
}
