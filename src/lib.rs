#![deny(missing_docs)]

//! # evidence_anchor
//!
//! **evidence_anchor** makes incident reports tamper-evident.  A report's
//! canonical fields are reduced to a SHA-256 digest, the digest is bound to
//! the report identifier on an append-only ledger, and anyone holding a copy
//! of the report can later check it against the anchored value.
//!
//! ## Layout
//!
//! * [`digest`]: canonical field tuple and versioned digest encoding.
//! * [`contract`]: the registry contract as a state machine.  Each id is
//!   stored at most once; status changes are admin-only.
//! * [`ledger`]: the [`LedgerBackend`] seam plus an in-process ledger.
//! * [`anchor`]: submits digests and waits for inclusion under a deadline.
//! * [`verify`]: recomputes digests and compares them with the ledger.
//! * [`reconcile`]: report intake that stores first and anchors in the
//!   background, plus the retry pass for records left without a proof.
//! * `evm` (feature `net`): JSON-RPC backend for a deployed contract.
//!
//! ## Usage
//!
//! ```rust
//! use evidence_anchor::{CanonicalReport, InMemoryLedger, LedgerBackend, SigningCredential,
//!     VerificationResult, Verifier};
//! use std::sync::Arc;
//!
//! let admin = SigningCredential::random();
//! let ledger = Arc::new(InMemoryLedger::new(admin.address()));
//! let report = CanonicalReport::new("RPT1", "Bike stolen", "5th Ave", "Theft", "Qm123");
//! let digest = report.digest().unwrap();
//! ledger.submit_store_digest(&admin, "RPT1", &digest).unwrap();
//!
//! let verifier = Verifier::new(ledger);
//! assert_eq!(verifier.verify(&report).unwrap(), VerificationResult::Match);
//! ```

pub mod anchor;
pub mod config;
pub mod contract;
pub mod credential;
pub mod digest;
#[cfg(feature = "net")]
pub mod evm;
pub mod ledger;
pub mod reconcile;
pub mod status;
pub mod verify;

pub use anchor::{AnchorClient, AnchorFailure, ConfirmationProof};
pub use config::{AnchorConfig, AnchorSettings, ConfigError};
pub use contract::{ContractError, LedgerRecord, RegistryEvent, ReportRegistry};
pub use credential::{Address, CredentialError, KeySource, SigningCredential};
pub use digest::{compute_digest, CanonicalReport, DigestError, DigestVersion, ReportDigest};
#[cfg(feature = "net")]
pub use evm::EvmLedger;
pub use ledger::{InMemoryLedger, LedgerBackend, LedgerFault, TxHash, TxReceipt};
pub use reconcile::{
    AnchorState, DeskError, EvidenceUploader, MemoryReportStore, NewReport, ReconcileSummary,
    ReportDesk, ReportIdGenerator, ReportRecord, ReportStore, Sha256ContentIds, StoreError,
    UploadError,
};
pub use status::ReportStatus;
pub use verify::{VerificationReport, VerificationResult, Verifier, VerifyError};
