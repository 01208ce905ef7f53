//! Deterministic report digests.
//!
//! A report is reduced to its canonical tuple `(report_id, description,
//! location, category, evidence_content_id)` and hashed with SHA-256.  The
//! current encoding ([`DigestVersion::V1`]) prefixes a domain tag and writes
//! every field as a big-endian `u64` length followed by its UTF-8 bytes, so
//! two different tuples can never share a preimage.  The plain
//! concatenation used by early deployments is kept as
//! [`DigestVersion::LegacyConcat`] purely to re-check records that were
//! anchored with it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const REPORT_DOMAIN_V1: &[u8] = b"evidence-anchor/report/v1";

/// Length in bytes of a report digest.
pub const DIGEST_LEN: usize = 32;

/// Encoding used to turn canonical fields into hasher input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DigestVersion {
    /// Plain concatenation of the five fields without separators.
    LegacyConcat,
    /// Domain-tagged, length-prefixed fields.
    #[default]
    V1,
}

/// Errors raised while building or parsing digests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    /// A canonical field was missing or blank.
    #[error("invalid input: {field} must be a non-empty string")]
    InvalidInput {
        /// Name of the offending field.
        field: &'static str,
    },
    /// A hex digest could not be decoded.
    #[error("malformed digest: {0}")]
    Malformed(String),
}

/// SHA-256 digest of a report's canonical content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReportDigest([u8; DIGEST_LEN]);

impl ReportDigest {
    /// Wraps raw digest bytes (the `bytes32` ledger form).
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex form used for storage and display.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a hex digest, accepting an optional `0x` prefix in any case.
    pub fn from_hex(input: &str) -> Result<Self, DigestError> {
        let trimmed = input.trim();
        let raw = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(raw).map_err(|err| DigestError::Malformed(err.to_string()))?;
        if bytes.len() != DIGEST_LEN {
            return Err(DigestError::Malformed(format!(
                "expected {DIGEST_LEN} bytes, found {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for ReportDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ReportDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReportDigest({})", self.to_hex())
    }
}

impl FromStr for ReportDigest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ReportDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ReportDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// The ordered field tuple a digest commits to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalReport {
    /// Report identifier shared by the record store and the ledger.
    pub report_id: String,
    /// Free-text incident description.
    pub description: String,
    /// Where the incident happened.
    pub location: String,
    /// Incident category.
    pub category: String,
    /// Content identifier returned by the evidence upload service.
    pub evidence_content_id: String,
}

impl CanonicalReport {
    /// Builds a canonical tuple from borrowed or owned strings.
    pub fn new(
        report_id: impl Into<String>,
        description: impl Into<String>,
        location: impl Into<String>,
        category: impl Into<String>,
        evidence_content_id: impl Into<String>,
    ) -> Self {
        Self {
            report_id: report_id.into(),
            description: description.into(),
            location: location.into(),
            category: category.into(),
            evidence_content_id: evidence_content_id.into(),
        }
    }

    /// Checks that every field is present.
    pub fn validate(&self) -> Result<(), DigestError> {
        for (field, value) in self.fields() {
            if value.trim().is_empty() {
                return Err(DigestError::InvalidInput { field });
            }
        }
        Ok(())
    }

    /// Digest under the current encoding.
    pub fn digest(&self) -> Result<ReportDigest, DigestError> {
        self.digest_with(DigestVersion::V1)
    }

    /// Digest under an explicit encoding version.
    pub fn digest_with(&self, version: DigestVersion) -> Result<ReportDigest, DigestError> {
        self.validate()?;
        let mut hasher = Sha256::new();
        match version {
            DigestVersion::LegacyConcat => {
                for (_, value) in self.fields() {
                    hasher.update(value.as_bytes());
                }
            }
            DigestVersion::V1 => {
                hasher.update(REPORT_DOMAIN_V1);
                for (_, value) in self.fields() {
                    hasher.update((value.len() as u64).to_be_bytes());
                    hasher.update(value.as_bytes());
                }
            }
        }
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&hasher.finalize());
        Ok(ReportDigest(out))
    }

    fn fields(&self) -> [(&'static str, &str); 5] {
        [
            ("report_id", self.report_id.as_str()),
            ("description", self.description.as_str()),
            ("location", self.location.as_str()),
            ("category", self.category.as_str()),
            ("evidence_content_id", self.evidence_content_id.as_str()),
        ]
    }
}

/// Computes the current-version digest of the five canonical fields.
pub fn compute_digest(
    report_id: &str,
    description: &str,
    location: &str,
    category: &str,
    evidence_content_id: &str,
) -> Result<ReportDigest, DigestError> {
    CanonicalReport::new(report_id, description, location, category, evidence_content_id).digest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> CanonicalReport {
        CanonicalReport::new("RPT1", "Bike stolen", "5th Ave", "Theft", "Qm123")
    }

    #[test]
    fn digest_is_stable_hex() {
        let digest = sample().digest().unwrap();
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(ReportDigest::from_hex(&hex).unwrap(), digest);
        assert_eq!(ReportDigest::from_hex(&format!("0x{}", hex.to_uppercase())).unwrap(), digest);
    }

    #[test]
    fn legacy_matches_plain_concatenation() {
        let digest = sample().digest_with(DigestVersion::LegacyConcat).unwrap();
        let expected = Sha256::digest(b"RPT1Bike stolen5th AveTheftQm123");
        assert_eq!(digest.as_bytes().as_slice(), expected.as_slice());
    }

    #[test]
    fn length_prefix_separates_shifted_boundaries() {
        let left = CanonicalReport::new("R", "ab", "c", "Theft", "Qm1");
        let right = CanonicalReport::new("R", "a", "bc", "Theft", "Qm1");
        assert_eq!(
            left.digest_with(DigestVersion::LegacyConcat).unwrap(),
            right.digest_with(DigestVersion::LegacyConcat).unwrap()
        );
        assert_ne!(left.digest().unwrap(), right.digest().unwrap());
    }

    #[test]
    fn versions_differ() {
        let report = sample();
        assert_ne!(
            report.digest().unwrap(),
            report.digest_with(DigestVersion::LegacyConcat).unwrap()
        );
    }

    #[test]
    fn blank_fields_are_rejected() {
        let mut report = sample();
        report.location = "   ".into();
        assert_eq!(
            report.digest(),
            Err(DigestError::InvalidInput { field: "location" })
        );
        assert!(compute_digest("", "a", "b", "c", "d").is_err());
        assert!(compute_digest("id", "a", "b", "c", "").is_err());
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert!(ReportDigest::from_hex("abcd").is_err());
        assert!(ReportDigest::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn serde_uses_hex_string() {
        let digest = sample().digest().unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest.to_hex()));
        let back: ReportDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }

    fn field() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 ]{0,24}[a-zA-Z0-9]"
    }

    proptest! {
        #[test]
        fn digest_is_deterministic(
            id in field(), desc in field(), loc in field(), cat in field(), cid in field()
        ) {
            let a = compute_digest(&id, &desc, &loc, &cat, &cid).unwrap();
            let b = compute_digest(&id, &desc, &loc, &cat, &cid).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn single_character_change_alters_digest(
            id in field(), desc in field(), loc in field(), cat in field(), cid in field(),
            which in 0usize..5, pos in any::<prop::sample::Index>()
        ) {
            let original = CanonicalReport::new(id, desc, loc, cat, cid);
            let mut mutated = original.clone();
            let target = match which {
                0 => &mut mutated.report_id,
                1 => &mut mutated.description,
                2 => &mut mutated.location,
                3 => &mut mutated.category,
                _ => &mut mutated.evidence_content_id,
            };
            let mut chars: Vec<char> = target.chars().collect();
            let idx = pos.index(chars.len());
            chars[idx] = if chars[idx] == 'x' { 'y' } else { 'x' };
            *target = chars.into_iter().collect();
            if mutated.validate().is_ok() {
                prop_assert_ne!(original.digest().unwrap(), mutated.digest().unwrap());
            }
        }
    }
}
