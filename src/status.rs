//! Report status values shared by the record store and the ledger.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Operational status of a report.
///
/// The ledger stores status as free text, so unknown values survive as
/// [`ReportStatus::Other`] instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ReportStatus {
    /// Freshly submitted, not yet looked at.
    #[default]
    Pending,
    /// Being reviewed by an operator.
    UnderReview,
    /// Closed.
    Resolved,
    /// Any status name this build does not know about.
    Other(String),
}

/// Rejected status text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("status must be a non-empty string")]
pub struct EmptyStatus;

impl ReportStatus {
    /// Wire name written to the ledger and the record store.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::UnderReview => "Under Review",
            Self::Resolved => "Resolved",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = EmptyStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "" => Err(EmptyStatus),
            "Pending" => Ok(Self::Pending),
            "Under Review" => Ok(Self::UnderReview),
            "Resolved" => Ok(Self::Resolved),
            other => Ok(Self::Other(other.to_string())),
        }
    }
}

impl Serialize for ReportStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ReportStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_round_trip() {
        for status in [
            ReportStatus::Pending,
            ReportStatus::UnderReview,
            ReportStatus::Resolved,
        ] {
            assert_eq!(status.as_str().parse::<ReportStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_names_are_preserved() {
        let status: ReportStatus = "Escalated".parse().unwrap();
        assert_eq!(status, ReportStatus::Other("Escalated".into()));
        assert_eq!(status.to_string(), "Escalated");
        assert_eq!(
            "resolved".parse::<ReportStatus>().unwrap(),
            ReportStatus::Other("resolved".into())
        );
    }

    #[test]
    fn empty_is_rejected() {
        assert_eq!("  ".parse::<ReportStatus>(), Err(EmptyStatus));
        assert!(serde_json::from_str::<ReportStatus>("\"\"").is_err());
    }

    #[test]
    fn serde_uses_wire_name() {
        let json = serde_json::to_string(&ReportStatus::UnderReview).unwrap();
        assert_eq!(json, "\"Under Review\"");
    }
}
