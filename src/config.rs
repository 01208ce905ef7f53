//! Runtime configuration for anchoring.
//!
//! Settings come from the environment (the same variable names the
//! deployment scripts already export) or from a JSON file.  Key material is
//! never read from the JSON document itself, only from a file or variable it
//! names.

use crate::credential::{Address, KeySource};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CHAIN_ID: u64 = 31_337;
const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_GAS_LIMIT: u64 = 200_000;

/// Errors raised while assembling configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required setting was absent.
    #[error("missing setting {0}")]
    Missing(&'static str),
    /// A setting could not be parsed.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// Setting name.
        name: &'static str,
        /// Parse failure.
        reason: String,
    },
    /// The config file could not be read or decoded.
    #[error("config file error: {0}")]
    File(String),
}

/// Timing knobs used by the anchor client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorSettings {
    /// Upper bound on submission plus confirmation.
    pub confirm_timeout: Duration,
    /// Delay between receipt polls.
    pub poll_interval: Duration,
}

impl Default for AnchorSettings {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_millis(DEFAULT_CONFIRM_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Everything needed to reach a deployed report registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorConfig {
    /// JSON-RPC endpoint of the ledger node.
    pub rpc_url: String,
    /// Address of the deployed registry contract.
    pub contract_address: Address,
    /// EIP-155 chain id used when signing.
    pub chain_id: u64,
    /// Gas limit attached to write transactions.
    pub gas_limit: u64,
    /// Timing knobs for the anchor client.
    pub settings: AnchorSettings,
    /// Where the signing key comes from.
    pub key: KeySource,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    rpc_url: String,
    contract_address: String,
    #[serde(default)]
    chain_id: Option<u64>,
    #[serde(default)]
    gas_limit: Option<u64>,
    #[serde(default)]
    confirm_timeout_ms: Option<u64>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    key_file: Option<PathBuf>,
    #[serde(default)]
    key_env: Option<String>,
}

impl AnchorConfig {
    /// Reads `RPC_URL`, `CONTRACT_ADDRESS`, `PRIVATE_KEY` / `PRIVATE_KEY_FILE`,
    /// `CHAIN_ID`, `ANCHOR_TIMEOUT_MS`, `ANCHOR_POLL_MS` and `ANCHOR_GAS_LIMIT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`AnchorConfig::from_env`] over an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rpc_url = lookup("RPC_URL").ok_or(ConfigError::Missing("RPC_URL"))?;
        let contract_address = parse_address(
            "CONTRACT_ADDRESS",
            &lookup("CONTRACT_ADDRESS").ok_or(ConfigError::Missing("CONTRACT_ADDRESS"))?,
        )?;
        let key = if lookup("PRIVATE_KEY").is_some() {
            KeySource::Env("PRIVATE_KEY".to_string())
        } else if let Some(path) = lookup("PRIVATE_KEY_FILE") {
            KeySource::File(PathBuf::from(path))
        } else {
            return Err(ConfigError::Missing("PRIVATE_KEY"));
        };
        Ok(Self {
            rpc_url,
            contract_address,
            chain_id: parse_u64("CHAIN_ID", lookup("CHAIN_ID"))?.unwrap_or(DEFAULT_CHAIN_ID),
            gas_limit: parse_u64("ANCHOR_GAS_LIMIT", lookup("ANCHOR_GAS_LIMIT"))?
                .unwrap_or(DEFAULT_GAS_LIMIT),
            settings: AnchorSettings {
                confirm_timeout: Duration::from_millis(
                    parse_u64("ANCHOR_TIMEOUT_MS", lookup("ANCHOR_TIMEOUT_MS"))?
                        .unwrap_or(DEFAULT_CONFIRM_TIMEOUT_MS),
                ),
                poll_interval: Duration::from_millis(
                    parse_u64("ANCHOR_POLL_MS", lookup("ANCHOR_POLL_MS"))?
                        .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
            },
            key,
        })
    }

    /// Loads a JSON config document.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|err| ConfigError::File(err.to_string()))?;
        Self::from_json_str(&contents)
    }

    /// Parses a JSON config document.
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            serde_json::from_str(contents).map_err(|err| ConfigError::File(err.to_string()))?;
        let key = match (file.key_file, file.key_env) {
            (Some(path), _) => KeySource::File(path),
            (None, Some(name)) => KeySource::Env(name),
            (None, None) => return Err(ConfigError::Missing("key_file or key_env")),
        };
        Ok(Self {
            rpc_url: file.rpc_url,
            contract_address: parse_address("contract_address", &file.contract_address)?,
            chain_id: file.chain_id.unwrap_or(DEFAULT_CHAIN_ID),
            gas_limit: file.gas_limit.unwrap_or(DEFAULT_GAS_LIMIT),
            settings: AnchorSettings {
                confirm_timeout: Duration::from_millis(
                    file.confirm_timeout_ms.unwrap_or(DEFAULT_CONFIRM_TIMEOUT_MS),
                ),
                poll_interval: Duration::from_millis(
                    file.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
            },
            key,
        })
    }
}

fn parse_address(name: &'static str, value: &str) -> Result<Address, ConfigError> {
    value.parse().map_err(|err: crate::credential::CredentialError| ConfigError::Invalid {
        name,
        reason: err.to_string(),
    })
}

fn parse_u64(name: &'static str, value: Option<String>) -> Result<Option<u64>, ConfigError> {
    value
        .map(|v| {
            v.trim().parse::<u64>().map_err(|err| ConfigError::Invalid {
                name,
                reason: err.to_string(),
            })
        })
        .transpose()
}
