//! Ledger principals and the process-wide signing credential.
//!
//! Principals are 20-byte account addresses derived the Ethereum way: the
//! last 20 bytes of the Keccak-256 hash of the uncompressed secp256k1 public
//! key.  The contract's admin check is a plain comparison between two such
//! addresses.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// Length of a secp256k1 secret scalar in bytes.
pub const SECRET_KEY_LENGTH: usize = 32;

/// Computes the Keccak-256 hash of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Account address of a ledger principal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    /// Wraps raw address bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Raw address bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Derives the address controlled by `key`.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Self(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let raw = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| CredentialError::Decode("address must start with 0x".into()))?;
        let bytes = hex::decode(raw).map_err(|err| CredentialError::Decode(err.to_string()))?;
        if bytes.len() != 20 {
            return Err(CredentialError::InvalidLength(bytes.len()));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors reported while loading or using key material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// Underlying filesystem failure.
    #[error("key I/O error: {0}")]
    Io(String),
    /// Hex or scalar decoding failure.
    #[error("key decode error: {0}")]
    Decode(String),
    /// Buffer did not match the expected length.
    #[error("unexpected key length: {0}")]
    InvalidLength(usize),
    /// The named environment variable was unset.
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    /// Signing failed inside the curve backend.
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Describes where the signing key comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Hex-encoded secret scalar, with or without `0x`.
    Hex(String),
    /// File holding the secret as raw bytes or hex text.
    File(PathBuf),
    /// Environment variable holding the hex secret.
    Env(String),
    /// Freshly generated throwaway key.
    Random,
}

impl KeySource {
    /// Parses a `--key` CLI argument: hex secrets, `env:NAME`, or a file path.
    pub fn from_spec(spec: Option<&str>) -> Self {
        match spec {
            Some(value) if value.starts_with("env:") => {
                Self::Env(value.trim_start_matches("env:").to_string())
            }
            Some(value) if looks_like_hex_secret(value) => Self::Hex(value.to_string()),
            Some(value) if !value.is_empty() => Self::File(PathBuf::from(value)),
            _ => Self::Random,
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hex(_) => f.write_str("Hex(<redacted>)"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Env(name) => f.debug_tuple("Env").field(name).finish(),
            Self::Random => f.write_str("Random"),
        }
    }
}

fn looks_like_hex_secret(value: &str) -> bool {
    let raw = value.strip_prefix("0x").unwrap_or(value);
    raw.len() == SECRET_KEY_LENGTH * 2 && raw.chars().all(|c| c.is_ascii_hexdigit())
}

/// Recoverable secp256k1 signature over a 32-byte prehash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    /// `r` scalar, big-endian.
    pub r: [u8; 32],
    /// `s` scalar, big-endian, low-s normalized.
    pub s: [u8; 32],
    /// Recovery id (y parity), 0 or 1.
    pub recovery_id: u8,
}

impl RecoverableSignature {
    /// Recovers the address that produced this signature over `prehash`.
    pub fn recover(&self, prehash: &[u8; 32]) -> Result<Address, CredentialError> {
        let sig = Signature::from_scalars(self.r, self.s)
            .map_err(|err| CredentialError::Decode(err.to_string()))?;
        let recid = RecoveryId::from_byte(self.recovery_id)
            .ok_or_else(|| CredentialError::Decode("invalid recovery id".into()))?;
        let key = VerifyingKey::recover_from_prehash(prehash, &sig, recid)
            .map_err(|err| CredentialError::Decode(err.to_string()))?;
        Ok(Address::from_verifying_key(&key))
    }
}

/// Signing key held by the anchor client.
///
/// Constructed once per process and shared behind an `Arc`.  Neither
/// `Debug` nor any accessor exposes the secret scalar.
pub struct SigningCredential {
    signing: SigningKey,
    address: Address,
}

impl SigningCredential {
    /// Loads a credential from the given source.
    pub fn load(source: &KeySource) -> Result<Self, CredentialError> {
        match source {
            KeySource::Hex(text) => Self::from_hex(text),
            KeySource::File(path) => Self::from_secret_bytes(&load_key_from_file(path)?),
            KeySource::Env(name) => {
                let text =
                    env::var(name).map_err(|_| CredentialError::MissingEnv(name.clone()))?;
                Self::from_hex(&text)
            }
            KeySource::Random => Ok(Self::random()),
        }
    }

    /// Generates a throwaway credential.
    pub fn random() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Decodes a hex secret scalar.
    pub fn from_hex(text: &str) -> Result<Self, CredentialError> {
        let trimmed = text.trim();
        let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(raw).map_err(|err| CredentialError::Decode(err.to_string()))?;
        Self::from_secret_bytes(&bytes)
    }

    /// Builds a credential from raw secret scalar bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CredentialError> {
        if bytes.len() != SECRET_KEY_LENGTH {
            return Err(CredentialError::InvalidLength(bytes.len()));
        }
        let signing =
            SigningKey::from_slice(bytes).map_err(|err| CredentialError::Decode(err.to_string()))?;
        Ok(Self::from_signing_key(signing))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let address = Address::from_verifying_key(signing.verifying_key());
        Self { signing, address }
    }

    /// Address this credential signs for.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs a 32-byte prehash, returning a recoverable signature.
    pub fn sign_prehash(&self, prehash: &[u8; 32]) -> Result<RecoverableSignature, CredentialError> {
        let (sig, recid) = self
            .signing
            .sign_prehash_recoverable(prehash)
            .map_err(|err| CredentialError::Signing(err.to_string()))?;
        let bytes = sig.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(RecoverableSignature {
            r,
            s,
            recovery_id: recid.to_byte(),
        })
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn load_key_from_file(path: &Path) -> Result<Vec<u8>, CredentialError> {
    let contents = fs::read(path).map_err(|err| CredentialError::Io(err.to_string()))?;
    if contents.len() == SECRET_KEY_LENGTH {
        return Ok(contents);
    }
    let text = std::str::from_utf8(&contents)
        .map_err(|err| CredentialError::Decode(err.to_string()))?
        .trim();
    let raw = text.strip_prefix("0x").unwrap_or(text);
    hex::decode(raw).map_err(|err| CredentialError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    // Hardhat's first default account.
    const HARDHAT_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const HARDHAT_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    #[test]
    fn derives_known_address() {
        let cred = SigningCredential::from_hex(HARDHAT_KEY).unwrap();
        assert_eq!(cred.address().to_string(), HARDHAT_ADDRESS);
        let prefixed = SigningCredential::from_hex(&format!("0x{HARDHAT_KEY}")).unwrap();
        assert_eq!(prefixed.address(), cred.address());
    }

    #[test]
    fn debug_never_prints_secret() {
        let cred = SigningCredential::from_hex(HARDHAT_KEY).unwrap();
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains(HARDHAT_KEY));
        assert!(rendered.contains(HARDHAT_ADDRESS));
        let source = KeySource::from_spec(Some(HARDHAT_KEY));
        assert!(!format!("{source:?}").contains(HARDHAT_KEY));
    }

    #[test]
    fn signature_recovers_signer() {
        let cred = SigningCredential::random();
        let prehash = keccak256(b"storeHash");
        let sig = cred.sign_prehash(&prehash).unwrap();
        assert_eq!(sig.recover(&prehash).unwrap(), cred.address());
    }

    #[test]
    fn key_source_parsing() {
        assert_eq!(KeySource::from_spec(None), KeySource::Random);
        assert_eq!(
            KeySource::from_spec(Some("env:PRIVATE_KEY")),
            KeySource::Env("PRIVATE_KEY".into())
        );
        assert_eq!(
            KeySource::from_spec(Some("/tmp/admin.key")),
            KeySource::File(PathBuf::from("/tmp/admin.key"))
        );
    }

    #[test]
    fn loads_hex_key_file() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = env::temp_dir().join(format!("anchor_key_{nanos}.txt"));
        fs::write(&path, format!("0x{HARDHAT_KEY}\n")).unwrap();
        let cred = SigningCredential::load(&KeySource::File(path.clone())).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(cred.address().to_string(), HARDHAT_ADDRESS);
    }

    #[test]
    fn address_parsing() {
        let addr: Address = HARDHAT_ADDRESS.parse().unwrap();
        assert_eq!(addr.to_string(), HARDHAT_ADDRESS);
        assert!("f39fd6e51aad88f6f4ce6ab8827279cfffb92266".parse::<Address>().is_err());
        assert!("0x1234".parse::<Address>().is_err());
    }
}
