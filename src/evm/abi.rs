//! Solidity ABI encoding for the report registry's four entry points.
//!
//! Only the shapes the registry uses are supported: `string`, `bytes32`,
//! `address`, `uint256` and `bool`, all in flat argument lists.

use crate::contract::{LedgerRecord, REVERT_NOT_FOUND};
use crate::credential::{keccak256, Address};
use crate::digest::ReportDigest;
use crate::ledger::LedgerFault;
use crate::status::ReportStatus;

const WORD: usize = 32;

/// `Error(string)` revert payload selector.
pub const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Canonical signatures of the registry entry points.
pub const STORE_HASH: &str = "storeHash(string,bytes32)";
/// `getReport(string) returns (bytes32,address,uint256,string)`.
pub const GET_REPORT: &str = "getReport(string)";
/// `verifyHash(string,bytes32) returns (bool)`.
pub const VERIFY_HASH: &str = "verifyHash(string,bytes32)";
/// `updateStatus(string,string)`.
pub const UPDATE_STATUS: &str = "updateStatus(string,string)";
/// `HashStored(string,bytes32,address)` event signature.
pub const HASH_STORED_EVENT: &str = "HashStored(string,bytes32,address)";

/// First four bytes of the Keccak-256 of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic hash of an event signature.
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

enum Token<'a> {
    Str(&'a str),
    Bytes32(&'a [u8; 32]),
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(WORD) * WORD
}

fn u64_word(value: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&value.to_be_bytes());
    word
}

fn encode_call(signature: &str, tokens: &[Token<'_>]) -> Vec<u8> {
    let mut head = Vec::with_capacity(tokens.len() * WORD);
    let mut tail = Vec::new();
    let head_len = tokens.len() * WORD;
    for token in tokens {
        match token {
            Token::Bytes32(bytes) => head.extend_from_slice(&bytes[..]),
            Token::Str(text) => {
                head.extend_from_slice(&u64_word((head_len + tail.len()) as u64));
                tail.extend_from_slice(&u64_word(text.len() as u64));
                tail.extend_from_slice(text.as_bytes());
                tail.resize(tail.len() + padded_len(text.len()) - text.len(), 0);
            }
        }
    }
    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&selector(signature));
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    out
}

/// Calldata for `storeHash(reportId, hash)`.
pub fn encode_store_hash(report_id: &str, digest: &ReportDigest) -> Vec<u8> {
    encode_call(
        STORE_HASH,
        &[Token::Str(report_id), Token::Bytes32(digest.as_bytes())],
    )
}

/// Calldata for `getReport(reportId)`.
pub fn encode_get_report(report_id: &str) -> Vec<u8> {
    encode_call(GET_REPORT, &[Token::Str(report_id)])
}

/// Calldata for `verifyHash(reportId, hash)`.
pub fn encode_verify_hash(report_id: &str, digest: &ReportDigest) -> Vec<u8> {
    encode_call(
        VERIFY_HASH,
        &[Token::Str(report_id), Token::Bytes32(digest.as_bytes())],
    )
}

/// Calldata for `updateStatus(reportId, status)`.
pub fn encode_update_status(report_id: &str, status: &ReportStatus) -> Vec<u8> {
    encode_call(
        UPDATE_STATUS,
        &[Token::Str(report_id), Token::Str(status.as_str())],
    )
}

fn word(data: &[u8], index: usize) -> Result<&[u8], LedgerFault> {
    data.get(index * WORD..(index + 1) * WORD)
        .ok_or_else(|| LedgerFault::Rpc(format!("abi data too short for word {index}")))
}

fn word_u64(data: &[u8], index: usize) -> Result<u64, LedgerFault> {
    let raw = word(data, index)?;
    if raw[..WORD - 8].iter().any(|b| *b != 0) {
        return Err(LedgerFault::Rpc(format!("abi word {index} overflows u64")));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[WORD - 8..]);
    Ok(u64::from_be_bytes(bytes))
}

fn word_address(data: &[u8], index: usize) -> Result<Address, LedgerFault> {
    let raw = word(data, index)?;
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&raw[12..]);
    Ok(Address::from_bytes(bytes))
}

fn dynamic_string(data: &[u8], head_index: usize) -> Result<String, LedgerFault> {
    let overflow = || LedgerFault::Rpc("abi offset overflow".into());
    let offset = usize::try_from(word_u64(data, head_index)?).map_err(|_| overflow())?;
    let start = offset.checked_add(WORD).ok_or_else(overflow)?;
    let len_word = data
        .get(offset..start)
        .ok_or_else(|| LedgerFault::Rpc("abi string offset out of range".into()))?;
    let len = usize::try_from(word_u64(len_word, 0)?).map_err(|_| overflow())?;
    let end = start.checked_add(len).ok_or_else(overflow)?;
    let bytes = data
        .get(start..end)
        .ok_or_else(|| LedgerFault::Rpc("abi string length out of range".into()))?;
    String::from_utf8(bytes.to_vec()).map_err(|err| LedgerFault::Rpc(err.to_string()))
}

/// Decodes the `getReport` return tuple.
///
/// A zero hash with a zero reporter is what an unset mapping entry returns
/// when the contract does not revert, and is reported as `NotFound`.
pub fn decode_get_report(data: &[u8]) -> Result<LedgerRecord, LedgerFault> {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(word(data, 0)?);
    let submitter = word_address(data, 1)?;
    if digest == [0u8; 32] && submitter == Address::default() {
        return Err(LedgerFault::NotFound);
    }
    let stored_at = word_u64(data, 2)?;
    let status = dynamic_string(data, 3)?;
    Ok(LedgerRecord {
        digest: ReportDigest::from_bytes(digest),
        submitter,
        stored_at,
        status: status.parse().unwrap_or_default(),
    })
}

/// Decodes a single `bool` return value.
pub fn decode_bool(data: &[u8]) -> Result<bool, LedgerFault> {
    Ok(word_u64(data, 0)? != 0)
}

/// Extracts the reason from `Error(string)` revert data.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let body = data.strip_prefix(&ERROR_SELECTOR[..])?;
    dynamic_string(body, 0).ok()
}

/// Decodes the data section of a `HashStored` log.
pub fn decode_hash_stored(data: &[u8]) -> Result<(String, ReportDigest, Address), LedgerFault> {
    let report_id = dynamic_string(data, 0)?;
    let mut digest = [0u8; 32];
    digest.copy_from_slice(word(data, 1)?);
    let submitter = word_address(data, 2)?;
    Ok((report_id, ReportDigest::from_bytes(digest), submitter))
}

/// True when a revert reason means the id has no record.
pub fn is_not_found(reason: &str) -> bool {
    reason.contains(REVERT_NOT_FOUND)
}
