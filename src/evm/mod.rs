#![cfg(feature = "net")]

//! Ethereum JSON-RPC backend for a deployed report registry contract.

pub mod abi;
pub mod tx;

use self::tx::LegacyTx;
use crate::config::AnchorConfig;
use crate::contract::LedgerRecord;
use crate::credential::{Address, SigningCredential};
use crate::digest::ReportDigest;
use crate::ledger::{LedgerBackend, LedgerFault, TxHash, TxReceipt};
use crate::status::ReportStatus;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// [`LedgerBackend`] speaking JSON-RPC to an Ethereum-compatible node.
///
/// Uses a blocking HTTP client; construct and drop it outside async
/// contexts and call it from worker threads.
pub struct EvmLedger {
    client: Client,
    rpc_url: String,
    contract: Address,
    chain_id: u64,
    gas_limit: u64,
    next_id: AtomicU64,
    send_lock: Mutex<()>,
}

impl EvmLedger {
    /// Connects to the node named in `cfg`.
    pub fn new(cfg: &AnchorConfig) -> Result<Self, LedgerFault> {
        let client = Client::builder()
            .timeout(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
            .build()
            .map_err(|err| LedgerFault::Unreachable(err.to_string()))?;
        Ok(Self {
            client,
            rpc_url: cfg.rpc_url.clone(),
            contract: cfg.contract_address,
            chain_id: cfg.chain_id,
            gas_limit: cfg.gas_limit,
            next_id: AtomicU64::new(1),
            send_lock: Mutex::new(()),
        })
    }

    fn request(&self, method: &str, params: Value) -> Result<Value, LedgerFault> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let response: Value = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .map_err(|err| LedgerFault::Unreachable(err.to_string()))?
            .json()
            .map_err(|err| LedgerFault::Rpc(format!("{method}: {err}")))?;
        if let Some(error) = response.get("error") {
            return Err(fault_from_rpc_error(error));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    fn call(&self, data: Vec<u8>) -> Result<Vec<u8>, LedgerFault> {
        let result = self.request(
            "eth_call",
            json!([{"to": self.contract.to_string(), "data": to_hex(&data)}, "latest"]),
        )?;
        decode_hex_value(&result)
    }

    fn send(&self, credential: &SigningCredential, data: Vec<u8>) -> Result<TxHash, LedgerFault> {
        let from = credential.address().to_string();
        let call = json!({"from": from, "to": self.contract.to_string(), "data": to_hex(&data)});
        let _guard = self
            .send_lock
            .lock()
            .map_err(|_| LedgerFault::Rpc("send lock poisoned".into()))?;

        // Reverting calls fail here with their reason, before anything is signed.
        let estimate = quantity(&self.request("eth_estimateGas", json!([call]))?)?;
        let nonce = quantity(&self.request("eth_getTransactionCount", json!([from, "pending"]))?)?;
        let gas_price = quantity(&self.request("eth_gasPrice", json!([]))?)?;
        let tx = LegacyTx {
            nonce,
            gas_price: u128::from(gas_price),
            gas_limit: self.gas_limit.max(estimate + estimate / 5),
            to: self.contract,
            value: 0,
            data,
            chain_id: self.chain_id,
        };
        let signed = tx
            .sign(credential)
            .map_err(|err| LedgerFault::Rpc(err.to_string()))?;
        let result = self.request("eth_sendRawTransaction", json!([to_hex(&signed.raw)]))?;
        let tx_hash: TxHash = result
            .as_str()
            .ok_or_else(|| LedgerFault::Rpc("eth_sendRawTransaction returned no hash".into()))?
            .parse()?;
        debug!(tx_hash = %tx_hash, nonce, gas_limit = tx.gas_limit, "raw transaction sent");
        Ok(tx_hash)
    }
}

impl LedgerBackend for EvmLedger {
    fn submit_store_digest(
        &self,
        credential: &SigningCredential,
        report_id: &str,
        digest: &ReportDigest,
    ) -> Result<TxHash, LedgerFault> {
        self.send(credential, abi::encode_store_hash(report_id, digest))
    }

    fn receipt(&self, tx: &TxHash) -> Result<Option<TxReceipt>, LedgerFault> {
        let result = self.request("eth_getTransactionReceipt", json!([tx.to_string()]))?;
        if result.is_null() {
            return Ok(None);
        }
        let block_number = quantity(field(&result, "blockNumber")?)?;
        let success = quantity(field(&result, "status")?)? == 1;
        let from = field(&result, "from")?
            .as_str()
            .ok_or_else(|| LedgerFault::Rpc("receipt sender is not a string".into()))?
            .parse()
            .map_err(|err: crate::credential::CredentialError| LedgerFault::Rpc(err.to_string()))?;
        Ok(Some(TxReceipt {
            tx_hash: *tx,
            block_number,
            from,
            success,
            revert_reason: None,
        }))
    }

    fn get_report(&self, report_id: &str) -> Result<LedgerRecord, LedgerFault> {
        abi::decode_get_report(&self.call(abi::encode_get_report(report_id))?)
    }

    fn verify_hash(&self, report_id: &str, digest: &ReportDigest) -> Result<bool, LedgerFault> {
        let matched = abi::decode_bool(&self.call(abi::encode_verify_hash(report_id, digest))?)?;
        if !matched {
            // verifyHash answers false for unknown ids too.
            self.get_report(report_id)?;
        }
        Ok(matched)
    }

    fn submit_update_status(
        &self,
        credential: &SigningCredential,
        report_id: &str,
        status: &ReportStatus,
    ) -> Result<TxHash, LedgerFault> {
        self.send(credential, abi::encode_update_status(report_id, status))
    }

    fn find_store_tx(&self, report_id: &str) -> Result<Option<TxHash>, LedgerFault> {
        let topic = format!("0x{}", hex::encode(abi::event_topic(abi::HASH_STORED_EVENT)));
        let logs = self.request(
            "eth_getLogs",
            json!([{
                "address": self.contract.to_string(),
                "fromBlock": "0x0",
                "toBlock": "latest",
                "topics": [topic],
            }]),
        )?;
        let logs = logs
            .as_array()
            .ok_or_else(|| LedgerFault::Rpc("eth_getLogs returned a non-array".into()))?;
        for log in logs {
            let data = decode_hex_value(field(log, "data")?)?;
            let (logged_id, _, _) = abi::decode_hash_stored(&data)?;
            if logged_id == report_id {
                let tx_hash = field(log, "transactionHash")?
                    .as_str()
                    .ok_or_else(|| LedgerFault::Rpc("log hash is not a string".into()))?
                    .parse()?;
                return Ok(Some(tx_hash));
            }
        }
        Ok(None)
    }
}

fn fault_from_rpc_error(error: &Value) -> LedgerFault {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown rpc error");
    if message.to_ascii_lowercase().contains("insufficient funds") {
        return LedgerFault::InsufficientFunds;
    }
    let revert = error
        .get("data")
        .and_then(|data| match data {
            Value::String(text) => Some(text.as_str()),
            Value::Object(obj) => obj.get("data").and_then(Value::as_str),
            _ => None,
        })
        .and_then(|text| decode_hex_str(text).ok())
        .and_then(|bytes| abi::decode_revert_reason(&bytes));
    match revert {
        Some(reason) => LedgerFault::from_revert_reason(&reason),
        None if message.contains("revert") => LedgerFault::from_revert_reason(message),
        None if abi::is_not_found(message) => LedgerFault::NotFound,
        None => LedgerFault::Rpc(message.to_string()),
    }
}

fn field<'a>(value: &'a Value, name: &str) -> Result<&'a Value, LedgerFault> {
    value
        .get(name)
        .ok_or_else(|| LedgerFault::Rpc(format!("missing field {name}")))
}

fn quantity(value: &Value) -> Result<u64, LedgerFault> {
    let text = value
        .as_str()
        .ok_or_else(|| LedgerFault::Rpc(format!("expected hex quantity, found {value}")))?;
    let raw = text
        .strip_prefix("0x")
        .ok_or_else(|| LedgerFault::Rpc(format!("quantity {text} lacks 0x prefix")))?;
    u64::from_str_radix(raw, 16).map_err(|err| LedgerFault::Rpc(err.to_string()))
}

fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn decode_hex_str(text: &str) -> Result<Vec<u8>, LedgerFault> {
    let raw = text.strip_prefix("0x").unwrap_or(text);
    hex::decode(raw).map_err(|err| LedgerFault::Rpc(err.to_string()))
}

fn decode_hex_value(value: &Value) -> Result<Vec<u8>, LedgerFault> {
    decode_hex_str(
        value
            .as_str()
            .ok_or_else(|| LedgerFault::Rpc(format!("expected hex data, found {value}")))?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_errors_map_to_faults() {
        let mut revert_data = abi::ERROR_SELECTOR.to_vec();
        let mut offset = [0u8; 32];
        offset[31] = 32;
        revert_data.extend_from_slice(&offset);
        let reason = b"Hash already stored for this report";
        let mut len = [0u8; 32];
        len[31] = reason.len() as u8;
        revert_data.extend_from_slice(&len);
        revert_data.extend_from_slice(reason);
        revert_data.resize(4 + 64 + 64, 0);

        let with_data = json!({"code": 3, "message": "execution reverted", "data": to_hex(&revert_data)});
        assert_eq!(fault_from_rpc_error(&with_data), LedgerFault::AlreadyStored);

        let message_only =
            json!({"code": -32603, "message": "execution reverted: Only admin can call this"});
        assert_eq!(fault_from_rpc_error(&message_only), LedgerFault::Unauthorized);

        let funds = json!({"code": -32000, "message": "Insufficient funds for gas * price + value"});
        assert_eq!(fault_from_rpc_error(&funds), LedgerFault::InsufficientFunds);

        let other = json!({"code": -32601, "message": "method not found"});
        assert_eq!(
            fault_from_rpc_error(&other),
            LedgerFault::Rpc("method not found".into())
        );
    }

    #[test]
    fn quantities_parse() {
        assert_eq!(quantity(&json!("0x1b")).unwrap(), 27);
        assert!(quantity(&json!("27")).is_err());
        assert!(quantity(&json!(27)).is_err());
    }
}
