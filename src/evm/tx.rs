//! Legacy (pre-1559) transactions with EIP-155 replay protection.

use crate::credential::{keccak256, Address, CredentialError, SigningCredential};
use crate::ledger::TxHash;
use rlp::RlpStream;

/// Unsigned contract call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTx {
    /// Sender account nonce.
    pub nonce: u64,
    /// Price per gas unit in wei.
    pub gas_price: u128,
    /// Gas limit.
    pub gas_limit: u64,
    /// Contract being called.
    pub to: Address,
    /// Wei attached to the call.
    pub value: u128,
    /// ABI-encoded calldata.
    pub data: Vec<u8>,
    /// EIP-155 chain id.
    pub chain_id: u64,
}

/// Signed, RLP-encoded transaction ready for `eth_sendRawTransaction`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    /// Raw transaction bytes.
    pub raw: Vec<u8>,
    /// Keccak-256 of `raw`.
    pub hash: TxHash,
}

impl LegacyTx {
    fn append_fields(&self, stream: &mut RlpStream) {
        let to: &[u8] = self.to.as_bytes();
        let data: &[u8] = &self.data;
        stream.append(&self.nonce);
        stream.append(&self.gas_price);
        stream.append(&self.gas_limit);
        stream.append(&to);
        stream.append(&self.value);
        stream.append(&data);
    }

    /// RLP payload that gets hashed for signing.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_fields(&mut stream);
        stream.append(&self.chain_id);
        stream.append_empty_data();
        stream.append_empty_data();
        stream.out().to_vec()
    }

    /// Hash the sender signs.
    pub fn signing_hash(&self) -> [u8; 32] {
        keccak256(&self.signing_payload())
    }

    /// Signs with `credential`, producing the raw transaction.
    pub fn sign(&self, credential: &SigningCredential) -> Result<SignedTx, CredentialError> {
        let signature = credential.sign_prehash(&self.signing_hash())?;
        let v = u64::from(signature.recovery_id) + self.chain_id * 2 + 35;
        let r = trim_leading_zeros(&signature.r);
        let s = trim_leading_zeros(&signature.s);

        let mut stream = RlpStream::new_list(9);
        self.append_fields(&mut stream);
        stream.append(&v);
        stream.append(&r);
        stream.append(&s);
        let raw = stream.out().to_vec();
        let hash = TxHash::from_bytes(keccak256(&raw));
        Ok(SignedTx { raw, hash })
    }
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::RecoverableSignature;
    use rlp::Rlp;

    fn eip155_example() -> LegacyTx {
        LegacyTx {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: Address::from_bytes([0x35; 20]),
            value: 1_000_000_000_000_000_000,
            data: Vec::new(),
            chain_id: 1,
        }
    }

    #[test]
    fn signing_payload_matches_eip155_vector() {
        let tx = eip155_example();
        assert_eq!(
            hex::encode(tx.signing_payload()),
            "ec098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a764000080018080"
        );
        assert_eq!(
            hex::encode(tx.signing_hash()),
            "daf5a779ae972f972197303d7b574746c7ef83eadac0f2791ad23db92e4c8e53"
        );
    }

    #[test]
    fn signed_tx_recovers_sender() {
        let credential = SigningCredential::from_hex(
            "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
        )
        .unwrap();
        let tx = LegacyTx {
            chain_id: 31_337,
            data: vec![0xde, 0xad, 0xbe, 0xef],
            ..eip155_example()
        };
        let signed = tx.sign(&credential).unwrap();
        assert_eq!(signed.hash.as_bytes(), &keccak256(&signed.raw));

        let rlp = Rlp::new(&signed.raw);
        assert_eq!(rlp.item_count().unwrap(), 9);
        let data: Vec<u8> = rlp.val_at(5).unwrap();
        assert_eq!(data, tx.data);
        let v: u64 = rlp.val_at(6).unwrap();
        let recovery_id = (v - 35 - 31_337 * 2) as u8;
        assert!(recovery_id <= 1);

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        let r_raw: Vec<u8> = rlp.val_at(7).unwrap();
        let s_raw: Vec<u8> = rlp.val_at(8).unwrap();
        r[32 - r_raw.len()..].copy_from_slice(&r_raw);
        s[32 - s_raw.len()..].copy_from_slice(&s_raw);
        let recovered = RecoverableSignature { r, s, recovery_id }
            .recover(&tx.signing_hash())
            .unwrap();
        assert_eq!(recovered, credential.address());
    }
}
