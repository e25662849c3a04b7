//! Transaction model shared by the wallet and the DLC setup.
//!
//! The engine never constructs Bitcoin scripts itself; it works with this
//! reduced model where a transaction is a list of spent outpoints and
//! addressed outputs. The txid is the SHA-256 digest of the canonical
//! encoding and excludes signatures, so both parties can derive it before
//! signing.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Amount, CfdError, OutPoint, Result, Txid};

/// Domain tag for signatures over a funding transaction.
pub const FUNDING_TAG: &[u8] = b"cfdx:funding:v1:";
/// Domain tag for signatures over a contract execution transaction.
pub const CET_TAG: &[u8] = b"cfdx:cet:v1:";
/// Domain tag for signatures over a collaborative close transaction.
pub const CLOSE_TAG: &[u8] = b"cfdx:close:v1:";

/// An unspent output owned by the local wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
}

/// An addressed output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOut {
    pub address: String,
    pub value: Amount,
}

/// An unsigned transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOut>,
}

impl Transaction {
    /// Canonical byte encoding. Input and output order is significant.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.inputs.len() * 36 + self.outputs.len() * 48);
        buf.extend_from_slice(b"cfdx:tx:v1:");
        buf.extend_from_slice(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            buf.extend_from_slice(input.txid.as_bytes());
            buf.extend_from_slice(&input.vout.to_le_bytes());
        }
        buf.extend_from_slice(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            buf.extend_from_slice(&(output.address.len() as u64).to_le_bytes());
            buf.extend_from_slice(output.address.as_bytes());
            buf.extend_from_slice(&output.value.to_sat().to_le_bytes());
        }
        buf
    }

    #[must_use]
    pub fn txid(&self) -> Txid {
        Txid(Sha256::digest(self.canonical_bytes()).into())
    }

    #[must_use]
    pub fn total_output(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Bytes a party signs for this transaction under `tag`.
    #[must_use]
    pub fn signing_payload(&self, tag: &[u8], extra: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(tag.len() + 32 + extra.len());
        payload.extend_from_slice(tag);
        payload.extend_from_slice(self.txid().as_bytes());
        payload.extend_from_slice(extra);
        payload
    }

    #[must_use]
    pub fn sign(&self, key: &SigningKey, tag: &[u8], extra: &[u8]) -> Signature {
        key.sign(&self.signing_payload(tag, extra))
    }

    /// # Errors
    /// Returns `SignatureInvalid` naming `context` if the signature does not verify.
    pub fn verify(
        &self,
        key: &VerifyingKey,
        tag: &[u8],
        extra: &[u8],
        signature: &Signature,
        context: &str,
    ) -> Result<()> {
        key.verify(&self.signing_payload(tag, extra), signature)
            .map_err(|_| CfdError::SignatureInvalid {
                context: context.to_string(),
            })
    }
}

/// A transaction together with the signatures that authorize it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub signatures: Vec<(VerifyingKey, Signature)>,
}

impl SignedTransaction {
    #[must_use]
    pub fn txid(&self) -> Txid {
        self.tx.txid()
    }
}
