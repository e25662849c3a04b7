//! Noise protocol primitives: `CipherState` and `SymmetricState`.
//!
//! Only the suite `25519_ChaChaPoly_SHA256` is supported. The protocol name
//! is exactly 32 bytes long, so it is used as the initial handshake hash
//! without hashing. Both sides then mix in [`PROLOGUE`].

use std::fmt;

use cfdx_types::{CfdError, Result};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

/// Full protocol name, mixed into the handshake hash.
pub const PROTOCOL_NAME: &[u8; 32] = b"Noise_XX_25519_ChaChaPoly_SHA256";

/// Prologue mixed into the handshake hash right after initialization.
/// Peers with different prologues fail the handshake.
pub const PROLOGUE: &[u8] = b"cfdx/1";

/// Poly1305 tag length appended to every ciphertext.
pub const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// CipherState
// ---------------------------------------------------------------------------

/// One direction of an encrypted channel: a key and a 64-bit counter nonce.
///
/// Before a key is set, encryption is the identity function, as the Noise
/// framework requires for the first handshake message.
pub struct CipherState {
    cipher: Option<ChaCha20Poly1305>,
    nonce: u64,
}

impl CipherState {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            cipher: None,
            nonce: 0,
        }
    }

    #[must_use]
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            cipher: Some(ChaCha20Poly1305::new(Key::from_slice(&key))),
            nonce: 0,
        }
    }

    #[must_use]
    pub fn has_key(&self) -> bool {
        self.cipher.is_some()
    }

    /// Number of messages processed under the current key.
    #[must_use]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// # Errors
    /// Returns `CryptoFailure` if the nonce space is exhausted.
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };
        let nonce = next_nonce(&mut self.nonce)?;
        cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: ad })
            .map_err(|_| CfdError::CryptoFailure {
                reason: "encryption failed".into(),
            })
    }

    /// # Errors
    /// Returns `CryptoFailure` if authentication fails. The nonce still
    /// advances, so a failed frame poisons the rest of the stream.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(ciphertext.to_vec());
        };
        let nonce = next_nonce(&mut self.nonce)?;
        cipher
            .decrypt(&nonce, Payload { msg: ciphertext, aad: ad })
            .map_err(|_| CfdError::CryptoFailure {
                reason: "message authentication failed".into(),
            })
    }
}

fn next_nonce(counter: &mut u64) -> Result<Nonce> {
    if *counter == u64::MAX {
        return Err(CfdError::CryptoFailure {
            reason: "nonce space exhausted".into(),
        });
    }
    // 32 zero bits followed by the little-endian counter.
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    *counter += 1;
    Ok(*Nonce::from_slice(&bytes))
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("has_key", &self.has_key())
            .field("nonce", &self.nonce)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SymmetricState
// ---------------------------------------------------------------------------

/// Chaining key, handshake hash and the current handshake cipher.
#[derive(Debug)]
pub struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
    cipher: CipherState,
}

impl Default for SymmetricState {
    fn default() -> Self {
        Self::new()
    }
}

impl SymmetricState {
    /// `InitializeSymmetric(protocol_name)` followed by `MixHash(PROLOGUE)`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_prologue(PROLOGUE)
    }

    #[must_use]
    pub fn with_prologue(prologue: &[u8]) -> Self {
        let mut state = Self {
            ck: *PROTOCOL_NAME,
            h: *PROTOCOL_NAME,
            cipher: CipherState::empty(),
        };
        state.mix_hash(prologue);
        state
    }

    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    /// Mix a Diffie-Hellman output into the chaining key and rekey.
    ///
    /// # Errors
    /// Returns `CryptoFailure` if key derivation fails.
    pub fn mix_key(&mut self, input_key_material: &[u8]) -> Result<()> {
        let (ck, k) = hkdf2(&self.ck, input_key_material)?;
        self.ck = ck;
        self.cipher = CipherState::new(k);
        Ok(())
    }

    /// # Errors
    /// Returns `CryptoFailure` if encryption fails.
    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = self.cipher.encrypt_with_ad(&self.h, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// # Errors
    /// Returns `CryptoFailure` if authentication fails.
    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self.cipher.decrypt_with_ad(&self.h, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Length of `len` plaintext bytes once encrypted in the current state.
    #[must_use]
    pub fn encrypted_len(&self, len: usize) -> usize {
        if self.cipher.has_key() { len + TAG_LEN } else { len }
    }

    #[must_use]
    pub fn handshake_hash(&self) -> [u8; 32] {
        self.h
    }

    /// Derive the two transport ciphers: initiator-to-responder first.
    ///
    /// # Errors
    /// Returns `CryptoFailure` if key derivation fails.
    pub fn split(&self) -> Result<(CipherState, CipherState)> {
        let (k1, k2) = hkdf2(&self.ck, &[])?;
        Ok((CipherState::new(k1), CipherState::new(k2)))
    }
}

fn hkdf2(chaining_key: &[u8; 32], input_key_material: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    let hk = Hkdf::<Sha256>::new(Some(chaining_key), input_key_material);
    let mut okm = [0u8; 64];
    hk.expand(&[], &mut okm)
        .map_err(|_| CfdError::CryptoFailure {
            reason: "key derivation failed".into(),
        })?;
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_name_is_hash_sized() {
        assert_eq!(PROTOCOL_NAME.len(), 32);
    }

    #[test]
    fn prologue_is_mixed_into_the_initial_hash() {
        let expected: [u8; 32] = Sha256::new()
            .chain_update(PROTOCOL_NAME)
            .chain_update(PROLOGUE)
            .finalize()
            .into();
        assert_eq!(SymmetricState::new().handshake_hash(), expected);
        assert_ne!(
            SymmetricState::with_prologue(b"").handshake_hash(),
            SymmetricState::new().handshake_hash()
        );
    }

    #[test]
    fn empty_cipher_is_identity() {
        let mut c = CipherState::empty();
        assert_eq!(c.encrypt_with_ad(b"ad", b"hello").unwrap(), b"hello");
        assert_eq!(c.nonce(), 0);
    }

    #[test]
    fn encrypt_decrypt_in_lockstep() {
        let mut tx = CipherState::new([5; 32]);
        let mut rx = CipherState::new([5; 32]);
        for msg in [&b"one"[..], b"two", b""] {
            let ct = tx.encrypt_with_ad(&[], msg).unwrap();
            assert_eq!(ct.len(), msg.len() + TAG_LEN);
            assert_eq!(rx.decrypt_with_ad(&[], &ct).unwrap(), msg);
        }
        assert_eq!(tx.nonce(), 3);
    }

    #[test]
    fn dropped_frame_breaks_stream() {
        let mut tx = CipherState::new([5; 32]);
        let mut rx = CipherState::new([5; 32]);
        let _lost = tx.encrypt_with_ad(&[], b"first").unwrap();
        let second = tx.encrypt_with_ad(&[], b"second").unwrap();
        assert!(matches!(
            rx.decrypt_with_ad(&[], &second),
            Err(CfdError::CryptoFailure { .. })
        ));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let mut tx = CipherState::new([9; 32]);
        let mut rx = CipherState::new([9; 32]);
        let mut ct = tx.encrypt_with_ad(b"ad", b"payload").unwrap();
        ct[0] ^= 1;
        assert!(rx.decrypt_with_ad(b"ad", &ct).is_err());
    }

    #[test]
    fn split_is_deterministic_and_directional() {
        let mut a = SymmetricState::new();
        let mut b = SymmetricState::new();
        a.mix_key(b"shared").unwrap();
        b.mix_key(b"shared").unwrap();
        let (mut a1, _a2) = a.split().unwrap();
        let (mut b1, mut b2) = b.split().unwrap();
        let ct = a1.encrypt_with_ad(&[], b"x").unwrap();
        assert_eq!(b1.decrypt_with_ad(&[], &ct).unwrap(), b"x");
        let mut a1_again = a.split().unwrap().0;
        let ct2 = a1_again.encrypt_with_ad(&[], b"x").unwrap();
        assert!(b2.decrypt_with_ad(&[], &ct2).is_err());
    }
}
