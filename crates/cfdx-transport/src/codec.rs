//! Encrypted message framing for an established session.
//!
//! Wire format per frame: `len: u32 BE || ciphertext[len]`, where the
//! ciphertext is the ChaCha20-Poly1305 encryption of one JSON-encoded
//! message. Each direction uses its own [`CipherState`], so the read and
//! write halves of a connection can live in different tasks.
//!
//! A frame that fails authentication is fatal: the decoder returns
//! `CryptoFailure` and the connection must be closed. A frame that
//! authenticates but does not parse is reported as [`Inbound::Malformed`]
//! so the caller can treat it as a protocol violation and keep reading.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use cfdx_types::{CfdError, constants};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder};

use crate::noise::CipherState;

const LEN_PREFIX: usize = 4;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<T> {
    Message(T),
    /// Authenticated, but not a valid message.
    Malformed { reason: String },
}

/// Length-prefixed, encrypted JSON codec for messages of type `T`.
pub struct NoiseCodec<T> {
    cipher: CipherState,
    max_frame_len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> NoiseCodec<T> {
    #[must_use]
    pub fn new(cipher: CipherState) -> Self {
        Self::with_max_frame_len(cipher, constants::MAX_FRAME_LEN)
    }

    #[must_use]
    pub fn with_max_frame_len(cipher: CipherState, max_frame_len: usize) -> Self {
        Self {
            cipher,
            max_frame_len,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for NoiseCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseCodec")
            .field("cipher", &self.cipher)
            .field("max_frame_len", &self.max_frame_len)
            .finish()
    }
}

impl<T: Serialize> Encoder<T> for NoiseCodec<T> {
    type Error = CfdError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let plaintext = serde_json::to_vec(&item)?;
        let ciphertext = self.cipher.encrypt_with_ad(&[], &plaintext)?;
        if ciphertext.len() > self.max_frame_len {
            return Err(CfdError::FrameTooLarge {
                len: ciphertext.len(),
                max: self.max_frame_len,
            });
        }
        let len = u32::try_from(ciphertext.len()).map_err(|_| CfdError::FrameTooLarge {
            len: ciphertext.len(),
            max: self.max_frame_len,
        })?;
        dst.reserve(LEN_PREFIX + ciphertext.len());
        dst.put_u32(len);
        dst.extend_from_slice(&ciphertext);
        Ok(())
    }
}

impl<T: DeserializeOwned> Decoder for NoiseCodec<T> {
    type Item = Inbound<T>;
    type Error = CfdError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&src[..LEN_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(CfdError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        let frame = src.split_to(len);
        let plaintext = self.cipher.decrypt_with_ad(&[], &frame)?;
        Ok(Some(match serde_json::from_slice(&plaintext) {
            Ok(message) => Inbound::Message(message),
            Err(e) => Inbound::Malformed {
                reason: e.to_string(),
            },
        }))
    }
}
