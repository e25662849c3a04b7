//! Static X25519 identity of a daemon.

use std::fmt;

use cfdx_types::PeerId;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Long-lived key pair authenticating a daemon in every handshake.
#[derive(Clone)]
pub struct StaticKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl StaticKeypair {
    #[must_use]
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    #[must_use]
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_pubkey(self.public.to_bytes())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("peer_id", &format_args!("{}", self.peer_id()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_public_key() {
        let keys = StaticKeypair::from_bytes([4; 32]);
        assert_eq!(keys.peer_id().as_bytes(), keys.public().as_bytes());
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(StaticKeypair::generate().peer_id(), StaticKeypair::generate().peer_id());
    }

    #[test]
    fn debug_hides_secret() {
        let keys = StaticKeypair::from_bytes([4; 32]);
        let dbg = format!("{keys:?}");
        assert!(dbg.contains("peer:"));
        assert!(!dbg.contains("secret"));
    }
}
