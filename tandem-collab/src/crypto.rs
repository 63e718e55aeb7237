//! Room secret key schedule and frame sealing.
//!
//! All keys come from one HKDF-SHA256 extraction over the room secret, salted
//! with the room name:
//!
//! ```text
//!   secret ──HKDF(salt = "tandem/room/" + room)──┬─ "token"     → relay join token (hex)
//!                                                ├─ "signaling" → seals ConnectionOffers
//!                                                └─ "channel"   → seals PeerFrames
//! ```
//!
//! Sealed layout: `nonce (12 bytes) ‖ ChaCha20-Poly1305 ciphertext`.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const SALT_PREFIX: &str = "tandem/room/";
const INFO_TOKEN: &[u8] = b"tandem token v1";
const INFO_SIGNALING: &[u8] = b"tandem signaling v1";
const INFO_CHANNEL: &[u8] = b"tandem channel v1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("sealed frame too short ({0} bytes)")]
    Truncated(usize),
    #[error("frame failed authentication")]
    Authentication,
    #[error("encryption failed")]
    Encryption,
}

/// Symmetric key for one purpose.
#[derive(Clone)]
pub struct SealingKey {
    cipher: ChaCha20Poly1305,
}

impl SealingKey {
    fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(bytes)),
        }
    }

    /// Encrypt under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey(..)")
    }
}

/// Everything derived from `(room, secret)`.
#[derive(Clone, Debug)]
pub struct RoomKeys {
    token: [u8; 32],
    signaling: SealingKey,
    channel: SealingKey,
}

impl RoomKeys {
    pub fn derive(room: &str, secret: &str) -> Result<Self, CryptoError> {
        let salt = format!("{SALT_PREFIX}{room}");
        let hkdf = Hkdf::<Sha256>::new(Some(salt.as_bytes()), secret.as_bytes());

        let expand = |info: &[u8]| -> Result<[u8; 32], CryptoError> {
            let mut okm = [0u8; 32];
            hkdf.expand(info, &mut okm)
                .map_err(|_| CryptoError::KeyDerivation)?;
            Ok(okm)
        };

        Ok(Self {
            token: expand(INFO_TOKEN)?,
            signaling: SealingKey::from_bytes(&expand(INFO_SIGNALING)?),
            channel: SealingKey::from_bytes(&expand(INFO_CHANNEL)?),
        })
    }

    /// Join token shown to the relay. Reveals nothing about the secret.
    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn signaling(&self) -> &SealingKey {
        &self.signaling
    }

    pub fn channel(&self) -> &SealingKey {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = RoomKeys::derive("test-room", "password").unwrap();
        let b = RoomKeys::derive("test-room", "password").unwrap();
        assert_eq!(a.token_hex(), b.token_hex());
        assert_eq!(a.token_hex().len(), 64);

        let sealed = a.channel().seal(b"hi").unwrap();
        assert_eq!(b.channel().open(&sealed).unwrap(), b"hi");
    }

    #[test]
    fn test_room_and_secret_separate_tokens() {
        let base = RoomKeys::derive("test-room", "password").unwrap();
        let other_secret = RoomKeys::derive("test-room", "hunter2").unwrap();
        let other_room = RoomKeys::derive("other-room", "password").unwrap();

        assert_ne!(base.token_hex(), other_secret.token_hex());
        assert_ne!(base.token_hex(), other_room.token_hex());
    }

    #[test]
    fn test_wrong_secret_fails_authentication() {
        let ours = RoomKeys::derive("test-room", "password").unwrap();
        let theirs = RoomKeys::derive("test-room", "guess").unwrap();

        let sealed = ours.signaling().seal(b"offer").unwrap();
        assert_eq!(theirs.signaling().open(&sealed), Err(CryptoError::Authentication));
    }

    #[test]
    fn test_purposes_use_different_keys() {
        let keys = RoomKeys::derive("r", "s").unwrap();
        let sealed = keys.signaling().seal(b"offer").unwrap();
        assert!(keys.channel().open(&sealed).is_err());
    }

    #[test]
    fn test_nonce_is_fresh() {
        let keys = RoomKeys::derive("r", "s").unwrap();
        let one = keys.channel().seal(b"same").unwrap();
        let two = keys.channel().seal(b"same").unwrap();
        assert_ne!(one, two);
        assert_eq!(one.len(), NONCE_LEN + 4 + 16);
    }

    #[test]
    fn test_tampered_or_short_input() {
        let keys = RoomKeys::derive("r", "s").unwrap();
        let mut sealed = keys.channel().seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert_eq!(keys.channel().open(&sealed), Err(CryptoError::Authentication));
        assert_eq!(keys.channel().open(&[1, 2, 3]), Err(CryptoError::Truncated(3)));
    }
}
