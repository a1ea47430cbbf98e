//! Payload encryption seam.
//!
//! The wire format only signals *whether* a payload is encrypted; the
//! algorithm is pluggable behind [`PacketCipher`]. The provided
//! implementation is ChaCha20-Poly1305 with a fresh random nonce prepended to
//! each ciphertext, so frames are independently decryptable and replayed
//! nonces never occur within a key's lifetime by construction.

use chacha20poly1305::{
    ChaCha20Poly1305,
    Key,
    Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;

use super::error::CodecError;

/// Length of the nonce prepended to every ciphertext.
const NONCE_BYTES: usize = 12;

/// Transform applied to payloads flagged as encrypted.
///
/// Implementations must be self-delimiting: `decrypt(encrypt(p)) == p` with
/// no out-of-band state beyond the shared key.
pub trait PacketCipher: Send + Sync + 'static {
    /// Encrypt `plaintext`, returning the wire form.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encrypt`] when encryption fails.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decrypt a wire-form payload.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decrypt`] when authentication or decryption
    /// fails.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// ChaCha20-Poly1305 [`PacketCipher`] with nonce-prepended ciphertexts.
pub struct ChaChaPacketCipher {
    cipher: ChaCha20Poly1305,
}

impl ChaChaPacketCipher {
    /// Build a cipher from a 32-byte shared key.
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }
}

impl PacketCipher for ChaChaPacketCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut nonce = [0u8; NONCE_BYTES];
        rand::rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CodecError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_BYTES + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        if ciphertext.len() < NONCE_BYTES {
            return Err(CodecError::Decrypt);
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_BYTES);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CodecError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ChaChaPacketCipher { ChaChaPacketCipher::new(&[0x42; 32]) }

    #[test]
    fn round_trips_payloads() {
        let cipher = cipher();
        for payload in [&b""[..], b"a", &[0u8; 4096]] {
            let sealed = cipher.encrypt(payload).expect("encrypt");
            assert_eq!(cipher.decrypt(&sealed).expect("decrypt"), payload);
        }
    }

    #[test]
    fn nonces_differ_between_frames() {
        let cipher = cipher();
        let a = cipher.encrypt(b"same payload").expect("encrypt");
        let b = cipher.encrypt(b"same payload").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let cipher = cipher();
        let mut sealed = cipher.encrypt(b"payload").expect("encrypt");
        let end = sealed.len() - 1;
        sealed[end] ^= 0x01;
        assert!(matches!(cipher.decrypt(&sealed), Err(CodecError::Decrypt)));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let cipher = cipher();
        assert!(matches!(cipher.decrypt(&[1, 2, 3]), Err(CodecError::Decrypt)));
    }
}
