//! # Telepath Crypto
//!
//! Channel addressing and authenticated encryption for Telepath secure
//! channels.
//!
//! Two endpoints pair by sharing a [`ChannelAddress`] out-of-band: a relay
//! channel id plus a symmetric [`ChannelKey`]. Every message on the channel is
//! then sealed with:
//! - **HKDF-SHA256** to derive the AEAD key from the channel key
//! - **AES-256-GCM-SIV** for authenticated encryption, fresh nonce per message
//!
//! ## Safety
//!
//! This crate forbids all unsafe code to maximize auditability and security.
//!
//! ## Example
//!
//! ```rust,ignore
//! use telepath_crypto::{ChannelAddress, encrypt, decrypt};
//!
//! let address = ChannelAddress::from_connect_url(
//!     "https://example.com/telepath/connect#I=1234&E=abcd",
//! )?;
//!
//! let ciphertext = encrypt(&address.key, b"Hello, wallet!")?;
//! let plaintext = decrypt(&address.key, &ciphertext)?;
//! assert_eq!(plaintext, b"Hello, wallet!");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod address;

pub use address::{ChannelAddress, ChannelId, ChannelKey, KEY_SIZE};

use std::fmt;

use aes_gcm_siv::{
    Aes256GcmSiv, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

/// Errors that can occur during Telepath cryptographic operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The pairing fragment lacks a required parameter or is malformed.
    #[error("Invalid channel fragment: {0}")]
    InvalidFragment(String),

    /// The channel key is not valid base64url (or is empty).
    #[error("Invalid channel key encoding")]
    InvalidKeyEncoding,

    /// AEAD encryption failed.
    #[error("Encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (wrong key or tampered ciphertext).
    #[error("Decryption failed: authentication error")]
    DecryptionFailed,

    /// Message is too short to be valid.
    #[error("Message too short")]
    MessageTooShort,
}

/// Result type for Telepath crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Size of the AES-GCM-SIV nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM-SIV authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// HKDF salt binding derived keys to this protocol version.
const KDF_SALT: &[u8] = b"telepath-channel-v1";

/// HKDF info for the message encryption key.
const KDF_INFO_AEAD: &[u8] = b"aead-key";

/// Base64url engine: unpadded output, padding optional on input.
const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encode bytes as unpadded base64url.
pub fn base64url_encode(data: &[u8]) -> String {
    BASE64URL.encode(data)
}

/// Decode base64url, with or without padding.
///
/// Returns `None` when the input is not valid base64url.
pub fn base64url_decode(data: &str) -> Option<Vec<u8>> {
    BASE64URL.decode(data).ok()
}

/// AEAD bound to one channel key.
///
/// Deriving the cipher once per channel avoids repeating the key derivation
/// for every message.
pub struct ChannelCipher {
    aead: Aes256GcmSiv,
}

impl ChannelCipher {
    /// Derive the message cipher for a channel key.
    pub fn new(key: &ChannelKey) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(KDF_SALT), key.as_bytes());
        let mut okm = [0u8; 32];
        hkdf.expand(KDF_INFO_AEAD, &mut okm)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let aead = Aes256GcmSiv::new_from_slice(&okm).map_err(|_| CryptoError::EncryptionFailed);
        okm.zeroize();

        Ok(Self { aead: aead? })
    }

    /// Seal a message.
    ///
    /// # Wire Format
    /// ```text
    /// [nonce: 12 bytes][ciphertext + tag]
    /// ```
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .aead
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);

        Ok(output)
    }

    /// Open a sealed message.
    ///
    /// # Errors
    /// - `MessageTooShort` if the input cannot hold a nonce and a tag
    /// - `DecryptionFailed` if authentication fails (tampered or wrong key)
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::MessageTooShort);
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.aead
            .decrypt(nonce, sealed)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for ChannelCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCipher").finish_non_exhaustive()
    }
}

/// Encrypt a message under a channel key.
pub fn encrypt(key: &ChannelKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    ChannelCipher::new(key)?.encrypt(plaintext)
}

/// Decrypt a message sealed under a channel key.
pub fn decrypt(key: &ChannelKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
    ChannelCipher::new(key)?.decrypt(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed_key(seed: u8) -> ChannelKey {
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(7).wrapping_add(seed);
        }
        ChannelKey::from_bytes(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_basic_encryption_decryption() {
        let key = fixed_key(42);
        let msg = br#"{"jsonrpc":"2.0","id":1,"method":"getValueForKey"}"#;

        let ciphertext = encrypt(&key, msg).expect("Encryption failed");
        let plaintext = decrypt(&key, &ciphertext).expect("Decryption failed");

        assert_eq!(plaintext, msg);
        assert_eq!(ciphertext.len(), NONCE_SIZE + msg.len() + TAG_SIZE);
    }

    #[test]
    fn test_empty_message() {
        let key = fixed_key(1);
        let ciphertext = encrypt(&key, b"").unwrap();
        assert_eq!(decrypt(&key, &ciphertext).unwrap(), b"");
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let cipher = ChannelCipher::new(&fixed_key(3)).unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_key_from_fragment() {
        // "abcd" decodes to three bytes; HKDF stretches it to an AES key.
        let address = ChannelAddress::decode("I=1234&E=abcd").unwrap();
        let ciphertext = encrypt(&address.key, b"hi").unwrap();
        assert_eq!(decrypt(&address.key, &ciphertext).unwrap(), b"hi");
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = fixed_key(42);
        let mut ciphertext = encrypt(&key, b"Secret message").unwrap();

        let last_idx = ciphertext.len() - 5;
        ciphertext[last_idx] ^= 0xFF;

        let result = decrypt(&key, &ciphertext);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let key = fixed_key(42);
        let mut ciphertext = encrypt(&key, b"Secret message").unwrap();
        ciphertext[0] ^= 0x01;

        let result = decrypt(&key, &ciphertext);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let ciphertext = encrypt(&fixed_key(42), b"For the wallet only").unwrap();
        let result = decrypt(&fixed_key(43), &ciphertext);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_message_too_short() {
        let key = fixed_key(42);
        let result = decrypt(&key, &[0u8; NONCE_SIZE + TAG_SIZE - 1]);
        assert!(matches!(result, Err(CryptoError::MessageTooShort)));
    }

    #[test]
    fn test_base64url_helpers() {
        assert_eq!(base64url_encode(&[0xfb, 0xff]), "-_8");
        assert_eq!(base64url_decode("-_8="), Some(vec![0xfb, 0xff]));
        assert_eq!(base64url_decode("+/8="), None);
    }

    proptest! {
        #[test]
        fn prop_encrypt_decrypt_roundtrip(
            key in proptest::collection::vec(any::<u8>(), 1..48),
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let key = ChannelKey::from_bytes(key).unwrap();
            let ciphertext = encrypt(&key, &plaintext).unwrap();
            prop_assert_eq!(decrypt(&key, &ciphertext).unwrap(), plaintext);
        }

        #[test]
        fn prop_other_key_never_decrypts(
            key in proptest::collection::vec(any::<u8>(), 32),
            flip in 0usize..32,
            plaintext in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let mut other = key.clone();
            other[flip] ^= 0x80;
            let ciphertext = encrypt(&ChannelKey::from_bytes(key).unwrap(), &plaintext).unwrap();
            let result = decrypt(&ChannelKey::from_bytes(other).unwrap(), &ciphertext);
            prop_assert_eq!(result, Err(CryptoError::DecryptionFailed));
        }
    }
}
