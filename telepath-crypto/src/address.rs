//! # Telepath Crypto - Channel Address Module
//!
//! A `ChannelAddress` is everything a peer needs to join a channel: the relay
//! channel id and the symmetric channel key. It travels out-of-band (QR code)
//! as the fragment of a connect URL:
//!
//! ```text
//! https://example.com/telepath/connect#I=<channel id>&E=<base64url(key)>
//! ```
//!
//! The fragment never reaches the relay, so the key stays between the two
//! endpoints.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, Result, base64url_decode, base64url_encode};

/// Size in bytes of a freshly generated channel key.
pub const KEY_SIZE: usize = 32;

/// Random bytes behind a generated channel id.
const ID_ENTROPY: usize = 16;

/// Fragment parameter carrying the channel id.
const ID_PARAM: &str = "I";

/// Fragment parameter carrying the encoded channel key.
const KEY_PARAM: &str = "E";

/// Identifier of a relay queue / socket room.
///
/// Stable for the lifetime of a pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random, URL-safe identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ID_ENTROPY];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(base64url_encode(&bytes))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Symmetric key material shared by the two endpoints of a channel.
///
/// The bytes are wiped on drop, compared in constant time and never shown by
/// `Debug`; only a short SHA-256 fingerprint is.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey(Vec<u8>);

impl ChannelKey {
    /// Generate a new random 32-byte key.
    pub fn generate() -> Self {
        let mut key = vec![0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Wrap raw key bytes.
    ///
    /// # Errors
    /// Returns `CryptoError::InvalidKeyEncoding` for an empty key.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CryptoError::InvalidKeyEncoding);
        }
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a constructed key; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short hex fingerprint (first 8 bytes of SHA-256), safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.0);
        hex::encode(&digest[..8])
    }
}

impl PartialEq for ChannelKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for ChannelKey {}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelKey").field(&self.fingerprint()).finish()
    }
}

/// Channel id plus channel key: the pairing secret rendered in a QR code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddress {
    /// Relay queue / socket room identifier.
    pub id: ChannelId,
    /// Symmetric key for this channel.
    pub key: ChannelKey,
}

impl ChannelAddress {
    /// Create an address from its parts.
    pub fn new(id: ChannelId, key: ChannelKey) -> Self {
        Self { id, key }
    }

    /// Create an address for a brand new channel (wallet side).
    pub fn generate() -> Self {
        Self::new(ChannelId::generate(), ChannelKey::generate())
    }

    /// Encode as a URL fragment: `I=<id>&E=<base64url(key)>`.
    ///
    /// Reserved characters in the id are percent-escaped so that decoding is
    /// lossless.
    pub fn encode(&self) -> String {
        format!(
            "{ID_PARAM}={}&{KEY_PARAM}={}",
            escape(self.id.as_str()),
            base64url_encode(self.key.as_bytes())
        )
    }

    /// Decode a URL fragment, with or without the leading `#`.
    ///
    /// Parameters may appear in any order and unknown parameters are ignored.
    ///
    /// # Errors
    /// - `InvalidFragment` if `I` or `E` is missing or empty
    /// - `InvalidKeyEncoding` if `E` is not valid base64url
    pub fn decode(fragment: &str) -> Result<Self> {
        let fragment = fragment.strip_prefix('#').unwrap_or(fragment);

        let mut id = None;
        let mut key = None;
        for pair in fragment.split('&').filter(|pair| !pair.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            match name {
                ID_PARAM => id = Some(value),
                KEY_PARAM => key = Some(value),
                _ => {}
            }
        }

        let id = id
            .filter(|value| !value.is_empty())
            .ok_or_else(|| CryptoError::InvalidFragment("missing channel id (I)".into()))?;
        let key = key
            .filter(|value| !value.is_empty())
            .ok_or_else(|| CryptoError::InvalidFragment("missing channel key (E)".into()))?;

        let id = ChannelId::new(unescape(id)?);
        let key_bytes = base64url_decode(key).ok_or(CryptoError::InvalidKeyEncoding)?;
        let key = ChannelKey::from_bytes(key_bytes)?;

        Ok(Self { id, key })
    }

    /// Render the full connect URL for this address under `base`.
    ///
    /// Any fragment already present on `base` is replaced.
    pub fn connect_url(&self, base: &str) -> String {
        let base = base.split_once('#').map_or(base, |(head, _)| head);
        format!("{base}#{}", self.encode())
    }

    /// Parse the address out of a scanned connect URL.
    ///
    /// # Errors
    /// `InvalidFragment` when the URL has no fragment, otherwise as
    /// [`ChannelAddress::decode`].
    pub fn from_connect_url(url: &str) -> Result<Self> {
        let (_, fragment) = url
            .split_once('#')
            .ok_or_else(|| CryptoError::InvalidFragment("connect url has no fragment".into()))?;
        Self::decode(fragment)
    }
}

impl FromStr for ChannelAddress {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains("://") {
            Self::from_connect_url(s)
        } else {
            Self::decode(s)
        }
    }
}

/// Characters that would break fragment parsing if left verbatim.
fn is_reserved(c: char) -> bool {
    matches!(c, '%' | '&' | '=' | '#' | '+' | ' ')
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if is_reserved(c) {
            escaped.push_str(&format!("%{:02X}", c as u32));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

fn unescape(value: &str) -> Result<String> {
    if !value.contains('%') {
        return Ok(value.to_owned());
    }

    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| CryptoError::InvalidFragment("bad percent escape in id".into()))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| CryptoError::InvalidFragment("id is not utf-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_format() {
        let key = ChannelKey::from_bytes(vec![0xfb, 0xff, 0x01]).unwrap();
        let address = ChannelAddress::new(ChannelId::new("1234"), key);
        assert_eq!(address.encode(), "I=1234&E=-_8B");
    }

    #[test]
    fn test_decode_example_connect_url() {
        let address = ChannelAddress::from_connect_url(
            "https://cogito.example.com/telepath/connect#I=1234&E=abcd",
        )
        .unwrap();
        assert_eq!(address.id.as_str(), "1234");
        assert_eq!(address.key.as_bytes(), &[0x69, 0xb7, 0x1d]);
    }

    #[test]
    fn test_decode_any_order_and_unknown_params() {
        let address = ChannelAddress::decode("#X=1&E=abcd&I=room").unwrap();
        assert_eq!(address.id.as_str(), "room");
    }

    #[test]
    fn test_decode_accepts_padding() {
        let padded = ChannelAddress::decode("I=a&E=-_8=").unwrap();
        let unpadded = ChannelAddress::decode("I=a&E=-_8").unwrap();
        assert_eq!(padded, unpadded);
        assert_eq!(padded.key.as_bytes(), &[0xfb, 0xff]);
    }

    #[test]
    fn test_missing_id_is_invalid_fragment() {
        let result = ChannelAddress::decode("E=abcd");
        assert!(matches!(result, Err(CryptoError::InvalidFragment(_))));

        let result = ChannelAddress::decode("I=&E=abcd");
        assert!(matches!(result, Err(CryptoError::InvalidFragment(_))));
    }

    #[test]
    fn test_missing_key_is_invalid_fragment() {
        let result = ChannelAddress::decode("I=1234");
        assert!(matches!(result, Err(CryptoError::InvalidFragment(_))));

        let result = ChannelAddress::decode("");
        assert!(matches!(result, Err(CryptoError::InvalidFragment(_))));
    }

    #[test]
    fn test_bad_key_encoding() {
        for bad in ["I=1&E=ab*d", "I=1&E=a", "I=1&E=ab+/"] {
            let result = ChannelAddress::decode(bad);
            assert!(
                matches!(result, Err(CryptoError::InvalidKeyEncoding)),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_connect_url_without_fragment() {
        let result = ChannelAddress::from_connect_url("https://example.com/connect");
        assert!(matches!(result, Err(CryptoError::InvalidFragment(_))));
    }

    #[test]
    fn test_connect_url_replaces_existing_fragment() {
        let address = ChannelAddress::generate();
        let url = address.connect_url("https://example.com/connect#stale");
        assert!(url.starts_with("https://example.com/connect#I="));
        assert_eq!(url.parse::<ChannelAddress>().unwrap(), address);
    }

    #[test]
    fn test_reserved_characters_in_id() {
        let address = ChannelAddress::new(ChannelId::new("a&b=c#d%e"), ChannelKey::generate());
        let encoded = address.encode();
        assert!(!encoded.contains('#'));
        assert_eq!(ChannelAddress::decode(&encoded).unwrap(), address);
    }

    #[test]
    fn test_generated_addresses_differ() {
        let a = ChannelAddress::generate();
        let b = ChannelAddress::generate();
        assert_ne!(a.id, b.id);
        assert_ne!(a.key, b.key);
        assert_eq!(a.key.len(), KEY_SIZE);
    }

    #[test]
    fn test_key_debug_hides_bytes() {
        let key = ChannelKey::from_bytes(vec![0xAB; 32]).unwrap();
        let debug = format!("{key:?}");
        assert!(!debug.contains('['));
        assert!(debug.contains(&key.fingerprint()));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            ChannelKey::from_bytes(Vec::new()),
            Err(CryptoError::InvalidKeyEncoding)
        ));
    }

    proptest! {
        #[test]
        fn prop_address_roundtrip(
            id in "\\PC{1,40}",
            key in proptest::collection::vec(any::<u8>(), 1..64),
        ) {
            let address = ChannelAddress::new(
                ChannelId::new(id),
                ChannelKey::from_bytes(key).unwrap(),
            );
            prop_assert_eq!(ChannelAddress::decode(&address.encode()).unwrap(), address);
        }
    }
}
