use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Hard ceiling on encoded plaintext, independent of the policy limits.
pub const MAX_PLAINTEXT_BYTES: usize = 2 * 1024 * 1024;

/// Per-secret 256-bit key. Handed back to the creator for the link fragment;
/// no stored type has a field that can hold one.
#[derive(ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Unpadded URL-safe base64, suitable for a URL fragment.
    pub fn to_link_string(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Parse a key from its link form. Returns `None` for anything that is
    /// not exactly 32 bytes of URL-safe base64.
    pub fn from_link_string(s: &str) -> Option<Self> {
        let mut bytes = Zeroizing::new(URL_SAFE_NO_PAD.decode(s.trim()).ok()?);
        if bytes.len() != KEY_LEN {
            return None;
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();
        Some(Self(key))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Generate a fresh random key from the OS CSPRNG.
pub fn generate_key() -> SecretKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    SecretKey(key)
}

/// The plaintext a secret carries. Encoded as a whole before encryption, so
/// file names and content types are as opaque to the store as the content.
#[derive(Serialize, Deserialize, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub enum Payload {
    Text(String),
    File {
        filename: String,
        content_type: Option<String>,
        data: Vec<u8>,
    },
}

impl Payload {
    /// Size of the user-supplied content, used for policy limits.
    pub fn content_len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::File { data, .. } => data.len(),
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Text(text) => write!(f, "Text({} bytes)", text.len()),
            Payload::File { data, .. } => write!(f, "File({} bytes)", data.len()),
        }
    }
}

/// Ciphertext plus the nonce it was sealed under.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// Encrypt `plaintext` with `key` under a fresh random nonce.
pub fn encrypt(key: &SecretKey, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    if plaintext.len() > MAX_PLAINTEXT_BYTES {
        return Err(CryptoError::PayloadTooLarge {
            limit: MAX_PLAINTEXT_BYTES,
            actual: plaintext.len(),
        });
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    Ok(Sealed {
        ciphertext,
        nonce: nonce_bytes,
    })
}

/// Decrypt `ciphertext`. Any tag mismatch, whether from tampering or a wrong
/// key, surfaces as `AuthenticationFailed` with no further detail.
pub fn decrypt(
    key: &SecretKey,
    ciphertext: &[u8],
    nonce_bytes: &[u8; NONCE_LEN],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from(*nonce_bytes);

    cipher
        .decrypt(&nonce, ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Encode and encrypt a payload.
pub fn seal_payload(key: &SecretKey, payload: &Payload) -> Result<Sealed, CryptoError> {
    let encoded = Zeroizing::new(
        bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?,
    );
    encrypt(key, &encoded)
}

/// Decrypt and decode a payload sealed by [`seal_payload`].
pub fn open_payload(
    key: &SecretKey,
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
) -> Result<Payload, CryptoError> {
    let plaintext = decrypt(key, ciphertext, nonce)?;
    let (payload, _) =
        bincode::serde::decode_from_slice(&plaintext, bincode::config::standard())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn round_trip() {
        let key = generate_key();
        let plaintext = b"hello, burnlink!";
        let sealed = encrypt(&key, plaintext).unwrap();
        let pt = decrypt(&key, &sealed.ciphertext, &sealed.nonce).unwrap();
        assert_eq!(pt.as_slice(), plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let key1 = generate_key();
        let key2 = generate_key();
        let sealed = encrypt(&key1, b"secret").unwrap();
        assert_eq!(
            decrypt(&key2, &sealed.ciphertext, &sealed.nonce).unwrap_err(),
            CryptoError::AuthenticationFailed
        );
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = generate_key();
        let mut sealed = encrypt(&key, b"secret").unwrap();
        sealed.ciphertext[0] ^= 0xff;
        assert_eq!(
            decrypt(&key, &sealed.ciphertext, &sealed.nonce).unwrap_err(),
            CryptoError::AuthenticationFailed
        );
    }

    #[test]
    fn nonces_are_fresh_per_encryption() {
        let key = generate_key();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn plaintext_at_cap_is_accepted_and_over_cap_rejected() {
        let key = generate_key();
        let at_cap = vec![7u8; MAX_PLAINTEXT_BYTES];
        let sealed = encrypt(&key, &at_cap).unwrap();
        assert_eq!(
            decrypt(&key, &sealed.ciphertext, &sealed.nonce)
                .unwrap()
                .len(),
            MAX_PLAINTEXT_BYTES
        );

        let over = vec![7u8; MAX_PLAINTEXT_BYTES + 1];
        assert_eq!(
            encrypt(&key, &over).unwrap_err(),
            CryptoError::PayloadTooLarge {
                limit: MAX_PLAINTEXT_BYTES,
                actual: MAX_PLAINTEXT_BYTES + 1
            }
        );
    }

    #[test]
    fn key_link_string_round_trip() {
        let key = generate_key();
        let s = key.to_link_string();
        assert_eq!(s.len(), 43);
        assert!(!s.contains('=') && !s.contains('+') && !s.contains('/'));
        let parsed = SecretKey::from_link_string(&s).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
    }

    #[test]
    fn malformed_key_strings_are_rejected() {
        assert!(SecretKey::from_link_string("").is_none());
        assert!(SecretKey::from_link_string("not base64!").is_none());
        assert!(SecretKey::from_link_string(&URL_SAFE_NO_PAD.encode([1u8; 16])).is_none());
    }

    #[test]
    fn file_payload_round_trip() {
        let key = generate_key();
        let payload = Payload::File {
            filename: "id_ed25519".into(),
            content_type: Some("application/octet-stream".into()),
            data: vec![0, 1, 2, 3, 255],
        };
        let sealed = seal_payload(&key, &payload).unwrap();
        let opened = open_payload(&key, &sealed.ciphertext, &sealed.nonce).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn debug_never_prints_content() {
        let payload = Payload::Text("hunter2".into());
        assert!(!format!("{payload:?}").contains("hunter2"));
        let key = generate_key();
        assert!(!format!("{key:?}").contains(&key.to_link_string()));
    }

    proptest! {
        #[test]
        fn decrypt_inverts_encrypt(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let key = generate_key();
            let sealed = encrypt(&key, &data).unwrap();
            let pt = decrypt(&key, &sealed.ciphertext, &sealed.nonce).unwrap();
            prop_assert_eq!(pt.as_slice(), data.as_slice());
        }

        #[test]
        fn text_payload_survives_sealing(text in ".{0,512}") {
            let key = generate_key();
            let payload = Payload::Text(text);
            let sealed = seal_payload(&key, &payload).unwrap();
            let opened = open_payload(&key, &sealed.ciphertext, &sealed.nonce).unwrap();
            prop_assert_eq!(opened, payload);
        }
    }
}
