use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use super::crypto::NONCE_LEN;

/// Stored in redb as bincode-encoded bytes, keyed by short ID.
/// `ciphertext` is ChaCha20Poly1305 output over an encoded `Payload`; the key
/// that opens it lives only in the share link.
/// All metadata is plaintext so the sweep can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    /// Ciphertext plus tag. Emptied once the last view is consumed.
    pub ciphertext: Vec<u8>,
    /// Per-record random nonce.
    pub nonce: [u8; NONCE_LEN],
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
    /// Unix timestamp (seconds) at or after which the record is unreadable.
    pub expires_at: i64,
    /// Number of reveals the record allows. Always >= 1.
    pub max_views: u32,
    /// Reveals charged so far. Only `Store::try_consume` and `Store::revoke` increase it.
    pub views_consumed: u32,
    /// Opaque account reference for listing and revocation.
    pub owner_ref: Option<String>,
}

/// Lifecycle state, derived from the counters and the clock, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretState {
    Active,
    Burned,
    Expired,
}

impl SecretRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn is_burned(&self) -> bool {
        self.views_consumed >= self.max_views
    }

    /// Expiry takes precedence: an expired record is `Expired` even if its
    /// quota is also exhausted.
    pub fn state(&self, now: i64) -> SecretState {
        if self.is_expired(now) {
            SecretState::Expired
        } else if self.is_burned() {
            SecretState::Burned
        } else {
            SecretState::Active
        }
    }

    pub fn views_remaining(&self) -> u32 {
        self.max_views.saturating_sub(self.views_consumed)
    }

    pub fn meta(&self, short_id: &str, now: i64) -> SecretMeta {
        SecretMeta {
            short_id: short_id.to_owned(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            max_views: self.max_views,
            views_consumed: self.views_consumed,
            state: self.state(now),
        }
    }
}

/// Metadata returned to owners. Never includes ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMeta {
    pub short_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub max_views: u32,
    pub views_consumed: u32,
    pub state: SecretState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(max_views: u32, views_consumed: u32, expires_at: i64) -> SecretRecord {
        SecretRecord {
            ciphertext: vec![1, 2, 3],
            nonce: [0; NONCE_LEN],
            created_at: 0,
            expires_at,
            max_views,
            views_consumed,
            owner_ref: None,
        }
    }

    #[test]
    fn state_transitions() {
        assert_eq!(record(1, 0, 100).state(50), SecretState::Active);
        assert_eq!(record(1, 1, 100).state(50), SecretState::Burned);
        assert_eq!(record(5, 0, 100).state(100), SecretState::Expired);
        assert_eq!(record(1, 1, 100).state(150), SecretState::Expired);
    }

    #[test]
    fn remaining_never_underflows() {
        assert_eq!(record(3, 1, 100).views_remaining(), 2);
        assert_eq!(record(1, 4, 100).views_remaining(), 0);
    }
}
