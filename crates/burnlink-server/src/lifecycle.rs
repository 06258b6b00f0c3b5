//! Create/view orchestration on top of the store, crypto, and auditor.
//!
//! A failed decrypt costs a view: quota is charged by the store before the
//! supplied key is ever tried, so a wrong or malformed key leaves the secret
//! in exactly the state a successful view would have.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{CryptoError, EngineError, GenerationError, StoreError, ValidationError};
use crate::ids::{self, MAX_ID_ATTEMPTS};
use crate::store::{
    crypto::{self, Payload, SecretKey},
    AccessLogEntry, AccessOutcome, AuditQuery, Auditor, ConsumeResult, RevokeResult, SecretMeta,
    SecretRecord, Store,
};
use crate::unix_now;

/// Longest stretch of a malformed short ID copied into the access log.
const MAX_LOGGED_ID_LEN: usize = 64;

// ── Policy ───────────────────────────────────────────────────────────────────

/// Limits applied to every create before anything touches the store.
#[derive(Debug, Clone)]
pub struct Policy {
    pub max_text_bytes: usize,
    pub max_file_bytes: usize,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub max_views: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_text_bytes: 100 * 1024,
            max_file_bytes: 1024 * 1024,
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(30 * 86400),
            max_views: 100,
        }
    }
}

impl Policy {
    pub fn validate(
        &self,
        payload: &Payload,
        ttl: Duration,
        max_views: u32,
    ) -> Result<(), ValidationError> {
        let len = payload.content_len();
        if len == 0 {
            return Err(ValidationError::EmptyPayload);
        }
        let limit = match payload {
            Payload::Text(_) => self.max_text_bytes,
            Payload::File { filename, .. } => {
                if filename.is_empty() || filename.len() > 255 {
                    return Err(ValidationError::InvalidFileName);
                }
                self.max_file_bytes
            }
        };
        if len > limit {
            return Err(ValidationError::PayloadTooLarge { limit, actual: len });
        }

        if ttl < self.min_ttl || ttl > self.max_ttl {
            return Err(ValidationError::TtlOutOfRange {
                min: self.min_ttl.as_secs(),
                max: self.max_ttl.as_secs(),
                actual: ttl.as_secs(),
            });
        }

        if max_views == 0 || max_views > self.max_views {
            return Err(ValidationError::MaxViewsOutOfRange {
                max: self.max_views,
                actual: max_views,
            });
        }
        Ok(())
    }
}

// ── Requests and results ─────────────────────────────────────────────────────

pub struct NewSecret {
    pub payload: Payload,
    pub ttl: Duration,
    pub max_views: u32,
    /// Identity supplied by the authentication layer, if any.
    pub owner_ref: Option<String>,
}

/// What the creator gets back. `key` goes in the link fragment and nowhere else.
#[derive(Clone, Serialize)]
pub struct ShareLink {
    pub short_id: String,
    pub key: String,
    pub expires_at: i64,
}

impl ShareLink {
    /// `{base}/s/{short_id}#{key}`. Browsers never send the fragment to the server.
    pub fn url(&self, base: &str) -> String {
        format!("{}/s/{}#{}", base.trim_end_matches('/'), self.short_id, self.key)
    }
}

impl std::fmt::Debug for ShareLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareLink")
            .field("short_id", &self.short_id)
            .field("key", &"..")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ViewResult {
    Revealed {
        payload: Payload,
        views_remaining: u32,
    },
    /// Burned, expired, unknown, or the key did not fit. Deliberately uniform.
    Unavailable,
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
pub struct Lifecycle {
    store: Store,
    auditor: Auditor,
    policy: Policy,
    new_id: IdGenerator,
}

impl Lifecycle {
    /// Audit entries go to the same store as the secrets.
    pub fn new(store: Store, policy: Policy) -> Self {
        let auditor = Auditor::new(Arc::new(store.clone()));
        Self {
            store,
            auditor,
            policy,
            new_id: Arc::new(ids::new_short_id),
        }
    }

    pub fn with_auditor(mut self, auditor: Auditor) -> Self {
        self.auditor = auditor;
        self
    }

    pub fn with_id_generator(mut self, new_id: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.new_id = Arc::new(new_id);
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    pub fn create_secret(&self, new: NewSecret) -> Result<ShareLink, EngineError> {
        self.create_secret_at(new, unix_now())
    }

    /// Validate, encrypt under a fresh key, and persist under a fresh short ID.
    /// ID collisions are retried up to `MAX_ID_ATTEMPTS` times.
    pub fn create_secret_at(&self, new: NewSecret, now: i64) -> Result<ShareLink, EngineError> {
        self.policy
            .validate(&new.payload, new.ttl, new.max_views)?;

        let key = crypto::generate_key();
        let sealed = crypto::seal_payload(&key, &new.payload)?;
        let expires_at = now.saturating_add(new.ttl.as_secs() as i64);

        let record = SecretRecord {
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            created_at: now,
            expires_at,
            max_views: new.max_views,
            views_consumed: 0,
            owner_ref: new.owner_ref.clone(),
        };

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let short_id = (self.new_id)();
            match self.store.create(&short_id, &record) {
                Ok(()) => {
                    info!(
                        short_id = %short_id,
                        max_views = new.max_views,
                        expires_at,
                        "secret created"
                    );
                    return Ok(ShareLink {
                        short_id,
                        key: key.to_link_string(),
                        expires_at,
                    });
                }
                Err(StoreError::Conflict(_)) => {
                    warn!(attempt, "short id collision, regenerating");
                }
                Err(e) => {
                    error!(error = %e, "store rejected create");
                    return Err(e.into());
                }
            }
        }

        error!(attempts = MAX_ID_ATTEMPTS, "short id generation exhausted");
        Err(GenerationError::ExhaustedRetries {
            attempts: MAX_ID_ATTEMPTS,
        }
        .into())
    }

    pub fn view_secret(
        &self,
        short_id: &str,
        key: &str,
        actor_hint: Option<&str>,
    ) -> Result<ViewResult, EngineError> {
        self.view_secret_at(short_id, key, actor_hint, unix_now())
    }

    /// Spend one view and, if this caller won it, decrypt with `key`.
    ///
    /// Every call that reaches the store leaves exactly one access log entry.
    /// A store outage is returned as an error rather than guessed around.
    pub fn view_secret_at(
        &self,
        short_id: &str,
        key: &str,
        actor_hint: Option<&str>,
        now: i64,
    ) -> Result<ViewResult, EngineError> {
        if !ids::is_well_formed(short_id) {
            let logged: String = short_id.chars().take(MAX_LOGGED_ID_LEN).collect();
            self.auditor
                .record(&logged, AccessOutcome::NotFound, actor_hint, now);
            return Ok(ViewResult::Unavailable);
        }

        let key = SecretKey::from_link_string(key);

        let consumed = self.store.try_consume(short_id, now).map_err(|e| {
            error!(short_id, error = %e, "consume failed");
            EngineError::from(e)
        })?;

        let (outcome, result) = match consumed {
            ConsumeResult::Consumed {
                ciphertext,
                nonce,
                views_remaining,
            } => {
                let opened = match key {
                    Some(ref key) => crypto::open_payload(key, &ciphertext, &nonce),
                    None => Err(CryptoError::AuthenticationFailed),
                };
                match opened {
                    Ok(payload) => (
                        AccessOutcome::Revealed,
                        ViewResult::Revealed {
                            payload,
                            views_remaining,
                        },
                    ),
                    Err(e) => {
                        warn!(short_id, error = %e, "view charged but payload did not open");
                        (AccessOutcome::AuthenticationFailed, ViewResult::Unavailable)
                    }
                }
            }
            ConsumeResult::AlreadyBurned => (AccessOutcome::AlreadyBurned, ViewResult::Unavailable),
            ConsumeResult::Expired => (AccessOutcome::Expired, ViewResult::Unavailable),
            ConsumeResult::NotFound => (AccessOutcome::NotFound, ViewResult::Unavailable),
        };

        self.auditor.record(short_id, outcome, actor_hint, now);
        debug!(short_id, %outcome, "view attempt");
        Ok(result)
    }

    /// Metadata for the caller's own secrets.
    pub fn list_owned(&self, owner_ref: &str) -> Result<Vec<SecretMeta>, EngineError> {
        Ok(self.store.list_for_owner(owner_ref, unix_now())?)
    }

    pub fn revoke(&self, short_id: &str, owner_ref: &str) -> Result<RevokeResult, EngineError> {
        if !ids::is_well_formed(short_id) {
            return Ok(RevokeResult::NotFound);
        }
        Ok(self.store.revoke(short_id, owner_ref)?)
    }

    pub fn sweep_expired(&self) -> Result<usize, EngineError> {
        self.sweep_expired_at(unix_now())
    }

    pub fn sweep_expired_at(&self, now: i64) -> Result<usize, EngineError> {
        Ok(self.store.sweep_expired(now)?)
    }

    /// Read-only view of the access log for authorized review.
    pub fn access_log(&self, query: &AuditQuery) -> Result<Vec<AccessLogEntry>, EngineError> {
        self.store
            .list_access(query)
            .map_err(EngineError::StoreUnavailable)
    }
}
