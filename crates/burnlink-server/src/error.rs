use thiserror::Error;

/// Input rejected before any store interaction. Never audited.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("payload is {actual} bytes, limit is {limit}")]
    PayloadTooLarge { limit: usize, actual: usize },
    #[error("ttl of {actual}s is outside {min}s..={max}s")]
    TtlOutOfRange { min: u64, max: u64, actual: u64 },
    #[error("max_views must be between 1 and {max}, got {actual}")]
    MaxViewsOutOfRange { max: u32, actual: u32 },
    #[error("file name must be 1-255 characters")]
    InvalidFileName,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("plaintext is {actual} bytes, cipher limit is {limit}")]
    PayloadTooLarge { limit: usize, actual: usize },
    /// Tag did not verify: tampered ciphertext or wrong key.
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("encryption failed")]
    Encryption,
    #[error("payload encoding: {0}")]
    Encoding(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("short id already exists: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("could not mint a unique short id after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },
}

/// Everything the lifecycle orchestrator can fail with.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("store unavailable: {0}")]
    StoreUnavailable(anyhow::Error),
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(inner) => EngineError::StoreUnavailable(inner),
            // Conflicts are retried inside the orchestrator; one escaping here
            // means the retry loop was bypassed.
            StoreError::Conflict(id) => {
                EngineError::StoreUnavailable(anyhow::anyhow!("unexpected conflict on {id}"))
            }
        }
    }
}
