pub mod audit;
pub mod crypto;
pub mod db;
pub mod model;

pub use audit::{AccessLogEntry, AccessOutcome, AuditQuery, AuditSink, Auditor};
pub use crypto::{Payload, SecretKey};
pub use db::{ConsumeResult, RevokeResult, Store};
pub use model::{SecretMeta, SecretRecord, SecretState};
