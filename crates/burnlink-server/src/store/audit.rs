use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Attempts made to append one entry before it is declared lost.
pub const AUDIT_ATTEMPTS: u32 = 3;

// ── AccessOutcome ────────────────────────────────────────────────────────────

/// How a view attempt ended. Callers only ever see "unavailable" for anything
/// other than `Revealed`; the distinction lives here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOutcome {
    Revealed,
    AlreadyBurned,
    Expired,
    NotFound,
    /// A unit of quota was charged but the supplied key did not open the payload.
    AuthenticationFailed,
}

impl AccessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Revealed => "revealed",
            Self::AlreadyBurned => "already_burned",
            Self::Expired => "expired",
            Self::NotFound => "not_found",
            Self::AuthenticationFailed => "authentication_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "revealed" => Some(Self::Revealed),
            "already_burned" => Some(Self::AlreadyBurned),
            "expired" => Some(Self::Expired),
            "not_found" => Some(Self::NotFound),
            "authentication_failed" => Some(Self::AuthenticationFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccessOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── AccessLogEntry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    /// Monotonic sequence number, allocated by the store.
    pub id: u64,
    pub short_id: String,
    pub timestamp: i64,
    pub outcome: AccessOutcome,
    /// Best-effort description of who asked (IP, user agent, account).
    pub actor_hint: Option<String>,
}

impl AccessLogEntry {
    pub fn new(
        short_id: &str,
        outcome: AccessOutcome,
        actor_hint: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: 0, // allocated by store
            short_id: short_id.to_owned(),
            timestamp,
            outcome,
            actor_hint,
        }
    }
}

// ── AuditQuery ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AuditQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub short_id: Option<String>,
    pub outcome: Option<AccessOutcome>,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            short_id: None,
            outcome: None,
            limit: 100,
        }
    }
}

// ── Auditor ──────────────────────────────────────────────────────────────────

/// Append-only destination for access log entries.
pub trait AuditSink: Send + Sync {
    /// Persist `entry`, returning the sequence number it was stored under.
    fn append(&self, entry: &AccessLogEntry) -> Result<u64>;
}

/// Records every view attempt. Never fails the caller: a write that still
/// fails after `AUDIT_ATTEMPTS` is raised on the `burnlink::audit_alert`
/// target and counted in `failures()`.
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
    failures: Arc<AtomicU64>,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record(
        &self,
        short_id: &str,
        outcome: AccessOutcome,
        actor_hint: Option<&str>,
        timestamp: i64,
    ) {
        let entry = AccessLogEntry::new(short_id, outcome, actor_hint.map(str::to_owned), timestamp);

        let mut last_err = None;
        for attempt in 1..=AUDIT_ATTEMPTS {
            match self.sink.append(&entry) {
                Ok(_) => return,
                Err(e) => {
                    warn!(attempt, short_id, %outcome, error = %e, "audit write failed");
                    last_err = Some(e);
                }
            }
        }

        let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        error!(
            target: "burnlink::audit_alert",
            short_id,
            %outcome,
            total_failures = total,
            error = %last_err.map(|e| e.to_string()).unwrap_or_default(),
            "access log entry lost"
        );
    }

    /// Number of entries lost since startup.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Fails the first `fail_first` appends, then succeeds.
    struct FlakySink {
        fail_first: u32,
        calls: Mutex<u32>,
        entries: Mutex<Vec<AccessLogEntry>>,
    }

    impl FlakySink {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: Mutex::new(0),
                entries: Mutex::new(Vec::new()),
            })
        }
    }

    impl AuditSink for FlakySink {
        fn append(&self, entry: &AccessLogEntry) -> Result<u64> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.fail_first {
                anyhow::bail!("disk full");
            }
            let mut entries = self.entries.lock().unwrap();
            entries.push(entry.clone());
            Ok(entries.len() as u64)
        }
    }

    #[test]
    fn retries_until_the_write_lands() {
        let sink = FlakySink::new(AUDIT_ATTEMPTS - 1);
        let auditor = Auditor::new(sink.clone());
        auditor.record("abc", AccessOutcome::Revealed, Some("10.0.0.1"), 42);

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].short_id, "abc");
        assert_eq!(entries[0].outcome, AccessOutcome::Revealed);
        assert_eq!(entries[0].actor_hint.as_deref(), Some("10.0.0.1"));
        assert_eq!(auditor.failures(), 0);
    }

    #[test]
    fn counts_entries_that_could_not_be_written() {
        let sink = FlakySink::new(u32::MAX);
        let auditor = Auditor::new(sink.clone());
        auditor.record("abc", AccessOutcome::Revealed, None, 42);
        auditor.record("abc", AccessOutcome::AlreadyBurned, None, 43);

        assert_eq!(*sink.calls.lock().unwrap(), 2 * AUDIT_ATTEMPTS);
        assert_eq!(auditor.failures(), 2);
    }

    #[test]
    fn outcome_names_round_trip() {
        for outcome in [
            AccessOutcome::Revealed,
            AccessOutcome::AlreadyBurned,
            AccessOutcome::Expired,
            AccessOutcome::NotFound,
            AccessOutcome::AuthenticationFailed,
        ] {
            assert_eq!(AccessOutcome::parse(outcome.as_str()), Some(outcome));
        }
        assert_eq!(AccessOutcome::parse("burned"), None);
    }
}
