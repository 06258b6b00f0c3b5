use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use tokio::time;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use super::audit::{AccessLogEntry, AuditQuery, AuditSink};
use super::crypto::NONCE_LEN;
use super::model::{SecretMeta, SecretRecord};
use crate::error::StoreError;

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
const ACCESS_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("access_log");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const ACCESS_SEQ_KEY: &str = "access_seq";

/// Leading byte of every encoded record.
const RECORD_FORMAT_V1: u8 = 0x01;

/// Outcome of the atomic consume transition.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsumeResult {
    /// This caller won one unit of quota. Carries the ciphertext as it was
    /// before the transition.
    Consumed {
        ciphertext: Vec<u8>,
        nonce: [u8; NONCE_LEN],
        views_remaining: u32,
    },
    AlreadyBurned,
    Expired,
    NotFound,
}

/// Outcome of an owner-initiated revoke.
#[derive(Debug, PartialEq, Eq)]
pub enum RevokeResult {
    Revoked,
    NotOwner,
    NotFound,
}

/// Thread-safe handle to the redb store.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(ACCESS_LOG)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert a new record under `short_id`. Fails with `Conflict` if the ID
    /// is already taken; existing rows are never overwritten.
    pub fn create(&self, short_id: &str, record: &SecretRecord) -> Result<(), StoreError> {
        if self.insert_new(short_id, record)? {
            debug!(short_id, expires_at = record.expires_at, max_views = record.max_views, "stored secret");
            Ok(())
        } else {
            Err(StoreError::Conflict(short_id.to_owned()))
        }
    }

    fn insert_new(&self, short_id: &str, record: &SecretRecord) -> Result<bool> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(SECRETS)?;
            let exists = table.get(short_id)?.is_some();
            if !exists {
                table.insert(short_id, bytes.as_slice())?;
            }
            !exists
        };
        if inserted {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(inserted)
    }

    /// The consume transition. Expiry and quota are checked and the counter
    /// is bumped inside one write transaction; redb admits a single writer at
    /// a time, so concurrent callers are linearized and at most
    /// `max_views - views_consumed` of them get `Consumed`.
    ///
    /// The quota is spent once this returns, whatever the caller does next.
    pub fn try_consume(&self, short_id: &str, now: i64) -> Result<ConsumeResult, StoreError> {
        Ok(self.consume_inner(short_id, now)?)
    }

    fn consume_inner(&self, short_id: &str, now: i64) -> Result<ConsumeResult> {
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Copy the bytes out so the AccessGuard (which borrows `table`)
            // is dropped before any mutation.
            let raw_bytes: Option<Vec<u8>> =
                table.get(short_id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => ConsumeResult::NotFound,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;

                    if record.is_expired(now) {
                        ConsumeResult::Expired
                    } else if record.is_burned() {
                        ConsumeResult::AlreadyBurned
                    } else {
                        let ciphertext = record.ciphertext.clone();
                        record.views_consumed += 1;
                        if record.is_burned() {
                            // Last unit of quota: erase the payload but keep
                            // the row so later lookups classify as burned.
                            record.ciphertext.zeroize();
                            record.ciphertext = Vec::new();
                            debug!(short_id, "burned after final view");
                        }
                        let updated = encode(&record)?;
                        table.insert(short_id, updated.as_slice())?;

                        ConsumeResult::Consumed {
                            ciphertext,
                            nonce: record.nonce,
                            views_remaining: record.views_remaining(),
                        }
                    }
                }
            }
        };

        match result {
            ConsumeResult::Consumed { .. } => write_txn.commit()?,
            _ => write_txn.abort()?,
        }
        Ok(result)
    }

    /// Write raw bytes under `short_id`, bypassing encoding.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, short_id: &str, bytes: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            table.insert(short_id, bytes)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Read-only lookup. Does not count as a view.
    pub fn get(&self, short_id: &str) -> Result<Option<SecretRecord>, StoreError> {
        let read = || -> Result<Option<SecretRecord>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SECRETS)?;
            let raw_bytes: Option<Vec<u8>> =
                table.get(short_id)?.map(|guard| guard.value().to_vec());
            raw_bytes.map(|bytes| decode(&bytes)).transpose()
        };
        Ok(read()?)
    }

    /// Metadata for every record created by `owner_ref`, newest first.
    pub fn list_for_owner(&self, owner_ref: &str, now: i64) -> Result<Vec<SecretMeta>, StoreError> {
        let list = || -> Result<Vec<SecretMeta>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(SECRETS)?;

            let mut metas = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let record = decode(v.value())?;
                if record.owner_ref.as_deref() == Some(owner_ref) {
                    metas.push(record.meta(k.value(), now));
                }
            }
            metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(metas)
        };
        Ok(list()?)
    }

    /// Burn a record early on behalf of its owner. Ownership is checked in
    /// the same transaction that spends the remaining quota.
    pub fn revoke(&self, short_id: &str, owner_ref: &str) -> Result<RevokeResult, StoreError> {
        let revoke = || -> Result<RevokeResult> {
            let write_txn = self.db.begin_write()?;
            let result = {
                let mut table = write_txn.open_table(SECRETS)?;
                let raw_bytes: Option<Vec<u8>> =
                    table.get(short_id)?.map(|guard| guard.value().to_vec());

                match raw_bytes {
                    None => RevokeResult::NotFound,
                    Some(bytes) => {
                        let mut record = decode(&bytes)?;
                        if record.owner_ref.as_deref() != Some(owner_ref) {
                            RevokeResult::NotOwner
                        } else {
                            record.views_consumed = record.max_views;
                            record.ciphertext.zeroize();
                            record.ciphertext = Vec::new();
                            let updated = encode(&record)?;
                            table.insert(short_id, updated.as_slice())?;
                            RevokeResult::Revoked
                        }
                    }
                }
            };
            match result {
                RevokeResult::Revoked => write_txn.commit()?,
                _ => write_txn.abort()?,
            }
            Ok(result)
        };
        let result = revoke()?;
        if result == RevokeResult::Revoked {
            info!(short_id, "secret revoked by owner");
        }
        Ok(result)
    }

    /// Delete every row with `expires_at <= now`, burned or not. Scan and
    /// delete share one write transaction, so a concurrent consume sees either
    /// the row or nothing. Returns the number of rows removed.
    pub fn sweep_expired(&self, now: i64) -> Result<usize, StoreError> {
        Ok(self.sweep_inner(now)?)
    }

    fn sweep_inner(&self, now: i64) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SECRETS)?;

            let mut expired: Vec<String> = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let record = decode(v.value())?;
                if record.expires_at <= now {
                    expired.push(k.value().to_owned());
                }
            }

            for key in &expired {
                table.remove(key.as_str())?;
            }
            expired.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            info!(removed, "swept expired secrets");
        }
        Ok(removed)
    }

    // ── Access log ────────────────────────────────────────────────────────

    /// Append an access log entry. Allocates a monotonic ID via the counters table.
    pub fn append_access(&self, entry: &AccessLogEntry) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let seq = {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let seq = counters.get(ACCESS_SEQ_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert(ACCESS_SEQ_KEY, seq)?;

            let mut stored = entry.clone();
            stored.id = seq;
            let bytes = bincode::serde::encode_to_vec(&stored, bincode::config::standard())
                .context("bincode encode access entry")?;
            let mut log = write_txn.open_table(ACCESS_LOG)?;
            log.insert(seq, bytes.as_slice())?;
            seq
        };
        write_txn.commit()?;
        Ok(seq)
    }

    /// List access log entries matching the query, most recent first.
    pub fn list_access(&self, query: &AuditQuery) -> Result<Vec<AccessLogEntry>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCESS_LOG)?;

        let mut entries = Vec::new();
        for item in table.iter()?.rev() {
            let (_k, v) = item?;
            let (entry, _): (AccessLogEntry, _) =
                bincode::serde::decode_from_slice(v.value(), bincode::config::standard())
                    .context("bincode decode access entry")?;

            if let Some(since) = query.since {
                if entry.timestamp < since {
                    continue;
                }
            }
            if let Some(until) = query.until {
                if entry.timestamp > until {
                    continue;
                }
            }
            if let Some(ref short_id) = query.short_id {
                if entry.short_id != *short_id {
                    continue;
                }
            }
            if let Some(outcome) = query.outcome {
                if entry.outcome != outcome {
                    continue;
                }
            }
            entries.push(entry);
            if entries.len() >= query.limit {
                break;
            }
        }
        Ok(entries)
    }

    /// Spawn a background Tokio task that calls `sweep_expired()` every
    /// `interval`. A missed or failed tick only delays physical cleanup;
    /// `try_consume` enforces expiry on its own.
    pub fn spawn_sweep(self, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_expired(crate::unix_now()) {
                    warn!(error = %e, "background sweep error");
                }
            }
        });
    }
}

impl AuditSink for Store {
    fn append(&self, entry: &AccessLogEntry) -> Result<u64> {
        self.append_access(entry)
    }
}

/// Encode a SecretRecord: `[RECORD_FORMAT_V1] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_FORMAT_V1);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        None => anyhow::bail!("empty record"),
        Some((&RECORD_FORMAT_V1, rest)) => {
            let (record, _) = bincode::serde::decode_from_slice(rest, bincode::config::standard())
                .context("bincode decode v1")?;
            Ok(record)
        }
        Some((version, _)) => anyhow::bail!("unknown record format {version:#04x}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::store::audit::AccessOutcome;
    use crate::store::model::SecretState;
    use tempfile::tempdir;

    const NOW: i64 = 1_700_000_000;

    fn make_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path).unwrap();
        (store, dir)
    }

    fn record(max_views: u32, ttl: i64, owner: Option<&str>) -> SecretRecord {
        SecretRecord {
            ciphertext: b"opaque-ciphertext".to_vec(),
            nonce: [9; NONCE_LEN],
            created_at: NOW,
            expires_at: NOW + ttl,
            max_views,
            views_consumed: 0,
            owner_ref: owner.map(str::to_owned),
        }
    }

    #[test]
    fn create_rejects_duplicate_ids() {
        let (s, _dir) = make_store();
        s.create("dup", &record(1, 60, None)).unwrap();
        let err = s.create("dup", &record(3, 60, None)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(id) if id == "dup"));
        // The original row is untouched.
        assert_eq!(s.get("dup").unwrap().unwrap().max_views, 1);
    }

    #[test]
    fn single_view_burns() {
        let (s, _dir) = make_store();
        s.create("once", &record(1, 60, None)).unwrap();
        match s.try_consume("once", NOW).unwrap() {
            ConsumeResult::Consumed {
                ciphertext,
                nonce,
                views_remaining,
            } => {
                assert_eq!(ciphertext, b"opaque-ciphertext");
                assert_eq!(nonce, [9; NONCE_LEN]);
                assert_eq!(views_remaining, 0);
            }
            other => panic!("expected Consumed, got {other:?}"),
        }
        assert_eq!(s.try_consume("once", NOW).unwrap(), ConsumeResult::AlreadyBurned);

        let stored = s.get("once").unwrap().unwrap();
        assert!(stored.ciphertext.is_empty());
        assert_eq!(stored.views_consumed, 1);
    }

    #[test]
    fn multi_view_counts_down() {
        let (s, _dir) = make_store();
        s.create("three", &record(3, 60, None)).unwrap();
        for expected_remaining in [2, 1, 0] {
            match s.try_consume("three", NOW).unwrap() {
                ConsumeResult::Consumed {
                    views_remaining, ..
                } => assert_eq!(views_remaining, expected_remaining),
                other => panic!("expected Consumed, got {other:?}"),
            }
        }
        assert_eq!(s.try_consume("three", NOW).unwrap(), ConsumeResult::AlreadyBurned);
    }

    #[test]
    fn expiry_supersedes_quota_and_does_not_mutate() {
        let (s, _dir) = make_store();
        s.create("late", &record(5, 60, None)).unwrap();
        assert_eq!(s.try_consume("late", NOW + 60).unwrap(), ConsumeResult::Expired);
        assert_eq!(s.try_consume("late", NOW + 3600).unwrap(), ConsumeResult::Expired);
        assert_eq!(s.get("late").unwrap().unwrap().views_consumed, 0);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let (s, _dir) = make_store();
        assert_eq!(s.try_consume("nope", NOW).unwrap(), ConsumeResult::NotFound);
        assert!(s.get("nope").unwrap().is_none());
    }

    #[test]
    fn concurrent_consumers_get_exactly_the_quota() {
        for (max_views, racers) in [(1u32, 16usize), (3, 16)] {
            let (s, _dir) = make_store();
            s.create("race", &record(max_views, 60, None)).unwrap();

            let barrier = Arc::new(Barrier::new(racers));
            let handles: Vec<_> = (0..racers)
                .map(|_| {
                    let s = s.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        s.try_consume("race", NOW).unwrap()
                    })
                })
                .collect();

            let results: Vec<ConsumeResult> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            let winners = results
                .iter()
                .filter(|r| matches!(r, ConsumeResult::Consumed { .. }))
                .count();
            let burned = results
                .iter()
                .filter(|r| **r == ConsumeResult::AlreadyBurned)
                .count();
            assert_eq!(winners, max_views as usize);
            assert_eq!(burned, racers - max_views as usize);
            assert_eq!(s.get("race").unwrap().unwrap().views_consumed, max_views);
        }
    }

    #[test]
    fn sweep_removes_expired_and_is_idempotent() {
        let (s, _dir) = make_store();
        s.create("live", &record(1, 3600, None)).unwrap();
        s.create("dead", &record(1, 60, None)).unwrap();
        s.create("burned-dead", &record(1, 60, None)).unwrap();
        s.try_consume("burned-dead", NOW).unwrap();

        assert_eq!(s.sweep_expired(NOW + 60).unwrap(), 2);
        assert_eq!(s.sweep_expired(NOW + 60).unwrap(), 0);
        assert!(s.get("live").unwrap().is_some());
        assert!(s.get("dead").unwrap().is_none());
        assert_eq!(s.try_consume("dead", NOW + 60).unwrap(), ConsumeResult::NotFound);
    }

    #[test]
    fn owner_listing_and_revoke() {
        let (s, _dir) = make_store();
        s.create("mine", &record(2, 60, Some("alice"))).unwrap();
        s.create("theirs", &record(2, 60, Some("bob"))).unwrap();
        s.create("anon", &record(2, 60, None)).unwrap();

        let metas = s.list_for_owner("alice", NOW).unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].short_id, "mine");
        assert_eq!(metas[0].state, SecretState::Active);

        assert_eq!(s.revoke("theirs", "alice").unwrap(), RevokeResult::NotOwner);
        assert_eq!(s.revoke("anon", "alice").unwrap(), RevokeResult::NotOwner);
        assert_eq!(s.revoke("missing", "alice").unwrap(), RevokeResult::NotFound);
        assert_eq!(s.revoke("mine", "alice").unwrap(), RevokeResult::Revoked);

        assert_eq!(s.try_consume("mine", NOW).unwrap(), ConsumeResult::AlreadyBurned);
        assert_eq!(
            s.list_for_owner("alice", NOW).unwrap()[0].state,
            SecretState::Burned
        );
        assert!(matches!(
            s.try_consume("theirs", NOW).unwrap(),
            ConsumeResult::Consumed { .. }
        ));
    }

    #[test]
    fn rejects_unknown_record_format() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x7f, 1, 2, 3]).is_err());
        let bytes = encode(&record(1, 60, None)).unwrap();
        assert_eq!(bytes[0], RECORD_FORMAT_V1);
        assert_eq!(decode(&bytes).unwrap().max_views, 1);
    }

    // ── Access log tests ─────────────────────────────────────────────────

    #[test]
    fn append_and_list_access() {
        let (s, _dir) = make_store();
        s.append_access(&AccessLogEntry::new("k1", AccessOutcome::Revealed, Some("127.0.0.1".into()), NOW))
            .unwrap();
        s.append_access(&AccessLogEntry::new("k1", AccessOutcome::AlreadyBurned, None, NOW + 1))
            .unwrap();

        let entries = s.list_access(&AuditQuery::default()).unwrap();
        assert_eq!(entries.len(), 2);
        // Most recent first.
        assert_eq!(entries[0].outcome, AccessOutcome::AlreadyBurned);
        assert_eq!(entries[0].id, 2);
        assert_eq!(entries[1].outcome, AccessOutcome::Revealed);
        assert_eq!(entries[1].id, 1);
    }

    #[test]
    fn access_query_filters() {
        let (s, _dir) = make_store();
        for i in 0..6 {
            let short_id = if i % 2 == 0 { "even" } else { "odd" };
            s.append_access(&AccessLogEntry::new(short_id, AccessOutcome::NotFound, None, NOW + i))
                .unwrap();
        }

        let by_id = s
            .list_access(&AuditQuery {
                short_id: Some("even".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_id.len(), 3);
        assert!(by_id.iter().all(|e| e.short_id == "even"));

        let windowed = s
            .list_access(&AuditQuery {
                since: Some(NOW + 1),
                until: Some(NOW + 3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(windowed.len(), 3);

        let limited = s
            .list_access(&AuditQuery {
                limit: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);

        let by_outcome = s
            .list_access(&AuditQuery {
                outcome: Some(AccessOutcome::Revealed),
                ..Default::default()
            })
            .unwrap();
        assert!(by_outcome.is_empty());
    }

    #[test]
    fn zero_limit_lists_nothing() {
        let (s, _dir) = make_store();
        for i in 0..3 {
            s.append_access(&AccessLogEntry::new("k1", AccessOutcome::Revealed, None, NOW + i))
                .unwrap();
        }
        let none = s
            .list_access(&AuditQuery {
                limit: 0,
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn corrupt_row_fails_consume_without_guessing() {
        let (s, _dir) = make_store();
        s.put_raw("k1", &[0x7f, 1, 2, 3]).unwrap();
        assert!(matches!(
            s.try_consume("k1", NOW),
            Err(StoreError::Unavailable(_))
        ));
    }
}
