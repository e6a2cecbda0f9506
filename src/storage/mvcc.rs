//! This module implements a Percolator-style MVCC (Multi-Version Concurrency
//! Control) key/value store, as used to emulate a distributed transactional
//! KV service in tests and development. Clients drive two-phase commit
//! against it: a transaction buffers its writes, prewrites them under a start
//! timestamp (locking every key, with one key designated as the primary),
//! then commits them under a later commit timestamp. On failure the locks are
//! rolled back, and other clients that run into them can resolve them once
//! the transaction's fate is known from its primary key.
//!
//! VERSIONS
//! ========
//!
//! The store keeps multiple historical versions of every key, identified by
//! the commit timestamp of the transaction that wrote them. All records of a
//! user key are folded into a single ordered keyspace by appending the
//! version to the encoded user key in descending order, with the reserved
//! version LOCK_VERSION (the maximum timestamp) denoting the key's lock
//! record. A forward scan from encode_key(key, LOCK_VERSION) therefore
//! yields:
//!
//! key   LOCK_VERSION -> lock (if any)
//! key   version n    -> newest value record
//! ...
//! key   version 0    -> oldest value record
//! key'  LOCK_VERSION -> next user key's lock
//! ...
//!
//! This makes every per-key operation a short forward iteration: the lock is
//! seen first, then versions newest-first, without any secondary index.
//!
//! Value records are either committed versions (puts and deletes, carrying
//! the value inline) or rollback markers. A rollback marker records that the
//! transaction with its start timestamp was rolled back at this key, and
//! rejects any prewrite that arrives late with the same timestamp; it is
//! stored at the physical version of its start timestamp but never becomes
//! visible to reads.
//!
//! ISOLATION
//! =========
//!
//! Reads are snapshots at a timestamp: a read at timestamp T sees, for each
//! key, the newest version committed at or before T. Under snapshot
//! isolation a lock held by a transaction that began at or before T blocks
//! the read (the lock may commit below T, so the correct version is not yet
//! known); the read fails with a Locked error carrying the lock's primary
//! key, and the client backs off or resolves the lock. Under read committed
//! the lock is ignored and the latest committed version is returned.
//!
//! Writers conflict on the lock table and on committed versions: prewrite
//! fails if another transaction holds the key's lock, or if a version was
//! committed at or after the prewriting transaction's start timestamp (the
//! Percolator write-write conflict rule). All conflicts are reported to the
//! client, which retries with a new timestamp.
//!
//! CONCURRENCY
//! ===========
//!
//! A single store-wide reader-writer lock guards all operations: reads take
//! it in shared mode, transaction writers exclusively. Every writer collects
//! its mutations into one batch and applies it atomically at the end of the
//! call, so readers never observe a torn commit or a half-applied rollback.
//!
//! Old versions are kept forever; garbage collection is not implemented.

use super::{Batch, BitCask, Memory, Range, Scan, Store, Write};
use crate::encoding;
use crate::error::{Error, Result};

use log::info;
use serde::{Deserialize, Serialize};
use std::iter::Peekable;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// The reserved version at which a key's lock record sorts, before all of its
/// value records.
const LOCK_VERSION: u64 = u64::MAX;

/// Encodes a physical key for a user key and version, ordering by user key
/// first and then by descending version.
fn encode_key(key: &[u8], version: u64) -> Vec<u8> {
    let mut encoded = encoding::encode_bytes(key);
    encoded.extend(encoding::encode_u64_desc(version));
    encoded
}

/// Decodes a physical key into its user key and version. A key without a
/// version suffix is a bare meta key, and decodes at version 0.
fn decode_key(mut bytes: &[u8]) -> Result<(Vec<u8>, u64)> {
    let bytes = &mut bytes;
    let key = encoding::take_bytes(bytes)?;
    if bytes.is_empty() {
        return Ok((key, 0));
    }
    if bytes.len() != 8 {
        return Err(Error::Internal("invalid encoded key".into()));
    }
    let version = encoding::take_u64_desc(bytes)?;
    Ok((key, version))
}

/// Serializes MVCC records.
fn serialize<V: Serialize>(value: &V) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserializes MVCC records.
fn deserialize<'a, V: Deserialize<'a>>(bytes: &'a [u8]) -> Result<V> {
    Ok(bincode::deserialize(bytes)?)
}

/// A read's isolation level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IsolationLevel {
    /// Snapshot isolation: the read sees all versions committed at or before
    /// its timestamp, and is blocked by locks of transactions that began at
    /// or before it.
    Snapshot,
    /// Read committed: the read sees the latest committed version, ignoring
    /// outstanding locks.
    ReadCommitted,
}

/// A mutation operation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Writes a value.
    Put,
    /// Deletes a key.
    Delete,
    /// Locks a key without writing to it. Committing a Lock mutation leaves
    /// no version behind.
    Lock,
}

/// A key mutation submitted via prewrite.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub op: Op,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Mutation {
    pub fn put(key: &[u8], value: &[u8]) -> Self {
        Self { op: Op::Put, key: key.to_vec(), value: value.to_vec() }
    }

    pub fn delete(key: &[u8]) -> Self {
        Self { op: Op::Delete, key: key.to_vec(), value: Vec::new() }
    }

    pub fn lock(key: &[u8]) -> Self {
        Self { op: Op::Lock, key: key.to_vec(), value: Vec::new() }
    }
}

/// A pending lock on a key. At most one lock exists per user key at a time.
/// Locks are created by prewrite and removed by commit, rollback, cleanup and
/// resolve_lock; they are never modified in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    /// The start timestamp of the transaction holding the lock.
    pub start_ts: u64,
    /// The transaction's primary key, which decides its fate.
    #[serde(with = "serde_bytes")]
    pub primary: Vec<u8>,
    /// The staged value, moved into a value record on commit.
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    pub op: Op,
    /// The lock's time-to-live, stored for clients deciding whether to
    /// resolve it. Expiry is not enforced here.
    pub ttl: u64,
}

impl Lock {
    /// Returns the lock conflict error for an access to the given key.
    fn conflict(&self, key: &[u8]) -> Error {
        Error::Locked {
            key: key.to_vec(),
            primary: self.primary.clone(),
            version: self.start_ts,
            ttl: self.ttl,
        }
    }
}

/// A value record's type.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueType {
    Put,
    Delete,
    /// A rollback marker: the transaction with this record's start timestamp
    /// was rolled back at this key, and must not prewrite it again.
    Rollback,
}

/// A value record: a committed version of a key, or a rollback marker.
/// Stored at the physical version of its commit timestamp (which, for
/// rollback markers, equals the start timestamp) and never modified
/// afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub value_type: ValueType,
    pub start_ts: u64,
    pub commit_ts: u64,
    /// The value; empty for Delete and Rollback records.
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

/// A key/value scan result. Per-key lock conflicts are returned as the
/// pair's value error.
#[derive(Clone, Debug, PartialEq)]
pub struct Pair {
    pub key: Vec<u8>,
    pub value: Result<Vec<u8>>,
}

/// An outstanding lock reported by scan_lock.
#[derive(Clone, Debug, PartialEq)]
pub struct LockInfo {
    pub key: Vec<u8>,
    pub primary: Vec<u8>,
    /// The start timestamp of the transaction holding the lock.
    pub version: u64,
}

/// A user key's lock and value records, for debugging and tests.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub lock: Option<Lock>,
    /// The key's value records, newest first.
    pub values: Vec<Value>,
}

/// Decodes the lock record of the expected user key, if the iterator is
/// positioned at one, and consumes it. Otherwise leaves the iterator
/// untouched.
fn decode_lock(iter: &mut Peekable<Scan<'_>>, expect: &[u8]) -> Result<Option<Lock>> {
    let (key, bytes) = match iter.peek() {
        Some(Ok(item)) => item,
        Some(Err(err)) => return Err(err.clone()),
        None => return Ok(None),
    };
    let (user_key, version) = decode_key(key)?;
    if user_key.as_slice() != expect || version != LOCK_VERSION {
        return Ok(None);
    }
    let lock: Lock = deserialize(bytes)?;
    iter.next();
    Ok(Some(lock))
}

/// Decodes a value record of the expected user key, if the iterator is
/// positioned at one, and consumes it. Otherwise leaves the iterator
/// untouched.
fn decode_value(iter: &mut Peekable<Scan<'_>>, expect: &[u8]) -> Result<Option<Value>> {
    let (key, bytes) = match iter.peek() {
        Some(Ok(item)) => item,
        Some(Err(err)) => return Err(err.clone()),
        None => return Ok(None),
    };
    let (user_key, version) = decode_key(key)?;
    if user_key.as_slice() != expect || version == LOCK_VERSION {
        return Ok(None);
    }
    let value: Value = deserialize(bytes)?;
    iter.next();
    Ok(Some(value))
}

/// Skips all remaining records of the current user key, returning the next
/// user key without consuming any of its records.
fn next_key(iter: &mut Peekable<Scan<'_>>, curr: &[u8]) -> Result<Option<Vec<u8>>> {
    loop {
        let key = match iter.peek() {
            Some(Ok((key, _))) => key,
            Some(Err(err)) => return Err(err.clone()),
            None => return Ok(None),
        };
        let (user_key, _) = decode_key(key)?;
        if user_key.as_slice() != curr {
            return Ok(Some(user_key));
        }
        iter.next();
    }
}

/// Returns the first user key of a scan: the given start key, or the first
/// decoded user key when the start key is empty.
fn first_key(iter: &mut Peekable<Scan<'_>>, start: &[u8]) -> Result<Option<Vec<u8>>> {
    if !start.is_empty() {
        return Ok(Some(start.to_vec()));
    }
    match iter.peek() {
        Some(Ok((key, _))) => Ok(Some(decode_key(key)?.0)),
        Some(Err(err)) => Err(err.clone()),
        None => Ok(None),
    }
}

/// Decodes a user key's lock (if any) followed by all of its value records.
/// Returns None if the key has neither.
fn decode_entry(iter: &mut Peekable<Scan<'_>>, expect: &[u8]) -> Result<Option<Entry>> {
    let lock = decode_lock(iter, expect)?;
    let mut values = Vec::new();
    while let Some(value) = decode_value(iter, expect)? {
        values.push(value);
    }
    if lock.is_none() && values.is_empty() {
        return Ok(None);
    }
    Ok(Some(Entry { lock, values }))
}

/// Resolves the value of a key visible at the given read timestamp, stepping
/// the iterator through the key's lock and value records.
fn read_value(
    iter: &mut Peekable<Scan<'_>>,
    key: &[u8],
    start_ts: u64,
    isolation: IsolationLevel,
) -> Result<Option<Vec<u8>>> {
    if let Some(lock) = decode_lock(iter, key)? {
        if isolation == IsolationLevel::Snapshot && lock.start_ts <= start_ts {
            return Err(lock.conflict(key));
        }
    }
    while let Some(value) = decode_value(iter, key)? {
        if value.value_type == ValueType::Rollback {
            continue;
        }
        // The newest version committed at or before the read timestamp wins.
        if value.commit_ts <= start_ts {
            return match value.value_type {
                ValueType::Put => Ok(Some(value.value)),
                _ => Ok(None),
            };
        }
    }
    Ok(None)
}

/// Advances through a key's value records until one belonging to the given
/// transaction is found, or the key's records end.
fn txn_record(iter: &mut Peekable<Scan<'_>>, key: &[u8], start_ts: u64) -> Result<Option<Value>> {
    while let Some(value) = decode_value(iter, key)? {
        if value.start_ts == start_ts {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Prewrites a single mutation into the batch.
fn prewrite_mutation(
    store: &dyn Store,
    batch: &mut Batch,
    mutation: &Mutation,
    primary: &[u8],
    start_ts: u64,
    ttl: u64,
) -> Result<()> {
    let mut iter = store.scan(Range::from(encode_key(&mutation.key, LOCK_VERSION)..)).peekable();

    if let Some(lock) = decode_lock(&mut iter, &mutation.key)? {
        if lock.start_ts != start_ts {
            return Err(lock.conflict(&mutation.key));
        }
        // Already prewritten by this transaction.
        return Ok(());
    }

    // The Percolator write-write conflict test: the newest value record
    // decides. A version committed at or after our start timestamp
    // conflicts, as does our own rollback marker (this prewrite arrived
    // after the transaction was rolled back, and must not resurrect it).
    if let Some(value) = decode_value(&mut iter, &mutation.key)? {
        match value.value_type {
            ValueType::Rollback if value.start_ts == start_ts => {
                return Err(Error::Retryable("write conflict".into()));
            }
            ValueType::Rollback => {}
            _ if value.commit_ts >= start_ts => {
                return Err(Error::Retryable("write conflict".into()));
            }
            _ => {}
        }
    }

    let lock = Lock {
        start_ts,
        primary: primary.to_vec(),
        value: mutation.value.clone(),
        op: mutation.op,
        ttl,
    };
    batch.push(Write::Put(encode_key(&mutation.key, LOCK_VERSION), serialize(&lock)?));
    Ok(())
}

/// Commits a single key into the batch.
fn commit_key(
    store: &dyn Store,
    batch: &mut Batch,
    key: &[u8],
    start_ts: u64,
    commit_ts: u64,
) -> Result<()> {
    let mut iter = store.scan(Range::from(encode_key(key, LOCK_VERSION)..)).peekable();
    match decode_lock(&mut iter, key)? {
        Some(lock) if lock.start_ts == start_ts => {
            commit_lock(batch, lock, key, start_ts, commit_ts)
        }
        // No matching lock: either this transaction already committed the key
        // and this is a retry, or it never prewrote it at all.
        _ => match txn_record(&mut iter, key, start_ts)? {
            Some(value) if value.value_type != ValueType::Rollback => Ok(()),
            _ => Err(Error::Retryable("txn not found".into())),
        },
    }
}

/// Commits a lock into the batch: writes the committed value record (except
/// for Lock mutations, which leave no version behind) and removes the lock.
fn commit_lock(
    batch: &mut Batch,
    lock: Lock,
    key: &[u8],
    start_ts: u64,
    commit_ts: u64,
) -> Result<()> {
    if lock.op != Op::Lock {
        let value_type = if lock.op == Op::Put { ValueType::Put } else { ValueType::Delete };
        let value = Value { value_type, start_ts, commit_ts, value: lock.value };
        batch.push(Write::Put(encode_key(key, commit_ts), serialize(&value)?));
    }
    batch.push(Write::Delete(encode_key(key, LOCK_VERSION)));
    Ok(())
}

/// Rolls back a single key into the batch.
fn rollback_key(store: &dyn Store, batch: &mut Batch, key: &[u8], start_ts: u64) -> Result<()> {
    let mut iter = store.scan(Range::from(encode_key(key, LOCK_VERSION)..)).peekable();

    if let Some(lock) = decode_lock(&mut iter, key)? {
        if lock.start_ts == start_ts {
            return rollback_lock(batch, key, start_ts);
        }
    }
    if let Some(value) = txn_record(&mut iter, key, start_ts)? {
        if value.value_type != ValueType::Rollback {
            return Err(Error::AlreadyCommitted { commit_ts: value.commit_ts });
        }
        // Already rolled back.
        return Ok(());
    }

    // The key was never prewritten. Write a rollback marker anyway, to
    // reject a prewrite arriving late with the same start timestamp.
    let marker =
        Value { value_type: ValueType::Rollback, start_ts, commit_ts: start_ts, value: Vec::new() };
    batch.push(Write::Put(encode_key(key, start_ts), serialize(&marker)?));
    Ok(())
}

/// Rolls back a lock into the batch: writes a rollback marker at the
/// transaction's start timestamp and removes the lock.
fn rollback_lock(batch: &mut Batch, key: &[u8], start_ts: u64) -> Result<()> {
    let marker =
        Value { value_type: ValueType::Rollback, start_ts, commit_ts: start_ts, value: Vec::new() };
    batch.push(Write::Put(encode_key(key, start_ts), serialize(&marker)?));
    batch.push(Write::Delete(encode_key(key, LOCK_VERSION)));
    Ok(())
}

/// The physical range of a user-key scan: each bound starts at its key's
/// lock record, with empty bounds unbounded.
fn scan_range(start: &[u8], end: &[u8]) -> Range {
    let start_bound = if start.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Included(encode_key(start, LOCK_VERSION))
    };
    let end_bound = if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(encode_key(end, LOCK_VERSION))
    };
    Range::from((start_bound, end_bound))
}

/// A Percolator-style MVCC transactional key-value store. See the module
/// documentation for the data layout and protocol.
pub struct MVCC {
    /// The underlying store, shared behind a reader-writer lock: reads take
    /// it in shared mode, transaction writers exclusively.
    store: Arc<RwLock<Box<dyn Store>>>,
}

impl Clone for MVCC {
    fn clone(&self) -> Self {
        MVCC { store: self.store.clone() }
    }
}

impl MVCC {
    /// Creates a new MVCC store on top of the given key-value store.
    pub fn new(store: Box<dyn Store>) -> Self {
        Self { store: Arc::new(RwLock::new(store)) }
    }

    /// Opens an MVCC store at the given file path, or an in-memory store if
    /// no path is given.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let store: Box<dyn Store> = match path {
            Some(path) => Box::new(BitCask::new(path)?),
            None => Box::new(Memory::new()),
        };
        info!("Opened MVCC store backed by {}", store);
        Ok(Self::new(store))
    }

    /// Fetches the value of a key visible at the given read timestamp, or
    /// None if there is no visible version.
    pub fn get(
        &self,
        key: &[u8],
        start_ts: u64,
        isolation: IsolationLevel,
    ) -> Result<Option<Vec<u8>>> {
        let session = self.store.read()?;
        let mut iter = session.scan(Range::from(encode_key(key, LOCK_VERSION)..)).peekable();
        read_value(&mut iter, key, start_ts, isolation)
    }

    /// Fetches multiple keys at the given read timestamp. The result
    /// contains a pair for every key with a non-empty value or a per-key
    /// error; other keys are omitted.
    pub fn batch_get(
        &self,
        keys: &[Vec<u8>],
        start_ts: u64,
        isolation: IsolationLevel,
    ) -> Result<Vec<Pair>> {
        let session = self.store.read()?;
        let mut pairs = Vec::new();
        for key in keys {
            let mut iter = session.scan(Range::from(encode_key(key, LOCK_VERSION)..)).peekable();
            match read_value(&mut iter, key, start_ts, isolation) {
                Ok(None) => {}
                Ok(Some(value)) => pairs.push(Pair { key: key.clone(), value: Ok(value) }),
                Err(err) => pairs.push(Pair { key: key.clone(), value: Err(err) }),
            }
        }
        Ok(pairs)
    }

    /// Scans the visible values of the keys in [start, end) at the given
    /// read timestamp, in ascending key order, up to the given limit. Empty
    /// bounds are unbounded. Keys whose read fails with a lock conflict are
    /// included as pair errors.
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
        start_ts: u64,
        isolation: IsolationLevel,
    ) -> Result<Vec<Pair>> {
        let session = self.store.read()?;
        let mut iter = session.scan(scan_range(start, end)).peekable();
        let mut curr = match first_key(&mut iter, start)? {
            Some(key) => key,
            None => return Ok(Vec::new()),
        };
        let mut pairs = Vec::new();
        while pairs.len() < limit {
            match read_value(&mut iter, &curr, start_ts, isolation) {
                Ok(Some(value)) => pairs.push(Pair { key: curr.clone(), value: Ok(value) }),
                Ok(None) => {}
                Err(err @ Error::Locked { .. }) => {
                    pairs.push(Pair { key: curr.clone(), value: Err(err) })
                }
                Err(err) => return Err(err),
            }
            match next_key(&mut iter, &curr)? {
                Some(key) => curr = key,
                None => break,
            }
        }
        Ok(pairs)
    }

    /// Scans in descending key order. Not currently implemented.
    pub fn reverse_scan(
        &self,
        _start: &[u8],
        _end: &[u8],
        _limit: usize,
        _start_ts: u64,
        _isolation: IsolationLevel,
    ) -> Result<Vec<Pair>> {
        Err(Error::Internal("reverse scan is not implemented".into()))
    }

    /// The first phase of two-phase commit: locks the mutated keys and
    /// stages their values, failing on locks held by other transactions and
    /// on write-write conflicts. Returns one result per mutation, in input
    /// order; the locks are written only if every mutation succeeded.
    /// Prewriting the same mutations again under the same start timestamp is
    /// a no-op.
    pub fn prewrite(
        &self,
        mutations: &[Mutation],
        primary: &[u8],
        start_ts: u64,
        ttl: u64,
    ) -> Result<Vec<Result<()>>> {
        let mut session = self.store.write()?;
        let mut batch = Batch::new();
        let mut results = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            results.push(prewrite_mutation(
                &**session,
                &mut batch,
                mutation,
                primary,
                start_ts,
                ttl,
            ));
        }
        if results.iter().any(|result| result.is_err()) {
            return Ok(results);
        }
        session.write(batch)?;
        Ok(results)
    }

    /// The second phase of two-phase commit: makes the prewritten values of
    /// the given keys visible at the commit timestamp. Either all keys are
    /// committed, or the first error is returned and nothing is written.
    /// Committing an already committed transaction again is a no-op.
    pub fn commit(&self, keys: &[Vec<u8>], start_ts: u64, commit_ts: u64) -> Result<()> {
        let mut session = self.store.write()?;
        let mut batch = Batch::new();
        for key in keys {
            commit_key(&**session, &mut batch, key, start_ts, commit_ts)?;
        }
        session.write(batch)
    }

    /// Rolls back the given keys of a transaction, removing its locks and
    /// writing rollback markers that reject any late prewrite under the same
    /// start timestamp. Fails with AlreadyCommitted if the transaction
    /// already committed.
    pub fn rollback(&self, keys: &[Vec<u8>], start_ts: u64) -> Result<()> {
        let mut session = self.store.write()?;
        let mut batch = Batch::new();
        for key in keys {
            rollback_key(&**session, &mut batch, key, start_ts)?;
        }
        session.write(batch)
    }

    /// Rolls back a single key, typically to remove an orphaned lock on
    /// behalf of a stalled transaction.
    pub fn cleanup(&self, key: &[u8], start_ts: u64) -> Result<()> {
        let mut session = self.store.write()?;
        let mut batch = Batch::new();
        rollback_key(&**session, &mut batch, key, start_ts)?;
        session.write(batch)
    }

    /// Returns all locks in [start, end) held by transactions that began at
    /// or before the given timestamp, in ascending key order.
    pub fn scan_lock(&self, start: &[u8], end: &[u8], max_ts: u64) -> Result<Vec<LockInfo>> {
        let session = self.store.read()?;
        let mut iter = session.scan(scan_range(start, end)).peekable();
        let mut curr = match first_key(&mut iter, start)? {
            Some(key) => key,
            None => return Ok(Vec::new()),
        };
        let mut locks = Vec::new();
        loop {
            if let Some(lock) = decode_lock(&mut iter, &curr)? {
                if lock.start_ts <= max_ts {
                    locks.push(LockInfo {
                        key: curr.clone(),
                        primary: lock.primary,
                        version: lock.start_ts,
                    });
                }
            }
            match next_key(&mut iter, &curr)? {
                Some(key) => curr = key,
                None => break,
            }
        }
        Ok(locks)
    }

    /// Commits or rolls back every lock in [start, end) held by the given
    /// transaction, as a single atomic batch: a non-zero commit timestamp
    /// commits the locks, zero rolls them back. Used to clear locks left
    /// behind by a crashed or stalled transaction once its fate is known
    /// from its primary key.
    pub fn resolve_lock(
        &self,
        start: &[u8],
        end: &[u8],
        start_ts: u64,
        commit_ts: u64,
    ) -> Result<()> {
        let mut session = self.store.write()?;
        let mut batch = Batch::new();
        {
            let mut iter = session.scan(scan_range(start, end)).peekable();
            let mut curr = match first_key(&mut iter, start)? {
                Some(key) => key,
                None => return Ok(()),
            };
            loop {
                if let Some(lock) = decode_lock(&mut iter, &curr)? {
                    if lock.start_ts == start_ts {
                        if commit_ts > 0 {
                            commit_lock(&mut batch, lock, &curr, start_ts, commit_ts)?;
                        } else {
                            rollback_lock(&mut batch, &curr, start_ts)?;
                        }
                    }
                }
                match next_key(&mut iter, &curr)? {
                    Some(key) => curr = key,
                    None => break,
                }
            }
        }
        session.write(batch)
    }

    /// Returns the lock and all value records of a key, for debugging and
    /// tests, or None if the key has no records at all.
    pub fn entry(&self, key: &[u8]) -> Result<Option<Entry>> {
        let session = self.store.read()?;
        let mut iter = session.scan(Range::from(encode_key(key, LOCK_VERSION)..)).peekable();
        decode_entry(&mut iter, key)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn setup() -> MVCC {
        MVCC::new(Box::new(Memory::new()))
    }

    /// Prewrites and commits a single put, as a test convenience.
    fn write(mvcc: &MVCC, key: &[u8], value: &[u8], start_ts: u64, commit_ts: u64) -> Result<()> {
        for result in mvcc.prewrite(&[Mutation::put(key, value)], key, start_ts, 0)? {
            result?;
        }
        mvcc.commit(&[key.to_vec()], start_ts, commit_ts)
    }

    #[test]
    fn test_key_codec() -> Result<()> {
        // Encoding must round-trip exactly.
        for (key, version) in [
            (b"".to_vec(), 0),
            (b"a".to_vec(), 1),
            (b"key".to_vec(), u64::MAX),
            (b"\x00\xff".to_vec(), 7),
        ] {
            assert_eq!(decode_key(&encode_key(&key, version))?, (key, version));
        }

        // Physical keys order by user key first, for any versions.
        let keys: Vec<&[u8]> = vec![b"a", b"a\x00", b"ab", b"b"];
        for pair in keys.windows(2) {
            for v1 in [0, 1, LOCK_VERSION] {
                for v2 in [0, 1, LOCK_VERSION] {
                    assert!(encode_key(pair[0], v1) < encode_key(pair[1], v2));
                }
            }
        }

        // Within a key, newer versions order first, with the lock version
        // before all of them.
        assert!(encode_key(b"a", LOCK_VERSION) < encode_key(b"a", 100));
        assert!(encode_key(b"a", 100) < encode_key(b"a", 99));
        assert!(encode_key(b"a", 1) < encode_key(b"a", 0));

        // The bare meta key form decodes at version 0.
        assert_eq!(decode_key(&encoding::encode_bytes(b"meta"))?, (b"meta".to_vec(), 0));

        // Any other remainder is rejected.
        let mut bytes = encode_key(b"a", 1);
        bytes.push(0xff);
        assert!(decode_key(&bytes).is_err());
        assert!(decode_key(&[&encoding::encode_bytes(b"a")[..], &[0x01]].concat()).is_err());
        Ok(())
    }

    #[test]
    fn test_get() -> Result<()> {
        let mvcc = setup();
        write(&mvcc, b"a", b"1", 10, 20)?;

        assert_eq!(mvcc.get(b"a", 25, IsolationLevel::Snapshot)?, Some(b"1".to_vec()));
        assert_eq!(mvcc.get(b"a", 20, IsolationLevel::Snapshot)?, Some(b"1".to_vec()));
        assert_eq!(mvcc.get(b"a", 15, IsolationLevel::Snapshot)?, None);
        assert_eq!(mvcc.get(b"b", 25, IsolationLevel::Snapshot)?, None);

        // With multiple versions, the newest at or below the read timestamp
        // wins.
        write(&mvcc, b"a", b"2", 30, 40)?;
        assert_eq!(mvcc.get(b"a", 35, IsolationLevel::Snapshot)?, Some(b"1".to_vec()));
        assert_eq!(mvcc.get(b"a", 40, IsolationLevel::Snapshot)?, Some(b"2".to_vec()));

        // Deletes become invisible at their commit timestamp.
        for result in mvcc.prewrite(&[Mutation::delete(b"a")], b"a", 50, 0)? {
            result?;
        }
        mvcc.commit(&[b"a".to_vec()], 50, 60)?;
        assert_eq!(mvcc.get(b"a", 55, IsolationLevel::Snapshot)?, Some(b"2".to_vec()));
        assert_eq!(mvcc.get(b"a", 65, IsolationLevel::Snapshot)?, None);
        Ok(())
    }

    #[test]
    fn test_get_isolation() -> Result<()> {
        // Snapshot isolation blocks on an outstanding lock, read committed
        // reads the latest committed version underneath it.
        let mvcc = setup();
        write(&mvcc, b"b", b"old", 20, 25)?;
        for result in mvcc.prewrite(&[Mutation::put(b"b", b"x")], b"b", 30, 0)? {
            result?;
        }

        assert_eq!(
            mvcc.get(b"b", 40, IsolationLevel::Snapshot),
            Err(Error::Locked { key: b"b".to_vec(), primary: b"b".to_vec(), version: 30, ttl: 0 })
        );
        assert_eq!(mvcc.get(b"b", 40, IsolationLevel::ReadCommitted)?, Some(b"old".to_vec()));

        // A snapshot read below the lock's start timestamp is not blocked.
        assert_eq!(mvcc.get(b"b", 29, IsolationLevel::Snapshot)?, Some(b"old".to_vec()));
        Ok(())
    }

    #[test]
    fn test_batch_get() -> Result<()> {
        let mvcc = setup();
        write(&mvcc, b"a", b"1", 10, 20)?;
        write(&mvcc, b"c", b"3", 12, 22)?;
        for result in mvcc.prewrite(&[Mutation::put(b"d", b"4")], b"d", 30, 0)? {
            result?;
        }

        // Missing keys are omitted, locked keys are reported as pair errors.
        let keys = [b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()];
        assert_eq!(
            mvcc.batch_get(&keys, 40, IsolationLevel::Snapshot)?,
            vec![
                Pair { key: b"a".to_vec(), value: Ok(b"1".to_vec()) },
                Pair { key: b"c".to_vec(), value: Ok(b"3".to_vec()) },
                Pair {
                    key: b"d".to_vec(),
                    value: Err(Error::Locked {
                        key: b"d".to_vec(),
                        primary: b"d".to_vec(),
                        version: 30,
                        ttl: 0,
                    }),
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_prewrite_locked() -> Result<()> {
        let mvcc = setup();
        for result in mvcc.prewrite(&[Mutation::put(b"a", b"1")], b"a", 10, 30)? {
            result?;
        }

        // Prewriting again under the same timestamp is a no-op, leaving the
        // store unchanged.
        let before = mvcc.entry(b"a")?;
        for result in mvcc.prewrite(&[Mutation::put(b"a", b"1")], b"a", 10, 30)? {
            result?;
        }
        assert_eq!(before, mvcc.entry(b"a")?);

        // Another transaction is locked out, and told about the lock.
        assert_eq!(
            mvcc.prewrite(&[Mutation::put(b"a", b"2")], b"a", 20, 0)?,
            vec![Err(Error::Locked {
                key: b"a".to_vec(),
                primary: b"a".to_vec(),
                version: 10,
                ttl: 30,
            })]
        );

        // Only a single lock record exists for the key.
        let entry = mvcc.entry(b"a")?.expect("entry should exist");
        assert_eq!(
            entry.lock,
            Some(Lock { start_ts: 10, primary: b"a".to_vec(), value: b"1".to_vec(), op: Op::Put, ttl: 30 })
        );
        assert_eq!(entry.values, vec![]);
        Ok(())
    }

    #[test]
    fn test_prewrite_write_conflict() -> Result<()> {
        let mvcc = setup();
        write(&mvcc, b"a", b"1", 10, 20)?;

        // The commit at 20 conflicts with a prewrite at 15. Results are
        // position-aligned with the mutations, and the failed batch must not
        // be applied, so b gets no lock.
        assert_eq!(
            mvcc.prewrite(&[Mutation::put(b"a", b"2"), Mutation::put(b"b", b"2")], b"a", 15, 0)?,
            vec![Err(Error::Retryable("write conflict".into())), Ok(())]
        );
        assert_eq!(mvcc.entry(b"b")?, None);

        // A prewrite past the committed timestamp succeeds.
        assert_eq!(mvcc.prewrite(&[Mutation::put(b"a", b"2")], b"a", 25, 0)?, vec![Ok(())]);
        Ok(())
    }

    #[test]
    fn test_commit() -> Result<()> {
        let mvcc = setup();
        for result in mvcc.prewrite(&[Mutation::put(b"a", b"1")], b"a", 10, 0)? {
            result?;
        }
        mvcc.commit(&[b"a".to_vec()], 10, 20)?;
        assert_eq!(mvcc.get(b"a", 25, IsolationLevel::Snapshot)?, Some(b"1".to_vec()));

        // Commit is idempotent after success.
        let before = mvcc.entry(b"a")?;
        mvcc.commit(&[b"a".to_vec()], 10, 20)?;
        assert_eq!(before, mvcc.entry(b"a")?);

        // Committing an unknown transaction is retryable.
        assert_eq!(
            mvcc.commit(&[b"b".to_vec()], 10, 20),
            Err(Error::Retryable("txn not found".into()))
        );

        // A failed key aborts the whole commit, leaving other locks in
        // place.
        for result in mvcc.prewrite(&[Mutation::put(b"c", b"3")], b"c", 30, 0)? {
            result?;
        }
        assert_eq!(
            mvcc.commit(&[b"d".to_vec(), b"c".to_vec()], 30, 40),
            Err(Error::Retryable("txn not found".into()))
        );
        assert!(mvcc.entry(b"c")?.expect("entry should exist").lock.is_some());
        assert_eq!(mvcc.get(b"c", 50, IsolationLevel::ReadCommitted)?, None);
        Ok(())
    }

    #[test]
    fn test_rollback() -> Result<()> {
        let mvcc = setup();
        let mutations = [Mutation::put(b"a", b"1"), Mutation::put(b"b", b"1")];
        for result in mvcc.prewrite(&mutations, b"a", 10, 0)? {
            result?;
        }
        mvcc.rollback(&[b"a".to_vec(), b"b".to_vec()], 10)?;

        // The locks are gone, replaced by rollback markers, and the
        // transaction can no longer commit.
        let entry = mvcc.entry(b"a")?.expect("entry should exist");
        assert_eq!(entry.lock, None);
        assert_eq!(
            entry.values,
            vec![Value { value_type: ValueType::Rollback, start_ts: 10, commit_ts: 10, value: vec![] }]
        );
        assert_eq!(mvcc.get(b"a", 20, IsolationLevel::Snapshot)?, None);
        assert_eq!(
            mvcc.commit(&[b"a".to_vec()], 10, 20),
            Err(Error::Retryable("txn not found".into()))
        );

        // Rollback is idempotent.
        mvcc.rollback(&[b"a".to_vec()], 10)?;

        // Rolling back a committed transaction fails.
        write(&mvcc, b"c", b"3", 30, 40)?;
        assert_eq!(
            mvcc.rollback(&[b"c".to_vec()], 30),
            Err(Error::AlreadyCommitted { commit_ts: 40 })
        );
        Ok(())
    }

    #[test]
    fn test_rollback_blocks_late_prewrite() -> Result<()> {
        // Rolling back a key that was never prewritten still writes a
        // marker, which rejects a prewrite arriving later with the same
        // start timestamp.
        let mvcc = setup();
        mvcc.rollback(&[b"c".to_vec()], 50)?;
        assert_eq!(
            mvcc.entry(b"c")?,
            Some(Entry {
                lock: None,
                values: vec![Value {
                    value_type: ValueType::Rollback,
                    start_ts: 50,
                    commit_ts: 50,
                    value: vec![],
                }],
            })
        );

        assert_eq!(
            mvcc.prewrite(&[Mutation::put(b"c", b"y")], b"c", 50, 0)?,
            vec![Err(Error::Retryable("write conflict".into()))]
        );
        assert_eq!(mvcc.entry(b"c")?.expect("entry should exist").lock, None);

        // A later transaction is not affected by the marker.
        for result in mvcc.prewrite(&[Mutation::put(b"c", b"z")], b"c", 60, 0)? {
            result?;
        }
        Ok(())
    }

    #[test]
    fn test_cleanup() -> Result<()> {
        let mvcc = setup();
        for result in mvcc.prewrite(&[Mutation::put(b"a", b"1")], b"a", 10, 0)? {
            result?;
        }
        mvcc.cleanup(b"a", 10)?;
        assert_eq!(mvcc.scan_lock(b"", b"", 100)?, vec![]);
        assert_eq!(
            mvcc.commit(&[b"a".to_vec()], 10, 20),
            Err(Error::Retryable("txn not found".into()))
        );
        Ok(())
    }

    #[test]
    fn test_scan() -> Result<()> {
        let mvcc = setup();
        write(&mvcc, b"a", b"1", 11, 20)?;
        write(&mvcc, b"b", b"2", 12, 20)?;
        write(&mvcc, b"c", b"3", 13, 20)?;

        // Ascending order, bounded by the limit.
        assert_eq!(
            mvcc.scan(b"", b"", 2, 25, IsolationLevel::Snapshot)?,
            vec![
                Pair { key: b"a".to_vec(), value: Ok(b"1".to_vec()) },
                Pair { key: b"b".to_vec(), value: Ok(b"2".to_vec()) },
            ]
        );
        assert_eq!(mvcc.scan(b"", b"", 10, 25, IsolationLevel::Snapshot)?.len(), 3);
        assert_eq!(mvcc.scan(b"", b"", 0, 25, IsolationLevel::Snapshot)?, vec![]);

        // Start is inclusive, end exclusive, empty bounds unbounded.
        assert_eq!(
            mvcc.scan(b"b", b"", 10, 25, IsolationLevel::Snapshot)?,
            vec![
                Pair { key: b"b".to_vec(), value: Ok(b"2".to_vec()) },
                Pair { key: b"c".to_vec(), value: Ok(b"3".to_vec()) },
            ]
        );
        assert_eq!(
            mvcc.scan(b"", b"c", 10, 25, IsolationLevel::Snapshot)?,
            vec![
                Pair { key: b"a".to_vec(), value: Ok(b"1".to_vec()) },
                Pair { key: b"b".to_vec(), value: Ok(b"2".to_vec()) },
            ]
        );

        // A read timestamp before the commits sees nothing.
        assert_eq!(mvcc.scan(b"", b"", 10, 15, IsolationLevel::Snapshot)?, vec![]);

        // Deleted keys are skipped, locked keys are reported as pair errors.
        for result in mvcc.prewrite(&[Mutation::delete(b"b")], b"b", 30, 0)? {
            result?;
        }
        mvcc.commit(&[b"b".to_vec()], 30, 35)?;
        for result in mvcc.prewrite(&[Mutation::put(b"c", b"x")], b"c", 40, 0)? {
            result?;
        }
        assert_eq!(
            mvcc.scan(b"", b"", 10, 50, IsolationLevel::Snapshot)?,
            vec![
                Pair { key: b"a".to_vec(), value: Ok(b"1".to_vec()) },
                Pair {
                    key: b"c".to_vec(),
                    value: Err(Error::Locked {
                        key: b"c".to_vec(),
                        primary: b"c".to_vec(),
                        version: 40,
                        ttl: 0,
                    }),
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_reverse_scan() -> Result<()> {
        let mvcc = setup();
        assert!(mvcc.reverse_scan(b"", b"", 10, 25, IsolationLevel::Snapshot).is_err());
        Ok(())
    }

    #[test]
    fn test_scan_lock() -> Result<()> {
        let mvcc = setup();
        let mutations =
            [Mutation::put(b"a", b"1"), Mutation::put(b"b", b"2"), Mutation::put(b"c", b"3")];
        for result in mvcc.prewrite(&mutations, b"a", 10, 0)? {
            result?;
        }
        for result in mvcc.prewrite(&[Mutation::put(b"d", b"4")], b"d", 20, 0)? {
            result?;
        }

        let lock = |key: &[u8], primary: &[u8], version| LockInfo {
            key: key.to_vec(),
            primary: primary.to_vec(),
            version,
        };

        // Only locks at or below the given timestamp are reported.
        assert_eq!(
            mvcc.scan_lock(b"", b"", 15)?,
            vec![lock(b"a", b"a", 10), lock(b"b", b"a", 10), lock(b"c", b"a", 10)]
        );
        assert_eq!(
            mvcc.scan_lock(b"", b"", 25)?,
            vec![lock(b"a", b"a", 10), lock(b"b", b"a", 10), lock(b"c", b"a", 10), lock(b"d", b"d", 20)]
        );

        // Range bounds apply, end exclusive.
        assert_eq!(mvcc.scan_lock(b"b", b"d", 25)?, vec![lock(b"b", b"a", 10), lock(b"c", b"a", 10)]);
        Ok(())
    }

    #[test]
    fn test_resolve_lock() -> Result<()> {
        let mvcc = setup();

        // Committing outstanding locks makes them visible.
        let mutations = [Mutation::put(b"d", b"v"), Mutation::put(b"e", b"w")];
        for result in mvcc.prewrite(&mutations, b"d", 60, 0)? {
            result?;
        }
        mvcc.resolve_lock(b"", b"", 60, 70)?;
        assert_eq!(mvcc.get(b"d", 80, IsolationLevel::Snapshot)?, Some(b"v".to_vec()));
        assert_eq!(mvcc.get(b"e", 80, IsolationLevel::Snapshot)?, Some(b"w".to_vec()));
        assert_eq!(mvcc.scan_lock(b"", b"", 100)?, vec![]);

        // A zero commit timestamp rolls the locks back instead.
        for result in mvcc.prewrite(&[Mutation::put(b"f", b"x")], b"f", 90, 0)? {
            result?;
        }
        mvcc.resolve_lock(b"", b"", 90, 0)?;
        assert_eq!(mvcc.scan_lock(b"", b"", 100)?, vec![]);
        assert_eq!(mvcc.get(b"f", 95, IsolationLevel::Snapshot)?, None);
        assert_eq!(
            mvcc.prewrite(&[Mutation::put(b"f", b"x")], b"f", 90, 0)?,
            vec![Err(Error::Retryable("write conflict".into()))]
        );

        // Only locks of the given transaction are resolved.
        for result in mvcc.prewrite(&[Mutation::put(b"g", b"y")], b"g", 100, 0)? {
            result?;
        }
        for result in mvcc.prewrite(&[Mutation::put(b"h", b"z")], b"h", 110, 0)? {
            result?;
        }
        mvcc.resolve_lock(b"", b"", 100, 120)?;
        assert_eq!(mvcc.get(b"g", 130, IsolationLevel::ReadCommitted)?, Some(b"y".to_vec()));
        assert_eq!(
            mvcc.scan_lock(b"", b"", 200)?,
            vec![LockInfo { key: b"h".to_vec(), primary: b"h".to_vec(), version: 110 }]
        );
        Ok(())
    }

    #[test]
    fn test_lock_op() -> Result<()> {
        let mvcc = setup();
        write(&mvcc, b"a", b"v", 5, 8)?;

        // A Lock mutation blocks snapshot reads like any other lock.
        for result in mvcc.prewrite(&[Mutation::lock(b"a")], b"a", 10, 0)? {
            result?;
        }
        assert_eq!(
            mvcc.get(b"a", 15, IsolationLevel::Snapshot),
            Err(Error::Locked { key: b"a".to_vec(), primary: b"a".to_vec(), version: 10, ttl: 0 })
        );

        // Committing it leaves no version behind.
        mvcc.commit(&[b"a".to_vec()], 10, 20)?;
        assert_eq!(mvcc.get(b"a", 25, IsolationLevel::Snapshot)?, Some(b"v".to_vec()));
        let entry = mvcc.entry(b"a")?.expect("entry should exist");
        assert_eq!(entry.lock, None);
        assert_eq!(entry.values.len(), 1);
        Ok(())
    }

    #[test]
    fn test_concurrent_writers() -> Result<()> {
        // The store is shared between threads via Clone. Each thread commits
        // its own key; all writes must be visible afterwards.
        let mvcc = setup();
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let mvcc = mvcc.clone();
            handles.push(std::thread::spawn(move || -> Result<()> {
                let start_ts = 10 * i as u64 + 1;
                write(&mvcc, &[i], &[i], start_ts, start_ts + 5)
            }));
        }
        for handle in handles {
            handle.join().expect("thread panicked")?;
        }

        let pairs = mvcc.scan(b"", b"", 100, 1000, IsolationLevel::Snapshot)?;
        assert_eq!(pairs.len(), 8);
        for (i, pair) in pairs.iter().enumerate() {
            assert_eq!(pair, &Pair { key: vec![i as u8], value: Ok(vec![i as u8]) });
        }
        Ok(())
    }

    #[test]
    fn test_open() -> Result<()> {
        // No path opens an in-memory store.
        let mvcc = MVCC::open(None)?;
        write(&mvcc, b"a", b"1", 10, 20)?;
        assert_eq!(mvcc.get(b"a", 25, IsolationLevel::Snapshot)?, Some(b"1".to_vec()));

        // A path opens a file-backed store that persists across reopens,
        // including outstanding locks.
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("toykv");
        let mvcc = MVCC::open(Some(&path))?;
        write(&mvcc, b"a", b"1", 10, 20)?;
        for result in mvcc.prewrite(&[Mutation::put(b"b", b"2")], b"b", 30, 0)? {
            result?;
        }
        drop(mvcc);

        let mvcc = MVCC::open(Some(&path))?;
        assert_eq!(mvcc.get(b"a", 25, IsolationLevel::Snapshot)?, Some(b"1".to_vec()));
        assert_eq!(
            mvcc.scan_lock(b"", b"", 100)?,
            vec![LockInfo { key: b"b".to_vec(), primary: b"b".to_vec(), version: 30 }]
        );
        Ok(())
    }
}
