//! Partition timestamps.
//!
//! A [`Timestamp`] is an ordered association from vbucket number to
//! (sequence number, branch id, snapshot range) for one bucket. The feed
//! actor keeps three of these per bucket: outstanding requests, confirmed
//! active streams, and rollback-pending streams. Timestamps are value
//! types; every operation returns a new value and the inputs are never
//! mutated, so snapshots handed out of the actor stay stable.

use cascade_common::types::{Seqno, Vbucket, Vbuuid};
use serde::{Deserialize, Serialize};

/// One vbucket's entry in a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsEntry {
    pub vbucket: Vbucket,
    pub seqno: Seqno,
    pub vbuuid: Vbuuid,
    pub snapshot_start: Seqno,
    pub snapshot_end: Seqno,
}

/// Per-bucket partition timestamp, ordered by vbucket number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pool: String,
    bucket: String,
    entries: Vec<TsEntry>,
}

impl Timestamp {
    /// An empty timestamp for `bucket` in `pool`.
    pub fn new(pool: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            bucket: bucket.into(),
            entries: Vec::new(),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Insert or replace the entry for `vbucket`, keeping vbucket order.
    pub fn append(
        &mut self,
        vbucket: Vbucket,
        seqno: Seqno,
        vbuuid: Vbuuid,
        snapshot_start: Seqno,
        snapshot_end: Seqno,
    ) {
        let entry = TsEntry {
            vbucket,
            seqno,
            vbuuid,
            snapshot_start,
            snapshot_end,
        };
        match self.entries.binary_search_by_key(&vbucket, |e| e.vbucket) {
            Ok(i) => self.entries[i] = entry,
            Err(i) => self.entries.insert(i, entry),
        }
    }

    /// Look up the entry for `vbucket`.
    pub fn get(&self, vbucket: Vbucket) -> Option<TsEntry> {
        self.entries
            .binary_search_by_key(&vbucket, |e| e.vbucket)
            .ok()
            .map(|i| self.entries[i])
    }

    pub fn contains(&self, vbucket: Vbucket) -> bool {
        self.get(vbucket).is_some()
    }

    /// Union with `other`. Entries present in both keep `self`'s value.
    /// `other` may be `None`, which unions with the empty set.
    pub fn union(&self, other: Option<&Timestamp>) -> Timestamp {
        let mut out = self.clone();
        if let Some(other) = other {
            for e in &other.entries {
                if !out.contains(e.vbucket) {
                    out.append(e.vbucket, e.seqno, e.vbuuid, e.snapshot_start, e.snapshot_end);
                }
            }
        }
        out
    }

    /// Keep only the entries whose vbucket is in `vbuckets`.
    pub fn select_vbuckets(&self, vbuckets: &[Vbucket]) -> Timestamp {
        let mut out = Timestamp::new(self.pool.clone(), self.bucket.clone());
        out.entries = self
            .entries
            .iter()
            .filter(|e| vbuckets.contains(&e.vbucket))
            .copied()
            .collect();
        out
    }

    /// Remove the entries whose vbucket is in `vbuckets`.
    pub fn filter_vbuckets(&self, vbuckets: &[Vbucket]) -> Timestamp {
        let mut out = Timestamp::new(self.pool.clone(), self.bucket.clone());
        out.entries = self
            .entries
            .iter()
            .filter(|e| !vbuckets.contains(&e.vbucket))
            .copied()
            .collect();
        out
    }

    /// The vbucket numbers covered by this timestamp, in order.
    pub fn vbuckets(&self) -> Vec<Vbucket> {
        self.entries.iter().map(|e| e.vbucket).collect()
    }

    pub fn entries(&self) -> &[TsEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} {:?}", self.pool, self.bucket, self.vbuckets())
    }
}
