//! Visitor ledger: in-memory records mirrored to a durable store.
//!
//! # Locking
//!
//! All state sits behind one `tokio::sync::RwLock`. Its queue is FIFO, so a
//! pending writer blocks readers that arrive after it (writer-preferring).
//! A [`LedgerTxn`] holds the write half for its whole lifetime, letting a
//! caller read, decide and mutate without another transaction interleaving.
//!
//! Blocking accessors (`blocking_read`/`blocking_write`) are used throughout;
//! call them from plain threads or `spawn_blocking`, never from async tasks.
//!
//! # Durability
//!
//! Every mutation builds the new record on a copy, writes it to the store and
//! only then installs it in memory. A store failure therefore leaves both
//! copies untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use revisit_core::{Embedding, VisitorId, VisitorRecord, VisitorStats};
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::store::{StoreError, VisitorStore};

const DEFAULT_NAME: &str = "Unknown Visitor";
const DEFAULT_MAX_REFERENCES: usize = 5;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("visitor {0} not found")]
    NotFound(VisitorId),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("declared visit count must be at least 1")]
    InvalidVisitCount,
    #[error("visitor id {0} exceeds the storable range")]
    InvalidId(VisitorId),
    #[error("no storable visitor id left to allocate")]
    IdSpaceExhausted,
}

/// How a declared visit count from upstream is reconciled with the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilePolicy {
    /// The declared count replaces the stored one.
    #[default]
    TrustDeclared,
    /// Declared counts are ignored; every sighting adds one.
    AlwaysIncrement,
}

impl fmt::Display for ReconcilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TrustDeclared => "trust-declared",
            Self::AlwaysIncrement => "always-increment",
        })
    }
}

impl FromStr for ReconcilePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trust-declared" | "trust_declared" => Ok(Self::TrustDeclared),
            "always-increment" | "always_increment" => Ok(Self::AlwaysIncrement),
            other => Err(format!("unknown reconcile policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerOptions {
    pub reconcile: ReconcilePolicy,
    /// Name given to visitors created without one.
    pub default_name: String,
    /// Reference embeddings kept per visitor (at least 1).
    pub max_references: usize,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            reconcile: ReconcilePolicy::default(),
            default_name: DEFAULT_NAME.to_string(),
            max_references: DEFAULT_MAX_REFERENCES,
        }
    }
}

/// Inclusive `last_seen` range for visit listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisitRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl VisitRange {
    fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at <= self.to
    }
}

struct LedgerState {
    records: BTreeMap<VisitorId, VisitorRecord>,
    next_id: u64,
}

impl LedgerState {
    /// Next id above every id in use, or the lowest free id once the top of
    /// the storable range has been taken.
    fn allocate_id(&self) -> Result<VisitorId, LedgerError> {
        let next = VisitorId(self.next_id);
        if next.is_storable() {
            return Ok(next);
        }
        let mut candidate = 1u64;
        for id in self.records.keys() {
            if id.0 > candidate {
                break;
            }
            candidate = id.0.saturating_add(1);
        }
        let candidate = VisitorId(candidate);
        if candidate.is_storable() && !self.records.contains_key(&candidate) {
            Ok(candidate)
        } else {
            Err(LedgerError::IdSpaceExhausted)
        }
    }

    /// Keep allocated ids clear of every id already in use.
    fn reserve(&mut self, id: VisitorId) {
        self.next_id = self.next_id.max(id.0.saturating_add(1));
    }
}

pub struct Ledger {
    state: RwLock<LedgerState>,
    store: Box<dyn VisitorStore>,
    options: LedgerOptions,
}

impl Ledger {
    /// Load every record from `store` and take ownership of it.
    pub fn open(store: impl VisitorStore + 'static, options: LedgerOptions) -> Result<Self, LedgerError> {
        let mut state = LedgerState {
            records: BTreeMap::new(),
            next_id: 1,
        };
        for record in store.scan()? {
            state.reserve(record.id);
            state.records.insert(record.id, record);
        }

        tracing::info!(
            visitors = state.records.len(),
            next_id = state.next_id,
            policy = %options.reconcile,
            "ledger loaded"
        );

        Ok(Self {
            state: RwLock::new(state),
            store: Box::new(store),
            options,
        })
    }

    pub fn options(&self) -> &LedgerOptions {
        &self.options
    }

    /// Begin an exclusive transaction. Blocks until all readers and earlier
    /// writers have finished.
    pub fn write(&self) -> LedgerTxn<'_> {
        LedgerTxn {
            state: self.state.blocking_write(),
            store: self.store.as_ref(),
            options: &self.options,
        }
    }

    /// Shared read access. Blocks while a transaction is in flight.
    pub fn read(&self) -> LedgerView<'_> {
        LedgerView {
            state: self.state.blocking_read(),
        }
    }

    pub fn create_visitor(
        &self,
        embedding: Embedding,
        at: DateTime<Utc>,
        name: Option<String>,
    ) -> Result<VisitorRecord, LedgerError> {
        self.write().create_visitor(embedding, at, name)
    }

    pub fn record_match(&self, id: VisitorId, at: DateTime<Utc>) -> Result<VisitorRecord, LedgerError> {
        self.write().record_match(id, at, None)
    }

    pub fn upsert_from_declared_identity(
        &self,
        id: VisitorId,
        at: DateTime<Utc>,
        declared_visit_count: Option<u32>,
    ) -> Result<VisitorRecord, LedgerError> {
        self.write()
            .upsert_from_declared_identity(id, at, declared_visit_count, None)
            .map(|(record, _)| record)
    }

    pub fn rename(&self, id: VisitorId, name: String) -> Result<VisitorRecord, LedgerError> {
        self.write().rename(id, name)
    }

    pub fn get(&self, id: VisitorId) -> Option<VisitorRecord> {
        self.read().get(id).cloned()
    }

    pub fn list_all(&self) -> Vec<VisitorRecord> {
        self.read().list_all()
    }

    pub fn stats_in_window(&self, window_start: DateTime<Utc>) -> VisitorStats {
        self.read().stats_in_window(window_start)
    }

    pub fn list_visits(&self, range: Option<VisitRange>, limit: usize, offset: usize) -> Vec<VisitorRecord> {
        self.read().list_visits(range, limit, offset)
    }

    pub fn top_visitors(&self, n: usize) -> Vec<VisitorRecord> {
        self.read().top_visitors(n)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only snapshot held under the shared lock.
pub struct LedgerView<'a> {
    state: RwLockReadGuard<'a, LedgerState>,
}

impl LedgerView<'_> {
    pub fn get(&self, id: VisitorId) -> Option<&VisitorRecord> {
        self.state.records.get(&id)
    }

    /// Records in ascending id order.
    pub fn records(&self) -> impl Iterator<Item = &VisitorRecord> {
        self.state.records.values()
    }

    pub fn len(&self) -> usize {
        self.state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.records.is_empty()
    }

    pub fn list_all(&self) -> Vec<VisitorRecord> {
        self.records().cloned().collect()
    }

    pub fn stats_in_window(&self, window_start: DateTime<Utc>) -> VisitorStats {
        let mut stats = VisitorStats {
            window_start,
            total_visitors: 0,
            total_visits: 0,
            new_in_window: 0,
            returning_in_window: 0,
        };
        for record in self.records() {
            stats.total_visitors += 1;
            stats.total_visits += u64::from(record.visit_count);
            if record.first_seen >= window_start {
                stats.new_in_window += 1;
            }
            if record.visit_count > 1 && record.last_seen >= window_start {
                stats.returning_in_window += 1;
            }
        }
        stats
    }

    /// Most recently seen first, optionally restricted to a `last_seen` range.
    pub fn list_visits(&self, range: Option<VisitRange>, limit: usize, offset: usize) -> Vec<VisitorRecord> {
        let mut hits: Vec<&VisitorRecord> = self
            .records()
            .filter(|r| range.map_or(true, |range| range.contains(r.last_seen)))
            .collect();
        hits.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));
        hits.into_iter().skip(offset).take(limit).cloned().collect()
    }

    /// Highest visit counts first; ties broken by ascending id.
    pub fn top_visitors(&self, n: usize) -> Vec<VisitorRecord> {
        let mut all: Vec<&VisitorRecord> = self.records().collect();
        all.sort_by(|a, b| b.visit_count.cmp(&a.visit_count).then(a.id.cmp(&b.id)));
        all.into_iter().take(n).cloned().collect()
    }
}

/// Exclusive transaction over the ledger.
///
/// Each mutating call is persisted individually before it returns; the
/// transaction only guarantees that nothing else runs in between.
pub struct LedgerTxn<'a> {
    state: RwLockWriteGuard<'a, LedgerState>,
    store: &'a dyn VisitorStore,
    options: &'a LedgerOptions,
}

impl LedgerTxn<'_> {
    pub fn get(&self, id: VisitorId) -> Option<&VisitorRecord> {
        self.state.records.get(&id)
    }

    /// Records in ascending id order.
    pub fn records(&self) -> impl Iterator<Item = &VisitorRecord> {
        self.state.records.values()
    }

    /// Allocate a new visitor with `embedding` as its only reference.
    pub fn create_visitor(
        &mut self,
        embedding: Embedding,
        at: DateTime<Utc>,
        name: Option<String>,
    ) -> Result<VisitorRecord, LedgerError> {
        let record = VisitorRecord {
            id: self.state.allocate_id()?,
            display_name: name.unwrap_or_else(|| self.options.default_name.clone()),
            embeddings: vec![embedding],
            visit_count: 1,
            first_seen: at,
            last_seen: at,
        };
        let record = self.commit(record)?;
        tracing::info!(id = %record.id, "visitor created");
        Ok(record)
    }

    /// Count one more visit for `id`, optionally keeping `reference` as an
    /// additional reference embedding.
    pub fn record_match(
        &mut self,
        id: VisitorId,
        at: DateTime<Utc>,
        reference: Option<Embedding>,
    ) -> Result<VisitorRecord, LedgerError> {
        let mut record = self.state.records.get(&id).cloned().ok_or(LedgerError::NotFound(id))?;
        if at < record.last_seen {
            tracing::debug!(id = %id, captured = %at, last_seen = %record.last_seen, "out-of-order capture; last_seen kept");
        }
        record.touch(at);
        if let Some(reference) = reference {
            record.push_reference(reference, self.options.max_references);
        }
        self.commit(record)
    }

    /// Apply a sighting whose identity was assigned upstream.
    ///
    /// Returns the committed record and whether it was newly created.
    pub fn upsert_from_declared_identity(
        &mut self,
        id: VisitorId,
        at: DateTime<Utc>,
        declared_visit_count: Option<u32>,
        reference: Option<Embedding>,
    ) -> Result<(VisitorRecord, bool), LedgerError> {
        if !id.is_storable() {
            return Err(LedgerError::InvalidId(id));
        }
        if declared_visit_count == Some(0) {
            return Err(LedgerError::InvalidVisitCount);
        }
        let declared = match self.options.reconcile {
            ReconcilePolicy::TrustDeclared => declared_visit_count,
            ReconcilePolicy::AlwaysIncrement => None,
        };

        match self.state.records.get(&id).cloned() {
            Some(mut record) => {
                match declared {
                    Some(count) => {
                        record.visit_count = count;
                        record.advance_last_seen(at);
                    }
                    None => record.touch(at),
                }
                if let Some(reference) = reference {
                    record.push_reference(reference, self.options.max_references);
                }
                Ok((self.commit(record)?, false))
            }
            None => {
                let record = VisitorRecord {
                    id,
                    display_name: self.options.default_name.clone(),
                    embeddings: reference.into_iter().collect(),
                    visit_count: declared.unwrap_or(1),
                    first_seen: at,
                    last_seen: at,
                };
                let record = self.commit(record)?;
                tracing::info!(id = %id, visits = record.visit_count, "declared visitor created");
                Ok((record, true))
            }
        }
    }

    pub fn rename(&mut self, id: VisitorId, name: String) -> Result<VisitorRecord, LedgerError> {
        let mut record = self.state.records.get(&id).cloned().ok_or(LedgerError::NotFound(id))?;
        record.display_name = name;
        self.commit(record)
    }

    /// Persist `record`, then install it in memory.
    fn commit(&mut self, record: VisitorRecord) -> Result<VisitorRecord, LedgerError> {
        if let Err(e) = self.store.put(&record) {
            tracing::error!(id = %record.id, error = %e, "visitor write failed; mutation rolled back");
            return Err(e.into());
        }
        self.state.reserve(record.id);
        self.state.records.insert(record.id, record.clone());
        Ok(record)
    }
}
