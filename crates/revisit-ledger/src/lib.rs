//! revisit-ledger — Durable visitor ledger.
//!
//! The [`Ledger`] owns every visitor record. Mutations are persisted through a
//! [`VisitorStore`] before they become visible; reads are served from the
//! in-memory copy. A single writer lock spans whole transactions.

pub mod ledger;
pub mod sqlite;
pub mod store;

pub use ledger::{Ledger, LedgerError, LedgerOptions, LedgerTxn, LedgerView, ReconcilePolicy, VisitRange};
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, StoreError, VisitorStore};
