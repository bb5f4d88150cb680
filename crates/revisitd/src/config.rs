use std::path::PathBuf;
use std::time::Duration;

use revisit_ledger::{LedgerOptions, ReconcilePolicy};

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity threshold for a positive match, in [0, 1].
    pub match_threshold: f32,
    /// Expected embedding dimension.
    pub embedding_dim: usize,
    /// Default look-back window for stats queries.
    pub stats_window: Duration,
    /// Resolution events buffered per subscriber before the oldest are dropped.
    pub event_capacity: usize,
    /// Observations queued for the resolver thread before callers wait.
    pub queue_depth: usize,
    /// How declared visit counts are reconciled.
    pub reconcile: ReconcilePolicy,
    /// Reference embeddings kept per visitor.
    pub max_references: usize,
    /// Name given to newly created visitors.
    pub default_name: String,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `REVISIT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("revisit");

        let db_path = lookup("REVISIT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("visitors.db"));

        let reconcile = match lookup("REVISIT_RECONCILE_POLICY") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to trust-declared");
                ReconcilePolicy::TrustDeclared
            }),
            None => ReconcilePolicy::TrustDeclared,
        };

        let bus = match lookup("REVISIT_BUS").as_deref() {
            Some("system") => BusKind::System,
            _ => BusKind::Session,
        };

        Self {
            db_path,
            match_threshold: parse_or(&lookup, "REVISIT_MATCH_THRESHOLD", 0.7f32).clamp(0.0, 1.0),
            embedding_dim: parse_or(&lookup, "REVISIT_EMBEDDING_DIM", 512usize).max(1),
            stats_window: Duration::from_secs(parse_or(&lookup, "REVISIT_STATS_WINDOW_SECS", 86_400u64)),
            event_capacity: parse_or(&lookup, "REVISIT_EVENT_CAPACITY", 1024usize).max(1),
            queue_depth: parse_or(&lookup, "REVISIT_QUEUE_DEPTH", 64usize).max(1),
            reconcile,
            max_references: parse_or(&lookup, "REVISIT_MAX_REFERENCES", 5usize).max(1),
            default_name: lookup("REVISIT_DEFAULT_NAME").unwrap_or_else(|| "Unknown Visitor".to_string()),
            bus,
        }
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            reconcile: self.reconcile,
            default_name: self.default_name.clone(),
            max_references: self.max_references,
        }
    }
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
