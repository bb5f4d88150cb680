use std::sync::Arc;

use chrono::{DateTime, Utc};
use revisit_core::{Observation, ResolutionEvent, VisitorId, VisitorRecord, VisitorStats};
use revisit_ledger::{Ledger, LedgerError, VisitRange};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::events::EventBus;
use crate::resolver::{IdentityResolver, ResolveError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("failed to spawn resolver thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("resolver thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the resolver thread.
enum EngineRequest {
    Resolve {
        observation: Observation,
        reply: oneshot::Sender<Result<ResolutionEvent, ResolveError>>,
    },
}

/// Clone-safe handle to the resolver thread and the ledger it writes.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    ledger: Arc<Ledger>,
    events: EventBus,
}

impl EngineHandle {
    /// Queue an observation for resolution and wait for its outcome.
    ///
    /// Waits for queue space when the resolver is saturated; callers wanting
    /// a deadline wrap this in `tokio::time::timeout`.
    pub async fn resolve(&self, observation: Observation) -> Result<ResolutionEvent, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Resolve {
                observation,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn stats(&self, window_start: DateTime<Utc>) -> Result<VisitorStats, EngineError> {
        self.read(move |ledger| ledger.stats_in_window(window_start)).await
    }

    pub async fn list_all(&self) -> Result<Vec<VisitorRecord>, EngineError> {
        self.read(|ledger| ledger.list_all()).await
    }

    pub async fn get(&self, id: VisitorId) -> Result<Option<VisitorRecord>, EngineError> {
        self.read(move |ledger| ledger.get(id)).await
    }

    pub async fn list_visits(
        &self,
        range: Option<VisitRange>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<VisitorRecord>, EngineError> {
        self.read(move |ledger| ledger.list_visits(range, limit, offset)).await
    }

    pub async fn top_visitors(&self, n: usize) -> Result<Vec<VisitorRecord>, EngineError> {
        self.read(move |ledger| ledger.top_visitors(n)).await
    }

    pub async fn visitor_count(&self) -> Result<usize, EngineError> {
        self.read(|ledger| ledger.len()).await
    }

    pub async fn rename(&self, id: VisitorId, name: String) -> Result<VisitorRecord, EngineError> {
        let ledger = Arc::clone(&self.ledger);
        let result = tokio::task::spawn_blocking(move || ledger.rename(id, name))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(result?)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run a ledger read off the async executor; the ledger lock blocks.
    async fn read<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Ledger) -> T + Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the resolver on a dedicated OS thread.
///
/// Observations are resolved strictly one at a time in arrival order;
/// `queue_depth` bounds how many may wait.
pub fn spawn_engine(resolver: IdentityResolver, queue_depth: usize) -> Result<EngineHandle, EngineError> {
    let ledger = Arc::clone(resolver.ledger());
    let events = resolver.events().clone();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));

    std::thread::Builder::new()
        .name("revisit-resolver".into())
        .spawn(move || {
            tracing::info!("resolver thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Resolve { observation, reply } => {
                        let result = resolver.resolve(observation);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("resolver thread exiting");
        })?;

    Ok(EngineHandle { tx, ledger, events })
}
