//! Identity resolution: one serialized read-decide-write transaction per
//! observation, followed by event emission.
//!
//! An observation moves through `Received → Matched | NotMatched → Recorded →
//! Emitted`. Declared identities skip matching and go straight to
//! `Recorded`. The matcher reads the ledger under the same write lock that
//! records the outcome, so two sightings of a new face cannot both create a
//! visitor.

use std::sync::Arc;

use revisit_core::{
    CosineMatcher, Embedding, MatchResult, Matcher, Observation, ObservationId, ResolutionEvent,
    VisitorId,
};
use revisit_ledger::{Ledger, LedgerError, LedgerTxn, StoreError};
use thiserror::Error;

use crate::events::EventBus;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("malformed observation: {0}")]
    MalformedObservation(String),
    #[error("visitor {0} not found")]
    NotFound(VisitorId),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl From<LedgerError> for ResolveError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(id) => Self::NotFound(id),
            LedgerError::Persistence(e) => Self::Persistence(e),
            LedgerError::InvalidVisitCount => {
                Self::MalformedObservation("declared visit count must be at least 1".into())
            }
            LedgerError::InvalidId(id) => {
                Self::MalformedObservation(format!("declared id {id} exceeds the storable range"))
            }
            LedgerError::IdSpaceExhausted => Self::Persistence(StoreError::OutOfRange("visitor id")),
        }
    }
}

/// Where an observation is in its resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Matched,
    NotMatched,
    Recorded,
    Emitted,
}

/// Matching decision taken inside the transaction.
enum Decision {
    Declared(VisitorId),
    Matched(MatchResult),
    NotMatched,
}

pub struct IdentityResolver<M = CosineMatcher> {
    ledger: Arc<Ledger>,
    matcher: M,
    threshold: f32,
    embedding_dim: usize,
    events: EventBus,
}

impl IdentityResolver<CosineMatcher> {
    pub fn new(ledger: Arc<Ledger>, threshold: f32, embedding_dim: usize, events: EventBus) -> Self {
        Self::with_matcher(ledger, CosineMatcher, threshold, embedding_dim, events)
    }
}

impl<M: Matcher> IdentityResolver<M> {
    pub fn with_matcher(
        ledger: Arc<Ledger>,
        matcher: M,
        threshold: f32,
        embedding_dim: usize,
        events: EventBus,
    ) -> Self {
        Self {
            ledger,
            matcher,
            threshold: threshold.clamp(0.0, 1.0),
            embedding_dim,
            events,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Resolve one observation and publish its event.
    ///
    /// Blocks on the ledger write lock and on the durable write; run it on a
    /// plain thread. The event is published only after the ledger commits.
    pub fn resolve(&self, observation: Observation) -> Result<ResolutionEvent, ResolveError> {
        let observation_id = ObservationId::new();
        let span = tracing::debug_span!("resolve", observation = %observation_id);
        let _enter = span.enter();

        if let Err(e) = self.validate(&observation) {
            tracing::warn!(error = %e, "dropping observation");
            return Err(e);
        }
        stage(Stage::Received);

        let event = {
            let mut txn = self.ledger.write();
            self.decide_and_record(&mut txn, observation_id, observation)?
        };
        stage(Stage::Recorded);

        let delivered = self.events.publish(event.clone());
        stage(Stage::Emitted);
        tracing::info!(
            visitor = %event.visitor_id,
            known = event.is_known,
            confidence = event.confidence,
            visits = event.visit_count,
            subscribers = delivered,
            "observation resolved"
        );
        Ok(event)
    }

    /// Reject observations before they reach the ledger.
    fn validate(&self, observation: &Observation) -> Result<(), ResolveError> {
        if observation.embedding.is_none() && observation.declared_id.is_none() {
            return Err(ResolveError::MalformedObservation(
                "observation has neither an embedding nor a declared id".into(),
            ));
        }
        if let Some(embedding) = &observation.embedding {
            if embedding.dim() != self.embedding_dim {
                return Err(ResolveError::MalformedObservation(format!(
                    "expected {}-dim embedding, got {}",
                    self.embedding_dim,
                    embedding.dim()
                )));
            }
            if !embedding.is_finite() {
                return Err(ResolveError::MalformedObservation(
                    "embedding contains non-finite values".into(),
                ));
            }
        }
        if let Some(id) = observation.declared_id.filter(|id| !id.is_storable()) {
            return Err(ResolveError::MalformedObservation(format!(
                "declared id {id} exceeds the storable range"
            )));
        }
        if observation.declared_visit_count == Some(0) {
            return Err(ResolveError::MalformedObservation(
                "declared visit count must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn decide(&self, txn: &LedgerTxn<'_>, observation: &Observation) -> Decision {
        if let Some(id) = observation.declared_id {
            return Decision::Declared(id);
        }
        let Some(embedding) = observation.embedding.as_ref() else {
            return Decision::NotMatched;
        };
        match self.matcher.best_match(embedding, txn.records(), self.threshold) {
            Some(m) => {
                stage(Stage::Matched);
                Decision::Matched(m)
            }
            None => {
                stage(Stage::NotMatched);
                Decision::NotMatched
            }
        }
    }

    fn decide_and_record(
        &self,
        txn: &mut LedgerTxn<'_>,
        observation_id: ObservationId,
        observation: Observation,
    ) -> Result<ResolutionEvent, ResolveError> {
        let decision = self.decide(txn, &observation);
        let Observation {
            embedding,
            declared_visit_count,
            captured_at,
            camera_id,
            image_path,
            ..
        } = observation;

        let (record, is_known, confidence) = match decision {
            Decision::Declared(id) => {
                let (record, created) =
                    txn.upsert_from_declared_identity(id, captured_at, declared_visit_count, embedding)?;
                let confidence = if created { 0.0 } else { 1.0 };
                (record, !created, confidence)
            }
            Decision::Matched(m) => {
                let record = txn.record_match(m.visitor_id, captured_at, embedding)?;
                (record, true, m.confidence)
            }
            Decision::NotMatched => {
                let embedding: Embedding = embedding.ok_or_else(|| {
                    ResolveError::MalformedObservation("embedding required for matching".into())
                })?;
                let record = txn.create_visitor(embedding, captured_at, None)?;
                (record, false, 0.0)
            }
        };

        Ok(ResolutionEvent {
            observation_id,
            visitor_id: record.id,
            name: record.display_name,
            is_known,
            confidence,
            timestamp: captured_at,
            visit_count: record.visit_count,
            camera_id,
            image_path,
        })
    }
}

fn stage(stage: Stage) {
    tracing::debug!(?stage, "resolution stage");
}
