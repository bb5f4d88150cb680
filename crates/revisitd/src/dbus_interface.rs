use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use revisit_core::{Observation, VisitorId, VisitorRecord};
use revisit_ledger::{LedgerError, VisitRange};
use serde::Serialize;
use zbus::interface;
use zbus::object_server::SignalEmitter;

use crate::engine::{EngineError, EngineHandle};
use crate::resolver::ResolveError;

pub const BUS_NAME: &str = "org.revisit.Resolver1";
pub const OBJECT_PATH: &str = "/org/revisit/Resolver1";

const DEFAULT_VISITS_LIMIT: u32 = 50;

/// Visitor as exposed over the bus; reference embeddings are summarised.
#[derive(Debug, Serialize)]
pub struct VisitorSummary {
    pub id: VisitorId,
    pub display_name: String,
    pub visit_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub references: usize,
}

impl From<&VisitorRecord> for VisitorSummary {
    fn from(r: &VisitorRecord) -> Self {
        Self {
            id: r.id,
            display_name: r.display_name.clone(),
            visit_count: r.visit_count,
            first_seen: r.first_seen,
            last_seen: r.last_seen,
            references: r.embeddings.len(),
        }
    }
}

/// D-Bus interface for the Revisit resolver daemon.
///
/// Bus name: org.revisit.Resolver1
/// Object path: /org/revisit/Resolver1
pub struct ResolverService {
    engine: EngineHandle,
    /// Default stats look-back in seconds.
    stats_window_secs: u64,
    threshold: f32,
    embedding_dim: usize,
    policy: String,
}

impl ResolverService {
    pub fn new(
        engine: EngineHandle,
        stats_window_secs: u64,
        threshold: f32,
        embedding_dim: usize,
        policy: String,
    ) -> Self {
        Self {
            engine,
            stats_window_secs,
            threshold,
            embedding_dim,
            policy,
        }
    }
}

#[interface(name = "org.revisit.Resolver1")]
impl ResolverService {
    /// Resolve one observation (JSON) and return its resolution event (JSON).
    async fn resolve(&self, observation: &str) -> zbus::fdo::Result<String> {
        let observation: Observation = serde_json::from_str(observation).map_err(|e| {
            tracing::warn!(error = %e, "unparseable observation dropped");
            zbus::fdo::Error::InvalidArgs(format!("malformed observation: {e}"))
        })?;
        let event = self.engine.resolve(observation).await.map_err(to_fdo)?;
        to_json(&event)
    }

    /// Aggregate stats since `now - window_secs` (0 = configured default).
    async fn stats(&self, window_secs: u64) -> zbus::fdo::Result<String> {
        let secs = if window_secs == 0 { self.stats_window_secs } else { window_secs };
        let window_start = window_start(Utc::now(), secs);
        let stats = self.engine.stats(window_start).await.map_err(to_fdo)?;
        to_json(&stats)
    }

    /// All visitors, ascending id.
    async fn list_visitors(&self) -> zbus::fdo::Result<String> {
        let records = self.engine.list_all().await.map_err(to_fdo)?;
        to_json(&summaries(&records))
    }

    async fn get_visitor(&self, id: u64) -> zbus::fdo::Result<String> {
        let id = VisitorId(id);
        match self.engine.get(id).await.map_err(to_fdo)? {
            Some(record) => to_json(&VisitorSummary::from(&record)),
            None => Err(zbus::fdo::Error::UnknownObject(format!("visitor {id} not found"))),
        }
    }

    /// Visitors by most recent sighting. `from`/`to` accept RFC 3339 or
    /// `YYYY-MM-DD`; empty strings leave the range open.
    async fn list_visits(&self, from: &str, to: &str, limit: u32, offset: u32) -> zbus::fdo::Result<String> {
        let range = parse_range(from, to).map_err(zbus::fdo::Error::InvalidArgs)?;
        let limit = if limit == 0 { DEFAULT_VISITS_LIMIT } else { limit };
        let records = self
            .engine
            .list_visits(range, limit as usize, offset as usize)
            .await
            .map_err(to_fdo)?;
        to_json(&summaries(&records))
    }

    async fn top_visitors(&self, count: u32) -> zbus::fdo::Result<String> {
        let records = self.engine.top_visitors(count as usize).await.map_err(to_fdo)?;
        to_json(&summaries(&records))
    }

    async fn rename_visitor(&self, id: u64, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(id, name, "rename requested");
        let record = self
            .engine
            .rename(VisitorId(id), name.to_string())
            .await
            .map_err(to_fdo)?;
        to_json(&VisitorSummary::from(&record))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let visitors = self.engine.visitor_count().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "visitors": visitors,
            "match_threshold": self.threshold,
            "embedding_dim": self.embedding_dim,
            "reconcile_policy": self.policy,
            "subscribers": self.engine.events().subscriber_count(),
        })
        .to_string())
    }

    /// Emitted once per committed resolution.
    #[zbus(signal)]
    pub async fn visitor_resolved(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;
}

fn summaries(records: &[VisitorRecord]) -> Vec<VisitorSummary> {
    records.iter().map(VisitorSummary::from).collect()
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Resolve(ResolveError::MalformedObservation(msg)) => {
            zbus::fdo::Error::InvalidArgs(msg)
        }
        EngineError::Resolve(ResolveError::NotFound(id))
        | EngineError::Ledger(LedgerError::NotFound(id)) => {
            zbus::fdo::Error::UnknownObject(format!("visitor {id} not found"))
        }
        other => {
            tracing::error!(error = %other, "request failed");
            zbus::fdo::Error::Failed(other.to_string())
        }
    }
}

fn window_start(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    chrono::Duration::try_seconds(secs)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_range(from: &str, to: &str) -> Result<Option<VisitRange>, String> {
    if from.is_empty() && to.is_empty() {
        return Ok(None);
    }
    let from = if from.is_empty() {
        DateTime::<Utc>::MIN_UTC
    } else {
        parse_bound(from, false)?
    };
    let to = if to.is_empty() {
        DateTime::<Utc>::MAX_UTC
    } else {
        parse_bound(to, true)?
    };
    if from > to {
        return Err(format!("range start {from} is after end {to}"));
    }
    Ok(Some(VisitRange { from, to }))
}

/// RFC 3339 timestamp, or a bare date covering that whole UTC day.
fn parse_bound(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("invalid date {raw:?}: {e}"))?;
    let time = if end_of_day {
        NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| format!("invalid time for {raw:?}"))?;
    Ok(date.and_time(time).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_range_open() {
        assert_eq!(parse_range("", "").unwrap(), None);
    }

    #[test]
    fn test_parse_range_dates_cover_whole_days() {
        let range = parse_range("2024-05-01", "2024-05-02").unwrap().unwrap();
        assert_eq!(range.from, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert!(range.to > Utc.with_ymd_and_hms(2024, 5, 2, 23, 59, 59).unwrap());
        assert!(range.to < Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_range_rfc3339_and_half_open() {
        let range = parse_range("2024-05-01T10:00:00+02:00", "").unwrap().unwrap();
        assert_eq!(range.from, Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap());
        assert_eq!(range.to, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_parse_range_rejects_garbage_and_inverted() {
        assert!(parse_range("yesterday", "").is_err());
        assert!(parse_range("2024-05-03", "2024-05-01").is_err());
    }

    #[test]
    fn test_window_start() {
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        assert_eq!(window_start(now, 86_400), Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        assert_eq!(window_start(now, u64::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_summary_hides_embeddings() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let record = VisitorRecord {
            id: VisitorId(2),
            display_name: "Unknown Visitor".into(),
            embeddings: vec![revisit_core::Embedding::new(vec![1.0; 4]); 3],
            visit_count: 2,
            first_seen: t,
            last_seen: t,
        };
        let json = serde_json::to_value(VisitorSummary::from(&record)).unwrap();
        assert_eq!(json["references"], 3);
        assert_eq!(json["id"], 2);
        assert!(json.get("embeddings").is_none());
    }
}
