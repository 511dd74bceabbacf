//! Generation analytics: session grouping and recomputable summaries.
//!
//! A [`GenerationSession`] groups generations by model and generation type
//! over a time window; [`SessionSummary`] is derived from the raw records
//! and can be recomputed at any time. Nothing here is authoritative state.
//!
//! The tracker is an ingestion endpoint only. Callers (the orchestrator)
//! must never let analytics failures affect generation outcomes; errors
//! from this module are logged and swallowed at the call site.

use crate::adapter::Framework;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Error type for analytics ingestion.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("analytics disabled")]
    Disabled,
    #[error("sink error: {0}")]
    Sink(String),
}

/// One completed generation, as ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub model_id: String,
    pub framework: Option<Framework>,
    /// Execution target label ("onDevice", "cloud", "hybrid").
    pub target: String,
    pub tokens_used: u32,
    pub latency_ms: u64,
    pub cost_saved: f64,
    pub timestamp_ms: u64,
    pub success: bool,
}

/// Generations grouped by model and type over a time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: Uuid,
    pub model_id: String,
    /// Generation type label ("text", "structured", "stream").
    pub session_type: String,
    pub started_at_ms: u64,
    pub records: Vec<GenerationRecord>,
}

/// Derived aggregate over one session. Recomputable from raw records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub generation_count: usize,
    pub success_count: usize,
    pub total_tokens: u64,
    pub avg_latency_ms: u64,
    pub total_cost_saved: f64,
}

impl GenerationSession {
    /// Recompute the summary from raw records.
    pub fn summarize(&self) -> SessionSummary {
        let generation_count = self.records.len();
        let success_count = self.records.iter().filter(|r| r.success).count();
        let total_tokens = self.records.iter().map(|r| r.tokens_used as u64).sum();
        let total_latency: u64 = self.records.iter().map(|r| r.latency_ms).sum();
        let avg_latency_ms = if generation_count == 0 {
            0
        } else {
            total_latency / generation_count as u64
        };
        let total_cost_saved = self.records.iter().map(|r| r.cost_saved).sum();
        SessionSummary {
            generation_count,
            success_count,
            total_tokens,
            avg_latency_ms,
            total_cost_saved,
        }
    }
}

/// External sink for analytics events (platform exporters, dashboards).
pub trait AnalyticsSink: Send + Sync {
    fn on_generation(&self, record: &GenerationRecord) -> Result<(), AnalyticsError>;
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-process analytics tracker.
pub struct AnalyticsTracker {
    enabled: bool,
    sessions: Mutex<HashMap<(String, String), GenerationSession>>,
    sinks: Mutex<Vec<Box<dyn AnalyticsSink>>>,
}

impl AnalyticsTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            sessions: Mutex::new(HashMap::new()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn register_sink(&self, sink: Box<dyn AnalyticsSink>) {
        self.sinks.lock().expect("sink lock poisoned").push(sink);
    }

    /// Ingest a completed generation into its (model, type) session.
    pub fn record_generation(
        &self,
        session_type: &str,
        mut record: GenerationRecord,
    ) -> Result<(), AnalyticsError> {
        if !self.enabled {
            return Err(AnalyticsError::Disabled);
        }
        if record.timestamp_ms == 0 {
            record.timestamp_ms = now_ms();
        }

        {
            let mut sessions = self.sessions.lock().expect("session lock poisoned");
            let key = (record.model_id.clone(), session_type.to_string());
            let session = sessions.entry(key).or_insert_with(|| GenerationSession {
                id: Uuid::new_v4(),
                model_id: record.model_id.clone(),
                session_type: session_type.to_string(),
                started_at_ms: record.timestamp_ms,
                records: Vec::new(),
            });
            session.records.push(record.clone());
        }

        let sinks = self.sinks.lock().expect("sink lock poisoned");
        for sink in sinks.iter() {
            sink.on_generation(&record)?;
        }
        Ok(())
    }

    /// Snapshot of all sessions.
    pub fn sessions(&self) -> Vec<GenerationSession> {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Summaries for every session, recomputed on demand.
    pub fn summaries(&self) -> Vec<(String, String, SessionSummary)> {
        self.sessions()
            .into_iter()
            .map(|s| (s.model_id.clone(), s.session_type.clone(), s.summarize()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(model: &str, tokens: u32, latency: u64) -> GenerationRecord {
        GenerationRecord {
            id: Uuid::new_v4(),
            model_id: model.into(),
            framework: Some(Framework::LlamaCpp),
            target: "onDevice".into(),
            tokens_used: tokens,
            latency_ms: latency,
            cost_saved: 0.01,
            timestamp_ms: 0,
            success: true,
        }
    }

    #[test]
    fn sessions_group_by_model_and_type() {
        let tracker = AnalyticsTracker::new(true);
        tracker.record_generation("text", record("phi-3-mini", 10, 100)).unwrap();
        tracker.record_generation("text", record("phi-3-mini", 20, 200)).unwrap();
        tracker.record_generation("stream", record("phi-3-mini", 5, 50)).unwrap();

        let sessions = tracker.sessions();
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn summary_is_recomputable_and_consistent() {
        let tracker = AnalyticsTracker::new(true);
        tracker.record_generation("text", record("m", 10, 100)).unwrap();
        tracker.record_generation("text", record("m", 30, 300)).unwrap();

        let session = tracker
            .sessions()
            .into_iter()
            .find(|s| s.session_type == "text")
            .unwrap();
        let first = session.summarize();
        let second = session.summarize();
        assert_eq!(first, second);
        assert_eq!(first.generation_count, 2);
        assert_eq!(first.total_tokens, 40);
        assert_eq!(first.avg_latency_ms, 200);
    }

    #[test]
    fn disabled_tracker_rejects_ingestion() {
        let tracker = AnalyticsTracker::new(false);
        let err = tracker
            .record_generation("text", record("m", 1, 1))
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::Disabled));
    }
}
