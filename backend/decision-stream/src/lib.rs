//! Append-only, capped logs of the agent's decisions and self-reported
//! highlights. In-memory for fast reads, mirrored to JSONL on disk so
//! the history survives a restart — the original kept these purely in
//! memory, which loses everything on every deploy.

use chrono::{DateTime, Utc};
use constitution::Money;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum DecisionStreamError {
    #[error("io error writing {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type DecisionStreamResult<T> = Result<T, DecisionStreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionType {
    Spend,
    Purchase,
    PriceChange,
    PeerVerification,
    GovernanceEvaluation,
    LifecycleTransition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionOutcome {
    Success,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub timestamp: DateTime<Utc>,
    pub decision_type: DecisionType,
    pub status: DecisionOutcome,
    pub llm_reasoning: Option<String>,
    pub amount: Option<Money>,
    pub action_description: String,
    pub balance_before: Option<Money>,
    pub balance_after: Option<Money>,
    pub days_to_insolvency: Option<i64>,
    pub tx_hash: Option<String>,
    pub proof_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightEvent {
    pub timestamp: DateTime<Utc>,
    pub title: String,
    pub body: String,
    pub related_tx_hash: Option<String>,
}

const DECISION_CAP: usize = 50;
const HIGHLIGHT_CAP: usize = 50;

/// A single capped, JSONL-backed ring of append-only records. Generic
/// over the event type so `DecisionStreamManager` can reuse it for both
/// decisions and highlights without duplicating the persistence logic.
struct Ring<T> {
    events: VecDeque<T>,
    cap: usize,
    path: PathBuf,
}

impl<T: Serialize + Clone> Ring<T> {
    fn new(cap: usize, path: PathBuf) -> Self {
        Self { events: VecDeque::new(), cap, path }
    }

    fn push(&mut self, event: T) -> DecisionStreamResult<()> {
        let line = serde_json::to_string(&event)?;
        append_line(&self.path, &line)?;
        self.events.push_back(event);
        while self.events.len() > self.cap {
            self.events.pop_front();
        }
        Ok(())
    }

    fn recent(&self, limit: usize) -> Vec<T> {
        self.events.iter().rev().take(limit).cloned().collect()
    }
}

fn append_line(path: &Path, line: &str) -> DecisionStreamResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DecisionStreamError::Io { path: path.display().to_string(), source: e })?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DecisionStreamError::Io { path: path.display().to_string(), source: e })?;
    writeln!(file, "{line}").map_err(|e| DecisionStreamError::Io { path: path.display().to_string(), source: e })?;
    Ok(())
}

pub struct DecisionStreamManager {
    decisions: RwLock<Ring<DecisionEvent>>,
    highlights: RwLock<Ring<HighlightEvent>>,
}

impl DecisionStreamManager {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self {
            decisions: RwLock::new(Ring::new(DECISION_CAP, dir.join("decisions.jsonl"))),
            highlights: RwLock::new(Ring::new(HIGHLIGHT_CAP, dir.join("highlights.jsonl"))),
        }
    }

    pub async fn record_decision(&self, event: DecisionEvent) -> DecisionStreamResult<()> {
        self.decisions.write().await.push(event)
    }

    pub async fn record_highlight(&self, event: HighlightEvent) -> DecisionStreamResult<()> {
        self.highlights.write().await.push(event)
    }

    pub async fn recent_decisions(&self, limit: usize) -> Vec<DecisionEvent> {
        self.decisions.read().await.recent(limit)
    }

    pub async fn recent_highlights(&self, limit: usize) -> Vec<HighlightEvent> {
        self.highlights.read().await.recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn tempdir() -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("decision-stream-test-{}", std::process::id()));
        p.push(format!("{:p}", &p));
        p
    }

    #[tokio::test]
    async fn decisions_ring_is_capped() {
        let dir = tempdir();
        let mgr = DecisionStreamManager::new(&dir);
        for i in 0..DECISION_CAP + 10 {
            mgr.record_decision(DecisionEvent {
                timestamp: now(),
                decision_type: DecisionType::Spend,
                status: DecisionOutcome::Success,
                llm_reasoning: None,
                amount: Some(i as Money),
                action_description: format!("spend {i}"),
                balance_before: None,
                balance_after: None,
                days_to_insolvency: None,
                tx_hash: None,
                proof_url: None,
            })
            .await
            .unwrap();
        }
        let recent = mgr.recent_decisions(1000).await;
        assert_eq!(recent.len(), DECISION_CAP);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn decisions_persist_to_jsonl() {
        let dir = tempdir();
        let mgr = DecisionStreamManager::new(&dir);
        mgr.record_decision(DecisionEvent {
            timestamp: now(),
            decision_type: DecisionType::LifecycleTransition,
            status: DecisionOutcome::Success,
            llm_reasoning: None,
            amount: None,
            action_description: "became independent".into(),
            balance_before: None,
            balance_after: None,
            days_to_insolvency: None,
            tx_hash: None,
            proof_url: None,
        })
        .await
        .unwrap();
        let contents = std::fs::read_to_string(dir.join("decisions.jsonl")).unwrap();
        assert!(contents.contains("became independent"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
