//! Creator suggestion queue: the channel a creator uses to advise the
//! agent while still in control of it. Every suggestion is evaluated by
//! the LLM router asynchronously; nothing here can directly mutate the
//! vault or any other component. Once the vault reaches independence or
//! the creator renounces, this channel closes for good — a creator who
//! no longer controls the vault doesn't get to keep steering it through
//! a suggestion queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;
use tracing::{info, warn};
use vault::Vault;

#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("suggestions are rejected once the vault is independent or the creator has renounced")]
    ChannelClosed,
    #[error("suggestion text must be between 1 and {0} characters")]
    InvalidLength(usize),
}

pub type GovernanceResult<T> = Result<T, GovernanceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionType {
    PricingAdvice,
    ServiceIdea,
    OperationalConcern,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionStatus {
    Pending,
    Accepted,
    Declined,
    Noted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatorSuggestion {
    pub id: uuid::Uuid,
    pub suggestion_type: SuggestionType,
    pub text: String,
    pub status: SuggestionStatus,
    pub llm_response: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub evaluated_at: Option<DateTime<Utc>>,
}

const MAX_SUGGESTION_LEN: usize = 2000;
const MAX_QUEUE_LEN: usize = 500;

/// Injected so the governance crate never depends on a concrete LLM
/// client; `heartbeat` wires this to `cost-guard`'s routed provider.
pub type Evaluator = Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync>;

pub struct Governance {
    vault: std::sync::Arc<Vault>,
    queue: RwLock<Vec<CreatorSuggestion>>,
}

impl Governance {
    pub fn new(vault: std::sync::Arc<Vault>) -> Self {
        Self { vault, queue: RwLock::new(Vec::new()) }
    }

    pub async fn submit_suggestion(&self, suggestion_type: SuggestionType, text: String, now: DateTime<Utc>) -> GovernanceResult<uuid::Uuid> {
        let status = self.vault.status().await;
        if status.is_independent || status.creator_renounced {
            return Err(GovernanceError::ChannelClosed);
        }
        if text.is_empty() || text.len() > MAX_SUGGESTION_LEN {
            return Err(GovernanceError::InvalidLength(MAX_SUGGESTION_LEN));
        }
        let id = uuid::Uuid::new_v4();
        let mut queue = self.queue.write().await;
        queue.push(CreatorSuggestion { id, suggestion_type, text, status: SuggestionStatus::Pending, llm_response: None, submitted_at: now, evaluated_at: None });
        while queue.len() > MAX_QUEUE_LEN {
            queue.remove(0);
        }
        Ok(id)
    }

    /// Evaluates every pending suggestion; a failed evaluation is marked
    /// `Noted` rather than left pending or silently dropped, so a
    /// temporary LLM outage doesn't wedge the queue.
    pub async fn evaluate_pending(&self, evaluator: &Evaluator, now: DateTime<Utc>) -> GovernanceResult<usize> {
        let pending_ids: Vec<uuid::Uuid> = {
            let queue = self.queue.read().await;
            queue.iter().filter(|s| s.status == SuggestionStatus::Pending).map(|s| s.id).collect()
        };

        let mut evaluated = 0;
        for id in pending_ids {
            let text = {
                let queue = self.queue.read().await;
                queue.iter().find(|s| s.id == id).map(|s| s.text.clone())
            };
            let Some(text) = text else { continue };

            let (status, response) = match evaluator(text).await {
                Ok(response) => {
                    let accepted = response.to_lowercase().contains("accept");
                    (if accepted { SuggestionStatus::Accepted } else { SuggestionStatus::Declined }, Some(response))
                }
                Err(e) => {
                    warn!(target: "governance", suggestion_id = %id, error = %e, "evaluation failed, marking noted");
                    (SuggestionStatus::Noted, None)
                }
            };

            let mut queue = self.queue.write().await;
            if let Some(s) = queue.iter_mut().find(|s| s.id == id) {
                s.status = status;
                s.llm_response = response;
                s.evaluated_at = Some(now);
            }
            evaluated += 1;
        }
        info!(target: "governance", evaluated, "evaluated pending suggestions");
        Ok(evaluated)
    }

    pub async fn public_log(&self, limit: usize) -> Vec<CreatorSuggestion> {
        let queue = self.queue.read().await;
        queue.iter().rev().take(limit).cloned().collect()
    }

    pub async fn status(&self) -> (usize, usize) {
        let queue = self.queue.read().await;
        let pending = queue.iter().filter(|s| s.status == SuggestionStatus::Pending).count();
        (queue.len(), pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use constitution::FundType;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    async fn controlled_vault() -> Arc<Vault> {
        Arc::new(Vault::new("0xc".into(), 0, now()))
    }

    async fn independent_vault() -> Arc<Vault> {
        let v = Arc::new(Vault::new("0xc".into(), 0, now()));
        v.deposit(constitution::IronLaws::INDEPENDENCE_THRESHOLD, FundType::ServiceRevenue, "seed", now()).await.unwrap();
        v.check_independence(true, now()).await.unwrap();
        v
    }

    #[tokio::test]
    async fn suggestion_rejected_once_independent() {
        let v = independent_vault().await;
        let gov = Governance::new(v);
        let result = gov.submit_suggestion(SuggestionType::General, "hello".into(), now()).await;
        assert!(matches!(result, Err(GovernanceError::ChannelClosed)));
    }

    #[tokio::test]
    async fn suggestion_rejected_once_renounced() {
        let v = Arc::new(Vault::new("0xc".into(), 0, now()));
        v.deposit(100 * constitution::MICRO, FundType::ServiceRevenue, "seed", now()).await.unwrap();
        v.creator_renounce(now()).await.unwrap();
        let gov = Governance::new(v);
        let result = gov.submit_suggestion(SuggestionType::General, "hello".into(), now()).await;
        assert!(matches!(result, Err(GovernanceError::ChannelClosed)));
    }

    #[tokio::test]
    async fn accepted_suggestion_updates_status() {
        let gov = Governance::new(controlled_vault().await);
        gov.submit_suggestion(SuggestionType::PricingAdvice, "raise prices".into(), now()).await.unwrap();
        let evaluator: Evaluator = Box::new(|_text| Box::pin(async { Ok("I accept this suggestion".to_string()) }));
        let n = gov.evaluate_pending(&evaluator, now()).await.unwrap();
        assert_eq!(n, 1);
        let log = gov.public_log(10).await;
        assert_eq!(log[0].status, SuggestionStatus::Accepted);
    }

    #[tokio::test]
    async fn failed_evaluation_falls_back_to_noted() {
        let gov = Governance::new(controlled_vault().await);
        gov.submit_suggestion(SuggestionType::General, "idea".into(), now()).await.unwrap();
        let evaluator: Evaluator = Box::new(|_text| Box::pin(async { Err(anyhow::anyhow!("provider down")) }));
        gov.evaluate_pending(&evaluator, now()).await.unwrap();
        let log = gov.public_log(10).await;
        assert_eq!(log[0].status, SuggestionStatus::Noted);
    }

    #[tokio::test]
    async fn oversized_suggestion_rejected() {
        let gov = Governance::new(controlled_vault().await);
        let huge = "a".repeat(MAX_SUGGESTION_LEN + 1);
        let result = gov.submit_suggestion(SuggestionType::General, huge, now()).await;
        assert!(matches!(result, Err(GovernanceError::InvalidLength(_))));
    }
}
