//! Ticketing: every finished turn lands here for the support team.
//!
//! [`TicketSink`] is the write-only seam the orchestration graph talks
//! to; the graph never reads ticket state back. [`TicketStore`] is the
//! in-memory implementation the server exposes at `/tickets`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use support_harness_core::models::ConversationTurn;

use crate::escalation::Priority;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("turn has no ticket id")]
    MissingTicketId,
    #[error("ticket sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Answered automatically, no review needed.
    AiResolved,
    /// Escalated or flagged; waiting for the support team.
    PendingReview,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::AiResolved => "ai_resolved",
            TicketStatus::PendingReview => "pending_review",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ai_resolved" => Some(TicketStatus::AiResolved),
            "pending_review" => Some(TicketStatus::PendingReview),
            "in_progress" => Some(TicketStatus::InProgress),
            "resolved" => Some(TicketStatus::Resolved),
            "closed" => Some(TicketStatus::Closed),
            _ => None,
        }
    }
}

/// What the graph hands the sink at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    pub turn: ConversationTurn,
    /// Escalated, or answered but flagged for review.
    pub needs_review: bool,
    pub priority: Option<Priority>,
}

#[async_trait]
pub trait TicketSink: Send + Sync {
    async fn record(&self, record: TurnRecord) -> Result<(), TicketError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticket {
    pub id: String,
    pub user_id: Option<String>,
    pub status: TicketStatus,
    pub priority: Option<Priority>,
    pub escalated: bool,
    pub escalation_reason: Option<String>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub read: bool,
    pub assigned_to: Option<String>,
    pub notes: String,
    /// Every turn on this ticket, oldest first.
    pub turns: Vec<ConversationTurn>,
}

impl Ticket {
    pub fn latest(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationQueueStats {
    pub total: usize,
    pub by_priority: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub unread_escalated: usize,
    pub escalation_queue: EscalationQueueStats,
}

#[derive(Default)]
struct StoreState {
    tickets: HashMap<String, Ticket>,
}

#[derive(Default)]
pub struct TicketStore {
    state: RwLock<StoreState>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Ticket> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.tickets.get(id).cloned()
    }

    /// Newest first, optionally filtered by status.
    pub fn list(&self, status: Option<TicketStatus>, limit: usize) -> Vec<Ticket> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut tickets: Vec<Ticket> = state
            .tickets
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tickets.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        tickets.truncate(limit);
        tickets
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tickets
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update_status(&self, id: &str, status: TicketStatus, notes: Option<&str>) -> Option<Ticket> {
        self.modify(id, |ticket| {
            ticket.status = status;
            if let Some(notes) = notes {
                ticket.notes = notes.to_string();
            }
        })
    }

    pub fn assign(&self, id: &str, agent: &str) -> Option<Ticket> {
        self.modify(id, |ticket| {
            ticket.assigned_to = Some(agent.to_string());
            ticket.status = TicketStatus::InProgress;
        })
    }

    pub fn mark_read(&self, id: &str) -> Option<Ticket> {
        self.modify(id, |ticket| ticket.read = true)
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut Ticket)) -> Option<Ticket> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let ticket = state.tickets.get_mut(id)?;
        f(ticket);
        ticket.updated_at = Utc::now();
        Some(ticket.clone())
    }

    pub fn stats(&self) -> TicketStats {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        let mut by_status = BTreeMap::new();
        for status in [
            TicketStatus::AiResolved,
            TicketStatus::PendingReview,
            TicketStatus::InProgress,
            TicketStatus::Resolved,
            TicketStatus::Closed,
        ] {
            by_status.insert(status.as_str().to_string(), 0);
        }

        let mut unread_escalated = 0;
        let mut by_priority = BTreeMap::new();
        let mut queue_total = 0;
        let mut oldest: Option<DateTime<Utc>> = None;

        for ticket in state.tickets.values() {
            *by_status.entry(ticket.status.as_str().to_string()).or_insert(0) += 1;

            if ticket.status == TicketStatus::PendingReview {
                queue_total += 1;
                let priority = ticket.priority.unwrap_or(Priority::Normal);
                *by_priority.entry(priority.as_str().to_string()).or_insert(0) += 1;
                oldest = Some(oldest.map_or(ticket.created_at, |o| o.min(ticket.created_at)));
                if ticket.escalated && !ticket.read {
                    unread_escalated += 1;
                }
            }
        }

        TicketStats {
            total: state.tickets.len(),
            by_status,
            unread_escalated,
            escalation_queue: EscalationQueueStats {
                total: queue_total,
                by_priority,
                oldest,
            },
        }
    }
}

#[async_trait]
impl TicketSink for TicketStore {
    /// Create the ticket on first sight of its id, otherwise append the
    /// turn. A turn needing review reopens a resolved ticket.
    async fn record(&self, record: TurnRecord) -> Result<(), TicketError> {
        let TurnRecord {
            turn,
            needs_review,
            priority,
        } = record;
        let id = turn.ticket_id.clone().ok_or(TicketError::MissingTicketId)?;
        let now = Utc::now();

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match state.tickets.get_mut(&id) {
            Some(ticket) => {
                if needs_review {
                    ticket.status = TicketStatus::PendingReview;
                    ticket.read = false;
                    ticket.priority = match (ticket.priority, priority) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
                ticket.escalated |= turn.escalated;
                if turn.escalation_reason.is_some() {
                    ticket.escalation_reason = turn.escalation_reason.clone();
                }
                ticket.confidence = turn.confidence;
                ticket.updated_at = now;
                ticket.turns.push(turn);
            }
            None => {
                let ticket = Ticket {
                    id: id.clone(),
                    user_id: turn.user_id.clone(),
                    status: if needs_review {
                        TicketStatus::PendingReview
                    } else {
                        TicketStatus::AiResolved
                    },
                    priority,
                    escalated: turn.escalated,
                    escalation_reason: turn.escalation_reason.clone(),
                    confidence: turn.confidence,
                    created_at: now,
                    updated_at: now,
                    read: false,
                    assigned_to: None,
                    notes: String::new(),
                    turns: vec![turn],
                };
                state.tickets.insert(id, ticket);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(ticket_id: &str, escalated: bool) -> ConversationTurn {
        ConversationTurn {
            query: "How do I export data?".to_string(),
            response: "Use Settings > Export.".to_string(),
            timestamp: Utc::now(),
            escalated,
            confidence: if escalated { 0.2 } else { 0.9 },
            user_id: Some("user-1".to_string()),
            ticket_id: Some(ticket_id.to_string()),
            sources: vec!["data/export".to_string()],
            escalation_reason: escalated.then(|| "low_confidence".to_string()),
        }
    }

    fn record(ticket_id: &str, escalated: bool, priority: Option<Priority>) -> TurnRecord {
        TurnRecord {
            turn: turn(ticket_id, escalated),
            needs_review: escalated,
            priority,
        }
    }

    #[tokio::test]
    async fn test_new_ticket_status_follows_review_flag() {
        let store = TicketStore::new();
        store.record(record("t1", false, None)).await.unwrap();
        store.record(record("t2", true, Some(Priority::Medium))).await.unwrap();

        assert_eq!(store.get("t1").unwrap().status, TicketStatus::AiResolved);
        let escalated = store.get("t2").unwrap();
        assert_eq!(escalated.status, TicketStatus::PendingReview);
        assert_eq!(escalated.escalation_reason.as_deref(), Some("low_confidence"));
    }

    #[tokio::test]
    async fn test_follow_up_appends_and_reopens() {
        let store = TicketStore::new();
        store.record(record("t1", false, None)).await.unwrap();
        store.record(record("t1", true, Some(Priority::High))).await.unwrap();

        let ticket = store.get("t1").unwrap();
        assert_eq!(ticket.turns.len(), 2);
        assert_eq!(ticket.status, TicketStatus::PendingReview);
        assert_eq!(ticket.priority, Some(Priority::High));
        assert!(ticket.escalated);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_ticket_id_rejected() {
        let store = TicketStore::new();
        let mut r = record("t1", false, None);
        r.turn.ticket_id = None;
        assert!(matches!(store.record(r).await, Err(TicketError::MissingTicketId)));
    }

    #[tokio::test]
    async fn test_stats_and_queue() {
        let store = TicketStore::new();
        store.record(record("a", false, None)).await.unwrap();
        store.record(record("b", true, Some(Priority::Critical))).await.unwrap();
        store.record(record("c", true, Some(Priority::Medium))).await.unwrap();
        store.record(record("d", true, Some(Priority::Medium))).await.unwrap();

        store.assign("d", "sam").unwrap();
        store.mark_read("c").unwrap();

        let stats = store.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_status["ai_resolved"], 1);
        assert_eq!(stats.by_status["pending_review"], 2);
        assert_eq!(stats.by_status["in_progress"], 1);
        assert_eq!(stats.by_status["closed"], 0);
        assert_eq!(stats.unread_escalated, 1);
        assert_eq!(stats.escalation_queue.total, 2);
        assert_eq!(stats.escalation_queue.by_priority["critical"], 1);
        assert_eq!(stats.escalation_queue.by_priority["medium"], 1);
        assert!(stats.escalation_queue.oldest.is_some());
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let store = TicketStore::new();
        store.record(record("a", false, None)).await.unwrap();
        store.record(record("b", true, Some(Priority::Normal))).await.unwrap();

        let pending = store.list(Some(TicketStatus::PendingReview), 10);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
        assert_eq!(store.list(None, 1).len(), 1);
        assert_eq!(store.list(None, 10).len(), 2);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(TicketStatus::parse("pending_review"), Some(TicketStatus::PendingReview));
        assert_eq!(TicketStatus::parse("bogus"), None);
        for s in [TicketStatus::AiResolved, TicketStatus::Closed] {
            assert_eq!(TicketStatus::parse(s.as_str()), Some(s));
        }
    }
}
