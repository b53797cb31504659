use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::error::StoreError;
use crate::escalation;
use crate::provider::CompletionProvider;
use crate::realtime::RealtimeHub;
use crate::rules::RuleCache;
use crate::store::Store;
use crate::types::{ChatMessage, SenderType, Session, SessionStatus};

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Per-session append bookkeeping. `next_seq` is the monotonic insertion
/// sequence; `last_agent_seq` lets the escalation controller detect a human
/// reply that landed while its own reply was being computed.
struct SessionOrdering {
    next_seq: i64,
    last_agent_seq: i64,
}

pub struct VisitorTurn {
    pub session: Session,
    pub text: String,
    pub reply: oneshot::Sender<Result<ChatMessage, StoreError>>,
}

/// Owns session lifecycle and the transcript append path. All work for one
/// session flows through a per-session lane (an mpsc queue drained by one
/// task), so appends land in inbound order even when the AI provider is slow;
/// independent sessions run concurrently.
pub struct SessionCoordinator {
    pub store: Arc<dyn Store>,
    pub hub: Arc<RealtimeHub>,
    pub rules: Arc<RuleCache>,
    pub provider: Arc<dyn CompletionProvider>,
    pub config: Config,
    agent_mode: Mutex<HashMap<String, bool>>,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<VisitorTurn>>>,
    orderings: Mutex<HashMap<String, Arc<Mutex<SessionOrdering>>>>,
}

impl SessionCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<RealtimeHub>,
        rules: Arc<RuleCache>,
        provider: Arc<dyn CompletionProvider>,
        config: Config,
    ) -> SessionCoordinator {
        SessionCoordinator {
            store,
            hub,
            rules,
            provider,
            config,
            agent_mode: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            orderings: Mutex::new(HashMap::new()),
        }
    }

    pub async fn agent_mode_active(&self, owner_id: &str) -> bool {
        let modes = self.agent_mode.lock().await;
        modes.get(owner_id).copied().unwrap_or(false)
    }

    pub async fn set_agent_mode(&self, owner_id: &str, active: bool) {
        let mut modes = self.agent_mode.lock().await;
        modes.insert(owner_id.to_string(), active);
    }

    /// Map (owner, visitor) to the live session, creating one on first
    /// contact. Publishes `session:opened` for new sessions.
    pub async fn open_session(
        &self,
        owner_id: &str,
        visitor_id: &str,
    ) -> Result<(Session, bool), StoreError> {
        let (session, created) = self
            .store
            .get_or_create_session(owner_id, visitor_id)
            .await?;
        if created {
            self.hub.publish_session_opened(&session).await;
        }
        Ok((session, created))
    }

    pub async fn close_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let closed = self
            .store
            .update_session_status(session_id, SessionStatus::Closed)
            .await?;
        if let Some(session) = &closed {
            self.hub.publish_session_closed(session).await;
            self.release_session(session_id).await;
        }
        Ok(closed)
    }

    /// Drop the session's lane and ordering bookkeeping. Dropping the lane
    /// sender lets the worker drain its queue and exit; a later message for
    /// the same visitor runs in a fresh session with fresh state.
    pub(crate) async fn release_session(&self, session_id: &str) {
        self.lanes.lock().await.remove(session_id);
        self.orderings.lock().await.remove(session_id);
    }

    async fn ordering_for(&self, session_id: &str) -> Arc<Mutex<SessionOrdering>> {
        let mut orderings = self.orderings.lock().await;
        if let Some(existing) = orderings.get(session_id) {
            return existing.clone();
        }
        let ordering = Arc::new(Mutex::new(SessionOrdering {
            next_seq: 0,
            last_agent_seq: 0,
        }));
        orderings.insert(session_id.to_string(), ordering.clone());
        ordering
    }

    /// The single transcript synchronization point: assigns the per-session
    /// sequence, persists, then publishes. Nothing is ever reordered or
    /// retracted after this returns.
    pub async fn append(
        &self,
        session: &Session,
        sender: SenderType,
        text: &str,
        widget: Option<serde_json::Value>,
    ) -> Result<ChatMessage, StoreError> {
        let ordering = self.ordering_for(&session.id).await;
        let mut ordering = ordering.lock().await;
        self.recover_counters(&session.id, &mut ordering).await?;
        self.append_locked(&mut ordering, session, sender, text, widget)
            .await
    }

    /// Automated-reply append. The human-beat-us comparison and the append
    /// share the per-session lock, so an agent reply cannot slip in between
    /// the check and the write. Returns None when the reply is discarded.
    pub async fn append_bot_unless_agent_replied(
        &self,
        session: &Session,
        visitor_seq: i64,
        text: &str,
        widget: Option<serde_json::Value>,
    ) -> Result<Option<ChatMessage>, StoreError> {
        let ordering = self.ordering_for(&session.id).await;
        let mut ordering = ordering.lock().await;
        self.recover_counters(&session.id, &mut ordering).await?;
        if ordering.last_agent_seq > visitor_seq {
            return Ok(None);
        }
        let stored = self
            .append_locked(&mut ordering, session, SenderType::Bot, text, widget)
            .await?;
        Ok(Some(stored))
    }

    async fn recover_counters(
        &self,
        session_id: &str,
        ordering: &mut SessionOrdering,
    ) -> Result<(), StoreError> {
        if ordering.next_seq != 0 {
            return Ok(());
        }
        // First touch since startup: recover the counters from the store.
        let existing = self.store.list_messages(session_id).await?;
        ordering.next_seq = existing.iter().map(|m| m.seq).max().unwrap_or(0) + 1;
        ordering.last_agent_seq = existing
            .iter()
            .filter(|m| m.sender == SenderType::Agent)
            .map(|m| m.seq)
            .max()
            .unwrap_or(0);
        Ok(())
    }

    async fn append_locked(
        &self,
        ordering: &mut SessionOrdering,
        session: &Session,
        sender: SenderType,
        text: &str,
        widget: Option<serde_json::Value>,
    ) -> Result<ChatMessage, StoreError> {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            seq: ordering.next_seq,
            sender,
            text: text.trim().to_string(),
            widget,
            created_at: now_iso(),
        };
        let stored = self.store.append_message(message).await?;
        ordering.next_seq += 1;
        if sender == SenderType::Agent {
            ordering.last_agent_seq = stored.seq;
        }
        self.hub.publish_message(&session.owner_id, &stored).await;
        Ok(stored)
    }

    /// Human agent reply; bypasses the visitor lane, appends immediately.
    pub async fn agent_reply(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<ChatMessage, StoreError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        if session.status == SessionStatus::Closed {
            return Err(StoreError::SessionClosed(session_id.to_string()));
        }
        self.append(&session, SenderType::Agent, text, None).await
    }

    /// Top-level inbound entry point. Appends the visitor message and queues
    /// the escalation turn on the session's lane; the returned result tells
    /// the caller whether the message was durably recorded.
    pub async fn handle_visitor_message(
        self: &Arc<Self>,
        owner_id: &str,
        visitor_id: &str,
        text: &str,
    ) -> Result<ChatMessage, StoreError> {
        let (session, _) = self.open_session(owner_id, visitor_id).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let turn = VisitorTurn {
            session,
            text: text.to_string(),
            reply: reply_tx,
        };
        self.enqueue_turn(turn).await;
        reply_rx
            .await
            .unwrap_or_else(|_| Err(StoreError::Append("session lane dropped".to_string())))
    }

    async fn enqueue_turn(self: &Arc<Self>, turn: VisitorTurn) {
        let session_id = turn.session.id.clone();
        let mut lanes = self.lanes.lock().await;
        let sender = lanes.entry(session_id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel::<VisitorTurn>();
            let coordinator = self.clone();
            tokio::spawn(async move {
                run_session_lane(coordinator, rx).await;
            });
            tx
        });
        if sender.send(turn).is_err() {
            // Worker ended (should not happen while the sender is held);
            // rebuild the lane on the next message.
            lanes.remove(&session_id);
        }
    }
}

/// Drains one session's inbound turns strictly in arrival order:
/// append visitor message, then escalate, then append the automated reply.
async fn run_session_lane(
    coordinator: Arc<SessionCoordinator>,
    mut rx: mpsc::UnboundedReceiver<VisitorTurn>,
) {
    while let Some(turn) = rx.recv().await {
        let visitor_message = coordinator
            .append(&turn.session, SenderType::Visitor, &turn.text, None)
            .await;

        match visitor_message {
            Ok(message) => {
                let visitor_seq = message.seq;
                let _ = turn.reply.send(Ok(message));
                if let Err(err) = escalation::respond_to_visitor_turn(
                    &coordinator,
                    &turn.session,
                    visitor_seq,
                    &turn.text,
                )
                .await
                {
                    tracing::error!(
                        session = %turn.session.id,
                        error = %err,
                        "escalation failed to append automated reply"
                    );
                }
            }
            Err(err) => {
                // A lost visitor append is a hard failure for the caller; no
                // automated turn runs for a message that was never recorded.
                let _ = turn.reply.send(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::error::ProviderError;
    use crate::provider::{CompletionProvider, CompletionRequest};
    use crate::store::MemoryStore;

    struct NoProvider;

    #[async_trait]
    impl CompletionProvider for NoProvider {
        async fn complete(&self, _request: CompletionRequest) -> Result<String, ProviderError> {
            Err(ProviderError::NotConfigured("unused".to_string()))
        }
    }

    fn coordinator() -> Arc<SessionCoordinator> {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(RealtimeHub::new());
        let rules = Arc::new(RuleCache::new(store.clone(), Duration::from_secs(60)));
        Arc::new(SessionCoordinator::new(
            store,
            hub,
            rules,
            Arc::new(NoProvider),
            Config::default(),
        ))
    }

    #[tokio::test]
    async fn close_session_releases_lane_and_ordering_state() {
        let co = coordinator();
        // Agent mode keeps the lane from producing an automated reply, so no
        // turn is in flight when the session closes.
        co.set_agent_mode("owner-1", true).await;
        let visitor = co
            .handle_visitor_message("owner-1", "visitor-1", "hello")
            .await
            .unwrap();
        assert_eq!(co.lanes.lock().await.len(), 1);
        assert_eq!(co.orderings.lock().await.len(), 1);

        co.close_session(&visitor.session_id).await.unwrap();
        assert!(co.lanes.lock().await.is_empty());
        assert!(co.orderings.lock().await.is_empty());
    }

    #[tokio::test]
    async fn automated_append_aborts_when_agent_reply_landed_first() {
        let co = coordinator();
        co.set_agent_mode("owner-1", true).await;
        let visitor = co
            .handle_visitor_message("owner-1", "visitor-1", "hello")
            .await
            .unwrap();
        let session = co
            .store
            .get_session(&visitor.session_id)
            .await
            .unwrap()
            .unwrap();

        co.agent_reply(&session.id, "taking this one").await.unwrap();
        let appended = co
            .append_bot_unless_agent_replied(&session, visitor.seq, "late automated reply", None)
            .await
            .unwrap();
        assert!(appended.is_none());

        let messages = co.store.list_messages(&session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].sender, SenderType::Agent);
    }

    #[tokio::test]
    async fn automated_append_proceeds_without_agent_reply() {
        let co = coordinator();
        co.set_agent_mode("owner-1", true).await;
        let visitor = co
            .handle_visitor_message("owner-1", "visitor-1", "hello")
            .await
            .unwrap();
        let session = co
            .store
            .get_session(&visitor.session_id)
            .await
            .unwrap()
            .unwrap();

        let appended = co
            .append_bot_unless_agent_replied(&session, visitor.seq, "automated reply", None)
            .await
            .unwrap()
            .expect("no agent reply, append should proceed");
        assert_eq!(appended.sender, SenderType::Bot);
        assert_eq!(appended.seq, visitor.seq + 1);
    }
}
