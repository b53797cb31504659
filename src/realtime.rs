use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::types::{ChatMessage, Session};

#[derive(Default)]
struct HubState {
    clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    agent_owner_by_client: HashMap<usize, String>,
    session_watchers: HashMap<String, HashSet<usize>>,
    watched_session: HashMap<usize, String>,
}

/// WebSocket fan-out: dashboard agents subscribe per owner, widget clients
/// watch a single session. Every published event is a `{ event, data }`
/// envelope.
#[derive(Default)]
pub struct RealtimeHub {
    state: Mutex<HubState>,
    next_client_id: AtomicUsize,
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

impl RealtimeHub {
    pub fn new() -> RealtimeHub {
        RealtimeHub::default()
    }

    pub async fn register_client(&self) -> (usize, mpsc::UnboundedReceiver<String>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let mut state = self.state.lock().await;
        state.clients.insert(client_id, tx);
        (client_id, rx)
    }

    pub async fn unregister_client(&self, client_id: usize) {
        let mut state = self.state.lock().await;
        state.clients.remove(&client_id);
        state.agent_owner_by_client.remove(&client_id);
        if let Some(previous) = state.watched_session.remove(&client_id) {
            if let Some(set) = state.session_watchers.get_mut(&previous) {
                set.remove(&client_id);
            }
        }
        for watchers in state.session_watchers.values_mut() {
            watchers.remove(&client_id);
        }
    }

    pub async fn join_agent(&self, client_id: usize, owner_id: &str) {
        let mut state = self.state.lock().await;
        state
            .agent_owner_by_client
            .insert(client_id, owner_id.to_string());
    }

    pub async fn watch_session(&self, client_id: usize, session_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(previous) = state
            .watched_session
            .insert(client_id, session_id.to_string())
        {
            if let Some(set) = state.session_watchers.get_mut(&previous) {
                set.remove(&client_id);
            }
        }
        state
            .session_watchers
            .entry(session_id.to_string())
            .or_default()
            .insert(client_id);
    }

    pub async fn emit_to_client<T: Serialize>(&self, client_id: usize, event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };
        let tx = {
            let state = self.state.lock().await;
            state.clients.get(&client_id).cloned()
        };
        if let Some(sender) = tx {
            let _ = sender.send(payload);
        }
    }

    async fn emit_to_clients<T: Serialize>(&self, client_ids: &[usize], event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };
        let senders = {
            let state = self.state.lock().await;
            client_ids
                .iter()
                .filter_map(|id| state.clients.get(id).cloned())
                .collect::<Vec<_>>()
        };
        for sender in senders {
            let _ = sender.send(payload.clone());
        }
    }

    async fn recipients_for_session(&self, owner_id: &str, session_id: &str) -> Vec<usize> {
        let state = self.state.lock().await;
        let mut ids = HashSet::new();
        if let Some(watchers) = state.session_watchers.get(session_id) {
            ids.extend(watchers.iter().copied());
        }
        ids.extend(
            state
                .agent_owner_by_client
                .iter()
                .filter(|(_, owner)| owner.as_str() == owner_id)
                .map(|(id, _)| *id),
        );
        ids.into_iter().collect()
    }

    async fn agent_clients_for_owner(&self, owner_id: &str) -> Vec<usize> {
        let state = self.state.lock().await;
        state
            .agent_owner_by_client
            .iter()
            .filter(|(_, owner)| owner.as_str() == owner_id)
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn publish_message(&self, owner_id: &str, message: &ChatMessage) {
        let recipients = self
            .recipients_for_session(owner_id, &message.session_id)
            .await;
        self.emit_to_clients(&recipients, "message:new", message)
            .await;
    }

    pub async fn publish_session_opened(&self, session: &Session) {
        let agents = self.agent_clients_for_owner(&session.owner_id).await;
        self.emit_to_clients(&agents, "session:opened", session)
            .await;
    }

    pub async fn publish_session_closed(&self, session: &Session) {
        let recipients = self
            .recipients_for_session(&session.owner_id, &session.id)
            .await;
        self.emit_to_clients(&recipients, "session:closed", session)
            .await;
    }
}
