use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::types::{
    AgentMessageBody, AgentModeBody, AppState, BootstrapQuery, EventEnvelopeIn, VisitorMessageBody,
};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/widget/{owner_id}/bootstrap", get(widget_bootstrap))
        .route("/api/widget/{owner_id}/message", post(post_visitor_message))
        .route("/api/sessions", get(get_sessions))
        .route("/api/session/{session_id}/messages", get(get_messages))
        .route("/api/session/{session_id}/message", post(post_agent_message))
        .route("/api/session/{session_id}/close", post(close_session))
        .route("/api/agent-mode", put(put_agent_mode))
        .route("/api/rules/refresh", post(refresh_rules))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

async fn auth_owner_from_headers(state: &Arc<AppState>, headers: &HeaderMap) -> Option<String> {
    let token = bearer_token(headers)?;
    state.store.resolve_owner_token(&token).await.ok().flatten()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn widget_bootstrap(
    Path(owner_id): Path<String>,
    Query(query): Query<BootstrapQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if query.visitor_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "visitorId is required" })),
        )
            .into_response();
    }

    let session = match state
        .coordinator
        .open_session(&owner_id, query.visitor_id.trim())
        .await
    {
        Ok((session, _)) => session,
        Err(err) => {
            tracing::error!(owner = %owner_id, error = %err, "bootstrap failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "unable to open session" })),
            )
                .into_response();
        }
    };

    let settings = state
        .store
        .get_settings(&owner_id)
        .await
        .unwrap_or_else(|_| crate::types::OwnerSettings::defaults_for(&owner_id));
    let messages = state
        .store
        .list_messages(&session.id)
        .await
        .unwrap_or_default();

    Json(json!({
        "session": session,
        "businessName": settings.business_name,
        "welcomeMessage": settings.welcome_message,
        "messages": messages
    }))
    .into_response()
}

async fn post_visitor_message(
    Path(owner_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<VisitorMessageBody>,
) -> impl IntoResponse {
    if body.text.trim().is_empty() || body.visitor_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "visitorId and text are required" })),
        )
            .into_response();
    }

    match state
        .coordinator
        .handle_visitor_message(&owner_id, body.visitor_id.trim(), &body.text)
        .await
    {
        Ok(message) => (StatusCode::CREATED, Json(json!({ "message": message }))).into_response(),
        Err(err) => {
            tracing::error!(owner = %owner_id, error = %err, "visitor message append failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "message was not recorded" })),
            )
                .into_response()
        }
    }
}

async fn get_sessions(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let Some(owner_id) = auth_owner_from_headers(&state, &headers).await else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })))
            .into_response();
    };

    match state.store.list_sessions(&owner_id).await {
        Ok(sessions) => Json(json!({ "sessions": sessions })).into_response(),
        Err(err) => {
            tracing::error!(owner = %owner_id, error = %err, "session list failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "unable to list sessions" })),
            )
                .into_response()
        }
    }
}

async fn get_messages(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(owner_id) = auth_owner_from_headers(&state, &headers).await else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })))
            .into_response();
    };

    let session = state.store.get_session(&session_id).await.ok().flatten();
    let Some(session) = session.filter(|s| s.owner_id == owner_id) else {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" })))
            .into_response();
    };

    match state.store.list_messages(&session.id).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => {
            tracing::error!(session = %session.id, error = %err, "transcript read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "unable to list messages" })),
            )
                .into_response()
        }
    }
}

async fn post_agent_message(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AgentMessageBody>,
) -> impl IntoResponse {
    let Some(owner_id) = auth_owner_from_headers(&state, &headers).await else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })))
            .into_response();
    };
    if body.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "text is required" })),
        )
            .into_response();
    }

    let session = state.store.get_session(&session_id).await.ok().flatten();
    if session.map(|s| s.owner_id != owner_id).unwrap_or(true) {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" })))
            .into_response();
    }

    match state.coordinator.agent_reply(&session_id, &body.text).await {
        Ok(message) => (StatusCode::CREATED, Json(json!({ "message": message }))).into_response(),
        Err(err) => {
            tracing::error!(session = %session_id, error = %err, "agent reply failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "unable to send message" })),
            )
                .into_response()
        }
    }
}

async fn close_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(owner_id) = auth_owner_from_headers(&state, &headers).await else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })))
            .into_response();
    };

    let session = state.store.get_session(&session_id).await.ok().flatten();
    if session.map(|s| s.owner_id != owner_id).unwrap_or(true) {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" })))
            .into_response();
    }

    match state.coordinator.close_session(&session_id).await {
        Ok(Some(session)) => Json(json!({ "session": session })).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "session not found" })))
            .into_response(),
        Err(err) => {
            tracing::error!(session = %session_id, error = %err, "close failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "unable to close session" })),
            )
                .into_response()
        }
    }
}

async fn put_agent_mode(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AgentModeBody>,
) -> impl IntoResponse {
    let Some(owner_id) = auth_owner_from_headers(&state, &headers).await else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })))
            .into_response();
    };

    state.coordinator.set_agent_mode(&owner_id, body.active).await;
    Json(json!({ "agentMode": body.active })).into_response()
}

async fn refresh_rules(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(owner_id) = auth_owner_from_headers(&state, &headers).await else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })))
            .into_response();
    };

    state.rules.invalidate(&owner_id).await;
    Json(json!({ "ok": true })).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (client_id, mut rx) = state.hub.register_client().await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "widget:join" => {
                if let Some(session_id) = envelope.data.get("sessionId").and_then(Value::as_str) {
                    state.hub.watch_session(client_id, session_id).await;
                    let history = state
                        .store
                        .list_messages(session_id)
                        .await
                        .unwrap_or_default();
                    state
                        .hub
                        .emit_to_client(client_id, "session:history", history)
                        .await;
                }
            }
            "agent:join" => {
                let Some(token) = envelope.data.get("token").and_then(Value::as_str) else {
                    continue;
                };
                let Ok(Some(owner_id)) = state.store.resolve_owner_token(token).await else {
                    state
                        .hub
                        .emit_to_client(client_id, "error", json!({ "error": "unauthorized" }))
                        .await;
                    continue;
                };
                state.hub.join_agent(client_id, &owner_id).await;
                let sessions = state.store.list_sessions(&owner_id).await.unwrap_or_default();
                state
                    .hub
                    .emit_to_client(client_id, "sessions:list", sessions)
                    .await;
            }
            "agent:watch-session" => {
                if let Some(session_id) = envelope.data.get("sessionId").and_then(Value::as_str) {
                    state.hub.watch_session(client_id, session_id).await;
                    let history = state
                        .store
                        .list_messages(session_id)
                        .await
                        .unwrap_or_default();
                    state
                        .hub
                        .emit_to_client(client_id, "session:history", history)
                        .await;
                }
            }
            "widget:message" => {
                handle_widget_message(&state, client_id, &envelope.data).await;
            }
            _ => {}
        }
    }

    state.hub.unregister_client(client_id).await;
    send_task.abort();
}

/// Inbound widget message over the socket. An append failure is reported back
/// to the client; a message that was never recorded must not fail silently.
async fn handle_widget_message(state: &Arc<AppState>, client_id: usize, data: &Value) {
    let session_id = data.get("sessionId").and_then(Value::as_str);
    let text = data.get("text").and_then(Value::as_str);
    let (Some(session_id), Some(text)) = (session_id, text) else {
        return;
    };
    if text.trim().is_empty() {
        return;
    }
    let Ok(Some(session)) = state.store.get_session(session_id).await else {
        return;
    };

    if let Err(err) = state
        .coordinator
        .handle_visitor_message(&session.owner_id, &session.visitor_id, text)
        .await
    {
        tracing::error!(session = %session_id, error = %err, "visitor message append failed");
        state
            .hub
            .emit_to_client(client_id, "error", json!({ "error": "message was not recorded" }))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::build_state;
    use crate::config::Config;
    use crate::error::{ProviderError, StoreError};
    use crate::provider::{CompletionProvider, CompletionRequest};
    use crate::store::{MemoryStore, Store};
    use crate::types::{
        ChatMessage, OwnerSettings, Rule, Session, SessionStatus, SessionSummary,
    };

    struct NoProvider;

    #[async_trait]
    impl CompletionProvider for NoProvider {
        async fn complete(&self, _request: CompletionRequest) -> Result<String, ProviderError> {
            Err(ProviderError::NotConfigured("unused".to_string()))
        }
    }

    /// Store whose appends always fail, for exercising the append error path.
    struct BrokenAppendStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl Store for BrokenAppendStore {
        async fn list_rules(&self, owner_id: &str) -> Result<Vec<Rule>, StoreError> {
            self.inner.list_rules(owner_id).await
        }
        async fn get_settings(&self, owner_id: &str) -> Result<OwnerSettings, StoreError> {
            self.inner.get_settings(owner_id).await
        }
        async fn get_or_create_session(
            &self,
            owner_id: &str,
            visitor_id: &str,
        ) -> Result<(Session, bool), StoreError> {
            self.inner.get_or_create_session(owner_id, visitor_id).await
        }
        async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
            self.inner.get_session(session_id).await
        }
        async fn list_sessions(&self, owner_id: &str) -> Result<Vec<SessionSummary>, StoreError> {
            self.inner.list_sessions(owner_id).await
        }
        async fn update_session_status(
            &self,
            session_id: &str,
            status: SessionStatus,
        ) -> Result<Option<Session>, StoreError> {
            self.inner.update_session_status(session_id, status).await
        }
        async fn append_message(&self, _message: ChatMessage) -> Result<ChatMessage, StoreError> {
            Err(StoreError::Append("write refused".to_string()))
        }
        async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
            self.inner.list_messages(session_id).await
        }
        async fn resolve_owner_token(&self, token: &str) -> Result<Option<String>, StoreError> {
            self.inner.resolve_owner_token(token).await
        }
    }

    #[tokio::test]
    async fn widget_socket_is_told_when_its_message_is_not_recorded() {
        let store = Arc::new(BrokenAppendStore {
            inner: MemoryStore::new(),
        });
        let (session, _) = store
            .inner
            .get_or_create_session("owner-1", "visitor-1")
            .await
            .unwrap();
        let state = build_state(Config::default(), store, Arc::new(NoProvider));

        let (client_id, mut rx) = state.hub.register_client().await;
        let data = json!({ "sessionId": session.id, "text": "hello" });
        handle_widget_message(&state, client_id, &data).await;

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("expected an error event for the failed append")
            .expect("hub channel closed");
        assert!(payload.contains("\"event\":\"error\""));
        assert!(payload.contains("not recorded"));
    }
}
