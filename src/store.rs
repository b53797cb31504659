use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    ChatMessage, MatchingType, OwnerSettings, ResponseKind, Rule, SenderType, Session,
    SessionStatus, SessionSummary,
};

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Narrow persistence contract. The engine never issues ad hoc queries
/// outside of this trait, so any backing store can be swapped in.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_rules(&self, owner_id: &str) -> Result<Vec<Rule>, StoreError>;
    async fn get_settings(&self, owner_id: &str) -> Result<OwnerSettings, StoreError>;
    async fn get_or_create_session(
        &self,
        owner_id: &str,
        visitor_id: &str,
    ) -> Result<(Session, bool), StoreError>;
    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;
    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<SessionSummary>, StoreError>;
    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<Option<Session>, StoreError>;
    async fn append_message(&self, message: ChatMessage) -> Result<ChatMessage, StoreError>;
    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError>;
    async fn resolve_owner_token(&self, token: &str) -> Result<Option<String>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<PgStore, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|err| StoreError::Query(format!("connect failed: {err}")))?;
        sqlx::migrate!()
            .run(&pool)
            .await
            .map_err(|err| StoreError::Query(format!("migration failed: {err}")))?;
        Ok(PgStore { pool })
    }

    pub fn new(pool: PgPool) -> PgStore {
        PgStore { pool }
    }
}

fn parse_keywords(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

fn parse_matching_type(raw: &str) -> MatchingType {
    match raw {
        "fuzzy_match" => MatchingType::FuzzyMatch,
        "regex" => MatchingType::Regex,
        "synonym_match" => MatchingType::SynonymMatch,
        _ => MatchingType::WordMatch,
    }
}

fn parse_session_row(row: &PgRow) -> Session {
    Session {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        visitor_id: row.get("visitor_id"),
        status: SessionStatus::parse(&row.get::<String, _>("status"))
            .unwrap_or(SessionStatus::Active),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_message_row(row: &PgRow) -> ChatMessage {
    let widget_raw: String = row.get::<Option<String>, _>("widget").unwrap_or_default();
    ChatMessage {
        id: row.get("id"),
        session_id: row.get("session_id"),
        seq: row.get("seq"),
        sender: SenderType::parse(&row.get::<String, _>("sender")).unwrap_or(SenderType::Visitor),
        text: row.get("text"),
        widget: if widget_raw.is_empty() {
            None
        } else {
            serde_json::from_str(&widget_raw).ok()
        },
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn list_rules(&self, owner_id: &str) -> Result<Vec<Rule>, StoreError> {
        let advanced_rows = sqlx::query(
            "SELECT id, owner_id, keywords, matching_type, response, response_type, button_label, created_at \
             FROM advanced_replies WHERE owner_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Query(err.to_string()))?;

        let auto_rows = sqlx::query(
            "SELECT id, owner_id, keywords, matching_type, response, created_at \
             FROM auto_replies WHERE owner_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Query(err.to_string()))?;

        let mut rules = Vec::with_capacity(advanced_rows.len() + auto_rows.len());
        for row in &advanced_rows {
            rules.push(Rule {
                id: row.get("id"),
                owner_id: row.get("owner_id"),
                keywords: parse_keywords(&row.get::<String, _>("keywords")),
                matching_type: parse_matching_type(&row.get::<String, _>("matching_type")),
                response: row.get("response"),
                response_kind: match row.get::<String, _>("response_type").as_str() {
                    "url" => ResponseKind::Url,
                    _ => ResponseKind::Text,
                },
                button_label: row
                    .get::<Option<String>, _>("button_label")
                    .filter(|label| !label.trim().is_empty()),
                advanced: true,
                created_at: row.get("created_at"),
            });
        }
        for row in &auto_rows {
            rules.push(Rule {
                id: row.get("id"),
                owner_id: row.get("owner_id"),
                keywords: parse_keywords(&row.get::<String, _>("keywords")),
                matching_type: parse_matching_type(&row.get::<String, _>("matching_type")),
                response: row.get("response"),
                response_kind: ResponseKind::Text,
                button_label: None,
                advanced: false,
                created_at: row.get("created_at"),
            });
        }
        Ok(rules)
    }

    async fn get_settings(&self, owner_id: &str) -> Result<OwnerSettings, StoreError> {
        let row = sqlx::query(
            "SELECT owner_id, business_name, welcome_message, fallback_message, \
                    ai_mode_enabled, COALESCE(ai_api_key, '') AS ai_api_key, \
                    COALESCE(ai_model, '') AS ai_model, COALESCE(ai_context, '') AS ai_context \
             FROM widget_settings WHERE owner_id = $1",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::Query(err.to_string()))?;

        let Some(row) = row else {
            return Ok(OwnerSettings::defaults_for(owner_id));
        };
        Ok(OwnerSettings {
            owner_id: row.get("owner_id"),
            business_name: row.get("business_name"),
            welcome_message: row.get("welcome_message"),
            fallback_message: row.get("fallback_message"),
            ai_mode_enabled: row.get("ai_mode_enabled"),
            ai_api_key: row.get("ai_api_key"),
            ai_model: row.get("ai_model"),
            ai_context: row.get("ai_context"),
        })
    }

    async fn get_or_create_session(
        &self,
        owner_id: &str,
        visitor_id: &str,
    ) -> Result<(Session, bool), StoreError> {
        let existing = sqlx::query(
            "SELECT id, owner_id, visitor_id, status, created_at, updated_at \
             FROM chat_sessions WHERE owner_id = $1 AND visitor_id = $2 AND status = 'active' \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(owner_id)
        .bind(visitor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::Query(err.to_string()))?;

        if let Some(row) = existing {
            return Ok((parse_session_row(&row), false));
        }

        let now = now_iso();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            visitor_id: visitor_id.to_string(),
            status: SessionStatus::Active,
            created_at: now.clone(),
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO chat_sessions (id, owner_id, visitor_id, status, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&session.id)
        .bind(&session.owner_id)
        .bind(&session.visitor_id)
        .bind(session.status.as_str())
        .bind(&session.created_at)
        .bind(&session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::Append(err.to_string()))?;
        Ok((session, true))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_id, visitor_id, status, created_at, updated_at \
             FROM chat_sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::Query(err.to_string()))?;
        Ok(row.map(|row| parse_session_row(&row)))
    }

    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<SessionSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, visitor_id, status, created_at, updated_at \
             FROM chat_sessions WHERE owner_id = $1 AND status = 'active' \
             ORDER BY updated_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Query(err.to_string()))?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let session = parse_session_row(row);
            let messages = self.list_messages(&session.id).await?;
            summaries.push(SessionSummary {
                id: session.id,
                owner_id: session.owner_id,
                visitor_id: session.visitor_id,
                status: session.status,
                created_at: session.created_at,
                updated_at: session.updated_at,
                last_message: messages.last().cloned(),
                message_count: messages.len(),
            });
        }
        Ok(summaries)
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query(
            "UPDATE chat_sessions SET status = $1, updated_at = $2 WHERE id = $3 \
             RETURNING id, owner_id, visitor_id, status, created_at, updated_at",
        )
        .bind(status.as_str())
        .bind(now_iso())
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::Query(err.to_string()))?;
        Ok(row.map(|row| parse_session_row(&row)))
    }

    async fn append_message(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, seq, sender, text, widget, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.seq)
        .bind(message.sender.as_str())
        .bind(&message.text)
        .bind(
            message
                .widget
                .as_ref()
                .map(|w| w.to_string())
                .unwrap_or_default(),
        )
        .bind(&message.created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::Append(err.to_string()))?;

        let _ = sqlx::query("UPDATE chat_sessions SET updated_at = $1 WHERE id = $2")
            .bind(&message.created_at)
            .bind(&message.session_id)
            .execute(&self.pool)
            .await;
        Ok(message)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, seq, sender, text, widget, created_at \
             FROM chat_messages WHERE session_id = $1 ORDER BY created_at ASC, seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Query(err.to_string()))?;
        Ok(rows.iter().map(parse_message_row).collect())
    }

    async fn resolve_owner_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        let owner_id: Option<String> =
            sqlx::query_scalar("SELECT owner_id FROM owner_tokens WHERE token = $1")
                .bind(token)
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| StoreError::Query(err.to_string()))?;
        Ok(owner_id)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Backing store used by tests and when no DATABASE_URL is configured.
/// Implements the same contract as the Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    rules: Vec<Rule>,
    settings: HashMap<String, OwnerSettings>,
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<ChatMessage>>,
    tokens: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub async fn insert_rule(&self, rule: Rule) {
        let mut inner = self.inner.write().await;
        inner.rules.push(rule);
    }

    pub async fn remove_rule(&self, rule_id: &str) {
        let mut inner = self.inner.write().await;
        inner.rules.retain(|rule| rule.id != rule_id);
    }

    pub async fn put_settings(&self, settings: OwnerSettings) {
        let mut inner = self.inner.write().await;
        inner.settings.insert(settings.owner_id.clone(), settings);
    }

    pub async fn put_token(&self, token: &str, owner_id: &str) {
        let mut inner = self.inner.write().await;
        inner.tokens.insert(token.to_string(), owner_id.to_string());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_rules(&self, owner_id: &str) -> Result<Vec<Rule>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .rules
            .iter()
            .filter(|rule| rule.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn get_settings(&self, owner_id: &str) -> Result<OwnerSettings, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .settings
            .get(owner_id)
            .cloned()
            .unwrap_or_else(|| OwnerSettings::defaults_for(owner_id)))
    }

    async fn get_or_create_session(
        &self,
        owner_id: &str,
        visitor_id: &str,
    ) -> Result<(Session, bool), StoreError> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .sessions
            .values()
            .find(|session| {
                session.owner_id == owner_id
                    && session.visitor_id == visitor_id
                    && session.status == SessionStatus::Active
            })
            .cloned();
        if let Some(session) = existing {
            return Ok((session, false));
        }

        let now = now_iso();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            visitor_id: visitor_id.to_string(),
            status: SessionStatus::Active,
            created_at: now.clone(),
            updated_at: now,
        };
        inner.sessions.insert(session.id.clone(), session.clone());
        inner.messages.insert(session.id.clone(), vec![]);
        Ok((session, true))
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(session_id).cloned())
    }

    async fn list_sessions(&self, owner_id: &str) -> Result<Vec<SessionSummary>, StoreError> {
        let inner = self.inner.read().await;
        let mut summaries: Vec<SessionSummary> = inner
            .sessions
            .values()
            .filter(|session| {
                session.owner_id == owner_id && session.status == SessionStatus::Active
            })
            .map(|session| {
                let messages = inner.messages.get(&session.id);
                SessionSummary {
                    id: session.id.clone(),
                    owner_id: session.owner_id.clone(),
                    visitor_id: session.visitor_id.clone(),
                    status: session.status,
                    created_at: session.created_at.clone(),
                    updated_at: session.updated_at.clone(),
                    last_message: messages.and_then(|m| m.last().cloned()),
                    message_count: messages.map(|m| m.len()).unwrap_or(0),
                }
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<Option<Session>, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.get_mut(session_id) else {
            return Ok(None);
        };
        session.status = status;
        session.updated_at = now_iso();
        Ok(Some(session.clone()))
    }

    async fn append_message(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(&message.session_id) {
            return Err(StoreError::SessionNotFound(message.session_id.clone()));
        }
        if let Some(session) = inner.sessions.get_mut(&message.session_id) {
            session.updated_at = message.created_at.clone();
        }
        inner
            .messages
            .entry(message.session_id.clone())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.messages.get(session_id).cloned().unwrap_or_default())
    }

    async fn resolve_owner_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tokens.get(token).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_reuses_active_session_per_visitor() {
        let store = MemoryStore::new();
        let (first, created) = store
            .get_or_create_session("owner-1", "visitor-1")
            .await
            .unwrap();
        assert!(created);
        let (second, created) = store
            .get_or_create_session("owner-1", "visitor-1")
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn memory_store_opens_fresh_session_after_close() {
        let store = MemoryStore::new();
        let (first, _) = store
            .get_or_create_session("owner-1", "visitor-1")
            .await
            .unwrap();
        store
            .update_session_status(&first.id, SessionStatus::Closed)
            .await
            .unwrap();
        let (second, created) = store
            .get_or_create_session("owner-1", "visitor-1")
            .await
            .unwrap();
        assert!(created);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn append_to_unknown_session_is_an_error() {
        let store = MemoryStore::new();
        let message = ChatMessage {
            id: "m1".to_string(),
            session_id: "missing".to_string(),
            seq: 1,
            sender: SenderType::Visitor,
            text: "hello".to_string(),
            widget: None,
            created_at: now_iso(),
        };
        assert!(matches!(
            store.append_message(message).await,
            Err(StoreError::SessionNotFound(_))
        ));
    }
}
