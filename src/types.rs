use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::provider::CompletionProvider;
use crate::realtime::RealtimeHub;
use crate::rules::RuleCache;
use crate::session::SessionCoordinator;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingType {
    WordMatch,
    FuzzyMatch,
    Regex,
    SynonymMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Text,
    Url,
}

/// One operator-configured keyword-to-response mapping. Advanced rules carry
/// a response kind and optional button label; auto rules are plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub owner_id: String,
    pub keywords: Vec<String>,
    pub matching_type: MatchingType,
    pub response: String,
    pub response_kind: ResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_label: Option<String>,
    pub advanced: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Visitor,
    Bot,
    Agent,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::Visitor => "visitor",
            SenderType::Bot => "bot",
            SenderType::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<SenderType> {
        match value {
            "visitor" => Some(SenderType::Visitor),
            "bot" => Some(SenderType::Bot),
            "agent" => Some(SenderType::Agent),
            _ => None,
        }
    }
}

/// Immutable transcript entry. `seq` is the per-session insertion sequence;
/// the ordering key is (session_id, created_at, seq).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub sender: SenderType,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<SessionStatus> {
        match value {
            "active" => Some(SessionStatus::Active),
            "closed" => Some(SessionStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub visitor_id: String,
    pub status: SessionStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub owner_id: String,
    pub visitor_id: String,
    pub status: SessionStatus,
    pub created_at: String,
    pub updated_at: String,
    pub last_message: Option<ChatMessage>,
    pub message_count: usize,
}

/// Owner-level widget settings consumed read-only by the engine: the static
/// fallback text and the AI mode configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSettings {
    pub owner_id: String,
    pub business_name: String,
    pub welcome_message: String,
    pub fallback_message: String,
    pub ai_mode_enabled: bool,
    #[serde(default)]
    pub ai_api_key: String,
    #[serde(default)]
    pub ai_model: String,
    #[serde(default)]
    pub ai_context: String,
}

impl OwnerSettings {
    pub fn defaults_for(owner_id: &str) -> OwnerSettings {
        OwnerSettings {
            owner_id: owner_id.to_string(),
            business_name: String::new(),
            welcome_message: "Hi! How can we help you today?".to_string(),
            fallback_message: "Thanks for reaching out! We'll get back to you shortly."
                .to_string(),
            ai_mode_enabled: false,
            ai_api_key: String::new(),
            ai_model: String::new(),
            ai_context: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorMessageBody {
    pub visitor_id: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentModeBody {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapQuery {
    pub visitor_id: String,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn CompletionProvider>,
    pub rules: Arc<RuleCache>,
    pub hub: Arc<RealtimeHub>,
    pub coordinator: Arc<SessionCoordinator>,
}
