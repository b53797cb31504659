use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::{EngineError, ProviderError};
use crate::prompting::{render_system_prompt, render_user_content, SystemPromptContext};
use crate::provider::CompletionRequest;
use crate::resolver::{resolve, ResolutionOutcome};
use crate::session::SessionCoordinator;
use crate::types::{
    ChatMessage, OwnerSettings, ResponseKind, Rule, Session, SessionStatus,
};

const TRANSCRIPT_CONTEXT_MESSAGES: usize = 12;

/// Decide and append the automated reply for one visitor turn. The fallback
/// chain is rule match, then AI completion, then the static fallback message;
/// agent mode short-circuits the whole chain. Returns the appended bot
/// message, or None when the turn is left for a human. No matching or
/// provider failure escapes this function as an error; only a failed append
/// does.
pub async fn respond_to_visitor_turn(
    co: &Arc<SessionCoordinator>,
    session: &Session,
    visitor_seq: i64,
    visitor_text: &str,
) -> Result<Option<ChatMessage>, EngineError> {
    let owner_id = &session.owner_id;

    if co.agent_mode_active(owner_id).await {
        tracing::debug!(session = %session.id, "agent mode active, turn queued for human");
        return Ok(None);
    }

    let settings = load_settings(co, owner_id).await;
    let (text, widget) = match resolve_reply(co, session, visitor_text).await {
        Some(reply) => reply,
        None => ai_or_fallback(co, session, visitor_text, &settings).await,
    };

    // A human may have taken the turn while the reply was being computed.
    // Re-check immediately before appending and discard our result if so.
    if co.agent_mode_active(owner_id).await {
        tracing::info!(session = %session.id, "agent mode took the turn, discarding automated reply");
        return Ok(None);
    }
    match co.store.get_session(&session.id).await {
        Ok(Some(current)) if current.status == SessionStatus::Closed => {
            tracing::info!(session = %session.id, "session closed mid-turn, discarding automated reply");
            return Ok(None);
        }
        Ok(None) => {
            tracing::warn!(session = %session.id, "session vanished mid-turn, discarding automated reply");
            co.release_session(&session.id).await;
            return Ok(None);
        }
        _ => {}
    }

    // The human-reply comparison happens inside the append, under the
    // per-session lock, so an agent message cannot race it.
    let appended = co
        .append_bot_unless_agent_replied(session, visitor_seq, &text, widget)
        .await
        .map_err(EngineError::Persistence)?;
    if appended.is_none() {
        tracing::info!(session = %session.id, "human reply already landed, discarding automated reply");
    }
    Ok(appended)
}

async fn resolve_reply(
    co: &Arc<SessionCoordinator>,
    session: &Session,
    visitor_text: &str,
) -> Option<(String, Option<Value>)> {
    let snapshot = match co.rules.snapshot(&session.owner_id).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            // A broken rule read must not take down the pipeline; resolution
            // simply sees no rules and escalates.
            tracing::warn!(owner = %session.owner_id, error = %err, "rule snapshot unavailable");
            return None;
        }
    };

    match resolve(visitor_text, &snapshot, co.config.fuzzy_threshold) {
        ResolutionOutcome::Matched { rule, score } => {
            tracing::debug!(
                session = %session.id,
                rule = %rule.id,
                score,
                "rule matched"
            );
            Some(render_rule_reply(&rule))
        }
        ResolutionOutcome::Unmatched => None,
    }
}

fn render_rule_reply(rule: &Rule) -> (String, Option<Value>) {
    match rule.response_kind {
        ResponseKind::Text => (rule.response.clone(), None),
        ResponseKind::Url => {
            let label = rule
                .button_label
                .clone()
                .filter(|label| !label.trim().is_empty())
                .unwrap_or_else(|| "Open link".to_string());
            (
                label.clone(),
                Some(json!({
                    "type": "link_button",
                    "url": rule.response,
                    "label": label
                })),
            )
        }
    }
}

async fn ai_or_fallback(
    co: &Arc<SessionCoordinator>,
    session: &Session,
    visitor_text: &str,
    settings: &OwnerSettings,
) -> (String, Option<Value>) {
    if settings.ai_mode_enabled {
        match ai_completion(co, session, visitor_text, settings).await {
            Ok(reply) => return (reply, None),
            Err(err) => {
                tracing::warn!(
                    session = %session.id,
                    error = %err,
                    "AI completion unavailable, using fallback message"
                );
            }
        }
    }
    (settings.fallback_message.clone(), None)
}

async fn ai_completion(
    co: &Arc<SessionCoordinator>,
    session: &Session,
    visitor_text: &str,
    settings: &OwnerSettings,
) -> Result<String, ProviderError> {
    let transcript = recent_transcript(co, &session.id, TRANSCRIPT_CONTEXT_MESSAGES).await;
    let system = render_system_prompt(&SystemPromptContext {
        business_name: &settings.business_name,
        business_context: &settings.ai_context,
    });
    let model = if settings.ai_model.trim().is_empty() {
        co.config.default_ai_model.clone()
    } else {
        settings.ai_model.trim().to_string()
    };
    let request = CompletionRequest {
        model,
        api_key: settings.ai_api_key.clone(),
        system,
        user: render_user_content(&transcript, visitor_text),
    };

    let timeout = co.config.provider_timeout;
    match tokio::time::timeout(timeout, co.provider.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout.as_millis() as u64)),
    }
}

async fn recent_transcript(co: &Arc<SessionCoordinator>, session_id: &str, limit: usize) -> String {
    let messages = co
        .store
        .list_messages(session_id)
        .await
        .unwrap_or_default();
    if messages.is_empty() {
        return String::new();
    }
    let start_index = messages.len().saturating_sub(limit);
    messages
        .iter()
        .skip(start_index)
        .map(|message| format!("{}: {}", message.sender.as_str(), message.text))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn load_settings(co: &Arc<SessionCoordinator>, owner_id: &str) -> OwnerSettings {
    // Idempotent read: retry once, then fall back to defaults so the visitor
    // still gets an answer.
    match co.store.get_settings(owner_id).await {
        Ok(settings) => settings,
        Err(first_err) => {
            tracing::debug!(owner = %owner_id, error = %first_err, "settings read failed, retrying once");
            tokio::time::sleep(Duration::from_millis(50)).await;
            match co.store.get_settings(owner_id).await {
                Ok(settings) => settings,
                Err(err) => {
                    tracing::warn!(owner = %owner_id, error = %err, "settings unavailable, using defaults");
                    OwnerSettings::defaults_for(owner_id)
                }
            }
        }
    }
}
