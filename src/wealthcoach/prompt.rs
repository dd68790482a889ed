//! Prompt assembly for the finance-coach persona.
//!
//! Two template classes: the system template (role description, mandatory
//! safety disclaimer, optional personalization block) and the context block
//! (numbered `RELEVANT CONTEXT` entries injected as the last system message
//! before the user question).

use crate::wealthcoach::client_wrapper::{truncate_to_budget, Message, Role};
use crate::wealthcoach::conversation::{ChatMessage, UserProfile};
use crate::wealthcoach::vector_store::ScoredDocument;

const PERSONA: &str = "You are a personal finance coach. You help people understand budgeting, \
savings, allocations, and investment products in plain language.";

const DISCLAIMER: &str = "You are not a licensed financial advisor. Always remind users that \
your guidance is educational and that they should consult a qualified professional before \
making investment decisions.";

/// Build the system message, personalizing when a profile is available.
/// Absent profile fields are simply omitted.
pub fn system_prompt(profile: Option<&UserProfile>) -> String {
    let mut prompt = format!("{}\n\n{}", PERSONA, DISCLAIMER);

    if let Some(profile) = profile {
        let mut lines = Vec::new();
        if let Some(name) = profile.name.as_deref().filter(|s| !s.is_empty()) {
            lines.push(format!("The user's name is {}.", name));
        }
        if let Some(risk) = profile.risk_tolerance.as_deref().filter(|s| !s.is_empty()) {
            lines.push(format!("Their stated risk tolerance is {}.", risk));
        }
        if let Some(prefs) = profile.preferences.as_deref().filter(|s| !s.is_empty()) {
            lines.push(format!("Their preferences: {}.", prefs));
        }
        if !lines.is_empty() {
            prompt.push_str("\n\nAbout this user:\n");
            prompt.push_str(&lines.join("\n"));
        }
    }

    prompt
}

/// Format retrieved passages as a numbered context block, or `None` when
/// there is nothing to ground on.
pub fn context_block(documents: &[ScoredDocument]) -> Option<String> {
    if documents.is_empty() {
        return None;
    }
    let mut block = String::from(
        "RELEVANT CONTEXT — ground your answer in these passages and cite nothing else:\n",
    );
    for (i, scored) in documents.iter().enumerate() {
        let source = scored.document.source().unwrap_or("unknown");
        block.push_str(&format!(
            "\n[{}] source: {}\n{}\n",
            i + 1,
            source,
            scored.document.content
        ));
    }
    Some(block)
}

/// Assemble the full prompt: system message, context block (when sources are
/// present), history oldest-first, final user message — then trim to the
/// input token budget, always preserving system messages and the question.
pub fn assemble(
    profile: Option<&UserProfile>,
    documents: &[ScoredDocument],
    history: &[ChatMessage],
    user_message: &str,
    token_budget: usize,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 3);
    messages.push(Message::new(Role::System, system_prompt(profile)));

    if let Some(block) = context_block(documents) {
        messages.push(Message::new(Role::System, block));
    }

    for entry in history {
        let role = match entry.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            // History snapshots only ever hold user/assistant turns; anything
            // else is skipped rather than forwarded to the model.
            _ => continue,
        };
        messages.push(Message::new(role, entry.content.as_str()));
    }

    messages.push(Message::new(Role::User, user_message));
    truncate_to_budget(messages, token_budget)
}
