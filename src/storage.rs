//! File-backed JSON storage for conversations.
//!
//! Layout per user scope (anonymous requests use the root scope):
//!
//! ```text
//! <data>/[users/<user>/]conversations/<uuid>.json
//! ```
//!
//! Documents are append-on-success: the assistant message is written only
//! after a deliberation finishes, and legacy `stage1/stage2/stage3` messages
//! are migrated lazily in memory on read; stored files are not rewritten
//! just for having been read.

use crate::deliberation::{migrate_message, DeliberationMode, DeliberationResult, Round, Synthesis};
use crate::error::{CouncilError, Result};
use crate::metrics::AggregateMetrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Resolve the directory of one user scope under the data root.
pub(crate) fn user_scope_dir(base: &Path, user: Option<&str>) -> PathBuf {
    match user {
        Some(user) => base.join("users").join(user),
        None => base.to_path_buf(),
    }
}

/// A stored conversation document. `messages` stay raw JSON so legacy
/// documents survive round trips untouched; use [`Conversation::migrated_messages`]
/// for the unified view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: String,
    pub title: String,
    /// Panel bound at creation. `None` in very old documents means
    /// "whatever the global defaults are".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub council_models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chairman_model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl Conversation {
    /// Messages with legacy assistant turns converted to the unified shape.
    pub fn migrated_messages(&self) -> Vec<Value> {
        self.messages.iter().cloned().map(migrate_message).collect()
    }

    /// The whole document with migrated messages, for API responses.
    pub fn migrated(&self) -> Conversation {
        Conversation {
            messages: self.migrated_messages(),
            ..self.clone()
        }
    }
}

/// An assistant turn in the unified shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub mode: DeliberationMode,
    #[serde(default)]
    pub rounds: Vec<Round>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<Synthesis>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub participant_mapping: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<AggregateMetrics>,
}

impl From<DeliberationResult> for AssistantMessage {
    fn from(result: DeliberationResult) -> Self {
        Self {
            mode: result.mode,
            rounds: result.rounds,
            synthesis: result.synthesis,
            participant_mapping: result.participant_mapping,
            metrics: result.metrics,
        }
    }
}

/// Metadata row for the conversation list view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub id: String,
    pub created_at: String,
    pub title: String,
    pub message_count: usize,
}

/// File-backed conversation store rooted at the data directory.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    base_dir: PathBuf,
}

impl ConversationStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn conversations_dir(&self, user: Option<&str>) -> PathBuf {
        user_scope_dir(&self.base_dir, user).join("conversations")
    }

    fn path_for(&self, id: &str, user: Option<&str>) -> PathBuf {
        self.conversations_dir(user).join(format!("{}.json", id))
    }

    /// Create a conversation bound to the given panel.
    pub fn create(
        &self,
        id: &str,
        user: Option<&str>,
        council_models: Vec<String>,
        chairman_model: String,
    ) -> Result<Conversation> {
        let conversation = Conversation {
            id: id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            title: "New Conversation".into(),
            council_models: Some(council_models),
            chairman_model: Some(chairman_model),
            messages: Vec::new(),
        };
        self.save(&conversation, user)?;
        Ok(conversation)
    }

    /// Load a conversation, or `None` if it does not exist.
    pub fn get(&self, id: &str, user: Option<&str>) -> Result<Option<Conversation>> {
        let path = self.path_for(id, user);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn require(&self, id: &str, user: Option<&str>) -> Result<Conversation> {
        self.get(id, user)?
            .ok_or_else(|| CouncilError::ConversationNotFound(id.to_string()))
    }

    fn save(&self, conversation: &Conversation, user: Option<&str>) -> Result<()> {
        let dir = self.conversations_dir(user);
        std::fs::create_dir_all(&dir)?;
        let path = self.path_for(&conversation.id, user);
        std::fs::write(path, serde_json::to_string_pretty(conversation)?)?;
        Ok(())
    }

    /// List conversation metadata, newest first.
    pub fn list(&self, user: Option<&str>) -> Result<Vec<ConversationMeta>> {
        let dir = self.conversations_dir(user);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut conversations = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Conversation>(&text) {
                Ok(c) => conversations.push(ConversationMeta {
                    id: c.id,
                    created_at: c.created_at,
                    title: c.title,
                    message_count: c.messages.len(),
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable conversation file");
                }
            }
        }

        conversations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(conversations)
    }

    /// The panel configuration bound to a conversation, if any.
    pub fn panel_config(
        &self,
        id: &str,
        user: Option<&str>,
    ) -> Result<(Option<Vec<String>>, Option<String>)> {
        let conversation = self.require(id, user)?;
        Ok((conversation.council_models, conversation.chairman_model))
    }

    pub fn update_title(&self, id: &str, title: &str, user: Option<&str>) -> Result<()> {
        let mut conversation = self.require(id, user)?;
        conversation.title = title.to_string();
        self.save(&conversation, user)
    }

    pub fn delete(&self, id: &str, user: Option<&str>) -> Result<bool> {
        let path = self.path_for(id, user);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    /// Append a user message.
    pub fn add_user_message(&self, id: &str, content: &str, user: Option<&str>) -> Result<()> {
        let mut conversation = self.require(id, user)?;
        conversation
            .messages
            .push(serde_json::json!({"role": "user", "content": content}));
        self.save(&conversation, user)
    }

    /// Remove the trailing user message, if the last message is one.
    /// Used when an abandoned pending turn is cleared.
    pub fn remove_last_user_message(&self, id: &str, user: Option<&str>) -> Result<bool> {
        let mut conversation = self.require(id, user)?;
        let is_user = conversation
            .messages
            .last()
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
            == Some("user");
        if !is_user {
            return Ok(false);
        }
        conversation.messages.pop();
        self.save(&conversation, user)?;
        Ok(true)
    }

    /// Append a completed deliberation as one assistant message.
    pub fn add_assistant_result(
        &self,
        id: &str,
        result: &DeliberationResult,
        user: Option<&str>,
    ) -> Result<()> {
        let mut conversation = self.require(id, user)?;
        let mut message = serde_json::to_value(result)?;
        message["role"] = Value::String("assistant".into());
        conversation.messages.push(message);
        self.save(&conversation, user)
    }

    /// Locate the last assistant message (unified view) and the user message
    /// immediately preceding it. Returns indices into the raw message list.
    pub fn last_assistant_with_query(
        &self,
        conversation: &Conversation,
    ) -> Option<(usize, AssistantMessage, String)> {
        let migrated = conversation.migrated_messages();
        let (index, message) = migrated
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| m.get("role").and_then(Value::as_str) == Some("assistant"))?;

        let assistant: AssistantMessage = serde_json::from_value(message.clone()).ok()?;

        let user_query = migrated[..index]
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)?
            .to_string();

        Some((index, assistant, user_query))
    }

    /// Replace the synthesis and aggregate metrics of the last assistant
    /// message in place. The message's rounds are never touched. A legacy
    /// message is upgraded to the unified shape as part of the rewrite.
    pub fn update_last_synthesis(
        &self,
        id: &str,
        synthesis: &Synthesis,
        metrics: &AggregateMetrics,
        user: Option<&str>,
    ) -> Result<()> {
        let mut conversation = self.require(id, user)?;

        let index = conversation
            .messages
            .iter()
            .rposition(|m| m.get("role").and_then(Value::as_str) == Some("assistant"))
            .ok_or_else(|| {
                CouncilError::Precondition("no assistant message found to update".into())
            })?;

        let mut message = migrate_message(conversation.messages[index].clone());
        message["synthesis"] = serde_json::to_value(synthesis)?;
        message["metrics"] = serde_json::to_value(metrics)?;
        conversation.messages[index] = message;

        self.save(&conversation, user)
    }

    /// Replace the last arena assistant message with an extended result.
    pub fn replace_last_arena_message(
        &self,
        id: &str,
        result: &DeliberationResult,
        user: Option<&str>,
    ) -> Result<()> {
        let mut conversation = self.require(id, user)?;

        let index = conversation
            .messages
            .iter()
            .rposition(|m| {
                m.get("role").and_then(Value::as_str) == Some("assistant")
                    && m.get("mode").and_then(Value::as_str) == Some("arena")
            })
            .ok_or_else(|| {
                CouncilError::Precondition("no arena message found to update".into())
            })?;

        let mut message = serde_json::to_value(result)?;
        message["role"] = Value::String("assistant".into());
        conversation.messages[index] = message;

        self.save(&conversation, user)
    }
}
