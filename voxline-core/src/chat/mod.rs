//! Chat sessions and the incremental text append pipeline.
//!
//! A model reply streams in as text deltas. The first event of a reply creates
//! a [`PendingResponse`] and an empty model message; each delta extends the
//! pending text and replaces that message's text by id; `Done` freezes it and
//! an error replaces it with [`FAILURE_NOTICE`]. Every change is broadcast as a
//! [`MessageUpdateEvent`] carrying the full text, so a front end only ever
//! replaces.
//!
//! Lookups always go through both the session id and the message id, so two
//! sessions streaming at once can never write into each other's messages.

pub mod attachment;
pub mod mode;
pub mod stream;

pub use attachment::{AttachmentKind, ChatAttachment};
pub use mode::ChatMode;
pub use stream::{drive_response, ResponseOutcome, TextEvent};

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Result, VoxlineError};
use crate::events::{MessageUpdateEvent, UpdateKind};
use crate::remote::wire::Part;

/// Text shown in place of a reply whose stream failed.
pub const FAILURE_NOTICE: &str = "Sorry, something went wrong while contacting the server.";

/// Title of a session before its first message.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Characters of the first user message kept in a derived title.
const TITLE_CHARS: usize = 30;

const BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<ChatAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub mode: ChatMode,
    pub last_modified: DateTime<Utc>,
}

impl ChatSession {
    pub fn message(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| &m.id == id)
    }
}

/// Everything the external text service needs for one reply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub system_instruction: String,
    /// Messages before the one being answered.
    pub history: Vec<ChatMessage>,
    /// The message being answered, with its attachment folded in.
    pub parts: Vec<Part>,
}

/// The single reply currently streaming into a session.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    pub message_id: MessageId,
    pub text: String,
}

/// Derive a session title from its first user message.
pub fn derive_title(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(TITLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// All chat sessions, most recently created first.
pub struct Conversations {
    sessions: Vec<ChatSession>,
    pending: HashMap<SessionId, PendingResponse>,
    next_id: u64,
    seq: u64,
    updates: broadcast::Sender<MessageUpdateEvent>,
}

impl Default for Conversations {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversations {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            sessions: Vec::new(),
            pending: HashMap::new(),
            next_id: 0,
            seq: 0,
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MessageUpdateEvent> {
        self.updates.subscribe()
    }

    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn session(&self, id: &SessionId) -> Option<&ChatSession> {
        self.sessions.iter().find(|s| &s.id == id)
    }

    pub fn pending(&self, id: &SessionId) -> Option<&PendingResponse> {
        self.pending.get(id)
    }

    pub fn is_responding(&self, id: &SessionId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn create_session(&mut self, mode: ChatMode) -> SessionId {
        let id = SessionId(self.allocate("chat"));
        self.sessions.insert(
            0,
            ChatSession {
                id: id.clone(),
                title: DEFAULT_TITLE.to_string(),
                messages: Vec::new(),
                mode,
                last_modified: Utc::now(),
            },
        );
        info!(session_id = %id, mode = mode.label(), "chat session created");
        id
    }

    pub fn rename_session(&mut self, id: &SessionId, title: impl Into<String>) -> Result<()> {
        let session = self.session_mut(id)?;
        session.title = title.into();
        Ok(())
    }

    /// Remove a session together with any reply still streaming into it.
    pub fn delete_session(&mut self, id: &SessionId) -> Result<ChatSession> {
        let idx = self
            .sessions
            .iter()
            .position(|s| &s.id == id)
            .ok_or_else(|| VoxlineError::UnknownSession(id.to_string()))?;
        self.pending.remove(id);
        Ok(self.sessions.remove(idx))
    }

    /// Append a user message, deriving the title if it is the first one.
    ///
    /// # Errors
    /// `ResponseInFlight` while a reply is still streaming into the session.
    pub fn push_user_message(
        &mut self,
        id: &SessionId,
        text: impl Into<String>,
        attachment: Option<ChatAttachment>,
    ) -> Result<MessageId> {
        if self.pending.contains_key(id) {
            return Err(VoxlineError::ResponseInFlight(id.to_string()));
        }
        let message_id = MessageId(self.allocate("msg"));
        let text = text.into();
        let session = self.session_mut(id)?;
        if session.messages.is_empty() {
            session.title = derive_title(&text);
        }
        let now = Utc::now();
        session.messages.push(ChatMessage {
            id: message_id.clone(),
            role: Role::User,
            text,
            timestamp: now,
            attachment,
        });
        session.last_modified = now;
        Ok(message_id)
    }

    /// Build the request answering the latest user message of a session.
    pub fn request_for(&self, id: &SessionId) -> Result<ChatRequest> {
        let session = self
            .session(id)
            .ok_or_else(|| VoxlineError::UnknownSession(id.to_string()))?;
        let last_user = session
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .ok_or_else(|| VoxlineError::Other(anyhow::anyhow!("session {id} has no user message")))?;

        Ok(ChatRequest {
            system_instruction: session.mode.system_instruction(),
            history: session.messages[..last_user].to_vec(),
            parts: attachment::message_parts(
                &session.messages[last_user].text,
                session.messages[last_user].attachment.as_ref(),
            ),
        })
    }

    /// Create the pending reply and its empty model message.
    ///
    /// # Errors
    /// `ResponseInFlight` if the session already has one.
    pub fn begin_response(&mut self, id: &SessionId) -> Result<MessageId> {
        if self.pending.contains_key(id) {
            return Err(VoxlineError::ResponseInFlight(id.to_string()));
        }
        let message_id = MessageId(self.allocate("msg"));
        let session = self.session_mut(id)?;
        session.messages.push(ChatMessage {
            id: message_id.clone(),
            role: Role::Model,
            text: String::new(),
            timestamp: Utc::now(),
            attachment: None,
        });
        self.pending.insert(
            id.clone(),
            PendingResponse {
                message_id: message_id.clone(),
                text: String::new(),
            },
        );
        debug!(session_id = %id, message_id = %message_id, "response started");
        self.emit(id, &message_id, String::new(), UpdateKind::Streaming);
        Ok(message_id)
    }

    /// Extend a streaming reply.
    ///
    /// # Errors
    /// `UnknownResponse` when `message_id` is not the reply streaming into
    /// `id`, including after it was finalized.
    pub fn append_delta(&mut self, id: &SessionId, message_id: &MessageId, delta: &str) -> Result<()> {
        let text = {
            let pending = self.pending_mut(id, message_id)?;
            pending.text.push_str(delta);
            pending.text.clone()
        };
        self.set_message_text(id, message_id, text.clone())?;
        self.emit(id, message_id, text, UpdateKind::Streaming);
        Ok(())
    }

    /// Freeze a reply with whatever text it accumulated.
    pub fn complete(&mut self, id: &SessionId, message_id: &MessageId) -> Result<()> {
        self.pending_mut(id, message_id)?;
        let text = self
            .pending
            .remove(id)
            .map(|p| p.text)
            .unwrap_or_default();
        debug!(session_id = %id, message_id = %message_id, chars = text.len(), "response complete");
        self.emit(id, message_id, text, UpdateKind::Final);
        Ok(())
    }

    /// Freeze a reply as failed, replacing its text with [`FAILURE_NOTICE`].
    pub fn fail(&mut self, id: &SessionId, message_id: &MessageId, reason: &str) -> Result<()> {
        self.pending_mut(id, message_id)?;
        self.pending.remove(id);
        warn!(session_id = %id, message_id = %message_id, "response failed: {reason}");
        self.set_message_text(id, message_id, FAILURE_NOTICE.to_string())?;
        self.emit(id, message_id, FAILURE_NOTICE.to_string(), UpdateKind::Failed);
        Ok(())
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn session_mut(&mut self, id: &SessionId) -> Result<&mut ChatSession> {
        self.sessions
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| VoxlineError::UnknownSession(id.to_string()))
    }

    fn pending_mut(&mut self, id: &SessionId, message_id: &MessageId) -> Result<&mut PendingResponse> {
        match self.pending.get_mut(id) {
            Some(pending) if &pending.message_id == message_id => Ok(pending),
            _ => Err(VoxlineError::UnknownResponse {
                session_id: id.to_string(),
                message_id: message_id.to_string(),
            }),
        }
    }

    fn set_message_text(&mut self, id: &SessionId, message_id: &MessageId, text: String) -> Result<()> {
        let session = self.session_mut(id)?;
        let message = session
            .messages
            .iter_mut()
            .find(|m| &m.id == message_id)
            .ok_or_else(|| VoxlineError::UnknownResponse {
                session_id: id.to_string(),
                message_id: message_id.to_string(),
            })?;
        message.text = text;
        session.last_modified = Utc::now();
        Ok(())
    }

    fn emit(&mut self, id: &SessionId, message_id: &MessageId, text: String, kind: UpdateKind) {
        self.seq += 1;
        let _ = self.updates.send(MessageUpdateEvent {
            seq: self.seq,
            session_id: id.to_string(),
            message_id: message_id.to_string(),
            text,
            kind,
        });
    }
}
