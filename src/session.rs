//! Conversation continuity across agent calls.
//!
//! Three stores implement [`SessionContinuity`]:
//!
//! - [`NativeSessionStore`]: the provider keeps the conversation; we persist
//!   only the opaque resume token it printed on the first call.
//! - [`FileHistoryStore`]: explicit message history in a JSON file per
//!   (agent, session), trimmed while keeping system messages.
//! - [`MemoryHistory`]: the same history kept only for the life of the agent.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tokens: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

/// What a store can hand back to resume a conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionContext {
    Empty,
    /// Provider-side session, continued by passing this token back.
    Resume(String),
    History(Vec<ChatMessage>),
}

pub trait SessionContinuity: Send + Sync {
    fn has_session(&self, session_id: &str) -> bool;

    fn context(&self, session_id: &str) -> SessionContext;

    fn append(&self, session_id: &str, message: ChatMessage) -> Result<(), SessionError>;

    fn clear(&self, session_id: &str) -> Result<(), SessionError>;

    fn total_tokens(&self, session_id: &str) -> u64;
}

/// Keeps every system message and the newest non-system messages so that the
/// result has at most `max` entries (system messages are never dropped, even
/// if they alone exceed `max`). Relative order is preserved.
pub fn trim_history(messages: &mut Vec<ChatMessage>, max: usize) {
    if messages.len() <= max {
        return;
    }
    let system_count = messages.iter().filter(|m| m.role == Role::System).count();
    let mut keep_other = max.saturating_sub(system_count);
    let mut keep = vec![false; messages.len()];
    for (i, m) in messages.iter().enumerate().rev() {
        if m.role == Role::System {
            keep[i] = true;
        } else if keep_other > 0 {
            keep[i] = true;
            keep_other -= 1;
        }
    }
    let mut flags = keep.into_iter();
    messages.retain(|_| flags.next().unwrap_or(false));
}

// Session ids come from run ids; keep them filesystem-safe.
fn file_stem(agent: &str, session_id: &str) -> String {
    format!("{agent}-{session_id}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, SessionError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), SessionError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NativeRecord {
    resume_token: Option<String>,
    total_tokens: u64,
    updated_at: Option<DateTime<Utc>>,
}

/// Persists the provider's opaque resume token on disk.
pub struct NativeSessionStore {
    dir: PathBuf,
    agent: String,
}

impl NativeSessionStore {
    pub fn new(dir: impl Into<PathBuf>, agent: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            agent: agent.into(),
        }
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.native.json", file_stem(&self.agent, session_id)))
    }

    fn load(&self, session_id: &str) -> NativeRecord {
        match read_json(&self.path(session_id)) {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                debug!(agent = %self.agent, session_id, error = %e, "ignoring unreadable session file");
                NativeRecord::default()
            }
        }
    }

    pub fn set_resume_token(&self, session_id: &str, token: &str) -> Result<(), SessionError> {
        let mut record = self.load(session_id);
        record.resume_token = Some(token.to_string());
        record.updated_at = Some(Utc::now());
        write_json(&self.path(session_id), &record)
    }
}

impl SessionContinuity for NativeSessionStore {
    fn has_session(&self, session_id: &str) -> bool {
        self.load(session_id).resume_token.is_some()
    }

    fn context(&self, session_id: &str) -> SessionContext {
        match self.load(session_id).resume_token {
            Some(token) => SessionContext::Resume(token),
            None => SessionContext::Empty,
        }
    }

    /// The provider holds the transcript; only the token count is recorded.
    fn append(&self, session_id: &str, message: ChatMessage) -> Result<(), SessionError> {
        let mut record = self.load(session_id);
        record.total_tokens += message.tokens.unwrap_or(0);
        record.updated_at = Some(Utc::now());
        write_json(&self.path(session_id), &record)
    }

    fn clear(&self, session_id: &str) -> Result<(), SessionError> {
        remove_if_exists(&self.path(session_id))
    }

    fn total_tokens(&self, session_id: &str) -> u64 {
        self.load(session_id).total_tokens
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct HistoryRecord {
    messages: Vec<ChatMessage>,
    total_tokens: u64,
}

impl HistoryRecord {
    fn push(&mut self, message: ChatMessage, max: usize) {
        self.total_tokens += message.tokens.unwrap_or(0);
        self.messages.push(message);
        trim_history(&mut self.messages, max);
    }
}

/// Message history persisted as JSON, one file per (agent, session).
pub struct FileHistoryStore {
    dir: PathBuf,
    agent: String,
    max_messages: usize,
}

impl FileHistoryStore {
    pub fn new(dir: impl Into<PathBuf>, agent: impl Into<String>, max_messages: usize) -> Self {
        Self {
            dir: dir.into(),
            agent: agent.into(),
            max_messages,
        }
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.history.json", file_stem(&self.agent, session_id)))
    }

    fn load(&self, session_id: &str) -> HistoryRecord {
        match read_json(&self.path(session_id)) {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                debug!(agent = %self.agent, session_id, error = %e, "ignoring unreadable history file");
                HistoryRecord::default()
            }
        }
    }
}

impl SessionContinuity for FileHistoryStore {
    fn has_session(&self, session_id: &str) -> bool {
        !self.load(session_id).messages.is_empty()
    }

    fn context(&self, session_id: &str) -> SessionContext {
        let record = self.load(session_id);
        if record.messages.is_empty() {
            SessionContext::Empty
        } else {
            SessionContext::History(record.messages)
        }
    }

    fn append(&self, session_id: &str, message: ChatMessage) -> Result<(), SessionError> {
        let mut record = self.load(session_id);
        record.push(message, self.max_messages);
        write_json(&self.path(session_id), &record)
    }

    fn clear(&self, session_id: &str) -> Result<(), SessionError> {
        remove_if_exists(&self.path(session_id))
    }

    fn total_tokens(&self, session_id: &str) -> u64 {
        self.load(session_id).total_tokens
    }
}

/// History held in memory for the lifetime of the owning agent.
pub struct MemoryHistory {
    max_messages: usize,
    sessions: Mutex<HashMap<String, HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl SessionContinuity for MemoryHistory {
    fn has_session(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .is_some_and(|r| !r.messages.is_empty())
    }

    fn context(&self, session_id: &str) -> SessionContext {
        match self.sessions.lock().get(session_id) {
            Some(record) if !record.messages.is_empty() => {
                SessionContext::History(record.messages.clone())
            }
            _ => SessionContext::Empty,
        }
    }

    fn append(&self, session_id: &str, message: ChatMessage) -> Result<(), SessionError> {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(message, self.max_messages);
        Ok(())
    }

    fn clear(&self, session_id: &str) -> Result<(), SessionError> {
        self.sessions.lock().remove(session_id);
        Ok(())
    }

    fn total_tokens(&self, session_id: &str) -> u64 {
        self.sessions
            .lock()
            .get(session_id)
            .map_or(0, |r| r.total_tokens)
    }
}
