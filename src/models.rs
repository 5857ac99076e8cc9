use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    General,
    Inquiry,
    Business,
    Urgent,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Inquiry => "inquiry",
            Self::Business => "business",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "general" => Some(Self::General),
            "inquiry" => Some(Self::Inquiry),
            "business" => Some(Self::Business),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

/// Display identity of a participant, resolved once at thread creation by the
/// external profile collaborator and stored alongside the thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedParticipant {
    pub user_id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub user_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_key: String,
    pub participant_lo: String,
    pub participant_hi: String,
    pub subject: Option<String>,
    pub profile_lo: ResolvedParticipant,
    pub profile_hi: ResolvedParticipant,
    pub last_message: Option<LastMessage>,
    pub message_count: i64,
    pub unread_lo: i64,
    pub unread_hi: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Thread {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_lo == user_id || self.participant_hi == user_id
    }

    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if self.participant_lo == user_id {
            Some(&self.participant_hi)
        } else if self.participant_hi == user_id {
            Some(&self.participant_lo)
        } else {
            None
        }
    }

    pub fn unread_for(&self, user_id: &str) -> i64 {
        if self.participant_lo == user_id {
            self.unread_lo
        } else if self.participant_hi == user_id {
            self.unread_hi
        } else {
            0
        }
    }

    /// Caller-scoped projection for thread listing: the counter party's
    /// resolved profile plus the caller's own unread count.
    pub fn view_for(&self, user_id: &str) -> Option<ThreadView> {
        let other = if self.participant_lo == user_id {
            &self.profile_hi
        } else if self.participant_hi == user_id {
            &self.profile_lo
        } else {
            return None;
        };
        Some(ThreadView {
            thread_key: self.thread_key.clone(),
            other_participant: other.clone(),
            subject: self.subject.clone(),
            last_message: self.last_message.clone(),
            message_count: self.message_count,
            unread_count: self.unread_for(user_id),
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadView {
    pub thread_key: String,
    pub other_participant: ResolvedParticipant,
    pub subject: Option<String>,
    pub last_message: Option<LastMessage>,
    pub message_count: i64,
    pub unread_count: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_key: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub ts: i64,
    pub seq: i64,
    pub is_read: bool,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub message: Message,
    pub rank: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadProbe {
    pub exists: bool,
    pub thread_key: Option<String>,
}
