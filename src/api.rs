use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::cursor::Cursor;
use crate::db::{self, MessageDb};
use crate::diagnostics;
use crate::error::CoreError;
use crate::identity;
use crate::message_store::{self, AppendRequest};
use crate::models::{
    Attachment, Message, MessagePage, MessageType, ResolvedParticipant, SearchHit, ThreadProbe,
    ThreadView,
};
use crate::sync::{OutgoingMessage, SyncSource};
use crate::thread_store::{self, ThreadFilter};

const ENSURE_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const MAX_PAGE_LIMIT: i64 = 200;

/// Authenticated caller identity, injected by the external auth collaborator.
/// The core trusts only this; a client-supplied sender id is never honored.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub display_name: String,
}

/// External profile collaborator. Resolves a participant's display identity
/// once, at thread creation, so renders never re-derive names ad hoc.
pub trait ProfileResolver: Send + Sync {
    fn resolve(&self, user_id: &str) -> Result<ResolvedParticipant, CoreError>;
}

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub recipient_id: String,
    pub subject: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    pub attachments: Vec<Attachment>,
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub thread_key: String,
    pub content: String,
    pub message_type: MessageType,
    pub attachments: Vec<Attachment>,
    pub client_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub thread_key: String,
    pub message_id: String,
}

/// Request surface of the messaging core. Owns the store connection behind a
/// mutex; every operation is scoped to the authenticated caller.
pub struct Messaging {
    db: Mutex<MessageDb>,
    profiles: Box<dyn ProfileResolver>,
    log_dir: Option<PathBuf>,
}

impl Messaging {
    pub fn open(
        path: impl AsRef<Path>,
        profiles: Box<dyn ProfileResolver>,
        log_dir: Option<PathBuf>,
    ) -> Result<Self, CoreError> {
        let store = db::open_store(path).map_err(CoreError::into_public)?;
        Ok(Self {
            db: Mutex::new(store),
            profiles,
            log_dir,
        })
    }

    pub fn in_memory(profiles: Box<dyn ProfileResolver>) -> Result<Self, CoreError> {
        let store = db::open_in_memory().map_err(CoreError::into_public)?;
        Ok(Self {
            db: Mutex::new(store),
            profiles,
            log_dir: None,
        })
    }

    fn with_db<T>(&self, f: impl FnOnce(&MessageDb) -> Result<T, CoreError>) -> Result<T, CoreError> {
        let guard = self
            .db
            .lock()
            .map_err(|_| CoreError::Unavailable("store lock poisoned".to_string()))?;
        f(&guard)
    }

    fn log_error(&self, op: &str, err: &CoreError) {
        if let Some(log_dir) = self.log_dir.as_ref() {
            let _ = diagnostics::log_event(log_dir, "query_error", &format!("{op} failed: {err}"));
        }
    }

    fn caller_profile(&self, caller: &Caller) -> ResolvedParticipant {
        self.profiles
            .resolve(&caller.user_id)
            .unwrap_or_else(|_| ResolvedParticipant {
                user_id: caller.user_id.clone(),
                name: caller.display_name.clone(),
                avatar: None,
                user_type: None,
            })
    }

    /// First contact (or continued contact) with a recipient: ensures the
    /// pair's thread exists and appends the message to it. The conditional
    /// create makes the racing case converge on a single thread; the losing
    /// request attaches its message to the winner's thread.
    pub fn send_message(
        &self,
        caller: &Caller,
        req: &SendMessageRequest,
    ) -> Result<SendReceipt, CoreError> {
        let result = (|| -> Result<SendReceipt, CoreError> {
            let thread_key = identity::resolve(&caller.user_id, &req.recipient_id)?;
            let sender_profile = self.caller_profile(caller);
            let recipient_profile = self.profiles.resolve(&req.recipient_id)?;
            let (lo, hi) = if caller.user_id < req.recipient_id {
                (&sender_profile, &recipient_profile)
            } else {
                (&recipient_profile, &sender_profile)
            };
            let client_id = req
                .client_message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let subject = req.subject.as_deref().map(str::trim).filter(|s| !s.is_empty());
            let message = self.with_db(|store| {
                retry_unavailable(|| {
                    let now_ms = Utc::now().timestamp_millis();
                    thread_store::ensure_thread(&store.conn, &thread_key, lo, hi, subject, now_ms)?;
                    message_store::append(
                        &store.conn,
                        &AppendRequest {
                            thread_key: &thread_key,
                            sender_id: &caller.user_id,
                            receiver_id: &req.recipient_id,
                            content: &req.content,
                            message_type: req.message_type,
                            attachments: &req.attachments,
                            client_message_id: Some(&client_id),
                            now_ms,
                        },
                    )
                })
            })?;
            Ok(SendReceipt {
                thread_key,
                message_id: message.id,
            })
        })()
        .map_err(CoreError::into_public);
        if let Err(ref err) = result {
            self.log_error("send_message", err);
        }
        result
    }

    /// Appends to an existing thread the caller participates in.
    pub fn reply(&self, caller: &Caller, req: &ReplyRequest) -> Result<Message, CoreError> {
        let result = (|| -> Result<Message, CoreError> {
            let client_id = req
                .client_message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            self.with_db(|store| {
                let thread = thread_store::get_thread(&store.conn, &req.thread_key)?;
                let receiver = thread
                    .other_participant(&caller.user_id)
                    .ok_or_else(|| {
                        CoreError::Forbidden(format!(
                            "{} is not a participant of this thread",
                            caller.user_id
                        ))
                    })?
                    .to_string();
                retry_unavailable(|| {
                    message_store::append(
                        &store.conn,
                        &AppendRequest {
                            thread_key: &req.thread_key,
                            sender_id: &caller.user_id,
                            receiver_id: &receiver,
                            content: &req.content,
                            message_type: req.message_type,
                            attachments: &req.attachments,
                            client_message_id: Some(&client_id),
                            now_ms: Utc::now().timestamp_millis(),
                        },
                    )
                })
            })
        })()
        .map_err(CoreError::into_public);
        if let Err(ref err) = result {
            self.log_error("reply", err);
        }
        result
    }

    /// Caller's thread list, newest activity first, projected to the caller's
    /// side (counter-party profile, caller's unread count).
    pub fn list_threads(
        &self,
        caller: &Caller,
        filter: &ThreadFilter,
    ) -> Result<Vec<ThreadView>, CoreError> {
        let clamped = ThreadFilter {
            limit: filter.limit.clamp(1, MAX_PAGE_LIMIT),
            offset: filter.offset.max(0),
            ..filter.clone()
        };
        let result = self
            .with_db(|store| thread_store::list_threads(&store.conn, &caller.user_id, &clamped))
            .map(|threads| {
                threads
                    .iter()
                    .filter_map(|thread| thread.view_for(&caller.user_id))
                    .collect()
            })
            .map_err(CoreError::into_public);
        if let Err(ref err) = result {
            self.log_error("list_threads", err);
        }
        result
    }

    /// One ascending page of a thread's log, bounded below by an opaque
    /// cursor token.
    pub fn list_messages(
        &self,
        caller: &Caller,
        thread_key: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<MessagePage, CoreError> {
        let result = (|| -> Result<MessagePage, CoreError> {
            let cursor = after.map(Cursor::parse).transpose()?;
            self.with_db(|store| {
                let thread = thread_store::get_thread(&store.conn, thread_key)?;
                if !thread.is_participant(&caller.user_id) {
                    return Err(CoreError::Forbidden(format!(
                        "{} is not a participant of this thread",
                        caller.user_id
                    )));
                }
                message_store::list_messages(
                    &store.conn,
                    thread_key,
                    cursor.as_ref(),
                    limit.clamp(1, MAX_PAGE_LIMIT),
                )
            })
        })()
        .map_err(CoreError::into_public);
        if let Err(ref err) = result {
            self.log_error("list_messages", err);
        }
        result
    }

    /// Backward page for "load earlier" history.
    pub fn list_messages_before(
        &self,
        caller: &Caller,
        thread_key: &str,
        before: Option<&str>,
        limit: i64,
    ) -> Result<MessagePage, CoreError> {
        let result = (|| -> Result<MessagePage, CoreError> {
            let cursor = before.map(Cursor::parse).transpose()?;
            self.with_db(|store| {
                let thread = thread_store::get_thread(&store.conn, thread_key)?;
                if !thread.is_participant(&caller.user_id) {
                    return Err(CoreError::Forbidden(format!(
                        "{} is not a participant of this thread",
                        caller.user_id
                    )));
                }
                message_store::list_messages_before(
                    &store.conn,
                    thread_key,
                    cursor.as_ref(),
                    limit.clamp(1, MAX_PAGE_LIMIT),
                )
            })
        })()
        .map_err(CoreError::into_public);
        if let Err(ref err) = result {
            self.log_error("list_messages_before", err);
        }
        result
    }

    pub fn mark_thread_read(&self, caller: &Caller, thread_key: &str) -> Result<(), CoreError> {
        let result = self
            .with_db(|store| {
                retry_unavailable(|| thread_store::mark_read(&store.conn, thread_key, &caller.user_id))
            })
            .map_err(CoreError::into_public);
        if let Err(ref err) = result {
            self.log_error("mark_thread_read", err);
        }
        result
    }

    pub fn delete_thread(&self, caller: &Caller, thread_key: &str) -> Result<(), CoreError> {
        let result = self
            .with_db(|store| {
                retry_unavailable(|| {
                    thread_store::delete_thread(&store.conn, thread_key, &caller.user_id)
                })
            })
            .map_err(CoreError::into_public);
        if let Err(ref err) = result {
            self.log_error("delete_thread", err);
        }
        result
    }

    /// Whether a conversation with the other user already exists, so the UI
    /// can offer "continue" instead of "start". A thread the caller soft
    /// deleted still exists; a new message would resurface it.
    pub fn thread_with(&self, caller: &Caller, other_user_id: &str) -> Result<ThreadProbe, CoreError> {
        let result = (|| -> Result<ThreadProbe, CoreError> {
            let thread_key = identity::resolve(&caller.user_id, other_user_id)?;
            let exists = self.with_db(|store| thread_store::thread_exists(&store.conn, &thread_key))?;
            Ok(ThreadProbe {
                exists,
                thread_key: exists.then_some(thread_key),
            })
        })()
        .map_err(CoreError::into_public);
        if let Err(ref err) = result {
            self.log_error("thread_with", err);
        }
        result
    }

    /// Full-text search across the caller's conversations.
    pub fn search_messages(
        &self,
        caller: &Caller,
        query: &str,
        thread_key: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SearchHit>, CoreError> {
        let result = self
            .with_db(|store| {
                message_store::search_messages(
                    &store.conn,
                    &caller.user_id,
                    query,
                    thread_key,
                    limit.clamp(1, MAX_PAGE_LIMIT),
                    offset.max(0),
                )
            })
            .map_err(CoreError::into_public);
        if let Err(ref err) = result {
            self.log_error("search_messages", err);
        }
        result
    }

    /// Number of the caller's threads with unread messages. Derived on
    /// demand, never stored.
    pub fn unread_summary(&self, caller: &Caller) -> Result<i64, CoreError> {
        self.with_db(|store| thread_store::unread_thread_count(&store.conn, &caller.user_id))
            .map_err(CoreError::into_public)
    }

    pub(crate) fn list_thread_records(
        &self,
        caller: &Caller,
        filter: &ThreadFilter,
    ) -> Result<Vec<crate::models::Thread>, CoreError> {
        self.with_db(|store| thread_store::list_threads(&store.conn, &caller.user_id, filter))
            .map_err(CoreError::into_public)
    }
}

/// Bounded-backoff retry for transient storage failures. Non-retryable
/// errors surface immediately.
fn retry_unavailable<T>(mut f: impl FnMut() -> Result<T, CoreError>) -> Result<T, CoreError> {
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match f() {
            Err(err) if err.is_retryable() && attempt + 1 < ENSURE_RETRIES => {
                attempt += 1;
                thread::sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
}

/// In-process [`SyncSource`] over the messaging service, used when the
/// polling client and the store live in the same process.
pub struct LocalSource {
    service: Arc<Messaging>,
    caller: Caller,
}

impl LocalSource {
    pub fn new(service: Arc<Messaging>, caller: Caller) -> Self {
        Self { service, caller }
    }
}

impl SyncSource for LocalSource {
    fn fetch_threads(&self, _user_id: &str) -> Result<Vec<crate::models::Thread>, CoreError> {
        self.service
            .list_thread_records(&self.caller, &ThreadFilter::default())
    }

    fn fetch_messages(
        &self,
        thread_key: &str,
        after: Option<Cursor>,
        limit: i64,
    ) -> Result<MessagePage, CoreError> {
        let token = after.map(|c| c.encode());
        self.service
            .list_messages(&self.caller, thread_key, token.as_deref(), limit)
    }

    fn send_message(&self, outgoing: &OutgoingMessage) -> Result<Message, CoreError> {
        self.service.reply(
            &self.caller,
            &ReplyRequest {
                thread_key: outgoing.thread_key.clone(),
                content: outgoing.content.clone(),
                message_type: outgoing.message_type,
                attachments: Vec::new(),
                client_message_id: Some(outgoing.client_message_id.clone()),
            },
        )
    }

    fn mark_read(&self, thread_key: &str, _user_id: &str) -> Result<(), CoreError> {
        self.service.mark_thread_read(&self.caller, thread_key)
    }
}
