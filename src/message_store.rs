use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::cursor::Cursor;
use crate::error::CoreError;
use crate::identity;
use crate::models::{Attachment, Message, MessagePage, MessageType, SearchHit};
use crate::thread_store;

const MAX_CONTENT_LEN: usize = 10_000;

const MESSAGE_COLUMNS: &str =
    "id, thread_key, sender_id, receiver_id, content, message_type, ts, seq, is_read, attachments_json";

#[derive(Debug, Clone)]
pub struct AppendRequest<'a> {
    pub thread_key: &'a str,
    pub sender_id: &'a str,
    pub receiver_id: &'a str,
    pub content: &'a str,
    pub message_type: MessageType,
    pub attachments: &'a [Attachment],
    /// Client-generated idempotency key. A retry after an ambiguous timeout
    /// with the same id returns the already-appended message instead of
    /// inserting a duplicate.
    pub client_message_id: Option<&'a str>,
    pub now_ms: i64,
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let type_str: String = row.get(5)?;
    let message_type = MessageType::parse(&type_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("unknown message type: {type_str}").into(),
        )
    })?;
    let attachments_json: Option<String> = row.get(9)?;
    let attachments: Vec<Attachment> = match attachments_json {
        Some(json) => serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?,
        None => Vec::new(),
    };
    Ok(Message {
        id: row.get(0)?,
        thread_key: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        content: row.get(4)?,
        message_type,
        ts: row.get(6)?,
        seq: row.get(7)?,
        is_read: row.get::<_, i64>(8)? != 0,
        attachments,
    })
}

/// Appends one message to a thread's log. The store assigns `(ts, seq)` under
/// an immediate transaction: `seq` comes from the per-thread counter on the
/// thread row and `ts` is clamped to never run backwards, so ordering within
/// the thread is strictly monotonic even with concurrent senders. The summary
/// update and unread increment commit atomically with the insert.
pub fn append(conn: &Connection, req: &AppendRequest<'_>) -> Result<Message, CoreError> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(CoreError::Validation("message content is empty".to_string()));
    }
    if content.len() > MAX_CONTENT_LEN {
        return Err(CoreError::Validation("message content too long".to_string()));
    }
    identity::validate_user_id(req.sender_id)?;
    identity::validate_user_id(req.receiver_id)?;
    if req.sender_id == req.receiver_id {
        return Err(CoreError::Validation(
            "sender and receiver must differ".to_string(),
        ));
    }
    for attachment in req.attachments {
        if attachment.filename.trim().is_empty() || attachment.url.trim().is_empty() {
            return Err(CoreError::Validation(
                "attachment filename and url are required".to_string(),
            ));
        }
    }
    let id = match req.client_message_id {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        Some(_) => {
            return Err(CoreError::Validation("client message id is empty".to_string()));
        }
        None => Uuid::new_v4().to_string(),
    };

    conn.execute_batch("BEGIN IMMEDIATE;")?;
    let result = (|| -> Result<Message, CoreError> {
        let row = conn
            .query_row(
                "SELECT participant_lo, participant_hi, next_seq, COALESCE(last_message_at, 0) \
                 FROM threads WHERE thread_key = ?1;",
                params![req.thread_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let (lo, hi, seq, last_ts) =
            row.ok_or_else(|| CoreError::NotFound(format!("thread {}", req.thread_key)))?;
        let pair_matches = (req.sender_id == lo && req.receiver_id == hi)
            || (req.sender_id == hi && req.receiver_id == lo);
        if !pair_matches {
            return Err(CoreError::Forbidden(
                "sender and receiver are not the participants of this thread".to_string(),
            ));
        }
        let ts = req.now_ms.max(last_ts);
        let attachments_json = if req.attachments.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(req.attachments)
                    .map_err(|e| CoreError::Validation(format!("invalid attachments: {e}")))?,
            )
        };
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages \
             (id, thread_key, sender_id, receiver_id, content, message_type, ts, seq, is_read, attachments_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9);",
            params![
                id,
                req.thread_key,
                req.sender_id,
                req.receiver_id,
                content,
                req.message_type.as_str(),
                ts,
                seq,
                attachments_json,
            ],
        )?;
        if inserted == 0 {
            // Same idempotency key already in the log; resolved after rollback.
            return Err(CoreError::Conflict(id.clone()));
        }
        conn.execute(
            "UPDATE threads SET next_seq = next_seq + 1 WHERE thread_key = ?1;",
            params![req.thread_key],
        )?;
        conn.execute(
            "INSERT INTO message_fts (message_id, thread_key, content) VALUES (?1, ?2, ?3);",
            params![id, req.thread_key, content],
        )?;
        let message = Message {
            id: id.clone(),
            thread_key: req.thread_key.to_string(),
            sender_id: req.sender_id.to_string(),
            receiver_id: req.receiver_id.to_string(),
            content: content.to_string(),
            message_type: req.message_type,
            ts,
            seq,
            is_read: false,
            attachments: req.attachments.to_vec(),
        };
        thread_store::apply_message_event(conn, req.thread_key, &message)?;
        Ok(message)
    })();
    match result {
        Ok(message) => {
            conn.execute_batch("COMMIT;")?;
            Ok(message)
        }
        Err(CoreError::Conflict(existing_id)) => {
            let _ = conn.execute_batch("ROLLBACK;");
            let existing = get_message(conn, &existing_id)?;
            // The id is only an idempotency key for the message it originally
            // named. A reused id from some other conversation or sender must
            // not hand that row back to this caller.
            if existing.thread_key != req.thread_key || existing.sender_id != req.sender_id {
                return Err(CoreError::Forbidden(
                    "client message id belongs to a different message".to_string(),
                ));
            }
            Ok(existing)
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

pub fn get_message(conn: &Connection, message_id: &str) -> Result<Message, CoreError> {
    let message = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1;"),
            params![message_id],
            message_from_row,
        )
        .optional()?;
    message.ok_or_else(|| CoreError::NotFound(format!("message {message_id}")))
}

/// Messages strictly after `after`, ascending by `(ts, seq)`. The bound is
/// exclusive, so advancing cursors never duplicate or skip a message even as
/// new messages are appended concurrently.
pub fn list_messages(
    conn: &Connection,
    thread_key: &str,
    after: Option<&Cursor>,
    limit: i64,
) -> Result<MessagePage, CoreError> {
    if !thread_store::thread_exists(conn, thread_key)? {
        return Err(CoreError::NotFound(format!("thread {thread_key}")));
    }
    let messages = match after {
        Some(cursor) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE thread_key = ?1 AND (ts > ?2 OR (ts = ?2 AND seq > ?3)) \
                 ORDER BY ts ASC, seq ASC \
                 LIMIT ?4;"
            ))?;
            let rows = stmt.query_map(
                params![thread_key, cursor.ts, cursor.seq, limit],
                message_from_row,
            )?;
            rows.filter_map(Result::ok).collect::<Vec<_>>()
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE thread_key = ?1 \
                 ORDER BY ts ASC, seq ASC \
                 LIMIT ?2;"
            ))?;
            let rows = stmt.query_map(params![thread_key, limit], message_from_row)?;
            rows.filter_map(Result::ok).collect::<Vec<_>>()
        }
    };
    let next_cursor = messages
        .last()
        .map(|m| Cursor::for_message(m).encode());
    Ok(MessagePage {
        messages,
        next_cursor,
    })
}

/// Backward page for "load earlier": messages strictly before `before`,
/// fetched newest-first and returned ascending. Without a bound, this is the
/// newest page of the thread. `next_cursor` points at the oldest returned
/// message for further backward paging.
pub fn list_messages_before(
    conn: &Connection,
    thread_key: &str,
    before: Option<&Cursor>,
    limit: i64,
) -> Result<MessagePage, CoreError> {
    if !thread_store::thread_exists(conn, thread_key)? {
        return Err(CoreError::NotFound(format!("thread {thread_key}")));
    }
    let mut messages = match before {
        Some(cursor) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE thread_key = ?1 AND (ts < ?2 OR (ts = ?2 AND seq < ?3)) \
                 ORDER BY ts DESC, seq DESC \
                 LIMIT ?4;"
            ))?;
            let rows = stmt.query_map(
                params![thread_key, cursor.ts, cursor.seq, limit],
                message_from_row,
            )?;
            rows.filter_map(Result::ok).collect::<Vec<_>>()
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE thread_key = ?1 \
                 ORDER BY ts DESC, seq DESC \
                 LIMIT ?2;"
            ))?;
            let rows = stmt.query_map(params![thread_key, limit], message_from_row)?;
            rows.filter_map(Result::ok).collect::<Vec<_>>()
        }
    };
    messages.reverse();
    let next_cursor = messages
        .first()
        .map(|m| Cursor::for_message(m).encode());
    Ok(MessagePage {
        messages,
        next_cursor,
    })
}

/// Full-text search over message content, scoped to threads the caller can
/// see, ranked by bm25.
pub fn search_messages(
    conn: &Connection,
    user_id: &str,
    query: &str,
    thread_key: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<SearchHit>, CoreError> {
    let match_expr = fts_query(query)?;
    let mut stmt = conn.prepare(
        "SELECT m.id, m.thread_key, m.sender_id, m.receiver_id, m.content, m.message_type, \
                m.ts, m.seq, m.is_read, m.attachments_json, bm25(message_fts) AS rank \
         FROM message_fts \
         JOIN messages m ON m.id = message_fts.message_id \
         JOIN threads t ON t.thread_key = m.thread_key \
         WHERE message_fts MATCH ?1 \
           AND (?2 IS NULL OR m.thread_key = ?2) \
           AND ((t.participant_lo = ?3 AND t.hidden_lo = 0) \
             OR (t.participant_hi = ?3 AND t.hidden_hi = 0)) \
         ORDER BY rank \
         LIMIT ?4 OFFSET ?5;",
    )?;
    let rows = stmt.query_map(
        params![match_expr, thread_key, user_id, limit, offset],
        |row| {
            let message = message_from_row(row)?;
            Ok(SearchHit {
                message,
                rank: row.get(10)?,
            })
        },
    )?;
    Ok(rows.filter_map(Result::ok).collect())
}

// Quotes each term so user input cannot inject fts5 query syntax.
fn fts_query(query: &str) -> Result<String, CoreError> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\""))
        .collect();
    if terms.is_empty() {
        return Err(CoreError::Validation("search query is empty".to_string()));
    }
    Ok(terms.join(" "))
}
