use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CoreError;
use crate::identity;
use crate::models::{LastMessage, Message, MessageType, ResolvedParticipant, Thread};

const THREAD_COLUMNS: &str = "thread_key, participant_lo, participant_hi, subject, \
     profile_lo_json, profile_hi_json, last_sender_id, last_receiver_id, last_content, \
     last_message_type, last_message_at, message_count, unread_lo, unread_hi, \
     created_at, updated_at";

#[derive(Debug, Clone)]
pub struct ThreadFilter {
    pub search: Option<String>,
    pub message_type: Option<MessageType>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ThreadFilter {
    fn default() -> Self {
        Self {
            search: None,
            message_type: None,
            limit: 50,
            offset: 0,
        }
    }
}

fn thread_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    let profile_lo_json: String = row.get(4)?;
    let profile_hi_json: String = row.get(5)?;
    let profile_lo: ResolvedParticipant = serde_json::from_str(&profile_lo_json)
        .map_err(|e| conversion_err(4, Box::new(e)))?;
    let profile_hi: ResolvedParticipant = serde_json::from_str(&profile_hi_json)
        .map_err(|e| conversion_err(5, Box::new(e)))?;

    let last_sender_id: Option<String> = row.get(6)?;
    let last_message = match last_sender_id {
        Some(sender_id) => {
            let type_str: String = row.get(9)?;
            let message_type = MessageType::parse(&type_str)
                .ok_or_else(|| conversion_err(9, format!("unknown message type: {type_str}").into()))?;
            Some(LastMessage {
                sender_id,
                receiver_id: row.get(7)?,
                content: row.get(8)?,
                message_type,
                ts: row.get(10)?,
            })
        }
        None => None,
    };

    Ok(Thread {
        thread_key: row.get(0)?,
        participant_lo: row.get(1)?,
        participant_hi: row.get(2)?,
        subject: row.get(3)?,
        profile_lo,
        profile_hi,
        last_message,
        message_count: row.get(11)?,
        unread_lo: row.get(12)?,
        unread_hi: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn conversion_err(
    idx: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err)
}

/// Creates the thread for a participant pair if absent, via a conditional
/// insert keyed on `thread_key`. When two first-contact requests race, exactly
/// one insert takes effect; the loser's call reads the winner's row and
/// proceeds as if the thread already existed. Subject is immutable after
/// creation, so a later first-contact-like message never rewrites it.
pub fn ensure_thread(
    conn: &Connection,
    thread_key: &str,
    lo: &ResolvedParticipant,
    hi: &ResolvedParticipant,
    subject: Option<&str>,
    now_ms: i64,
) -> Result<Thread, CoreError> {
    identity::validate_user_id(&lo.user_id)?;
    identity::validate_user_id(&hi.user_id)?;
    if lo.user_id >= hi.user_id {
        return Err(CoreError::Validation(
            "participants must be distinct and in canonical order".to_string(),
        ));
    }
    let profile_lo = serde_json::to_string(lo)
        .map_err(|e| CoreError::Validation(format!("invalid participant profile: {e}")))?;
    let profile_hi = serde_json::to_string(hi)
        .map_err(|e| CoreError::Validation(format!("invalid participant profile: {e}")))?;
    conn.execute(
        "INSERT OR IGNORE INTO threads \
         (thread_key, participant_lo, participant_hi, subject, profile_lo_json, profile_hi_json, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7);",
        params![thread_key, lo.user_id, hi.user_id, subject, profile_lo, profile_hi, now_ms],
    )?;
    get_thread(conn, thread_key)
}

pub fn get_thread(conn: &Connection, thread_key: &str) -> Result<Thread, CoreError> {
    let thread = conn
        .query_row(
            &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE thread_key = ?1;"),
            params![thread_key],
            thread_from_row,
        )
        .optional()?;
    thread.ok_or_else(|| CoreError::NotFound(format!("thread {thread_key}")))
}

pub fn thread_exists(conn: &Connection, thread_key: &str) -> Result<bool, CoreError> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM threads WHERE thread_key = ?1 LIMIT 1;",
            params![thread_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(exists.is_some())
}

/// Folds one appended message into the thread's summary state: message count,
/// last-message snapshot, sort timestamp, and the receiver's unread counter,
/// all in a single UPDATE so concurrent events never lose a count to a stale
/// read-modify-write. A new message also resurfaces the thread for a
/// participant who had soft-deleted it.
pub fn apply_message_event(
    conn: &Connection,
    thread_key: &str,
    message: &Message,
) -> Result<(), CoreError> {
    let updated = conn.execute(
        "UPDATE threads SET \
           message_count = message_count + 1, \
           last_sender_id = ?2, \
           last_receiver_id = ?3, \
           last_content = ?4, \
           last_message_type = ?5, \
           last_message_at = ?6, \
           updated_at = ?6, \
           unread_lo = unread_lo + CASE WHEN participant_lo = ?3 THEN 1 ELSE 0 END, \
           unread_hi = unread_hi + CASE WHEN participant_hi = ?3 THEN 1 ELSE 0 END, \
           hidden_lo = 0, \
           hidden_hi = 0 \
         WHERE thread_key = ?1;",
        params![
            thread_key,
            message.sender_id,
            message.receiver_id,
            message.content,
            message.message_type.as_str(),
            message.ts,
        ],
    )?;
    if updated == 0 {
        return Err(CoreError::NotFound(format!("thread {thread_key}")));
    }
    Ok(())
}

/// Resets the caller's unread counter to zero and acknowledges their unread
/// messages. Idempotent; there are no partial-read semantics.
pub fn mark_read(conn: &Connection, thread_key: &str, user_id: &str) -> Result<(), CoreError> {
    let (lo, hi) = participants(conn, thread_key)?;
    if user_id != lo && user_id != hi {
        return Err(CoreError::Forbidden(format!(
            "{user_id} is not a participant of this thread"
        )));
    }
    conn.execute_batch("BEGIN;")?;
    let result = (|| -> Result<(), CoreError> {
        conn.execute(
            "UPDATE threads SET \
               unread_lo = CASE WHEN participant_lo = ?2 THEN 0 ELSE unread_lo END, \
               unread_hi = CASE WHEN participant_hi = ?2 THEN 0 ELSE unread_hi END \
             WHERE thread_key = ?1;",
            params![thread_key, user_id],
        )?;
        conn.execute(
            "UPDATE messages SET is_read = 1 \
             WHERE thread_key = ?1 AND receiver_id = ?2 AND is_read = 0;",
            params![thread_key, user_id],
        )?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")?;
            Ok(())
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

/// Threads visible to a user, newest activity first. `search` matches the
/// subject and last-message content; `message_type` filters on the last
/// message's type. The result is a finite, re-queryable page, not a stream.
pub fn list_threads(
    conn: &Connection,
    user_id: &str,
    filter: &ThreadFilter,
) -> Result<Vec<Thread>, CoreError> {
    let mut where_clauses = vec![
        "((participant_lo = ?1 AND hidden_lo = 0) OR (participant_hi = ?1 AND hidden_hi = 0))"
            .to_string(),
    ];
    let mut params_vec: Vec<Value> = vec![user_id.to_string().into()];
    let mut next_idx = 2;

    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        where_clauses.push(format!(
            "(subject LIKE ?{n} ESCAPE '\\' OR last_content LIKE ?{n} ESCAPE '\\')",
            n = next_idx
        ));
        params_vec.push(format!("%{}%", escape_like(search)).into());
        next_idx += 1;
    }
    if let Some(message_type) = filter.message_type {
        where_clauses.push(format!("last_message_type = ?{next_idx}"));
        params_vec.push(message_type.as_str().to_string().into());
        next_idx += 1;
    }

    let sql = format!(
        "SELECT {THREAD_COLUMNS} FROM threads \
         WHERE {} \
         ORDER BY updated_at DESC, thread_key ASC \
         LIMIT ?{} OFFSET ?{};",
        where_clauses.join(" AND "),
        next_idx,
        next_idx + 1
    );
    params_vec.push(filter.limit.into());
    params_vec.push(filter.offset.into());

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params_vec), thread_from_row)?;
    Ok(rows.filter_map(Result::ok).collect())
}

/// Soft-removes the thread from one participant's view. The shared record and
/// its messages stay intact for the other participant.
pub fn delete_thread(conn: &Connection, thread_key: &str, user_id: &str) -> Result<(), CoreError> {
    let (lo, hi) = participants(conn, thread_key)?;
    if user_id != lo && user_id != hi {
        return Err(CoreError::Forbidden(format!(
            "{user_id} is not a participant of this thread"
        )));
    }
    conn.execute(
        "UPDATE threads SET \
           hidden_lo = CASE WHEN participant_lo = ?2 THEN 1 ELSE hidden_lo END, \
           hidden_hi = CASE WHEN participant_hi = ?2 THEN 1 ELSE hidden_hi END \
         WHERE thread_key = ?1;",
        params![thread_key, user_id],
    )?;
    Ok(())
}

/// Derived process-wide unread total: the number of visible threads carrying
/// at least one unread message for the user. Never stored.
pub fn unread_thread_count(conn: &Connection, user_id: &str) -> Result<i64, CoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(1) FROM threads \
         WHERE (participant_lo = ?1 AND unread_lo > 0 AND hidden_lo = 0) \
            OR (participant_hi = ?1 AND unread_hi > 0 AND hidden_hi = 0);",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

fn participants(conn: &Connection, thread_key: &str) -> Result<(String, String), CoreError> {
    let pair = conn
        .query_row(
            "SELECT participant_lo, participant_hi FROM threads WHERE thread_key = ?1;",
            params![thread_key],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    pair.ok_or_else(|| CoreError::NotFound(format!("thread {thread_key}")))
}

fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
