use rusqlite::Connection;

use crate::error::CoreError;
use crate::message_store;
use crate::models::Message;

/// Position in a thread's message log. Encodes the last-seen `(ts, seq)` pair
/// as an opaque token; bounds are exclusive, so pages are stable under
/// concurrent appends (new messages land beyond the window and never shift
/// already-fetched pages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    pub ts: i64,
    pub seq: i64,
}

impl Cursor {
    pub fn for_message(message: &Message) -> Self {
        Self {
            ts: message.ts,
            seq: message.seq,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}.{}", self.ts, self.seq)
    }

    pub fn parse(token: &str) -> Result<Self, CoreError> {
        let (ts, seq) = token
            .split_once('.')
            .ok_or_else(|| CoreError::Validation(format!("malformed cursor: {token}")))?;
        let ts = ts
            .parse::<i64>()
            .map_err(|_| CoreError::Validation(format!("malformed cursor: {token}")))?;
        let seq = seq
            .parse::<i64>()
            .map_err(|_| CoreError::Validation(format!("malformed cursor: {token}")))?;
        if ts < 0 || seq < 0 {
            return Err(CoreError::Validation(format!("malformed cursor: {token}")));
        }
        Ok(Self { ts, seq })
    }
}

/// Tracks the fetched range of one thread's log and translates "load earlier"
/// and "load later" into cursor-bounded store calls. Pages that jointly cover
/// the log return every message exactly once, in ascending order, regardless
/// of appends happening between page requests.
#[derive(Debug, Default)]
pub struct PageWindow {
    oldest: Option<Cursor>,
    newest: Option<Cursor>,
}

impl PageWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn oldest(&self) -> Option<Cursor> {
        self.oldest
    }

    pub fn newest(&self) -> Option<Cursor> {
        self.newest
    }

    /// Messages strictly before the oldest fetched position, ascending. The
    /// first call fetches the newest page of the thread.
    pub fn load_earlier(
        &mut self,
        conn: &Connection,
        thread_key: &str,
        limit: i64,
    ) -> Result<Vec<Message>, CoreError> {
        let page =
            message_store::list_messages_before(conn, thread_key, self.oldest.as_ref(), limit)?;
        self.record(&page.messages);
        Ok(page.messages)
    }

    /// Messages strictly after the newest fetched position, ascending.
    pub fn load_later(
        &mut self,
        conn: &Connection,
        thread_key: &str,
        limit: i64,
    ) -> Result<Vec<Message>, CoreError> {
        let page = message_store::list_messages(conn, thread_key, self.newest.as_ref(), limit)?;
        self.record(&page.messages);
        Ok(page.messages)
    }

    fn record(&mut self, messages: &[Message]) {
        for message in messages {
            let cursor = Cursor::for_message(message);
            if self.oldest.map_or(true, |oldest| cursor < oldest) {
                self.oldest = Some(cursor);
            }
            if self.newest.map_or(true, |newest| cursor > newest) {
                self.newest = Some(cursor);
            }
        }
    }
}
