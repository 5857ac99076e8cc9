use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::cursor::Cursor;
use crate::error::CoreError;
use crate::models::{Message, MessagePage, MessageType, Thread};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MESSAGE_PAGE_LIMIT: i64 = 100;
const MAX_BACKOFF_EXP: u32 = 6;
const FAILURES_BEFORE_UNAVAILABLE: u32 = 3;

/// Server side of the polling loop. Implementations carry their own request
/// timeouts; a timed-out call must return an error (it is treated as failed,
/// never assumed to have succeeded — the idempotency key on send keeps an
/// ambiguous retry duplicate-safe).
pub trait SyncSource: Send + 'static {
    fn fetch_threads(&self, user_id: &str) -> Result<Vec<Thread>, CoreError>;
    fn fetch_messages(
        &self,
        thread_key: &str,
        after: Option<Cursor>,
        limit: i64,
    ) -> Result<MessagePage, CoreError>;
    fn send_message(&self, outgoing: &OutgoingMessage) -> Result<Message, CoreError>;
    fn mark_read(&self, thread_key: &str, user_id: &str) -> Result<(), CoreError>;
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub thread_key: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub client_message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Polling,
    Reconciling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Ok,
    /// Polls are failing and being retried with backoff.
    Degraded {
        failures: u32,
    },
    /// Retries exhausted; surfaced to the user with a manual retry
    /// affordance (`poll_now`).
    Unavailable,
}

enum Control {
    PollNow,
    Op(ClientOp),
    Stop,
}

enum ClientOp {
    MarkRead { thread_key: String },
    Send { outgoing: OutgoingMessage },
}

#[derive(Default)]
struct ClientState {
    threads: HashMap<String, Thread>,
    messages: HashMap<String, BTreeMap<(i64, i64), Message>>,
    cursors: HashMap<String, Cursor>,
    /// Threads with an optimistic unread=0 overlay awaiting confirmation.
    read_overlay: HashSet<String>,
    /// Optimistic sends keyed by client message id, in enqueue order.
    pending_sends: HashMap<String, Message>,
    pending_order: Vec<String>,
    phase: SyncPhase,
    status: SyncStatus,
    last_error: Option<String>,
}

/// Client-side cache of thread and message state, kept fresh by a polling
/// worker and layered with short-lived optimistic overlays. Authoritative
/// data always comes from the source; overlays are cleared on confirmed
/// success or rolled back on failure, never left dangling.
pub struct SyncClient {
    user_id: String,
    state: Arc<Mutex<ClientState>>,
    tx: mpsc::Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn start<S: SyncSource>(
        source: S,
        user_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        let user_id = user_id.into();
        let state = Arc::new(Mutex::new(ClientState::default()));
        let (tx, rx) = mpsc::channel();
        let worker_state = Arc::clone(&state);
        let worker_user = user_id.clone();
        let handle = thread::spawn(move || {
            run_worker(source, worker_user, interval, worker_state, rx);
        });
        Self {
            user_id,
            state,
            tx,
            handle: Some(handle),
        }
    }

    /// Manual refresh; also the retry affordance once status is Unavailable.
    pub fn poll_now(&self) {
        let _ = self.tx.send(Control::PollNow);
    }

    /// Optimistically zeroes the thread's unread count and enqueues the
    /// acknowledgement. A failed request rolls the overlay back, restoring
    /// the previously known count exactly.
    pub fn mark_read(&self, thread_key: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.read_overlay.insert(thread_key.to_string());
        }
        let _ = self.tx.send(Control::Op(ClientOp::MarkRead {
            thread_key: thread_key.to_string(),
        }));
    }

    /// Optimistically appends an outgoing message to the local view and
    /// enqueues the send. Returns the client message id, which doubles as the
    /// idempotency key on the wire.
    pub fn send(
        &self,
        thread_key: &str,
        receiver_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> String {
        let client_message_id = Uuid::new_v4().to_string();
        let optimistic = Message {
            id: client_message_id.clone(),
            thread_key: thread_key.to_string(),
            sender_id: self.user_id.clone(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            message_type,
            ts: Utc::now().timestamp_millis(),
            seq: 0,
            is_read: false,
            attachments: Vec::new(),
        };
        if let Ok(mut state) = self.state.lock() {
            state
                .pending_sends
                .insert(client_message_id.clone(), optimistic);
            state.pending_order.push(client_message_id.clone());
        }
        let _ = self.tx.send(Control::Op(ClientOp::Send {
            outgoing: OutgoingMessage {
                thread_key: thread_key.to_string(),
                sender_id: self.user_id.clone(),
                receiver_id: receiver_id.to_string(),
                content: content.to_string(),
                message_type,
                client_message_id: client_message_id.clone(),
            },
        }));
        client_message_id
    }

    /// Thread list as last reconciled, newest activity first, with optimistic
    /// read overlays applied.
    pub fn threads(&self) -> Vec<Thread> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut threads: Vec<Thread> = state
            .threads
            .values()
            .map(|thread| {
                if state.read_overlay.contains(&thread.thread_key) {
                    let mut overlaid = thread.clone();
                    if overlaid.participant_lo == self.user_id {
                        overlaid.unread_lo = 0;
                    } else if overlaid.participant_hi == self.user_id {
                        overlaid.unread_hi = 0;
                    }
                    overlaid
                } else {
                    thread.clone()
                }
            })
            .collect();
        threads.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.thread_key.cmp(&b.thread_key))
        });
        threads
    }

    /// Messages of one thread in log order, with unconfirmed optimistic sends
    /// appended after the authoritative tail.
    pub fn messages(&self, thread_key: &str) -> Vec<Message> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let mut messages: Vec<Message> = state
            .messages
            .get(thread_key)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default();
        for client_id in &state.pending_order {
            if let Some(pending) = state.pending_sends.get(client_id) {
                if pending.thread_key == thread_key {
                    messages.push(pending.clone());
                }
            }
        }
        messages
    }

    pub fn status(&self) -> SyncStatus {
        self.state
            .lock()
            .map(|state| state.status)
            .unwrap_or(SyncStatus::Unavailable)
    }

    pub fn phase(&self) -> SyncPhase {
        self.state
            .lock()
            .map(|state| state.phase)
            .unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.last_error.clone())
    }

    /// Stops the polling worker and waits for it to exit. No timers survive
    /// the client.
    pub fn stop(&mut self) {
        let _ = self.tx.send(Control::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker<S: SyncSource>(
    source: S,
    user_id: String,
    interval: Duration,
    state: Arc<Mutex<ClientState>>,
    rx: mpsc::Receiver<Control>,
) {
    let mut failures: u32 = 0;
    let mut delay = interval;
    loop {
        match rx.recv_timeout(delay) {
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Control::Op(op)) => {
                handle_op(&source, &user_id, &state, op);
                continue;
            }
            Ok(Control::PollNow) | Err(RecvTimeoutError::Timeout) => {}
        }
        // Stacked manual refreshes coalesce into one cycle; queued operations
        // still run first so their effects are in the poll they triggered.
        let mut stopping = false;
        loop {
            match rx.try_recv() {
                Ok(Control::PollNow) => {}
                Ok(Control::Op(op)) => handle_op(&source, &user_id, &state, op),
                Ok(Control::Stop) | Err(TryRecvError::Disconnected) => {
                    stopping = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        if stopping {
            break;
        }
        match poll_once(&source, &user_id, &state) {
            Ok(()) => {
                failures = 0;
                delay = interval;
                with_state(&state, |s| {
                    s.status = SyncStatus::Ok;
                    s.phase = SyncPhase::Idle;
                    s.last_error = None;
                });
            }
            Err(err) => {
                failures += 1;
                let exp = failures.min(MAX_BACKOFF_EXP);
                delay = interval.saturating_mul(1u32 << exp);
                let status = if failures >= FAILURES_BEFORE_UNAVAILABLE {
                    SyncStatus::Unavailable
                } else {
                    SyncStatus::Degraded { failures }
                };
                with_state(&state, |s| {
                    s.status = status;
                    s.phase = SyncPhase::Idle;
                    s.last_error = Some(err.to_string());
                });
            }
        }
    }
}

/// One poll cycle: fetch the thread list, then any new messages past each
/// thread's cursor, and merge by key. Records are merged, never replaced
/// wholesale, so in-flight optimistic overlays stay intact.
fn poll_once<S: SyncSource>(
    source: &S,
    user_id: &str,
    state: &Arc<Mutex<ClientState>>,
) -> Result<(), CoreError> {
    with_state(state, |s| s.phase = SyncPhase::Polling);
    let threads = source.fetch_threads(user_id)?;

    let mut fetched: Vec<(String, MessagePage)> = Vec::with_capacity(threads.len());
    for thread in &threads {
        let after = {
            let Ok(guard) = state.lock() else {
                return Err(CoreError::Unavailable("client state poisoned".to_string()));
            };
            guard.cursors.get(&thread.thread_key).copied()
        };
        let page = source.fetch_messages(&thread.thread_key, after, MESSAGE_PAGE_LIMIT)?;
        fetched.push((thread.thread_key.clone(), page));
    }

    with_state(state, |s| {
        s.phase = SyncPhase::Reconciling;
        for thread in threads {
            s.threads.insert(thread.thread_key.clone(), thread);
        }
        for (thread_key, page) in fetched {
            let log = s.messages.entry(thread_key.clone()).or_default();
            for message in page.messages {
                log.insert((message.ts, message.seq), message);
            }
            if let Some(token) = page.next_cursor {
                if let Ok(cursor) = Cursor::parse(&token) {
                    s.cursors.insert(thread_key, cursor);
                }
            }
        }
    });
    Ok(())
}

fn handle_op<S: SyncSource>(
    source: &S,
    user_id: &str,
    state: &Arc<Mutex<ClientState>>,
    op: ClientOp,
) {
    match op {
        ClientOp::MarkRead { thread_key } => match source.mark_read(&thread_key, user_id) {
            Ok(()) => {
                with_state(state, |s| {
                    s.read_overlay.remove(&thread_key);
                    // Confirmed: fold the acknowledged count into the cache so
                    // the list stays at zero until the next poll.
                    if let Some(thread) = s.threads.get_mut(&thread_key) {
                        if thread.participant_lo == user_id {
                            thread.unread_lo = 0;
                        } else if thread.participant_hi == user_id {
                            thread.unread_hi = 0;
                        }
                    }
                });
            }
            Err(err) => {
                with_state(state, |s| {
                    // Rollback: dropping the overlay re-exposes the prior
                    // authoritative count unchanged.
                    s.read_overlay.remove(&thread_key);
                    s.last_error = Some(err.to_string());
                });
            }
        },
        ClientOp::Send { outgoing } => match source.send_message(&outgoing) {
            Ok(confirmed) => {
                with_state(state, |s| {
                    s.pending_sends.remove(&outgoing.client_message_id);
                    s.pending_order
                        .retain(|id| id != &outgoing.client_message_id);
                    // The confirmed message is merged by key. The poll cursor
                    // is deliberately not advanced past it: a peer message
                    // appended just before ours may still be unfetched, and
                    // skipping the range would lose it.
                    let log = s.messages.entry(confirmed.thread_key.clone()).or_default();
                    log.insert((confirmed.ts, confirmed.seq), confirmed);
                });
            }
            Err(err) => {
                with_state(state, |s| {
                    s.pending_sends.remove(&outgoing.client_message_id);
                    s.pending_order
                        .retain(|id| id != &outgoing.client_message_id);
                    s.last_error = Some(err.to_string());
                });
            }
        },
    }
}

fn with_state<T>(state: &Arc<Mutex<ClientState>>, f: impl FnOnce(&mut ClientState) -> T) -> Option<T> {
    state.lock().ok().map(|mut guard| f(&mut guard))
}
