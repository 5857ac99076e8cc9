use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pawpost_core::cursor::Cursor;
use pawpost_core::models::{Message, MessagePage, MessageType, ResolvedParticipant, Thread};
use pawpost_core::sync::{OutgoingMessage, SyncClient, SyncSource, SyncStatus};
use pawpost_core::CoreError;

#[derive(Default)]
struct FakeInner {
    threads: Vec<Thread>,
    messages: HashMap<String, Vec<Message>>,
    next_seq: i64,
    fail_fetch: bool,
    fail_send: bool,
    fail_mark_read: bool,
    fetch_delay: Duration,
    fetch_calls: u32,
    send_calls: u32,
    mark_read_calls: u32,
}

#[derive(Clone)]
struct FakeSource {
    inner: Arc<Mutex<FakeInner>>,
}

impl FakeSource {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeInner {
                next_seq: 1,
                ..FakeInner::default()
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeInner) -> T) -> T {
        f(&mut self.inner.lock().expect("fake lock"))
    }
}

impl SyncSource for FakeSource {
    fn fetch_threads(&self, user_id: &str) -> Result<Vec<Thread>, CoreError> {
        let delay = self.with(|inner| {
            inner.fetch_calls += 1;
            inner.fetch_delay
        });
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.with(|inner| {
            if inner.fail_fetch {
                return Err(CoreError::Unavailable("fetch down".to_string()));
            }
            Ok(inner
                .threads
                .iter()
                .filter(|t| t.is_participant(user_id))
                .cloned()
                .collect())
        })
    }

    fn fetch_messages(
        &self,
        thread_key: &str,
        after: Option<Cursor>,
        limit: i64,
    ) -> Result<MessagePage, CoreError> {
        self.with(|inner| {
            if inner.fail_fetch {
                return Err(CoreError::Unavailable("fetch down".to_string()));
            }
            let mut messages: Vec<Message> = inner
                .messages
                .get(thread_key)
                .map(|log| {
                    log.iter()
                        .filter(|m| match after {
                            Some(cursor) => {
                                m.ts > cursor.ts || (m.ts == cursor.ts && m.seq > cursor.seq)
                            }
                            None => true,
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            messages.sort_by_key(|m| (m.ts, m.seq));
            messages.truncate(limit as usize);
            let next_cursor = messages.last().map(|m| Cursor::for_message(m).encode());
            Ok(MessagePage {
                messages,
                next_cursor,
            })
        })
    }

    fn send_message(&self, outgoing: &OutgoingMessage) -> Result<Message, CoreError> {
        self.with(|inner| {
            inner.send_calls += 1;
            if inner.fail_send {
                return Err(CoreError::Unavailable("send down".to_string()));
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let confirmed = Message {
                id: format!("srv-{seq}"),
                thread_key: outgoing.thread_key.clone(),
                sender_id: outgoing.sender_id.clone(),
                receiver_id: outgoing.receiver_id.clone(),
                content: outgoing.content.clone(),
                message_type: outgoing.message_type,
                ts: 10_000 + seq,
                seq,
                is_read: false,
                attachments: Vec::new(),
            };
            inner
                .messages
                .entry(outgoing.thread_key.clone())
                .or_default()
                .push(confirmed.clone());
            Ok(confirmed)
        })
    }

    fn mark_read(&self, thread_key: &str, user_id: &str) -> Result<(), CoreError> {
        self.with(|inner| {
            inner.mark_read_calls += 1;
            if inner.fail_mark_read {
                return Err(CoreError::Unavailable("mark read down".to_string()));
            }
            for thread in &mut inner.threads {
                if thread.thread_key == thread_key {
                    if thread.participant_lo == user_id {
                        thread.unread_lo = 0;
                    } else if thread.participant_hi == user_id {
                        thread.unread_hi = 0;
                    }
                }
            }
            Ok(())
        })
    }
}

fn participant(user_id: &str) -> ResolvedParticipant {
    ResolvedParticipant {
        user_id: user_id.to_string(),
        name: user_id.to_string(),
        avatar: None,
        user_type: None,
    }
}

fn fake_thread(key: &str, lo: &str, hi: &str, unread_hi: i64, updated_at: i64) -> Thread {
    Thread {
        thread_key: key.to_string(),
        participant_lo: lo.to_string(),
        participant_hi: hi.to_string(),
        subject: None,
        profile_lo: participant(lo),
        profile_hi: participant(hi),
        last_message: None,
        message_count: 0,
        unread_lo: 0,
        unread_hi,
        created_at: 0,
        updated_at,
    }
}

fn server_message(key: &str, from: &str, to: &str, content: &str, ts: i64, seq: i64) -> Message {
    Message {
        id: format!("m-{ts}-{seq}"),
        thread_key: key.to_string(),
        sender_id: from.to_string(),
        receiver_id: to.to_string(),
        content: content.to_string(),
        message_type: MessageType::General,
        ts,
        seq,
        is_read: false,
        attachments: Vec::new(),
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn poll_merges_threads_and_messages() {
    let source = FakeSource::new();
    source.with(|inner| {
        inner.threads.push(fake_thread("t1", "alice", "bob", 0, 1_000));
        inner.messages.insert(
            "t1".to_string(),
            vec![
                server_message("t1", "alice", "bob", "hello", 1_000, 1),
                server_message("t1", "bob", "alice", "hi back", 2_000, 2),
            ],
        );
    });
    let mut client = SyncClient::start(source.clone(), "bob", Duration::from_secs(60));
    client.poll_now();
    assert!(wait_until(|| client.threads().len() == 1 && client.messages("t1").len() == 2));

    // A later poll only picks up what is past the cursor, merged by key.
    source.with(|inner| {
        inner
            .messages
            .get_mut("t1")
            .expect("log")
            .push(server_message("t1", "alice", "bob", "one more", 3_000, 3));
    });
    client.poll_now();
    assert!(wait_until(|| client.messages("t1").len() == 3));
    let contents: Vec<String> = client
        .messages("t1")
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["hello", "hi back", "one more"]);
    client.stop();
}

#[test]
fn mark_read_confirms_and_clears_overlay() {
    let source = FakeSource::new();
    source.with(|inner| inner.threads.push(fake_thread("t1", "alice", "bob", 4, 1_000)));
    let mut client = SyncClient::start(source.clone(), "bob", Duration::from_secs(60));
    client.poll_now();
    assert!(wait_until(|| client.threads().len() == 1));
    assert_eq!(client.threads()[0].unread_for("bob"), 4);

    client.mark_read("t1");
    // The unread count reads as zero immediately (overlay) and stays zero once
    // the acknowledgement lands.
    assert_eq!(client.threads()[0].unread_for("bob"), 0);
    assert!(wait_until(|| source.with(|inner| inner.mark_read_calls) == 1));
    client.poll_now();
    assert!(wait_until(|| client.threads()[0].unread_for("bob") == 0));
    assert!(client.last_error().is_none());
    client.stop();
}

#[test]
fn failed_mark_read_rolls_back_to_prior_count() {
    let source = FakeSource::new();
    source.with(|inner| {
        inner.threads.push(fake_thread("t1", "alice", "bob", 4, 1_000));
        inner.fail_mark_read = true;
    });
    let mut client = SyncClient::start(source.clone(), "bob", Duration::from_secs(60));
    client.poll_now();
    assert!(wait_until(|| client.threads().len() == 1));

    client.mark_read("t1");
    assert!(wait_until(|| source.with(|inner| inner.mark_read_calls) == 1));
    // The overlay is dropped, restoring the last authoritative count.
    assert!(wait_until(|| client.threads()[0].unread_for("bob") == 4));
    assert!(client.last_error().is_some());
    client.stop();
}

#[test]
fn send_replaces_pending_with_confirmed_message() {
    let source = FakeSource::new();
    source.with(|inner| inner.threads.push(fake_thread("t1", "alice", "bob", 0, 1_000)));
    let mut client = SyncClient::start(source.clone(), "alice", Duration::from_secs(60));

    let client_id = client.send("t1", "bob", "on my way", MessageType::General);
    // The optimistic copy is visible right away under the client id.
    assert!(client
        .messages("t1")
        .iter()
        .any(|m| m.id == client_id && m.content == "on my way"));

    assert!(wait_until(|| {
        let messages = client.messages("t1");
        messages.len() == 1 && messages[0].id.starts_with("srv-")
    }));
    assert_eq!(source.with(|inner| inner.send_calls), 1);
    client.stop();
}

#[test]
fn failed_send_drops_the_pending_message() {
    let source = FakeSource::new();
    source.with(|inner| {
        inner.threads.push(fake_thread("t1", "alice", "bob", 0, 1_000));
        inner.fail_send = true;
    });
    let mut client = SyncClient::start(source.clone(), "alice", Duration::from_secs(60));

    client.send("t1", "bob", "lost in transit", MessageType::General);
    assert!(wait_until(|| source.with(|inner| inner.send_calls) == 1));
    assert!(wait_until(|| client.messages("t1").is_empty()));
    assert!(client.last_error().is_some());
    client.stop();
}

#[test]
fn repeated_poll_failures_end_in_unavailable_and_manual_retry_recovers() {
    let source = FakeSource::new();
    source.with(|inner| {
        inner.threads.push(fake_thread("t1", "alice", "bob", 0, 1_000));
        inner.fail_fetch = true;
    });
    let mut client = SyncClient::start(source.clone(), "bob", Duration::from_millis(10));

    assert!(wait_until(|| client.status() == SyncStatus::Unavailable));
    assert!(client.last_error().is_some());

    source.with(|inner| inner.fail_fetch = false);
    client.poll_now();
    assert!(wait_until(|| client.status() == SyncStatus::Ok));
    assert!(wait_until(|| client.threads().len() == 1));
    assert!(client.last_error().is_none());
    client.stop();
}

#[test]
fn stacked_manual_polls_coalesce_into_one_cycle() {
    let source = FakeSource::new();
    source.with(|inner| {
        inner.threads.push(fake_thread("t1", "alice", "bob", 0, 1_000));
        // Slow fetch so the later refresh requests pile up while the first
        // cycle is still running.
        inner.fetch_delay = Duration::from_millis(50);
    });
    let mut client = SyncClient::start(source.clone(), "bob", Duration::from_secs(60));
    for _ in 0..5 {
        client.poll_now();
    }
    assert!(wait_until(|| client.threads().len() == 1));
    std::thread::sleep(Duration::from_millis(200));
    // First request starts a cycle; the four stacked behind it drain into at
    // most one follow-up.
    assert!(source.with(|inner| inner.fetch_calls) <= 2);
    client.stop();
}

#[test]
fn stop_joins_the_worker() {
    let source = FakeSource::new();
    let mut client = SyncClient::start(source, "alice", Duration::from_millis(10));
    client.poll_now();
    client.stop();
    // A stopped client still answers reads from its cache.
    assert!(client.threads().is_empty());
}
