use rusqlite::Connection;

use crate::error::CoreError;
use crate::identity;
use crate::message_store::{self, AppendRequest};
use crate::models::{MessageType, ResolvedParticipant};
use crate::thread_store;

fn demo_profile(user_id: &str, name: &str, user_type: &str) -> ResolvedParticipant {
    ResolvedParticipant {
        user_id: user_id.to_string(),
        name: name.to_string(),
        avatar: None,
        user_type: Some(user_type.to_string()),
    }
}

/// Seeds demo conversations for dev and preview builds. Goes through the
/// real operations so counters and snapshots stay consistent.
pub fn seed_demo(
    conn: &Connection,
    thread_count: i64,
    messages_per_thread: i64,
) -> Result<(), CoreError> {
    let seeker_id = "demo-seeker";
    let seeker = demo_profile(seeker_id, "Demo Seeker", "inquirer");
    let base_ts = 1_700_000_000_000i64;
    let types = [
        MessageType::Inquiry,
        MessageType::General,
        MessageType::Business,
        MessageType::Urgent,
    ];

    for t in 0..thread_count {
        let kennel_id = format!("demo-kennel-{}", t + 1);
        let kennel = demo_profile(&kennel_id, &format!("Demo Kennel {}", t + 1), "responder");
        let thread_key = identity::resolve(seeker_id, &kennel_id)?;
        let (lo, hi) = if seeker_id < kennel_id.as_str() {
            (&seeker, &kennel)
        } else {
            (&kennel, &seeker)
        };
        let created = base_ts + t * 3_600_000;
        thread_store::ensure_thread(
            conn,
            &thread_key,
            lo,
            hi,
            Some(&format!("Litter inquiry {}", t + 1)),
            created,
        )?;
        for m in 0..messages_per_thread {
            let outgoing = m % 2 == 0;
            let (sender, receiver) = if outgoing {
                (seeker_id, kennel_id.as_str())
            } else {
                (kennel_id.as_str(), seeker_id)
            };
            let content = if outgoing {
                format!("Is puppy {} still available?", m + 1)
            } else {
                format!("Yes, reply {} from the kennel.", m + 1)
            };
            message_store::append(
                conn,
                &AppendRequest {
                    thread_key: &thread_key,
                    sender_id: sender,
                    receiver_id: receiver,
                    content: &content,
                    message_type: types[(m as usize) % types.len()],
                    attachments: &[],
                    client_message_id: None,
                    now_ms: created + (m + 1) * 60_000,
                },
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::apply_migrations;
    use crate::thread_store::ThreadFilter;

    #[test]
    fn seed_builds_consistent_threads() {
        let conn = Connection::open_in_memory().expect("memory db");
        apply_migrations(&conn).expect("migrate");
        seed_demo(&conn, 2, 5).expect("seed");
        let threads =
            thread_store::list_threads(&conn, "demo-seeker", &ThreadFilter::default()).expect("list");
        assert_eq!(threads.len(), 2);
        for thread in &threads {
            assert_eq!(thread.message_count, 5);
            assert!(thread.last_message.is_some());
        }
    }
}
