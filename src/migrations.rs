pub const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS threads (
      thread_key TEXT PRIMARY KEY,
      participant_lo TEXT NOT NULL,
      participant_hi TEXT NOT NULL,
      subject TEXT,
      profile_lo_json TEXT NOT NULL,
      profile_hi_json TEXT NOT NULL,
      last_sender_id TEXT,
      last_receiver_id TEXT,
      last_content TEXT,
      last_message_type TEXT,
      last_message_at INTEGER,
      message_count INTEGER NOT NULL DEFAULT 0,
      unread_lo INTEGER NOT NULL DEFAULT 0,
      unread_hi INTEGER NOT NULL DEFAULT 0,
      next_seq INTEGER NOT NULL DEFAULT 1,
      hidden_lo INTEGER NOT NULL DEFAULT 0,
      hidden_hi INTEGER NOT NULL DEFAULT 0,
      created_at INTEGER NOT NULL,
      updated_at INTEGER NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_pair
      ON threads(participant_lo, participant_hi);
    CREATE INDEX IF NOT EXISTS idx_threads_updated
      ON threads(updated_at DESC, thread_key ASC);

    CREATE TABLE IF NOT EXISTS messages (
      id TEXT PRIMARY KEY,
      thread_key TEXT NOT NULL,
      sender_id TEXT NOT NULL,
      receiver_id TEXT NOT NULL,
      content TEXT NOT NULL,
      message_type TEXT NOT NULL,
      ts INTEGER NOT NULL,
      seq INTEGER NOT NULL,
      is_read INTEGER NOT NULL DEFAULT 0,
      attachments_json TEXT
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_thread_order
      ON messages(thread_key, ts, seq);
    CREATE INDEX IF NOT EXISTS idx_messages_receiver_unread
      ON messages(thread_key, receiver_id) WHERE is_read = 0;

    CREATE VIRTUAL TABLE IF NOT EXISTS message_fts USING fts5(
      message_id UNINDEXED,
      thread_key UNINDEXED,
      content
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_threads_unread_lo
      ON threads(participant_lo) WHERE unread_lo > 0;
    CREATE INDEX IF NOT EXISTS idx_threads_unread_hi
      ON threads(participant_hi) WHERE unread_hi > 0;
    "#,
];
