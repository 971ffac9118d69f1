use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS activities (
            id          TEXT PRIMARY KEY,
            host_id     TEXT NOT NULL REFERENCES users(id),
            title       TEXT NOT NULL,
            capacity    INTEGER NOT NULL CHECK (capacity > 0),
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS activity_attendees (
            activity_id TEXT NOT NULL REFERENCES activities(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL,
            PRIMARY KEY (activity_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS join_requests (
            id           TEXT PRIMARY KEY,
            activity_id  TEXT NOT NULL REFERENCES activities(id),
            requester_id TEXT NOT NULL REFERENCES users(id),
            host_id      TEXT NOT NULL REFERENCES users(id),
            message      TEXT NOT NULL,
            status       TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'denied')),
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );

        -- At most one pending request per (activity, requester) pair
        CREATE UNIQUE INDEX IF NOT EXISTS idx_join_requests_pending
            ON join_requests(activity_id, requester_id)
            WHERE status = 'pending';

        CREATE INDEX IF NOT EXISTS idx_join_requests_host
            ON join_requests(host_id, status);

        CREATE INDEX IF NOT EXISTS idx_join_requests_requester
            ON join_requests(requester_id, created_at);

        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            join_request_id TEXT NOT NULL UNIQUE REFERENCES join_requests(id),
            requester_id    TEXT NOT NULL REFERENCES users(id),
            host_id         TEXT NOT NULL REFERENCES users(id),
            status          TEXT NOT NULL CHECK (status IN ('active', 'read_only')),
            last_message_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            text            TEXT NOT NULL,
            kind            TEXT NOT NULL CHECK (kind IN ('text', 'system', 'join_request', 'approval', 'rejection')),
            metadata        TEXT NOT NULL DEFAULT '{}',
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at, id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
