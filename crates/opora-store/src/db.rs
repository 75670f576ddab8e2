use rusqlite::{Connection, Result};

/// Initialise all store tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_messages_table(conn)?;
    create_buffers_table(conn)?;
    create_cases_tables(conn)?;
    create_reactions_table(conn)?;
    create_admin_tables(conn)?;
    create_replies_table(conn)?;
    create_group_docs_table(conn)?;
    Ok(())
}

fn create_messages_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS raw_messages (
            group_id        TEXT NOT NULL,
            message_id      TEXT NOT NULL,
            ts              INTEGER NOT NULL,
            sender_hash     TEXT NOT NULL,
            sender_name     TEXT,
            content_text    TEXT NOT NULL,
            image_paths     TEXT NOT NULL DEFAULT '[]',
            reply_to_id     TEXT,
            reaction_count  INTEGER NOT NULL DEFAULT 0,
            from_bot        INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (group_id, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_group_ts
            ON raw_messages(group_id, ts);",
    )
}

fn create_buffers_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS group_buffers (
            group_id    TEXT PRIMARY KEY,
            buffer_text TEXT NOT NULL DEFAULT '',
            updated_at  INTEGER NOT NULL
        );",
    )
}

fn create_cases_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cases (
            case_id          TEXT PRIMARY KEY,
            group_id         TEXT NOT NULL,
            status           TEXT NOT NULL,
            problem_title    TEXT NOT NULL,
            problem_summary  TEXT NOT NULL,
            solution_summary TEXT NOT NULL DEFAULT '',
            tags             TEXT NOT NULL DEFAULT '[]',
            dedup_embedding  BLOB,
            in_index         INTEGER NOT NULL DEFAULT 0,
            closed_emoji     TEXT,
            created_at       INTEGER NOT NULL,
            updated_at       INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cases_group_status
            ON cases(group_id, status, updated_at DESC);

        CREATE TABLE IF NOT EXISTS case_evidence (
            case_id    TEXT NOT NULL,
            message_id TEXT NOT NULL,
            pos        INTEGER NOT NULL,
            PRIMARY KEY (case_id, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_evidence_message
            ON case_evidence(message_id);",
    )
}

fn create_reactions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS reactions (
            group_id      TEXT NOT NULL,
            target_ts     INTEGER NOT NULL,
            target_author TEXT NOT NULL,
            sender_hash   TEXT NOT NULL,
            emoji         TEXT NOT NULL,
            is_positive   INTEGER NOT NULL DEFAULT 0,
            created_at    INTEGER NOT NULL,
            PRIMARY KEY (group_id, target_ts, target_author, sender_hash, emoji)
        );
        CREATE INDEX IF NOT EXISTS idx_reactions_target
            ON reactions(group_id, target_ts);",
    )
}

fn create_admin_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS admin_sessions (
            admin_id           TEXT PRIMARY KEY,
            state              TEXT NOT NULL,
            pending_group_id   TEXT,
            pending_group_name TEXT,
            pending_token      TEXT,
            lang               TEXT NOT NULL DEFAULT 'uk',
            updated_at         INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS admin_group_links (
            admin_id   TEXT NOT NULL,
            group_id   TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (admin_id, group_id)
        );
        CREATE INDEX IF NOT EXISTS idx_links_group
            ON admin_group_links(group_id);

        CREATE TABLE IF NOT EXISTS history_tokens (
            token      TEXT PRIMARY KEY,
            admin_id   TEXT NOT NULL,
            group_id   TEXT NOT NULL,
            expires_at INTEGER NOT NULL,
            consumed   INTEGER NOT NULL DEFAULT 0
        );",
    )
}

/// Reply ledger: one row per outgoing quoted reply, keyed by the message it
/// answers. Backs double-send protection under at-least-once job delivery.
fn create_replies_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS replies (
            group_id   TEXT NOT NULL,
            message_id TEXT NOT NULL,
            sent_at    INTEGER NOT NULL,
            PRIMARY KEY (group_id, message_id)
        );",
    )
}

fn create_group_docs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS group_docs (
            group_id   TEXT PRIMARY KEY,
            urls       TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL
        );",
    )
}
