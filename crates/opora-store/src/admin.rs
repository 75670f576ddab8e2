use tracing::info;
use uuid::Uuid;

use opora_core::types::{AdminSession, AdminState, GroupId, HistoryToken, Lang};

use crate::error::{Result, StoreError};
use crate::store::Store;

impl Store {
    // --- admin sessions ----------------------------------------------------

    pub fn get_admin_session(&self, admin_id: &str) -> Result<Option<AdminSession>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT admin_id, state, pending_group_id, pending_group_name,
                    pending_token, lang, updated_at
             FROM admin_sessions WHERE admin_id = ?1",
            [admin_id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Upsert the single session row for an admin.
    pub fn put_admin_session(&self, s: &AdminSession) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO admin_sessions
             (admin_id, state, pending_group_id, pending_group_name,
              pending_token, lang, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(admin_id) DO UPDATE SET
                state = ?2, pending_group_id = ?3, pending_group_name = ?4,
                pending_token = ?5, lang = ?6, updated_at = ?7",
            rusqlite::params![
                s.admin_id,
                s.state.to_string(),
                s.pending_group_id.as_ref().map(|g| g.as_str().to_string()),
                s.pending_group_name,
                s.pending_token,
                s.lang.to_string(),
                s.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn delete_admin_session(&self, admin_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute("DELETE FROM admin_sessions WHERE admin_id = ?1", [admin_id])?;
        Ok(())
    }

    // --- admin-group links ---------------------------------------------------

    pub fn link_admin_group(&self, admin_id: &str, group_id: &GroupId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO admin_group_links (admin_id, group_id, created_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![admin_id, group_id.as_str(), opora_core::now_ms()],
        )?;
        Ok(())
    }

    /// Admin ids linked to a group, oldest link first.
    pub fn admins_for_group(&self, group_id: &GroupId) -> Result<Vec<String>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT admin_id FROM admin_group_links
             WHERE group_id = ?1 ORDER BY created_at",
        )?;
        let admins = stmt
            .query_map([group_id.as_str()], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(admins)
    }

    pub fn groups_for_admin(&self, admin_id: &str) -> Result<Vec<GroupId>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT group_id FROM admin_group_links
             WHERE admin_id = ?1 ORDER BY created_at",
        )?;
        let groups = stmt
            .query_map([admin_id], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .map(GroupId::from)
            .collect();
        Ok(groups)
    }

    pub fn unlink_group(&self, group_id: &GroupId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM admin_group_links WHERE group_id = ?1",
            [group_id.as_str()],
        )?;
        Ok(())
    }

    // --- history tokens ------------------------------------------------------

    /// Mint a fresh single-use token for one admin+group bootstrap.
    pub fn create_history_token(
        &self,
        admin_id: &str,
        group_id: &GroupId,
        ttl_ms: i64,
    ) -> Result<HistoryToken> {
        let token = HistoryToken {
            token: Uuid::new_v4().to_string(),
            admin_id: admin_id.to_string(),
            group_id: group_id.clone(),
            expires_at: opora_core::now_ms() + ttl_ms,
            consumed: false,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO history_tokens (token, admin_id, group_id, expires_at, consumed)
             VALUES (?1, ?2, ?3, ?4, 0)",
            rusqlite::params![
                token.token,
                token.admin_id,
                token.group_id.as_str(),
                token.expires_at
            ],
        )?;
        Ok(token)
    }

    pub fn get_history_token(&self, token: &str) -> Result<Option<HistoryToken>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT token, admin_id, group_id, expires_at, consumed
             FROM history_tokens WHERE token = ?1",
            [token],
            |row| {
                Ok(HistoryToken {
                    token: row.get(0)?,
                    admin_id: row.get(1)?,
                    group_id: GroupId::from(row.get::<_, String>(2)?),
                    expires_at: row.get(3)?,
                    consumed: row.get(4)?,
                })
            },
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Consume a token, atomically. Errors if already consumed or unknown.
    pub fn consume_history_token(&self, token: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE history_tokens SET consumed = 1 WHERE token = ?1 AND consumed = 0",
            [token],
        )?;
        if n == 0 {
            return Err(StoreError::TokenNotFound {
                token: token.to_string(),
            });
        }
        Ok(())
    }

    /// Drop consumed or expired tokens; called from the reconciler.
    pub fn reap_history_tokens(&self, now_ms: i64) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM history_tokens WHERE consumed = 1 OR expires_at <= ?1",
            [now_ms],
        )?;
        Ok(n)
    }

    // --- admin wipe ----------------------------------------------------------

    /// Purge everything owned by one admin: session, links, tokens. Returns
    /// the groups that no longer have any linked admin, so the caller can
    /// decide whether to wipe their data too.
    pub fn wipe_admin(&self, admin_id: &str) -> Result<Vec<GroupId>> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let groups: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT group_id FROM admin_group_links WHERE admin_id = ?1",
            )?;
            let rows: Vec<String> = stmt
                .query_map([admin_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        tx.execute("DELETE FROM admin_sessions WHERE admin_id = ?1", [admin_id])?;
        tx.execute(
            "DELETE FROM admin_group_links WHERE admin_id = ?1",
            [admin_id],
        )?;
        tx.execute("DELETE FROM history_tokens WHERE admin_id = ?1", [admin_id])?;

        let mut orphaned = Vec::new();
        for gid in groups {
            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM admin_group_links WHERE group_id = ?1",
                [&gid],
                |row| row.get(0),
            )?;
            if remaining == 0 {
                orphaned.push(GroupId::from(gid));
            }
        }
        tx.commit()?;
        info!(admin = %admin_id, orphaned = orphaned.len(), "admin wiped");
        Ok(orphaned)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdminSession> {
    let state_str: String = row.get(1)?;
    let lang_str: String = row.get(5)?;
    Ok(AdminSession {
        admin_id: row.get(0)?,
        state: state_str.parse().unwrap_or(AdminState::AwaitingGroupName),
        pending_group_id: row
            .get::<_, Option<String>>(2)?
            .map(GroupId::from),
        pending_group_name: row.get(3)?,
        pending_token: row.get(4)?,
        lang: lang_str.parse().unwrap_or(Lang::Uk),
        updated_at: row.get(6)?,
    })
}
