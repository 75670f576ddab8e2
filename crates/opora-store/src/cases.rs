use rusqlite::Connection;
use tracing::{debug, warn};

use opora_core::types::{Case, CaseId, CaseStatus, GroupId, RawMessage};

use opora_core::vector::{blob_to_embedding, cosine_similarity, embedding_to_blob};

use crate::error::{Result, StoreError};
use crate::store::{row_to_message, Store};

/// Structured fields proposed for a case by extraction; used both for fresh
/// inserts and for enriching an existing case on a dedup merge.
#[derive(Debug, Clone, Default)]
pub struct CaseDraft {
    pub problem_title: String,
    pub problem_summary: String,
    pub solution_summary: String,
    pub tags: Vec<String>,
}

impl Store {
    /// Insert a new case together with its evidence rows, in one transaction.
    ///
    /// Evidence ids that do not exist in the group's message history are
    /// dropped (the evidence table never references a missing message).
    pub fn insert_case(&self, case: &Case) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let tags = serde_json::to_string(&case.tags)?;
        let blob = case.dedup_embedding.as_ref().map(|e| embedding_to_blob(e));
        tx.execute(
            "INSERT INTO cases
             (case_id, group_id, status, problem_title, problem_summary,
              solution_summary, tags, dedup_embedding, in_index, closed_emoji,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                case.case_id.as_str(),
                case.group_id.as_str(),
                case.status.to_string(),
                case.problem_title,
                case.problem_summary,
                case.solution_summary,
                tags,
                blob,
                case.in_index,
                case.closed_emoji,
                case.created_at,
                case.updated_at,
            ],
        )?;
        let dropped = insert_evidence(&tx, &case.case_id, &case.group_id, &case.evidence_ids, 0)?;
        if dropped > 0 {
            warn!(case_id = %case.case_id, dropped, "evidence ids without matching messages dropped");
        }
        tx.commit()?;
        Ok(())
    }

    /// Merge extra evidence and (optionally) richer fields into an existing
    /// case. Evidence is unioned, existing order first; a field is replaced
    /// only when the incoming text is strictly longer; tags are unioned.
    /// Never reduces evidence; preserves `created_at`.
    pub fn merge_case(
        &self,
        target_id: &CaseId,
        extra_evidence: &[String],
        draft: Option<&CaseDraft>,
    ) -> Result<Case> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let case = query_case(&tx, target_id)?.ok_or_else(|| StoreError::CaseNotFound {
            id: target_id.to_string(),
        })?;

        if let Some(d) = draft {
            let mut tags: Vec<String> = case.tags.clone();
            for t in &d.tags {
                if !tags.contains(t) {
                    tags.push(t.clone());
                }
            }
            let title = longer(&case.problem_title, &d.problem_title).to_string();
            let problem = longer(&case.problem_summary, &d.problem_summary).to_string();
            let solution = longer(&case.solution_summary, &d.solution_summary).to_string();
            let tags_json = serde_json::to_string(&tags)?;
            tx.execute(
                "UPDATE cases SET problem_title = ?1, problem_summary = ?2,
                        solution_summary = ?3, tags = ?4, updated_at = ?5
                 WHERE case_id = ?6",
                rusqlite::params![
                    title,
                    problem,
                    solution,
                    tags_json,
                    opora_core::now_ms(),
                    target_id.as_str()
                ],
            )?;
        } else {
            tx.execute(
                "UPDATE cases SET updated_at = ?1 WHERE case_id = ?2",
                rusqlite::params![opora_core::now_ms(), target_id.as_str()],
            )?;
        }

        let next_pos = tx.query_row(
            "SELECT COALESCE(MAX(pos) + 1, 0) FROM case_evidence WHERE case_id = ?1",
            [target_id.as_str()],
            |row| row.get::<_, i64>(0),
        )?;
        insert_evidence(&tx, target_id, &case.group_id, extra_evidence, next_pos)?;
        tx.commit()?;

        debug!(case_id = %target_id, added = extra_evidence.len(), "case merged");
        let merged = query_case(&db, target_id)?.ok_or_else(|| StoreError::CaseNotFound {
            id: target_id.to_string(),
        })?;
        Ok(merged)
    }

    /// Promote a case to solved with the given solution summary.
    pub fn update_case_to_solved(&self, case_id: &CaseId, solution: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE cases SET status = 'solved', solution_summary = ?1, updated_at = ?2
             WHERE case_id = ?3",
            rusqlite::params![solution, opora_core::now_ms(), case_id.as_str()],
        )?;
        if n == 0 {
            return Err(StoreError::CaseNotFound {
                id: case_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_closed_emoji(&self, case_id: &CaseId, emoji: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE cases SET closed_emoji = ?1, updated_at = ?2 WHERE case_id = ?3",
            rusqlite::params![emoji, opora_core::now_ms(), case_id.as_str()],
        )?;
        Ok(())
    }

    pub fn mark_case_in_index(&self, case_id: &CaseId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE cases SET in_index = 1, updated_at = ?1 WHERE case_id = ?2",
            rusqlite::params![opora_core::now_ms(), case_id.as_str()],
        )?;
        Ok(())
    }

    pub fn archive_case(&self, case_id: &CaseId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE cases SET status = 'archived', in_index = 0, updated_at = ?1
             WHERE case_id = ?2",
            rusqlite::params![opora_core::now_ms(), case_id.as_str()],
        )?;
        Ok(())
    }

    /// Delete a case and its evidence rows.
    pub fn delete_case(&self, case_id: &CaseId) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM case_evidence WHERE case_id = ?1",
            [case_id.as_str()],
        )?;
        tx.execute("DELETE FROM cases WHERE case_id = ?1", [case_id.as_str()])?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_case(&self, case_id: &CaseId) -> Result<Option<Case>> {
        let db = self.db.lock().unwrap();
        query_case(&db, case_id)
    }

    /// Case plus its evidence messages in evidence order, for the viewer API.
    pub fn get_case_with_evidence(&self, case_id: &CaseId) -> Result<Option<(Case, Vec<RawMessage>)>> {
        let db = self.db.lock().unwrap();
        let case = match query_case(&db, case_id)? {
            Some(c) => c,
            None => return Ok(None),
        };
        let mut stmt = db.prepare(
            "SELECT m.group_id, m.message_id, m.ts, m.sender_hash, m.sender_name,
                    m.content_text, m.image_paths, m.reply_to_id, m.reaction_count, m.from_bot
             FROM case_evidence e
             JOIN raw_messages m ON m.message_id = e.message_id AND m.group_id = ?2
             WHERE e.case_id = ?1
             ORDER BY e.pos",
        )?;
        let messages = stmt
            .query_map(
                rusqlite::params![case_id.as_str(), case.group_id.as_str()],
                row_to_message,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(Some((case, messages)))
    }

    /// Nearest case by cosine over dedup embeddings, at or above `threshold`.
    ///
    /// Ties are broken by more evidence, then earlier `created_at`, then
    /// smaller case id, so repeated runs merge deterministically.
    /// `only_solved` restricts candidates to solved cases (the dynamic-
    /// resolution path looks for a solved peer); `exclude` removes the case
    /// being matched from its own candidate set. Archived cases never match.
    pub fn find_similar_case(
        &self,
        group_id: &GroupId,
        embedding: &[f32],
        threshold: f32,
        only_solved: bool,
        exclude: Option<&CaseId>,
    ) -> Result<Option<CaseId>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT c.case_id, c.dedup_embedding, c.created_at, c.status,
                    (SELECT COUNT(*) FROM case_evidence e WHERE e.case_id = c.case_id)
             FROM cases c
             WHERE c.group_id = ?1 AND c.dedup_embedding IS NOT NULL
               AND c.status != 'archived'",
        )?;
        let rows: Vec<(String, Vec<u8>, i64, String, i64)> = stmt
            .query_map([group_id.as_str()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let mut best: Option<(f32, i64, i64, String)> = None;
        for (id, blob, created_at, status, evidence_count) in rows {
            if exclude.map(|e| e.as_str() == id).unwrap_or(false) {
                continue;
            }
            if only_solved && status != "solved" {
                continue;
            }
            let sim = cosine_similarity(embedding, &blob_to_embedding(&blob));
            if sim < threshold {
                continue;
            }
            let candidate = (sim, evidence_count, created_at, id);
            best = match best {
                None => Some(candidate),
                Some(cur) => {
                    if ranks_higher(&candidate, &cur) {
                        Some(candidate)
                    } else {
                        Some(cur)
                    }
                }
            };
        }
        Ok(best.map(|(_, _, _, id)| CaseId::from(id)))
    }

    pub fn get_open_cases_for_group(&self, group_id: &GroupId) -> Result<Vec<Case>> {
        self.cases_by_status(group_id, "open", None)
    }

    pub fn get_recent_solved_cases(&self, group_id: &GroupId, since_ts: i64) -> Result<Vec<Case>> {
        self.cases_by_status(group_id, "solved", Some(since_ts))
    }

    fn cases_by_status(
        &self,
        group_id: &GroupId,
        status: &str,
        since_ts: Option<i64>,
    ) -> Result<Vec<Case>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT case_id FROM cases
             WHERE group_id = ?1 AND status = ?2 AND updated_at >= ?3
             ORDER BY updated_at DESC",
        )?;
        let ids: Vec<String> = stmt
            .query_map(
                rusqlite::params![group_id.as_str(), status, since_ts.unwrap_or(i64::MIN)],
                |row| row.get(0),
            )?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(c) = query_case(&db, &CaseId::from(id))? {
                out.push(c);
            }
        }
        Ok(out)
    }

    /// For every open case whose evidence contains a message with
    /// `ts = target_ts`, set status=solved and record the closing emoji.
    /// `solution_summary` is left untouched (possibly blank). Returns the
    /// newly solved case ids.
    pub fn confirm_cases_by_evidence_ts(
        &self,
        group_id: &GroupId,
        target_ts: i64,
        emoji: &str,
    ) -> Result<Vec<CaseId>> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT c.case_id
                 FROM cases c
                 JOIN case_evidence e ON e.case_id = c.case_id
                 JOIN raw_messages m ON m.message_id = e.message_id
                      AND m.group_id = c.group_id
                 WHERE c.group_id = ?1 AND c.status = 'open' AND m.ts = ?2",
            )?;
            let rows: Vec<String> = stmt
                .query_map(rusqlite::params![group_id.as_str(), target_ts], |row| {
                    row.get(0)
                })?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        let now = opora_core::now_ms();
        for id in &ids {
            tx.execute(
                "UPDATE cases SET status = 'solved', closed_emoji = ?1, updated_at = ?2
                 WHERE case_id = ?3",
                rusqlite::params![emoji, now, id],
            )?;
        }
        tx.commit()?;
        Ok(ids.into_iter().map(CaseId::from).collect())
    }

    /// Archive open cases whose `updated_at` is older than `cutoff_ms`.
    pub fn expire_old_open_cases(&self, cutoff_ms: i64) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE cases SET status = 'archived', in_index = 0, updated_at = ?1
             WHERE status = 'open' AND updated_at < ?2",
            rusqlite::params![opora_core::now_ms(), cutoff_ms],
        )?;
        Ok(n)
    }

    /// True when the message is already evidence of some case in its group.
    /// A redelivered buffer-update job uses this to avoid re-appending a
    /// message whose span was extracted and removed.
    pub fn message_is_case_evidence(&self, group_id: &GroupId, message_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM case_evidence e
             JOIN cases c ON c.case_id = e.case_id
             WHERE c.group_id = ?1 AND e.message_id = ?2",
            rusqlite::params![group_id.as_str(), message_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// All cases currently flagged as present in the index (for the
    /// reconciler's two-way comparison).
    pub fn cases_marked_in_index(&self) -> Result<Vec<Case>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare("SELECT case_id FROM cases WHERE in_index = 1")?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(c) = query_case(&db, &CaseId::from(id))? {
                out.push(c);
            }
        }
        Ok(out)
    }
}

/// Prefer `b` only when strictly longer than `a`.
fn longer<'a>(a: &'a str, b: &'a str) -> &'a str {
    if b.len() > a.len() {
        b
    } else {
        a
    }
}

/// Candidate ordering for `find_similar_case`: higher cosine, then more
/// evidence, then earlier created_at, then smaller id.
fn ranks_higher(a: &(f32, i64, i64, String), b: &(f32, i64, i64, String)) -> bool {
    if a.0 != b.0 {
        return a.0 > b.0;
    }
    if a.1 != b.1 {
        return a.1 > b.1;
    }
    if a.2 != b.2 {
        return a.2 < b.2;
    }
    a.3 < b.3
}

fn insert_evidence(
    conn: &Connection,
    case_id: &CaseId,
    group_id: &GroupId,
    evidence_ids: &[String],
    start_pos: i64,
) -> Result<usize> {
    let mut pos = start_pos;
    let mut dropped = 0usize;
    for mid in evidence_ids {
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM raw_messages WHERE group_id = ?1 AND message_id = ?2",
            rusqlite::params![group_id.as_str(), mid],
            |row| row.get(0),
        )?;
        if exists == 0 {
            dropped += 1;
            continue;
        }
        let n = conn.execute(
            "INSERT OR IGNORE INTO case_evidence (case_id, message_id, pos)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![case_id.as_str(), mid, pos],
        )?;
        if n > 0 {
            pos += 1;
        }
    }
    Ok(dropped)
}

fn query_case(conn: &Connection, case_id: &CaseId) -> Result<Option<Case>> {
    let row = conn.query_row(
        "SELECT case_id, group_id, status, problem_title, problem_summary,
                solution_summary, tags, dedup_embedding, in_index, closed_emoji,
                created_at, updated_at
         FROM cases WHERE case_id = ?1",
        [case_id.as_str()],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<Vec<u8>>>(7)?,
                row.get::<_, bool>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, i64>(10)?,
                row.get::<_, i64>(11)?,
            ))
        },
    );
    let (id, gid, status, title, problem, solution, tags, blob, in_index, emoji, created, updated) =
        match row {
            Ok(r) => r,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(StoreError::Database(e)),
        };

    let status: CaseStatus = status
        .parse()
        .map_err(|e: String| StoreError::CorruptRow(e))?;

    let mut stmt = conn.prepare(
        "SELECT message_id FROM case_evidence WHERE case_id = ?1 ORDER BY pos",
    )?;
    let evidence_ids: Vec<String> = stmt
        .query_map([case_id.as_str()], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Some(Case {
        case_id: CaseId::from(id),
        group_id: GroupId::from(gid),
        status,
        problem_title: title,
        problem_summary: problem,
        solution_summary: solution,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        evidence_ids,
        dedup_embedding: blob.map(|b| blob_to_embedding(&b)),
        in_index,
        closed_emoji: emoji,
        created_at: created,
        updated_at: updated,
    }))
}
