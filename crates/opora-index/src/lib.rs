//! Semantic index over solved cases, keyed by case id.
//!
//! Dual-table design on SQLite: `case_meta` holds the document, metadata
//! and the raw embedding blob; a `vec0` virtual table holds the embedding
//! for KNN. The index is a derived view of the primary store — it can be
//! dropped and rebuilt by the reconciler at any time.

use std::path::Path;
use std::sync::{Mutex, Once};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

use opora_core::types::{CaseId, GroupId};
use opora_core::vector::{blob_to_embedding, cosine_similarity, embedding_to_blob};

mod error;
pub use error::{IndexError, Result};

static SQLITE_VEC_INIT: Once = Once::new();

/// KNN over-fetch floor: the vec0 query returns at least this many
/// candidates before the group filter, so small groups are not starved by
/// neighbors from busier ones.
const KNN_FLOOR: usize = 50;

/// Metadata stored alongside each indexed case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub group_id: GroupId,
    pub status: String,
    pub evidence_ids: Vec<String>,
    #[serde(default)]
    pub evidence_image_paths: Vec<String>,
}

/// One retrieval hit, best first.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub case_id: CaseId,
    pub similarity: f32,
    pub document: String,
    pub metadata: IndexMetadata,
}

/// Content-addressed vector index keyed by case id.
pub struct CaseIndex {
    db: Mutex<Connection>,
    dimension: usize,
}

impl CaseIndex {
    /// Open (or create) the index database. Registers the sqlite-vec
    /// extension process-wide on first use.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        SQLITE_VEC_INIT.call_once(|| unsafe {
            rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
                sqlite_vec::sqlite3_vec_init as *const (),
            )));
        });

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS case_meta (
                id        INTEGER PRIMARY KEY,
                case_id   TEXT NOT NULL UNIQUE,
                group_id  TEXT NOT NULL,
                document  TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_case_meta_group ON case_meta(group_id);",
        )?;
        conn.execute(
            &format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS case_vec USING vec0(embedding float[{}])",
                dimension
            ),
            [],
        )?;

        Ok(Self {
            db: Mutex::new(conn),
            dimension,
        })
    }

    /// In-memory index for tests.
    pub fn open_in_memory(dimension: usize) -> Result<Self> {
        Self::open(":memory:", dimension)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert or replace the entry at `case_id`.
    pub fn upsert_case(
        &self,
        case_id: &CaseId,
        document: &str,
        embedding: &[f32],
        metadata: &IndexMetadata,
    ) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                got: embedding.len(),
                expected: self.dimension,
            });
        }
        let meta_json = serde_json::to_string(metadata)?;
        let blob = embedding_to_blob(embedding);
        let vec_json = vector_to_json(embedding);

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM case_meta WHERE case_id = ?1",
                [case_id.as_str()],
                |row| row.get(0),
            )
            .ok();

        let id = match existing {
            Some(id) => {
                tx.execute("DELETE FROM case_vec WHERE rowid = ?1", params![id])?;
                tx.execute(
                    "UPDATE case_meta SET group_id = ?1, document = ?2,
                            embedding = ?3, metadata = ?4
                     WHERE id = ?5",
                    params![metadata.group_id.as_str(), document, blob, meta_json, id],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO case_meta (case_id, group_id, document, embedding, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        case_id.as_str(),
                        metadata.group_id.as_str(),
                        document,
                        blob,
                        meta_json
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };
        tx.execute(
            "INSERT INTO case_vec (rowid, embedding) VALUES (?1, ?2)",
            params![id, vec_json],
        )?;
        tx.commit()?;
        debug!(case_id = %case_id, "index upsert");
        Ok(())
    }

    /// Group-filtered top-k by cosine similarity, best first.
    ///
    /// vec0 KNN over-fetches unfiltered candidates; the group filter and
    /// exact cosine ranking happen on the metadata side.
    pub fn query(
        &self,
        group_id: &GroupId,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<IndexHit>> {
        if query_embedding.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                got: query_embedding.len(),
                expected: self.dimension,
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let vec_json = vector_to_json(query_embedding);
        let knn_limit = (k.max(KNN_FLOOR) * 3) as i64;

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT rowid FROM case_vec WHERE embedding MATCH ?1 AND k = ?2",
        )?;
        let rowids: Vec<i64> = stmt
            .query_map(params![vec_json, knn_limit], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let mut hits: Vec<IndexHit> = Vec::new();
        for id in rowids {
            let row: Option<(String, String, Vec<u8>, String)> = db
                .query_row(
                    "SELECT case_id, document, embedding, metadata
                     FROM case_meta WHERE id = ?1 AND group_id = ?2",
                    params![id, group_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .ok();
            let (case_id, document, blob, meta_json) = match row {
                Some(r) => r,
                None => continue,
            };
            let metadata: IndexMetadata = serde_json::from_str(&meta_json)?;
            let similarity = cosine_similarity(query_embedding, &blob_to_embedding(&blob));
            hits.push(IndexHit {
                case_id: CaseId::from(case_id),
                similarity,
                document,
                metadata,
            });
        }
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }

    pub fn delete_case(&self, case_id: &CaseId) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM case_meta WHERE case_id = ?1",
                [case_id.as_str()],
                |row| row.get(0),
            )
            .ok();
        if let Some(id) = id {
            tx.execute("DELETE FROM case_vec WHERE rowid = ?1", params![id])?;
            tx.execute("DELETE FROM case_meta WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All indexed case ids, optionally restricted to one group.
    pub fn list_ids(&self, group_id: Option<&GroupId>) -> Result<Vec<CaseId>> {
        let db = self.db.lock().unwrap();
        let mut out = Vec::new();
        match group_id {
            Some(g) => {
                let mut stmt =
                    db.prepare("SELECT case_id FROM case_meta WHERE group_id = ?1")?;
                for r in stmt.query_map([g.as_str()], |row| row.get::<_, String>(0))? {
                    if let Ok(id) = r {
                        out.push(CaseId::from(id));
                    }
                }
            }
            None => {
                let mut stmt = db.prepare("SELECT case_id FROM case_meta")?;
                for r in stmt.query_map([], |row| row.get::<_, String>(0))? {
                    if let Ok(id) = r {
                        out.push(CaseId::from(id));
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row("SELECT COUNT(*) FROM case_meta", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

/// Formats a vector as JSON for sqlite-vec (e.g. "[0.1,0.2,0.3]").
fn vector_to_json(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|f| f.to_string()).collect();
    format!("[{}]", parts.join(","))
}
