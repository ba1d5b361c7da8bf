use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{EmberError, Result};
use crate::scanner::compile_path_glob;

/// Bumped on incompatible schema changes; the migration runs once on open.
/// v1 keyed the vector rows on an internal numeric rowid; v2 keys them on
/// `content_hash` so identities survive reindexing.
const SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chunks (
    content_hash TEXT NOT NULL,
    project_id   TEXT NOT NULL,
    path         TEXT NOT NULL,
    lang         TEXT NOT NULL DEFAULT '',
    symbol       TEXT NOT NULL DEFAULT '',
    start_line   INTEGER NOT NULL,
    end_line     INTEGER NOT NULL,
    content      TEXT NOT NULL,
    file_hash    TEXT NOT NULL,
    tree_sha     TEXT NOT NULL,
    PRIMARY KEY (content_hash, path)
);
CREATE INDEX IF NOT EXISTS idx_chunks_tree_path ON chunks(tree_sha, path);
CREATE INDEX IF NOT EXISTS idx_chunks_file_hash ON chunks(file_hash);
CREATE INDEX IF NOT EXISTS idx_chunks_lang ON chunks(lang);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    content, path, symbol, lang,
    content='chunks',
    content_rowid='rowid',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, content, path, symbol, lang)
    VALUES (new.rowid, new.content, new.path, new.symbol, new.lang);
END;
CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content, path, symbol, lang)
    VALUES ('delete', old.rowid, old.content, old.path, old.symbol, old.lang);
END;
CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, content, path, symbol, lang)
    VALUES ('delete', old.rowid, old.content, old.path, old.symbol, old.lang);
    INSERT INTO chunks_fts(rowid, content, path, symbol, lang)
    VALUES (new.rowid, new.content, new.path, new.symbol, new.lang);
END;

CREATE TABLE IF NOT EXISTS vectors (
    content_hash TEXT PRIMARY KEY,
    dim          INTEGER NOT NULL,
    embedding    BLOB NOT NULL
);
";

/// One persisted chunk row.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub content_hash: String,
    pub project_id: String,
    pub path: String,
    pub lang: String,
    pub symbol: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub file_hash: String,
    pub tree_sha: String,
}

/// A chunk ready to be written. `vector` is `None` when the content hash
/// already owns a vector row (rename, duplicate body) and no embedding work
/// was needed.
#[derive(Debug, Clone)]
pub struct StagedChunk {
    pub content_hash: String,
    pub symbol: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub vector: Option<Vec<f32>>,
}

/// Structured predicates pushed into the candidate queries themselves, so a
/// `topk` ask returns `topk` already-filtered rows.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Exact match on the `lang` column.
    pub lang: Option<String>,
    /// Glob over the repo-relative path, `**`/`*`/`?` semantics.
    pub path_glob: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RankedHit {
    pub content_hash: String,
    pub score: f64,
}

/// Counts from one per-file staging transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct StageOutcome {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
}

/// The storage engine: one SQLite file holding the chunk table, the FTS5
/// lexical index (trigger-synced), the vector rows, and the metadata KV.
/// Connections are pooled; the pool is safe to share across threads.
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            register_glob_function(conn)?;
            Ok(())
        });

        let pool = Pool::builder().max_size(4).build(manager)?;
        let store = Self { pool };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;

        let version: i64 = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |r| r.get::<_, String>(0),
            )
            .optional()?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        match version {
            0 => {
                conn.execute_batch(SCHEMA)?;
            }
            1 => {
                // v1 keyed vectors on rowid; content hashes cannot be
                // reconstructed from that shape, so rebuild the stores. The
                // next run re-chunks and re-embeds everything.
                tracing::warn!("migrating index schema v1 -> v{SCHEMA_VERSION}; a full reindex will run");
                conn.execute_batch(
                    "DROP TABLE IF EXISTS vectors;
                     DROP TABLE IF EXISTS chunks_fts;
                     DROP TABLE IF EXISTS chunks;",
                )?;
                conn.execute("DELETE FROM meta WHERE key = 'last_tree_sha'", [])?;
                conn.execute_batch(SCHEMA)?;
            }
            v if v == SCHEMA_VERSION => {}
            v => {
                return Err(EmberError::StorageFailure(format!(
                    "index schema v{v} is newer than this build supports (v{SCHEMA_VERSION})"
                )))
            }
        }

        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            [SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    }

    // ── Metadata KV ───────────────────────────────────────────────────────

    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            [key, value],
        )?;
        Ok(())
    }

    pub fn meta_set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (k, v) in entries {
            tx.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                [k, v],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Counts & lookups ──────────────────────────────────────────────────

    pub fn chunk_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?)
    }

    pub fn vector_count(&self) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM vectors", [], |r| r.get(0))?)
    }

    /// Hydrate one chunk by full content hash. With several paths sharing a
    /// body, the first by `(path, start_line)` wins.
    pub fn get_chunk(&self, content_hash: &str) -> Result<Option<ChunkRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT content_hash, project_id, path, lang, symbol, start_line, end_line,
                        content, file_hash, tree_sha
                 FROM chunks WHERE content_hash = ?1
                 ORDER BY path ASC, start_line ASC LIMIT 1",
                [content_hash],
                row_to_chunk,
            )
            .optional()?)
    }

    /// Which of the given hashes already own a vector row. Lets the indexer
    /// skip embedding for bodies seen before (renames, duplicated code).
    pub fn existing_vector_hashes(&self, hashes: &[String]) -> Result<HashSet<String>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; hashes.len()].join(", ");
        let sql =
            format!("SELECT content_hash FROM vectors WHERE content_hash IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params_from_iter(hashes.iter()), |r| r.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(found)
    }

    /// Resolve a (possibly shortened) external chunk identifier to the full
    /// 64-char hash. Prefixes shorter than 8 chars or matching several
    /// chunks are rejected.
    pub fn resolve_hash_prefix(&self, prefix: &str) -> Result<String> {
        let p = prefix.to_lowercase();
        if p.len() < 8 || p.len() > 64 || !p.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EmberError::InvalidQuery {
                reason: format!("chunk id {prefix:?} must be 8..=64 hex characters"),
            });
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT content_hash FROM chunks WHERE content_hash LIKE ?1 LIMIT 2",
        )?;
        let matches: Vec<String> = stmt
            .query_map([format!("{p}%")], |r| r.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        match matches.as_slice() {
            [one] => Ok(one.clone()),
            [] => Err(EmberError::InvalidQuery {
                reason: format!("no chunk with id prefix {prefix:?}"),
            }),
            _ => Err(EmberError::InvalidQuery {
                reason: format!("chunk id prefix {prefix:?} is ambiguous; use more characters"),
            }),
        }
    }

    // ── Writes ────────────────────────────────────────────────────────────

    /// Persist the new shape of one file in a single transaction, in the
    /// order that keeps every observable state consistent: chunk rows first,
    /// then vectors (dimension-checked), and only then the removal of this
    /// path's rows that the new set no longer contains. The FTS triggers
    /// ride along with the row writes.
    pub fn stage_file(
        &self,
        project_id: &str,
        path: &str,
        lang: &str,
        file_hash: &str,
        tree_sha: &str,
        staged: &[StagedChunk],
        expected_dim: usize,
    ) -> Result<StageOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(EmberError::from)?;
        let mut outcome = StageOutcome::default();

        {
            let mut exists_stmt =
                tx.prepare("SELECT 1 FROM chunks WHERE content_hash = ?1 AND path = ?2")?;
            let mut upsert_stmt = tx.prepare(
                "INSERT INTO chunks (content_hash, project_id, path, lang, symbol,
                                     start_line, end_line, content, file_hash, tree_sha)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(content_hash, path) DO UPDATE SET
                     project_id = excluded.project_id,
                     lang       = excluded.lang,
                     symbol     = excluded.symbol,
                     start_line = excluded.start_line,
                     end_line   = excluded.end_line,
                     file_hash  = excluded.file_hash,
                     tree_sha   = excluded.tree_sha",
            )?;
            let mut vector_stmt = tx.prepare(
                "INSERT OR REPLACE INTO vectors (content_hash, dim, embedding) VALUES (?1, ?2, ?3)",
            )?;

            for chunk in staged {
                let pre_existing = exists_stmt
                    .query_row(params![chunk.content_hash, path], |_| Ok(()))
                    .optional()?
                    .is_some();

                upsert_stmt.execute(params![
                    chunk.content_hash,
                    project_id,
                    path,
                    lang,
                    chunk.symbol,
                    chunk.start_line,
                    chunk.end_line,
                    chunk.content,
                    file_hash,
                    tree_sha,
                ])?;
                if pre_existing {
                    outcome.updated += 1;
                } else {
                    outcome.created += 1;
                }

                if let Some(vector) = &chunk.vector {
                    if vector.len() != expected_dim {
                        return Err(EmberError::DimensionMismatch {
                            chunk: format!("{path}:{} ({})", chunk.start_line, chunk.content_hash),
                            got: vector.len(),
                            expected: expected_dim,
                        });
                    }
                    vector_stmt.execute(params![
                        chunk.content_hash,
                        expected_dim as i64,
                        vector_to_bytes(vector),
                    ])?;
                }
            }
        }

        // Only after the replacements are in: drop this path's rows whose
        // hash is not in the new set.
        let new_hashes: HashSet<&str> = staged.iter().map(|c| c.content_hash.as_str()).collect();
        let stale: Vec<String> = {
            let mut stmt = tx.prepare("SELECT content_hash FROM chunks WHERE path = ?1")?;
            let rows = stmt
                .query_map([path], |r| r.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .filter(|h| !new_hashes.contains(h.as_str()))
                .collect();
            rows
        };
        for hash in &stale {
            outcome.deleted += tx.execute(
                "DELETE FROM chunks WHERE path = ?1 AND content_hash = ?2",
                params![path, hash],
            )? as u64;
        }
        prune_orphan_vectors(&tx, &stale)?;

        tx.commit()?;
        Ok(outcome)
    }

    /// Remove every chunk of the given paths (file deletions and rename
    /// sources), vectors included when no other path still uses the body.
    pub fn delete_paths(&self, paths: &[String]) -> Result<u64> {
        if paths.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let placeholders = vec!["?"; paths.len()].join(", ");
        let affected: Vec<String> = {
            let sql =
                format!("SELECT DISTINCT content_hash FROM chunks WHERE path IN ({placeholders})");
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(paths.iter()), |r| r.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };

        let sql = format!("DELETE FROM chunks WHERE path IN ({placeholders})");
        let deleted = tx.execute(&sql, params_from_iter(paths.iter()))? as u64;
        prune_orphan_vectors(&tx, &affected)?;

        tx.commit()?;
        Ok(deleted)
    }

    /// Re-stamp surviving rows observed valid at `to_tree`: untouched files
    /// in an incremental run and files whose re-chunking failed (their old
    /// chunks are preserved by contract).
    pub fn refresh_tree_sha(&self, from_tree: &str, to_tree: &str) -> Result<u64> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "UPDATE chunks SET tree_sha = ?2 WHERE tree_sha = ?1",
            [from_tree, to_tree],
        )? as u64)
    }

    pub fn bump_tree_sha_for_paths(&self, paths: &[String], tree_sha: &str) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; paths.len()].join(", ");
        let sql = format!("UPDATE chunks SET tree_sha = ?1 WHERE path IN ({placeholders})");
        let mut args: Vec<&str> = vec![tree_sha];
        args.extend(paths.iter().map(|p| p.as_str()));
        conn.execute(&sql, params_from_iter(args.iter()))?;
        Ok(())
    }

    /// Run-wide final sweep: anything still carrying an older tree identity
    /// was not observed in the target tree and goes away.
    pub fn sweep_stale(&self, current_tree: &str) -> Result<u64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let victims: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT DISTINCT content_hash FROM chunks WHERE tree_sha != ?1")?;
            let rows = stmt
                .query_map([current_tree], |r| r.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            rows
        };
        let deleted = tx.execute("DELETE FROM chunks WHERE tree_sha != ?1", [current_tree])? as u64;
        prune_orphan_vectors(&tx, &victims)?;

        tx.commit()?;
        Ok(deleted)
    }

    /// Drop every vector row. Used when the model fingerprint changes and a
    /// forced reindex re-embeds the whole tree.
    pub fn clear_vectors(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM vectors", [])?;
        Ok(())
    }

    // ── Candidate queries ─────────────────────────────────────────────────

    /// Ranked keyword candidates from the FTS5 index. The score is the
    /// negated BM25 rank (higher is better). Lang and path predicates are
    /// part of the SQL, not a post-filter.
    pub fn lexical_search(
        &self,
        query_text: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<RankedHit>> {
        let match_expr = escape_fts_query(query_text);
        if match_expr.is_empty() {
            return Ok(vec![]);
        }

        let conn = self.conn()?;
        // bm25() is an FTS5 auxiliary function, so it is computed in the
        // inner per-row query; the outer query collapses duplicate bodies
        // (same hash under several paths) onto their best rank.
        let mut stmt = conn.prepare(
            "SELECT content_hash, MIN(rank_score) AS best
             FROM (
                 SELECT c.content_hash AS content_hash, bm25(chunks_fts) AS rank_score
                 FROM chunks_fts
                 JOIN chunks c ON c.rowid = chunks_fts.rowid
                 WHERE chunks_fts MATCH ?1
                   AND (?2 IS NULL OR c.lang = ?2)
                   AND (?3 IS NULL OR ember_glob(?3, c.path))
             )
             GROUP BY content_hash
             ORDER BY best ASC
             LIMIT ?4",
        )?;

        let hits = stmt
            .query_map(
                params![match_expr, filters.lang, filters.path_glob, k as i64],
                |r| {
                    Ok(RankedHit {
                        content_hash: r.get(0)?,
                        score: -r.get::<_, f64>(1)?,
                    })
                },
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(hits)
    }

    /// k nearest vectors by cosine distance. Candidates are constrained by
    /// the filters inside the query; similarity is a dot product because
    /// every stored vector is unit length.
    pub fn vector_search(
        &self,
        query_vec: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<RankedHit>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT v.content_hash, v.embedding
             FROM vectors v
             WHERE EXISTS (
                 SELECT 1 FROM chunks c
                 WHERE c.content_hash = v.content_hash
                   AND (?1 IS NULL OR c.lang = ?1)
                   AND (?2 IS NULL OR ember_glob(?2, c.path))
             )",
        )?;

        let mut scored: Vec<RankedHit> = stmt
            .query_map(params![filters.lang, filters.path_glob], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(hash, blob)| {
                let v = bytes_to_vector(&blob);
                if v.len() != query_vec.len() {
                    tracing::warn!(
                        "vector for {hash} has dimension {}, query has {}; skipping",
                        v.len(),
                        query_vec.len()
                    );
                    return None;
                }
                let dot: f32 = v.iter().zip(query_vec).map(|(a, b)| a * b).sum();
                Some(RankedHit {
                    content_hash: hash,
                    score: dot as f64,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    Ok(ChunkRecord {
        content_hash: row.get(0)?,
        project_id: row.get(1)?,
        path: row.get(2)?,
        lang: row.get(3)?,
        symbol: row.get(4)?,
        start_line: row.get(5)?,
        end_line: row.get(6)?,
        content: row.get(7)?,
        file_hash: row.get(8)?,
        tree_sha: row.get(9)?,
    })
}

fn prune_orphan_vectors(tx: &rusqlite::Transaction<'_>, hashes: &[String]) -> Result<()> {
    let mut stmt = tx.prepare(
        "DELETE FROM vectors WHERE content_hash = ?1
         AND NOT EXISTS (SELECT 1 FROM chunks WHERE chunks.content_hash = ?1)",
    )?;
    for hash in hashes {
        stmt.execute([hash])?;
    }
    Ok(())
}

/// Glob matching inside SQL. Compiled matchers are cached per pattern; an
/// invalid pattern is a user-function error (callers validate patterns
/// before they reach SQL, so this is a backstop).
fn register_glob_function(conn: &Connection) -> rusqlite::Result<()> {
    let cache: Mutex<HashMap<String, globset::GlobMatcher>> = Mutex::new(HashMap::new());
    conn.create_scalar_function(
        "ember_glob",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let pattern = ctx.get::<String>(0)?;
            let path = ctx.get::<String>(1)?;

            let mut cache = cache
                .lock()
                .map_err(|_| rusqlite::Error::UserFunctionError("glob cache poisoned".into()))?;
            if !cache.contains_key(&pattern) {
                let matcher = compile_path_glob(&pattern)
                    .map_err(|e| rusqlite::Error::UserFunctionError(e.to_string().into()))?;
                cache.insert(pattern.clone(), matcher);
            }
            Ok(cache[&pattern].is_match(&path))
        },
    )
}

// ── Vector wire format ──────────────────────────────────────────────────
// Little-endian IEEE-754 single precision, original coordinate order.

pub fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Build an FTS5 `MATCH` expression from user text. Parameter binding
/// protects against SQL injection but not against FTS syntax errors, so
/// tokens with non-word characters are double-quoted with internal quotes
/// doubled. Tokens are OR-joined: candidate recall is the ranker's job,
/// BM25 ordering sorts out which matches matter.
pub fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|tok| {
            let reserved = matches!(tok, "AND" | "OR" | "NOT" | "NEAR");
            if !reserved
                && !tok.is_empty()
                && tok.chars().all(|c| c.is_alphanumeric() || c == '_')
            {
                tok.to_string()
            } else {
                format!("\"{}\"", tok.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}
