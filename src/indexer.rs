use rayon::prelude::*;
use std::collections::HashSet;

use crate::chunker::{chunk_file, ChunkCandidate};
use crate::config::Config;
use crate::embed::Embedder;
use crate::error::{EmberError, Result};
use crate::hash::hash_bytes;
use crate::scanner::{compile_path_glob, lang_for_path, FileFilter};
use crate::storage::{StagedChunk, Store};
use crate::vcs::{DiffStatus, GitProbe};
use crate::workspace::Workspace;

/// How the target tree is chosen for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Virtual tree over working-tree bytes, untracked files included.
    Worktree,
    /// The staged index.
    Staged,
    /// A committed revision (`HEAD`, a branch, a sha).
    Rev(String),
}

impl SyncMode {
    pub fn label(&self) -> String {
        match self {
            SyncMode::Worktree => "worktree".to_string(),
            SyncMode::Staged => "staged".to_string(),
            SyncMode::Rev(r) => format!("rev:{r}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub mode: SyncMode,
    pub force_reindex: bool,
    /// Globs over repo-relative paths; empty means the whole tree.
    pub path_filters: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct IndexResponse {
    pub files_indexed: u64,
    pub files_failed: u64,
    pub chunks_created: u64,
    pub chunks_updated: u64,
    pub chunks_deleted: u64,
    /// True when the run was served from the diff path (or needed no work),
    /// false for a full scan.
    pub incremental: bool,
    pub tree_sha: String,
}

/// Progress events surfaced to the shell. The model-loading phase is
/// distinct so the first embedded file does not appear mysteriously slow.
#[derive(Debug, Clone)]
pub enum ProgressEvent<'a> {
    Scanning,
    LoadingModel,
    FileIndexed {
        path: &'a str,
        done: usize,
        total: usize,
    },
    Deleting {
        paths: usize,
    },
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent<'_>);
}

/// Sink for callers that do not render progress.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn event(&self, _event: ProgressEvent<'_>) {}
}

enum Prepared {
    /// Bytes read and chunked; ready to embed and stage.
    Ready {
        path: String,
        lang: &'static str,
        file_hash: String,
        candidates: Vec<ChunkCandidate>,
    },
    /// Read but empty: stage an empty set so old rows clear.
    Empty { path: String },
    /// Binary or oversized; not an error, just outside the index.
    Skipped,
    /// I/O or chunking failure; previously indexed chunks are preserved.
    Failed { path: String },
}

/// Diff-driven synchronization: compute the work set from two tree
/// identities, run chunk → embed → persist per file, and keep every
/// §invariant of the chunk/vector stores intact on all exit paths.
pub struct Indexer<'a> {
    ws: &'a Workspace,
    cfg: &'a Config,
    store: &'a Store,
    vcs: &'a GitProbe,
    embedder: &'a dyn Embedder,
}

impl<'a> Indexer<'a> {
    pub fn new(
        ws: &'a Workspace,
        cfg: &'a Config,
        store: &'a Store,
        vcs: &'a GitProbe,
        embedder: &'a dyn Embedder,
    ) -> Self {
        Self {
            ws,
            cfg,
            store,
            vcs,
            embedder,
        }
    }

    pub fn index(
        &self,
        req: &IndexRequest,
        progress: &dyn ProgressSink,
    ) -> Result<IndexResponse> {
        // Malformed filters are user errors regardless of how far the run
        // would have gotten.
        let globs = req
            .path_filters
            .iter()
            .map(|p| compile_path_glob(p))
            .collect::<Result<Vec<_>>>()?;

        // 1. Target tree.
        let target = match &req.mode {
            SyncMode::Worktree => self.vcs.worktree_tree()?,
            SyncMode::Staged => self.vcs.staged_tree()?,
            SyncMode::Rev(rev) if rev == "HEAD" => self.vcs.head_tree()?,
            SyncMode::Rev(rev) => self.vcs.rev_tree(rev)?,
        };

        // 2. Fingerprint gate: never mix vector spaces.
        let current_fp = self.embedder.fingerprint();
        let stored_fp = self.store.meta_get("model_fingerprint")?;
        let fp_mismatch = stored_fp.as_deref().is_some_and(|f| f != current_fp);
        if fp_mismatch && !req.force_reindex {
            return Err(EmberError::FingerprintMismatch {
                indexed: stored_fp.unwrap_or_default(),
                current: current_fp,
            });
        }

        // 3. Early out.
        let last_tree = self.store.meta_get("last_tree_sha")?;
        if !req.force_reindex && last_tree.as_deref() == Some(target.as_str()) {
            tracing::debug!("tree {target} already indexed, nothing to do");
            return Ok(IndexResponse {
                incremental: true,
                tree_sha: target,
                ..Default::default()
            });
        }

        // 4. Work set.
        progress.event(ProgressEvent::Scanning);
        let full_scan = req.force_reindex || last_tree.is_none();
        let mut work: Vec<String> = Vec::new();
        let mut deletions: Vec<String> = Vec::new();

        if full_scan {
            work = self.vcs.list_files(&target)?;
        } else {
            let base = last_tree.as_deref().unwrap_or(crate::vcs::EMPTY_TREE);
            for entry in self.vcs.diff(base, &target)? {
                match entry.status {
                    DiffStatus::Added | DiffStatus::Modified | DiffStatus::Copied => {
                        work.push(entry.path)
                    }
                    DiffStatus::Renamed => {
                        if let Some(old) = entry.old_path {
                            deletions.push(old);
                        }
                        work.push(entry.path);
                    }
                    DiffStatus::Deleted => deletions.push(entry.path),
                }
            }
        }

        // 5. File filter: extension whitelist, ignore rules, user globs.
        let filter = FileFilter::new(self.ws.root(), &self.cfg.index.exclude_dir_names);
        let admitted = |path: &str| -> bool {
            filter.admits(path) && (globs.is_empty() || globs.iter().any(|g| g.is_match(path)))
        };
        work.retain(|p| admitted(p));
        work.sort();
        work.dedup();
        deletions.retain(|p| globs.is_empty() || globs.iter().any(|g| g.is_match(p)));

        if fp_mismatch {
            // force_reindex is set (gated above): the old vector space goes
            // away wholesale before the new one is written.
            tracing::warn!(
                "model fingerprint changed ({} -> {current_fp}); re-embedding everything",
                stored_fp.as_deref().unwrap_or("<none>")
            );
            self.store.clear_vectors()?;
        }

        // Parallel read + hash + chunk; embedding and writes stay sequential.
        let worktree_mode = req.mode == SyncMode::Worktree;
        let prepared: Vec<Prepared> = work
            .par_iter()
            .map(|path| self.prepare_file(path, &target, worktree_mode))
            .collect();

        let mut resp = IndexResponse {
            incremental: !full_scan,
            tree_sha: target.clone(),
            ..Default::default()
        };
        let mut preserved_paths: Vec<String> = Vec::new();
        let mut model_warmed = false;
        let total = prepared.len();

        // 6 + 7. Per-file indexing.
        for (done, prep) in prepared.into_iter().enumerate() {
            match prep {
                Prepared::Skipped => {}
                Prepared::Failed { path } => {
                    resp.files_failed += 1;
                    preserved_paths.push(path);
                }
                Prepared::Empty { path } => {
                    let out = self.store.stage_file(
                        self.ws.project_id(),
                        &path,
                        lang_for_path(&path),
                        "",
                        &target,
                        &[],
                        self.embedder.dim(),
                    )?;
                    resp.chunks_deleted += out.deleted;
                }
                Prepared::Ready {
                    path,
                    lang,
                    file_hash,
                    candidates,
                } => {
                    if !model_warmed {
                        progress.event(ProgressEvent::LoadingModel);
                        self.embedder.warm()?;
                        model_warmed = true;
                    }

                    let staged = self.embed_candidates(candidates)?;
                    let out = self.store.stage_file(
                        self.ws.project_id(),
                        &path,
                        lang,
                        &file_hash,
                        &target,
                        &staged,
                        self.embedder.dim(),
                    )?;
                    resp.chunks_created += out.created;
                    resp.chunks_updated += out.updated;
                    resp.chunks_deleted += out.deleted;
                    resp.files_indexed += 1;
                    progress.event(ProgressEvent::FileIndexed {
                        path: &path,
                        done: done + 1,
                        total,
                    });
                }
            }
        }

        // 8. Deletions (removed files and rename sources).
        if !deletions.is_empty() {
            progress.event(ProgressEvent::Deleting {
                paths: deletions.len(),
            });
            resp.chunks_deleted += self.store.delete_paths(&deletions)?;
        }

        // Preserve what the sweep must not eat: files whose re-chunking
        // failed keep their old rows, and in runs that did not visit the
        // whole tree every untouched row is still valid at the target.
        self.store.bump_tree_sha_for_paths(&preserved_paths, &target)?;
        if let Some(last) = last_tree.as_deref() {
            if !full_scan || !globs.is_empty() {
                self.store.refresh_tree_sha(last, &target)?;
            }
        }

        // 9. Metadata; nothing above this line committed a new tree identity.
        let dim = self.embedder.dim().to_string();
        let now = unix_now().to_string();
        self.store.meta_set_many(&[
            ("last_tree_sha", &target),
            ("last_sync_mode", &req.mode.label()),
            ("model_fingerprint", &current_fp),
            ("embedder_name", self.embedder.name()),
            ("embedder_dim", &dim),
            ("project_id", self.ws.project_id()),
            ("last_indexed_at", &now),
        ])?;

        // 10. Final sweep, then the human-readable mirror.
        resp.chunks_deleted += self.store.sweep_stale(&target)?;
        self.ws.write_state(&[
            ("last_tree_sha", &target),
            ("last_sync_mode", &req.mode.label()),
            ("model_fingerprint", &current_fp),
            ("embedder_dim", &dim),
        ]);

        Ok(resp)
    }

    fn prepare_file(&self, path: &str, target_tree: &str, worktree_mode: bool) -> Prepared {
        let bytes = if worktree_mode {
            match std::fs::read(self.ws.root().join(path)) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("cannot read {path}: {e}");
                    return Prepared::Failed {
                        path: path.to_string(),
                    };
                }
            }
        } else {
            match self.vcs.read_file(target_tree, path) {
                Ok(Some(b)) => b,
                Ok(None) => {
                    tracing::warn!("{path} vanished from tree {target_tree}");
                    return Prepared::Failed {
                        path: path.to_string(),
                    };
                }
                Err(e) => {
                    tracing::warn!("cannot read {path}: {e}");
                    return Prepared::Failed {
                        path: path.to_string(),
                    };
                }
            }
        };

        if bytes.len() as u64 > self.cfg.index.max_file_bytes {
            tracing::debug!("{path} exceeds max_file_bytes, skipping");
            return Prepared::Skipped;
        }
        if bytes.contains(&0u8) {
            tracing::debug!("{path} looks binary, skipping");
            return Prepared::Skipped;
        }

        let text = String::from_utf8_lossy(&bytes);
        if text.trim().is_empty() {
            return Prepared::Empty {
                path: path.to_string(),
            };
        }

        let lang = lang_for_path(path);
        let candidates = chunk_file(path, lang, &text, &self.cfg.chunking);
        if candidates.is_empty() {
            // Non-empty file, zero chunks: a chunking failure. The file
            // counts as failed and its previously indexed chunks stay.
            return Prepared::Failed {
                path: path.to_string(),
            };
        }

        Prepared::Ready {
            path: path.to_string(),
            lang,
            file_hash: hash_bytes(&bytes),
            candidates,
        }
    }

    /// Turn candidates into staged rows, embedding only bodies the vector
    /// store has never seen (one embed round-trip per file).
    fn embed_candidates(&self, candidates: Vec<ChunkCandidate>) -> Result<Vec<StagedChunk>> {
        let mut staged: Vec<StagedChunk> = Vec::with_capacity(candidates.len());
        let mut in_file: HashSet<String> = HashSet::new();

        for c in candidates {
            let content_hash = hash_bytes(c.content.as_bytes());
            // Identical bodies within one file collapse to one row.
            if !in_file.insert(content_hash.clone()) {
                continue;
            }
            staged.push(StagedChunk {
                content_hash,
                symbol: c.symbol,
                start_line: c.start_line,
                end_line: c.end_line,
                content: c.content,
                vector: None,
            });
        }

        let hashes: Vec<String> = staged.iter().map(|s| s.content_hash.clone()).collect();
        let known = self.store.existing_vector_hashes(&hashes)?;

        let need: Vec<usize> = staged
            .iter()
            .enumerate()
            .filter(|(_, s)| !known.contains(&s.content_hash))
            .map(|(i, _)| i)
            .collect();

        if !need.is_empty() {
            let texts: Vec<String> = need.iter().map(|i| staged[*i].content.clone()).collect();
            let vectors = self.embedder.embed(&texts)?;
            for (slot, vector) in need.into_iter().zip(vectors) {
                staged[slot].vector = Some(vector);
            }
        }

        Ok(staged)
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
