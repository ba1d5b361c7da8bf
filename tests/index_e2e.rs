//! End-to-end pipeline scenarios against a real git repository, with the
//! deterministic token embedder standing in for the model.

mod common;

use common::{math_py, utils_ts, Repo, TokenEmbedder};
use ember::config::Config;
use ember::embed::Embedder;
use ember::error::EmberError;
use ember::hash::hash_text;
use ember::indexer::{IndexRequest, Indexer, NullProgress, SyncMode};
use ember::searcher::{Query, Searcher};
use ember::storage::Store;
use ember::vcs::GitProbe;
use ember::workspace::Workspace;
use std::sync::Arc;

struct Fixture {
    repo: Repo,
    ws: Workspace,
    cfg: Config,
    store: Arc<Store>,
    embedder: TokenEmbedder,
}

impl Fixture {
    fn new() -> Self {
        let repo = Repo::init();
        // Keep the index out of the fixture's own history.
        repo.write(".gitignore", ".ember/\n");
        let ws = Workspace::init(repo.root()).unwrap();
        let store = Arc::new(Store::open(&ws.db_path()).unwrap());
        Self {
            repo,
            ws,
            cfg: Config::default(),
            store,
            embedder: TokenEmbedder::new(),
        }
    }

    fn index(&self, mode: SyncMode) -> ember::indexer::IndexResponse {
        self.try_index(mode, false).unwrap()
    }

    fn try_index(
        &self,
        mode: SyncMode,
        force_reindex: bool,
    ) -> Result<ember::indexer::IndexResponse, EmberError> {
        let vcs = GitProbe::new(self.ws.root());
        let indexer = Indexer::new(&self.ws, &self.cfg, &self.store, &vcs, &self.embedder);
        indexer.index(
            &IndexRequest {
                mode,
                force_reindex,
                path_filters: vec![],
            },
            &NullProgress,
        )
    }

    fn search(&self, text: &str, topk: usize, path_filter: Option<&str>) -> Vec<ember::searcher::SearchResult> {
        let searcher = Searcher::new(
            Arc::clone(&self.store),
            Arc::new(TokenEmbedder::new()),
        );
        searcher
            .search(&Query {
                text: text.to_string(),
                topk,
                path_filter: path_filter.map(str::to_string),
                lang_filter: None,
            })
            .unwrap()
    }
}

#[test]
fn fresh_index_builds_one_chunk_per_definition() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.write("utils.ts", utils_ts());
    f.repo.commit_all("initial");

    let resp = f.index(SyncMode::Rev("HEAD".into()));

    assert_eq!(resp.files_indexed, 2);
    assert_eq!(resp.files_failed, 0);
    assert_eq!(resp.chunks_created, 3);
    assert!(!resp.incremental);

    // Chunk and vector cardinalities move in lockstep.
    assert_eq!(f.store.chunk_count().unwrap(), 3);
    assert_eq!(f.store.vector_count().unwrap(), 3);

    // The recorded tree identity is the commit's tree.
    assert_eq!(
        f.store.meta_get("last_tree_sha").unwrap().unwrap(),
        f.repo.head_tree()
    );
    assert_eq!(
        f.store.meta_get("model_fingerprint").unwrap().unwrap(),
        f.embedder.fingerprint()
    );

    // All three symbols are present and carry 1-based line ranges.
    let add = f
        .store
        .get_chunk(&hash_text("def add(a, b):\n    return a + b"))
        .unwrap()
        .expect("add chunk");
    assert_eq!(add.symbol, "add");
    assert_eq!((add.start_line, add.end_line), (1, 2));
    assert_eq!(add.lang, "py");
    assert_eq!(add.path, "math.py");
}

#[test]
fn reindexing_the_same_tree_is_a_noop() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.commit_all("initial");

    f.index(SyncMode::Rev("HEAD".into()));
    let tree_before = f.store.meta_get("last_tree_sha").unwrap().unwrap();
    let calls_before = f.embedder.calls();

    let resp = f.index(SyncMode::Rev("HEAD".into()));

    assert!(resp.incremental);
    assert_eq!(resp.files_indexed, 0);
    assert_eq!(resp.chunks_created, 0);
    assert_eq!(resp.chunks_deleted, 0);
    assert_eq!(f.embedder.calls(), calls_before);
    assert_eq!(
        f.store.meta_get("last_tree_sha").unwrap().unwrap(),
        tree_before
    );
}

#[test]
fn modifying_one_file_touches_only_its_chunks() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.write("utils.ts", utils_ts());
    f.repo.commit_all("initial");
    f.index(SyncMode::Rev("HEAD".into()));

    let old_multiply = hash_text("def multiply(a, b):\n    return a * b");
    let add_hash = hash_text("def add(a, b):\n    return a + b");
    let greet_hash = hash_text(utils_ts().trim_end());

    f.repo.write(
        "math.py",
        "def add(a, b):\n    return a + b\n\ndef multiply(a, b):\n    return a * b * 1\n",
    );
    f.repo.commit_all("tweak multiply");
    let resp = f.index(SyncMode::Rev("HEAD".into()));

    assert!(resp.incremental);
    assert_eq!(resp.files_indexed, 1);

    // add and greet survive under the same identities.
    assert!(f.store.get_chunk(&add_hash).unwrap().is_some());
    assert!(f.store.get_chunk(&greet_hash).unwrap().is_some());

    // multiply was replaced: old row gone, new row present.
    assert!(f.store.get_chunk(&old_multiply).unwrap().is_none());
    let new_multiply = hash_text("def multiply(a, b):\n    return a * b * 1");
    assert!(f.store.get_chunk(&new_multiply).unwrap().is_some());

    assert_eq!(f.store.chunk_count().unwrap(), 3);
    assert_eq!(f.store.vector_count().unwrap(), 3);

    // Invariant: nothing survives with a stale tree identity.
    assert_eq!(
        f.store.meta_get("last_tree_sha").unwrap().unwrap(),
        f.repo.head_tree()
    );
    assert_eq!(f.store.sweep_stale(&f.repo.head_tree()).unwrap(), 0);
}

#[test]
fn renaming_a_file_moves_the_chunk_without_reembedding() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.write("utils.ts", utils_ts());
    f.repo.commit_all("initial");
    f.index(SyncMode::Rev("HEAD".into()));

    let greet_hash = hash_text(utils_ts().trim_end());
    let calls_before = f.embedder.calls();

    f.repo.git(&["mv", "utils.ts", "lib/utils.ts"]);
    f.repo.commit_all("move utils");
    let resp = f.index(SyncMode::Rev("HEAD".into()));

    let greet = f.store.get_chunk(&greet_hash).unwrap().expect("greet chunk");
    assert_eq!(greet.path, "lib/utils.ts");

    // The body was already embedded; the rename reused its vector.
    assert_eq!(f.embedder.calls(), calls_before);
    assert_eq!(resp.chunks_created, 1);
    assert_eq!(resp.chunks_deleted, 1);
    assert_eq!(f.store.chunk_count().unwrap(), 3);
    assert_eq!(f.store.vector_count().unwrap(), 3);
}

#[test]
fn symbol_query_ranks_the_definition_first_with_both_scores() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.write("utils.ts", utils_ts());
    f.repo.commit_all("initial");
    f.index(SyncMode::Rev("HEAD".into()));

    let results = f.search("multiply", 5, None);

    assert!(!results.is_empty());
    let top = &results[0];
    assert_eq!(top.rank, 1);
    assert_eq!(top.chunk.symbol, "multiply");
    assert!(top.lexical_score.expect("lexical score") > 0.0);
    assert!(top.vector_score.expect("vector score") > 0.0);
    assert!(top.fused_score > 0.0);
}

#[test]
fn glob_filter_constrains_the_candidate_queries_themselves() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.write("utils.ts", utils_ts());
    f.repo.commit_all("initial");
    f.index(SyncMode::Rev("HEAD".into()));

    let results = f.search("function greet multiply", 3, Some("*.ts"));

    assert!(!results.is_empty());
    assert!(results.len() <= 3);
    assert!(results.iter().all(|r| r.chunk.path.ends_with(".ts")));
}

#[test]
fn topk_bounds_the_result_count() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.write("utils.ts", utils_ts());
    f.repo.commit_all("initial");
    f.index(SyncMode::Rev("HEAD".into()));

    assert_eq!(f.search("add multiply greet function return", 1, None).len(), 1);
    assert!(f.search("add multiply greet function return", 100, None).len() <= 3);
}

#[test]
fn empty_queries_are_rejected_with_a_hint() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.commit_all("initial");
    f.index(SyncMode::Rev("HEAD".into()));

    let searcher = Searcher::new(Arc::clone(&f.store), Arc::new(TokenEmbedder::new()));
    let err = searcher
        .search(&Query {
            text: "   ".into(),
            topk: 5,
            path_filter: None,
            lang_filter: None,
        })
        .unwrap_err();
    assert!(matches!(err, EmberError::InvalidQuery { .. }));

    let err = searcher
        .search(&Query {
            text: "fine".into(),
            topk: 0,
            path_filter: None,
            lang_filter: None,
        })
        .unwrap_err();
    assert!(matches!(err, EmberError::InvalidQuery { .. }));
}

#[test]
fn empty_repository_indexes_to_zero_chunks() {
    let f = Fixture::new();
    f.repo.commit_all("empty");

    let resp = f.index(SyncMode::Rev("HEAD".into()));

    // No indexable files, yet the run succeeds and records the tree.
    assert_eq!(resp.files_indexed, 0);
    assert_eq!(f.store.chunk_count().unwrap(), 0);
    assert_eq!(f.store.vector_count().unwrap(), 0);
    assert_eq!(
        f.store.meta_get("last_tree_sha").unwrap().unwrap(),
        f.repo.head_tree()
    );
}

#[test]
fn rev_mode_without_commits_is_a_user_error() {
    let f = Fixture::new();
    let err = f.try_index(SyncMode::Rev("HEAD".into()), false).unwrap_err();
    assert!(matches!(err, EmberError::NoCommits));

    // A named revision that cannot resolve surfaces the git failure.
    let err = f
        .try_index(SyncMode::Rev("no-such-branch".into()), false)
        .unwrap_err();
    assert!(matches!(err, EmberError::VcsFailure { .. }));
}

#[test]
fn worktree_mode_sees_untracked_files_and_leaves_the_real_index_alone() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.commit_all("initial");
    f.repo.write("scratch.py", "def probe():\n    return 42\n");

    let resp = f.index(SyncMode::Worktree);
    assert_eq!(resp.files_indexed, 2);
    assert!(f
        .store
        .get_chunk(&hash_text("def probe():\n    return 42"))
        .unwrap()
        .is_some());

    // The virtual tree never staged anything in the real index.
    assert_eq!(f.repo.git(&["diff", "--cached", "--name-only"]), "");
    let status = f.repo.git(&["status", "--porcelain"]);
    assert!(status.contains("?? scratch.py"), "status was: {status}");
}

#[test]
fn worktree_reindex_is_idempotent() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.commit_all("initial");

    let first = f.index(SyncMode::Worktree);
    assert_eq!(first.files_indexed, 1);

    // Nothing changed on disk (the .ember db itself is excluded from the
    // virtual tree), so the second run early-outs.
    let second = f.index(SyncMode::Worktree);
    assert!(second.incremental);
    assert_eq!(second.files_indexed, 0);
    assert_eq!(second.chunks_created, 0);
}

#[test]
fn fingerprint_mismatch_blocks_unforced_runs_and_yields_to_forced_ones() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.commit_all("initial");
    f.index(SyncMode::Rev("HEAD".into()));

    // Same dimension, different model identity.
    let other = TokenEmbedder::with_fingerprint("token-stub@2#d16");
    let vcs = GitProbe::new(f.ws.root());
    let indexer = Indexer::new(&f.ws, &f.cfg, &f.store, &vcs, &other);

    let err = indexer
        .index(
            &IndexRequest {
                mode: SyncMode::Rev("HEAD".into()),
                force_reindex: false,
                path_filters: vec![],
            },
            &NullProgress,
        )
        .unwrap_err();
    assert!(matches!(err, EmberError::FingerprintMismatch { .. }));
    // The gate fired before anything moved.
    assert_eq!(
        f.store.meta_get("model_fingerprint").unwrap().unwrap(),
        "token-stub@1#d16"
    );

    let resp = indexer
        .index(
            &IndexRequest {
                mode: SyncMode::Rev("HEAD".into()),
                force_reindex: true,
                path_filters: vec![],
            },
            &NullProgress,
        )
        .unwrap();
    assert_eq!(resp.chunks_updated, 2);
    assert!(other.calls() > 0, "forced run must re-embed");
    assert_eq!(
        f.store.meta_get("model_fingerprint").unwrap().unwrap(),
        "token-stub@2#d16"
    );
    assert_eq!(f.store.vector_count().unwrap(), 2);
}

#[test]
fn embedder_failure_aborts_without_committing_the_tree() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.commit_all("initial");

    let vcs = GitProbe::new(f.ws.root());
    let failing = common::FailingEmbedder;
    let indexer = Indexer::new(&f.ws, &f.cfg, &f.store, &vcs, &failing);
    let err = indexer
        .index(
            &IndexRequest {
                mode: SyncMode::Rev("HEAD".into()),
                force_reindex: false,
                path_filters: vec![],
            },
            &NullProgress,
        )
        .unwrap_err();

    assert!(matches!(err, EmberError::EmbedderFailure(_)));
    assert_eq!(f.store.meta_get("last_tree_sha").unwrap(), None);

    // A healthy embedder picks the run back up from scratch.
    let resp = f.index(SyncMode::Rev("HEAD".into()));
    assert_eq!(resp.chunks_created, 2);
}

#[test]
fn path_filters_scope_the_run_to_matching_files() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.write("utils.ts", utils_ts());
    f.repo.commit_all("initial");

    let vcs = GitProbe::new(f.ws.root());
    let indexer = Indexer::new(&f.ws, &f.cfg, &f.store, &vcs, &f.embedder);
    let resp = indexer
        .index(
            &IndexRequest {
                mode: SyncMode::Rev("HEAD".into()),
                force_reindex: false,
                path_filters: vec!["**/*.py".into()],
            },
            &NullProgress,
        )
        .unwrap();

    assert_eq!(resp.files_indexed, 1);
    assert_eq!(f.store.chunk_count().unwrap(), 2);
    assert!(f
        .store
        .get_chunk(&hash_text(utils_ts().trim_end()))
        .unwrap()
        .is_none());

    let err = indexer
        .index(
            &IndexRequest {
                mode: SyncMode::Rev("HEAD".into()),
                force_reindex: false,
                path_filters: vec!["src/[".into()],
            },
            &NullProgress,
        )
        .unwrap_err();
    assert!(matches!(err, EmberError::InvalidPathFilter { .. }));
}

#[test]
fn duplicate_bodies_across_files_share_one_vector() {
    let f = Fixture::new();
    let body = "def helper():\n    return 1\n";
    f.repo.write("a.py", body);
    f.repo.write("b.py", body);
    f.repo.commit_all("twins");

    f.index(SyncMode::Rev("HEAD".into()));

    // Two rows (one per path), one vector for the shared body.
    assert_eq!(f.store.chunk_count().unwrap(), 2);
    assert_eq!(f.store.vector_count().unwrap(), 1);
}

#[test]
fn staged_mode_indexes_the_index_not_the_worktree() {
    let f = Fixture::new();
    f.repo.write("math.py", math_py());
    f.repo.commit_all("initial");

    // Stage one change, leave another unstaged on top of it.
    f.repo.write("math.py", "def staged(a):\n    return a\n");
    f.repo.git(&["add", "math.py"]);
    f.repo.write("math.py", "def unstaged(a):\n    return a\n");

    f.index(SyncMode::Staged);

    assert!(f
        .store
        .get_chunk(&hash_text("def staged(a):\n    return a"))
        .unwrap()
        .is_some());
    assert!(f
        .store
        .get_chunk(&hash_text("def unstaged(a):\n    return a"))
        .unwrap()
        .is_none());
    assert_eq!(
        f.store.meta_get("last_sync_mode").unwrap().unwrap(),
        "staged"
    );
}
