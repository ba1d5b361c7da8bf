use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{EmberError, Result};
use crate::scanner;

/// Tree identity of the empty tree. Diffing a first-time index against this
/// sentinel yields the full file set.
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Upper bound on any single git invocation. A tunable, not a contract.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
}

#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub status: DiffStatus,
    /// Destination path for renames/copies, the path itself otherwise.
    pub path: String,
    /// Source path, present for renames and copies.
    pub old_path: Option<String>,
}

/// Git probe backed by the `git` CLI. Every operation shells out with the
/// repository root as cwd; failures carry the exit code and stderr.
pub struct GitProbe {
    root: PathBuf,
    ember_ignore: Option<ignore::gitignore::Gitignore>,
}

impl GitProbe {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ember_ignore: scanner::build_ember_ignore(root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Tree identity of the committed tree at HEAD. `NoCommits` when the
    /// repository has none.
    pub fn head_tree(&self) -> Result<String> {
        match self.run(&["rev-parse", "HEAD^{tree}"], &[]) {
            Ok(out) => Ok(first_line(&out)),
            Err(EmberError::VcsFailure { code: 128, .. }) => Err(EmberError::NoCommits),
            Err(e) => Err(e),
        }
    }

    /// Tree identity for an arbitrary revision.
    pub fn rev_tree(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{tree}}");
        let out = self.run(&["rev-parse", &spec], &[])?;
        Ok(first_line(&out))
    }

    /// Tree identity of the staged index (read-only use of `write-tree`).
    pub fn staged_tree(&self) -> Result<String> {
        let out = self.run(&["write-tree"], &[])?;
        Ok(first_line(&out))
    }

    /// Identity of a *virtual* tree reflecting working-tree bytes, untracked
    /// non-ignored files included.
    ///
    /// Built entirely against a scratch index file (`GIT_INDEX_FILE`), so the
    /// repository's real index is never touched on any exit path; the scratch
    /// file is released by the tempfile guard.
    pub fn worktree_tree(&self) -> Result<String> {
        // The scratch index must not pre-exist (git rejects zero-length
        // index files); hand git a fresh path inside a guard-owned dir.
        let scratch = tempfile::tempdir()
            .map_err(|e| EmberError::StorageFailure(format!("scratch index dir: {e}")))?;
        let index_path = scratch.path().join("index").to_string_lossy().to_string();
        let env: &[(&str, &str)] = &[("GIT_INDEX_FILE", index_path.as_str())];

        // Seed from HEAD when it exists so deletions show up; otherwise start
        // from an empty index (repo with no commits yet).
        match self.run(&["read-tree", "HEAD"], env) {
            Ok(_) => {}
            Err(EmberError::VcsFailure { code: 128, .. }) => {
                self.run(&["read-tree", "--empty"], env)?;
            }
            Err(e) => return Err(e),
        }

        // `.ember/` must never enter the virtual tree: the index database
        // changes on every run and would make the tree identity unstable.
        self.run(&["add", "-A", "--", ".", ":(exclude).ember"], env)?;
        let out = self.run(&["write-tree"], env)?;
        Ok(first_line(&out))
    }

    /// Changed paths between two trees, rename detection on. Unknown status
    /// letters are logged and skipped; non-UTF-8 paths are logged and skipped.
    pub fn diff(&self, from_tree: &str, to_tree: &str) -> Result<Vec<DiffEntry>> {
        let out = self.run_raw(
            &["diff-tree", "-r", "-z", "-M", "--name-status", from_tree, to_tree],
            &[],
        )?;
        Ok(parse_name_status_z(&out))
    }

    /// Every path in the given tree.
    pub fn list_files(&self, tree: &str) -> Result<Vec<String>> {
        let out = self.run_raw(&["ls-tree", "-r", "-z", "--name-only", tree], &[])?;
        let mut files = Vec::new();
        for token in out.split(|b| *b == 0) {
            if token.is_empty() {
                continue;
            }
            match std::str::from_utf8(token) {
                Ok(p) => files.push(p.to_string()),
                Err(_) => tracing::warn!("skipping non-UTF-8 path in tree {tree}"),
            }
        }
        Ok(files)
    }

    /// Blob bytes for `path` inside `tree`, or `None` when the tree has no
    /// such entry.
    pub fn read_file(&self, tree: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let spec = format!("{tree}:{path}");
        match self.run_raw(&["cat-file", "blob", &spec], &[]) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(EmberError::VcsFailure { code: 128, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Repository ignore rules plus `.emberignore`.
    pub fn is_ignored(&self, rel_path: &str) -> Result<bool> {
        if let Some(gi) = &self.ember_ignore {
            if gi.matched_path_or_any_parents(rel_path, false).is_ignore() {
                return Ok(true);
            }
        }

        let status = Command::new("git")
            .args(["check-ignore", "-q", "--", rel_path])
            .current_dir(&self.root)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| EmberError::VcsFailure {
                command: "check-ignore".into(),
                code: -1,
                stderr: e.to_string(),
            })?;

        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(EmberError::VcsFailure {
                command: "check-ignore".into(),
                code: code.unwrap_or(-1),
                stderr: String::new(),
            }),
        }
    }

    // ── Process plumbing ─────────────────────────────────────────────────

    fn run(&self, args: &[&str], envs: &[(&str, &str)]) -> Result<String> {
        let bytes = self.run_raw(args, envs)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Run git with a bounded wall-clock timeout. Stdout/stderr are drained
    /// on reader threads so large outputs cannot deadlock the child.
    fn run_raw(&self, args: &[&str], envs: &[(&str, &str)]) -> Result<Vec<u8>> {
        let command_label = args.join(" ");
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in envs {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| EmberError::VcsFailure {
            command: command_label.clone(),
            code: -1,
            stderr: format!("failed to spawn git: {e}"),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_handle = std::thread::spawn(move || drain(stdout));
        let err_handle = std::thread::spawn(move || drain(stderr));

        let deadline = Instant::now() + GIT_TIMEOUT;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(EmberError::VcsFailure {
                            command: command_label,
                            code: -1,
                            stderr: format!("timed out after {}s", GIT_TIMEOUT.as_secs()),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(EmberError::VcsFailure {
                        command: command_label,
                        code: -1,
                        stderr: e.to_string(),
                    })
                }
            }
        };

        let stdout = out_handle.join().unwrap_or_default();
        let stderr = err_handle.join().unwrap_or_default();

        if !status.success() {
            return Err(EmberError::VcsFailure {
                command: command_label,
                code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or("").trim().to_string()
}

/// Parse `diff-tree -z --name-status` output: NUL-separated tokens of
/// `status, path` for A/M/D and `status, old, new` for R/C.
fn parse_name_status_z(raw: &[u8]) -> Vec<DiffEntry> {
    let mut entries = Vec::new();
    let mut tokens = raw.split(|b| *b == 0).filter(|t| !t.is_empty());

    while let Some(status_tok) = tokens.next() {
        let status_str = match std::str::from_utf8(status_tok) {
            Ok(s) => s,
            Err(_) => {
                tracing::warn!("skipping diff entry with non-UTF-8 status token");
                continue;
            }
        };

        let letter = status_str.chars().next().unwrap_or('?');
        let two_paths = matches!(letter, 'R' | 'C');

        let first = tokens.next();
        let second = if two_paths { tokens.next() } else { None };

        let decode = |tok: Option<&[u8]>| -> Option<String> {
            let tok = tok?;
            match std::str::from_utf8(tok) {
                Ok(s) => Some(s.to_string()),
                Err(_) => None,
            }
        };

        let status = match letter {
            'A' => DiffStatus::Added,
            'M' => DiffStatus::Modified,
            'D' => DiffStatus::Deleted,
            'R' => DiffStatus::Renamed,
            'C' => DiffStatus::Copied,
            other => {
                tracing::warn!("skipping diff entry with unknown status {other:?}");
                continue;
            }
        };

        match (two_paths, decode(first), decode(second)) {
            (false, Some(path), _) => entries.push(DiffEntry {
                status,
                path,
                old_path: None,
            }),
            (true, Some(old), Some(new)) => entries.push(DiffEntry {
                status,
                path: new,
                old_path: Some(old),
            }),
            _ => tracing::warn!("skipping diff entry with non-UTF-8 path (status {status_str})"),
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn z(parts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in parts {
            out.extend_from_slice(p.as_bytes());
            out.push(0);
        }
        out
    }

    #[test]
    fn parses_added_modified_deleted() {
        let raw = z(&["A", "src/new.rs", "M", "src/lib.rs", "D", "old.py"]);
        let entries = parse_name_status_z(&raw);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].status, DiffStatus::Added);
        assert_eq!(entries[0].path, "src/new.rs");
        assert_eq!(entries[1].status, DiffStatus::Modified);
        assert_eq!(entries[2].status, DiffStatus::Deleted);
        assert!(entries.iter().all(|e| e.old_path.is_none()));
    }

    #[test]
    fn parses_rename_with_similarity_score() {
        let raw = z(&["R087", "utils.ts", "lib/utils.ts"]);
        let entries = parse_name_status_z(&raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, DiffStatus::Renamed);
        assert_eq!(entries[0].path, "lib/utils.ts");
        assert_eq!(entries[0].old_path.as_deref(), Some("utils.ts"));
    }

    #[test]
    fn unknown_status_letters_are_skipped_not_fatal() {
        let raw = z(&["X", "weird.rs", "A", "ok.rs"]);
        let entries = parse_name_status_z(&raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "ok.rs");
    }

    #[test]
    fn non_utf8_paths_are_skipped_not_fatal() {
        let mut raw = z(&["A"]);
        raw.extend_from_slice(&[0xff, 0xfe, 0x00]);
        raw.extend_from_slice(&z(&["M", "fine.rs"]));
        let entries = parse_name_status_z(&raw);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "fine.rs");
    }
}
