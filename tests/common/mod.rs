//! Shared fixtures: a scratch git repository and a deterministic embedder
//! so tests never download model weights.

// Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use ember::embed::{l2_normalize, Embedder};
use ember::error::{EmberError, Result};

pub const STUB_DIM: usize = 16;

/// Token-bucket embedder: each lowercase token hashes into one of
/// `STUB_DIM` buckets, counts are L2-normalized. Texts sharing tokens get a
/// positive cosine, which is all the retrieval tests need.
pub struct TokenEmbedder {
    fingerprint: String,
    pub embed_calls: AtomicUsize,
}

impl TokenEmbedder {
    pub fn new() -> Self {
        Self::with_fingerprint("token-stub@1#d16")
    }

    pub fn with_fingerprint(fingerprint: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            embed_calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }
}

fn bucket(token: &str) -> usize {
    let mut h: u64 = 1469598103934665603;
    for b in token.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    (h % STUB_DIM as u64) as usize
}

impl Embedder for TokenEmbedder {
    fn name(&self) -> &str {
        "token-stub"
    }

    fn dim(&self) -> usize {
        STUB_DIM
    }

    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    fn warm(&self) -> Result<()> {
        Ok(())
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Err(EmberError::EmbedderFailure("no texts".into()));
        }
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0f32; STUB_DIM];
                for token in text
                    .split(|c: char| !c.is_alphanumeric() && c != '_')
                    .filter(|t| !t.is_empty())
                {
                    v[bucket(&token.to_lowercase())] += 1.0;
                }
                l2_normalize(&mut v);
                v
            })
            .collect())
    }
}

/// An embedder that always fails, for abort-path tests.
pub struct FailingEmbedder;

impl Embedder for FailingEmbedder {
    fn name(&self) -> &str {
        "failing-stub"
    }
    fn dim(&self) -> usize {
        STUB_DIM
    }
    fn fingerprint(&self) -> String {
        "token-stub@1#d16".into()
    }
    fn warm(&self) -> Result<()> {
        Ok(())
    }
    fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(EmberError::EmbedderFailure("synthetic failure".into()))
    }
}

// ── Git fixture ─────────────────────────────────────────────────────────

pub struct Repo {
    pub dir: tempfile::TempDir,
}

impl Repo {
    pub fn init() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "-q", "-b", "main"]);
        repo.git(&["config", "user.email", "test@example.com"]);
        repo.git(&["config", "user.name", "Test"]);
        repo
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .expect("run git");
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message, "--allow-empty"]);
    }

    pub fn head_tree(&self) -> String {
        self.git(&["rev-parse", "HEAD^{tree}"])
    }
}

pub fn math_py() -> &'static str {
    "def add(a, b):\n    return a + b\n\ndef multiply(a, b):\n    return a * b\n"
}

pub fn utils_ts() -> &'static str {
    "export function greet(name: string) { return \"hi \" + name }\n"
}
