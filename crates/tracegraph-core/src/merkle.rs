//! # Merkle Roots
//!
//! Order-independent digests over leaf sets.
//!
//! Leaves are sorted by key (then by hash, so duplicate keys are still
//! deterministic), paired as `H(left ∥ right)`, and the last node of an odd
//! level is paired with itself. An empty set has root `H("")`.

use crate::cancel::CancellationToken;
use crate::hashing::{digest_hex, file_leaf};
use crate::types::CoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use walkdir::WalkDir;

/// One keyed leaf.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MerkleLeaf {
    pub key: String,
    pub hash: String,
}

impl MerkleLeaf {
    #[must_use]
    pub fn new(key: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            hash: hash.into(),
        }
    }
}

/// Root of an empty tree.
#[must_use]
pub fn empty_root() -> String {
    digest_hex(b"")
}

/// Root over `leaves`, independent of their input order.
#[must_use]
pub fn merkle_root(leaves: &[MerkleLeaf]) -> String {
    let mut sorted: Vec<&MerkleLeaf> = leaves.iter().collect();
    sorted.sort();
    let mut level: Vec<String> = sorted.into_iter().map(|l| l.hash.clone()).collect();
    if level.is_empty() {
        return empty_root();
    }
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                digest_hex(format!("{}{}", left, right).as_bytes())
            })
            .collect();
    }
    level.swap_remove(0)
}

/// Merkle baseline of a directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTreeBaseline {
    pub root_path: String,
    pub file_count: usize,
    pub merkle_root: String,
    pub files: Vec<MerkleLeaf>,
}

/// Hash every regular file under `root`.
///
/// Keys are `/`-separated paths relative to `root`; directories contribute
/// nothing on their own.
pub fn file_tree_baseline(
    root: &Path,
    cancel: &CancellationToken,
) -> Result<FileTreeBaseline, CoreError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        cancel.check()?;
        let entry = entry.map_err(|e| CoreError::Io(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| CoreError::Io(e.to_string()))?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let bytes = std::fs::read(entry.path())?;
        files.push(MerkleLeaf::new(key.clone(), file_leaf(&key, &bytes)));
    }
    files.sort();
    Ok(FileTreeBaseline {
        root_path: root.display().to_string(),
        file_count: files.len(),
        merkle_root: merkle_root(&files),
        files,
    })
}
