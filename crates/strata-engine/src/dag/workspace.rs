use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use strata_core::error::{Result, StrataError};

/// Directory name holding per-node working directories inside a run directory.
pub const NODES_DIR: &str = "nodes";
/// Directory name merged node outputs land in.
pub const SHARED_DIR: &str = "shared";

/// On-disk layout of run working directories:
/// `<root>/<run_id>/{shared,nodes/<node_id>,...}`.
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    root: PathBuf,
}

impl RunWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn shared_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(SHARED_DIR)
    }

    pub fn node_dir(&self, run_id: &str, node_id: &str) -> PathBuf {
        self.run_dir(run_id).join(NODES_DIR).join(node_id)
    }

    /// Create a node's working directory seeded with the current shared state.
    pub fn prepare_node_dir(&self, run_id: &str, node_id: &str) -> Result<PathBuf> {
        let dir = self.node_dir(run_id, node_id);
        std::fs::create_dir_all(&dir)?;
        let seeded = copy_tree(&self.shared_dir(run_id), &dir)?;
        debug!(run_id, node_id, files = seeded, "Node working directory prepared");
        Ok(dir)
    }

    /// Merge node directories into `shared/` in the given order; later nodes
    /// overwrite earlier ones on conflicting paths. Returns files copied.
    pub fn merge_level(&self, run_id: &str, node_ids: &[String]) -> Result<usize> {
        let shared = self.shared_dir(run_id);
        std::fs::create_dir_all(&shared)?;
        let mut total = 0;
        for node_id in node_ids {
            total += copy_tree(&self.node_dir(run_id, node_id), &shared)?;
        }
        debug!(run_id, nodes = node_ids.len(), files = total, "Level merged into shared");
        Ok(total)
    }
}

/// Recursively copy `src` into `dst`. A missing `src` copies nothing.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    if !src.is_dir() {
        return Ok(0);
    }
    let mut copied = 0;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| StrataError::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| StrataError::Io(std::io::Error::other(e.to_string())))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// sha256 of every file under `dir`, keyed by `/`-separated relative path.
/// Paths whose first component is in `exclude` are skipped.
pub fn file_digests(dir: &Path, exclude: &[&str]) -> Result<BTreeMap<String, String>> {
    let mut digests = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(digests);
    }
    let walker = WalkDir::new(dir).min_depth(1).into_iter().filter_entry(|e| {
        let top_level = e.depth() == 1;
        !(top_level && exclude.iter().any(|x| e.file_name() == *x))
    });
    for entry in walker {
        let entry = entry.map_err(|e| StrataError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| StrataError::Io(std::io::Error::other(e.to_string())))?;
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let bytes = std::fs::read(entry.path())?;
        digests.insert(key, format!("{:x}", Sha256::digest(&bytes)));
    }
    Ok(digests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_seeds_from_shared_and_merge_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = RunWorkspace::new(tmp.path());
        std::fs::create_dir_all(ws.shared_dir("r1")).unwrap();
        std::fs::write(ws.shared_dir("r1").join("input.txt"), "seed").unwrap();

        let a = ws.prepare_node_dir("r1", "a").unwrap();
        let b = ws.prepare_node_dir("r1", "b").unwrap();
        assert_eq!(std::fs::read_to_string(a.join("input.txt")).unwrap(), "seed");

        std::fs::write(a.join("out.txt"), "from a").unwrap();
        std::fs::create_dir_all(b.join("sub")).unwrap();
        std::fs::write(b.join("out.txt"), "from b").unwrap();
        std::fs::write(b.join("sub").join("deep.txt"), "deep").unwrap();

        ws.merge_level("r1", &["a".to_string(), "b".to_string()]).unwrap();
        let shared = ws.shared_dir("r1");
        assert_eq!(std::fs::read_to_string(shared.join("out.txt")).unwrap(), "from b");
        assert_eq!(std::fs::read_to_string(shared.join("sub/deep.txt")).unwrap(), "deep");
    }

    #[test]
    fn test_copy_missing_source_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let n = copy_tree(&tmp.path().join("absent"), &tmp.path().join("dst")).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_file_digests_exclude_top_level() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("nodes/x")).unwrap();
        std::fs::create_dir_all(tmp.path().join("shared")).unwrap();
        std::fs::write(tmp.path().join("nodes/x/f.txt"), "ignored").unwrap();
        std::fs::write(tmp.path().join("shared/result.txt"), "hello").unwrap();

        let digests = file_digests(tmp.path(), &[NODES_DIR]).unwrap();
        assert_eq!(digests.len(), 1);
        assert_eq!(
            digests["shared/result.txt"],
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
