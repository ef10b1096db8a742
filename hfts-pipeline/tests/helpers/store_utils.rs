//! Series store and file tree utilities

use hfts_pipeline::archive::format::digest_hex;
use hfts_pipeline::series::SeriesStore;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub async fn memory_store() -> SeriesStore {
    SeriesStore::in_memory().await.unwrap()
}

/// SHA-256 of every file under `dir`, keyed by relative path
pub fn tree_digest(dir: &Path) -> BTreeMap<PathBuf, String> {
    let mut digests = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                let bytes = std::fs::read(&path).unwrap();
                let relative = path.strip_prefix(dir).unwrap().to_path_buf();
                digests.insert(relative, digest_hex(&bytes));
            }
        }
    }
    digests
}
