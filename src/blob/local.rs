//! Local directory blob store.
//!
//! Serves a directory that mirrors the bucket layout, e.g. logs copied
//! down with `aws s3 sync` for an offline run. Object names are paths
//! relative to the root, always `/`-separated.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use walkdir::WalkDir;

use super::{gzip_reader, is_eligible, BlobStore, ObjectReader};

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn list_objects(&self, prefixes: &[String]) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefixes = prefixes.to_vec();
        tokio::task::spawn_blocking(move || walk_prefixes(&root, &prefixes))
            .await
            .context("directory walk panicked")?
    }

    async fn open_decompressed(&self, name: &str) -> Result<ObjectReader> {
        let path = self.root.join(name);
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let file = File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            gzip_reader(&name, file)
        })
        .await
        .context("object open panicked")?
    }
}

fn walk_prefixes(root: &Path, prefixes: &[String]) -> Result<Vec<String>> {
    if !root.exists() {
        anyhow::bail!("blob root does not exist: {}", root.display());
    }

    let mut names = Vec::new();
    for prefix in prefixes {
        let dir = root.join(prefix.trim_matches('/'));
        // Hours with no traffic have no folder.
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir).follow_links(true) {
            let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if is_eligible(&name) {
                names.push(name);
            }
        }
    }

    names.sort();
    names.dedup();
    Ok(names)
}
