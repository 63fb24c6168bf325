//! Blob storage for archived gateway logs.
//!
//! Logs are laid out as `{prefix}/{service}/YYYY-MM-DD/HH/<object>.gz`,
//! with optional `.metadata` sidecars next to each object. The pipeline
//! only needs two operations: list the eligible objects under a set of
//! prefixes, and open one object as a decompressed line stream.
//!
//! | Backend | Config `kind` | Source |
//! |---------|---------------|--------|
//! | [`S3BlobStore`] | `s3` | S3 or an S3-compatible endpoint, SigV4-signed |
//! | [`LocalBlobStore`] | `local` | A directory mirroring the bucket layout |

mod local;
mod s3;

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;

use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::BlobConfig;

/// A decompressed, line-readable object stream.
pub type ObjectReader = Box<dyn BufRead + Send>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Names of all eligible log objects under any of `prefixes`, sorted.
    async fn list_objects(&self, prefixes: &[String]) -> Result<Vec<String>>;

    /// Open one object and return its decompressed contents.
    async fn open_decompressed(&self, name: &str) -> Result<ObjectReader>;
}

/// Build the blob store selected by `[blob] kind`.
pub fn from_config(config: &BlobConfig) -> Result<Arc<dyn BlobStore>> {
    match config {
        BlobConfig::S3(s3) => Ok(Arc::new(S3BlobStore::from_env(s3.clone())?)),
        BlobConfig::Local(local) => Ok(Arc::new(LocalBlobStore::new(local.root.clone()))),
    }
}

const INCLUDE_GLOBS: &[&str] = &["**/*.gz"];
const EXCLUDE_GLOBS: &[&str] = &["**/*.metadata"];

fn eligibility() -> &'static (GlobSet, GlobSet) {
    static SETS: OnceLock<(GlobSet, GlobSet)> = OnceLock::new();
    SETS.get_or_init(|| {
        (
            build_globset(INCLUDE_GLOBS).expect("include globs are valid"),
            build_globset(EXCLUDE_GLOBS).expect("exclude globs are valid"),
        )
    })
}

/// True for compressed log objects; metadata sidecars are rejected.
pub fn is_eligible(name: &str) -> bool {
    let (include, exclude) = eligibility();
    !exclude.is_match(name) && include.is_match(name)
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

pub(super) const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Wrap a raw object stream in a gzip decoder.
///
/// Concatenated gzip members are read through. Streams that do not start
/// with the gzip magic bytes are rejected up front.
pub fn gzip_reader<R: Read + Send + 'static>(name: &str, raw: R) -> Result<ObjectReader> {
    let mut raw = BufReader::new(raw);
    let head = raw
        .fill_buf()
        .with_context(|| format!("Failed to read object: {}", name))?;
    if head.len() < GZIP_MAGIC.len() || head[..GZIP_MAGIC.len()] != GZIP_MAGIC {
        bail!("object is not gzip-compressed: {}", name);
    }
    Ok(Box::new(BufReader::new(MultiGzDecoder::new(raw))))
}
