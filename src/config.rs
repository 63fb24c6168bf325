//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/scribe.sqlite"
//!
//! [ingest]
//! start = "2024-11-29T07:00:00Z"   # optional, defaults to the previous whole hour
//! end = "2024-11-29T08:00:00Z"
//! service = "proxy"
//!
//! [blob]
//! kind = "s3"
//! bucket = "gateway-logs"
//! region = "ap-southeast-1"
//!
//! [build]
//! concurrency = 100
//!
//! [logging]
//! level = "info"
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub blob: BlobConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_line_concurrency")]
    pub line_concurrency: usize,
    /// Per-folder file pool size is `max(1, files / file_fraction)`.
    #[serde(default = "default_file_fraction")]
    pub file_fraction: usize,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            service: default_service(),
            prefix: default_prefix(),
            line_concurrency: default_line_concurrency(),
            file_fraction: default_file_fraction(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl IngestConfig {
    /// The configured window, or the previous whole hour relative to `now`.
    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let this_hour = now
            .duration_trunc(Duration::hours(1))
            .unwrap_or(now);
        let start = self.start.unwrap_or(this_hour - Duration::hours(1));
        let end = self.end.unwrap_or(this_hour);
        (start, end)
    }
}

fn default_service() -> String {
    "proxy".to_string()
}
fn default_prefix() -> String {
    "logs".to_string()
}
fn default_line_concurrency() -> usize {
    100
}
fn default_file_fraction() -> usize {
    10
}
fn default_max_line_bytes() -> usize {
    5 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlobConfig {
    S3(S3BlobConfig),
    Local(LocalBlobConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3BlobConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalBlobConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildConfig {
    #[serde(default = "default_page_size")]
    pub api_page_size: i64,
    #[serde(default = "default_page_size")]
    pub sample_page_size: i64,
    #[serde(default = "default_build_concurrency")]
    pub concurrency: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            api_page_size: default_page_size(),
            sample_page_size: default_page_size(),
            concurrency: default_build_concurrency(),
        }
    }
}

fn default_page_size() -> i64 {
    20
}
fn default_build_concurrency() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate ingest
    if config.ingest.line_concurrency == 0 {
        bail!("ingest.line_concurrency must be > 0");
    }
    if config.ingest.file_fraction == 0 {
        bail!("ingest.file_fraction must be > 0");
    }
    if config.ingest.max_line_bytes == 0 {
        bail!("ingest.max_line_bytes must be > 0");
    }
    if config.ingest.service.trim().is_empty() {
        bail!("ingest.service must not be empty");
    }

    // Validate build
    if config.build.api_page_size < 1 {
        bail!("build.api_page_size must be >= 1");
    }
    if config.build.sample_page_size < 1 {
        bail!("build.sample_page_size must be >= 1");
    }
    if config.build.concurrency == 0 {
        bail!("build.concurrency must be > 0");
    }

    // Validate blob
    match &config.blob {
        BlobConfig::S3(s3) => {
            if s3.bucket.trim().is_empty() {
                bail!("blob.bucket must be set when kind is 's3'");
            }
        }
        BlobConfig::Local(local) => {
            if local.root.as_os_str().is_empty() {
                bail!("blob.root must be set when kind is 'local'");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_local_config_gets_defaults() {
        let config = parse(
            r#"
[db]
path = "./data/scribe.sqlite"

[blob]
kind = "local"
root = "./samples"
"#,
        )
        .unwrap();

        assert_eq!(config.ingest.service, "proxy");
        assert_eq!(config.ingest.prefix, "logs");
        assert_eq!(config.ingest.line_concurrency, 100);
        assert_eq!(config.ingest.file_fraction, 10);
        assert_eq!(config.build.api_page_size, 20);
        assert_eq!(config.build.sample_page_size, 20);
        assert_eq!(config.build.concurrency, 100);
        assert_eq!(config.logging.level, "info");
        assert!(matches!(config.blob, BlobConfig::Local(_)));
    }

    #[test]
    fn s3_config_parses_window() {
        let config = parse(
            r#"
[db]
path = "scribe.sqlite"

[ingest]
start = "2024-11-29T07:00:00Z"
end = "2024-11-29T09:00:00Z"

[blob]
kind = "s3"
bucket = "gateway-logs"
region = "ap-southeast-1"
"#,
        )
        .unwrap();

        let (start, end) = config.ingest.window(Utc::now());
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 11, 29, 7, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 11, 29, 9, 0, 0).unwrap());
        match config.blob {
            BlobConfig::S3(s3) => {
                assert_eq!(s3.bucket, "gateway-logs");
                assert!(s3.endpoint_url.is_none());
            }
            other => panic!("expected s3 blob config, got {:?}", other),
        }
    }

    #[test]
    fn default_window_is_previous_hour() {
        let ingest = IngestConfig::default();
        let now = Utc.with_ymd_and_hms(2024, 11, 29, 7, 42, 13).unwrap();
        let (start, end) = ingest.window(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 11, 29, 6, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 11, 29, 7, 0, 0).unwrap());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = parse(
            r#"
[db]
path = "scribe.sqlite"

[build]
concurrency = 0

[blob]
kind = "local"
root = "./samples"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("build.concurrency"));
    }

    #[test]
    fn rejects_unknown_blob_kind() {
        let result = parse(
            r#"
[db]
path = "scribe.sqlite"

[blob]
kind = "gcs"
bucket = "x"
"#,
        );
        assert!(result.is_err());
    }
}
