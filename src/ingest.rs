//! Log ingestion pipeline.
//!
//! One run covers a `[start, end)` window, expanded into one hour folder
//! per hour. Work fans out three levels deep:
//!
//! ```text
//! hour folders ──▶ files in folder ──▶ lines in file
//! (one worker     (files / fraction   (line_concurrency
//!  per folder)     workers)            workers per file)
//! ```
//!
//! Each file is streamed through a gzip decoder on a blocking thread that
//! peels every line down to its JSON envelope. Candidates are handed to
//! the line workers over a bounded channel, so a slow store applies
//! backpressure all the way to the decoder.
//!
//! # Failure handling
//!
//! - A bad line (noise, no JSON, missing keys, unparsable URL) or a failed
//!   store step is logged and counted as skipped.
//! - A file that cannot be opened, is not gzip, or fails mid-stream is a
//!   file-task error. Its folder reports it; sibling files and folders
//!   keep running.
//! - Listing failures abort the run.

use std::io::{BufRead, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use api_scribe_core::models::{Api, SampleRequest, SampleResponse};
use api_scribe_core::normalize::{
    build_parameters, derive_api_identity, extract_envelope, parse_envelope, NormalizeError,
};
use api_scribe_core::store::Store;

use crate::blob::{self, BlobStore, ObjectReader};
use crate::config::{Config, IngestConfig};
use crate::db;
use crate::pool::WorkerPool;
use crate::sqlite_store::SqliteStore;

/// Summary of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    pub folders: u64,
    pub files: u64,
    pub files_failed: u64,
    pub lines: u64,
    pub lines_skipped: u64,
    pub apis_created: u64,
    pub requests_stored: u64,
    pub responses_stored: u64,
    /// First file-task error, if any file failed.
    pub first_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    files: AtomicU64,
    files_failed: AtomicU64,
    lines: AtomicU64,
    lines_skipped: AtomicU64,
    apis_created: AtomicU64,
    requests_stored: AtomicU64,
    responses_stored: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, folders: u64, first_error: Option<String>) -> IngestReport {
        IngestReport {
            folders,
            files: self.files.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            lines: self.lines.load(Ordering::Relaxed),
            lines_skipped: self.lines_skipped.load(Ordering::Relaxed),
            apis_created: self.apis_created.load(Ordering::Relaxed),
            requests_stored: self.requests_stored.load(Ordering::Relaxed),
            responses_stored: self.responses_stored.load(Ordering::Relaxed),
            first_error,
        }
    }
}

/// What the store step wrote for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredLine {
    pub api_created: bool,
    pub response_stored: bool,
}

/// Hour folders covering `[start, end)`, oldest first.
///
/// `start` is floored to the hour. An empty or inverted window yields no
/// folders.
pub fn hour_folders(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    prefix: &str,
    service: &str,
) -> Vec<String> {
    let hour = Duration::hours(1);
    let mut cursor = start.duration_trunc(hour).unwrap_or(start);
    let root = prefix.trim_matches('/');

    let mut folders = Vec::new();
    while cursor < end {
        let bucket = cursor.format("%Y-%m-%d/%H");
        if root.is_empty() {
            folders.push(format!("{}/{}/", service, bucket));
        } else {
            folders.push(format!("{}/{}/{}/", root, service, bucket));
        }
        cursor += hour;
    }
    folders
}

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    config: Arc<IngestConfig>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>, config: IngestConfig) -> Self {
        Self {
            store,
            blobs,
            config: Arc::new(config),
        }
    }

    /// Ingest every eligible object in the hour folders of `[start, end)`.
    ///
    /// File-task errors do not fail the run; the first one is returned in
    /// [`IngestReport::first_error`]. Listing errors do.
    pub async fn run(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<IngestReport> {
        let counters = Arc::new(Counters::default());
        let folders = hour_folders(start, end, &self.config.prefix, &self.config.service);
        if folders.is_empty() {
            info!(%start, %end, "empty ingest window, nothing to do");
            return Ok(counters.report(0, None));
        }

        let mut listed = Vec::with_capacity(folders.len());
        for folder in &folders {
            let files = self
                .blobs
                .list_objects(std::slice::from_ref(folder))
                .await
                .with_context(|| format!("Failed to list folder {}", folder))?;
            debug!(folder = %folder, files = files.len(), "listed folder");
            if !files.is_empty() {
                listed.push((folder.clone(), files));
            }
        }

        let mut folder_pool = WorkerPool::new("folder", listed.len());
        for (folder, files) in listed {
            let this = self.clone();
            let counters = counters.clone();
            folder_pool
                .submit(async move { this.process_folder(&folder, files, &counters).await })
                .await?;
        }

        let first_error = folder_pool.wait().await.err().map(|e| format!("{:#}", e));
        if let Some(ref err) = first_error {
            error!(err = %err, "ingest finished with file errors");
        }
        Ok(counters.report(folders.len() as u64, first_error))
    }

    async fn process_folder(
        &self,
        folder: &str,
        files: Vec<String>,
        counters: &Arc<Counters>,
    ) -> Result<()> {
        let workers = (files.len() / self.config.file_fraction.max(1)).max(1);
        info!(folder = %folder, files = files.len(), workers, "processing folder");

        let mut file_pool = WorkerPool::new("file", workers);
        for file in files {
            let this = self.clone();
            let counters = counters.clone();
            file_pool
                .submit(async move { this.process_file(&file, &counters).await })
                .await?;
        }
        file_pool
            .wait()
            .await
            .with_context(|| format!("folder {}", folder))
    }

    async fn process_file(&self, name: &str, counters: &Arc<Counters>) -> Result<()> {
        Counters::bump(&counters.files);
        debug!(file = %name, "processing file");

        match self.stream_file(name, counters).await {
            Ok(()) => Ok(()),
            Err(err) => {
                Counters::bump(&counters.files_failed);
                error!(file = %name, err = %format!("{:#}", err), "failed to process file");
                Err(err.context(format!("file {}", name)))
            }
        }
    }

    async fn stream_file(&self, name: &str, counters: &Arc<Counters>) -> Result<()> {
        let reader = self.blobs.open_decompressed(name).await?;

        let (tx, mut rx) = mpsc::channel::<String>(self.config.line_concurrency.max(1));
        let scanner = {
            let file = name.to_string();
            let counters = counters.clone();
            let max_line_bytes = self.config.max_line_bytes;
            tokio::task::spawn_blocking(move || {
                scan_lines(reader, &file, max_line_bytes, &counters, tx)
            })
        };

        let mut line_pool = WorkerPool::new("line", self.config.line_concurrency);
        while let Some(json) = rx.recv().await {
            let store = self.store.clone();
            let counters = counters.clone();
            line_pool
                .submit(async move {
                    store_candidate(store.as_ref(), &json, &counters).await;
                    Ok(())
                })
                .await?;
        }
        line_pool.wait().await?;

        scanner.await.context("line scanner panicked")?
    }
}

/// Read `reader` line by line, forwarding each JSON envelope candidate.
///
/// Lines longer than `max_line_bytes` are skipped without being buffered
/// whole.
fn scan_lines(
    mut reader: ObjectReader,
    file: &str,
    max_line_bytes: usize,
    counters: &Counters,
    tx: mpsc::Sender<String>,
) -> Result<()> {
    let limit = max_line_bytes as u64 + 1;
    let mut buf = Vec::with_capacity(64 * 1024);

    loop {
        buf.clear();
        let n = (&mut reader)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("Failed to read {}", file))?;
        if n == 0 {
            break;
        }

        if n as u64 == limit && buf.last() != Some(&b'\n') {
            Counters::bump(&counters.lines);
            Counters::bump(&counters.lines_skipped);
            warn!(file = %file, max_line_bytes, "line too long, skipped");
            discard_line(&mut reader).with_context(|| format!("Failed to read {}", file))?;
            continue;
        }

        match extract_envelope(&buf) {
            Ok(line) => {
                Counters::bump(&counters.lines);
                if tx.blocking_send(line.json).is_err() {
                    bail!("line workers stopped while reading {}", file);
                }
            }
            Err(NormalizeError::Empty) => {}
            Err(err) => {
                Counters::bump(&counters.lines);
                Counters::bump(&counters.lines_skipped);
                debug!(file = %file, err = %err, "skipped line");
            }
        }
    }
    Ok(())
}

fn discard_line(reader: &mut ObjectReader) -> std::io::Result<()> {
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

async fn store_candidate(store: &dyn Store, json: &str, counters: &Counters) {
    match store_exchange(store, json).await {
        Ok(stored) => {
            Counters::bump(&counters.requests_stored);
            if stored.api_created {
                Counters::bump(&counters.apis_created);
            }
            if stored.response_stored {
                Counters::bump(&counters.responses_stored);
            }
        }
        Err(err) => {
            Counters::bump(&counters.lines_skipped);
            if err.downcast_ref::<NormalizeError>().is_some() {
                debug!(err = %err, "skipped line");
            } else {
                warn!(err = %format!("{:#}", err), "failed to store line");
            }
        }
    }
}

/// Normalize one raw log line and store it.
pub async fn ingest_line(store: &dyn Store, raw: &[u8]) -> Result<StoredLine> {
    let line = extract_envelope(raw)?;
    store_exchange(store, &line.json).await
}

/// Store one envelope candidate: resolve or create its Api, then append
/// a request sample and, when the response has a body, a response sample.
pub async fn store_exchange(store: &dyn Store, json: &str) -> Result<StoredLine> {
    let envelope = parse_envelope(json)?;
    let identity = derive_api_identity(&envelope.request)?;

    let (api, api_created) = match store
        .get_api_by_path(&identity.host, &identity.path)
        .await?
    {
        Some(api) => (api, false),
        None => {
            let candidate = Api::new(&identity.host, &identity.method, &identity.path);
            let stored = store.create_api(&candidate).await?;
            let created = stored.id == candidate.id;
            if created {
                debug!(api_id = %stored.id, host = %stored.host, path = %stored.path, "discovered api");
            }
            (stored, created)
        }
    };

    let parameters = envelope
        .request
        .get("querystring")
        .and_then(Value::as_object)
        .map(build_parameters)
        .unwrap_or_default();
    let body = body_text(envelope.request.get("body")).unwrap_or_default();
    store
        .create_sample_request(&SampleRequest::new(&api.id, parameters, body))
        .await?;

    let response_stored = match body_text(envelope.response.get("body")) {
        Some(body) => {
            let status = status_code(envelope.response.get("status"));
            store
                .create_sample_response(&SampleResponse::new(&api.id, status, body))
                .await?;
            true
        }
        None => false,
    };

    Ok(StoredLine {
        api_created,
        response_stored,
    })
}

// Gateways log bodies as strings; anything else is kept as its JSON text.
fn body_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn status_code(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                .unwrap_or(0)
        }
        Some(Value::Bool(true)) => 1,
        _ => 0,
    }
}

/// `scribe ingest`: run one ingestion pass against the configured
/// database and blob store and print a summary.
pub async fn run_ingest(
    config: &Config,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<()> {
    let (default_start, default_end) = config.ingest.window(Utc::now());
    let start = start.unwrap_or(default_start);
    let end = end.unwrap_or(default_end);

    let pool = db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let blobs = blob::from_config(&config.blob)?;

    info!(%start, %end, "starting ingest");
    let ingestor = Ingestor::new(store, blobs, config.ingest.clone());
    let result = ingestor.run(start, end).await;
    pool.close().await;
    let report = result?;

    println!("ingest {} .. {}", start.to_rfc3339(), end.to_rfc3339());
    println!("  folders: {}", report.folders);
    println!("  files: {} ({} failed)", report.files, report.files_failed);
    println!("  lines: {} ({} skipped)", report.lines, report.lines_skipped);
    println!("  apis created: {}", report.apis_created);
    println!("  requests stored: {}", report.requests_stored);
    println!("  responses stored: {}", report.responses_stored);

    if let Some(err) = report.first_error {
        bail!("ingest finished with errors: {}", err);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_scribe_core::store::memory::InMemoryStore;
    use api_scribe_core::store::{ApiRepository, SampleRepository};
    use chrono::TimeZone;
    use serde_json::json;

    fn line(url: &str, method: &str, response: Value) -> String {
        json!({
            "request": {
                "url": url,
                "method": method,
                "body": "{\"sku\":\"a\"}",
                "querystring": {"limit": "20", "debug": "true"}
            },
            "response": response
        })
        .to_string()
    }

    #[test]
    fn hour_folders_cover_half_open_window() {
        let start = Utc.with_ymd_and_hms(2024, 12, 2, 3, 15, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 12, 2, 5, 0, 0).unwrap();
        assert_eq!(
            hour_folders(start, end, "logs/", "proxy"),
            vec![
                "logs/proxy/2024-12-02/03/".to_string(),
                "logs/proxy/2024-12-02/04/".to_string(),
            ]
        );
    }

    #[test]
    fn hour_folders_cross_midnight() {
        let start = Utc.with_ymd_and_hms(2024, 12, 1, 23, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 12, 2, 1, 0, 0).unwrap();
        assert_eq!(
            hour_folders(start, end, "", "proxy"),
            vec![
                "proxy/2024-12-01/23/".to_string(),
                "proxy/2024-12-02/00/".to_string(),
            ]
        );
    }

    #[test]
    fn inverted_or_empty_window_has_no_folders() {
        let t = Utc.with_ymd_and_hms(2024, 12, 2, 3, 0, 0).unwrap();
        assert!(hour_folders(t, t, "logs", "proxy").is_empty());
        assert!(hour_folders(t, t - Duration::hours(2), "logs", "proxy").is_empty());
    }

    #[test]
    fn status_code_accepts_numbers_and_numeric_strings() {
        assert_eq!(status_code(Some(&json!(201))), 201);
        assert_eq!(status_code(Some(&json!("404"))), 404);
        assert_eq!(status_code(Some(&json!(200.0))), 200);
        assert_eq!(status_code(Some(&json!("n/a"))), 0);
        assert_eq!(status_code(None), 0);
    }

    #[tokio::test]
    async fn store_exchange_creates_api_and_samples() {
        let store = InMemoryStore::new();
        let raw = line(
            "https://gateway.example.com:443/v1/private/orders/1282?limit=20",
            "post",
            json!({"status": 200, "body": "{\"ok\":true}"}),
        );

        let stored = store_exchange(&store, &raw).await.unwrap();
        assert!(stored.api_created);
        assert!(stored.response_stored);

        let api = store
            .get_api_by_path("gateway.example.com", "/v1/private/orders/{id}")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(api.method, "POST");

        let requests = store
            .get_sample_requests_page(&api.id, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body, "{\"sku\":\"a\"}");
        let names: Vec<&str> = requests[0]
            .parameters
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["debug", "limit"]);

        let responses = store
            .get_sample_responses_page(&api.id, None, 10, 0)
            .await
            .unwrap();
        assert_eq!(responses[0].status_code, 200);
    }

    #[tokio::test]
    async fn response_without_body_is_not_stored() {
        let store = InMemoryStore::new();
        let raw = line(
            "https://gateway.example.com/v1/ping",
            "GET",
            json!({"status": 204}),
        );
        let stored = store_exchange(&store, &raw).await.unwrap();
        assert!(!stored.response_stored);
        assert_eq!(store.sample_request_count(), 1);
        assert_eq!(store.sample_response_count(), 0);
    }

    #[tokio::test]
    async fn same_line_twice_creates_one_api() {
        let store = InMemoryStore::new();
        let raw = line(
            "https://gateway.example.com/v1/items/42",
            "GET",
            json!({"status": 200, "body": "{}"}),
        );

        let first = ingest_line(&store, raw.as_bytes()).await.unwrap();
        let second = ingest_line(&store, raw.as_bytes()).await.unwrap();

        assert!(first.api_created);
        assert!(!second.api_created);
        assert_eq!(store.count_apis().await.unwrap(), 1);
        assert_eq!(store.sample_request_count(), 2);
        assert_eq!(store.sample_response_count(), 2);
    }

    #[tokio::test]
    async fn malformed_lines_are_rejected() {
        let store = InMemoryStore::new();
        assert!(ingest_line(&store, b"plain text, no json").await.is_err());
        assert!(ingest_line(&store, br#"{"request":{}}"#).await.is_err());
        assert!(
            ingest_line(&store, br#"{"request":{"method":"GET"},"response":{}}"#)
                .await
                .is_err()
        );
        assert_eq!(store.count_apis().await.unwrap(), 0);
    }
}
