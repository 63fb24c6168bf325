//! S3 blob store.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication
//! (`hmac` + `sha2`), following `ListObjectsV2` continuation tokens.
//! Custom endpoints (MinIO, LocalStack) are addressed path-style.
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional

use std::io::{self, Read};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use super::{gzip_reader, is_eligible, BlobStore, ObjectReader, GZIP_MAGIC};
use crate::config::S3BlobConfig;

type HmacSha256 = Hmac<Sha256>;

pub struct S3BlobStore {
    config: S3BlobConfig,
    creds: AwsCredentials,
    endpoint: Endpoint,
    client: reqwest::Client,
}

impl S3BlobStore {
    /// Create a store using credentials from the environment.
    pub fn from_env(config: S3BlobConfig) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        Ok(Self::new(config, creds))
    }

    fn new(config: S3BlobConfig, creds: AwsCredentials) -> Self {
        let endpoint = Endpoint::for_config(&config);
        Self {
            config,
            creds,
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query_params = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(ref token) = continuation_token {
                query_params.push(("continuation-token".to_string(), token.clone()));
            }
            query_params.sort_by(|a, b| a.0.cmp(&b.0));
            let canonical_querystring: String = query_params
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");

            let canonical_uri = self.endpoint.bucket_path("");
            let resp = self
                .signed_get(&canonical_uri, &canonical_querystring)
                .await
                .with_context(|| {
                    format!(
                        "Failed to list S3 objects in s3://{}/{}",
                        self.config.bucket, prefix
                    )
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml_body = resp.text().await?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml_body);
            keys.extend(batch);

            match (is_truncated, next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(keys)
    }

    /// Send a SigV4-signed GET for `canonical_uri` (already URI-encoded).
    async fn signed_get(
        &self,
        canonical_uri: &str,
        canonical_querystring: &str,
    ) -> Result<reqwest::Response> {
        let signed = sign_get(
            &self.creds,
            &self.config.region,
            &self.endpoint.host,
            canonical_uri,
            canonical_querystring,
            Utc::now(),
        );

        let mut url = format!("{}://{}{}", self.endpoint.scheme, self.endpoint.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(canonical_querystring);
        }

        let mut req_builder = self
            .client
            .get(&url)
            .header("Authorization", &signed.authorization)
            .header("x-amz-content-sha256", &signed.payload_hash)
            .header("x-amz-date", &signed.amz_date);
        if let Some(ref token) = self.creds.session_token {
            req_builder = req_builder.header("x-amz-security-token", token);
        }

        Ok(req_builder.send().await?)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn list_objects(&self, prefixes: &[String]) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for prefix in prefixes {
            names.extend(
                self.list_prefix(prefix)
                    .await?
                    .into_iter()
                    .filter(|key| is_eligible(key)),
            );
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn open_decompressed(&self, name: &str) -> Result<ObjectReader> {
        let encoded_key = name.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = self.endpoint.bucket_path(&encoded_key);

        let resp = self
            .signed_get(&canonical_uri, "")
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.config.bucket, name))?;

        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                name
            );
        }

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CHUNKS);
        tokio::spawn(pump_body(resp, tx));
        let body = BodyReader::primed(rx, GZIP_MAGIC.len())
            .await
            .with_context(|| format!("Failed to read s3://{}/{}", self.config.bucket, name))?;
        gzip_reader(name, body)
    }
}

// ============ Streaming body ============

/// Body chunks buffered between the HTTP connection and the line scanner.
const BODY_CHANNEL_CHUNKS: usize = 8;

async fn pump_body(mut resp: reqwest::Response, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    loop {
        let item = match resp.chunk().await {
            Ok(Some(chunk)) => Ok(chunk.to_vec()),
            Ok(None) => return,
            Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            return;
        }
    }
}

/// Blocking [`Read`] over body chunks arriving on a channel.
///
/// [`BodyReader::primed`] waits for the first bytes asynchronously, so the
/// gzip magic check never blocks a runtime thread. Later reads use
/// `blocking_recv` and must run on a blocking thread.
struct BodyReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
    done: bool,
}

impl BodyReader {
    async fn primed(
        mut rx: mpsc::Receiver<io::Result<Vec<u8>>>,
        min_bytes: usize,
    ) -> io::Result<Self> {
        let mut chunk = Vec::new();
        let mut done = false;
        while chunk.len() < min_bytes {
            match rx.recv().await {
                Some(Ok(bytes)) => chunk.extend_from_slice(&bytes),
                Some(Err(err)) => return Err(err),
                None => {
                    done = true;
                    break;
                }
            }
        }
        Ok(Self {
            rx,
            chunk,
            pos: 0,
            done,
        })
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.chunk.len() {
            if self.done {
                return Ok(0);
            }
            match self.rx.blocking_recv() {
                Some(Ok(bytes)) => {
                    self.chunk = bytes;
                    self.pos = 0;
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Err(err);
                }
                None => self.done = true,
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

// ============ AWS Credentials ============

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ Endpoint ============

/// Where requests go. Virtual-hosted style on AWS, path-style on a
/// custom endpoint.
#[derive(Debug, PartialEq)]
struct Endpoint {
    scheme: String,
    host: String,
    /// `Some(bucket)` when the bucket is the first path segment.
    path_style_bucket: Option<String>,
}

impl Endpoint {
    fn for_config(config: &S3BlobConfig) -> Self {
        match config.endpoint_url {
            Some(ref endpoint) => {
                let (scheme, rest) = match endpoint.split_once("://") {
                    Some((scheme, rest)) => (scheme.to_string(), rest),
                    None => ("https".to_string(), endpoint.as_str()),
                };
                Self {
                    scheme,
                    host: rest.trim_end_matches('/').to_string(),
                    path_style_bucket: Some(config.bucket.clone()),
                }
            }
            None => Self {
                scheme: "https".to_string(),
                host: format!("{}.s3.{}.amazonaws.com", config.bucket, config.region),
                path_style_bucket: None,
            },
        }
    }

    /// Canonical URI for an already-encoded object key (empty for the bucket).
    fn bucket_path(&self, encoded_key: &str) -> String {
        match self.path_style_bucket {
            Some(ref bucket) => format!("/{}/{}", uri_encode(bucket), encoded_key),
            None => format!("/{}", encoded_key),
        }
    }
}

// ============ AWS SigV4 Helpers ============

struct SignedRequest {
    authorization: String,
    amz_date: String,
    payload_hash: String,
}

fn sign_get(
    creds: &AwsCredentials,
    region: &str,
    host: &str,
    canonical_uri: &str,
    canonical_querystring: &str,
    now: DateTime<Utc>,
) -> SignedRequest {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let payload_hash = hex_sha256(b"");

    let mut headers = vec![
        ("host".to_string(), host.to_string()),
        ("x-amz-content-sha256".to_string(), payload_hash.clone()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers: String = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    let canonical_request = format!(
        "GET\n{}\n{}\n{}\n{}\n{}",
        canonical_uri, canonical_querystring, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    SignedRequest {
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, credential_scope, signed_headers, signature
        ),
        amz_date,
        payload_hash,
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; everything but `A-Z a-z 0-9 - _ . ~` is escaped.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing ============

/// Keys, truncation flag, and continuation token of one `ListObjectsV2` page.
/// Directory placeholder keys (ending in `/`) are skipped.
fn parse_list_objects_response(xml: &str) -> (Vec<String>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut keys = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(xml_unescape(&key));
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    (keys, is_truncated, next_token)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let value_start = xml.find(&open)? + open.len();
    let end = xml[value_start..].find(&close)?;
    Some(xml[value_start..value_start + end].to_string())
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn creds() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        }
    }

    #[test]
    fn signing_key_matches_aws_reference_vector() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn sign_get_builds_authorization_header() {
        let now = Utc.with_ymd_and_hms(2024, 11, 29, 7, 0, 0).unwrap();
        let signed = sign_get(
            &creds(),
            "ap-southeast-1",
            "gateway-logs.s3.ap-southeast-1.amazonaws.com",
            "/",
            "list-type=2&prefix=logs%2Fproxy%2F",
            now,
        );
        assert_eq!(signed.amz_date, "20241129T070000Z");
        assert!(signed.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20241129/ap-southeast-1/s3/aws4_request, \
             SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        assert_eq!(
            signed.payload_hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn endpoint_is_path_style_for_custom_urls() {
        let aws = Endpoint::for_config(&S3BlobConfig {
            bucket: "logs".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
        });
        assert_eq!(aws.host, "logs.s3.us-east-1.amazonaws.com");
        assert_eq!(aws.bucket_path("a/b.gz"), "/a/b.gz");

        let minio = Endpoint::for_config(&S3BlobConfig {
            bucket: "logs".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: Some("http://localhost:9000/".to_string()),
        });
        assert_eq!(minio.scheme, "http");
        assert_eq!(minio.host, "localhost:9000");
        assert_eq!(minio.bucket_path("a/b.gz"), "/logs/a/b.gz");
        assert_eq!(minio.bucket_path(""), "/logs/");
    }

    #[test]
    fn parses_list_objects_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>token-2</NextContinuationToken>
  <Contents><Key>logs/proxy/2024-11-29/07/</Key></Contents>
  <Contents><Key>logs/proxy/2024-11-29/07/a&amp;b.gz</Key><Size>10</Size></Contents>
  <Contents><Key>logs/proxy/2024-11-29/07/a.gz.metadata</Key></Contents>
</ListBucketResult>"#;

        let (keys, truncated, token) = parse_list_objects_response(xml);
        assert!(truncated);
        assert_eq!(token.as_deref(), Some("token-2"));
        assert_eq!(
            keys,
            vec![
                "logs/proxy/2024-11-29/07/a&b.gz".to_string(),
                "logs/proxy/2024-11-29/07/a.gz.metadata".to_string(),
            ]
        );
    }

    #[test]
    fn uri_encode_escapes_reserved_bytes() {
        assert_eq!(uri_encode("logs/proxy"), "logs%2Fproxy");
        assert_eq!(uri_encode("a b~c"), "a%20b~c");
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn body_reader_streams_small_chunks_through_gzip() {
        use std::io::BufRead;

        let compressed = gzip(b"first\nsecond\n");
        let (tx, rx) = mpsc::channel(2);
        let sender = tokio::spawn(async move {
            for piece in compressed.chunks(1) {
                if tx.send(Ok(piece.to_vec())).await.is_err() {
                    break;
                }
            }
        });

        let body = BodyReader::primed(rx, GZIP_MAGIC.len()).await.unwrap();
        let reader = gzip_reader("chunked.gz", body).unwrap();
        let lines = tokio::task::spawn_blocking(move || {
            reader.lines().map(|l| l.unwrap()).collect::<Vec<_>>()
        })
        .await
        .unwrap();
        sender.await.unwrap();

        assert_eq!(lines, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn body_reader_surfaces_transport_errors() {
        let compressed = gzip(b"a line that will be cut off\n");
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(compressed[..12].to_vec())).await.unwrap();
        tx.send(Err(io::Error::new(io::ErrorKind::Other, "connection reset")))
            .await
            .unwrap();
        drop(tx);

        let body = BodyReader::primed(rx, GZIP_MAGIC.len()).await.unwrap();
        let mut reader = gzip_reader("cut.gz", body).unwrap();
        let result = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            reader.read_to_end(&mut out)
        })
        .await
        .unwrap();

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn body_reader_rejects_plain_bodies_before_streaming() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(b"<Error>AccessDenied</Error>".to_vec())).await.unwrap();
        drop(tx);

        let body = BodyReader::primed(rx, GZIP_MAGIC.len()).await.unwrap();
        let err = gzip_reader("denied.gz", body).err().unwrap();
        assert!(err.to_string().contains("not gzip-compressed"));
    }
}
