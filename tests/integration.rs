use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tempfile::TempDir;

fn scribe_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("scribe");
    path
}

fn write_gz(path: &Path, lines: &[String]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut encoder = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
    for line in lines {
        encoder.write_all(line.as_bytes()).unwrap();
        encoder.write_all(b"\n").unwrap();
    }
    encoder.finish().unwrap();
}

/// Wrap an envelope the way the container runtime writes it.
fn runtime_line(envelope: &serde_json::Value) -> String {
    let escaped = envelope
        .to_string()
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    format!("2024-11-29T07:12:00.123456789Z stdout F {}", escaped)
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let users = json!({
        "request": {
            "url": "https://gateway.example.com:443/v1/private/users/1282?limit=20",
            "method": "GET",
            "querystring": {"limit": "20", "verbose": "true"}
        },
        "response": {
            "status": 200,
            "body": "{\"name\":\"John\",\"age\":30,\"jobs\":[{\"title\":\"x\"},{\"title\":\"y\",\"start_at\":2024}]}"
        }
    });
    let orders = json!({
        "request": {
            "url": "https://gateway.example.com/v1/orders",
            "method": "post",
            "body": "{\"sku\":\"A-1\",\"qty\":2}"
        },
        "response": {"status": "201", "body": "{\"id\":\"o-1\"}"}
    });

    let hour7 = root.join("blobs/logs/proxy/2024-11-29/07");
    write_gz(
        &hour7.join("part-0001.gz"),
        &[
            runtime_line(&users),
            runtime_line(&users),
            "2024-11-29T07:12:01.000000001Z stderr F loading kong/plugins/init.lua".to_string(),
            "not a log line".to_string(),
        ],
    );
    fs::write(hour7.join("part-0001.gz.metadata"), "{}").unwrap();
    write_gz(
        &root.join("blobs/logs/proxy/2024-11-29/08/part-0001.gz"),
        &[orders.to_string()],
    );
    // Outside the ingest window.
    write_gz(
        &root.join("blobs/logs/proxy/2024-11-29/09/part-0001.gz"),
        &[orders.to_string()],
    );

    let config_content = format!(
        r#"[db]
path = "{root}/data/scribe.sqlite"

[blob]
kind = "local"
root = "{root}/blobs"

[ingest]
service = "proxy"
prefix = "logs"
line_concurrency = 4

[build]
api_page_size = 1
sample_page_size = 1
concurrency = 2

[logging]
level = "warn"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("scribe.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_scribe(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = scribe_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run scribe binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

const WINDOW: [&str; 5] = [
    "ingest",
    "--start",
    "2024-11-29T07:00:00Z",
    "--end",
    "2024-11-29T09:00:00Z",
];

fn api_id_for(config_path: &Path, path: &str) -> String {
    let (stdout, stderr, success) = run_scribe(config_path, &["apis"]);
    assert!(success, "apis failed: {}", stderr);
    stdout
        .lines()
        .find(|line| line.ends_with(path))
        .and_then(|line| line.split_whitespace().next())
        .unwrap_or_else(|| panic!("no api for {} in:\n{}", path, stdout))
        .to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_scribe(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_scribe(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_scribe(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_window() {
    let (_tmp, config_path) = setup_test_env();

    run_scribe(&config_path, &["init"]);
    let (stdout, stderr, success) = run_scribe(&config_path, &WINDOW);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("folders: 2"), "{}", stdout);
    assert!(stdout.contains("files: 2 (0 failed)"), "{}", stdout);
    assert!(stdout.contains("lines: 5 (2 skipped)"), "{}", stdout);
    assert!(stdout.contains("apis created: 2"), "{}", stdout);
    assert!(stdout.contains("requests stored: 3"), "{}", stdout);
    assert!(stdout.contains("responses stored: 3"), "{}", stdout);
    assert!(stdout.contains("ok"));
}

#[test]
fn test_ingest_twice_keeps_one_api_per_endpoint() {
    let (_tmp, config_path) = setup_test_env();

    run_scribe(&config_path, &["init"]);
    run_scribe(&config_path, &WINDOW);
    let (stdout, _, success) = run_scribe(&config_path, &WINDOW);
    assert!(success);
    assert!(stdout.contains("apis created: 0"), "{}", stdout);

    let (stdout, _, _) = run_scribe(&config_path, &["apis"]);
    assert!(stdout.contains("of 2"), "{}", stdout);
}

#[test]
fn test_ingest_reports_corrupt_file() {
    let (tmp, config_path) = setup_test_env();
    fs::write(
        tmp.path().join("blobs/logs/proxy/2024-11-29/07/part-0002.gz"),
        "plain text pretending to be gzip",
    )
    .unwrap();

    run_scribe(&config_path, &["init"]);
    let (stdout, stderr, success) = run_scribe(&config_path, &WINDOW);
    assert!(!success, "corrupt file should fail the run");
    assert!(stdout.contains("files: 3 (1 failed)"), "{}", stdout);
    assert!(stdout.contains("apis created: 2"), "{}", stdout);
    assert!(stderr.contains("not gzip-compressed"), "{}", stderr);
}

#[test]
fn test_empty_window_is_ok() {
    let (_tmp, config_path) = setup_test_env();

    run_scribe(&config_path, &["init"]);
    let (stdout, _, success) = run_scribe(
        &config_path,
        &[
            "ingest",
            "--start",
            "2024-11-29T09:00:00Z",
            "--end",
            "2024-11-29T07:00:00Z",
        ],
    );
    assert!(success);
    assert!(stdout.contains("folders: 0"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_build_and_doc() {
    let (_tmp, config_path) = setup_test_env();

    run_scribe(&config_path, &["init"]);
    run_scribe(&config_path, &WINDOW);

    let (stdout, stderr, success) = run_scribe(&config_path, &["build"]);
    assert!(success, "build failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("built: 2"), "{}", stdout);

    let (stdout, _, success) = run_scribe(&config_path, &["build"]);
    assert!(success);
    assert!(stdout.contains("skipped: 2"), "{}", stdout);

    let id = api_id_for(&config_path, "/v1/private/users/{id}");
    let (stdout, stderr, success) = run_scribe(&config_path, &["doc", &id]);
    assert!(success, "doc failed: {}", stderr);

    let doc: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(doc["openapi"], "3.0.0");
    assert_eq!(doc["servers"][0]["url"], "gateway.example.com");

    let op = &doc["paths"]["/v1/private/users/{id}"]["get"];
    assert_eq!(op["security"][0]["Bearer"], json!([]));
    assert_eq!(op["parameters"][0]["name"], "limit");
    assert_eq!(op["parameters"][0]["schema"]["type"], "integer");
    assert_eq!(op["parameters"][1]["name"], "verbose");
    assert_eq!(op["parameters"][1]["schema"]["type"], "boolean");

    let schema = &op["responses"]["200"]["content"]["application/json"]["schema"];
    assert_eq!(schema["properties"]["name"]["type"], "string");
    let job = &schema["properties"]["jobs"]["items"]["properties"];
    assert_eq!(job["title"]["type"], "string");
    assert_eq!(job["start_at"]["type"], "number");
}

#[test]
fn test_doc_unknown_api() {
    let (_tmp, config_path) = setup_test_env();

    run_scribe(&config_path, &["init"]);
    let (_, stderr, success) = run_scribe(&config_path, &["doc", "no-such-id"]);
    assert!(!success);
    assert!(stderr.contains("api not found"));
}
