//! Gateway log line normalization.
//!
//! Archived gateway logs carry one captured exchange per line, usually
//! wrapped by the container runtime:
//!
//! ```text
//! 2024-12-02T03:00:01.123456789Z stdout F {\"request\":{...},\"response\":{...}}
//! ```
//!
//! [`extract_envelope`] peels that line down to the JSON envelope,
//! [`parse_envelope`] decodes and validates it, and [`derive_api_identity`]
//! plus [`build_parameters`] turn the captured request into the values the
//! ingestion pipeline stores.
//!
//! Every error here is skippable: the caller logs it and drops the line.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::models::{Parameter, ParameterLocation, ParameterType};

/// Query parameter names that are always integers, whatever their value.
pub const INTEGER_PARAMETER_HINTS: &[&str] = &["limit", "offset", "skip", "page", "size"];

/// Substrings marking lines that never carry a usable exchange.
const NOISE_MARKERS: &[(&str, &str)] = &[
    ("Content-Type: image", "image payload"),
    (".lua", "gateway plugin debug output"),
    ("config?check_hash", "gateway config polling"),
];

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("empty line")]
    Empty,

    #[error("noise line: {0}")]
    Noise(&'static str),

    #[error("no JSON object in line")]
    NoJson,

    #[error("invalid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope is missing `{0}`")]
    MissingKey(&'static str),

    #[error("`{0}` is not a JSON object")]
    NotAnObject(&'static str),

    #[error("invalid request url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// The JSON candidate extracted from one raw log line.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedLine {
    pub json: String,
    /// Receive time from the container runtime prefix, when present.
    pub received_at: Option<DateTime<Utc>>,
}

/// A validated log envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub request: Map<String, Value>,
    pub response: Map<String, Value>,
}

/// Host, method, and templated path of a captured request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiIdentity {
    pub host: String,
    pub method: String,
    pub path: String,
}

fn runtime_prefix() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    PREFIX.get_or_init(|| {
        Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+Z) (stderr|stdout) F\s+")
            .expect("runtime prefix pattern is valid")
    })
}

fn json_span() -> &'static Regex {
    static SPAN: OnceLock<Regex> = OnceLock::new();
    SPAN.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("json span pattern is valid"))
}

/// Extract the JSON envelope candidate from a raw log line.
///
/// 1. Invalid UTF-8 is replaced with U+FFFD.
/// 2. A leading `<timestamp> stdout|stderr F ` runtime prefix is stripped
///    and its timestamp captured.
/// 3. Known noise lines are rejected.
/// 4. One level of string escaping is removed. Lines that are not a valid
///    escaped string (raw JSON with bare quotes) are kept as they are.
/// 5. The span from the first `{` to the last `}` is returned.
pub fn extract_envelope(raw: &[u8]) -> Result<ExtractedLine, NormalizeError> {
    let repaired = String::from_utf8_lossy(raw);
    let line = repaired.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Err(NormalizeError::Empty);
    }

    let (line, received_at) = strip_runtime_prefix(line);

    if let Some(&(_, reason)) = NOISE_MARKERS
        .iter()
        .find(|(marker, _)| line.contains(marker))
    {
        return Err(NormalizeError::Noise(reason));
    }

    let unescaped = unescape(line);
    let span = json_span()
        .find(&unescaped)
        .ok_or(NormalizeError::NoJson)?;

    Ok(ExtractedLine {
        json: span.as_str().to_string(),
        received_at,
    })
}

fn strip_runtime_prefix(line: &str) -> (&str, Option<DateTime<Utc>>) {
    match runtime_prefix().captures(line) {
        Some(caps) => {
            let whole = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let received_at = caps
                .get(1)
                .and_then(|m| DateTime::parse_from_rfc3339(m.as_str()).ok())
                .map(|dt| dt.with_timezone(&Utc));
            (&line[whole..], received_at)
        }
        None => (line, None),
    }
}

fn unescape(line: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", line)).unwrap_or_else(|_| line.to_string())
}

/// Check that a decoded envelope has object-valued `request` and `response`.
pub fn validate_envelope(value: &Value) -> Result<(), NormalizeError> {
    for key in ["request", "response"] {
        match value.get(key) {
            None => return Err(NormalizeError::MissingKey(key)),
            Some(Value::Object(_)) => {}
            Some(_) => return Err(NormalizeError::NotAnObject(key)),
        }
    }
    Ok(())
}

/// Decode and validate an envelope candidate.
pub fn parse_envelope(json: &str) -> Result<Envelope, NormalizeError> {
    let value: Value = serde_json::from_str(json)?;
    validate_envelope(&value)?;
    let Value::Object(mut object) = value else {
        return Err(NormalizeError::NotAnObject("envelope"));
    };
    let request = take_object(&mut object, "request")?;
    let response = take_object(&mut object, "response")?;
    Ok(Envelope { request, response })
}

fn take_object(
    object: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Map<String, Value>, NormalizeError> {
    match object.remove(key) {
        Some(Value::Object(inner)) => Ok(inner),
        Some(_) => Err(NormalizeError::NotAnObject(key)),
        None => Err(NormalizeError::MissingKey(key)),
    }
}

/// Derive host, method, and templated path from a captured request.
///
/// The port is dropped from the host.
pub fn derive_api_identity(request: &Map<String, Value>) -> Result<ApiIdentity, NormalizeError> {
    let raw_url = request
        .get("url")
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingKey("url"))?;
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingKey("method"))?;

    let parsed = Url::parse(raw_url).map_err(|e| NormalizeError::InvalidUrl {
        url: raw_url.to_string(),
        reason: e.to_string(),
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| NormalizeError::InvalidUrl {
            url: raw_url.to_string(),
            reason: "no host".to_string(),
        })?;

    Ok(ApiIdentity {
        host: host.to_string(),
        method: method.to_uppercase(),
        path: template_path(parsed.path()),
    })
}

/// Collapse concrete resource segments: UUIDs become `{uuid}` and unsigned
/// integers become `{id}`.
pub fn template_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if is_uuid(segment) {
                "{uuid}"
            } else if is_unsigned_integer(segment) {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_uuid(segment: &str) -> bool {
    !segment.is_empty() && Uuid::parse_str(segment).is_ok()
}

// Digits only, so `+5` stays literal; must also fit in a u64.
fn is_unsigned_integer(segment: &str) -> bool {
    segment.bytes().all(|b| b.is_ascii_digit()) && segment.parse::<u64>().is_ok()
}

/// Build one query [`Parameter`] per key of a captured query-string map.
///
/// The type comes from [`INTEGER_PARAMETER_HINTS`] first, then from the
/// value: `true`/`false` is boolean, an integer is integer, anything else
/// is a string.
pub fn build_parameters(query: &Map<String, Value>) -> Vec<Parameter> {
    query
        .iter()
        .map(|(name, value)| {
            let value = query_value(value);
            Parameter {
                name: name.clone(),
                param_type: resolve_parameter_type(name, &value),
                location: ParameterLocation::Query,
                required: false,
                value: Some(value),
            }
        })
        .collect()
}

/// Resolve the type of a query parameter from its name and observed value.
pub fn resolve_parameter_type(name: &str, value: &str) -> ParameterType {
    if INTEGER_PARAMETER_HINTS.contains(&name) {
        return ParameterType::Integer;
    }
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
        return ParameterType::Boolean;
    }
    if value.parse::<i64>().is_ok() {
        return ParameterType::Integer;
    }
    ParameterType::String
}

// Gateways log a bare `?flag` as `true` and repeated keys as arrays.
fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(values) => values.first().map(query_value).unwrap_or_default(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_with_url(url: &str) -> Map<String, Value> {
        json!({"url": url, "method": "get"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn extract_strips_runtime_prefix_and_unescapes() {
        let raw = br#"2024-12-02T03:00:01.123456789Z stdout F {\"request\":{\"url\":\"https://x.io/a\"},\"response\":{}}"#;
        let extracted = extract_envelope(raw).unwrap();
        assert_eq!(
            extracted.json,
            r#"{"request":{"url":"https://x.io/a"},"response":{}}"#
        );
        let received = extracted.received_at.unwrap();
        assert_eq!(received.to_rfc3339(), "2024-12-02T03:00:01.123456789+00:00");
    }

    #[test]
    fn extract_keeps_raw_json_lines() {
        let raw = br#"{"request":{"body":"a \"quoted\" word"},"response":{}}"#;
        let extracted = extract_envelope(raw).unwrap();
        assert_eq!(extracted.json, String::from_utf8_lossy(raw));
        assert!(extracted.received_at.is_none());
    }

    #[test]
    fn extract_locates_json_after_text() {
        let extracted = extract_envelope(b"kong access: {\"a\":1} trailing").unwrap();
        assert_eq!(extracted.json, r#"{"a":1}"#);
    }

    #[test]
    fn extract_repairs_invalid_utf8() {
        let mut raw = b"{\"request\":{},\"response\":{\"body\":\"".to_vec();
        raw.extend_from_slice(&[0xff, 0xfe]);
        raw.extend_from_slice(b"\"}}");
        let extracted = extract_envelope(&raw).unwrap();
        assert!(extracted.json.contains('\u{FFFD}'));
        assert!(parse_envelope(&extracted.json).is_ok());
    }

    #[test]
    fn extract_rejects_noise_and_non_json() {
        assert!(matches!(
            extract_envelope(b"{\"h\":\"Content-Type: image/png\"}"),
            Err(NormalizeError::Noise(_))
        ));
        assert!(matches!(
            extract_envelope(b"loading /usr/local/share/lua/5.1/kong/init.lua"),
            Err(NormalizeError::Noise(_))
        ));
        assert!(matches!(
            extract_envelope(b"GET /config?check_hash=1"),
            Err(NormalizeError::Noise(_))
        ));
        assert!(matches!(
            extract_envelope(b"plain text line"),
            Err(NormalizeError::NoJson)
        ));
        assert!(matches!(extract_envelope(b"   \n"), Err(NormalizeError::Empty)));
    }

    #[test]
    fn validate_requires_object_request_and_response() {
        assert!(validate_envelope(&json!({"request": {}, "response": {}})).is_ok());
        assert!(matches!(
            validate_envelope(&json!({"response": {}})),
            Err(NormalizeError::MissingKey("request"))
        ));
        assert!(matches!(
            validate_envelope(&json!({"request": {}, "response": "200"})),
            Err(NormalizeError::NotAnObject("response"))
        ));
        assert!(matches!(
            validate_envelope(&json!([1, 2])),
            Err(NormalizeError::MissingKey("request"))
        ));
        assert!(matches!(
            parse_envelope("{not json"),
            Err(NormalizeError::Json(_))
        ));
    }

    #[test]
    fn identity_strips_port_and_templates_ids() {
        let identity = derive_api_identity(&request_with_url(
            "https://gateway.example.org:443/v1/private/x/1282?limit=20&page=0",
        ))
        .unwrap();
        assert_eq!(identity.host, "gateway.example.org");
        assert_eq!(identity.method, "GET");
        assert_eq!(identity.path, "/v1/private/x/{id}");

        let identity = derive_api_identity(&request_with_url(
            "http://gateway.example.org:8000/v1/private/x/123e4567-e89b-12d3-a456-426614174000",
        ))
        .unwrap();
        assert_eq!(identity.host, "gateway.example.org");
        assert_eq!(identity.path, "/v1/private/x/{uuid}");
    }

    #[test]
    fn identity_requires_url_and_method() {
        let request = json!({"method": "GET"}).as_object().cloned().unwrap();
        assert!(matches!(
            derive_api_identity(&request),
            Err(NormalizeError::MissingKey("url"))
        ));
        let request = json!({"url": "not a url", "method": "GET"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(matches!(
            derive_api_identity(&request),
            Err(NormalizeError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn template_path_leaves_words_alone() {
        assert_eq!(template_path("/v2/ads/12/images/main"), "/v2/ads/{id}/images/main");
        assert_eq!(template_path("/"), "/");
        assert_eq!(template_path("/v1/-5"), "/v1/-5");
        assert_eq!(template_path("/v1/+5"), "/v1/+5");
    }

    #[test]
    fn template_path_keeps_digit_runs_beyond_u64() {
        assert_eq!(
            template_path("/v1/x/123456789012345678901234567890"),
            "/v1/x/123456789012345678901234567890"
        );
        assert_eq!(
            template_path("/v1/x/18446744073709551615"),
            "/v1/x/{id}"
        );
    }

    #[test]
    fn parameters_use_hints_then_value() {
        let query = json!({
            "page": "abc",
            "flag": "true",
            "bare": true,
            "region": "13",
            "q": "shoes",
            "tags": ["a", "b"]
        });
        let params = build_parameters(query.as_object().unwrap());
        let by_name = |name: &str| params.iter().find(|p| p.name == name).unwrap();

        assert_eq!(by_name("page").param_type, ParameterType::Integer);
        assert_eq!(by_name("flag").param_type, ParameterType::Boolean);
        assert_eq!(by_name("bare").param_type, ParameterType::Boolean);
        assert_eq!(by_name("region").param_type, ParameterType::Integer);
        assert_eq!(by_name("q").param_type, ParameterType::String);
        assert_eq!(by_name("tags").value.as_deref(), Some("a"));
        assert!(params
            .iter()
            .all(|p| p.location == ParameterLocation::Query && !p.required));
    }
}
