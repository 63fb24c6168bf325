//! Core data models used throughout API Scribe.
//!
//! These types represent the discovered endpoints, the raw samples captured
//! for them, and the merged structures that the structure builder derives
//! from those samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::Schema;

/// A discovered endpoint, identified by host and templated path.
///
/// The method is recorded from the first observation but is not part of
/// the identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Api {
    pub id: String,
    pub host: String,
    pub method: String,
    pub path: String,
    pub description: String,
    /// Build watermark: samples created after this instant have not been
    /// folded into the structures yet. `None` until the first build.
    pub last_build_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Api {
    pub fn new(host: &str, method: &str, path: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            host: host.to_string(),
            method: method.to_uppercase(),
            path: path.to_string(),
            description: String::new(),
            last_build_at: None,
            created_at: Utc::now(),
        }
    }
}

/// Declared type of a request parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Boolean,
    Integer,
    /// Widened type for a parameter observed with conflicting types.
    Any,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Boolean => "boolean",
            ParameterType::Integer => "integer",
            ParameterType::Any => "any",
        }
    }
}

/// Where a parameter is carried in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterLocation {
    Query,
}

impl ParameterLocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterLocation::Query => "query",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(rename = "in")]
    pub location: ParameterLocation,
    pub required: bool,
    /// Observed value. Only samples carry one; merged structures drop it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// One observed request for an [`Api`]. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRequest {
    pub id: String,
    pub api_id: String,
    pub parameters: Vec<Parameter>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl SampleRequest {
    pub fn new(api_id: &str, parameters: Vec<Parameter>, body: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            api_id: api_id.to_string(),
            parameters,
            body,
            created_at: Utc::now(),
        }
    }
}

/// One observed response for an [`Api`]. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResponse {
    pub id: String,
    pub api_id: String,
    pub status_code: i64,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl SampleResponse {
    pub fn new(api_id: &str, status_code: i64, body: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            api_id: api_id.to_string(),
            status_code,
            body,
            created_at: Utc::now(),
        }
    }
}

/// Which side of the exchange a sample or structure describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Request,
    Response,
}

impl SampleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleKind::Request => "request",
            SampleKind::Response => "response",
        }
    }
}

/// Merged request shape for an [`Api`]. One per Api, updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestStructure {
    pub id: String,
    pub api_id: String,
    pub parameters: Vec<Parameter>,
    pub body_schema: Option<Schema>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestStructure {
    pub fn new(api_id: &str, parameters: Vec<Parameter>, body_schema: Option<Schema>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            api_id: api_id.to_string(),
            parameters,
            body_schema,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Merged response shape for an [`Api`]. One per Api, updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseStructure {
    pub id: String,
    pub api_id: String,
    pub body_schema: Option<Schema>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResponseStructure {
    pub fn new(api_id: &str, body_schema: Option<Schema>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            api_id: api_id.to_string(),
            body_schema,
            created_at: now,
            updated_at: now,
        }
    }
}
