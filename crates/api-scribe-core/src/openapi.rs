//! OpenAPI 3 document assembly.
//!
//! Renders one [`Api`] and its merged structures as a standalone OpenAPI
//! 3.0.0 document, with a single server (the Api host) and a single
//! operation under `paths[path][method]`.
//!
//! Paths containing `private` get a per-operation Bearer security
//! requirement on top of the document-level one.

use serde_json::{json, Map, Value};

use crate::models::{Api, Parameter, ParameterType, RequestStructure, ResponseStructure};
use crate::schema::Schema;

pub const OPENAPI_VERSION: &str = "3.0.0";
pub const DOCUMENT_TITLE: &str = "API Scribe Document";
pub const DOCUMENT_VERSION: &str = "1.0.0";

/// Assemble the OpenAPI document for `api`.
///
/// Missing structures, empty parameter lists, and empty body schemas
/// simply leave the corresponding operation keys out.
pub fn build_document(
    api: &Api,
    request: Option<&RequestStructure>,
    response: Option<&ResponseStructure>,
) -> Value {
    let mut operation = Map::new();

    if api.path.contains("private") {
        operation.insert("security".to_string(), bearer_requirement());
    }

    if let Some(request) = request {
        if !request.parameters.is_empty() {
            let parameters: Vec<Value> = request.parameters.iter().map(parameter_object).collect();
            operation.insert("parameters".to_string(), Value::Array(parameters));
        }
        if let Some(schema) = non_empty(request.body_schema.as_ref()) {
            operation.insert(
                "requestBody".to_string(),
                json!({ "content": { "application/json": { "schema": schema } } }),
            );
        }
    }

    if let Some(schema) = response.and_then(|r| non_empty(r.body_schema.as_ref())) {
        operation.insert(
            "responses".to_string(),
            json!({
                "200": {
                    "description": "Success",
                    "content": { "application/json": { "schema": schema } }
                }
            }),
        );
    }

    let mut path_item = Map::new();
    path_item.insert(api.method.to_lowercase(), Value::Object(operation));
    let mut paths = Map::new();
    paths.insert(api.path.clone(), Value::Object(path_item));

    let description = if api.description.is_empty() {
        DOCUMENT_TITLE
    } else {
        api.description.as_str()
    };

    json!({
        "openapi": OPENAPI_VERSION,
        "info": {
            "title": DOCUMENT_TITLE,
            "description": description,
            "version": DOCUMENT_VERSION,
        },
        "servers": [{ "url": api.host }],
        "paths": paths,
        "securityDefinitions": {
            "Bearer": {
                "type": "apiKey",
                "name": "Authorization",
                "in": "header",
                "description": "Enter the token with the `Bearer: ` prefix, e.g. \"Bearer abcde12345\".",
            }
        },
        "security": bearer_requirement(),
    })
}

fn bearer_requirement() -> Value {
    json!([{ "Bearer": [] }])
}

fn non_empty(schema: Option<&Schema>) -> Option<Value> {
    let schema = schema?;
    if schema.is_empty_object() {
        return None;
    }
    serde_json::to_value(schema).ok()
}

fn parameter_object(parameter: &Parameter) -> Value {
    // OpenAPI has no "any" type; an empty schema accepts every value.
    let schema = match parameter.param_type {
        ParameterType::Any => json!({}),
        other => json!({ "type": other.as_str() }),
    };
    json!({
        "name": parameter.name,
        "in": parameter.location.as_str(),
        "required": parameter.required,
        "schema": schema,
    })
}
