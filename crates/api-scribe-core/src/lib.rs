//! # API Scribe Core
//!
//! Shared, I/O-free logic for API Scribe: data models, the schema
//! inference and merge engine, the gateway log normalizer, the storage
//! repository traits, and the OpenAPI document assembler.
//!
//! This crate contains no tokio, sqlx, network, or filesystem code. The
//! root `api-scribe` crate wires these pieces to blob storage and SQLite.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | `Api`, samples, parameters, and structure records |
//! | [`schema`] | Type inference, schema synthesis, and schema merging |
//! | [`normalize`] | Raw log line → validated request/response envelope |
//! | [`store`] | Repository traits and an in-memory implementation |
//! | [`openapi`] | OpenAPI 3 document assembly from merged structures |

pub mod models;
pub mod normalize;
pub mod openapi;
pub mod schema;
pub mod store;
