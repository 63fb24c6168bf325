//! # API Scribe
//!
//! Reverse-engineers API documentation from archived gateway traffic.
//!
//! Gateway access logs are read from blob storage, every captured
//! request/response pair is normalized and stored as a sample of the
//! endpoint it hit, and a builder folds those samples into one merged
//! request and response structure per endpoint. Structures render as
//! OpenAPI 3.0 documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────┐   ┌─────────────┐
//! │ Blob store  │──▶│  Ingestion   │──▶│  SQLite   │──▶│  Structure  │
//! │ S3 / local  │   │ hour→file→  │   │ apis +    │   │  builder    │
//! │ *.gz logs   │   │ line pools  │   │ samples   │   │ (per Api)   │
//! └─────────────┘   └─────────────┘   └────┬─────┘   └──────┬──────┘
//!                                          │                │
//!                                          ▼                ▼
//!                                     ┌──────────┐   ┌─────────────┐
//!                                     │  scribe  │◀──│  OpenAPI    │
//!                                     │   CLI    │   │  document   │
//!                                     └──────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! scribe init                   # create database
//! scribe ingest                 # ingest the previous hour of logs
//! scribe build                  # merge new samples into structures
//! scribe apis                   # list discovered endpoints
//! scribe doc <api-id>           # print the OpenAPI document
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`blob`] | Blob storage backends (S3, local directory) |
//! | [`pool`] | Bounded worker pool |
//! | [`ingest`] | Log ingestion pipeline |
//! | [`build`] | Structure builder |
//! | [`sqlite_store`] | SQLite storage backend |
//! | [`apis`] | Api listing |
//! | [`doc`] | OpenAPI document retrieval |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod apis;
pub mod blob;
pub mod build;
pub mod config;
pub mod db;
pub mod doc;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod pool;
pub mod sqlite_store;
