//! # Knowledge
//!
//! A local-first document ingestion and retrieval engine.
//!
//! Files are loaded by filetype, split into chunks, embedded and stored in
//! datasets. Retrieval runs a configurable flow of a retriever (basic
//! similarity, BM25, subquery, routing or merging) and postprocessors over
//! those datasets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌────────────────────┐
//! │ bytes/paths │──▶│ ingest pipeline  │──▶│ Index + Vectorstore │
//! │             │   │ load/split/embed │   │ (SQLite or memory)  │
//! └─────────────┘   └──────────────────┘   └─────────┬──────────┘
//!                                                    │
//!                    ┌──────────────────┐            │
//!   query ──────────▶│ retrieval flow   │◀───────────┘
//!                    │ retriever + pps  │   (Store trait)
//!                    └──────────────────┘
//! ```
//!
//! The engine-side logic (models, filters, ports, retrievers) lives in
//! [`knowledge_core`]; this crate adds the SQLite backends, embedding
//! providers, loaders, the ingestion pipeline and the `know` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`datastore`] | The façade over index, vectorstore and provider |
//! | [`ingest`] | Ingestion pipeline |
//! | [`retrieve`] | Retrieval flow construction and execution |
//! | [`flows`] | Per-filetype splitter and transformer chains |
//! | [`loaders`] | Bytes → documents per filetype |
//! | [`filetypes`] | Filetype detection |
//! | [`dedupe`] | Duplicate checks |
//! | [`embedding`] | OpenAI, Ollama and hash embedding providers |
//! | [`postprocessors`] | Postprocessor registry and Cohere re-ranking |
//! | [`db`] | Connection strings and backend construction |
//! | [`migrate`] | SQLite schema |
//! | [`sqlite_index`] | SQLite [`Index`](knowledge_core::index::Index) |
//! | [`sqlite_vectorstore`] | SQLite [`Vectorstore`](knowledge_core::vectorstore::Vectorstore) |
//! | [`walker`] | File discovery for the CLI |

pub mod config;
pub mod datastore;
pub mod db;
pub mod dedupe;
pub mod embedding;
pub mod filetypes;
pub mod flows;
pub mod http;
pub mod ingest;
pub mod loaders;
pub mod migrate;
pub mod postprocessors;
pub mod retrieve;
pub mod sqlite_index;
pub mod sqlite_vectorstore;
pub mod walker;

pub use knowledge_core;
