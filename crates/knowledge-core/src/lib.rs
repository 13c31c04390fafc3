//! # Knowledge Core
//!
//! The engine-side logic of Knowledge: document and dataset models, the
//! content filter DSL, storage ports with in-memory backends, retrieval
//! strategies and flows, splitters, transformers and the embedding
//! provider trait.
//!
//! This crate contains no sqlx, HTTP, or file-format dependencies. The
//! `knowledge` app crate supplies the SQLite backends, the embedding
//! providers, the loaders and the ingestion pipeline on top of it.

pub mod embedding;
pub mod error;
pub mod filter;
pub mod flow;
pub mod index;
pub mod models;
pub mod postprocessor;
pub mod retrievers;
pub mod splitter;
pub mod store;
pub mod transformers;
pub mod vectorstore;

pub use error::{Error, Result};
