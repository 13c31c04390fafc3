//! Retrieval strategies.
//!
//! Every strategy implements [`Retriever`] and operates entirely through the
//! [`Store`] trait. Strategies are looked up by name with [`get_retriever`]
//! and tuned from a JSON map with [`Retriever::decode_config`]:
//!
//! | Name | Strategy | Scores |
//! |------|----------|--------|
//! | `basic` / `default` | [`BasicRetriever`]: per-dataset similarity search | cosine, `[-1, 1]` |
//! | `bm25` | [`Bm25Retriever`]: lexical Okapi BM25 | unbounded |
//! | `subquery` | [`SubqueryRetriever`]: decompose, retrieve, dedup | cosine, `[-1, 1]` |
//! | `routing` | [`RoutingRetriever`]: query only the best datasets | cosine, `[-1, 1]` |
//! | `merging` | [`MergingRetriever`]: weighted fusion of others | `[-1, 1]` |
//!
//! A `top_k` of zero means "unset": [`Retriever::fill_defaults`] replaces it,
//! and a retriever that is still unset at query time uses [`DEFAULT_TOP_K`].

mod basic;
mod bm25;
mod merging;
mod routing;
mod subquery;

pub use basic::BasicRetriever;
pub use bm25::Bm25Retriever;
pub use merging::{MergingRetriever, WeightedRetriever};
pub use routing::RoutingRetriever;
pub use subquery::{ClauseDecomposer, QueryDecomposer, SubqueryRetriever};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::{MetadataFilter, WhereDocument};
use crate::models::Document;
use crate::store::Store;

/// Result count used when nothing else configured one.
pub const DEFAULT_TOP_K: usize = 10;

/// A pluggable retrieval strategy.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &str;

    /// Whether returned `similarity_score`s are already on the cosine
    /// scale, `[-1, 1]`. Unbounded scores are min-max normalized before
    /// being merged with others.
    fn normalized_scores(&self) -> bool;

    /// Overlay user configuration. Unknown keys are rejected.
    fn decode_config(&mut self, config: &serde_json::Map<String, Value>) -> Result<()>;

    /// Apply `top_k` wherever this retriever has none configured.
    fn fill_defaults(&mut self, top_k: usize);

    async fn retrieve(
        &self,
        store: &dyn Store,
        query: &str,
        datasets: &[String],
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<Vec<Document>>;
}

/// Look up a retriever by name, with its built-in defaults.
pub fn get_retriever(name: &str) -> Result<Box<dyn Retriever>> {
    match name {
        BasicRetriever::NAME | "default" => Ok(Box::new(BasicRetriever::default())),
        Bm25Retriever::NAME => Ok(Box::new(Bm25Retriever::default())),
        SubqueryRetriever::NAME => Ok(Box::new(SubqueryRetriever::default())),
        RoutingRetriever::NAME => Ok(Box::new(RoutingRetriever::default())),
        MergingRetriever::NAME => Ok(Box::new(MergingRetriever::default())),
        other => Err(Error::Config(format!("unknown retriever {:?}", other))),
    }
}

/// Look up a retriever by name and apply its configuration.
pub fn retriever_from_config(
    name: &str,
    config: &serde_json::Map<String, Value>,
) -> Result<Box<dyn Retriever>> {
    let mut retriever = get_retriever(name)?;
    retriever.decode_config(config)?;
    Ok(retriever)
}

/// Overlay `config` onto the serde view of `target`.
///
/// Keys absent from `config` keep their current values. `topK` and `TopK`
/// spellings are accepted for `top_k`.
pub(crate) fn overlay_config<T>(
    target: &mut T,
    name: &str,
    config: &serde_json::Map<String, Value>,
) -> Result<()>
where
    T: Serialize + DeserializeOwned,
{
    if config.is_empty() {
        return Ok(());
    }
    let invalid = |e: serde_json::Error| {
        Error::Config(format!("failed to decode {} retriever configuration: {}", name, e))
    };
    let mut current = match serde_json::to_value(&*target).map_err(invalid)? {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    for (k, v) in config {
        current.insert(snake_case(k), v.clone());
    }
    *target = serde_json::from_value(Value::Object(current)).map_err(invalid)?;
    tracing::debug!(retriever = name, config = ?config, "Retriever custom configuration");
    Ok(())
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 2);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

pub(crate) fn effective_top_k(top_k: usize) -> usize {
    if top_k == 0 {
        DEFAULT_TOP_K
    } else {
        top_k
    }
}

/// Keep the best-scored copy of every chunk id, best first.
pub(crate) fn dedup_by_best_score(docs: Vec<Document>) -> Vec<Document> {
    let mut best: Vec<Document> = Vec::with_capacity(docs.len());
    for doc in docs {
        match best.iter_mut().find(|d| d.id == doc.id) {
            Some(existing) if doc.similarity_score > existing.similarity_score => *existing = doc,
            Some(_) => {}
            None => best.push(doc),
        }
    }
    crate::models::sort_by_similarity(&mut best);
    best
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_names() {
        for name in ["basic", "default", "bm25", "subquery", "routing", "merging"] {
            assert!(get_retriever(name).is_ok(), "{}", name);
        }
        assert_eq!(get_retriever("default").unwrap().name(), "basic");
        let err = get_retriever("nope").err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_decode_config_overlays_and_rejects_unknown() {
        let cfg = json!({"k1": 2.0, "top_n": 4});
        let r = retriever_from_config("bm25", cfg.as_object().unwrap()).unwrap();
        assert_eq!(r.name(), "bm25");

        let bad = json!({"bogus": 1});
        assert!(retriever_from_config("basic", bad.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_config_keys_accept_camel_case() {
        assert_eq!(snake_case("TopK"), "top_k");
        assert_eq!(snake_case("topK"), "top_k");
        assert_eq!(snake_case("MaxDatasets"), "max_datasets");
        assert_eq!(snake_case("K1"), "k1");
        assert_eq!(snake_case("top_n"), "top_n");

        let cfg = json!({"TopK": 4});
        let mut r = BasicRetriever::default();
        r.decode_config(cfg.as_object().unwrap()).unwrap();
        assert_eq!(r.top_k, 4);
    }

    #[test]
    fn test_dedup_keeps_best() {
        let mk = |id: &str, s: f32| Document {
            id: id.into(),
            similarity_score: s,
            ..Default::default()
        };
        let out = dedup_by_best_score(vec![mk("a", 0.2), mk("b", 0.5), mk("a", 0.9)]);
        assert_eq!(testutil::ids(&out), vec!["a", "b"]);
        assert_eq!(out[0].similarity_score, 0.9);
    }
}
