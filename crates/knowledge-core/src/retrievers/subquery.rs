use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::filter::{MetadataFilter, WhereDocument};
use crate::models::Document;
use crate::store::Store;

use super::{dedup_by_best_score, overlay_config, BasicRetriever, Retriever};

/// Splits a multi-aspect query into focused sub-queries.
#[async_trait]
pub trait QueryDecomposer: Send + Sync {
    /// Return at most `limit` sub-queries. Never empty for a non-empty query.
    async fn decompose(&self, query: &str, limit: usize) -> Result<Vec<String>>;
}

/// Heuristic decomposer: splits on sentence punctuation, semicolons, line
/// breaks and the conjunctions "and" / "as well as" between clauses.
/// Fragments of a single word are folded back into their neighbour.
#[derive(Debug, Clone, Default)]
pub struct ClauseDecomposer;

const CONJUNCTIONS: &[&str] = &[" as well as ", " and also ", " and "];

#[async_trait]
impl QueryDecomposer for ClauseDecomposer {
    async fn decompose(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let mut clauses: Vec<String> = Vec::new();
        for sentence in query.split(['?', ';', '\n', '.']) {
            let mut parts = vec![sentence.to_string()];
            for conj in CONJUNCTIONS {
                parts = parts
                    .iter()
                    .flat_map(|p| p.split(conj).map(str::to_string).collect::<Vec<_>>())
                    .collect();
            }
            for part in parts {
                let part = part.trim().trim_matches(',').trim();
                if part.is_empty() {
                    continue;
                }
                match clauses.last_mut() {
                    Some(prev) if part.split_whitespace().count() < 2 => {
                        prev.push(' ');
                        prev.push_str(part);
                    }
                    _ => clauses.push(part.to_string()),
                }
            }
        }

        if clauses.is_empty() {
            let trimmed = query.trim();
            if !trimmed.is_empty() {
                clauses.push(trimmed.to_string());
            }
        }
        clauses.truncate(limit.max(1));
        Ok(clauses)
    }
}

fn default_decomposer() -> Arc<dyn QueryDecomposer> {
    Arc::new(ClauseDecomposer)
}

/// Retrieve per sub-query and merge, keeping each chunk's best score.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubqueryRetriever {
    /// Maximum number of sub-queries.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Results per sub-query.
    #[serde(default = "default_limit")]
    pub top_k: usize,
    #[serde(skip, default = "default_decomposer")]
    pub decomposer: Arc<dyn QueryDecomposer>,
}

fn default_limit() -> usize {
    3
}

impl Default for SubqueryRetriever {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            top_k: default_limit(),
            decomposer: default_decomposer(),
        }
    }
}

impl SubqueryRetriever {
    pub const NAME: &'static str = "subquery";

    pub fn with_decomposer(mut self, decomposer: Arc<dyn QueryDecomposer>) -> Self {
        self.decomposer = decomposer;
        self
    }
}

#[async_trait]
impl Retriever for SubqueryRetriever {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn normalized_scores(&self) -> bool {
        true
    }

    fn decode_config(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        let decomposer = self.decomposer.clone();
        overlay_config(self, Self::NAME, config)?;
        self.decomposer = decomposer;
        Ok(())
    }

    fn fill_defaults(&mut self, top_k: usize) {
        if self.top_k == 0 {
            self.top_k = top_k;
        }
        if self.limit == 0 {
            self.limit = default_limit();
        }
    }

    async fn retrieve(
        &self,
        store: &dyn Store,
        query: &str,
        datasets: &[String],
        metadata_filter: &MetadataFilter,
        content_filter: &[WhereDocument],
    ) -> Result<Vec<Document>> {
        let queries = self.decomposer.decompose(query, self.limit).await?;
        tracing::debug!(retriever = Self::NAME, subqueries = ?queries, "decomposed query");

        let basic = BasicRetriever::new(self.top_k);
        let mut all = Vec::new();
        for q in &queries {
            all.extend(
                basic
                    .retrieve(store, q, datasets, metadata_filter, content_filter)
                    .await?,
            );
        }
        Ok(dedup_by_best_score(all))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrievers::testutil::FixtureStore;

    #[tokio::test]
    async fn test_clause_decomposer() {
        let d = ClauseDecomposer;
        let parts = d
            .decompose("How do lifetimes work and what is a borrow checker?", 3)
            .await
            .unwrap();
        assert_eq!(parts, vec!["How do lifetimes work", "what is a borrow checker"]);

        let single = d.decompose("rust", 3).await.unwrap();
        assert_eq!(single, vec!["rust"]);

        let capped = d.decompose("a b; c d; e f; g h", 2).await.unwrap();
        assert_eq!(capped, vec!["a b", "c d"]);
    }

    struct Fixed(Vec<&'static str>);

    #[async_trait]
    impl QueryDecomposer for Fixed {
        async fn decompose(&self, _query: &str, limit: usize) -> Result<Vec<String>> {
            Ok(self.0.iter().take(limit).map(|s| s.to_string()).collect())
        }
    }

    #[tokio::test]
    async fn test_results_are_deduplicated() {
        let store = FixtureStore::default().with("A", &[("a1", "x", 0.9), ("a2", "x", 0.4)]);
        let r = SubqueryRetriever::default().with_decomposer(Arc::new(Fixed(vec!["one", "two"])));
        let docs = r
            .retrieve(&store, "q", &["A".to_string()], &MetadataFilter::new(), &[])
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "a1");
    }

    #[test]
    fn test_decode_keeps_decomposer() {
        let mut r = SubqueryRetriever::default();
        let cfg = serde_json::json!({"limit": 5});
        r.decode_config(cfg.as_object().unwrap()).unwrap();
        assert_eq!(r.limit, 5);
        assert_eq!(r.top_k, 3);
    }
}
