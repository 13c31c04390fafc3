use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::{MetadataFilter, WhereDocument};
use crate::models::{sort_by_similarity, Document};
use crate::store::Store;

use super::{effective_top_k, overlay_config, Retriever};

/// Lexical Okapi BM25 over every chunk of the requested datasets.
///
/// The corpus is the filtered chunk set of all datasets together, so IDF is
/// shared across datasets. Chunks sharing no term with the query are
/// dropped. Scores are raw BM25 values, not normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bm25Retriever {
    #[serde(default)]
    pub top_n: usize,
    #[serde(default = "default_k1")]
    pub k1: f64,
    #[serde(default = "default_b")]
    pub b: f64,
}

fn default_k1() -> f64 {
    1.2
}

fn default_b() -> f64 {
    0.75
}

impl Default for Bm25Retriever {
    fn default() -> Self {
        Self {
            top_n: 0,
            k1: default_k1(),
            b: default_b(),
        }
    }
}

impl Bm25Retriever {
    pub const NAME: &'static str = "bm25";

    /// Score `docs` against `query`. Output is best first.
    pub fn rank(&self, query: &str, docs: Vec<Document>) -> Vec<Document> {
        let query_terms: Vec<String> = {
            let mut terms = tokenize(query);
            terms.sort();
            terms.dedup();
            terms
        };
        if query_terms.is_empty() || docs.is_empty() {
            return Vec::new();
        }

        let doc_terms: Vec<Vec<String>> = docs.iter().map(|d| tokenize(&d.content)).collect();
        let n = docs.len() as f64;
        let avg_len = doc_terms.iter().map(Vec::len).sum::<usize>() as f64 / n;

        let doc_freq: HashMap<&str, usize> = query_terms
            .iter()
            .map(|t| {
                let df = doc_terms.iter().filter(|terms| terms.contains(t)).count();
                (t.as_str(), df)
            })
            .collect();

        let mut scored: Vec<Document> = docs
            .into_iter()
            .zip(doc_terms.iter())
            .filter_map(|(mut doc, terms)| {
                let len = terms.len() as f64;
                let score: f64 = query_terms
                    .iter()
                    .map(|t| {
                        let tf = terms.iter().filter(|x| *x == t).count() as f64;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let df = doc_freq[t.as_str()] as f64;
                        let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                        let norm = if avg_len > 0.0 { len / avg_len } else { 0.0 };
                        idf * (tf * (self.k1 + 1.0))
                            / (tf + self.k1 * (1.0 - self.b + self.b * norm))
                    })
                    .sum();
                (score > 0.0).then(|| {
                    doc.similarity_score = score as f32;
                    doc
                })
            })
            .collect();

        sort_by_similarity(&mut scored);
        scored
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl Retriever for Bm25Retriever {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn normalized_scores(&self) -> bool {
        false
    }

    fn decode_config(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        overlay_config(self, Self::NAME, config)?;
        if self.k1 < 0.0 || !(0.0..=1.0).contains(&self.b) {
            return Err(Error::Config(format!(
                "bm25 parameters out of range: k1={} b={}",
                self.k1, self.b
            )));
        }
        Ok(())
    }

    fn fill_defaults(&mut self, top_k: usize) {
        if self.top_n == 0 {
            self.top_n = top_k;
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
        if datasets.is_empty() {
            return Err(Error::InvalidInput(
                "no dataset specified for retrieval".to_string(),
            ));
        }

        let mut corpus = Vec::new();
        for dataset in datasets {
            match store.get_dataset(dataset).await {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) if e.is_dataset_not_found() => continue,
                Err(e) => return Err(e),
            }
            corpus.extend(
                store
                    .get_documents(dataset, metadata_filter, content_filter)
                    .await?,
            );
        }

        let mut results = self.rank(query, corpus);
        results.truncate(effective_top_k(self.top_n));
        tracing::debug!(retriever = Self::NAME, results = results.len(), "retrieved");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrievers::testutil::{ids, FixtureStore};

    #[test]
    fn test_rank_prefers_rare_terms() {
        let docs = vec![
            Document {
                id: "common".into(),
                content: "the cat sat on the mat".into(),
                ..Default::default()
            },
            Document {
                id: "rare".into(),
                content: "the axolotl swam".into(),
                ..Default::default()
            },
            Document {
                id: "none".into(),
                content: "nothing relevant here".into(),
                ..Default::default()
            },
        ];
        let ranked = Bm25Retriever::default().rank("the axolotl", docs);
        assert_eq!(ids(&ranked), vec!["rare", "common"]);
        assert!(ranked[0].similarity_score > ranked[1].similarity_score);
    }

    #[tokio::test]
    async fn test_retrieve_over_datasets_with_filter() {
        let store = FixtureStore::default()
            .with("A", &[("a1", "rust ownership", 0.0), ("a2", "rust traits", 0.0)])
            .with("B", &[("b1", "go channels", 0.0), ("b2", "rust macros", 0.0)]);
        let mut r = Bm25Retriever::default();
        r.fill_defaults(2);
        let docs = r
            .retrieve(
                &store,
                "rust",
                &["A".to_string(), "B".to_string(), "missing".to_string()],
                &MetadataFilter::new(),
                &[WhereDocument::NotContains("traits".into())],
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.content.contains("rust")));
        assert!(docs.iter().all(|d| d.id != "a2"));
    }

    #[test]
    fn test_decode_rejects_bad_b() {
        let mut r = Bm25Retriever::default();
        let cfg = serde_json::json!({"b": 3.0});
        assert!(r.decode_config(cfg.as_object().unwrap()).is_err());
    }
}
