use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::{MetadataFilter, WhereDocument};
use crate::models::{sort_by_similarity, Document};
use crate::store::Store;

use super::{effective_top_k, get_retriever, Bm25Retriever, BasicRetriever, Retriever};

/// One member of a [`MergingRetriever`].
pub struct WeightedRetriever {
    pub retriever: Box<dyn Retriever>,
    pub weight: f32,
}

/// Weighted fusion of several retrievers.
///
/// # Algorithm
///
/// 1. Run every member retriever on the same query.
/// 2. Min-max normalize the lists of members whose scores are not already
///    normalized.
/// 3. Multiply each score by the member's weight over the largest weight,
///    which keeps merged scores on the cosine scale.
/// 4. Merge by chunk id, keeping the maximum weighted score.
/// 5. Sort by score (desc) and truncate to `top_k`.
pub struct MergingRetriever {
    pub top_k: usize,
    pub retrievers: Vec<WeightedRetriever>,
}

impl Default for MergingRetriever {
    fn default() -> Self {
        Self {
            top_k: 0,
            retrievers: vec![
                WeightedRetriever {
                    retriever: Box::new(BasicRetriever::default()),
                    weight: 1.0,
                },
                WeightedRetriever {
                    retriever: Box::new(Bm25Retriever::default()),
                    weight: 1.0,
                },
            ],
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MergingConfig {
    #[serde(default, alias = "topK", alias = "TopK")]
    top_k: Option<usize>,
    #[serde(default)]
    retrievers: Option<Vec<MemberConfig>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MemberConfig {
    name: String,
    #[serde(default = "default_weight")]
    weight: f32,
    #[serde(default)]
    options: serde_json::Map<String, Value>,
}

fn default_weight() -> f32 {
    1.0
}

impl MergingRetriever {
    pub const NAME: &'static str = "merging";
}

/// Min-max normalize scores in place. A list with a single distinct score
/// maps to `1.0`.
fn normalize_scores(docs: &mut [Document]) {
    if docs.is_empty() {
        return;
    }
    let s_min = docs
        .iter()
        .map(|d| d.similarity_score)
        .fold(f32::INFINITY, f32::min);
    let s_max = docs
        .iter()
        .map(|d| d.similarity_score)
        .fold(f32::NEG_INFINITY, f32::max);
    for doc in docs.iter_mut() {
        doc.similarity_score = if (s_max - s_min).abs() < f32::EPSILON {
            1.0
        } else {
            (doc.similarity_score - s_min) / (s_max - s_min)
        };
    }
}

#[async_trait]
impl Retriever for MergingRetriever {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn normalized_scores(&self) -> bool {
        true
    }

    /// Accepts `top_k` and a `retrievers` list of
    /// `{name, weight, options}` entries, which replaces the members.
    fn decode_config(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        if config.is_empty() {
            return Ok(());
        }
        let cfg: MergingConfig = serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| {
                Error::Config(format!("failed to decode merging retriever configuration: {}", e))
            })?;
        if let Some(top_k) = cfg.top_k {
            self.top_k = top_k;
        }
        if let Some(members) = cfg.retrievers {
            if members.is_empty() {
                return Err(Error::Config(
                    "merging retriever needs at least one member".to_string(),
                ));
            }
            let mut retrievers = Vec::with_capacity(members.len());
            for m in members {
                if m.name == Self::NAME {
                    return Err(Error::Config(
                        "merging retriever cannot contain itself".to_string(),
                    ));
                }
                if !(m.weight.is_finite() && m.weight > 0.0) {
                    return Err(Error::Config(format!(
                        "merging member {:?} needs a positive weight (got {})",
                        m.name, m.weight
                    )));
                }
                let mut retriever = get_retriever(&m.name)?;
                retriever.decode_config(&m.options)?;
                retrievers.push(WeightedRetriever {
                    retriever,
                    weight: m.weight,
                });
            }
            self.retrievers = retrievers;
        }
        Ok(())
    }

    fn fill_defaults(&mut self, top_k: usize) {
        if self.top_k == 0 {
            self.top_k = top_k;
        }
        for member in &mut self.retrievers {
            member.retriever.fill_defaults(top_k);
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
        let max_weight = self
            .retrievers
            .iter()
            .map(|m| m.weight)
            .fold(0.0f32, f32::max);
        let mut merged: HashMap<String, Document> = HashMap::new();
        for member in &self.retrievers {
            let mut docs = member
                .retriever
                .retrieve(store, query, datasets, metadata_filter, content_filter)
                .await?;
            if !member.retriever.normalized_scores() {
                normalize_scores(&mut docs);
            }
            for mut doc in docs {
                if max_weight > 0.0 {
                    doc.similarity_score *= member.weight / max_weight;
                }
                match merged.get(&doc.id) {
                    Some(existing) if existing.similarity_score >= doc.similarity_score => {}
                    _ => {
                        merged.insert(doc.id.clone(), doc);
                    }
                }
            }
        }

        let mut results: Vec<Document> = merged.into_values().collect();
        sort_by_similarity(&mut results);
        results.truncate(effective_top_k(self.top_k));
        tracing::debug!(retriever = Self::NAME, results = results.len(), "merged results");
        Ok(results)
    }
}
