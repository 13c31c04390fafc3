use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::{MetadataFilter, WhereDocument};
use crate::models::Document;
use crate::store::Store;

use super::{overlay_config, BasicRetriever, Retriever};

/// Send the query only to the datasets most likely to answer it.
///
/// Each dataset is probed with a one-result similarity search; the best
/// `max_datasets` probes (by score) receive the full query. Datasets whose
/// probe returns nothing are never selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingRetriever {
    #[serde(default)]
    pub top_k: usize,
    #[serde(default = "default_max_datasets")]
    pub max_datasets: usize,
}

fn default_max_datasets() -> usize {
    1
}

impl Default for RoutingRetriever {
    fn default() -> Self {
        Self {
            top_k: 0,
            max_datasets: default_max_datasets(),
        }
    }
}

impl RoutingRetriever {
    pub const NAME: &'static str = "routing";
}

#[async_trait]
impl Retriever for RoutingRetriever {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn normalized_scores(&self) -> bool {
        true
    }

    fn decode_config(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        overlay_config(self, Self::NAME, config)?;
        if self.max_datasets == 0 {
            return Err(Error::Config(
                "routing retriever needs max_datasets >= 1".to_string(),
            ));
        }
        Ok(())
    }

    fn fill_defaults(&mut self, top_k: usize) {
        if self.top_k == 0 {
            self.top_k = top_k;
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

        let mut probes: Vec<(f32, &String)> = Vec::new();
        for dataset in datasets {
            match store.get_dataset(dataset).await {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) if e.is_dataset_not_found() => continue,
                Err(e) => return Err(e),
            }
            let best = store
                .similarity_search(query, 1, dataset, metadata_filter, content_filter)
                .await?;
            if let Some(doc) = best.first() {
                probes.push((doc.similarity_score, dataset));
            }
        }

        probes.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let selected: Vec<String> = probes
            .into_iter()
            .take(self.max_datasets.max(1))
            .map(|(_, d)| d.clone())
            .collect();
        tracing::debug!(retriever = Self::NAME, datasets = ?selected, "routed query");

        if selected.is_empty() {
            return Ok(Vec::new());
        }
        BasicRetriever::new(self.top_k)
            .retrieve(store, query, &selected, metadata_filter, content_filter)
            .await
    }
}
