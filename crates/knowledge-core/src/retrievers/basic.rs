use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::{MetadataFilter, WhereDocument};
use crate::models::{sort_by_similarity, Document};
use crate::store::Store;

use super::{effective_top_k, overlay_config, Retriever};

/// Similarity search on every dataset, merged by score.
///
/// Missing datasets are skipped; any other store error aborts the query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BasicRetriever {
    #[serde(default)]
    pub top_k: usize,
}

impl BasicRetriever {
    pub const NAME: &'static str = "basic";

    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }
}

#[async_trait]
impl Retriever for BasicRetriever {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn normalized_scores(&self) -> bool {
        true
    }

    fn decode_config(&mut self, config: &serde_json::Map<String, Value>) -> Result<()> {
        overlay_config(self, Self::NAME, config)
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
        let top_k = effective_top_k(self.top_k);

        let mut results = Vec::new();
        for dataset in datasets {
            match store.get_dataset(dataset).await {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(e) if e.is_dataset_not_found() => continue,
                Err(e) => return Err(e),
            }
            let docs = store
                .similarity_search(query, top_k, dataset, metadata_filter, content_filter)
                .await?;
            results.extend(docs);
        }

        sort_by_similarity(&mut results);
        results.truncate(top_k);
        tracing::debug!(retriever = Self::NAME, results = results.len(), "retrieved");
        Ok(results)
    }
}
