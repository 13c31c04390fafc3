//! Retrieval flow: one retriever plus its postprocessors.

use crate::error::{Error, Result};
use crate::filter::{validate_all, MetadataFilter, WhereDocument};
use crate::models::{QueryResponse, RetrievalResponse};
use crate::postprocessor::Postprocessor;
use crate::retrievers::{BasicRetriever, Retriever};
use crate::store::Store;

/// Filters passed through to the retriever.
#[derive(Debug, Clone, Default)]
pub struct RetrievalFlowOpts {
    pub metadata_filter: MetadataFilter,
    pub content_filter: Vec<WhereDocument>,
}

/// A configured retrieval pipeline.
#[derive(Default)]
pub struct RetrievalFlow {
    pub retriever: Option<Box<dyn Retriever>>,
    pub postprocessors: Vec<Box<dyn Postprocessor>>,
}

impl RetrievalFlow {
    pub fn new(retriever: Box<dyn Retriever>) -> Self {
        Self {
            retriever: Some(retriever),
            postprocessors: Vec::new(),
        }
    }

    pub fn with_postprocessor(mut self, pp: Box<dyn Postprocessor>) -> Self {
        self.postprocessors.push(pp);
        self
    }

    /// Install the basic retriever when none is configured, and apply
    /// `top_k` wherever the retriever has none.
    pub fn fill_defaults(&mut self, top_k: usize) {
        let retriever = self
            .retriever
            .get_or_insert_with(|| Box::new(BasicRetriever::default()));
        retriever.fill_defaults(top_k);
    }

    pub async fn run(
        &self,
        store: &dyn Store,
        query: &str,
        datasets: &[String],
        opts: &RetrievalFlowOpts,
    ) -> Result<RetrievalResponse> {
        validate_all(&opts.content_filter)?;

        let fallback = BasicRetriever::default();
        let retriever: &dyn Retriever = match &self.retriever {
            Some(r) => r.as_ref(),
            None => &fallback,
        };

        let docs = retriever
            .retrieve(
                store,
                query,
                datasets,
                &opts.metadata_filter,
                &opts.content_filter,
            )
            .await?;
        tracing::debug!(
            retriever = retriever.name(),
            results = docs.len(),
            "retrieval finished"
        );

        let mut response = RetrievalResponse {
            datasets: datasets.to_vec(),
            responses: vec![QueryResponse {
                query: query.to_string(),
                num_results: docs.len(),
                result_documents: docs,
            }],
        };

        for pp in &self.postprocessors {
            pp.transform(&mut response)
                .await
                .map_err(|source| Error::Postprocess {
                    name: pp.name().to_string(),
                    source,
                })?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocessor::SimilarityPostprocessor;
    use crate::retrievers::testutil::FixtureStore;
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_fill_defaults_installs_basic() {
        let store = FixtureStore::default().with(
            "A",
            &[("a1", "x", 0.9), ("a2", "x", 0.8), ("a3", "x", 0.1)],
        );
        let mut flow = RetrievalFlow::default();
        flow.fill_defaults(2);
        assert_eq!(flow.retriever.as_ref().map(|r| r.name()), Some("basic"));

        let flow = flow.with_postprocessor(Box::new(SimilarityPostprocessor::new(0.85)));
        let resp = flow
            .run(&store, "q", &["A".to_string()], &RetrievalFlowOpts::default())
            .await
            .unwrap();
        assert_eq!(resp.datasets, vec!["A"]);
        assert_eq!(resp.responses[0].num_results, 1);
        assert_eq!(resp.responses[0].result_documents[0].id, "a1");
    }

    #[tokio::test]
    async fn test_invalid_filter_rejected() {
        let store = FixtureStore::default().with("A", &[]);
        let opts = RetrievalFlowOpts {
            content_filter: vec![WhereDocument::Or(vec![])],
            ..Default::default()
        };
        let err = RetrievalFlow::default()
            .run(&store, "q", &["A".to_string()], &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFilter(_)));
    }

    struct Failing;

    #[async_trait]
    impl Postprocessor for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn transform(&self, _response: &mut RetrievalResponse) -> anyhow::Result<()> {
            anyhow::bail!("upstream down")
        }
    }

    #[tokio::test]
    async fn test_postprocessor_failure_fails_retrieval() {
        let store = FixtureStore::default().with("A", &[("a1", "x", 0.9)]);
        let flow = RetrievalFlow::default().with_postprocessor(Box::new(Failing));
        let err = flow
            .run(&store, "q", &["A".to_string()], &RetrievalFlowOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Postprocess { ref name, .. } if name == "failing"));
    }
}
