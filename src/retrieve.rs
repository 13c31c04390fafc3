//! Retrieval at the datastore level.
//!
//! [`Datastore::retrieve`] runs a [`RetrievalFlow`] built from the
//! `[retrieval]` config (or one passed in [`RetrieveOpts`]) against the
//! datastore itself, which is the flow's [`Store`](knowledge_core::store::Store).

use knowledge_core::filter::{MetadataFilter, WhereDocument};
use knowledge_core::flow::{RetrievalFlow, RetrievalFlowOpts};
use knowledge_core::models::RetrievalResponse;
use knowledge_core::retrievers::retriever_from_config;
use knowledge_core::Result;

use crate::config::RetrievalConfig;
use crate::datastore::Datastore;
use crate::postprocessors::get_postprocessor;

/// Per-call retrieval options.
#[derive(Default)]
pub struct RetrieveOpts {
    /// Overrides `[retrieval] top_k` where the retriever has none set.
    pub top_k: Option<usize>,
    /// Plain keywords must appear (any of them); `-`-prefixed ones must not.
    pub keywords: Vec<String>,
    pub metadata_filter: MetadataFilter,
    /// Additional content filters, AND-ed with the keyword filters.
    pub content_filter: Vec<WhereDocument>,
    /// Use this flow instead of the configured one.
    pub flow: Option<RetrievalFlow>,
}

/// Build the retrieval flow described by `config`.
pub fn flow_from_config(config: &RetrievalConfig) -> Result<RetrievalFlow> {
    let mut flow = RetrievalFlow::new(retriever_from_config(
        &config.retriever,
        &config.retriever_options,
    )?);
    for pp in &config.postprocessors {
        flow = flow.with_postprocessor(get_postprocessor(&pp.name, &pp.options)?);
    }
    Ok(flow)
}

impl Datastore {
    /// Retrieve chunks relevant to `query` from `datasets`.
    pub async fn retrieve(
        &self,
        query: &str,
        datasets: &[String],
        opts: RetrieveOpts,
    ) -> Result<RetrievalResponse> {
        tracing::debug!(?datasets, query = %query, "retrieving");

        let mut flow = match opts.flow {
            Some(flow) => flow,
            None => flow_from_config(&self.opts.retrieval)?,
        };
        flow.fill_defaults(
            opts.top_k
                .filter(|k| *k > 0)
                .unwrap_or(self.opts.retrieval.top_k),
        );

        let mut content_filter = WhereDocument::from_keywords(&opts.keywords);
        content_filter.extend(opts.content_filter);

        let response = flow
            .run(
                self,
                query,
                datasets,
                &RetrievalFlowOpts {
                    metadata_filter: opts.metadata_filter,
                    content_filter,
                },
            )
            .await?;
        tracing::info!(
            ?datasets,
            results = response
                .responses
                .iter()
                .map(|r| r.num_results)
                .sum::<usize>(),
            "retrieval finished"
        );
        Ok(response)
    }
}
