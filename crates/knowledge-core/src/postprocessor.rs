//! Result transforms applied after retrieval.
//!
//! A [`Postprocessor`] rewrites a [`RetrievalResponse`] in place: re-rank,
//! trim, annotate. Postprocessors run in configuration order and a failure
//! fails the whole retrieval. The HTTP re-ranker lives in the app crate.

use async_trait::async_trait;
use serde::Deserialize;

use crate::models::RetrievalResponse;

#[async_trait]
pub trait Postprocessor: Send + Sync {
    fn name(&self) -> &str;

    async fn transform(&self, response: &mut RetrievalResponse) -> anyhow::Result<()>;
}

/// Drop results scoring below `threshold`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimilarityPostprocessor {
    pub threshold: f32,
    /// Keep at least this many results per query regardless of score.
    #[serde(default)]
    pub keep_min: usize,
}

impl SimilarityPostprocessor {
    pub const NAME: &'static str = "similarity";

    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            keep_min: 0,
        }
    }
}

#[async_trait]
impl Postprocessor for SimilarityPostprocessor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(&self, response: &mut RetrievalResponse) -> anyhow::Result<()> {
        for qr in &mut response.responses {
            let mut kept = 0usize;
            qr.result_documents.retain(|d| {
                let keep = kept < self.keep_min || d.similarity_score >= self.threshold;
                if keep {
                    kept += 1;
                }
                keep
            });
            qr.num_results = qr.result_documents.len();
        }
        Ok(())
    }
}
