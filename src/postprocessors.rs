//! Postprocessor registry and the Cohere re-ranker.
//!
//! | Name | Postprocessor |
//! |------|---------------|
//! | `similarity` | [`SimilarityPostprocessor`]: drop results below a score threshold |
//! | `cohere_rerank` | [`CohereRerank`]: cross-encoder re-rank via the Cohere API |

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use knowledge_core::models::{keys, Document, RetrievalResponse};
use knowledge_core::postprocessor::{Postprocessor, SimilarityPostprocessor};
use knowledge_core::Error;

use crate::http;

/// Build a postprocessor by name from its JSON options.
pub fn get_postprocessor(
    name: &str,
    options: &serde_json::Map<String, Value>,
) -> knowledge_core::Result<Box<dyn Postprocessor>> {
    let decode_err = |e: serde_json::Error| {
        Error::Config(format!("invalid options for postprocessor {:?}: {}", name, e))
    };
    let options = Value::Object(options.clone());
    match name {
        SimilarityPostprocessor::NAME => Ok(Box::new(
            serde_json::from_value::<SimilarityPostprocessor>(options).map_err(decode_err)?,
        )),
        CohereRerank::NAME => Ok(Box::new(
            serde_json::from_value::<CohereRerank>(options).map_err(decode_err)?,
        )),
        other => Err(Error::Config(format!("unknown postprocessor {:?}", other))),
    }
}

/// Re-rank each query's results with Cohere's `/v2/rerank` endpoint.
///
/// Results come back in relevance order, trimmed to `top_n` when set, and
/// carry their score under `rerankRelevanceScore`. The API key comes from
/// the options or `COHERE_API_KEY`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CohereRerank {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    /// Results kept per query; 0 keeps all.
    #[serde(default)]
    pub top_n: usize,
    #[serde(default = "default_rerank_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_rerank_model() -> String {
    "rerank-v3.5".to_string()
}
fn default_rerank_url() -> String {
    "https://api.cohere.com/v2/rerank".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}

impl CohereRerank {
    pub const NAME: &'static str = "cohere_rerank";

    fn api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        std::env::var("COHERE_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("COHERE_API_KEY environment variable not set"))
    }

    async fn rerank(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        query: &str,
        docs: Vec<Document>,
    ) -> Result<Vec<Document>> {
        tracing::debug!(
            model = %self.model,
            top_n = self.top_n,
            docs = docs.len(),
            "reranking documents"
        );
        let top_n = if self.top_n == 0 {
            docs.len()
        } else {
            self.top_n.min(docs.len())
        };
        let body = json!({
            "model": self.model,
            "query": query,
            "documents": docs.iter().map(|d| d.content.as_str()).collect::<Vec<_>>(),
            "top_n": top_n,
        });

        let response = http::send_json_with_retry("Cohere", self.max_retries, || {
            client
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
        })
        .await?;

        apply_rerank(docs, &response)
    }
}

/// Reorder `docs` by a rerank response's `results[].index`, stamping each
/// `relevance_score`.
fn apply_rerank(docs: Vec<Document>, response: &Value) -> Result<Vec<Document>> {
    let results = response["results"]
        .as_array()
        .ok_or_else(|| anyhow!("invalid rerank response: missing 'results' array"))?;

    let mut slots: Vec<Option<Document>> = docs.into_iter().map(Some).collect();
    let mut reranked = Vec::with_capacity(results.len());
    for result in results {
        let index = result["index"]
            .as_u64()
            .ok_or_else(|| anyhow!("invalid rerank response: result without 'index'"))?
            as usize;
        let score = result["relevance_score"].as_f64().unwrap_or(0.0);
        let Some(mut doc) = slots.get_mut(index).and_then(Option::take) else {
            bail!("invalid rerank response: index {} out of range or repeated", index);
        };
        doc.set_metadata(keys::RERANK_RELEVANCE_SCORE, score);
        reranked.push(doc);
    }
    Ok(reranked)
}

#[async_trait]
impl Postprocessor for CohereRerank {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn transform(&self, response: &mut RetrievalResponse) -> Result<()> {
        if response
            .responses
            .iter()
            .all(|qr| qr.result_documents.is_empty())
        {
            return Ok(());
        }
        let api_key = self.api_key()?;
        let client = http::client(self.timeout_secs)?;
        for qr in &mut response.responses {
            if qr.result_documents.is_empty() {
                continue;
            }
            let docs = std::mem::take(&mut qr.result_documents);
            qr.result_documents = self.rerank(&client, &api_key, &qr.query, docs).await?;
            qr.num_results = qr.result_documents.len();
        }
        Ok(())
    }
}
