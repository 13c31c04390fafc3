//! Document transformers applied after splitting.
//!
//! A [`Transformer`] rewrites a chunk list: stamp metadata, drop empty
//! sections, edit keys. Transformers are looked up by name with
//! [`get_transformer`] so ingestion flows can list them in configuration.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{Document, Metadata};

pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    fn transform(&self, docs: Vec<Document>) -> anyhow::Result<Vec<Document>>;
}

/// Build a transformer by name from its JSON options.
pub fn get_transformer(
    name: &str,
    options: &serde_json::Map<String, Value>,
) -> Result<Box<dyn Transformer>> {
    let decode_err = |e: serde_json::Error| {
        Error::Config(format!("invalid options for transformer {:?}: {}", name, e))
    };
    let options = Value::Object(options.clone());
    match name {
        ExtraMetadata::NAME => Ok(Box::new(
            serde_json::from_value::<ExtraMetadata>(options).map_err(decode_err)?,
        )),
        FilterMarkdownDocsNoContent::NAME => Ok(Box::new(FilterMarkdownDocsNoContent)),
        MetadataManipulator::NAME => Ok(Box::new(
            serde_json::from_value::<MetadataManipulator>(options).map_err(decode_err)?,
        )),
        other => Err(Error::Config(format!("unknown transformer {:?}", other))),
    }
}

/// Set every key of `metadata` on every chunk, overwriting.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraMetadata {
    #[serde(default)]
    pub metadata: Metadata,
}

impl ExtraMetadata {
    pub const NAME: &'static str = "extra_metadata";

    pub fn new(metadata: Metadata) -> Self {
        Self { metadata }
    }
}

impl Transformer for ExtraMetadata {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn transform(&self, mut docs: Vec<Document>) -> anyhow::Result<Vec<Document>> {
        for doc in &mut docs {
            for (k, v) in &self.metadata {
                doc.metadata.insert(k.clone(), v.clone());
            }
        }
        Ok(docs)
    }
}

/// Drop markdown chunks that hold nothing but headings and blank lines.
#[derive(Debug, Clone, Default)]
pub struct FilterMarkdownDocsNoContent;

impl FilterMarkdownDocsNoContent {
    pub const NAME: &'static str = "filter_markdown_docs_no_content";
}

impl Transformer for FilterMarkdownDocsNoContent {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn transform(&self, docs: Vec<Document>) -> anyhow::Result<Vec<Document>> {
        Ok(docs
            .into_iter()
            .filter(|d| {
                d.content
                    .lines()
                    .map(str::trim)
                    .any(|l| !l.is_empty() && !l.starts_with('#'))
            })
            .collect())
    }
}

/// One metadata edit.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataOperation {
    Set { key: String, value: Value },
    Delete { key: String },
    Rename { from: String, to: String },
}

/// Apply a list of metadata edits to every chunk, in order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataManipulator {
    #[serde(default)]
    pub operations: Vec<MetadataOperation>,
}

impl MetadataManipulator {
    pub const NAME: &'static str = "metadata_manipulator";
}

impl Transformer for MetadataManipulator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn transform(&self, mut docs: Vec<Document>) -> anyhow::Result<Vec<Document>> {
        for doc in &mut docs {
            for op in &self.operations {
                match op {
                    MetadataOperation::Set { key, value } => {
                        doc.metadata.insert(key.clone(), value.clone());
                    }
                    MetadataOperation::Delete { key } => {
                        doc.metadata.remove(key);
                    }
                    MetadataOperation::Rename { from, to } => {
                        if let Some(v) = doc.metadata.remove(from) {
                            doc.metadata.insert(to.clone(), v);
                        }
                    }
                }
            }
        }
        Ok(docs)
    }
}
