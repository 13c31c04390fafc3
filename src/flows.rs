//! Ingestion flows: the loader, splitter and transformers applied to a
//! file, chosen per filetype.
//!
//! Configured `[[ingestion.flows]]` entries win for the filetypes they
//! list. Every other filetype gets a default flow: markdown is split by
//! heading and heading-only sections are dropped; everything else is
//! split on paragraph boundaries. Both defaults use the `[ingestion]`
//! `max_tokens` / `overlap_tokens` values.
//!
//! A flow without a named loader falls back to the filetype's built-in
//! loader. A filetype is unsupported when its flow ends up with neither.

use std::collections::HashMap;

use serde_json::Value;

use knowledge_core::models::{Document, Metadata};
use knowledge_core::splitter::{
    get_splitter, MarkdownSplitter, ParagraphSplitter, Splitter, DEFAULT_MAX_TOKENS,
};
use knowledge_core::transformers::{
    get_transformer, ExtraMetadata, FilterMarkdownDocsNoContent, Transformer,
};
use knowledge_core::{Error, Result};

use crate::config::{FlowConfig, IngestionConfig};
use crate::filetypes::MIME_MARKDOWN;
use crate::loaders::{loader_for, loader_named, LoaderFn, LOADER_NAMES};

/// A loader, a splitter and an ordered list of transformers.
pub struct IngestionFlow {
    /// `None` means the filetype's built-in loader.
    pub loader: Option<LoaderFn>,
    pub splitter: Box<dyn Splitter>,
    pub transformers: Vec<Box<dyn Transformer>>,
}

impl IngestionFlow {
    /// The built-in flow for `filetype`.
    pub fn default_for(filetype: &str, max_tokens: usize, overlap_tokens: usize) -> Self {
        if filetype == MIME_MARKDOWN {
            Self {
                loader: None,
                splitter: Box::new(MarkdownSplitter::new(max_tokens, overlap_tokens)),
                transformers: vec![Box::new(FilterMarkdownDocsNoContent)],
            }
        } else {
            Self {
                loader: None,
                splitter: Box::new(ParagraphSplitter::new(max_tokens, overlap_tokens)),
                transformers: Vec::new(),
            }
        }
    }

    /// Build a configured flow.
    ///
    /// Splitter options not given in the flow inherit the `[ingestion]`
    /// chunk sizes. A flow without a splitter uses `paragraph`.
    pub fn from_config(flow: &FlowConfig, defaults: &IngestionConfig) -> Result<Self> {
        let loader = match &flow.loader {
            Some(name) => Some(loader_named(name).ok_or_else(|| {
                Error::Config(format!(
                    "unknown loader {:?} (expected one of {})",
                    name,
                    LOADER_NAMES.join(", ")
                ))
            })?),
            None => None,
        };
        let (name, given) = match &flow.splitter {
            Some(s) => (s.name.as_str(), s.options.clone()),
            None => (ParagraphSplitter::NAME, serde_json::Map::new()),
        };
        let mut options = serde_json::Map::new();
        options.insert("max_tokens".into(), Value::from(defaults.max_tokens));
        options.insert("overlap_tokens".into(), Value::from(defaults.overlap_tokens));
        options.extend(given);

        let splitter = get_splitter(name, &options)?;
        let transformers = flow
            .transformers
            .iter()
            .map(|t| get_transformer(&t.name, &t.options))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            loader,
            splitter,
            transformers,
        })
    }

    /// The loader this flow uses for `filetype`, if any.
    pub fn loader(&self, filetype: &str) -> Option<LoaderFn> {
        self.loader.or_else(|| loader_for(filetype))
    }

    /// Split and transform loaded documents, then stamp `metadata` on
    /// every resulting chunk.
    pub fn run(&self, docs: Vec<Document>, metadata: &Metadata) -> anyhow::Result<Vec<Document>> {
        let mut chunks = self.splitter.split(docs)?;
        for transformer in &self.transformers {
            chunks = transformer.transform(chunks)?;
            tracing::trace!(
                transformer = transformer.name(),
                chunks = chunks.len(),
                "transformer applied"
            );
        }
        inject_metadata(chunks, metadata)
    }
}

/// Stamp `metadata` on chunks that skip splitting (reused files).
pub fn inject_metadata(docs: Vec<Document>, metadata: &Metadata) -> anyhow::Result<Vec<Document>> {
    ExtraMetadata::new(metadata.clone()).transform(docs)
}

/// Flow lookup by filetype.
pub struct IngestionFlows {
    configured: Vec<IngestionFlow>,
    by_filetype: HashMap<String, usize>,
    markdown: IngestionFlow,
    text: IngestionFlow,
}

impl IngestionFlows {
    pub fn from_config(config: &IngestionConfig) -> Result<Self> {
        let mut configured = Vec::with_capacity(config.flows.len());
        let mut by_filetype = HashMap::new();
        for flow in &config.flows {
            let slot = configured.len();
            configured.push(IngestionFlow::from_config(flow, config)?);
            for filetype in &flow.filetypes {
                // First configured flow for a filetype wins.
                by_filetype.entry(filetype.clone()).or_insert(slot);
            }
        }
        Ok(Self {
            configured,
            by_filetype,
            markdown: IngestionFlow::default_for(
                MIME_MARKDOWN,
                config.max_tokens,
                config.overlap_tokens,
            ),
            text: IngestionFlow::default_for("", config.max_tokens, config.overlap_tokens),
        })
    }

    /// Only the built-in flows, at the default chunk size.
    pub fn builtin() -> Self {
        Self {
            configured: Vec::new(),
            by_filetype: HashMap::new(),
            markdown: IngestionFlow::default_for(MIME_MARKDOWN, DEFAULT_MAX_TOKENS, 0),
            text: IngestionFlow::default_for("", DEFAULT_MAX_TOKENS, 0),
        }
    }

    pub fn for_filetype(&self, filetype: &str) -> &IngestionFlow {
        match self.by_filetype.get(filetype) {
            Some(&slot) => &self.configured[slot],
            None if filetype == MIME_MARKDOWN => &self.markdown,
            None => &self.text,
        }
    }
}

impl Default for IngestionFlows {
    fn default() -> Self {
        Self::builtin()
    }
}
