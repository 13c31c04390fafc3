//! Ingestion and retrieval through the `Datastore` façade, on the
//! in-memory backends with the deterministic hash embedding provider.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;

use knowledge::config::{FlowConfig, IngestionConfig};
use knowledge::datastore::{Datastore, DatastoreOptions};
use knowledge::db::Backends;
use knowledge::dedupe::{get_duplicate_check, Upsert};
use knowledge::flows::IngestionFlows;
use knowledge::ingest::{checksum, IngestOpts};
use knowledge::retrieve::RetrieveOpts;
use knowledge_core::embedding::{
    Embedder, EmbeddingFunc, EmbeddingModelProvider, HashEmbeddingProvider,
};
use knowledge_core::filter::MetadataFilter;
use knowledge_core::index::memory::InMemoryIndex;
use knowledge_core::models::{keys, Dataset, Document, EmbeddingsProviderConfig};
use knowledge_core::store::Store;
use knowledge_core::vectorstore::memory::InMemoryVectorstore;
use knowledge_core::vectorstore::Vectorstore;
use knowledge_core::Error;

fn setup_with(
    provider: Box<dyn EmbeddingModelProvider>,
    opts: DatastoreOptions,
) -> (Datastore, Arc<InMemoryVectorstore>) {
    let vectorstore = Arc::new(InMemoryVectorstore::new(
        provider.embedding_func().unwrap(),
    ));
    let backends = Backends {
        index: Arc::new(InMemoryIndex::new()),
        vectorstore: vectorstore.clone(),
    };
    (Datastore::new(backends, provider, opts), vectorstore)
}

fn setup(opts: DatastoreOptions) -> (Datastore, HashEmbeddingProvider) {
    let provider = HashEmbeddingProvider::new("model-a", 64);
    let (store, _) = setup_with(Box::new(provider.clone()), opts);
    (store, provider)
}

/// Hash provider whose embedder fails on any text containing "FAIL".
#[derive(Clone)]
struct FlakyProvider(HashEmbeddingProvider);

struct FlakyEmbedder(EmbeddingFunc);

#[async_trait]
impl Embedder for FlakyEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if text.contains("FAIL") {
            anyhow::bail!("provider down");
        }
        self.0.embed(text).await
    }
}

impl EmbeddingModelProvider for FlakyProvider {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn embedding_model_name(&self) -> &str {
        self.0.embedding_model_name()
    }
    fn use_embedding_model(&mut self, model: &str) {
        self.0.use_embedding_model(model)
    }
    fn embedding_func(&self) -> anyhow::Result<EmbeddingFunc> {
        Ok(Arc::new(FlakyEmbedder(self.0.embedding_func()?)))
    }
    fn configure(&mut self) -> anyhow::Result<()> {
        self.0.configure()
    }
    fn config(&self) -> EmbeddingsProviderConfig {
        self.0.config()
    }
    fn clone_box(&self) -> Box<dyn EmbeddingModelProvider> {
        Box::new(self.clone())
    }
}

fn hash_config(model: &str, dims: u64) -> EmbeddingsProviderConfig {
    let mut config = serde_json::Map::new();
    config.insert("model".into(), model.into());
    config.insert("dims".into(), dims.into());
    EmbeddingsProviderConfig {
        provider_type: "hash".into(),
        config,
    }
}

async fn all_docs(store: &Datastore, dataset: &str) -> Vec<Document> {
    store
        .get_documents(dataset, &MetadataFilter::new(), &[])
        .await
        .unwrap()
}

#[tokio::test]
async fn test_reingest_with_file_reuse() {
    let (store, provider) = setup(DatastoreOptions {
        reuse_files: true,
        ..Default::default()
    });
    store.create_dataset(&Dataset::new("docs")).await.unwrap();

    let content = b"Ownership moves values.\n\nBorrowing lends them out.";
    let first = store
        .ingest("docs", "rust.txt", content, IngestOpts::default())
        .await
        .unwrap();
    assert!(!first.is_empty());
    let first_file = store.get_file_for_document(&first[0]).await.unwrap().unwrap();
    let before: HashMap<String, Vec<f32>> = all_docs(&store, "docs")
        .await
        .into_iter()
        .map(|d| (d.content, d.embedding))
        .collect();
    let calls = provider.embed_calls();

    let second = store
        .ingest("docs", "rust.txt", content, IngestOpts::default())
        .await
        .unwrap();
    assert_eq!(second.len(), first.len());
    assert!(second.iter().all(|id| !first.contains(id)));
    assert_eq!(provider.embed_calls(), calls);

    let second_file = store.get_file_for_document(&second[0]).await.unwrap().unwrap();
    assert_ne!(second_file.id, first_file.id);
    assert_eq!(second_file.metadata.checksum, first_file.metadata.checksum);
    assert!(store.get_file_for_document(&first[0]).await.unwrap().is_none());

    let after = all_docs(&store, "docs").await;
    assert_eq!(after.len(), second.len());
    for doc in &after {
        assert!(second.contains(&doc.id));
        assert_eq!(before[&doc.content], doc.embedding);
        assert_eq!(doc.filename(), Some("rust.txt"));
    }
}

#[tokio::test]
async fn test_empty_file_writes_nothing() {
    let (store, _) = setup(DatastoreOptions::default());
    store.create_dataset(&Dataset::new("docs")).await.unwrap();

    let ids = store
        .ingest("docs", "blank.txt", b"  \n\n   \n", IngestOpts::default())
        .await
        .unwrap();
    assert!(ids.is_empty());
    assert!(all_docs(&store, "docs").await.is_empty());

    let ds = store.get_dataset("docs").await.unwrap().unwrap();
    assert!(ds.embeddings_provider_config.is_none());
}

#[tokio::test]
async fn test_unsupported_binary_is_rejected() {
    let (store, _) = setup(DatastoreOptions::default());
    store.create_dataset(&Dataset::new("docs")).await.unwrap();

    let err = store
        .ingest(
            "docs",
            "mystery.bin",
            &[0x7f, 0x45, 0x4c, 0x46, 0x00, 0x01, 0x02],
            IngestOpts::default(),
        )
        .await
        .unwrap_err();
    match err {
        Error::UnsupportedFileType { file_type } => {
            assert_eq!(file_type, "application/octet-stream")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(all_docs(&store, "docs").await.is_empty());
}

#[tokio::test]
async fn test_missing_dataset_is_not_created() {
    let (store, _) = setup(DatastoreOptions::default());
    let err = store
        .ingest("nope", "a.txt", b"hello", IngestOpts::default())
        .await
        .unwrap_err();
    assert!(err.is_dataset_not_found());
    assert!(store.list_datasets().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_basic_retrieval_skips_missing_dataset() {
    let (store, _) = setup(DatastoreOptions::default());
    store.create_dataset(&Dataset::new("A")).await.unwrap();
    for i in 0..5 {
        store
            .ingest(
                "A",
                &format!("note-{i}.txt"),
                format!("note number {i} about retrieval").as_bytes(),
                IngestOpts::default(),
            )
            .await
            .unwrap();
    }

    let response = store
        .retrieve(
            "retrieval notes",
            &["A".to_string(), "B".to_string()],
            RetrieveOpts {
                top_k: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let docs = &response.responses[0].result_documents;
    assert_eq!(docs.len(), 3);
    assert!(docs
        .iter()
        .all(|d| d.metadata_str(keys::DATASET_ID).as_deref() == Some("A")));
    assert!(docs
        .windows(2)
        .all(|w| w[0].similarity_score >= w[1].similarity_score));
}

#[tokio::test]
async fn test_keyword_filters() {
    let (store, _) = setup(DatastoreOptions::default());
    store.create_dataset(&Dataset::new("A")).await.unwrap();
    for (name, text) in [
        ("1.txt", "foo only here"),
        ("2.txt", "foo and bar together"),
        ("3.txt", "nothing relevant"),
    ] {
        store
            .ingest("A", name, text.as_bytes(), IngestOpts::default())
            .await
            .unwrap();
    }

    let response = store
        .retrieve(
            "foo",
            &["A".to_string()],
            RetrieveOpts {
                keywords: vec!["foo".into(), "-bar".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let contents: Vec<&str> = response.responses[0]
        .result_documents
        .iter()
        .map(|d| d.content.as_str())
        .collect();
    assert_eq!(contents, vec!["foo only here"]);
}

#[tokio::test]
async fn test_dataset_model_wins_over_provider_model() {
    let (store, _) = setup(DatastoreOptions::default());
    store
        .create_dataset(&Dataset {
            id: "legacy".into(),
            embeddings_provider_config: Some(hash_config("model-b", 64)),
        })
        .await
        .unwrap();

    store
        .ingest("legacy", "a.txt", b"borrow checker rules", IngestOpts::default())
        .await
        .unwrap();
    let stored = all_docs(&store, "legacy").await;
    assert_eq!(stored[0].embedding_model(), Some("model-b"));

    let hits = store
        .similarity_search("borrow checker rules", 1, "legacy", &MetadataFilter::new(), &[])
        .await
        .unwrap();
    assert!(hits[0].similarity_score > 0.99);
    assert_eq!(store.provider().embedding_model_name(), "model-a");
}

#[tokio::test]
async fn test_prefer_new_model() {
    let (store, _) = setup(DatastoreOptions {
        prefer_new_model: true,
        ..Default::default()
    });
    store
        .create_dataset(&Dataset {
            id: "legacy".into(),
            embeddings_provider_config: Some(hash_config("model-b", 64)),
        })
        .await
        .unwrap();
    store
        .ingest("legacy", "a.txt", b"borrow checker rules", IngestOpts::default())
        .await
        .unwrap();
    assert_eq!(
        all_docs(&store, "legacy").await[0].embedding_model(),
        Some("model-a")
    );
}

#[tokio::test]
async fn test_strict_config_check() {
    let dataset = Dataset {
        id: "d".into(),
        embeddings_provider_config: Some(hash_config("model-a", 32)),
    };

    let (store, _) = setup(DatastoreOptions {
        strict_config_check: true,
        ..Default::default()
    });
    store.create_dataset(&dataset).await.unwrap();
    let err = store
        .ingest("d", "a.txt", b"text", IngestOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::EmbeddingConfigMismatch(msg) if msg.contains("dims")));
    assert!(all_docs(&store, "d").await.is_empty());

    let (lenient, _) = setup(DatastoreOptions::default());
    lenient.create_dataset(&dataset).await.unwrap();
    assert_eq!(
        lenient
            .ingest("d", "a.txt", b"text", IngestOpts::default())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_ignore_duplicates() {
    let (store, _) = setup(DatastoreOptions {
        duplicate_check: get_duplicate_check("ignore").unwrap(),
        ..Default::default()
    });
    store.create_dataset(&Dataset::new("docs")).await.unwrap();
    let opts = IngestOpts {
        abs_path: Some("/notes/a.txt".into()),
        ..Default::default()
    };

    let first = store.ingest("docs", "a.txt", b"v1", opts.clone()).await.unwrap();
    assert_eq!(first.len(), 1);
    let second = store.ingest("docs", "a.txt", b"v2", opts.clone()).await.unwrap();
    assert!(second.is_empty());

    let forced = store
        .ingest(
            "docs",
            "a.txt",
            b"v3",
            IngestOpts {
                is_duplicate: Some(Arc::new(Upsert)),
                ..opts
            },
        )
        .await
        .unwrap();
    assert_eq!(forced.len(), 1);
    let docs = all_docs(&store, "docs").await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].content, "v3");
}

#[tokio::test]
async fn test_embedding_reuse_across_files() {
    let (store, provider) = setup(DatastoreOptions {
        reuse_embeddings: true,
        ..Default::default()
    });
    store.create_dataset(&Dataset::new("docs")).await.unwrap();

    store
        .ingest("docs", "a.txt", b"shared paragraph", IngestOpts::default())
        .await
        .unwrap();
    let calls = provider.embed_calls();
    store
        .ingest("docs", "b.txt", b"shared paragraph", IngestOpts::default())
        .await
        .unwrap();
    assert_eq!(provider.embed_calls(), calls);

    let docs = all_docs(&store, "docs").await;
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].embedding, docs[1].embedding);
}

#[tokio::test]
async fn test_extra_metadata_and_doc_order() {
    let (store, _) = setup(DatastoreOptions::default());
    store.create_dataset(&Dataset::new("docs")).await.unwrap();

    let mut extra = serde_json::Map::new();
    extra.insert("team".into(), "platform".into());
    extra.insert(keys::FILENAME.into(), "spoofed".into());
    let text = "# One\n\nFirst section.\n\n# Two\n\nSecond section.\n";
    let ids = store
        .ingest(
            "docs",
            "guide.md",
            text.as_bytes(),
            IngestOpts {
                extra_metadata: extra,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);

    let file = store.get_file_for_document(&ids[1]).await.unwrap().unwrap();
    assert_eq!(file.documents.len(), 2);
    assert_eq!(file.documents[1].id, ids[1]);

    let mut docs = all_docs(&store, "docs").await;
    docs.sort_by_key(|d| d.doc_index());
    assert_eq!(docs[0].doc_index(), Some(0));
    assert_eq!(docs[1].doc_index(), Some(1));
    assert!(docs.iter().all(|d| d.docs_total() == Some(2)));
    assert!(docs[0].content.contains("First section"));
    assert!(docs
        .iter()
        .all(|d| d.filename() == Some("guide.md") && d.metadata["team"] == "platform"));
}

#[tokio::test]
async fn test_delete_document_and_file() {
    let (store, _) = setup(DatastoreOptions::default());
    store.create_dataset(&Dataset::new("docs")).await.unwrap();

    let single = store
        .ingest("docs", "one.txt", b"only chunk", IngestOpts::default())
        .await
        .unwrap();
    store.delete_document("docs", &single[0]).await.unwrap();
    assert!(store.get_file_for_document(&single[0]).await.unwrap().is_none());
    assert!(all_docs(&store, "docs").await.is_empty());

    let ids = store
        .ingest(
            "docs",
            "two.md",
            b"# A\n\nalpha text\n\n# B\n\nbeta text\n",
            IngestOpts::default(),
        )
        .await
        .unwrap();
    let file = store.get_file_for_document(&ids[0]).await.unwrap().unwrap();
    assert_eq!(
        store.get_dataset_for_document(&ids[0]).await.unwrap().map(|d| d.id),
        Some("docs".to_string())
    );
    store.delete_file("docs", &file.id).await.unwrap();
    assert!(store.find_file("docs", &file.id).await.unwrap().is_none());
    assert!(all_docs(&store, "docs").await.is_empty());
}

#[tokio::test]
async fn test_docx_ingest() {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(
            b"<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>office test phrase</w:t></w:r></w:p></w:body></w:document>",
        )
        .unwrap();
        zip.finish().unwrap();
    }

    let (store, _) = setup(DatastoreOptions::default());
    store.create_dataset(&Dataset::new("docs")).await.unwrap();
    let ids = store
        .ingest("docs", "report.docx", &buf, IngestOpts::default())
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let response = store
        .retrieve("office phrase", &["docs".to_string()], RetrieveOpts::default())
        .await
        .unwrap();
    assert_eq!(
        response.responses[0].result_documents[0].content,
        "office test phrase"
    );
}

#[tokio::test]
async fn test_embedding_failure_keeps_previous_version() {
    let (store, _) = setup_with(
        Box::new(FlakyProvider(HashEmbeddingProvider::new("model-a", 64))),
        DatastoreOptions::default(),
    );
    store.create_dataset(&Dataset::new("docs")).await.unwrap();

    let first = store
        .ingest("docs", "a.txt", b"good content", IngestOpts::default())
        .await
        .unwrap();
    let file = store.get_file_for_document(&first[0]).await.unwrap().unwrap();

    let err = store
        .ingest("docs", "a.txt", b"FAIL content", IngestOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend { .. }), "{err}");
    assert!(err.to_string().contains("provider down"));

    let docs = all_docs(&store, "docs").await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].content, "good content");
    let still = store.get_file_for_document(&first[0]).await.unwrap().unwrap();
    assert_eq!(still.id, file.id);
}

#[tokio::test]
async fn test_file_reuse_falls_back_to_next_candidate() {
    let provider = HashEmbeddingProvider::new("model-a", 64);
    let (store, vectorstore) = setup_with(
        Box::new(provider.clone()),
        DatastoreOptions {
            reuse_files: true,
            ..Default::default()
        },
    );
    store.create_dataset(&Dataset::new("docs")).await.unwrap();
    let content = b"Shared text for every copy.";

    let a = store
        .ingest("docs", "a.txt", content, IngestOpts::default())
        .await
        .unwrap();
    store
        .ingest("docs", "b.txt", content, IngestOpts::default())
        .await
        .unwrap();
    let calls = provider.embed_calls();

    // Candidates are tried oldest first; a.txt is now missing a chunk.
    vectorstore
        .remove_document(Some(&a[0]), "docs", &MetadataFilter::new(), &[])
        .await
        .unwrap();

    let c = store
        .ingest("docs", "c.txt", content, IngestOpts::default())
        .await
        .unwrap();
    assert!(!c.is_empty());
    assert_eq!(provider.embed_calls(), calls);

    // With every candidate broken the file is loaded and embedded afresh.
    let mut by_checksum = MetadataFilter::new();
    by_checksum.insert(keys::FILE_CHECKSUM.to_string(), checksum(content));
    vectorstore
        .remove_document(None, "docs", &by_checksum, &[])
        .await
        .unwrap();

    let d = store
        .ingest("docs", "d.txt", content, IngestOpts::default())
        .await
        .unwrap();
    assert!(!d.is_empty());
    assert!(provider.embed_calls() > calls);
    let docs = all_docs(&store, "docs").await;
    assert_eq!(docs.len(), d.len());
    assert!(docs.iter().all(|doc| !doc.embedding.is_empty()));
}

#[tokio::test]
async fn test_flow_loader_makes_filetype_loadable() {
    let flows = IngestionFlows::from_config(&IngestionConfig {
        flows: vec![
            FlowConfig {
                filetypes: vec!["application/octet-stream".into()],
                loader: Some("text".into()),
                ..Default::default()
            },
            FlowConfig {
                filetypes: vec!["text/html".into()],
                loader: Some("text".into()),
                ..Default::default()
            },
        ],
        ..Default::default()
    })
    .unwrap();
    let (store, _) = setup(DatastoreOptions {
        flows,
        ..Default::default()
    });
    store.create_dataset(&Dataset::new("docs")).await.unwrap();

    let ids = store
        .ingest("docs", "dump.bin", b"header\x00 payload words", IngestOpts::default())
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    // The configured loader replaces the built-in HTML stripping.
    store
        .ingest("docs", "page.html", b"<p>raw markup</p>", IngestOpts::default())
        .await
        .unwrap();
    let docs = all_docs(&store, "docs").await;
    assert!(docs.iter().any(|d| d.content.contains("<p>raw markup</p>")));
}
