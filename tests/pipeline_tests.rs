//! Indexing and retrieval tests
//!
//! Runs the document indexer and the retriever against a scratch upload
//! directory with the hashing embedder. Both share one index store, as
//! they do when wired up by the service provider.

use di::Ref;
use std::path::Path;
use studybuddy_api::config::{MAX_DOCUMENTS, Settings};
use studybuddy_api::core::indexer::VectorStoreIndexer;
use studybuddy_api::core::retriever::VectorStoreRetriever;
use studybuddy_api::core::traits::{ContextRetriever, DocumentIndexer};
use studybuddy_api::error::Error;
use studybuddy_api::infrastructure::documents::UploadedDocument;
use studybuddy_api::infrastructure::embeddings::HashingEmbedder;
use studybuddy_api::infrastructure::traits::Embedder;
use studybuddy_api::infrastructure::vector_index::{VectorIndex, VectorIndexStore};

fn settings(upload_dir: &Path) -> Ref<Settings> {
    Ref::new(Settings {
        upload_dir: upload_dir.to_path_buf(),
        chunk_size: 80,
        chunk_overlap: 10,
        ..Settings::default()
    })
}

fn pipeline(upload_dir: &Path) -> (VectorStoreIndexer, VectorStoreRetriever, Ref<VectorIndexStore>) {
    let embedder: Ref<dyn Embedder> = Ref::new(HashingEmbedder::new(384));
    let indexes = Ref::new(VectorIndexStore::new());
    (
        VectorStoreIndexer::new(settings(upload_dir), embedder.clone(), indexes.clone()),
        VectorStoreRetriever::new(embedder, indexes.clone()),
        indexes,
    )
}

fn lecture_notes() -> String {
    [
        "Photosynthesis converts light energy into chemical energy stored in glucose.",
        "The French Revolution began in 1789 with the storming of the Bastille.",
        "Ohm's law states that voltage equals current times resistance.",
        "The mitochondria is the powerhouse of the cell.",
        "Shakespeare wrote Hamlet around the year 1600.",
    ]
    .join("\n\n")
}

#[tokio::test]
async fn test_retrieves_relevant_chunk_verbatim() {
    let tmp = tempfile::tempdir().unwrap();
    let (indexer, retriever, _) = pipeline(tmp.path());

    let handle = indexer
        .build_index(1, vec![UploadedDocument::new("notes.txt", lecture_notes())])
        .await
        .unwrap();

    let context = retriever
        .retrieve("What is the powerhouse of the cell?", Some(&handle), 1)
        .await
        .unwrap();
    assert_eq!(context, "The mitochondria is the powerhouse of the cell.");

    let context = retriever
        .retrieve("What does Ohm's law say about voltage?", Some(&handle), 3)
        .await
        .unwrap();
    let chunks: Vec<&str> = context.split("\n\n").collect();
    assert_eq!(chunks.len(), 3);
    assert!(chunks[0].contains("Ohm's law"));
}

#[tokio::test]
async fn test_no_index_means_empty_context() {
    let tmp = tempfile::tempdir().unwrap();
    let (_, retriever, _) = pipeline(tmp.path());

    assert_eq!(retriever.retrieve("anything", None, 3).await.unwrap(), "");
}

#[tokio::test]
async fn test_missing_index_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let (_, retriever, _) = pipeline(tmp.path());
    let handle = tmp.path().join("vector_404");

    let result = retriever
        .retrieve("anything", Some(handle.to_str().unwrap()), 3)
        .await;
    assert!(matches!(result, Err(Error::Index(_))));
}

#[tokio::test]
async fn test_index_from_other_embedder_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let (_, retriever, _) = pipeline(tmp.path());
    let dir = tmp.path().join("vector_9");

    let mut foreign = VectorIndex::create(&dir, "some-other-model", 384).unwrap();
    foreign.insert("a.txt", "text", vec![1.0; 384]).unwrap();
    foreign.commit().unwrap();
    drop(foreign);

    let result = retriever
        .retrieve("text", Some(dir.to_str().unwrap()), 3)
        .await;
    assert!(matches!(result, Err(Error::Index(_))));
}

#[tokio::test]
async fn test_only_first_documents_are_indexed() {
    let tmp = tempfile::tempdir().unwrap();
    let (indexer, retriever, _) = pipeline(tmp.path());

    let documents: Vec<UploadedDocument> = (0..MAX_DOCUMENTS + 1)
        .map(|n| UploadedDocument::new(format!("doc{n}.txt"), format!("Fact number {n}.")))
        .collect();
    let handle = indexer.build_index(3, documents).await.unwrap();

    for n in 0..MAX_DOCUMENTS {
        assert!(tmp.path().join(format!("3_doc{n}.txt")).exists());
    }
    assert!(!tmp.path().join(format!("3_doc{MAX_DOCUMENTS}.txt")).exists());

    let context = retriever
        .retrieve("Fact number", Some(&handle), 100)
        .await
        .unwrap();
    assert_eq!(context.split("\n\n").count(), MAX_DOCUMENTS);
    assert!(!context.contains(&format!("Fact number {MAX_DOCUMENTS}.")));
}

#[tokio::test]
async fn test_empty_file_slots_do_not_count() {
    let tmp = tempfile::tempdir().unwrap();
    let (indexer, retriever, _) = pipeline(tmp.path());

    let mut documents = vec![UploadedDocument::new("", ""); 3];
    documents.push(UploadedDocument::new("real.md", "# Heading\n\nReal content."));
    let handle = indexer.build_index(4, documents).await.unwrap();

    let context = retriever.retrieve("content", Some(&handle), 5).await.unwrap();
    assert!(context.contains("Real content."));
}

#[tokio::test]
async fn test_unreadable_document_fails_whole_build() {
    let tmp = tempfile::tempdir().unwrap();
    let (indexer, _, _) = pipeline(tmp.path());

    let result = indexer
        .build_index(
            5,
            vec![
                UploadedDocument::new("fine.txt", "Perfectly fine."),
                UploadedDocument::new("slides.pptx", vec![0u8, 1, 2]),
            ],
        )
        .await;

    assert!(matches!(result, Err(Error::BadUpload { .. })));
    assert!(!tmp.path().join("vector_5").exists());
    assert!(!tmp.path().join("5_fine.txt").exists());
}

#[tokio::test]
async fn test_documents_without_text_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let (indexer, _, _) = pipeline(tmp.path());

    let result = indexer
        .build_index(6, vec![UploadedDocument::new("blank.txt", "  \n\n  ")])
        .await;
    assert!(matches!(result, Err(Error::BadUpload { .. })));

    let result = indexer.build_index(6, vec![]).await;
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
}

#[tokio::test]
async fn test_rebuild_replaces_index() {
    let tmp = tempfile::tempdir().unwrap();
    let (indexer, retriever, _) = pipeline(tmp.path());

    let first = indexer
        .build_index(7, vec![UploadedDocument::new("old.txt", "Old material about volcanoes.")])
        .await
        .unwrap();
    let second = indexer
        .build_index(7, vec![UploadedDocument::new("new.txt", "New material about glaciers.")])
        .await
        .unwrap();
    assert_eq!(first, second);

    let context = retriever.retrieve("material", Some(&second), 10).await.unwrap();
    assert_eq!(context, "New material about glaciers.");
    assert!(tmp.path().join("7_new.txt").exists());
    assert!(!tmp.path().join("7_old.txt").exists());
}

#[tokio::test]
async fn test_failed_rebuild_keeps_previous_documents() {
    let tmp = tempfile::tempdir().unwrap();
    let (indexer, retriever, _) = pipeline(tmp.path());

    let handle = indexer
        .build_index(10, vec![UploadedDocument::new("notes.txt", "Rivers flow into the sea.")])
        .await
        .unwrap();

    let result = indexer
        .build_index(
            10,
            vec![
                UploadedDocument::new("notes.txt", "Replacement notes about deserts."),
                UploadedDocument::new("broken.pdf", b"not a pdf".to_vec()),
            ],
        )
        .await;
    assert!(matches!(result, Err(Error::BadUpload { .. })));

    let stored = std::fs::read_to_string(tmp.path().join("10_notes.txt")).unwrap();
    assert_eq!(stored, "Rivers flow into the sea.");
    assert!(!tmp.path().join("10_broken.pdf").exists());

    let context = retriever.retrieve("rivers", Some(&handle), 5).await.unwrap();
    assert_eq!(context, "Rivers flow into the sea.");
}

#[tokio::test]
async fn test_long_documents_are_split_into_bounded_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let (indexer, _, indexes) = pipeline(tmp.path());

    let text: Vec<String> = (0..300).map(|n| format!("sentence{n}")).collect();
    let handle = indexer
        .build_index(8, vec![UploadedDocument::new("long.txt", text.join(" "))])
        .await
        .unwrap();

    let index = indexes.open(Path::new(&handle)).await.unwrap();
    assert!(index.len() > 10);
    let everything = index.search(vec![1.0; 384], index.len()).unwrap();
    assert!(everything.iter().all(|hit| hit.text.chars().count() <= 80));
    assert!(everything.iter().all(|hit| hit.source == "long.txt"));
}

#[tokio::test]
async fn test_remove_index_clears_conversation_files() {
    let tmp = tempfile::tempdir().unwrap();
    let (indexer, _, _) = pipeline(tmp.path());

    indexer
        .build_index(2, vec![UploadedDocument::new("a.txt", "Alpha.")])
        .await
        .unwrap();
    indexer
        .build_index(12, vec![UploadedDocument::new("b.txt", "Beta.")])
        .await
        .unwrap();

    indexer.remove_index(2).await.unwrap();
    assert!(!tmp.path().join("vector_2").exists());
    assert!(!tmp.path().join("2_a.txt").exists());
    assert!(tmp.path().join("vector_12").exists());
    assert!(tmp.path().join("12_b.txt").exists());

    // removing again is harmless
    indexer.remove_index(2).await.unwrap();
}
