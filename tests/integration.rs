//! End-to-end pipeline tests over a file-backed SQLite database with
//! mock external services: ingestion through batches, enrichment, and
//! embedding to `ready`, then hybrid retrieval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use corpus_engine::chunk::ChunkBuilder;
use corpus_engine::config::{AgentProfile, IngestionConfig, RankingConfig, RetrievalConfig};
use corpus_engine::embed::EmbeddingWorker;
use corpus_engine::embedding::{vec_to_blob, EmbedError, Embedder};
use corpus_engine::enrich::EnrichmentWorker;
use corpus_engine::ingest::{NewDocument, Orchestrator};
use corpus_engine::llm::{LlmError, TextGenerator};
use corpus_engine::models::{MatchKind, SourceType};
use corpus_engine::parser::{DocumentParser, Element, ElementKind, ParseInput, ParserError};
use corpus_engine::search::{SearchEngine, SearchRequest};
use corpus_engine::vision::{AnnotatorError, VisionAnnotator};
use corpus_engine::{agents, migrate, stats};

// ============ Mock services ============

/// Parser returning a fixed element list per batch, with scripted
/// failures for specific page ranges.
struct ScriptedParser {
    elements: Vec<Element>,
    /// page_start → number of times extraction should fail first.
    failures: Mutex<HashMap<i64, u32>>,
    /// page_start → extraction calls observed.
    calls: Mutex<HashMap<i64, u32>>,
}

impl ScriptedParser {
    fn new(elements: Vec<Element>) -> Self {
        Self {
            elements,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn fail_first(mut self, page_start: i64, times: u32) -> Self {
        self.failures.get_mut().unwrap().insert(page_start, times);
        self
    }

    fn calls_for(&self, page_start: i64) -> u32 {
        *self.calls.lock().unwrap().get(&page_start).unwrap_or(&0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl DocumentParser for ScriptedParser {
    async fn extract(
        &self,
        _input: &ParseInput,
        page_start: i64,
        _page_end: i64,
    ) -> Result<Vec<Element>, ParserError> {
        *self.calls.lock().unwrap().entry(page_start).or_insert(0) += 1;

        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&page_start) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ParserError::Network("request timed out".to_string()));
            }
        }
        Ok(self.elements.clone())
    }
}

/// Embedder producing deterministic vectors: a per-text mapping with a
/// unit-vector default.
struct MappedEmbedder {
    dims: usize,
    map: HashMap<String, Vec<f32>>,
}

impl MappedEmbedder {
    fn uniform(dims: usize) -> Self {
        Self {
            dims,
            map: HashMap::new(),
        }
    }

    fn with_mapping(dims: usize, map: HashMap<String, Vec<f32>>) -> Self {
        Self { dims, map }
    }

    fn default_vector(&self) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        v[0] = 1.0;
        v
    }
}

#[async_trait]
impl Embedder for MappedEmbedder {
    fn model_name(&self) -> &str {
        "mapped-test"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts
            .iter()
            .map(|t| self.map.get(t).cloned().unwrap_or_else(|| self.default_vector()))
            .collect())
    }
}

struct FixedAnnotator(&'static str);

#[async_trait]
impl VisionAnnotator for FixedAnnotator {
    async fn describe(&self, _image: &str, _prompt: &str) -> Result<String, AnnotatorError> {
        Ok(self.0.to_string())
    }
}

struct FailingAnnotator;

#[async_trait]
impl VisionAnnotator for FailingAnnotator {
    async fn describe(&self, _image: &str, _prompt: &str) -> Result<String, AnnotatorError> {
        Err(AnnotatorError::Network("vision service unreachable".to_string()))
    }
}

struct FixedGenerator(&'static str);

#[async_trait]
impl TextGenerator for FixedGenerator {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        Ok(self.0.to_string())
    }
}

// ============ Harness ============

fn text_element(page: i64, y: f64, payload: &str) -> Element {
    Element {
        kind: ElementKind::Text,
        page,
        x: 0.0,
        y,
        payload: payload.to_string(),
    }
}

fn fast_config() -> IngestionConfig {
    IngestionConfig {
        pages_per_batch: 10,
        max_batch_attempts: 3,
        stale_after_secs: 300,
        summary_threshold_chars: 2000,
        retry_delay_ms: 10,
    }
}

async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let pool = corpus_engine::db::connect(&dir.path().join("engine.sqlite"))
        .await
        .unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (dir, pool)
}

fn build_orchestrator(
    pool: &SqlitePool,
    parser: Arc<dyn DocumentParser>,
    embedder: Arc<dyn Embedder>,
    annotator: Option<Arc<dyn VisionAnnotator>>,
    config: IngestionConfig,
) -> Orchestrator {
    let embed_worker = EmbeddingWorker::new(pool.clone(), embedder, 32);
    let enrich_worker = annotator.map(|a| {
        EnrichmentWorker::new(pool.clone(), a, None, 8, 1200, Some(embed_worker.clone()))
    });
    let builder = ChunkBuilder::new(None, config.summary_threshold_chars);
    Orchestrator::new(
        pool.clone(),
        parser,
        builder,
        config,
        enrich_worker,
        Some(embed_worker),
    )
}

async fn wait_for_status(pool: &SqlitePool, document_id: &str, wanted: &str) {
    for _ in 0..400 {
        let status: String = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_one(pool)
            .await
            .unwrap();
        if status == wanted {
            return;
        }
        if status == "failed" && wanted != "failed" {
            panic!("document failed while waiting for {wanted}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let status: String = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_one(pool)
        .await
        .unwrap();
    panic!("timed out waiting for status {wanted}, document is {status}");
}

// ============ Pipeline tests ============

#[tokio::test]
async fn thirty_page_pdf_with_flaky_batch_reaches_ready() {
    let (_dir, pool) = test_pool().await;

    // Batch at pages 10-19 times out twice, then succeeds on the third
    // attempt (cap is 3).
    let parser = Arc::new(
        ScriptedParser::new(vec![
            text_element(0, 10.0, "Opening section of the report."),
            text_element(0, 20.0, "More narrative text."),
        ])
        .fail_first(10, 2),
    );
    let embedder = Arc::new(MappedEmbedder::uniform(4));
    let orchestrator =
        build_orchestrator(&pool, parser.clone(), embedder, None, fast_config());

    let document_id = orchestrator
        .ingest(NewDocument {
            name: "annual-report.pdf".to_string(),
            file_ref: "store://annual-report.pdf".to_string(),
            source_type: SourceType::Pdf,
            page_count: 30,
        })
        .await
        .unwrap();

    wait_for_status(&pool, &document_id, "ready").await;

    // Three batches, all completed; the flaky one records three attempts.
    let rows = sqlx::query("SELECT batch_index, status, attempts FROM batches WHERE document_id = ? ORDER BY batch_index")
        .bind(&document_id)
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        let status: String = row.get("status");
        assert_eq!(status, "completed");
    }
    let flaky_attempts: i64 = rows[1].get("attempts");
    assert_eq!(flaky_attempts, 3);
    assert_eq!(parser.calls_for(10), 3);

    let progress = stats::document_progress(&pool, &document_id).await.unwrap();
    assert_eq!(progress.chunks_total, 6);
    assert_eq!(progress.chunks_ready, 6);
}

#[tokio::test]
async fn exhausted_retries_fail_batch_and_document() {
    let (_dir, pool) = test_pool().await;

    let parser = Arc::new(
        ScriptedParser::new(vec![text_element(0, 10.0, "unreachable")]).fail_first(0, 10),
    );
    let embedder = Arc::new(MappedEmbedder::uniform(4));
    let orchestrator =
        build_orchestrator(&pool, parser.clone(), embedder, None, fast_config());

    let document_id = orchestrator
        .ingest(NewDocument {
            name: "broken.pdf".to_string(),
            file_ref: "store://broken.pdf".to_string(),
            source_type: SourceType::Pdf,
            page_count: 5,
        })
        .await
        .unwrap();

    wait_for_status(&pool, &document_id, "failed").await;

    let row = sqlx::query("SELECT status, attempts, last_error FROM batches WHERE document_id = ?")
        .bind(&document_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let status: String = row.get("status");
    let attempts: i64 = row.get("attempts");
    let error: String = row.get("last_error");
    assert_eq!(status, "failed");
    assert_eq!(attempts, 3);
    assert!(error.contains("timed out"));
    assert_eq!(parser.calls_for(0), 3, "retries stop at the attempt cap");

    let doc_error: String = sqlx::query_scalar("SELECT last_error FROM documents WHERE id = ?")
        .bind(&document_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(doc_error.contains("timed out"));
}

#[tokio::test]
async fn concurrent_process_batch_extracts_once() {
    let (_dir, pool) = test_pool().await;

    let parser = Arc::new(ScriptedParser::new(vec![
        text_element(0, 10.0, "alpha"),
        text_element(0, 20.0, "beta"),
    ]));
    let embedder = Arc::new(MappedEmbedder::uniform(4));
    let orchestrator =
        build_orchestrator(&pool, parser.clone(), embedder, None, fast_config());

    // Seed a document and one pending batch directly, bypassing the
    // auto-started chain.
    sqlx::query(
        "INSERT INTO documents (id, name, file_ref, source_type, status, page_count, created_at, updated_at) \
         VALUES ('d1', 'doc', 'ref', 'pdf', 'ingested', 5, 0, 0)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO batches (id, document_id, batch_index, page_start, page_end, status, updated_at) \
         VALUES ('b1', 'd1', 0, 0, 4, 'pending', 0)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let (a, b) = tokio::join!(
        orchestrator.process_batch("b1"),
        orchestrator.process_batch("b1")
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(parser.total_calls(), 1, "second claim must affect zero rows");
    let chunk_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(chunk_count, 2, "exactly one set of chunk inserts");
}

#[tokio::test]
async fn failed_enrichment_is_partial_and_document_still_becomes_ready() {
    let (_dir, pool) = test_pool().await;

    let parser = Arc::new(ScriptedParser::new(vec![
        text_element(0, 10.0, "Narrative text chunk."),
        Element {
            kind: ElementKind::Image,
            page: 0,
            x: 0.0,
            y: 50.0,
            payload: "base64-image-bytes".to_string(),
        },
    ]));
    let embedder = Arc::new(MappedEmbedder::uniform(4));
    let orchestrator = build_orchestrator(
        &pool,
        parser,
        embedder,
        Some(Arc::new(FailingAnnotator)),
        fast_config(),
    );

    let document_id = orchestrator
        .ingest(NewDocument {
            name: "with-figure.pdf".to_string(),
            file_ref: "store://with-figure.pdf".to_string(),
            source_type: SourceType::Pdf,
            page_count: 1,
        })
        .await
        .unwrap();

    wait_for_status(&pool, &document_id, "ready").await;

    let visual_status: String = sqlx::query_scalar(
        "SELECT embedding_status FROM chunks WHERE document_id = ? AND chunk_type = 'visual'",
    )
    .bind(&document_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(visual_status, "failed");

    let item_status: String = sqlx::query_scalar(
        "SELECT e.status FROM enrichment_items e JOIN chunks c ON c.id = e.chunk_id \
         WHERE c.document_id = ?",
    )
    .bind(&document_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(item_status, "failed");
}

#[tokio::test]
async fn enriched_visual_chunk_becomes_searchable() {
    let (_dir, pool) = test_pool().await;

    let parser = Arc::new(ScriptedParser::new(vec![
        text_element(0, 10.0, "Plain narrative."),
        Element {
            kind: ElementKind::Image,
            page: 0,
            x: 0.0,
            y: 50.0,
            payload: "base64-image-bytes".to_string(),
        },
    ]));
    let embedder = Arc::new(MappedEmbedder::uniform(4));
    let orchestrator = build_orchestrator(
        &pool,
        parser,
        embedder,
        Some(Arc::new(FixedAnnotator(
            "A pie chart of segment revenue by region.",
        ))),
        fast_config(),
    );

    let document_id = orchestrator
        .ingest(NewDocument {
            name: "with-chart.pdf".to_string(),
            file_ref: "store://with-chart.pdf".to_string(),
            source_type: SourceType::Pdf,
            page_count: 1,
        })
        .await
        .unwrap();

    wait_for_status(&pool, &document_id, "ready").await;

    let row = sqlx::query(
        "SELECT content, embedding_status FROM chunks WHERE document_id = ? AND chunk_type = 'visual'",
    )
    .bind(&document_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    let content: String = row.get("content");
    let status: String = row.get("embedding_status");
    assert!(content.contains("pie chart"));
    assert_eq!(status, "ready");

    // The enriched description is in the FTS index too.
    let fts_hits: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH '\"pie\" OR \"chart\"'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(fts_hits >= 1);
}

#[tokio::test]
async fn oversized_table_is_summarized_and_search_returns_verbatim_markdown() {
    let (_dir, pool) = test_pool().await;

    let mut table_markdown = String::from("| year | assets | liabilities |\n");
    for year in 0..200 {
        table_markdown.push_str(&format!("| {} | {} | {} |\n", 1900 + year, year * 10, year * 4));
    }
    assert!(table_markdown.len() > 2000);

    let parser = Arc::new(ScriptedParser::new(vec![Element {
        kind: ElementKind::Table,
        page: 0,
        x: 0.0,
        y: 10.0,
        payload: table_markdown.clone(),
    }]));
    let embedder: Arc<dyn Embedder> = Arc::new(MappedEmbedder::uniform(4));
    let config = fast_config();

    // Wire the builder with a summarizer so the oversized table gets a
    // compact embedding text.
    let embed_worker = EmbeddingWorker::new(pool.clone(), embedder.clone(), 32);
    let builder = ChunkBuilder::new(
        Some(Arc::new(FixedGenerator("Asset and liability totals by year."))),
        config.summary_threshold_chars,
    );
    let orchestrator = Orchestrator::new(
        pool.clone(),
        parser,
        builder,
        config,
        None,
        Some(embed_worker),
    );

    let document_id = orchestrator
        .ingest(NewDocument {
            name: "history.pdf".to_string(),
            file_ref: "store://history.pdf".to_string(),
            source_type: SourceType::Pdf,
            page_count: 1,
        })
        .await
        .unwrap();

    wait_for_status(&pool, &document_id, "ready").await;

    let row = sqlx::query(
        "SELECT content, original_content FROM chunks WHERE document_id = ?",
    )
    .bind(&document_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    let content: String = row.get("content");
    let original: String = row.get("original_content");
    assert_eq!(content, "Asset and liability totals by year.");
    assert_eq!(original, table_markdown);

    agents::activate_document(&pool, "agent-1", &document_id)
        .await
        .unwrap();
    let engine = SearchEngine::new(
        pool.clone(),
        embedder,
        None,
        RetrievalConfig::default(),
        RankingConfig::default(),
    );
    let results = engine
        .search(&SearchRequest {
            agent_id: "agent-1",
            query: "assets by year",
            document_filter: None,
            limit: 5,
            profile: AgentProfile::General,
        })
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].content, table_markdown, "ranking ran on the summary, the caller gets the verbatim table");
}

#[tokio::test]
async fn markdown_source_gets_one_whole_document_batch() {
    let (_dir, pool) = test_pool().await;

    let parser = Arc::new(ScriptedParser::new(vec![text_element(
        0,
        10.0,
        "Markdown body.",
    )]));
    let embedder = Arc::new(MappedEmbedder::uniform(4));
    let orchestrator = build_orchestrator(&pool, parser, embedder, None, fast_config());

    let document_id = orchestrator
        .ingest(NewDocument {
            name: "notes.md".to_string(),
            file_ref: "store://notes.md".to_string(),
            source_type: SourceType::Markdown,
            page_count: 40,
        })
        .await
        .unwrap();

    wait_for_status(&pool, &document_id, "ready").await;

    let batch_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM batches WHERE document_id = ?")
            .bind(&document_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(batch_count, 1);
}

// ============ Reconciliation tests ============

#[tokio::test]
async fn reconcile_resyncs_stuck_document_and_finishes_it() {
    let (_dir, pool) = test_pool().await;

    let parser = Arc::new(ScriptedParser::new(vec![text_element(0, 10.0, "recovered")]));
    let embedder = Arc::new(MappedEmbedder::uniform(4));
    let mut config = fast_config();
    config.stale_after_secs = 0;
    let orchestrator = build_orchestrator(&pool, parser, embedder, None, config);

    // A crash left this document `processing` with zero chunks and its
    // batch stuck in `processing`.
    let stale = chrono::Utc::now().timestamp() - 3600;
    sqlx::query(
        "INSERT INTO documents (id, name, file_ref, source_type, status, page_count, created_at, updated_at) \
         VALUES ('d1', 'stuck.pdf', 'ref', 'pdf', 'processing', 5, ?, ?)",
    )
    .bind(stale)
    .bind(stale)
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO batches (id, document_id, batch_index, page_start, page_end, status, updated_at) \
         VALUES ('b1', 'd1', 0, 0, 4, 'processing', ?)",
    )
    .bind(stale)
    .execute(&pool)
    .await
    .unwrap();

    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.resynced, 1);

    wait_for_status(&pool, "d1", "ready").await;
    let chunk_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(chunk_count, 1);
}

#[tokio::test]
async fn reconcile_corrects_lagging_ready_status() {
    let (_dir, pool) = test_pool().await;

    let parser = Arc::new(ScriptedParser::new(vec![]));
    let embedder = Arc::new(MappedEmbedder::uniform(4));
    let orchestrator = build_orchestrator(&pool, parser, embedder, None, fast_config());

    // Every chunk is ready but the chain died before the status advanced.
    sqlx::query(
        "INSERT INTO documents (id, name, file_ref, source_type, status, page_count, created_at, updated_at) \
         VALUES ('d1', 'doc', 'ref', 'pdf', 'chunked', 5, 0, 0)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO batches (id, document_id, batch_index, page_start, page_end, status, updated_at) \
         VALUES ('b1', 'd1', 0, 0, 4, 'completed', 0)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO chunks (id, document_id, batch_index, chunk_index, content, chunk_type, embedding_status, embedding, created_at) \
         VALUES ('c1', 'd1', 0, 0, 'text', 'text', 'ready', ?, 0)",
    )
    .bind(vec_to_blob(&[1.0, 0.0]))
    .execute(&pool)
    .await
    .unwrap();

    let report = orchestrator.reconcile().await.unwrap();
    assert_eq!(report.finalized, 1);

    let status: String = sqlx::query_scalar("SELECT status FROM documents WHERE id = 'd1'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "ready");
}

// ============ Retrieval tests ============

struct SeededChunk<'a> {
    id: &'a str,
    content: &'a str,
    original: Option<&'a str>,
    chunk_type: &'a str,
    vector: Vec<f32>,
}

async fn seed_ready_corpus(pool: &SqlitePool, document: &str, chunks: &[SeededChunk<'_>]) {
    sqlx::query(
        "INSERT INTO documents (id, name, file_ref, source_type, status, page_count, created_at, updated_at) \
         VALUES (?, ?, 'ref', 'pdf', 'ready', 1, 0, 0)",
    )
    .bind(document)
    .bind(document)
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO batches (id, document_id, batch_index, page_start, page_end, status, updated_at) \
         VALUES (?, ?, 0, 0, 0, 'completed', 0)",
    )
    .bind(format!("{document}-b0"))
    .bind(document)
    .execute(pool)
    .await
    .unwrap();

    for (i, chunk) in chunks.iter().enumerate() {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, batch_index, chunk_index, content, original_content, chunk_type, embedding_status, embedding, created_at) \
             VALUES (?, ?, 0, ?, ?, ?, ?, 'ready', ?, 0)",
        )
        .bind(chunk.id)
        .bind(document)
        .bind(i as i64)
        .bind(chunk.content)
        .bind(chunk.original)
        .bind(chunk.chunk_type)
        .bind(vec_to_blob(&chunk.vector))
        .execute(pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, content) VALUES (?, ?, ?)")
            .bind(chunk.id)
            .bind(document)
            .bind(chunk.content)
            .execute(pool)
            .await
            .unwrap();
    }
}

fn similarity_vector(similarity: f32) -> Vec<f32> {
    // Unit vector at the chosen cosine distance from [1, 0].
    vec![similarity, (1.0 - similarity * similarity).sqrt()]
}

#[tokio::test]
async fn intent_boost_reranks_balance_sheet_above_raw_similarity() {
    let (_dir, pool) = test_pool().await;

    seed_ready_corpus(
        &pool,
        "filing-2023",
        &[
            SeededChunk {
                id: "text-chunk",
                content: "Management discussion of performance.",
                original: None,
                chunk_type: "text",
                vector: similarity_vector(0.55),
            },
            SeededChunk {
                id: "balance-chunk",
                content: "Total assets and total liabilities summary.",
                original: None,
                chunk_type: "balance_sheet",
                vector: similarity_vector(0.42),
            },
        ],
    )
    .await;
    agents::activate_document(&pool, "agent-1", "filing-2023")
        .await
        .unwrap();

    let mut map = HashMap::new();
    map.insert("total assets 2023".to_string(), similarity_vector(1.0));
    let embedder = Arc::new(MappedEmbedder::with_mapping(2, map));

    let engine = SearchEngine::new(
        pool.clone(),
        embedder,
        None,
        RetrievalConfig::default(),
        RankingConfig::default(),
    );

    let results = engine
        .search(&SearchRequest {
            agent_id: "agent-1",
            query: "total assets 2023",
            document_filter: Some("filing-2023"),
            limit: 10,
            profile: AgentProfile::Financial,
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].chunk_id, "balance-chunk");
    assert_eq!(results[0].chunk_type, "balance_sheet");
    assert!(results[0].score > results[1].score);
}

#[tokio::test]
async fn search_swaps_in_original_content() {
    let (_dir, pool) = test_pool().await;

    seed_ready_corpus(
        &pool,
        "tables-doc",
        &[SeededChunk {
            id: "table-chunk",
            content: "Summary: quarterly revenue table with four columns.",
            original: Some("| Q1 | Q2 | Q3 | Q4 |\n| 10 | 12 | 14 | 16 |"),
            chunk_type: "table",
            vector: similarity_vector(0.9),
        }],
    )
    .await;
    agents::activate_document(&pool, "agent-1", "tables-doc")
        .await
        .unwrap();

    let engine = SearchEngine::new(
        pool.clone(),
        Arc::new(MappedEmbedder::uniform(2)),
        None,
        RetrievalConfig::default(),
        RankingConfig::default(),
    );

    let results = engine
        .search(&SearchRequest {
            agent_id: "agent-1",
            query: "quarterly revenue table",
            document_filter: None,
            limit: 5,
            profile: AgentProfile::General,
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].content.starts_with("| Q1 |"), "caller must get the verbatim table");
    assert!(!results[0].content.contains("Summary:"));
}

#[tokio::test]
async fn search_scopes_to_active_agent_links_and_document_filter() {
    let (_dir, pool) = test_pool().await;

    seed_ready_corpus(
        &pool,
        "doc-a",
        &[SeededChunk {
            id: "a1",
            content: "shared topic in doc a",
            original: None,
            chunk_type: "text",
            vector: similarity_vector(0.9),
        }],
    )
    .await;
    seed_ready_corpus(
        &pool,
        "doc-b",
        &[SeededChunk {
            id: "b1",
            content: "shared topic in doc b",
            original: None,
            chunk_type: "text",
            vector: similarity_vector(0.9),
        }],
    )
    .await;
    agents::activate_document(&pool, "agent-1", "doc-a").await.unwrap();
    agents::activate_document(&pool, "agent-1", "doc-b").await.unwrap();

    let engine = SearchEngine::new(
        pool.clone(),
        Arc::new(MappedEmbedder::uniform(2)),
        None,
        RetrievalConfig::default(),
        RankingConfig::default(),
    );

    let scoped = engine
        .search(&SearchRequest {
            agent_id: "agent-1",
            query: "shared topic",
            document_filter: Some("doc-b"),
            limit: 10,
            profile: AgentProfile::General,
        })
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].chunk_id, "b1");
    assert_eq!(scoped[0].document_name, "doc-b");

    // Deactivated documents drop out of scope entirely.
    agents::deactivate_document(&pool, "agent-1", "doc-a").await.unwrap();
    let remaining = engine
        .search(&SearchRequest {
            agent_id: "agent-1",
            query: "shared topic",
            document_filter: None,
            limit: 10,
            profile: AgentProfile::General,
        })
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].chunk_id, "b1");

    // An unknown agent sees nothing.
    let foreign = engine
        .search(&SearchRequest {
            agent_id: "agent-2",
            query: "shared topic",
            document_filter: None,
            limit: 10,
            profile: AgentProfile::General,
        })
        .await
        .unwrap();
    assert!(foreign.is_empty());
}

#[tokio::test]
async fn hybrid_results_are_tagged_by_channel() {
    let (_dir, pool) = test_pool().await;

    seed_ready_corpus(
        &pool,
        "doc",
        &[
            SeededChunk {
                id: "hybrid-hit",
                content: "liquidity analysis of current assets",
                original: None,
                chunk_type: "text",
                vector: similarity_vector(0.8),
            },
            SeededChunk {
                id: "semantic-only",
                content: "solvency outlook commentary",
                original: None,
                chunk_type: "text",
                vector: similarity_vector(0.7),
            },
        ],
    )
    .await;
    agents::activate_document(&pool, "agent-1", "doc").await.unwrap();

    let mut map = HashMap::new();
    map.insert("liquidity analysis".to_string(), similarity_vector(1.0));
    let engine = SearchEngine::new(
        pool.clone(),
        Arc::new(MappedEmbedder::with_mapping(2, map)),
        None,
        RetrievalConfig::default(),
        RankingConfig::default(),
    );

    let results = engine
        .search(&SearchRequest {
            agent_id: "agent-1",
            query: "liquidity analysis",
            document_filter: None,
            limit: 10,
            profile: AgentProfile::General,
        })
        .await
        .unwrap();

    let kinds: HashMap<&str, MatchKind> = results
        .iter()
        .map(|r| (r.chunk_id.as_str(), r.match_kind))
        .collect();
    assert_eq!(kinds["hybrid-hit"], MatchKind::Hybrid);
    assert_eq!(kinds["semantic-only"], MatchKind::Semantic);
}

#[tokio::test]
async fn query_expansion_is_cached_across_searches() {
    let (_dir, pool) = test_pool().await;

    seed_ready_corpus(
        &pool,
        "doc",
        &[SeededChunk {
            id: "c1",
            content: "revenue figures",
            original: None,
            chunk_type: "text",
            vector: similarity_vector(0.9),
        }],
    )
    .await;
    agents::activate_document(&pool, "agent-1", "doc").await.unwrap();

    struct CountingExpander {
        calls: AtomicUsize,
    }
    #[async_trait]
    impl TextGenerator for CountingExpander {
        async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("revenue sales turnover".to_string())
        }
    }

    let expander = Arc::new(CountingExpander {
        calls: AtomicUsize::new(0),
    });
    let engine = SearchEngine::new(
        pool.clone(),
        Arc::new(MappedEmbedder::uniform(2)),
        Some(expander.clone() as Arc<dyn TextGenerator>),
        RetrievalConfig::default(),
        RankingConfig::default(),
    );

    for _ in 0..3 {
        let results = engine
            .search(&SearchRequest {
                agent_id: "agent-1",
                query: "Revenue",
                document_filter: None,
                limit: 5,
                profile: AgentProfile::General,
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    assert_eq!(expander.calls.load(Ordering::SeqCst), 1, "expansion memoized");
}
