//! Ingestion pipeline orchestration.
//!
//! Drives a document from `ingested` to `chunked`: splits it into page
//! batches, processes each batch (extraction → chunk build), and chains
//! the next batch on completion. Chaining is the fast path; the
//! [`Orchestrator::reconcile`] sweep is the safety net that repairs
//! inconsistent intermediate state and restarts work after a dropped
//! chain. Both entry points share the same claim-then-act primitive:
//! every status flip is a single-row conditional UPDATE that must affect
//! exactly one row before any work proceeds.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::ChunkBuilder;
use crate::config::IngestionConfig;
use crate::embed::{try_finalize_document, EmbeddingWorker};
use crate::enrich::EnrichmentWorker;
use crate::models::{Batch, BatchStatus, Document, DocumentStatus, SourceType};
use crate::parser::{DocumentParser, ParseInput};

/// A document handed to [`Orchestrator::ingest`].
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub name: String,
    pub file_ref: String,
    pub source_type: SourceType,
    pub page_count: i64,
}

/// What one reconciliation sweep found and repaired.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileReport {
    /// Documents reset to `ingested` (advanced status, zero chunks).
    pub resynced: u64,
    /// Documents advanced to `ready` (all chunks terminal, status lagged).
    pub finalized: u64,
    /// Batches restarted (stuck `processing` or dropped chains).
    pub restarted_batches: u64,
    /// Chunks released from a stuck `processing` claim.
    pub released_chunks: u64,
    /// Embedding drains kicked for documents with a pending backlog.
    pub kicked_drains: u64,
    /// Enrichment passes kicked for pending items.
    pub kicked_enrichment: u64,
}

#[derive(Clone)]
pub struct Orchestrator {
    pool: SqlitePool,
    parser: Arc<dyn DocumentParser>,
    builder: ChunkBuilder,
    config: IngestionConfig,
    enrich_worker: Option<EnrichmentWorker>,
    embed_worker: Option<EmbeddingWorker>,
}

/// Contiguous 0-based page ranges, inclusive on both ends. Non-paginated
/// sources and documents at or below one batch-worth of pages get exactly
/// one batch.
pub fn page_ranges(page_count: i64, pages_per_batch: i64, paginated: bool) -> Vec<(i64, i64)> {
    let last = (page_count - 1).max(0);
    if !paginated || page_count <= pages_per_batch {
        return vec![(0, last)];
    }

    let mut ranges = Vec::new();
    let mut start = 0;
    while start < page_count {
        let end = (start + pages_per_batch - 1).min(last);
        ranges.push((start, end));
        start += pages_per_batch;
    }
    ranges
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        parser: Arc<dyn DocumentParser>,
        builder: ChunkBuilder,
        config: IngestionConfig,
        enrich_worker: Option<EnrichmentWorker>,
        embed_worker: Option<EmbeddingWorker>,
    ) -> Self {
        Self {
            pool,
            parser,
            builder,
            config,
            enrich_worker,
            embed_worker,
        }
    }

    /// Register an uploaded document and start processing its first
    /// batch. Returns the new document id.
    pub async fn ingest(&self, doc: NewDocument) -> Result<String> {
        let document_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO documents (id, name, file_ref, source_type, status, page_count, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'ingested', ?, ?, ?)",
        )
        .bind(&document_id)
        .bind(&doc.name)
        .bind(&doc.file_ref)
        .bind(doc.source_type.as_str())
        .bind(doc.page_count)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let batch_count = self
            .split_into_batches(&document_id, doc.page_count, doc.source_type)
            .await?;
        info!(%document_id, batch_count, name = %doc.name, "document ingested");

        if let Some(first) = self.next_pending_batch(&document_id).await? {
            self.spawn_batch(first, None);
        }
        Ok(document_id)
    }

    /// Create the batch rows for a document, all `pending`, indices
    /// contiguous from 0. Returns the batch count.
    pub async fn split_into_batches(
        &self,
        document_id: &str,
        page_count: i64,
        source_type: SourceType,
    ) -> Result<i64> {
        let ranges = page_ranges(
            page_count,
            self.config.pages_per_batch,
            source_type.is_paginated(),
        );
        let now = chrono::Utc::now().timestamp();

        for (index, (start, end)) in ranges.iter().enumerate() {
            sqlx::query(
                "INSERT INTO batches (id, document_id, batch_index, page_start, page_end, status, updated_at) \
                 VALUES (?, ?, ?, ?, ?, 'pending', ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(document_id)
            .bind(index as i64)
            .bind(start)
            .bind(end)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(ranges.len() as i64)
    }

    /// Process one batch: extraction, chunk build, completion, chaining.
    ///
    /// Safe to call more than once for the same batch: the claim flip
    /// (`pending → processing`) must affect exactly one row, so a second
    /// concurrent caller backs off without doing work.
    pub async fn process_batch(&self, batch_id: &str) -> Result<()> {
        let Some(batch) = fetch_batch(&self.pool, batch_id).await? else {
            return Ok(());
        };
        let document_id = batch.document_id.clone();
        let Some(doc) = fetch_document(&self.pool, &document_id).await? else {
            return Ok(());
        };

        // The one cancellation primitive: stop scheduling work for
        // documents an operator has marked failed.
        if doc.status == DocumentStatus::Failed {
            debug!(%document_id, batch_id, "document failed, batch skipped");
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let claim = sqlx::query(
            "UPDATE batches SET status = 'processing', attempts = attempts + 1, updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        if claim.rows_affected() != 1 {
            debug!(batch_id, "batch already claimed");
            return Ok(());
        }

        sqlx::query(
            "UPDATE documents SET status = 'processing', updated_at = ? \
             WHERE id = ? AND status = 'ingested'",
        )
        .bind(now)
        .bind(&document_id)
        .execute(&self.pool)
        .await?;

        let attempts: i64 = sqlx::query_scalar("SELECT attempts FROM batches WHERE id = ?")
            .bind(batch_id)
            .fetch_one(&self.pool)
            .await?;

        let input = ParseInput::FileRef(doc.file_ref.clone());
        let elements = match self
            .parser
            .extract(&input, batch.page_start, batch.page_end)
            .await
        {
            Ok(elements) => elements,
            Err(err) => {
                return self
                    .handle_batch_failure(batch_id, &document_id, attempts, &err.to_string())
                    .await;
            }
        };

        let outcome = match self
            .builder
            .build_batch(&self.pool, &document_id, batch.batch_index, elements)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                return self
                    .handle_batch_failure(batch_id, &document_id, attempts, &format!("{err:#}"))
                    .await;
            }
        };

        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE batches SET status = 'completed', last_error = NULL, updated_at = ? \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(now)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        info!(
            %document_id,
            batch_index = batch.batch_index,
            chunks = outcome.chunks_written,
            enrichment = outcome.enrichment_enqueued,
            "batch completed"
        );

        self.advance_document(&document_id).await
    }

    /// Chain the next pending batch, or close out the document when no
    /// batch remains open.
    async fn advance_document(&self, document_id: &str) -> Result<()> {
        if let Some(next) = self.next_pending_batch(document_id).await? {
            self.spawn_batch(next, None);
            return Ok(());
        }

        let open: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM batches WHERE document_id = ? AND status IN ('pending', 'processing')",
        )
        .bind(document_id)
        .fetch_one(&self.pool)
        .await?;
        if open > 0 {
            return Ok(());
        }

        // "Am I done" re-reads the full batch state above before this
        // compare-and-set; a blind overwrite could race a failure path.
        let now = chrono::Utc::now().timestamp();
        let done = sqlx::query(
            "UPDATE documents SET status = 'chunked', updated_at = ? \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(now)
        .bind(document_id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 1 {
            info!(document_id, "document chunked");
            if let Some(enrich) = &self.enrich_worker {
                enrich.spawn_pass(Some(document_id.to_string()));
            }
            if let Some(embed) = &self.embed_worker {
                embed.spawn_drain(Some(document_id.to_string()));
            }
        }
        Ok(())
    }

    async fn handle_batch_failure(
        &self,
        batch_id: &str,
        document_id: &str,
        attempts: i64,
        error: &str,
    ) -> Result<()> {
        warn!(document_id, batch_id, attempts, error, "batch attempt failed");
        let now = chrono::Utc::now().timestamp();

        sqlx::query("UPDATE documents SET attempts = attempts + 1 WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        if attempts < self.config.max_batch_attempts {
            sqlx::query(
                "UPDATE batches SET status = 'pending', last_error = ?, updated_at = ? \
                 WHERE id = ? AND status = 'processing'",
            )
            .bind(error)
            .bind(now)
            .bind(batch_id)
            .execute(&self.pool)
            .await?;
            self.spawn_batch(
                batch_id.to_string(),
                Some(Duration::from_millis(self.config.retry_delay_ms)),
            );
            return Ok(());
        }

        // Retry budget exhausted: terminal for the batch and surfaced on
        // the document.
        sqlx::query(
            "UPDATE batches SET status = 'failed', last_error = ?, updated_at = ? \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(error)
        .bind(now)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "UPDATE documents SET status = 'failed', last_error = ?, updated_at = ? \
             WHERE id = ? AND status != 'failed'",
        )
        .bind(error)
        .bind(now)
        .bind(document_id)
        .execute(&self.pool)
        .await?;

        warn!(document_id, batch_id, "batch failed terminally");
        Ok(())
    }

    async fn next_pending_batch(&self, document_id: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar(
            "SELECT id FROM batches WHERE document_id = ? AND status = 'pending' \
             ORDER BY batch_index LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Fire-and-forget batch processing on a fresh task, optionally after
    /// a delay (failed batches are retried "not immediately").
    fn spawn_batch(&self, batch_id: String, delay: Option<Duration>) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Err(err) = orchestrator.process_batch(&batch_id).await {
                warn!(%batch_id, error = %err, "spawned batch processing failed");
            }
        });
    }

    /// Periodic safety net beneath event-driven chaining.
    ///
    /// Heals the two inconsistency classes (advanced status with zero
    /// chunks; all-chunks-terminal with a lagging status), releases stuck
    /// claims, and restarts dropped chains. Operates on whatever state it
    /// finds; it never assumes batch ordering.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let cutoff = chrono::Utc::now().timestamp() - self.config.stale_after_secs;

        // Advanced status, zero chunks: likely a crash before the first
        // chunk write. Resynchronize to `ingested` and re-open batches.
        let stuck: Vec<String> = sqlx::query_scalar(
            "SELECT d.id FROM documents d \
             WHERE d.status IN ('processing', 'chunked') AND d.updated_at < ? \
               AND NOT EXISTS (SELECT 1 FROM chunks c WHERE c.document_id = d.id)",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for document_id in &stuck {
            let now = chrono::Utc::now().timestamp();
            let reset = sqlx::query(
                "UPDATE documents SET status = 'ingested', updated_at = ? \
                 WHERE id = ? AND status IN ('processing', 'chunked')",
            )
            .bind(now)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
            if reset.rows_affected() == 1 {
                sqlx::query(
                    "UPDATE batches SET status = 'pending', updated_at = ? \
                     WHERE document_id = ? AND status IN ('processing', 'completed')",
                )
                .bind(now)
                .bind(document_id)
                .execute(&self.pool)
                .await?;
                info!(%document_id, "document resynchronized to ingested");
                report.resynced += 1;
                // Restart the chain for what was just reset; the claim
                // guard makes a double start harmless.
                if let Some(batch_id) = self.next_pending_batch(document_id).await? {
                    self.spawn_batch(batch_id, None);
                    report.restarted_batches += 1;
                }
            }
        }

        // Batches stuck in `processing` past the stale window: the claim
        // crashed between claim and complete. Re-open them.
        let released = sqlx::query(
            "UPDATE batches SET status = 'pending' \
             WHERE status = 'processing' AND updated_at < ? \
               AND document_id IN (SELECT id FROM documents WHERE status != 'failed')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        report.restarted_batches += released.rows_affected();

        // Same for chunks whose embedding claim never completed.
        let released_chunks = sqlx::query(
            "UPDATE chunks SET embedding_status = 'pending' \
             WHERE embedding_status = 'processing' AND created_at < ? \
               AND document_id IN (SELECT id FROM documents WHERE status != 'failed')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        report.released_chunks += released_chunks.rows_affected();

        sqlx::query(
            "UPDATE enrichment_items SET status = 'pending' \
             WHERE status = 'processing' AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        // Lagging statuses: every batch completed but the document never
        // made `chunked`, or every chunk terminal but never `ready`.
        let candidates: Vec<String> = sqlx::query_scalar(
            "SELECT d.id FROM documents d \
             WHERE d.status IN ('processing', 'chunked') \
               AND NOT EXISTS (SELECT 1 FROM batches b \
                               WHERE b.document_id = d.id AND b.status != 'completed')",
        )
        .fetch_all(&self.pool)
        .await?;

        for document_id in &candidates {
            let now = chrono::Utc::now().timestamp();
            sqlx::query(
                "UPDATE documents SET status = 'chunked', updated_at = ? \
                 WHERE id = ? AND status = 'processing'",
            )
            .bind(now)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
            if try_finalize_document(&self.pool, document_id).await? {
                report.finalized += 1;
            }
        }

        // Forward progress: restart dropped chains and drain backlogs.
        let stalled: Vec<String> = sqlx::query_scalar(
            "SELECT d.id FROM documents d \
             WHERE d.status IN ('ingested', 'processing') AND d.updated_at < ? \
               AND EXISTS (SELECT 1 FROM batches b \
                           WHERE b.document_id = d.id AND b.status = 'pending') \
               AND NOT EXISTS (SELECT 1 FROM batches b \
                               WHERE b.document_id = d.id AND b.status = 'processing')",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        for document_id in &stalled {
            if let Some(batch_id) = self.next_pending_batch(document_id).await? {
                self.spawn_batch(batch_id, None);
                report.restarted_batches += 1;
            }
        }

        if let Some(embed) = &self.embed_worker {
            let backlogged: Vec<String> = sqlx::query_scalar(
                "SELECT DISTINCT c.document_id FROM chunks c \
                 JOIN documents d ON d.id = c.document_id \
                 WHERE c.embedding_status = 'pending' AND d.status != 'failed'",
            )
            .fetch_all(&self.pool)
            .await?;
            for document_id in backlogged {
                embed.spawn_drain(Some(document_id));
                report.kicked_drains += 1;
            }
        }

        if let Some(enrich) = &self.enrich_worker {
            let pending_items: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM enrichment_items WHERE status = 'pending')",
            )
            .fetch_one(&self.pool)
            .await?;
            if pending_items {
                enrich.spawn_pass(None);
                report.kicked_enrichment += 1;
            }
        }

        Ok(report)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Load a document record, for callers polling progress.
pub async fn fetch_document(pool: &SqlitePool, document_id: &str) -> Result<Option<Document>> {
    let Some(row) = sqlx::query(
        "SELECT id, name, file_ref, source_type, status, page_count, attempts, last_error, domain \
         FROM documents WHERE id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };

    let source_type: String = row.get("source_type");
    let status: String = row.get("status");
    Ok(Some(Document {
        id: row.get("id"),
        name: row.get("name"),
        file_ref: row.get("file_ref"),
        source_type: SourceType::parse(&source_type)?,
        status: DocumentStatus::parse(&status)?,
        page_count: row.get("page_count"),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        domain: row.get("domain"),
    }))
}

/// Load a batch record.
pub async fn fetch_batch(pool: &SqlitePool, batch_id: &str) -> Result<Option<Batch>> {
    let Some(row) = sqlx::query(
        "SELECT id, document_id, batch_index, page_start, page_end, status, attempts, last_error \
         FROM batches WHERE id = ?",
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };

    let status: String = row.get("status");
    Ok(Some(Batch {
        id: row.get("id"),
        document_id: row.get("document_id"),
        batch_index: row.get("batch_index"),
        page_start: row.get("page_start"),
        page_end: row.get("page_end"),
        status: BatchStatus::parse(&status)?,
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
    }))
}
