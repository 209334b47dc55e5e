//! Embedding worker: turns every pending chunk into a vector.
//!
//! Each drain pass claims a bounded batch of `pending` chunks with the
//! claim-then-act guard (status flip must affect exactly one row), embeds
//! them in one API call, and writes vectors back. If more pending chunks
//! remain for the document the worker re-spawns itself instead of waiting
//! for the next reconciliation sweep. Completion detection advances the
//! document to `ready` with a compare-and-set once every chunk is
//! terminal and at least one is embedded.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::embedding::{vec_to_blob, EmbedError, Embedder};
use crate::models::DocumentStatus;

/// Counts for one drain pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainOutcome {
    pub claimed: u64,
    pub embedded: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct EmbeddingWorker {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

struct ClaimedChunk {
    id: String,
    document_id: String,
    content: String,
}

impl EmbeddingWorker {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            pool,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    /// Fire-and-forget drain on a fresh task. Errors are logged, not
    /// propagated; the reconciliation sweep is the safety net.
    pub fn spawn_drain(&self, document_id: Option<String>) {
        let worker = self.clone();
        tokio::spawn(async move {
            if let Err(err) = worker.drain(document_id.as_deref()).await {
                warn!(error = %err, "embedding drain failed");
            }
        });
    }

    /// Claim and embed one bounded batch of pending chunks, optionally
    /// scoped to a single document. Safe to run concurrently with itself:
    /// the per-chunk claim ensures no chunk is embedded twice.
    pub async fn drain(&self, document_id: Option<&str>) -> Result<DrainOutcome> {
        // Stop scheduling work for documents an operator has failed.
        if let Some(doc_id) = document_id {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
                    .bind(doc_id)
                    .fetch_optional(&self.pool)
                    .await?;
            match status.as_deref() {
                None => return Ok(DrainOutcome::default()),
                Some(s) if s == DocumentStatus::Failed.as_str() => {
                    debug!(document_id = doc_id, "document failed, drain aborted");
                    return Ok(DrainOutcome::default());
                }
                _ => {}
            }
        }

        let mut outcome = DrainOutcome::default();
        let claimed = self.claim_batch(document_id).await?;
        outcome.claimed = claimed.len() as u64;

        let mut touched_documents: BTreeSet<String> = BTreeSet::new();
        if let Some(doc_id) = document_id {
            touched_documents.insert(doc_id.to_string());
        }

        if !claimed.is_empty() {
            for chunk in &claimed {
                touched_documents.insert(chunk.document_id.clone());
            }

            let texts: Vec<String> = claimed.iter().map(|c| c.content.clone()).collect();
            match self.embedder.embed(&texts).await {
                Ok(vectors) => {
                    for (chunk, vector) in claimed.iter().zip(vectors.iter()) {
                        if vector.len() != self.embedder.dims() {
                            let err = EmbedError::DimensionMismatch {
                                expected: self.embedder.dims(),
                                actual: vector.len(),
                            };
                            self.mark_failed(&chunk.id, &err.to_string()).await?;
                            outcome.failed += 1;
                            continue;
                        }
                        self.mark_ready(&chunk.id, vector).await?;
                        outcome.embedded += 1;
                    }
                    // The API returned fewer vectors than inputs: the
                    // stragglers failed, not the whole batch.
                    for chunk in claimed.iter().skip(vectors.len()) {
                        self.mark_failed(&chunk.id, "embedding response missing vector")
                            .await?;
                        outcome.failed += 1;
                    }
                }
                Err(err) => {
                    warn!(error = %err, count = claimed.len(), "embedding batch failed");
                    for chunk in &claimed {
                        self.mark_failed(&chunk.id, &err.to_string()).await?;
                        outcome.failed += 1;
                    }
                }
            }
        }

        for doc_id in &touched_documents {
            self.try_finalize_document(doc_id).await?;
        }

        // Self-continuation: keep each invocation short but bound the
        // latency for large documents.
        if let Some(doc_id) = document_id {
            let more: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM chunks WHERE document_id = ? AND embedding_status = 'pending')",
            )
            .bind(doc_id)
            .fetch_one(&self.pool)
            .await?;
            if more {
                self.spawn_drain(Some(doc_id.to_string()));
            }
        }

        Ok(outcome)
    }

    async fn claim_batch(&self, document_id: Option<&str>) -> Result<Vec<ClaimedChunk>> {
        let rows = if let Some(doc_id) = document_id {
            sqlx::query(
                "SELECT id, document_id, content FROM chunks \
                 WHERE embedding_status = 'pending' AND document_id = ? \
                 ORDER BY batch_index, chunk_index LIMIT ?",
            )
            .bind(doc_id)
            .bind(self.batch_size as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, document_id, content FROM chunks \
                 WHERE embedding_status = 'pending' \
                   AND document_id IN (SELECT id FROM documents WHERE status != 'failed') \
                 ORDER BY document_id, batch_index, chunk_index LIMIT ?",
            )
            .bind(self.batch_size as i64)
            .fetch_all(&self.pool)
            .await?
        };

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let result = sqlx::query(
                "UPDATE chunks SET embedding_status = 'processing' \
                 WHERE id = ? AND embedding_status = 'pending'",
            )
            .bind(&id)
            .execute(&self.pool)
            .await?;
            // A concurrent drain got there first; skip silently.
            if result.rows_affected() == 1 {
                claimed.push(ClaimedChunk {
                    id,
                    document_id: row.get("document_id"),
                    content: row.get("content"),
                });
            }
        }
        Ok(claimed)
    }

    async fn mark_ready(&self, chunk_id: &str, vector: &[f32]) -> Result<()> {
        sqlx::query(
            "UPDATE chunks SET embedding = ?, embedding_status = 'ready', last_error = NULL \
             WHERE id = ? AND embedding_status = 'processing'",
        )
        .bind(vec_to_blob(vector))
        .bind(chunk_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal for the chunk; retry is an explicit external action.
    async fn mark_failed(&self, chunk_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE chunks SET embedding_status = 'failed', last_error = ? \
             WHERE id = ? AND embedding_status = 'processing'",
        )
        .bind(error)
        .bind(chunk_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn try_finalize_document(&self, document_id: &str) -> Result<bool> {
        try_finalize_document(&self.pool, document_id).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Advance a document to `ready` when every batch is completed, every
/// chunk is terminal, and at least one chunk is embedded. The status
/// write is a compare-and-set against `chunked`, so only one caller wins
/// and the full child state is re-read first. Shared with the
/// reconciliation sweep.
pub async fn try_finalize_document(pool: &SqlitePool, document_id: &str) -> Result<bool> {
    let open_batches: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM batches WHERE document_id = ? AND status != 'completed'",
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;
    if open_batches > 0 {
        return Ok(false);
    }

    let row = sqlx::query(
        "SELECT \
           SUM(CASE WHEN embedding_status NOT IN ('ready', 'failed') THEN 1 ELSE 0 END) AS open, \
           SUM(CASE WHEN embedding_status = 'ready' THEN 1 ELSE 0 END) AS ready \
         FROM chunks WHERE document_id = ?",
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;
    let open: i64 = row.try_get::<Option<i64>, _>("open")?.unwrap_or(0);
    let ready: i64 = row.try_get::<Option<i64>, _>("ready")?.unwrap_or(0);

    // A document whose every chunk failed never silently becomes ready;
    // it stays in `chunked` for operator attention.
    if open > 0 || ready == 0 {
        return Ok(false);
    }

    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE documents SET status = 'ready', updated_at = ? \
         WHERE id = ? AND status = 'chunked'",
    )
    .bind(now)
    .bind(document_id)
    .execute(pool)
    .await?;

    let finalized = result.rows_affected() == 1;
    if finalized {
        info!(document_id, ready_chunks = ready, "document ready");
    }
    Ok(finalized)
}
