//! Per-document progress counts.
//!
//! The consuming UI layer polls document/batch status and chunk counts;
//! it never interprets internal retry bookkeeping.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::DocumentProgress;

pub async fn document_progress(pool: &SqlitePool, document_id: &str) -> Result<DocumentProgress> {
    let batches = sqlx::query(
        "SELECT COUNT(*) AS total, \
           SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed, \
           SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed \
         FROM batches WHERE document_id = ?",
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;

    let chunks = sqlx::query(
        "SELECT COUNT(*) AS total, \
           SUM(CASE WHEN embedding_status = 'ready' THEN 1 ELSE 0 END) AS ready, \
           SUM(CASE WHEN embedding_status = 'failed' THEN 1 ELSE 0 END) AS failed, \
           SUM(CASE WHEN embedding_status = 'waiting_enrichment' THEN 1 ELSE 0 END) AS waiting \
         FROM chunks WHERE document_id = ?",
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;

    Ok(DocumentProgress {
        batches_total: batches.get("total"),
        batches_completed: batches.try_get::<Option<i64>, _>("completed")?.unwrap_or(0),
        batches_failed: batches.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
        chunks_total: chunks.get("total"),
        chunks_ready: chunks.try_get::<Option<i64>, _>("ready")?.unwrap_or(0),
        chunks_failed: chunks.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
        chunks_waiting_enrichment: chunks.try_get::<Option<i64>, _>("waiting")?.unwrap_or(0),
    })
}
