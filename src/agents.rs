//! Agent knowledge links.
//!
//! Agents see only the chunks linked to them with an active flag; the
//! hybrid search engine filters its candidates through these links and
//! nothing else. Links are created by a sync step once a document
//! reaches `ready`, and deactivated (not deleted) to drop a document out
//! of an agent's scope.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use tracing::info;

/// Link every chunk of a ready document to an agent. Idempotent: re-runs
/// refresh the links and reactivate any previously deactivated ones.
pub async fn activate_document(
    pool: &SqlitePool,
    agent_id: &str,
    document_id: &str,
) -> Result<u64> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    match status.as_deref() {
        None => bail!("document not found: {}", document_id),
        Some("ready") => {}
        Some(other) => bail!(
            "document {} is not ready (status: {})",
            document_id,
            other
        ),
    }

    let result = sqlx::query(
        "INSERT INTO agent_chunks (agent_id, chunk_id, document_id, active) \
         SELECT ?, id, document_id, 1 FROM chunks WHERE document_id = ? \
         ON CONFLICT(agent_id, chunk_id) DO UPDATE SET active = 1",
    )
    .bind(agent_id)
    .bind(document_id)
    .execute(pool)
    .await?;

    info!(agent_id, document_id, linked = result.rows_affected(), "document activated for agent");
    Ok(result.rows_affected())
}

/// Drop a document out of an agent's search scope without deleting the
/// association.
pub async fn deactivate_document(
    pool: &SqlitePool,
    agent_id: &str,
    document_id: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_chunks SET active = 0 WHERE agent_id = ? AND document_id = ?",
    )
    .bind(agent_id)
    .bind(document_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
