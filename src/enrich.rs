//! Enrichment queue worker.
//!
//! Visual chunks (images, tables captured as images) wait here until the
//! vision annotator has produced a text description. The worker claims a
//! bounded batch of pending items, reuses a per-document annotation
//! domain (classified once with a cheap LLM call), writes descriptions
//! back into the paired chunks, and releases them to the embedding
//! worker. A failed item fails its chunk only; the document still makes
//! progress toward `ready`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::embed::EmbeddingWorker;
use crate::llm::TextGenerator;
use crate::models::EnrichmentStatus;
use crate::vision::{domain_prompt, VisionAnnotator};

const DEFAULT_DOMAIN: &str = "general business";

/// Counts for one worker pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnrichOutcome {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct EnrichmentWorker {
    pool: SqlitePool,
    annotator: Arc<dyn VisionAnnotator>,
    /// Lightweight domain classifier; without one, items fall back to a
    /// generic annotation prompt.
    classifier: Option<Arc<dyn TextGenerator>>,
    claim_batch_size: i64,
    max_description_chars: usize,
    embed_worker: Option<EmbeddingWorker>,
}

struct ClaimedItem {
    id: String,
    chunk_id: String,
    document_id: String,
    payload: String,
}

impl EnrichmentWorker {
    pub fn new(
        pool: SqlitePool,
        annotator: Arc<dyn VisionAnnotator>,
        classifier: Option<Arc<dyn TextGenerator>>,
        claim_batch_size: i64,
        max_description_chars: usize,
        embed_worker: Option<EmbeddingWorker>,
    ) -> Self {
        Self {
            pool,
            annotator,
            classifier,
            claim_batch_size: claim_batch_size.max(1),
            max_description_chars,
            embed_worker,
        }
    }

    /// Fire-and-forget pass on a fresh task.
    pub fn spawn_pass(&self, document_id: Option<String>) {
        let worker = self.clone();
        tokio::spawn(async move {
            if let Err(err) = worker.process_pending(document_id.as_deref()).await {
                warn!(error = %err, "enrichment pass failed");
            }
        });
    }

    /// Claim and process one bounded batch of pending enrichment items,
    /// optionally scoped to a single document.
    pub async fn process_pending(&self, document_id: Option<&str>) -> Result<EnrichOutcome> {
        let claimed = self.claim_batch(document_id).await?;
        let mut outcome = EnrichOutcome::default();
        let mut touched_documents: BTreeSet<String> = BTreeSet::new();

        for item in &claimed {
            touched_documents.insert(item.document_id.clone());

            let domain = self.document_domain(&item.document_id).await?;
            match self
                .annotator
                .describe(&item.payload, &domain_prompt(&domain))
                .await
            {
                Ok(description) => {
                    let capped = truncate_chars(&description, self.max_description_chars);
                    self.complete_item(item, &capped).await?;
                    outcome.completed += 1;
                }
                Err(err) => {
                    debug!(item_id = %item.id, error = %err, "enrichment item failed");
                    self.fail_item(item, &err.to_string()).await?;
                    outcome.failed += 1;
                }
            }
        }

        // Enriched chunks are now pending; failed ones are terminal. Kick
        // the embedding worker either way so completion detection runs.
        if let Some(embed) = &self.embed_worker {
            for doc_id in &touched_documents {
                embed.spawn_drain(Some(doc_id.clone()));
            }
        }

        // Self-continuation while a backlog remains.
        if !claimed.is_empty() {
            let more: bool = match document_id {
                Some(doc_id) => sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM enrichment_items e \
                     JOIN chunks c ON c.id = e.chunk_id \
                     WHERE e.status = 'pending' AND c.document_id = ?)",
                )
                .bind(doc_id)
                .fetch_one(&self.pool)
                .await?,
                None => sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM enrichment_items WHERE status = 'pending')",
                )
                .fetch_one(&self.pool)
                .await?,
            };
            if more {
                self.spawn_pass(document_id.map(|s| s.to_string()));
            }
        }

        Ok(outcome)
    }

    async fn claim_batch(&self, document_id: Option<&str>) -> Result<Vec<ClaimedItem>> {
        // Documents an operator has failed stop receiving work.
        let rows = if let Some(doc_id) = document_id {
            sqlx::query(
                "SELECT e.id, e.chunk_id, e.payload, c.document_id \
                 FROM enrichment_items e \
                 JOIN chunks c ON c.id = e.chunk_id \
                 JOIN documents d ON d.id = c.document_id \
                 WHERE e.status = 'pending' AND c.document_id = ? AND d.status != 'failed' \
                 ORDER BY e.created_at LIMIT ?",
            )
            .bind(doc_id)
            .bind(self.claim_batch_size)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT e.id, e.chunk_id, e.payload, c.document_id \
                 FROM enrichment_items e \
                 JOIN chunks c ON c.id = e.chunk_id \
                 JOIN documents d ON d.id = c.document_id \
                 WHERE e.status = 'pending' AND d.status != 'failed' \
                 ORDER BY e.created_at LIMIT ?",
            )
            .bind(self.claim_batch_size)
            .fetch_all(&self.pool)
            .await?
        };

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let result = sqlx::query(
                "UPDATE enrichment_items SET status = ? WHERE id = ? AND status = ?",
            )
            .bind(EnrichmentStatus::Processing.as_str())
            .bind(&id)
            .bind(EnrichmentStatus::Pending.as_str())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                claimed.push(ClaimedItem {
                    id,
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    payload: row.get("payload"),
                });
            }
        }
        Ok(claimed)
    }

    /// The annotation domain is classified once per document and cached
    /// on the document row; every item of the document reuses it.
    async fn document_domain(&self, document_id: &str) -> Result<String> {
        let cached: Option<Option<String>> =
            sqlx::query_scalar("SELECT domain FROM documents WHERE id = ?")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some(Some(domain)) = cached {
            return Ok(domain);
        }

        let domain = self.classify_domain(document_id).await;
        sqlx::query("UPDATE documents SET domain = ? WHERE id = ? AND domain IS NULL")
            .bind(&domain)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(domain)
    }

    async fn classify_domain(&self, document_id: &str) -> String {
        let Some(classifier) = &self.classifier else {
            return DEFAULT_DOMAIN.to_string();
        };

        let samples: Vec<String> = match sqlx::query_scalar(
            "SELECT content FROM chunks \
             WHERE document_id = ? AND chunk_type != 'visual' AND content != '' \
             ORDER BY batch_index, chunk_index LIMIT 3",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(_) => return DEFAULT_DOMAIN.to_string(),
        };

        if samples.is_empty() {
            return DEFAULT_DOMAIN.to_string();
        }

        let prompt = format!(
            "Classify the subject domain of a document based on these \
             excerpts. Answer with a short noun phrase (e.g. 'financial \
             reporting', 'software engineering', 'medical research').\n\n{}",
            samples.join("\n---\n")
        );
        match classifier.complete(&prompt).await {
            Ok(answer) => {
                let domain = answer.lines().next().unwrap_or("").trim().to_lowercase();
                if domain.is_empty() {
                    DEFAULT_DOMAIN.to_string()
                } else {
                    truncate_chars(&domain, 80)
                }
            }
            Err(err) => {
                debug!(document_id, error = %err, "domain classification failed");
                DEFAULT_DOMAIN.to_string()
            }
        }
    }

    /// Write the description into the paired chunk, refresh its FTS row,
    /// release it to the embedding worker, and close the item, all in one
    /// transaction.
    async fn complete_item(&self, item: &ClaimedItem, description: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE chunks SET content = ?, embedding_status = 'pending' \
             WHERE id = ? AND embedding_status = 'waiting_enrichment'",
        )
        .bind(description)
        .bind(&item.chunk_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(&item.chunk_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, content) VALUES (?, ?, ?)")
            .bind(&item.chunk_id)
            .bind(&item.document_id)
            .bind(description)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE enrichment_items SET status = 'completed', description = ? \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(description)
        .bind(&item.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_item(&self, item: &ClaimedItem, error: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE enrichment_items SET status = 'failed', last_error = ? \
             WHERE id = ? AND status = 'processing'",
        )
        .bind(error)
        .bind(&item.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE chunks SET embedding_status = 'failed', last_error = ? \
             WHERE id = ? AND embedding_status = 'waiting_enrichment'",
        )
        .bind(error)
        .bind(&item.chunk_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}
