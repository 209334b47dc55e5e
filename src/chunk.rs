//! Chunk builder: turns one batch's extracted elements into chunk rows.
//!
//! Elements are re-ordered into natural reading order, classified into a
//! semantic chunk type by keyword rules, and written transactionally.
//! Oversized atomic elements (tables, code blocks) get an LLM summary as
//! their embedding text while the verbatim markdown is kept in
//! `original_content` for the small-to-big swap at retrieval time. Visual
//! elements produce a `waiting_enrichment` chunk paired with exactly one
//! enrichment item.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::cmp::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use crate::llm::TextGenerator;
use crate::models::EmbeddingStatus;
use crate::parser::{Element, ElementKind};

/// An ordered keyword rule: every phrase must appear (case-insensitive)
/// for the label to apply. First matching rule wins.
struct TypeRule {
    label: &'static str,
    phrases: &'static [&'static str],
}

const TYPE_RULES: &[TypeRule] = &[
    TypeRule {
        label: "balance_sheet",
        phrases: &["total assets", "total liabilities"],
    },
    TypeRule {
        label: "income_statement",
        phrases: &["revenue", "net income"],
    },
    TypeRule {
        label: "cash_flow",
        phrases: &["cash flow", "operating activities"],
    },
    TypeRule {
        label: "cover_page",
        phrases: &["annual report"],
    },
];

/// Best-effort semantic label for a chunk's text. No match falls back to
/// the element's structural label; unknown labels simply get no ranking
/// boost downstream.
pub fn classify_chunk_type(text: &str, fallback: &str) -> String {
    let lowered = text.to_lowercase();
    for rule in TYPE_RULES {
        if rule.phrases.iter().all(|p| lowered.contains(p)) {
            return rule.label.to_string();
        }
    }
    fallback.to_string()
}

/// Sort elements into reading order: (page, vertical, horizontal), with
/// ties keeping original extraction order. The sort is stable and total,
/// so repeated runs over the same extraction output are deterministic.
pub fn order_elements(mut elements: Vec<Element>) -> Vec<Element> {
    elements.sort_by(|a, b| {
        a.page
            .cmp(&b.page)
            .then(a.y.partial_cmp(&b.y).unwrap_or(Ordering::Equal))
            .then(a.x.partial_cmp(&b.x).unwrap_or(Ordering::Equal))
    });
    elements
}

/// Counts reported back to the orchestrator after a batch build.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuildOutcome {
    pub chunks_written: u64,
    pub enrichment_enqueued: u64,
}

/// Converts extracted elements into chunk rows for one batch.
#[derive(Clone)]
pub struct ChunkBuilder {
    summarizer: Option<Arc<dyn TextGenerator>>,
    summary_threshold_chars: usize,
}

impl ChunkBuilder {
    pub fn new(
        summarizer: Option<Arc<dyn TextGenerator>>,
        summary_threshold_chars: usize,
    ) -> Self {
        Self {
            summarizer,
            summary_threshold_chars,
        }
    }

    /// Build and persist chunks for one batch.
    ///
    /// Any rows left over from an earlier attempt of this batch are
    /// removed first, so a retried batch rebuilds cleanly. Each element is
    /// then inserted in its own transaction: a chunk and its enrichment
    /// item either both exist or neither does.
    pub async fn build_batch(
        &self,
        pool: &SqlitePool,
        document_id: &str,
        batch_index: i64,
        elements: Vec<Element>,
    ) -> Result<BuildOutcome> {
        self.clear_batch(pool, document_id, batch_index).await?;

        let ordered = order_elements(elements);
        let mut outcome = BuildOutcome::default();

        for (chunk_index, element) in ordered.iter().enumerate() {
            match element.kind {
                ElementKind::Image => {
                    self.insert_visual_chunk(pool, document_id, batch_index, chunk_index as i64, element)
                        .await?;
                    outcome.chunks_written += 1;
                    outcome.enrichment_enqueued += 1;
                }
                ElementKind::Text | ElementKind::Table => {
                    self.insert_text_chunk(pool, document_id, batch_index, chunk_index as i64, element)
                        .await?;
                    outcome.chunks_written += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Remove chunk, FTS, and enrichment rows from a previous attempt.
    async fn clear_batch(
        &self,
        pool: &SqlitePool,
        document_id: &str,
        batch_index: i64,
    ) -> Result<()> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            "DELETE FROM enrichment_items WHERE chunk_id IN \
             (SELECT id FROM chunks WHERE document_id = ? AND batch_index = ?)",
        )
        .bind(document_id)
        .bind(batch_index)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN \
             (SELECT id FROM chunks WHERE document_id = ? AND batch_index = ?)",
        )
        .bind(document_id)
        .bind(batch_index)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ? AND batch_index = ?")
            .bind(document_id)
            .bind(batch_index)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_text_chunk(
        &self,
        pool: &SqlitePool,
        document_id: &str,
        batch_index: i64,
        chunk_index: i64,
        element: &Element,
    ) -> Result<()> {
        let fallback = match element.kind {
            ElementKind::Table => "table",
            _ => "text",
        };
        let chunk_type = classify_chunk_type(&element.payload, fallback);

        let is_atomic = matches!(element.kind, ElementKind::Table);
        let content = if is_atomic && element.payload.len() > self.summary_threshold_chars {
            self.summarize(&element.payload)
                .await
                .context("table summarization failed")?
        } else {
            element.payload.clone()
        };

        let chunk_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, batch_index, chunk_index, content,
                                original_content, chunk_type, embedding_status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk_id)
        .bind(document_id)
        .bind(batch_index)
        .bind(chunk_index)
        .bind(&content)
        .bind(&element.payload)
        .bind(&chunk_type)
        .bind(EmbeddingStatus::Pending.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, content) VALUES (?, ?, ?)")
            .bind(&chunk_id)
            .bind(document_id)
            .bind(&content)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// A visual element becomes an empty chunk awaiting enrichment plus
    /// its paired enrichment item, in one transaction.
    async fn insert_visual_chunk(
        &self,
        pool: &SqlitePool,
        document_id: &str,
        batch_index: i64,
        chunk_index: i64,
        element: &Element,
    ) -> Result<()> {
        let chunk_id = Uuid::new_v4().to_string();
        let item_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, batch_index, chunk_index, content,
                                original_content, chunk_type, embedding_status, created_at)
            VALUES (?, ?, ?, ?, '', NULL, 'visual', ?, ?)
            "#,
        )
        .bind(&chunk_id)
        .bind(document_id)
        .bind(batch_index)
        .bind(chunk_index)
        .bind(EmbeddingStatus::WaitingEnrichment.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO enrichment_items (id, chunk_id, payload, status, created_at) \
             VALUES (?, ?, ?, 'pending', ?)",
        )
        .bind(&item_id)
        .bind(&chunk_id)
        .bind(&element.payload)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn summarize(&self, markdown: &str) -> Result<String> {
        let Some(summarizer) = &self.summarizer else {
            // No generator configured: embed the verbatim text. The swap
            // at retrieval time becomes a no-op for this chunk.
            return Ok(markdown.to_string());
        };

        let prompt = format!(
            "Summarize the following table for search indexing. Mention the \
             table's subject, its column headers, and the most significant \
             values and totals. Output a single paragraph of plain text.\n\n{}",
            markdown
        );
        let summary = summarizer.complete(&prompt).await?;
        Ok(summary)
    }
}
