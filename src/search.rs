//! Hybrid search engine: semantic + keyword retrieval with intent-based
//! re-ranking and small-to-big content swap.
//!
//! A query is expanded (cached), then both channels run in parallel over
//! the chunks active for the agent: cosine similarity over embeddings,
//! and FTS5 keyword match over chunk content. Candidates are merged by
//! chunk id and tagged by channel, re-ranked by the intent boost table,
//! and the top results swap their compressed summary for the verbatim
//! original content before being returned.
//!
//! Ranking is deterministic: equal adjusted scores keep merge encounter
//! order, and vector candidates are merged before keyword candidates.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::config::{AgentProfile, RankingConfig, RetrievalConfig};
use crate::embedding::{blob_to_vec, cosine_similarity, Embedder};
use crate::expand::expand_query;
use crate::llm::TextGenerator;
use crate::models::{MatchKind, SearchResult};

/// One candidate from a single retrieval channel, with its channel score
/// (raw cosine similarity for vectors, min-max normalized rank for
/// keyword hits).
#[derive(Debug, Clone)]
struct ChannelHit {
    chunk_id: String,
    score: f64,
}

/// A candidate after the merge step, before metadata lookup.
#[derive(Debug, Clone)]
struct MergedCandidate {
    chunk_id: String,
    base_score: f64,
    match_kind: MatchKind,
}

pub struct SearchRequest<'a> {
    pub agent_id: &'a str,
    pub query: &'a str,
    /// Restrict candidates to one document by name.
    pub document_filter: Option<&'a str>,
    /// Maximum results; non-positive falls back to the configured limit.
    pub limit: i64,
    /// Scoring profile resolved once for the agent at configuration time.
    pub profile: AgentProfile,
}

pub struct SearchEngine {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    expander: Option<Arc<dyn TextGenerator>>,
    retrieval: RetrievalConfig,
    ranking: RankingConfig,
}

impl SearchEngine {
    pub fn new(
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
        expander: Option<Arc<dyn TextGenerator>>,
        retrieval: RetrievalConfig,
        ranking: RankingConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            expander,
            retrieval,
            ranking,
        }
    }

    /// Run one retrieval call as specified for the consuming UI layer.
    pub async fn search(&self, req: &SearchRequest<'_>) -> Result<Vec<SearchResult>> {
        if req.query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let limit = if req.limit > 0 {
            req.limit
        } else {
            self.retrieval.final_limit
        };

        let expanded = expand_query(&self.pool, self.expander.as_ref(), req.query).await?;

        let (vector_hits, keyword_hits) = tokio::join!(
            self.vector_candidates(&expanded, req.agent_id, req.document_filter),
            self.keyword_candidates(&expanded, req.agent_id, req.document_filter),
        );
        let vector_hits = vector_hits?;
        let keyword_hits = keyword_hits?;

        if vector_hits.is_empty() && keyword_hits.is_empty() {
            return Ok(Vec::new());
        }

        let merged = merge_candidates(vector_hits, keyword_hits, req.profile.semantic_alpha());

        // Intent is detected on the user's own words; expansion synonyms
        // must not flip the bucket.
        let intent = self.ranking.detect_intent(req.query).to_string();
        debug!(intent = %intent, candidates = merged.len(), "re-ranking candidates");

        let metadata = self.load_chunk_metadata(&merged).await?;

        let mut scored: Vec<(MergedCandidate, f64)> = merged
            .into_iter()
            .filter_map(|candidate| {
                let meta = metadata.get(&candidate.chunk_id)?;
                let boost = self.ranking.boost(&intent, &meta.chunk_type);
                let adjusted = candidate.base_score * boost;
                Some((candidate, adjusted))
            })
            .collect();

        // Stable sort: ties keep merge encounter order.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit as usize);

        let results = scored
            .into_iter()
            .map(|(candidate, adjusted)| {
                let meta = &metadata[&candidate.chunk_id];
                SearchResult {
                    chunk_id: candidate.chunk_id,
                    document_name: meta.document_name.clone(),
                    content: swap_original(&meta.content, meta.original_content.as_deref()),
                    chunk_type: meta.chunk_type.clone(),
                    score: adjusted,
                    match_kind: candidate.match_kind,
                }
            })
            .collect();
        Ok(results)
    }

    /// Cosine similarity over the agent's ready chunks, with a floor
    /// below which candidates are discarded.
    async fn vector_candidates(
        &self,
        expanded: &str,
        agent_id: &str,
        document_filter: Option<&str>,
    ) -> Result<Vec<ChannelHit>> {
        let vectors = self
            .embedder
            .embed(&[expanded.to_string()])
            .await
            .context("query embedding failed")?;
        let query_vec = vectors
            .into_iter()
            .next()
            .context("empty query embedding response")?;

        let rows = if let Some(doc_name) = document_filter {
            sqlx::query(
                "SELECT c.id, c.embedding FROM chunks c \
                 JOIN agent_chunks ac ON ac.chunk_id = c.id AND ac.agent_id = ? AND ac.active = 1 \
                 JOIN documents d ON d.id = c.document_id \
                 WHERE c.embedding_status = 'ready' AND c.embedding IS NOT NULL AND d.name = ?",
            )
            .bind(agent_id)
            .bind(doc_name)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT c.id, c.embedding FROM chunks c \
                 JOIN agent_chunks ac ON ac.chunk_id = c.id AND ac.agent_id = ? AND ac.active = 1 \
                 WHERE c.embedding_status = 'ready' AND c.embedding IS NOT NULL",
            )
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?
        };

        let mut hits: Vec<ChannelHit> = rows
            .iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(&query_vec, &blob_to_vec(&blob)) as f64;
                if similarity < self.retrieval.similarity_floor {
                    return None;
                }
                Some(ChannelHit {
                    chunk_id: row.get("id"),
                    score: similarity,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(self.retrieval.candidate_k_vector as usize);
        Ok(hits)
    }

    /// FTS5 keyword match over the agent's active chunks. Scores are
    /// min-max normalized BM25 ranks (higher is better).
    async fn keyword_candidates(
        &self,
        expanded: &str,
        agent_id: &str,
        document_filter: Option<&str>,
    ) -> Result<Vec<ChannelHit>> {
        let Some(match_expr) = fts_match_expr(expanded) else {
            return Ok(Vec::new());
        };

        let rows = if let Some(doc_name) = document_filter {
            sqlx::query(
                "SELECT chunks_fts.chunk_id, chunks_fts.rank AS score FROM chunks_fts \
                 JOIN agent_chunks ac ON ac.chunk_id = chunks_fts.chunk_id \
                   AND ac.agent_id = ? AND ac.active = 1 \
                 JOIN documents d ON d.id = chunks_fts.document_id \
                 WHERE chunks_fts MATCH ? AND d.name = ? \
                 ORDER BY chunks_fts.rank LIMIT ?",
            )
            .bind(agent_id)
            .bind(&match_expr)
            .bind(doc_name)
            .bind(self.retrieval.candidate_k_keyword)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT chunks_fts.chunk_id, chunks_fts.rank AS score FROM chunks_fts \
                 JOIN agent_chunks ac ON ac.chunk_id = chunks_fts.chunk_id \
                   AND ac.agent_id = ? AND ac.active = 1 \
                 WHERE chunks_fts MATCH ? \
                 ORDER BY chunks_fts.rank LIMIT ?",
            )
            .bind(agent_id)
            .bind(&match_expr)
            .bind(self.retrieval.candidate_k_keyword)
            .fetch_all(&self.pool)
            .await?
        };

        let raw: Vec<ChannelHit> = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("score");
                ChannelHit {
                    chunk_id: row.get("chunk_id"),
                    // BM25 rank is negative-is-better; negate so higher
                    // means better before normalization.
                    score: -rank,
                }
            })
            .collect();

        Ok(normalize_scores(raw))
    }

    async fn load_chunk_metadata(
        &self,
        candidates: &[MergedCandidate],
    ) -> Result<HashMap<String, ChunkMetadata>> {
        let mut metadata = HashMap::with_capacity(candidates.len());
        for candidate in candidates {
            let row = sqlx::query(
                "SELECT c.content, c.original_content, c.chunk_type, d.name AS document_name \
                 FROM chunks c JOIN documents d ON d.id = c.document_id WHERE c.id = ?",
            )
            .bind(&candidate.chunk_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                metadata.insert(
                    candidate.chunk_id.clone(),
                    ChunkMetadata {
                        content: row.get("content"),
                        original_content: row.get("original_content"),
                        chunk_type: row.get("chunk_type"),
                        document_name: row.get("document_name"),
                    },
                );
            }
        }
        Ok(metadata)
    }
}

struct ChunkMetadata {
    content: String,
    original_content: Option<String>,
    chunk_type: String,
    document_name: String,
}

/// Small-to-big swap: the caller always receives the verbatim original
/// when one exists, never the compressed summary the ranking ran on.
fn swap_original(content: &str, original: Option<&str>) -> String {
    match original {
        Some(original) if original != content => original.to_string(),
        _ => content.to_string(),
    }
}

/// Union candidates by chunk id, tagging each with the channel(s) that
/// found it. Vector candidates are encountered first, which fixes the
/// deterministic tie-break order. The base score blends the channels:
/// `α × semantic + (1 - α) × keyword`, with a missing channel
/// contributing zero.
fn merge_candidates(
    vector: Vec<ChannelHit>,
    keyword: Vec<ChannelHit>,
    alpha: f64,
) -> Vec<MergedCandidate> {
    let keyword_scores: HashMap<&str, f64> = keyword
        .iter()
        .map(|hit| (hit.chunk_id.as_str(), hit.score))
        .collect();

    let mut merged: Vec<MergedCandidate> = Vec::with_capacity(vector.len() + keyword.len());
    let mut seen: HashMap<String, ()> = HashMap::new();

    for hit in &vector {
        let (kind, kw) = match keyword_scores.get(hit.chunk_id.as_str()) {
            Some(kw) => (MatchKind::Hybrid, *kw),
            None => (MatchKind::Semantic, 0.0),
        };
        merged.push(MergedCandidate {
            chunk_id: hit.chunk_id.clone(),
            base_score: alpha * hit.score + (1.0 - alpha) * kw,
            match_kind: kind,
        });
        seen.insert(hit.chunk_id.clone(), ());
    }

    for hit in &keyword {
        if seen.contains_key(&hit.chunk_id) {
            continue;
        }
        merged.push(MergedCandidate {
            chunk_id: hit.chunk_id.clone(),
            base_score: (1.0 - alpha) * hit.score,
            match_kind: MatchKind::Keyword,
        });
    }

    merged
}

/// Build an FTS5 MATCH expression from expanded terms: quoted tokens
/// joined with OR. Returns `None` when no searchable token remains.
fn fts_match_expr(terms: &str) -> Option<String> {
    let mut tokens: Vec<String> = Vec::new();
    for raw in terms.split_whitespace() {
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if !cleaned.is_empty() && !tokens.contains(&cleaned) {
            tokens.push(format!("\"{}\"", cleaned));
        }
    }
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// Min-max normalize channel scores to `[0, 1]`.
fn normalize_scores(mut hits: Vec<ChannelHit>) -> Vec<ChannelHit> {
    if hits.is_empty() {
        return hits;
    }
    let min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let max = hits
        .iter()
        .map(|h| h.score)
        .fold(f64::NEG_INFINITY, f64::max);

    for hit in &mut hits {
        hit.score = if (max - min).abs() < f64::EPSILON {
            1.0
        } else {
            (hit.score - min) / (max - min)
        };
    }
    hits
}
