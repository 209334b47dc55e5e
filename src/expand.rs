//! Query expansion with a persistent memoization cache.
//!
//! Expansion rewrites a user query into the original terms plus domain
//! synonyms via the LLM. Results are cached forever, keyed by a SHA-256
//! hash of the normalized query; domain vocabulary is stable enough that
//! entries never expire (invalidation is an external admin action).

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

use crate::llm::TextGenerator;

/// Lowercase, trim, and collapse internal whitespace so trivially
/// different spellings share a cache entry.
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cache key for a normalized query.
pub fn query_hash(normalized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Return the expanded term set for a query, consulting the cache first.
///
/// Without an expander (or when expansion fails) the normalized query is
/// returned unexpanded and nothing is cached, so a later configured run
/// still gets a real expansion.
pub async fn expand_query(
    pool: &SqlitePool,
    expander: Option<&Arc<dyn TextGenerator>>,
    query: &str,
) -> Result<String> {
    let normalized = normalize_query(query);
    if normalized.is_empty() {
        return Ok(normalized);
    }
    let hash = query_hash(&normalized);

    let cached: Option<String> =
        sqlx::query_scalar("SELECT expanded FROM query_expansions WHERE query_hash = ?")
            .bind(&hash)
            .fetch_optional(pool)
            .await?;
    if let Some(expanded) = cached {
        return Ok(expanded);
    }

    let Some(expander) = expander else {
        return Ok(normalized);
    };

    let prompt = format!(
        "Expand this search query for document retrieval. Keep every \
         original term and append close domain synonyms and common \
         alternate phrasings. Answer with a single space-separated list \
         of terms, nothing else.\n\nQuery: {}",
        normalized
    );

    let expanded = match expander.complete(&prompt).await {
        Ok(answer) => {
            let flattened = normalize_query(&answer);
            if flattened.is_empty() {
                normalized.clone()
            } else {
                flattened
            }
        }
        Err(err) => {
            debug!(error = %err, "query expansion failed, using raw query");
            return Ok(normalized);
        }
    };

    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO query_expansions (query_hash, query, expanded, created_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(query_hash) DO NOTHING",
    )
    .bind(&hash)
    .bind(&normalized)
    .bind(&expanded)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(expanded)
}
