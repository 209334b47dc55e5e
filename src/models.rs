//! Core data models used throughout the engine.
//!
//! These types represent the documents, batches, chunks, and enrichment
//! records that flow through the ingestion pipeline, plus the search
//! results returned by the retrieval engine. Statuses round-trip to TEXT
//! columns via `as_str`/`parse`.

use anyhow::bail;

/// Lifecycle of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    /// Created on upload; batches not yet processed.
    Ingested,
    /// At least one batch claimed for extraction.
    Processing,
    /// Every batch completed; chunks may still be awaiting embeddings.
    Chunked,
    /// All chunks terminal and at least one embedded.
    Ready,
    /// Retry budget exhausted; surfaced to the caller.
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Ingested => "ingested",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Chunked => "chunked",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "ingested" => DocumentStatus::Ingested,
            "processing" => DocumentStatus::Processing,
            "chunked" => DocumentStatus::Chunked,
            "ready" => DocumentStatus::Ready,
            "failed" => DocumentStatus::Failed,
            other => bail!("unknown document status: {}", other),
        })
    }
}

/// Processing state of one page-range batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pending" => BatchStatus::Pending,
            "processing" => BatchStatus::Processing,
            "completed" => BatchStatus::Completed,
            "failed" => BatchStatus::Failed,
            other => bail!("unknown batch status: {}", other),
        })
    }
}

/// Embedding state of a chunk.
///
/// `WaitingEnrichment` chunks have an open enrichment item and no
/// searchable content yet; `Ready` chunks always carry a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingStatus {
    Pending,
    WaitingEnrichment,
    Processing,
    Ready,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::WaitingEnrichment => "waiting_enrichment",
            EmbeddingStatus::Processing => "processing",
            EmbeddingStatus::Ready => "ready",
            EmbeddingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pending" => EmbeddingStatus::Pending,
            "waiting_enrichment" => EmbeddingStatus::WaitingEnrichment,
            "processing" => EmbeddingStatus::Processing,
            "ready" => EmbeddingStatus::Ready,
            "failed" => EmbeddingStatus::Failed,
            other => bail!("unknown embedding status: {}", other),
        })
    }
}

/// State of one image/table awaiting vision description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Processing => "processing",
            EnrichmentStatus::Completed => "completed",
            EnrichmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pending" => EnrichmentStatus::Pending,
            "processing" => EnrichmentStatus::Processing,
            "completed" => EnrichmentStatus::Completed,
            "failed" => EnrichmentStatus::Failed,
            other => bail!("unknown enrichment status: {}", other),
        })
    }
}

/// Source format of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Pdf,
    Markdown,
    Image,
    VideoTranscript,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Pdf => "pdf",
            SourceType::Markdown => "markdown",
            SourceType::Image => "image",
            SourceType::VideoTranscript => "video_transcript",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pdf" => SourceType::Pdf,
            "markdown" => SourceType::Markdown,
            "image" => SourceType::Image,
            "video_transcript" => SourceType::VideoTranscript,
            other => bail!("unknown source type: {}", other),
        })
    }

    /// Paginated sources split into page-range batches; everything else is
    /// processed as a single whole-document batch.
    pub fn is_paginated(&self) -> bool {
        matches!(self, SourceType::Pdf)
    }
}

/// An uploaded document awaiting or undergoing processing.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub file_ref: String,
    pub source_type: SourceType,
    pub status: DocumentStatus,
    pub page_count: i64,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Annotation domain classified once per document, reused by every
    /// enrichment item.
    pub domain: Option<String>,
}

/// A contiguous page range of one document, processed atomically.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: String,
    pub document_id: String,
    pub batch_index: i64,
    pub page_start: i64,
    pub page_end: i64,
    pub status: BatchStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// Which retrieval channel produced a search candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Semantic,
    Keyword,
    /// Found by both channels.
    Hybrid,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Semantic => "semantic",
            MatchKind::Keyword => "keyword",
            MatchKind::Hybrid => "hybrid",
        }
    }
}

/// A ranked result returned by the hybrid search engine.
///
/// `content` has already been through the small-to-big swap: when the
/// chunk stored a distinct `original_content`, that is what appears here.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_name: String,
    pub content: String,
    pub chunk_type: String,
    pub score: f64,
    pub match_kind: MatchKind,
}

/// Per-document progress counts for the polling UI layer.
#[derive(Debug, Clone, Default)]
pub struct DocumentProgress {
    pub batches_total: i64,
    pub batches_completed: i64,
    pub batches_failed: i64,
    pub chunks_total: i64,
    pub chunks_ready: i64,
    pub chunks_failed: i64,
    pub chunks_waiting_enrichment: i64,
}
