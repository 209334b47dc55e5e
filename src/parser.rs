//! Document parser service adapter.
//!
//! The external layout parser is a black box: it receives a document
//! reference (or raw text for non-binary sources) plus a page range and
//! returns structured elements with page/position coordinates. This module
//! defines the [`DocumentParser`] seam and an HTTP implementation of its
//! request/response contract.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::ParserConfig;

/// Structural category reported by the parser for one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Text,
    /// A table rendered as markdown.
    Table,
    /// An image, or a table the parser could only capture as an image.
    /// Payload is base64 image data.
    Image,
}

impl ElementKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" | "title" | "paragraph" | "list" => Some(ElementKind::Text),
            "table" | "code" => Some(ElementKind::Table),
            "image" | "figure" | "table_image" => Some(ElementKind::Image),
            _ => None,
        }
    }
}

/// One structured element extracted from a batch.
#[derive(Debug, Clone)]
pub struct Element {
    pub kind: ElementKind,
    pub page: i64,
    /// Position of the element's top-left corner on the page.
    pub x: f64,
    pub y: f64,
    /// Text or markdown for text/table elements; base64 image data for
    /// image elements.
    pub payload: String,
}

/// What the parser is asked to extract from.
#[derive(Debug, Clone)]
pub enum ParseInput {
    /// Storage reference to the uploaded binary (the parser fetches it).
    FileRef(String),
    /// Raw text for sources that need no layout analysis.
    Text(String),
}

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("parser service error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("parser request failed: {0}")]
    Network(String),
    #[error("parser returned malformed output: {0}")]
    Malformed(String),
}

impl ParserError {
    pub fn is_transient(&self) -> bool {
        match self {
            ParserError::Network(_) => true,
            ParserError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Interface to the external document parser service.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Extract the elements of `pages` (inclusive, 0-based) in layout
    /// order. Timeouts surface as [`ParserError::Network`] and count as
    /// failures for retry purposes.
    async fn extract(
        &self,
        input: &ParseInput,
        page_start: i64,
        page_end: i64,
    ) -> Result<Vec<Element>, ParserError>;
}

#[derive(Debug, Deserialize)]
struct WireElement {
    #[serde(rename = "type")]
    kind: String,
    page: i64,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    payload: String,
}

/// HTTP client for the parser service.
pub struct HttpDocumentParser {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDocumentParser {
    pub fn new(config: &ParserConfig) -> anyhow::Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("parser.base_url is required"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl DocumentParser for HttpDocumentParser {
    async fn extract(
        &self,
        input: &ParseInput,
        page_start: i64,
        page_end: i64,
    ) -> Result<Vec<Element>, ParserError> {
        let body = match input {
            ParseInput::FileRef(file_ref) => serde_json::json!({
                "file_ref": file_ref,
                "page_start": page_start,
                "page_end": page_end,
            }),
            ParseInput::Text(text) => serde_json::json!({
                "text": text,
            }),
        };

        let url = format!("{}/v1/parse", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ParserError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ParserError::Api {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let wire: Vec<WireElement> = response
            .json()
            .await
            .map_err(|e| ParserError::Malformed(e.to_string()))?;

        let mut elements = Vec::with_capacity(wire.len());
        for element in wire {
            let kind = ElementKind::parse(&element.kind).ok_or_else(|| {
                ParserError::Malformed(format!("unknown element type: {}", element.kind))
            })?;
            elements.push(Element {
                kind,
                page: element.page,
                x: element.x,
                y: element.y,
                payload: element.payload,
            });
        }
        Ok(elements)
    }
}
