use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_pages_per_batch")]
    pub pages_per_batch: i64,
    #[serde(default = "default_max_batch_attempts")]
    pub max_batch_attempts: i64,
    /// Documents idle longer than this in an intermediate status are
    /// candidates for the reconciliation sweep.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
    /// Atomic elements (tables, code blocks) above this many characters get
    /// an LLM summary as their embedding text.
    #[serde(default = "default_summary_threshold_chars")]
    pub summary_threshold_chars: usize,
    /// Delay before a failed batch is retried. The cost driver is the
    /// external parser, so anything beyond "not immediately" is enough.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            pages_per_batch: default_pages_per_batch(),
            max_batch_attempts: default_max_batch_attempts(),
            stale_after_secs: default_stale_after_secs(),
            summary_threshold_chars: default_summary_threshold_chars(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_pages_per_batch() -> i64 {
    10
}
fn default_max_batch_attempts() -> i64 {
    3
}
fn default_stale_after_secs() -> i64 {
    300
}
fn default_summary_threshold_chars() -> usize {
    2000
}
fn default_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    /// Maximum items claimed per worker pass.
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: i64,
    /// Descriptions returned by the vision annotator are truncated to this
    /// many characters before storage.
    #[serde(default = "default_max_description_chars")]
    pub max_description_chars: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            claim_batch_size: default_claim_batch_size(),
            max_description_chars: default_max_description_chars(),
        }
    }
}

fn default_claim_batch_size() -> i64 {
    8
}
fn default_max_description_chars() -> usize {
    1200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Shared language-model settings used by query expansion, table
/// summarization, and document-domain classification. One model setting,
/// passed explicitly into each component constructor.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vision_model: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            vision_model: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// External document parser service endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_parser_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_parser_timeout_secs(),
        }
    }
}

fn default_parser_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    /// Vector candidates below this cosine similarity are discarded.
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k_keyword: default_candidate_k(),
            candidate_k_vector: default_candidate_k(),
            similarity_floor: default_similarity_floor(),
            final_limit: default_final_limit(),
        }
    }
}

fn default_candidate_k() -> i64 {
    80
}
fn default_similarity_floor() -> f64 {
    0.2
}
fn default_final_limit() -> i64 {
    12
}

/// Intent-based re-ranking tables.
///
/// One table per query intent: the keywords that detect the intent and a
/// chunk-type → multiplier map applied to candidate scores. Kept as
/// configuration data so tables can be tuned and tested in isolation.
#[derive(Debug, Deserialize, Clone)]
pub struct RankingConfig {
    #[serde(default = "default_intent_tables")]
    pub intents: Vec<IntentTable>,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            intents: default_intent_tables(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntentTable {
    pub intent: String,
    /// Lowercase phrases; any match in the query selects this intent.
    pub keywords: Vec<String>,
    /// chunk_type → score multiplier. Unlisted types get 1.0.
    pub boosts: HashMap<String, f64>,
}

impl RankingConfig {
    /// Classify a query into an intent by keyword heuristics; the first
    /// table whose keywords match wins. Queries matching nothing fall back
    /// to "general" (no boosts).
    pub fn detect_intent(&self, query: &str) -> &str {
        let lowered = query.to_lowercase();
        for table in &self.intents {
            if table.keywords.iter().any(|kw| lowered.contains(kw)) {
                return &table.intent;
            }
        }
        "general"
    }

    /// Multiplier for a chunk type under the given intent. Unknown intents
    /// and unlisted chunk types degrade to 1.0.
    pub fn boost(&self, intent: &str, chunk_type: &str) -> f64 {
        self.intents
            .iter()
            .find(|t| t.intent == intent)
            .and_then(|t| t.boosts.get(chunk_type))
            .copied()
            .unwrap_or(1.0)
    }
}

fn default_intent_tables() -> Vec<IntentTable> {
    fn table(intent: &str, keywords: &[&str], boosts: &[(&str, f64)]) -> IntentTable {
        IntentTable {
            intent: intent.to_string(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            boosts: boosts
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    vec![
        table(
            "balance_sheet_metric",
            &[
                "total assets",
                "total liabilities",
                "shareholders' equity",
                "stockholders' equity",
                "balance sheet",
                "book value",
                "current assets",
                "current liabilities",
            ],
            &[("balance_sheet", 2.5), ("table", 1.5)],
        ),
        table(
            "income_statement_metric",
            &[
                "revenue",
                "net income",
                "gross profit",
                "operating income",
                "earnings per share",
                "income statement",
                "cost of goods",
                "operating expenses",
            ],
            &[("income_statement", 2.5), ("table", 1.5)],
        ),
        table(
            "filing_metadata",
            &[
                "filing date",
                "fiscal year",
                "company name",
                "ticker",
                "auditor",
                "headquarters",
                "incorporated",
                "report date",
            ],
            &[("cover_page", 3.0), ("text", 1.2)],
        ),
    ]
}

/// Scoring weight profile resolved once per agent at configuration time
/// and passed into the ranking step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentProfile {
    /// Financial-analysis agents lean on keyword matches (exact metric
    /// names matter more than paraphrase).
    Financial,
    /// Technical-documentation agents lean on semantic similarity.
    Technical,
    General,
}

impl AgentProfile {
    /// Keyword-based detection over the agent's free-form description.
    pub fn detect(description: &str) -> Self {
        let lowered = description.to_lowercase();
        const FINANCIAL: &[&str] = &[
            "financ", "filing", "10-k", "annual report", "earnings", "audit",
        ];
        const TECHNICAL: &[&str] = &["engineer", "technical", "developer", "api", "code"];

        if FINANCIAL.iter().any(|kw| lowered.contains(kw)) {
            AgentProfile::Financial
        } else if TECHNICAL.iter().any(|kw| lowered.contains(kw)) {
            AgentProfile::Technical
        } else {
            AgentProfile::General
        }
    }

    /// Semantic weight α for hybrid blending:
    /// `score = (1 - α) × keyword + α × semantic`.
    pub fn semantic_alpha(&self) -> f64 {
        match self {
            AgentProfile::Financial => 0.45,
            AgentProfile::Technical => 0.7,
            AgentProfile::General => 0.6,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.ingestion.pages_per_batch < 1 {
        anyhow::bail!("ingestion.pages_per_batch must be >= 1");
    }
    if config.ingestion.max_batch_attempts < 1 {
        anyhow::bail!("ingestion.max_batch_attempts must be >= 1");
    }
    if config.enrichment.claim_batch_size < 1 {
        anyhow::bail!("enrichment.claim_batch_size must be >= 1");
    }
    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_floor) {
        anyhow::bail!("retrieval.similarity_floor must be in [0.0, 1.0]");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.llm.is_enabled() && config.llm.model.is_none() {
        anyhow::bail!(
            "llm.model must be specified when provider is '{}'",
            config.llm.provider
        );
    }
    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    for table in &config.ranking.intents {
        if table.intent.trim().is_empty() {
            anyhow::bail!("ranking intent name must not be empty");
        }
        for (chunk_type, mult) in &table.boosts {
            if *mult <= 0.0 {
                anyhow::bail!(
                    "ranking boost for intent '{}' chunk type '{}' must be > 0",
                    table.intent,
                    chunk_type
                );
            }
        }
    }

    Ok(())
}
