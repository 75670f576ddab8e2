use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18650;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (opora.toml + OPORA_* env overrides).
///
/// Read-only after load; passed by value into the `Deps` record and never
/// mutated at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OporaConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub transport: TransportConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub cases: CasesConfig,
    #[serde(default)]
    pub answer: AnswerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Base URL used when rendering case links in replies,
    /// e.g. "https://opora.example.org".
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            public_base_url: default_public_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Primary store (source of truth).
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Vector index database. Kept separate so the index can be rebuilt
    /// from the store without touching primary data.
    #[serde(default = "default_index_path")]
    pub index_path: String,
    /// SQLite busy/transaction timeout in milliseconds.
    #[serde(default = "default_tx_timeout_ms")]
    pub tx_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            index_path: default_index_path(),
            tx_timeout_ms: default_tx_timeout_ms(),
        }
    }
}

/// LLM provider (OpenAI-compatible chat completions + embeddings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    /// Dimension of the embedding model output. The index schema is created
    /// with this value; changing it requires an index rebuild.
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
    /// Token-bucket refill rate: calls per second across all workers.
    #[serde(default = "default_llm_rate")]
    pub calls_per_second: f64,
    /// Token-bucket burst size.
    #[serde(default = "default_llm_burst")]
    pub burst: u32,
}

/// Chat transport adapter (external service, reached over HTTP).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Base URL of the adapter, e.g. "http://127.0.0.1:18651".
    pub base_url: String,
    /// Bearer token for adapter calls, if the adapter requires one.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_transport_timeout_ms")]
    pub timeout_ms: u64,
    /// Hash of the bot's own sender id; messages from it get `[BOT]` marking.
    pub bot_sender_hash: String,
    /// Strings that force the gate to consider a message (e.g. "@opora").
    #[serde(default)]
    pub bot_mentions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Age cutoff for buffer eviction.
    #[serde(default = "default_buffer_max_age_hours")]
    pub max_age_hours: i64,
    /// Count cutoff, applied after the age cutoff.
    #[serde(default = "default_buffer_max_messages")]
    pub max_messages: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_age_hours: default_buffer_max_age_hours(),
            max_messages: default_buffer_max_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasesConfig {
    /// Cosine threshold above which two cases in a group are the same case.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,
    /// Open cases untouched for this long are expired by the reconciler.
    #[serde(default = "default_open_ttl_days")]
    pub open_ttl_days: i64,
    /// Emojis treated as solution confirmation when reacted to evidence.
    #[serde(default = "default_positive_emojis")]
    pub positive_emojis: Vec<String>,
}

impl Default for CasesConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: default_dedup_threshold(),
            open_ttl_days: default_open_ttl_days(),
            positive_emojis: default_positive_emojis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerConfig {
    /// How many preceding messages the gate sees as recent context.
    #[serde(default = "default_recent_context_k")]
    pub recent_context_k: usize,
    /// Top-k for the semantic index query.
    #[serde(default = "default_retrieve_top_k")]
    pub retrieve_top_k: usize,
    /// Window for the recently-solved lookup, in milliseconds.
    #[serde(default = "default_recent_solved_window_ms")]
    pub recent_solved_window_ms: i64,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            recent_context_k: default_recent_context_k(),
            retrieve_top_k: default_retrieve_top_k(),
            recent_solved_window_ms: default_recent_solved_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of worker loops.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts cap before a job goes terminal `failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Lease duration; an in-progress job past its lease is re-leasable.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: i64,
    /// Worker poll interval when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Above this depth the ingestor defers MAYBE_RESPOND jobs and workers
    /// back off their polling.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,
    /// Done/failed jobs older than this are garbage-collected.
    #[serde(default = "default_job_retention_ms")]
    pub retention_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            lease_ms: default_lease_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            high_watermark: default_high_watermark(),
            retention_ms: default_job_retention_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    /// Filesystem root for stored image blobs; message records keep
    /// paths relative to it.
    #[serde(default = "default_images_root")]
    pub root: String,
    #[serde(default = "default_max_image_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_max_images_per_message")]
    pub max_per_message: usize,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            root: default_images_root(),
            max_bytes: default_max_image_bytes(),
            max_per_message: default_max_images_per_message(),
        }
    }
}

/// History-bootstrap collaborator (reads old messages from a secondary
/// account and posts extracted case blocks back).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Base URL of the collaborator; empty disables HISTORY_LINK delivery.
    #[serde(default)]
    pub service_url: String,
    /// One-time token lifetime in milliseconds.
    #[serde(default = "default_token_ttl_ms")]
    pub token_ttl_ms: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            token_ttl_ms: default_token_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Fallback language for admins whose DMs gave no signal.
    #[serde(default = "default_language")]
    pub language_default: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            language_default: default_language(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_public_base_url() -> String {
    format!("http://{}:{}", DEFAULT_BIND, DEFAULT_PORT)
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.opora/opora.db", home)
}
fn default_index_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.opora/index.db", home)
}
fn default_tx_timeout_ms() -> u64 {
    5_000
}
fn default_llm_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embed_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embed_dim() -> usize {
    1536
}
fn default_llm_timeout_ms() -> u64 {
    60_000
}
fn default_llm_rate() -> f64 {
    2.0
}
fn default_llm_burst() -> u32 {
    5
}
fn default_transport_timeout_ms() -> u64 {
    15_000
}
fn default_buffer_max_age_hours() -> i64 {
    48
}
fn default_buffer_max_messages() -> usize {
    200
}
fn default_dedup_threshold() -> f32 {
    0.86
}
fn default_open_ttl_days() -> i64 {
    14
}
fn default_positive_emojis() -> Vec<String> {
    ["\u{1F44D}", "\u{2705}", "\u{2764}\u{FE0F}", "\u{1F525}"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_recent_context_k() -> usize {
    8
}
fn default_retrieve_top_k() -> usize {
    4
}
fn default_recent_solved_window_ms() -> i64 {
    48 * 60 * 60 * 1000
}
fn default_workers() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    5
}
fn default_lease_ms() -> i64 {
    120_000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_high_watermark() -> usize {
    500
}
fn default_job_retention_ms() -> i64 {
    24 * 60 * 60 * 1000
}
fn default_images_root() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.opora/images", home)
}
fn default_max_image_bytes() -> u64 {
    4 * 1024 * 1024
}
fn default_max_images_per_message() -> usize {
    2
}
fn default_token_ttl_ms() -> i64 {
    30 * 60 * 1000
}
fn default_language() -> String {
    "uk".to_string()
}

impl OporaConfig {
    /// Load config from a TOML file with OPORA_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: OporaConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("OPORA_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.opora/opora.toml", home)
}
