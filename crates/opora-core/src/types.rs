use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque group identifier as issued by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for GroupId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a support case (UUIDv7 — time-sortable for easier
/// log correlation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseId(pub String);

impl CaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CaseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CaseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A raw chat message as persisted on ingest. Never mutated afterwards,
/// except for the reaction counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub group_id: GroupId,
    pub message_id: String,
    /// Epoch milliseconds.
    pub ts: i64,
    pub sender_hash: String,
    pub sender_name: Option<String>,
    pub content_text: String,
    /// Paths relative to the configured images root, in attachment order.
    pub image_paths: Vec<String>,
    pub reply_to_id: Option<String>,
    pub reaction_count: u32,
    /// True when the sender hash matches the bot's own.
    pub from_bot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Open,
    Solved,
    Archived,
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseStatus::Open => write!(f, "open"),
            CaseStatus::Solved => write!(f, "solved"),
            CaseStatus::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for CaseStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(CaseStatus::Open),
            "solved" => Ok(CaseStatus::Solved),
            "archived" => Ok(CaseStatus::Archived),
            other => Err(format!("unknown case status: {}", other)),
        }
    }
}

/// A support case mined from the group buffer.
///
/// Evidence is owned by a child table keyed by case id; `evidence_ids` here
/// carries the ordered message ids when the case is loaded in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub case_id: CaseId,
    pub group_id: GroupId,
    pub status: CaseStatus,
    pub problem_title: String,
    pub problem_summary: String,
    pub solution_summary: String,
    pub tags: Vec<String>,
    /// Ordered earliest-first.
    pub evidence_ids: Vec<String>,
    /// Fixed-dim vector over title+problem, used only for near-duplicate
    /// detection between cases. `None` for rows ingested before embedding.
    pub dedup_embedding: Option<Vec<f32>>,
    pub in_index: bool,
    pub closed_emoji: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Case {
    /// Document text upserted into the semantic index for a solved case.
    pub fn index_document(&self) -> String {
        format!(
            "[SOLVED] {}\nProblem: {}\nSolution: {}\ntags: {}",
            self.problem_title,
            self.problem_summary,
            self.solution_summary,
            self.tags.join(", ")
        )
    }

    /// Text the dedup embedding is computed from.
    pub fn dedup_text(&self) -> String {
        format!("{}\n{}", self.problem_title, self.problem_summary)
    }
}

/// Admin interface language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    #[default]
    Uk,
    En,
}

impl fmt::Display for Lang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lang::Uk => write!(f, "uk"),
            Lang::En => write!(f, "en"),
        }
    }
}

impl std::str::FromStr for Lang {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "uk" => Ok(Lang::Uk),
            "en" => Ok(Lang::En),
            other => Err(format!("unknown language: {}", other)),
        }
    }
}

/// Where an admin's direct-message onboarding currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminState {
    AwaitingGroupName,
    AwaitingQrScan,
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminState::AwaitingGroupName => write!(f, "awaiting_group_name"),
            AdminState::AwaitingQrScan => write!(f, "awaiting_qr_scan"),
        }
    }
}

impl std::str::FromStr for AdminState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "awaiting_group_name" => Ok(AdminState::AwaitingGroupName),
            "awaiting_qr_scan" => Ok(AdminState::AwaitingQrScan),
            other => Err(format!("unknown admin state: {}", other)),
        }
    }
}

/// One DM onboarding session per admin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSession {
    pub admin_id: String,
    pub state: AdminState,
    pub pending_group_id: Option<GroupId>,
    pub pending_group_name: Option<String>,
    pub pending_token: Option<String>,
    pub lang: Lang,
    pub updated_at: i64,
}

/// Single-use token authorizing one history bootstrap for one admin+group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryToken {
    pub token: String,
    pub admin_id: String,
    pub group_id: GroupId,
    pub expires_at: i64,
    pub consumed: bool,
}

impl HistoryToken {
    pub fn is_usable(&self, now_ms: i64) -> bool {
        !self.consumed && self.expires_at > now_ms
    }
}
