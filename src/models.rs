//! Core data model: documents, chunks, programs, conversations, outputs, and
//! writing styles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    GrantProposal,
    GrantReport,
    CaseStudy,
    AnnualReport,
    Other,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::GrantProposal => "grant_proposal",
            DocType::GrantReport => "grant_report",
            DocType::CaseStudy => "case_study",
            DocType::AnnualReport => "annual_report",
            DocType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grant_proposal" => Some(DocType::GrantProposal),
            "grant_report" => Some(DocType::GrantReport),
            "case_study" => Some(DocType::CaseStudy),
            "annual_report" => Some(DocType::AnnualReport),
            "other" => Some(DocType::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Awarded,
    NotAwarded,
    Pending,
    #[serde(rename = "n_a")]
    NotApplicable,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Awarded => "awarded",
            Outcome::NotAwarded => "not_awarded",
            Outcome::Pending => "pending",
            Outcome::NotApplicable => "n_a",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awarded" => Some(Outcome::Awarded),
            "not_awarded" => Some(Outcome::NotAwarded),
            "pending" => Some(Outcome::Pending),
            "n_a" => Some(Outcome::NotApplicable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityLevel {
    Low,
    Medium,
    High,
}

impl SensitivityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitivityLevel::Low => "low",
            SensitivityLevel::Medium => "medium",
            SensitivityLevel::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(SensitivityLevel::Low),
            "medium" => Some(SensitivityLevel::Medium),
            "high" => Some(SensitivityLevel::High),
            _ => None,
        }
    }
}

/// Metadata supplied by the caller at ingestion time (§4.7 step 1).
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentMetadata {
    pub doc_type: DocType,
    pub year: i32,
    pub outcome: Outcome,
    pub programs: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub is_sensitive: bool,
    pub sensitivity_level: SensitivityLevel,
}

/// A single ingested file, the canonical relational-store record (§3).
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub doc_type: DocType,
    pub year: i32,
    pub outcome: Outcome,
    pub file_size_bytes: u64,
    pub chunks_count: i64,
    pub upload_timestamp: DateTime<Utc>,
    pub created_by: String,
    pub is_sensitive: bool,
    pub sensitivity_level: SensitivityLevel,
    pub notes: Option<String>,
    pub programs: Vec<String>,
    pub tags: Vec<String>,
    /// sha256 of the original file bytes, used to detect re-ingestion of the
    /// same content under a new upload (§4.7 dedup).
    pub content_hash: String,
}

/// An embedding-bearing text fragment, denormalized with parent document
/// metadata so the vector store can push filters down (§3, §9).
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub doc_type: DocType,
    pub year: i32,
    pub outcome: Outcome,
    pub programs: Vec<String>,
    pub tags: Vec<String>,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub display_order: i32,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A source citation attached to an assistant message (§3 Message invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub sources: Vec<SourceRef>,
    pub created_at: DateTime<Utc>,
}

/// Per-conversation retrieval/generation settings, persisted by C13.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationContext {
    pub audience: Option<String>,
    pub section: Option<String>,
    pub writing_style_id: Option<String>,
    pub filters: Option<serde_json::Value>,
    pub working_output_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub name: Option<String>,
    pub owner_user_id: String,
    pub context: ConversationContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Draft,
    Submitted,
    Pending,
    Awarded,
    NotAwarded,
}

impl OutputStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStatus::Draft => "draft",
            OutputStatus::Submitted => "submitted",
            OutputStatus::Pending => "pending",
            OutputStatus::Awarded => "awarded",
            OutputStatus::NotAwarded => "not_awarded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(OutputStatus::Draft),
            "submitted" => Some(OutputStatus::Submitted),
            "pending" => Some(OutputStatus::Pending),
            "awarded" => Some(OutputStatus::Awarded),
            "not_awarded" => Some(OutputStatus::NotAwarded),
            _ => None,
        }
    }

    /// `draft → submitted → pending → {awarded, not_awarded}`. `awarded` and
    /// `not_awarded` are terminal (§3 Output state machine).
    pub fn can_transition_to(&self, next: OutputStatus) -> bool {
        use OutputStatus::*;
        matches!(
            (self, next),
            (Draft, Submitted) | (Submitted, Pending) | (Pending, Awarded) | (Pending, NotAwarded)
        )
    }

    /// A shortcut jumps straight to a terminal state without passing through
    /// the intermediate steps. Allowed only when the caller records a reason
    /// for the skip (§3 Output state machine, conditional shortcut).
    pub fn is_shortcut_to(&self, next: OutputStatus) -> bool {
        use OutputStatus::*;
        matches!(
            (self, next),
            (Draft, Awarded) | (Draft, NotAwarded) | (Submitted, Awarded) | (Submitted, NotAwarded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutputStatus::Awarded | OutputStatus::NotAwarded)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Output {
    pub id: String,
    pub output_type: String,
    pub title: String,
    pub content: String,
    pub word_count: i64,
    pub status: OutputStatus,
    pub writing_style_id: Option<String>,
    pub funder_name: Option<String>,
    pub requested_amount: Option<f64>,
    pub awarded_amount: Option<f64>,
    pub submission_date: Option<DateTime<Utc>>,
    pub decision_date: Option<DateTime<Utc>>,
    pub success_notes: Option<String>,
    pub status_skip_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleType {
    Grant,
    Proposal,
    Report,
    General,
}

impl StyleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StyleType::Grant => "grant",
            StyleType::Proposal => "proposal",
            StyleType::Report => "report",
            StyleType::General => "general",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grant" => Some(StyleType::Grant),
            "proposal" => Some(StyleType::Proposal),
            "report" => Some(StyleType::Report),
            "general" => Some(StyleType::General),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WritingStyle {
    pub id: String,
    pub name: String,
    pub style_type: StyleType,
    pub description: Option<String>,
    pub prompt_content: String,
    pub samples: Vec<String>,
    pub analysis_metadata: serde_json::Value,
    pub active: bool,
}
