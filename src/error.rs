use crate::project::PipelinePhase;

/// A generation call failed on every available path.
///
/// Raised when both the primary and fallback provider fail, or when a bounded
/// retry budget runs out. The phase that produced it cannot be trusted, so the
/// orchestrator treats it as fatal for the run.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{phase} phase failed: {message}")]
pub struct AgentError {
    pub phase: PipelinePhase,
    pub message: String,
    pub recoverable: bool,
}

impl AgentError {
    pub fn fatal(phase: PipelinePhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            recoverable: false,
        }
    }
}

/// The quality gate reported issues. Recorded and surfaced, never thrown.
#[derive(Debug, Clone, thiserror::Error)]
#[error("quality gate failed with {} issue(s)", issues.len())]
pub struct QualityGateFailedError {
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// The expansion loop ran out of budget with sections still below target.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "expansion budget exhausted after {rounds} round(s); {sections_below_target} section(s) below target"
)]
pub struct ExpansionLimitError {
    pub rounds: usize,
    pub sections_below_target: usize,
}

/// The requested book cannot be laid out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructureError {
    #[error(
        "target of {target_pages} pages leaves no room for content after {reserved_pages} front/back matter pages"
    )]
    NoContentPages {
        target_pages: usize,
        reserved_pages: usize,
    },
    #[error("{field} must be > 0")]
    ZeroParameter { field: &'static str },
}

/// Generated text was rejected in favour of the content already in place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("{unit}: regenerated text has {after} words, not more than {before}")]
    NotLonger {
        unit: String,
        before: usize,
        after: usize,
    },
    #[error("{unit}: edited text keeps {after} of {before} words (minimum {minimum})")]
    TooShort {
        unit: String,
        before: usize,
        after: usize,
        minimum: usize,
    },
    #[error("{unit}: enriched text has {after} words, fewer than {before}")]
    Shrunk {
        unit: String,
        before: usize,
        after: usize,
    },
}

/// A renderer could not produce its output file.
#[derive(Debug, Clone, thiserror::Error)]
#[error("render {format} failed: {reason}")]
pub struct OutputError {
    pub format: String,
    pub reason: String,
}
