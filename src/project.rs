use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manuscript::Manuscript;
use crate::quality::QualityReport;

pub const RECOMMENDED_MIN_PAGES: usize = 50;

/// The pipeline's phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Structure,
    Outline,
    Write,
    Expand,
    Enrich,
    Matter,
    Edit,
    QualityGate,
    Publish,
}

impl PipelinePhase {
    pub const ALL: [PipelinePhase; 9] = [
        Self::Structure,
        Self::Outline,
        Self::Write,
        Self::Expand,
        Self::Enrich,
        Self::Matter,
        Self::Edit,
        Self::QualityGate,
        Self::Publish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Structure => "structure",
            Self::Outline => "outline",
            Self::Write => "write",
            Self::Expand => "expand",
            Self::Enrich => "enrich",
            Self::Matter => "matter",
            Self::Edit => "edit",
            Self::QualityGate => "quality_gate",
            Self::Publish => "publish",
        }
    }

    pub fn next(self) -> Option<Self> {
        let idx = Self::ALL.iter().position(|p| *p == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Progress percentage band `[start, end)` owned by this phase.
    pub fn progress_band(self) -> (u8, u8) {
        match self {
            Self::Structure => (0, 5),
            Self::Outline => (5, 15),
            Self::Write => (15, 45),
            Self::Expand => (45, 60),
            Self::Enrich => (60, 70),
            Self::Matter => (70, 75),
            Self::Edit => (75, 90),
            Self::QualityGate => (90, 95),
            Self::Publish => (95, 100),
        }
    }

    /// Interpolates a percentage inside this phase's band.
    pub fn progress_at(self, done: usize, total: usize) -> u8 {
        let (start, end) = self.progress_band();
        if total == 0 {
            return end;
        }
        let span = f64::from(end - start);
        let fraction = done.min(total) as f64 / total as f64;
        start + (span * fraction).round() as u8
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookBrief {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub description: String,
    pub target_pages: usize,
    pub genre: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl BookBrief {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.title.trim().is_empty() {
            anyhow::bail!("brief title is empty");
        }
        if self.description.trim().is_empty() {
            anyhow::bail!("brief description is empty");
        }
        if self.target_pages == 0 {
            anyhow::bail!("brief target_pages must be > 0");
        }
        if self.target_pages < RECOMMENDED_MIN_PAGES {
            tracing::warn!(
                target_pages = self.target_pages,
                recommended_min = RECOMMENDED_MIN_PAGES,
                "target page count is below the recommended minimum"
            );
        }
        Ok(())
    }

    pub fn audience_or_default(&self) -> &str {
        self.audience.as_deref().unwrap_or("general readers")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PipelinePhase>,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub brief: BookBrief,
    pub manuscript: Manuscript,
    pub status: ProjectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PipelinePhase>,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub quality_history: Vec<QualityReport>,
    #[serde(default)]
    pub expansion_rounds: usize,
    #[serde(default)]
    pub output_files: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub errors: VecDeque<ErrorLogEntry>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(brief: BookBrief, words_per_page: usize) -> Self {
        let now = Utc::now();
        let manuscript = Manuscript::new(
            brief.title.clone(),
            brief.subtitle.clone(),
            brief.target_pages,
            words_per_page,
        );
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            brief,
            manuscript,
            status: ProjectStatus::Created,
            current_phase: None,
            progress_percent: 0,
            quality_history: Vec::new(),
            expansion_rounds: 0,
            output_files: BTreeMap::new(),
            errors: VecDeque::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Appends to the error log, dropping the oldest entries beyond `capacity`.
    pub fn record_error(
        &mut self,
        phase: Option<PipelinePhase>,
        message: impl Into<String>,
        recoverable: bool,
        capacity: usize,
    ) {
        self.errors.push_back(ErrorLogEntry {
            at: Utc::now(),
            phase,
            message: message.into(),
            recoverable,
        });
        while self.errors.len() > capacity.max(1) {
            self.errors.pop_front();
        }
        self.updated_at = Utc::now();
    }

    pub fn latest_quality(&self) -> Option<&QualityReport> {
        self.quality_history.last()
    }

    /// Completed, but the last gate evaluation reported issues.
    pub fn completed_with_warnings(&self) -> bool {
        self.status == ProjectStatus::Completed
            && self.latest_quality().is_some_and(|report| !report.passed)
    }
}
