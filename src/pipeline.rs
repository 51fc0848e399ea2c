//! The orchestrator: runs the phases in order over one project, checkpoints
//! between them, and always hands back a project record.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::convergence;
use crate::error::AgentError;
use crate::generation::GenerationUnit;
use crate::phases::expand::{self, Selection};
use crate::phases::{self, PhaseContext, PhaseOutcome};
use crate::progress::{ProgressReporter, TracingProgress};
use crate::project::{BookBrief, PipelinePhase, Project, ProjectStatus};
use crate::publish::Publisher;
use crate::quality;
use crate::store::ProjectStore;

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    unit: GenerationUnit,
    progress: Arc<dyn ProgressReporter>,
    publisher: Publisher,
    store: Option<Arc<dyn ProjectStore>>,
    out_dir: PathBuf,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Renders the formats named in `config` into `out_dir`.
    pub fn new(config: PipelineConfig, unit: GenerationUnit, out_dir: impl Into<PathBuf>) -> Self {
        let publisher = Publisher::for_formats(&config.formats);
        Self {
            config: Arc::new(config),
            unit,
            progress: Arc::new(TracingProgress),
            publisher,
            store: None,
            out_dir: out_dir.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = publisher;
        self
    }

    /// Checkpoints the project after every phase.
    pub fn with_store(mut self, store: Arc<dyn ProjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts a new project from `brief`. Only an invalid brief is an error;
    /// everything after that is reported through the returned project.
    pub async fn generate(&self, brief: BookBrief) -> anyhow::Result<Project> {
        brief.validate().context("validate brief")?;
        let project = Project::new(brief, self.config.words_per_page);
        tracing::info!(
            project_id = %project.id,
            title = %project.brief.title,
            target_pages = project.brief.target_pages,
            target_words = project.manuscript.target_words(),
            generator = self.unit.primary_name(),
            "starting book generation"
        );
        Ok(self.run_project(project).await)
    }

    /// Continues from the phase that was running when the project stopped.
    /// Work already done is skipped by the phases themselves.
    pub async fn resume(&self, project: Project) -> Project {
        if project.status == ProjectStatus::Completed {
            tracing::info!(project_id = %project.id, "project already completed; nothing to resume");
            return project;
        }
        tracing::info!(
            project_id = %project.id,
            phase = ?project.current_phase,
            completion = format!("{:.1}", project.manuscript.completion()),
            "resuming project"
        );
        self.run_project(project).await
    }

    async fn run_project(&self, mut project: Project) -> Project {
        let start = project.current_phase.unwrap_or(PipelinePhase::Structure);
        project.status = ProjectStatus::Running;
        project.finished_at = None;

        match self.drive(&mut project, start).await {
            Ok(()) => {
                project.status = ProjectStatus::Completed;
                project.progress_percent = 100;
                tracing::info!(
                    project_id = %project.id,
                    words = project.manuscript.actual_words(),
                    completion = format!("{:.1}", project.manuscript.completion()),
                    expansion_rounds = project.expansion_rounds,
                    outputs = project.output_files.len(),
                    warnings = project.completed_with_warnings(),
                    "book generation completed"
                );
                self.progress.report("completed", 100);
            }
            Err(err) => {
                let (phase, recoverable) = match err.downcast_ref::<AgentError>() {
                    Some(agent) => (Some(agent.phase), agent.recoverable),
                    None => (project.current_phase, false),
                };
                tracing::error!(
                    project_id = %project.id,
                    phase = ?phase,
                    recoverable,
                    error = %format!("{err:#}"),
                    "book generation failed"
                );
                project.status = ProjectStatus::Failed;
                project.record_error(
                    phase,
                    format!("{err:#}"),
                    recoverable,
                    self.config.error_log_capacity,
                );
            }
        }

        project.finished_at = Some(Utc::now());
        if let Err(err) = self.checkpoint(&mut project).await {
            tracing::warn!(project_id = %project.id, error = %format!("{err:#}"), "final checkpoint failed");
        }
        project
    }

    async fn drive(&self, project: &mut Project, start: PipelinePhase) -> anyhow::Result<()> {
        let ctx = PhaseContext::new(
            self.unit.clone(),
            Arc::clone(&self.config),
            Arc::new(project.brief.clone()),
            Arc::clone(&self.progress),
        );

        let mut next = Some(start);
        while let Some(phase) = next {
            if self.cancel.is_cancelled() {
                return Err(AgentError {
                    phase,
                    message: format!("cancelled before {phase} phase"),
                    recoverable: true,
                }
                .into());
            }

            project.current_phase = Some(phase);
            let (band_start, band_end) = phase.progress_band();
            project.progress_percent = band_start;
            self.progress.report(&format!("{phase} phase starting"), band_start);
            self.checkpoint(project).await?;

            let started_at = std::time::Instant::now();
            let outcome = self.run_phase(&ctx, project, phase).await?;
            tracing::info!(
                phase = %phase,
                processed = outcome.processed,
                skipped = outcome.skipped,
                warnings = outcome.warnings.len(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                completion = format!("{:.1}", project.manuscript.completion()),
                "phase finished"
            );
            self.record_warnings(project, phase, &outcome.warnings);

            project.progress_percent = band_end;
            next = phase.next();
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        ctx: &PhaseContext,
        project: &mut Project,
        phase: PipelinePhase,
    ) -> anyhow::Result<PhaseOutcome> {
        match phase {
            PipelinePhase::Structure => phases::structure::run(ctx, &mut project.manuscript).await,
            PipelinePhase::Outline => phases::outline::run(ctx, &mut project.manuscript).await,
            PipelinePhase::Write => phases::write::run(ctx, &mut project.manuscript).await,
            PipelinePhase::Expand => {
                let budget = self
                    .config
                    .max_total_expansion_rounds
                    .saturating_sub(project.expansion_rounds);
                let report =
                    convergence::converge(ctx, &mut project.manuscript, budget, &self.cancel)
                        .await?;
                project.expansion_rounds += report.rounds;
                if let Some(limit) = report.limit {
                    project.record_error(
                        Some(phase),
                        limit.to_string(),
                        true,
                        self.config.error_log_capacity,
                    );
                }
                Ok(report.outcome)
            }
            PipelinePhase::Enrich => phases::enrich::run(ctx, &mut project.manuscript).await,
            PipelinePhase::Matter => phases::matter::run(ctx, &mut project.manuscript).await,
            PipelinePhase::Edit => phases::edit::run(ctx, &mut project.manuscript).await,
            PipelinePhase::QualityGate => self.quality_gate(ctx, project).await,
            PipelinePhase::Publish => self.publish(project).await,
        }
    }

    /// Evaluates the gate. A word count below the band buys exactly one more
    /// expansion round, a polish of what it touched, and a re-evaluation.
    async fn quality_gate(
        &self,
        ctx: &PhaseContext,
        project: &mut Project,
    ) -> anyhow::Result<PhaseOutcome> {
        let mut outcome = PhaseOutcome::default();
        let report = quality::evaluate(&project.manuscript, &self.config.quality);
        let retry = report.word_count_failed();
        let over_target = report.completion > self.config.quality.max_total_completion;
        self.record_gate(project, report);
        if !retry {
            return Ok(outcome);
        }
        if over_target {
            // Expansion only adds words.
            tracing::info!(
                completion = format!("{:.1}", project.manuscript.completion()),
                max = self.config.quality.max_total_completion,
                "word count above target band; skipping the extra expansion round"
            );
            return Ok(outcome);
        }

        let eligible = expand::eligible_count(&project.manuscript, Selection::BelowComplete);
        tracing::info!(
            eligible,
            completion = format!("{:.1}", project.manuscript.completion()),
            "word count outside target band; running one more expansion round"
        );
        if eligible > 0 {
            let round =
                expand::run_round(ctx, &mut project.manuscript, Selection::BelowComplete).await?;
            project.expansion_rounds += 1;
            outcome.absorb(round);
            outcome.absorb(phases::edit::run(ctx, &mut project.manuscript).await?);
        }

        let report = quality::evaluate(&project.manuscript, &self.config.quality);
        self.record_gate(project, report);
        Ok(outcome)
    }

    fn record_gate(&self, project: &mut Project, report: quality::QualityReport) {
        if let Some(err) = report.to_error() {
            tracing::warn!(
                error = %err,
                issues = ?err.issues,
                "quality gate reported issues"
            );
            project.record_error(
                Some(PipelinePhase::QualityGate),
                format!("{err}: {}", err.issues.join("; ")),
                true,
                self.config.error_log_capacity,
            );
        }
        project.quality_history.push(report);
    }

    async fn publish(&self, project: &mut Project) -> anyhow::Result<PhaseOutcome> {
        let publisher = self.publisher.clone();
        let manuscript = project.manuscript.clone();
        let out_dir = self.out_dir.clone();
        let report = tokio::task::spawn_blocking(move || publisher.publish(&manuscript, &out_dir))
            .await
            .context("join publish task")?;

        let mut outcome = PhaseOutcome::default();
        for failure in &report.failures {
            project.record_error(
                Some(PipelinePhase::Publish),
                failure.to_string(),
                true,
                self.config.error_log_capacity,
            );
            outcome.skipped += 1;
        }
        outcome.processed = report.files.len();
        project.output_files.extend(report.files);

        if outcome.processed == 0 && !report.failures.is_empty() {
            return Err(AgentError {
                phase: PipelinePhase::Publish,
                message: "every output format failed to render".to_owned(),
                recoverable: true,
            }
            .into());
        }
        Ok(outcome)
    }

    fn record_warnings(&self, project: &mut Project, phase: PipelinePhase, warnings: &[String]) {
        for warning in warnings {
            project.record_error(
                Some(phase),
                warning.clone(),
                true,
                self.config.error_log_capacity,
            );
        }
    }

    async fn checkpoint(&self, project: &mut Project) -> anyhow::Result<()> {
        project.updated_at = Utc::now();
        if let Some(store) = &self.store {
            store.save(project).await.context("checkpoint project")?;
        }
        Ok(())
    }
}
