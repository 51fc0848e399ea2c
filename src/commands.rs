//! Command handlers behind the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use crate::cli::{Engine, EngineArgs, GateArgs, GenerateArgs, PlanArgs, RenderArgs, ResumeArgs};
use crate::config::PipelineConfig;
use crate::generation::{CommandGenerator, GenerationUnit, NoopGenerator, TextGenerator};
use crate::openai::OpenAiGenerator;
use crate::pipeline::Pipeline;
use crate::project::{BookBrief, Project, ProjectStatus};
use crate::publish::Publisher;
use crate::quality;
use crate::store::LocalFsProjectStore;
use crate::structure::{self, StructureParams};

pub async fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref(), &args.formats)?;
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
        config.validate()?;
    }
    let brief = BookBrief {
        title: args.title,
        subtitle: args.subtitle,
        description: args.description,
        target_pages: args.pages,
        genre: args.genre,
        audience: args.audience,
    };

    let out_dir = PathBuf::from(&args.out);
    let store = LocalFsProjectStore::new(&out_dir);
    if store.project_path().exists() {
        anyhow::bail!(
            "project already exists: {} (use `resume`)",
            store.project_path().display()
        );
    }

    let pipeline = build_pipeline(config, &args.engine, store)?;
    let project = pipeline.generate(brief).await?;
    finish(&project, &out_dir)
}

pub async fn resume(args: ResumeArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref(), &args.formats)?;
    let out_dir = PathBuf::from(&args.project);
    let store = LocalFsProjectStore::new(&out_dir);
    let project = store.load_existing().await.context("load project")?;

    let pipeline = build_pipeline(config, &args.engine, store)?;
    let project = pipeline.resume(project).await;
    finish(&project, &out_dir)
}

pub fn plan(args: PlanArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::load_or_default(args.config.as_deref().map(Path::new))?;
    let plan = structure::calculate(&StructureParams::from_config(args.pages, &config))
        .context("calculate structure")?;
    let summary = serde_json::json!({
        "target_pages": args.pages,
        "content_words": plan.content_words,
        "total_sections": plan.effective_sections(),
        "total_chapters": plan.total_chapters,
        "num_parts": plan.num_parts,
        "chapters_per_part": plan.chapters_per_part,
        "words_per_section": plan.words_per_section(),
        "front_matter_words": plan.front_matter_words,
        "back_matter_words": plan.back_matter_words,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

pub async fn gate(args: GateArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::load_or_default(args.config.as_deref().map(Path::new))?;
    let project = LocalFsProjectStore::new(&args.project)
        .load_existing()
        .await
        .context("load project")?;

    let report = quality::evaluate(&project.manuscript, &config.quality);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if args.strict
        && let Some(err) = report.to_error()
    {
        return Err(err.into());
    }
    Ok(())
}

pub async fn render(args: RenderArgs) -> anyhow::Result<()> {
    let store = LocalFsProjectStore::new(&args.project);
    let project = store.load_existing().await.context("load project")?;
    let out_dir = args
        .out
        .map(PathBuf::from)
        .unwrap_or_else(|| store.dir().to_path_buf());

    let publisher = Publisher::for_formats(&args.formats);
    let manuscript = project.manuscript;
    let report = tokio::task::spawn_blocking(move || publisher.publish(&manuscript, &out_dir))
        .await
        .context("join render task")?;

    for (format, path) in &report.files {
        println!("{format}: {}", path.display());
    }
    if let Some(first) = report.failures.into_iter().next() {
        return Err(first.into());
    }
    Ok(())
}

fn load_config(
    path: Option<&str>,
    formats: &[crate::publish::OutputFormat],
) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::load_or_default(path.map(Path::new))?;
    if !formats.is_empty() {
        config.formats = formats.to_vec();
    }
    Ok(config)
}

fn build_pipeline(
    config: PipelineConfig,
    engine: &EngineArgs,
    store: LocalFsProjectStore,
) -> anyhow::Result<Pipeline> {
    let primary = build_generator(engine.engine, engine.model.as_deref(), engine)
        .context("build primary generator")?;
    let fallback = engine
        .fallback_engine
        .map(|kind| build_generator(kind, engine.fallback_model.as_deref(), engine))
        .transpose()
        .context("build fallback generator")?;
    let unit = GenerationUnit::from_config(primary, fallback, &config.generation);

    let out_dir = store.dir().to_path_buf();
    let pipeline = Pipeline::new(config, unit, out_dir)
        .with_store(Arc::new(store))
        .with_cancellation(cancel_on_ctrl_c());
    Ok(pipeline)
}

fn build_generator(
    engine: Engine,
    model: Option<&str>,
    args: &EngineArgs,
) -> anyhow::Result<Arc<dyn TextGenerator>> {
    Ok(match engine {
        Engine::Noop => Arc::new(NoopGenerator),
        Engine::Command => {
            let program = args
                .command_program
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--command is required for the command engine"))?;
            Arc::new(CommandGenerator::new(program, args.command_args.clone()))
        }
        Engine::Openai => Arc::new(OpenAiGenerator::from_env(model)?),
    })
}

/// A token cancelled by the first Ctrl-C. The pipeline stops at the next
/// phase boundary.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current phase");
            token.cancel();
        }
    });
    cancel
}

fn finish(project: &Project, out_dir: &Path) -> anyhow::Result<()> {
    println!("project: {}", out_dir.join(crate::store::PROJECT_FILE).display());
    for (format, path) in &project.output_files {
        println!("{format}: {}", path.display());
    }
    if let Some(report) = project.latest_quality() {
        println!(
            "quality: {} ({} issue(s)), {:.1}% of {} words",
            if report.passed { "passed" } else { "issues" },
            report.issues.len(),
            report.completion,
            report.target_words
        );
    }

    match project.status {
        ProjectStatus::Completed => {
            println!("status: completed");
            Ok(())
        }
        status => {
            let last = project
                .errors
                .back()
                .map(|e| e.message.as_str())
                .unwrap_or("no error recorded");
            anyhow::bail!("project {} ended {status:?}: {last}", project.id)
        }
    }
}
