use clap::{Args, Parser, Subcommand};

use crate::publish::OutputFormat;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate a book from a brief.
    Generate(GenerateArgs),
    /// Continue a stopped or failed project.
    Resume(ResumeArgs),
    /// Print the calculated structure for a page target.
    Plan(PlanArgs),
    /// Re-run the quality gate on a project and print the report as JSON.
    Gate(GateArgs),
    /// Render a project's manuscript without generating anything.
    Render(RenderArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Engine {
    /// Deterministic offline filler text.
    Noop,
    /// An external program: prompt on stdin, text on stdout.
    Command,
    /// OpenAI Responses API (`OPENAI_API_KEY`).
    Openai,
}

#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Primary text generator.
    #[arg(long, value_enum, default_value_t = Engine::Noop)]
    pub engine: Engine,

    /// Model for the openai engine.
    #[arg(long)]
    pub model: Option<String>,

    /// Program run by the command engine.
    #[arg(long = "command")]
    pub command_program: Option<String>,

    /// Arguments for the command engine (after `--`).
    #[arg(last = true)]
    pub command_args: Vec<String>,

    /// Generator tried when the primary fails.
    #[arg(long, value_enum)]
    pub fallback_engine: Option<Engine>,

    /// Model for an openai fallback.
    #[arg(long)]
    pub fallback_model: Option<String>,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Book title.
    #[arg(long)]
    pub title: String,

    #[arg(long)]
    pub subtitle: Option<String>,

    /// What the book is about.
    #[arg(long)]
    pub description: String,

    /// Target page count (50 or more recommended).
    #[arg(long, default_value_t = 200)]
    pub pages: usize,

    #[arg(long, default_value = "non-fiction")]
    pub genre: String,

    #[arg(long)]
    pub audience: Option<String>,

    /// Project directory: `project.json` and rendered files go here.
    #[arg(long)]
    pub out: String,

    /// Pipeline config (YAML).
    #[arg(long)]
    pub config: Option<String>,

    /// Output format (repeatable). Defaults to the config's formats.
    #[arg(long = "format", value_enum)]
    pub formats: Vec<OutputFormat>,

    /// Concurrent generation calls per phase (overrides config).
    #[arg(long)]
    pub concurrency: Option<usize>,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Debug, Args)]
pub struct ResumeArgs {
    /// Project directory containing `project.json`.
    #[arg(long)]
    pub project: String,

    /// Pipeline config (YAML).
    #[arg(long)]
    pub config: Option<String>,

    /// Output format (repeatable). Defaults to the config's formats.
    #[arg(long = "format", value_enum)]
    pub formats: Vec<OutputFormat>,

    #[command(flatten)]
    pub engine: EngineArgs,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Target page count.
    #[arg(long)]
    pub pages: usize,

    /// Pipeline config (YAML).
    #[arg(long)]
    pub config: Option<String>,
}

#[derive(Debug, Args)]
pub struct GateArgs {
    /// Project directory containing `project.json`.
    #[arg(long)]
    pub project: String,

    /// Pipeline config (YAML).
    #[arg(long)]
    pub config: Option<String>,

    /// Exit with an error when the gate reports issues.
    #[arg(long, default_value_t = false)]
    pub strict: bool,
}

#[derive(Debug, Args)]
pub struct RenderArgs {
    /// Project directory containing `project.json`.
    #[arg(long)]
    pub project: String,

    /// Output format (repeatable).
    #[arg(long = "format", value_enum, required = true)]
    pub formats: Vec<OutputFormat>,

    /// Output directory (defaults to the project directory).
    #[arg(long)]
    pub out: Option<String>,
}
