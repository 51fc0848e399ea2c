use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use pagewright::cli::{Cli, Command};
use pagewright::commands;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    pagewright::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        Command::Generate(args) => commands::generate(args).await.context("generate")?,
        Command::Resume(args) => commands::resume(args).await.context("resume")?,
        Command::Plan(args) => commands::plan(args).context("plan")?,
        Command::Gate(args) => commands::gate(args).await.context("gate")?,
        Command::Render(args) => commands::render(args).await.context("render")?,
    }

    Ok(())
}
