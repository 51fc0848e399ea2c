use anyhow::Context as _;
use chrono::Datelike as _;

use crate::generation::GenerationRequest;
use crate::manuscript::Manuscript;
use crate::phases::{PhaseContext, PhaseOutcome};
use crate::project::PipelinePhase;
use crate::structure::{self, ProposedStructure, StructureParams, StructurePlan};

const PHASE: PipelinePhase = PipelinePhase::Structure;

/// Lays out the skeleton once per project. A populated manuscript is left alone.
pub async fn run(
    ctx: &PhaseContext,
    manuscript: &mut Manuscript,
) -> anyhow::Result<PhaseOutcome> {
    if manuscript.is_populated() {
        tracing::info!(
            parts = manuscript.parts.len(),
            chapters = manuscript.chapter_count(),
            sections = manuscript.section_count(),
            "structure already in place; skipping"
        );
        return Ok(PhaseOutcome {
            skipped: 1,
            ..PhaseOutcome::default()
        });
    }

    let params = StructureParams::from_config(manuscript.target_pages, &ctx.config);
    let plan = structure::calculate(&params).context("calculate structure")?;
    tracing::info!(
        content_words = plan.content_words,
        sections = plan.effective_sections(),
        chapters = plan.total_chapters,
        parts = plan.num_parts,
        words_per_section = plan.words_per_section(),
        "structure calculated"
    );

    let request = GenerationRequest::new(
        ctx.system_prompt("an experienced book architect"),
        proposal_prompt(ctx, &plan)?,
    )
    .max_tokens(ctx.config.generation.max_tokens_cap)
    .temperature(ctx.config.generation.outline_temperature);
    let raw = ctx.unit.generate(PHASE, &request).await?;

    let mut outcome = PhaseOutcome {
        processed: 1,
        ..PhaseOutcome::default()
    };
    let proposal = match structure::parse_proposal(&raw) {
        Ok(proposal) => Some(proposal),
        Err(raw) => {
            tracing::warn!(
                reply_chars = raw.as_str().len(),
                "title proposal was not valid JSON; using numbered titles"
            );
            outcome
                .warnings
                .push("structure proposal unparseable; generic titles used".to_owned());
            None
        }
    };

    manuscript.parts = structure::build_skeleton(
        &plan,
        proposal.as_ref(),
        ctx.config.max_expansion_attempts,
    );
    let (front, back) = structure::build_matter(
        &plan,
        &manuscript.title,
        manuscript.subtitle.as_deref(),
        chrono::Utc::now().year(),
    );
    manuscript.front_matter = front;
    manuscript.back_matter = back;

    ctx.progress
        .report("structure: skeleton ready", PHASE.progress_band().1);
    Ok(outcome)
}

fn proposal_prompt(ctx: &PhaseContext, plan: &StructurePlan) -> anyhow::Result<String> {
    let template = serde_json::to_string_pretty(&ProposedStructure::blank(plan))
        .context("serialize structure template")?;
    Ok(format!(
        "{book}\n\
Propose titles for every part, chapter and section of this book.\n\
The layout is fixed: {parts} part(s), {chapters} chapter(s), {sections} section(s).\n\
Fill in every empty title in the JSON below without adding or removing entries.\n\
Reply with the JSON object only.\n\n{template}\n",
        book = ctx.book_context(),
        parts = plan.num_parts,
        chapters = plan.total_chapters,
        sections = plan.effective_sections(),
    ))
}
