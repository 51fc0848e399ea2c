use std::collections::HashMap;

use crate::generation::{GenerationRequest, length_directive};
use crate::manuscript::{Manuscript, Section, SectionStatus};
use crate::parse::strip_code_fence;
use crate::phases::{PhaseContext, PhaseOutcome, UnitResult, fan_out, settle};
use crate::project::PipelinePhase;

const PHASE: PipelinePhase = PipelinePhase::Write;

/// Drafts every section that is not yet written. Written and complete
/// sections cost no generation calls.
pub async fn run(
    ctx: &PhaseContext,
    manuscript: &mut Manuscript,
) -> anyhow::Result<PhaseOutcome> {
    let chapter_titles = manuscript
        .all_chapters()
        .into_iter()
        .map(|c| (c.id.clone(), c.title.clone()))
        .collect::<HashMap<_, _>>();

    let (todo, done): (Vec<_>, Vec<_>) = manuscript
        .take_sections()
        .into_iter()
        .partition(|s| !s.status.is_written());
    let mut outcome = PhaseOutcome {
        skipped: done.len(),
        ..PhaseOutcome::default()
    };
    tracing::info!(sections = todo.len(), skipped = done.len(), "write phase");

    let results = fan_out(
        ctx.progress.as_ref(),
        PHASE,
        ctx.config.concurrency,
        todo,
        |section| {
            let ctx = ctx.clone();
            let chapter_title = chapter_titles
                .get(&section.chapter_id)
                .cloned()
                .unwrap_or_default();
            async move { write_section(&ctx, section, &chapter_title).await }
        },
    )
    .await;

    let (mut sections, first_error) = settle(results, &mut outcome);
    sections.extend(done);
    manuscript.restore_sections(sections)?;

    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(outcome),
    }
}

async fn write_section(
    ctx: &PhaseContext,
    mut section: Section,
    chapter_title: &str,
) -> UnitResult<Section> {
    section.status = SectionStatus::Writing;
    let request = GenerationRequest::new(
        ctx.system_prompt("a skilled nonfiction author"),
        write_prompt(ctx, &section, chapter_title),
    )
    .max_tokens(ctx.config.generation.tokens_for_words(section.target_words))
    .temperature(ctx.config.generation.write_temperature);

    let text = match ctx.unit.generate(PHASE, &request).await {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(section_id = %section.id, error = %err, "write failed");
            section.status = SectionStatus::Failed;
            return UnitResult::failed(section, err);
        }
    };

    section.content = strip_code_fence(&text).to_owned();
    let words = section.word_count();
    section.status = if words.needs_expansion() {
        SectionStatus::NeedsExpansion
    } else {
        SectionStatus::Written
    };
    tracing::debug!(
        section_id = %section.id,
        words = words.actual,
        target = words.target,
        status = ?section.status,
        "section written"
    );
    UnitResult::ok(section)
}

fn write_prompt(ctx: &PhaseContext, section: &Section, chapter_title: &str) -> String {
    let mut outline = String::new();
    for (idx, point) in section.outline.iter().enumerate() {
        outline.push_str(&format!(
            "{}. {} (~{} words)\n",
            idx + 1,
            point.content,
            point.target_words
        ));
        if let Some(notes) = point.notes.as_deref() {
            outline.push_str(&format!("   Notes: {notes}\n"));
        }
    }
    if outline.is_empty() {
        outline.push_str("(no outline; cover the section title thoroughly)\n");
    }

    format!(
        "{book}\n\
Chapter: {chapter_title}\n\
Section: {title}\n\
Section summary: {summary}\n\n\
Outline:\n{outline}\n\
Write the full text of this section as Markdown prose. Do not repeat the section title as a heading.\n\
{length}\n",
        book = ctx.book_context(),
        title = section.title,
        summary = section.outline_summary,
        length = length_directive(section.target_words),
    )
}
