use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ContentError;
use crate::generation::{GenerationRequest, length_directive};
use crate::manuscript::{Manuscript, Section, SectionStatus};
use crate::parse::strip_code_fence;
use crate::phases::{PhaseContext, PhaseOutcome, UnitResult, fan_out, settle};
use crate::project::PipelinePhase;
use crate::wordcount::{count_words, head_words, tail_words};

const PHASE: PipelinePhase = PipelinePhase::Edit;

/// Read-only continuity context for one section, captured before any edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeighborSnapshot {
    pub previous_tail: Option<String>,
    pub next_head: Option<String>,
}

/// Snapshots keyed by section id, taken across the whole book in document order.
pub fn neighbor_snapshots(
    manuscript: &Manuscript,
    context_words: usize,
) -> HashMap<String, NeighborSnapshot> {
    let sections = manuscript.all_sections();
    let excerpt = |section: Option<&&Section>, take: fn(&str, usize) -> String| {
        section
            .map(|s| take(&s.content, context_words))
            .filter(|text| !text.is_empty())
    };

    sections
        .iter()
        .enumerate()
        .map(|(idx, section)| {
            let previous = idx.checked_sub(1).and_then(|prev| sections.get(prev));
            let next = sections.get(idx + 1);
            (
                section.id.clone(),
                NeighborSnapshot {
                    previous_tail: excerpt(previous, tail_words),
                    next_head: excerpt(next, head_words),
                },
            )
        })
        .collect()
}

/// Polishes every written section that is not complete yet.
pub async fn run(
    ctx: &PhaseContext,
    manuscript: &mut Manuscript,
) -> anyhow::Result<PhaseOutcome> {
    let snapshots = Arc::new(neighbor_snapshots(
        manuscript,
        ctx.config.edit.neighbor_context_words,
    ));

    let (todo, done): (Vec<_>, Vec<_>) = manuscript
        .take_sections()
        .into_iter()
        .partition(|s| s.status != SectionStatus::Complete && !s.content.trim().is_empty());
    let mut outcome = PhaseOutcome {
        skipped: done.len(),
        ..PhaseOutcome::default()
    };
    tracing::info!(sections = todo.len(), skipped = done.len(), "edit phase");

    let results = fan_out(
        ctx.progress.as_ref(),
        PHASE,
        ctx.config.concurrency,
        todo,
        |section| {
            let ctx = ctx.clone();
            let snapshots = Arc::clone(&snapshots);
            async move {
                let snapshot = snapshots.get(&section.id).cloned().unwrap_or_default();
                edit_section(&ctx, section, &snapshot).await
            }
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

async fn edit_section(
    ctx: &PhaseContext,
    mut section: Section,
    snapshot: &NeighborSnapshot,
) -> UnitResult<Section> {
    section.status = SectionStatus::Editing;
    let before = count_words(&section.content);

    let request = GenerationRequest::new(
        ctx.system_prompt("a meticulous line editor"),
        edit_prompt(ctx, &section, snapshot, before),
    )
    .max_tokens(ctx.config.generation.tokens_for_words(before))
    .temperature(ctx.config.generation.edit_temperature);

    let text = match ctx.unit.generate(PHASE, &request).await {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(section_id = %section.id, error = %err, "edit failed");
            section.status = SectionStatus::Failed;
            return UnitResult::failed(section, err);
        }
    };

    let candidate = strip_code_fence(&text);
    let after = count_words(candidate);
    let minimum = minimum_preserved(before, ctx.config.edit.min_preserved_ratio);
    section.status = SectionStatus::Complete;

    if after < minimum {
        let err = ContentError::TooShort {
            unit: section.id.clone(),
            before,
            after,
            minimum,
        };
        tracing::warn!(section_id = %section.id, error = %err, "edit rejected; keeping original");
        return UnitResult::warn(section, err);
    }

    section.content = candidate.to_owned();
    tracing::debug!(section_id = %section.id, before, after, "section edited");
    UnitResult::ok(section)
}

/// Smallest acceptable word count for an edit of a `before`-word section.
pub fn minimum_preserved(before: usize, ratio: f64) -> usize {
    // Tolerate float noise so 100 * 0.9 stays 90.
    (before as f64 * ratio - 1e-9).ceil().max(0.0) as usize
}

fn edit_prompt(
    ctx: &PhaseContext,
    section: &Section,
    snapshot: &NeighborSnapshot,
    words: usize,
) -> String {
    let mut continuity = String::new();
    if let Some(previous) = snapshot.previous_tail.as_deref() {
        continuity.push_str(&format!("The previous section ends with: \"{previous}\"\n"));
    }
    if let Some(next) = snapshot.next_head.as_deref() {
        continuity.push_str(&format!("The next section begins with: \"{next}\"\n"));
    }

    format!(
        "{book}\n\
Section: {title}\n\
{continuity}\n\
Polish the section below for clarity, flow and consistency with its neighbors. \
Fix errors and smooth transitions, but keep its length, structure and every point it makes. \
Return the full edited section.\n\n\
{content}\n\n\
{length}\n",
        book = ctx.book_context(),
        title = section.title,
        content = section.content,
        length = length_directive(words),
    )
}
