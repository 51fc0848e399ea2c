use crate::error::ContentError;
use crate::generation::{GenerationRequest, length_directive};
use crate::manuscript::{Manuscript, Section, SectionStatus};
use crate::parse::strip_code_fence;
use crate::phases::{PhaseContext, PhaseOutcome, UnitResult, fan_out, settle};
use crate::project::PipelinePhase;
use crate::wordcount::count_words;

const PHASE: PipelinePhase = PipelinePhase::Expand;

/// Which sections a round picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Below the expansion threshold with attempts left.
    NeedsExpansion,
    /// Below the completion threshold with attempts left. Used for the extra
    /// round after a failed word-count gate.
    BelowComplete,
}

impl Selection {
    pub fn matches(self, section: &Section) -> bool {
        match self {
            Self::NeedsExpansion => section.is_expandable(),
            Self::BelowComplete => !section.word_count().is_complete() && section.attempts_left(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionStrategy {
    DetailedExample,
    StepByStep,
    DataOrQuote,
    Context,
    Transitions,
}

impl ExpansionStrategy {
    pub fn instruction(self) -> &'static str {
        match self {
            Self::DetailedExample => {
                "Add a detailed, concrete example or case study that illustrates the main point."
            }
            Self::StepByStep => "Add a step-by-step explanation of the key process or idea.",
            Self::DataOrQuote => "Add supporting data, research findings or an expert quote.",
            Self::Context => "Add background context explaining why this matters.",
            Self::Transitions => "Strengthen transitions so the section reads as one flow.",
        }
    }
}

/// Strategies are additive: the further from target, the more get applied.
pub fn select_strategies(words_needed: usize) -> Vec<ExpansionStrategy> {
    let mut strategies = Vec::new();
    if words_needed >= 500 {
        strategies.push(ExpansionStrategy::DetailedExample);
    }
    if words_needed >= 300 {
        strategies.push(ExpansionStrategy::StepByStep);
    }
    if words_needed >= 200 {
        strategies.push(ExpansionStrategy::DataOrQuote);
    }
    if words_needed >= 100 {
        strategies.push(ExpansionStrategy::Context);
    }
    strategies.push(ExpansionStrategy::Transitions);
    strategies
}

pub fn eligible_count(manuscript: &Manuscript, selection: Selection) -> usize {
    manuscript
        .all_sections()
        .into_iter()
        .filter(|s| selection.matches(s))
        .count()
}

/// Runs one expansion round over the sections `selection` picks.
pub async fn run_round(
    ctx: &PhaseContext,
    manuscript: &mut Manuscript,
    selection: Selection,
) -> anyhow::Result<PhaseOutcome> {
    let (todo, rest): (Vec<_>, Vec<_>) = manuscript
        .take_sections()
        .into_iter()
        .partition(|s| selection.matches(s));
    let mut outcome = PhaseOutcome {
        skipped: rest.len(),
        ..PhaseOutcome::default()
    };
    tracing::info!(sections = todo.len(), ?selection, "expansion round");

    let results = fan_out(
        ctx.progress.as_ref(),
        PHASE,
        ctx.config.concurrency,
        todo,
        |section| {
            let ctx = ctx.clone();
            async move { expand_section(&ctx, section).await }
        },
    )
    .await;

    let (mut sections, first_error) = settle(results, &mut outcome);
    sections.extend(rest);
    manuscript.restore_sections(sections)?;

    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(outcome),
    }
}

async fn expand_section(ctx: &PhaseContext, mut section: Section) -> UnitResult<Section> {
    section.expansion_attempts += 1;
    section.status = SectionStatus::Expanding;

    let before = section.word_count();
    let words_needed = before.remaining();
    let strategies = select_strategies(words_needed);

    let request = GenerationRequest::new(
        ctx.system_prompt("a skilled nonfiction author expanding a draft"),
        expand_prompt(ctx, &section, words_needed, &strategies),
    )
    .max_tokens(ctx.config.generation.tokens_for_words(section.target_words))
    .temperature(ctx.config.generation.expand_temperature);

    let text = match ctx.unit.generate(PHASE, &request).await {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(section_id = %section.id, error = %err, "expansion failed");
            section.status = SectionStatus::Failed;
            return UnitResult::failed(section, err);
        }
    };

    let candidate = strip_code_fence(&text);
    let after = count_words(candidate);
    let warning = if after > before.actual {
        section.content = candidate.to_owned();
        None
    } else {
        let err = ContentError::NotLonger {
            unit: section.id.clone(),
            before: before.actual,
            after,
        };
        tracing::warn!(section_id = %section.id, error = %err, "expansion rejected");
        Some(err)
    };

    let words = section.word_count();
    section.status = if words.is_complete() || !section.attempts_left() {
        SectionStatus::Written
    } else {
        SectionStatus::NeedsExpansion
    };
    tracing::debug!(
        section_id = %section.id,
        attempt = section.expansion_attempts,
        before = before.actual,
        after = words.actual,
        target = words.target,
        "section expanded"
    );

    match warning {
        Some(err) => UnitResult::warn(section, err),
        None => UnitResult::ok(section),
    }
}

fn expand_prompt(
    ctx: &PhaseContext,
    section: &Section,
    words_needed: usize,
    strategies: &[ExpansionStrategy],
) -> String {
    let instructions = strategies
        .iter()
        .map(|s| format!("- {}", s.instruction()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{book}\n\
Section: {title}\n\n\
The current draft is about {needed} words short of its {target}-word target.\n\
Rewrite the section in full, keeping everything that is already there and expanding it:\n\
{instructions}\n\n\
Current draft:\n{content}\n\n\
{length}\n",
        book = ctx.book_context(),
        title = section.title,
        needed = words_needed,
        target = section.target_words,
        content = section.content,
        length = length_directive(section.target_words.max(count_words(&section.content))),
    )
}
