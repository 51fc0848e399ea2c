use crate::generation::{GenerationRequest, length_directive};
use crate::manuscript::{Manuscript, MatterKind, MatterRecord, Part};
use crate::parse::strip_code_fence;
use crate::phases::{PhaseContext, PhaseOutcome, UnitResult, fan_out, settle};
use crate::project::PipelinePhase;

const PHASE: PipelinePhase = PipelinePhase::Matter;
pub const PART_INTRODUCTION_WORDS: usize = 200;

#[derive(Clone)]
enum MatterUnit {
    Front(MatterRecord),
    Back(MatterRecord),
    Part(Part),
}

impl MatterUnit {
    fn needs_generation(&self) -> bool {
        match self {
            Self::Front(record) | Self::Back(record) => {
                record.kind.is_generated() && !record.is_present()
            }
            Self::Part(part) => part
                .introduction
                .as_deref()
                .is_none_or(|intro| intro.trim().is_empty()),
        }
    }
}

/// Writes the preface, introduction, conclusion, resources and part
/// introductions that are still missing.
pub async fn run(
    ctx: &PhaseContext,
    manuscript: &mut Manuscript,
) -> anyhow::Result<PhaseOutcome> {
    let contents = table_of_contents(manuscript);

    let units = std::mem::take(&mut manuscript.front_matter)
        .into_iter()
        .map(MatterUnit::Front)
        .chain(
            std::mem::take(&mut manuscript.back_matter)
                .into_iter()
                .map(MatterUnit::Back),
        )
        .chain(std::mem::take(&mut manuscript.parts).into_iter().map(MatterUnit::Part))
        .collect::<Vec<_>>();
    let (todo, done): (Vec<_>, Vec<_>) = units.into_iter().partition(MatterUnit::needs_generation);
    let mut outcome = PhaseOutcome {
        skipped: done.len(),
        ..PhaseOutcome::default()
    };
    tracing::info!(units = todo.len(), skipped = done.len(), "matter phase");

    let results = fan_out(
        ctx.progress.as_ref(),
        PHASE,
        ctx.config.concurrency,
        todo,
        |unit| {
            let ctx = ctx.clone();
            let contents = contents.clone();
            async move { write_matter(&ctx, unit, &contents).await }
        },
    )
    .await;

    let (mut units, first_error) = settle(results, &mut outcome);
    units.extend(done);
    put_back(manuscript, units);

    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(outcome),
    }
}

fn put_back(manuscript: &mut Manuscript, units: Vec<MatterUnit>) {
    for unit in units {
        match unit {
            MatterUnit::Front(record) => manuscript.front_matter.push(record),
            MatterUnit::Back(record) => manuscript.back_matter.push(record),
            MatterUnit::Part(part) => manuscript.parts.push(part),
        }
    }
    manuscript.front_matter.sort_by_key(|r| matter_order(r.kind));
    manuscript.back_matter.sort_by_key(|r| matter_order(r.kind));
    manuscript.parts.sort_by_key(|p| p.ordinal);
}

fn matter_order(kind: MatterKind) -> u8 {
    match kind {
        MatterKind::TitlePage => 0,
        MatterKind::Copyright => 1,
        MatterKind::Preface => 2,
        MatterKind::Introduction => 3,
        MatterKind::Conclusion => 4,
        MatterKind::Resources => 5,
    }
}

fn table_of_contents(manuscript: &Manuscript) -> String {
    let mut contents = String::new();
    for part in &manuscript.parts {
        contents.push_str(&format!("{}\n", part.title));
        for chapter in &part.chapters {
            contents.push_str(&format!("  - {}\n", chapter.title));
        }
    }
    contents
}

async fn write_matter(
    ctx: &PhaseContext,
    unit: MatterUnit,
    contents: &str,
) -> UnitResult<MatterUnit> {
    let (label, instructions, words) = match &unit {
        MatterUnit::Front(record) | MatterUnit::Back(record) => (
            record.title.clone(),
            matter_instructions(record.kind).to_owned(),
            record.target_words,
        ),
        MatterUnit::Part(part) => {
            let chapters = part
                .chapters
                .iter()
                .map(|c| c.title.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            (
                part.title.clone(),
                format!(
                    "Write the introduction to the part \"{}\". Preview its chapters ({chapters}) \
and explain how they fit together.",
                    part.title
                ),
                PART_INTRODUCTION_WORDS,
            )
        }
    };

    let prompt = format!(
        "{book}\n\
Table of contents:\n{contents}\n\
{instructions}\n\
{length}\n",
        book = ctx.book_context(),
        length = length_directive(words),
    );
    let request = GenerationRequest::new(ctx.system_prompt("a skilled nonfiction author"), prompt)
        .max_tokens(ctx.config.generation.tokens_for_words(words))
        .temperature(ctx.config.generation.write_temperature);

    let text = match ctx.unit.generate(PHASE, &request).await {
        Ok(text) => strip_code_fence(&text).to_owned(),
        Err(err) => {
            tracing::error!(unit = %label, error = %err, "matter failed");
            return UnitResult::failed(unit, err);
        }
    };
    tracing::debug!(unit = %label, words = crate::wordcount::count_words(&text), "matter written");

    let unit = match unit {
        MatterUnit::Front(mut record) => {
            record.content = text;
            MatterUnit::Front(record)
        }
        MatterUnit::Back(mut record) => {
            record.content = text;
            MatterUnit::Back(record)
        }
        MatterUnit::Part(mut part) => {
            part.introduction = Some(text);
            MatterUnit::Part(part)
        }
    };
    UnitResult::ok(unit)
}

fn matter_instructions(kind: MatterKind) -> &'static str {
    match kind {
        MatterKind::Preface => {
            "Write the preface: why the author wrote this book and who it is for."
        }
        MatterKind::Introduction => {
            "Write the book's introduction: the problem it addresses, how it is organized, \
and how to read it."
        }
        MatterKind::Conclusion => {
            "Write the conclusion: draw the book's threads together and suggest next steps."
        }
        MatterKind::Resources => {
            "Write a resources and further reading section: annotated suggestions grouped by topic."
        }
        MatterKind::TitlePage | MatterKind::Copyright => "Write this page.",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::manuscript::tests::sample_manuscript;
    use crate::phases::tests::{context_with, counting, noop_context, words};
    use crate::structure::{self, StructureParams};
    use crate::wordcount::count_words;

    fn with_matter() -> anyhow::Result<Manuscript> {
        let mut manuscript = sample_manuscript();
        let plan = structure::calculate(&StructureParams::from_config(
            50,
            &crate::config::PipelineConfig::default(),
        ))?;
        let (front, back) = structure::build_matter(&plan, "Sample", None, 2026);
        manuscript.front_matter = front;
        manuscript.back_matter = back;
        Ok(manuscript)
    }

    #[tokio::test]
    async fn writes_missing_matter_and_part_introductions() -> anyhow::Result<()> {
        let ctx = noop_context();
        let mut manuscript = with_matter()?;

        let outcome = run(&ctx, &mut manuscript).await?;
        assert_eq!(outcome.processed, 6);
        assert_eq!(outcome.skipped, 2);

        let kinds = manuscript
            .front_matter
            .iter()
            .map(|r| r.kind)
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                MatterKind::TitlePage,
                MatterKind::Copyright,
                MatterKind::Preface,
                MatterKind::Introduction
            ]
        );
        assert!(manuscript.front_matter.iter().all(MatterRecord::is_present));
        assert!(manuscript.back_matter.iter().all(MatterRecord::is_present));
        let preface = &manuscript.front_matter[2];
        assert_eq!(count_words(&preface.content), preface.target_words);
        assert_eq!(
            manuscript.parts.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["pt01", "pt02"]
        );
        assert!(manuscript.parts.iter().all(|p| p.introduction.is_some()));
        assert_eq!(manuscript.section_count(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn present_matter_is_not_regenerated() -> anyhow::Result<()> {
        let (generator, calls) = counting(|_| Ok(words(10)));
        let ctx = context_with(generator);
        let mut manuscript = with_matter()?;
        for record in manuscript
            .front_matter
            .iter_mut()
            .chain(manuscript.back_matter.iter_mut())
        {
            record.content = "already here".to_owned();
        }

        let outcome = run(&ctx, &mut manuscript).await?;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.processed, 2);
        Ok(())
    }

    #[tokio::test]
    async fn failure_keeps_every_unit() {
        let (generator, _) = counting(|request| {
            if request.prompt.contains("Write the conclusion") {
                anyhow::bail!("provider down")
            }
            Ok(words(10))
        });
        let ctx = context_with(generator);
        let mut manuscript = with_matter().expect("matter");

        assert!(run(&ctx, &mut manuscript).await.is_err());
        assert_eq!(manuscript.front_matter.len(), 4);
        assert_eq!(manuscript.back_matter.len(), 2);
        assert_eq!(manuscript.parts.len(), 2);
        assert!(!manuscript.back_matter[0].is_present());
    }
}
