use serde::Deserialize;

use crate::error::{AgentError, ContentError};
use crate::generation::{GenerationRequest, length_directive};
use crate::manuscript::{Chapter, Manuscript, Section, SectionStatus};
use crate::parse::{parse_json_reply, strip_code_fence};
use crate::phases::{PhaseContext, PhaseOutcome, UnitResult, fan_out, settle};
use crate::project::PipelinePhase;
use crate::wordcount::count_words;

const PHASE: PipelinePhase = PipelinePhase::Enrich;
pub const MIN_TAKEAWAYS: usize = 3;
pub const MAX_TAKEAWAYS: usize = 5;

#[derive(Debug, Default, Deserialize)]
struct ApparatusReply {
    #[serde(default)]
    introduction: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    key_takeaways: Vec<String>,
}

/// Adds chapter introductions, summaries and takeaways where missing, and
/// works professional elements into every section that is not complete.
pub async fn run(
    ctx: &PhaseContext,
    manuscript: &mut Manuscript,
) -> anyhow::Result<PhaseOutcome> {
    let chapters = manuscript.take_chapters();
    tracing::info!(chapters = chapters.len(), "enrich phase");

    let results = fan_out(
        ctx.progress.as_ref(),
        PHASE,
        ctx.config.concurrency,
        chapters,
        |chapter| {
            let ctx = ctx.clone();
            async move { enrich_chapter(&ctx, chapter).await }
        },
    )
    .await;

    let mut outcome = PhaseOutcome::default();
    let (chapters, first_error) = settle(results, &mut outcome);
    manuscript.restore_chapters(chapters)?;

    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(outcome),
    }
}

async fn enrich_chapter(ctx: &PhaseContext, mut chapter: Chapter) -> UnitResult<Chapter> {
    if chapter.needs_enrichment()
        && let Err(err) = add_apparatus(ctx, &mut chapter).await
    {
        tracing::error!(chapter_id = %chapter.id, error = %err, "chapter apparatus failed");
        return UnitResult::failed(chapter, err);
    }

    let mut warnings = Vec::new();
    for idx in 0..chapter.sections.len() {
        let section = &chapter.sections[idx];
        if section.status == SectionStatus::Complete || section.content.trim().is_empty() {
            continue;
        }
        match add_professional_elements(ctx, &chapter.title, &mut chapter.sections[idx]).await {
            Ok(None) => {}
            Ok(Some(warning)) => warnings.push(warning.to_string()),
            Err(err) => {
                chapter.sections[idx].status = SectionStatus::Failed;
                return UnitResult::failed(chapter, err).with_warnings(warnings);
            }
        }
    }

    tracing::debug!(chapter_id = %chapter.id, "chapter enriched");
    UnitResult::ok(chapter).with_warnings(warnings)
}

async fn add_apparatus(ctx: &PhaseContext, chapter: &mut Chapter) -> Result<(), AgentError> {
    let section_titles = chapter
        .sections
        .iter()
        .map(|s| format!("- {}", s.title))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "{book}\n\
Chapter: {title}\n\
Sections:\n{section_titles}\n\n\
Write the chapter apparatus as JSON: \
{{\"introduction\": \"...\", \"summary\": \"...\", \"key_takeaways\": [\"...\"]}}.\n\
The introduction and summary are one or two paragraphs each; give {min} to {max} key takeaways.\n\
{length}\n",
        book = ctx.book_context(),
        title = chapter.title,
        min = MIN_TAKEAWAYS,
        max = MAX_TAKEAWAYS,
        length = length_directive(300),
    );
    let request = GenerationRequest::new(ctx.system_prompt("a developmental editor"), prompt)
        .max_tokens(ctx.config.generation.tokens_for_words(600))
        .temperature(ctx.config.generation.enrich_temperature);

    let raw = ctx.unit.generate(PHASE, &request).await?;
    let reply = parse_json_reply::<ApparatusReply>(&raw).unwrap_or_else(|_| {
        tracing::debug!(chapter_id = %chapter.id, "apparatus reply unstructured; using titles");
        ApparatusReply::default()
    });

    let fallback = fallback_apparatus(chapter);
    if chapter.introduction.is_none() {
        chapter.introduction = Some(non_empty_or(reply.introduction, fallback.introduction));
    }
    if chapter.summary.is_none() {
        chapter.summary = Some(non_empty_or(reply.summary, fallback.summary));
    }
    if chapter.key_takeaways.is_empty() {
        let mut takeaways = reply
            .key_takeaways
            .into_iter()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>();
        for extra in fallback.key_takeaways {
            if takeaways.len() >= MIN_TAKEAWAYS {
                break;
            }
            takeaways.push(extra);
        }
        takeaways.truncate(MAX_TAKEAWAYS);
        chapter.key_takeaways = takeaways;
    }
    Ok(())
}

fn non_empty_or(value: String, fallback: String) -> String {
    if value.trim().is_empty() {
        fallback
    } else {
        value.trim().to_owned()
    }
}

/// Apparatus assembled from the chapter's own section titles.
fn fallback_apparatus(chapter: &Chapter) -> ApparatusReply {
    let titles = chapter
        .sections
        .iter()
        .map(|s| s.title.as_str())
        .collect::<Vec<_>>();
    let listed = match titles.as_slice() {
        [] => "its central ideas".to_owned(),
        [only] => (*only).to_owned(),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
    };

    let mut key_takeaways = titles
        .iter()
        .map(|t| format!("{t} shapes how the ideas in {} fit together.", chapter.title))
        .collect::<Vec<_>>();
    let generic = [
        format!("{} builds on what came before.", chapter.title),
        format!("The ideas in {} are meant to be applied.", chapter.title),
        format!("Revisit {} when the details matter.", chapter.title),
    ];
    for extra in generic {
        if key_takeaways.len() >= MIN_TAKEAWAYS {
            break;
        }
        key_takeaways.push(extra);
    }
    key_takeaways.truncate(MAX_TAKEAWAYS);

    ApparatusReply {
        introduction: format!(
            "This chapter, {}, covers {listed}. Each section builds on the one before it.",
            chapter.title
        ),
        summary: format!(
            "{} walked through {listed}. Together these sections prepare the ground for what follows.",
            chapter.title
        ),
        key_takeaways,
    }
}

/// Works examples, callouts and reflective questions into a section. The
/// rewrite is accepted only if it is not shorter than the original.
async fn add_professional_elements(
    ctx: &PhaseContext,
    chapter_title: &str,
    section: &mut Section,
) -> Result<Option<ContentError>, AgentError> {
    let before = count_words(&section.content);
    let requested = before.max(section.target_words);
    let prompt = format!(
        "{book}\n\
Chapter: {chapter_title}\n\
Section: {title}\n\n\
Enrich the section below with professional elements: a brief real-world example, \
a practical tip, and a reflective question for the reader. Weave them into the text \
and keep every existing point. Return the full section.\n\n\
{content}\n\n\
{length}\n",
        book = ctx.book_context(),
        title = section.title,
        content = section.content,
        length = length_directive(requested),
    );
    let request = GenerationRequest::new(ctx.system_prompt("a developmental editor"), prompt)
        .max_tokens(ctx.config.generation.tokens_for_words(requested))
        .temperature(ctx.config.generation.enrich_temperature);

    let text = ctx.unit.generate(PHASE, &request).await?;
    let candidate = strip_code_fence(&text);
    let after = count_words(candidate);
    if after < before {
        let err = ContentError::Shrunk {
            unit: section.id.clone(),
            before,
            after,
        };
        tracing::warn!(section_id = %section.id, error = %err, "enrichment rejected");
        return Ok(Some(err));
    }

    section.content = candidate.to_owned();
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::generation::requested_words;
    use crate::manuscript::tests::sample_manuscript;
    use crate::phases::tests::{context_with, counting, noop_context, words};

    fn written() -> Manuscript {
        let mut manuscript = sample_manuscript();
        for section in manuscript.sections_mut() {
            section.content = words(100);
            section.status = SectionStatus::Written;
        }
        manuscript
    }

    #[tokio::test]
    async fn fills_apparatus_with_fallback_when_reply_is_prose() -> anyhow::Result<()> {
        let ctx = noop_context();
        let mut manuscript = written();

        let outcome = run(&ctx, &mut manuscript).await?;
        assert_eq!(outcome.processed, 3);
        for chapter in manuscript.all_chapters() {
            assert!(!chapter.needs_enrichment());
            assert!((MIN_TAKEAWAYS..=MAX_TAKEAWAYS).contains(&chapter.key_takeaways.len()));
            assert!(
                chapter
                    .introduction
                    .as_deref()
                    .is_some_and(|i| i.contains(&chapter.title))
            );
        }
        for section in manuscript.all_sections() {
            assert_eq!(section.word_count().actual, 100);
            assert_eq!(section.status, SectionStatus::Written);
        }
        Ok(())
    }

    #[tokio::test]
    async fn parses_json_apparatus() -> anyhow::Result<()> {
        let (generator, _) = counting(|request| {
            if request.prompt.contains("key_takeaways") {
                return Ok(r#"{"introduction":"Intro.","summary":"Summary.",
                    "key_takeaways":["a","b","c","d","e","f"]}"#
                    .to_owned());
            }
            Ok(words(requested_words(&request.prompt).unwrap_or(0)))
        });
        let ctx = context_with(generator);
        let mut manuscript = written();

        run(&ctx, &mut manuscript).await?;
        let chapter = manuscript.get_chapter("ch01").expect("chapter");
        assert_eq!(chapter.introduction.as_deref(), Some("Intro."));
        assert_eq!(chapter.summary.as_deref(), Some("Summary."));
        assert_eq!(chapter.key_takeaways.len(), MAX_TAKEAWAYS);
        Ok(())
    }

    #[tokio::test]
    async fn shrinking_enrichment_is_rejected() -> anyhow::Result<()> {
        let (generator, _) = counting(|_| Ok(words(20)));
        let ctx = context_with(generator);
        let mut manuscript = written();

        let outcome = run(&ctx, &mut manuscript).await?;
        assert_eq!(outcome.warnings.len(), 5);
        for section in manuscript.all_sections() {
            assert_eq!(section.word_count().actual, 100);
        }
        Ok(())
    }

    #[tokio::test]
    async fn complete_sections_and_existing_apparatus_are_untouched() -> anyhow::Result<()> {
        let (generator, calls) = counting(|_| Ok(words(500)));
        let ctx = context_with(generator);
        let mut manuscript = written();
        for section in manuscript.sections_mut() {
            section.status = SectionStatus::Complete;
        }
        for part in &mut manuscript.parts {
            for chapter in &mut part.chapters {
                chapter.introduction = Some("i".to_owned());
                chapter.summary = Some("s".to_owned());
                chapter.key_takeaways = vec!["k".to_owned()];
            }
        }

        run(&ctx, &mut manuscript).await?;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn panicking_chapter_is_restored_with_its_sections() {
        let (generator, _) = counting(|request| {
            if request.prompt.contains("Chapter: Chapter Two\nSections:") {
                panic!("generator crashed");
            }
            Ok(words(requested_words(&request.prompt).unwrap_or(50)))
        });
        let ctx = context_with(generator);
        let mut manuscript = written();

        assert!(run(&ctx, &mut manuscript).await.is_err());
        assert_eq!(manuscript.chapter_count(), 3);
        assert_eq!(manuscript.section_count(), 5);
        let ids = manuscript
            .all_chapters()
            .iter()
            .map(|c| c.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["ch01", "ch02", "ch03"]);
        let untouched = manuscript.get_chapter("ch02").expect("chapter two");
        assert!(untouched.introduction.is_none());
        assert!(
            manuscript
                .get_chapter("ch01")
                .is_some_and(|c| c.introduction.is_some())
        );
    }
}
