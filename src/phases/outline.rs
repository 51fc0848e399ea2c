use std::collections::HashMap;

use serde::Deserialize;

use crate::generation::{GenerationRequest, length_directive};
use crate::manuscript::{Manuscript, OutlinePoint, Section, SectionStatus};
use crate::parse::{RawText, extract_list_items, parse_json_reply};
use crate::phases::{PhaseContext, PhaseOutcome, UnitResult, fan_out, settle};
use crate::project::PipelinePhase;

const PHASE: PipelinePhase = PipelinePhase::Outline;
pub const MIN_OUTLINE_POINTS: usize = 3;

#[derive(Debug, Deserialize)]
struct OutlineReply {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    points: Vec<OutlineReplyPoint>,
}

#[derive(Debug, Deserialize)]
struct OutlineReplyPoint {
    content: String,
    #[serde(default)]
    target_words: usize,
    #[serde(default)]
    notes: Option<String>,
}

/// Outlines every section that has no outline yet.
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
        .partition(|s| !s.has_outline());
    let mut outcome = PhaseOutcome {
        skipped: done.len(),
        ..PhaseOutcome::default()
    };
    tracing::info!(sections = todo.len(), skipped = done.len(), "outline phase");

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
            async move { outline_section(&ctx, section, &chapter_title).await }
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

async fn outline_section(
    ctx: &PhaseContext,
    mut section: Section,
    chapter_title: &str,
) -> UnitResult<Section> {
    let request = GenerationRequest::new(
        ctx.system_prompt("an expert book outliner"),
        outline_prompt(ctx, &section, chapter_title),
    )
    .max_tokens(ctx.config.generation.tokens_for_words(400))
    .temperature(ctx.config.generation.outline_temperature);

    let raw = match ctx.unit.generate(PHASE, &request).await {
        Ok(raw) => raw,
        Err(err) => {
            tracing::error!(section_id = %section.id, error = %err, "outline failed");
            section.status = SectionStatus::Failed;
            return UnitResult::failed(section, err);
        }
    };

    let (summary, points, parsed) = match parse_json_reply::<OutlineReply>(&raw) {
        Ok(reply) if !reply.points.is_empty() => (reply.summary, into_points(reply.points), true),
        Ok(_) => fallback_outline(&section.title, RawText(raw)),
        Err(raw) => fallback_outline(&section.title, raw),
    };
    if !parsed {
        tracing::debug!(
            section_id = %section.id,
            "outline reply unstructured; using list fallback"
        );
    }

    section.outline = balance_points(points, &section.title, section.target_words);
    section.outline_summary = if summary.trim().is_empty() {
        format!("An overview of {}.", section.title)
    } else {
        summary
    };
    if matches!(section.status, SectionStatus::Pending | SectionStatus::Failed) {
        section.status = SectionStatus::Outlined;
    }
    tracing::debug!(section_id = %section.id, points = section.outline.len(), "outlined");
    UnitResult::ok(section)
}

fn outline_prompt(ctx: &PhaseContext, section: &Section, chapter_title: &str) -> String {
    format!(
        "{book}\n\
Chapter: {chapter_title}\n\
Section: {title}\n\
The finished section will be about {target} words.\n\n\
Outline this section as JSON: \
{{\"summary\": \"one paragraph\", \"points\": [{{\"content\": \"...\", \"target_words\": 300, \"notes\": \"...\"}}]}}.\n\
Use 3 to 6 points whose target_words add up to {target}.\n\
{length}\n",
        book = ctx.book_context(),
        title = section.title,
        target = section.target_words,
        length = length_directive(250),
    )
}

fn into_points(points: Vec<OutlineReplyPoint>) -> Vec<OutlinePoint> {
    points
        .into_iter()
        .filter(|p| !p.content.trim().is_empty())
        .map(|p| OutlinePoint {
            content: p.content.trim().to_owned(),
            target_words: p.target_words,
            notes: p.notes.filter(|n| !n.trim().is_empty()),
        })
        .collect()
}

/// Heuristic outline from unstructured text: list lines become points, the
/// first plain line becomes the summary.
fn fallback_outline(title: &str, raw: RawText) -> (String, Vec<OutlinePoint>, bool) {
    let points = extract_list_items(raw.as_str())
        .into_iter()
        .map(|content| OutlinePoint {
            content,
            target_words: 0,
            notes: None,
        })
        .collect::<Vec<_>>();
    let summary = raw
        .as_str()
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && extract_list_items(line).is_empty())
        .map(|line| crate::wordcount::head_words(line, 60))
        .unwrap_or_else(|| format!("An overview of {title}."));
    (summary, points, false)
}

/// Pads to [`MIN_OUTLINE_POINTS`] and makes sure targets add up to something.
fn balance_points(
    mut points: Vec<OutlinePoint>,
    title: &str,
    target_words: usize,
) -> Vec<OutlinePoint> {
    let generic = [
        format!("Introduce {title} and why it matters"),
        format!("Develop the core ideas of {title}"),
        format!("Apply {title} in practice"),
    ];
    let mut idx = 0;
    while points.len() < MIN_OUTLINE_POINTS {
        points.push(OutlinePoint {
            content: generic[idx % generic.len()].clone(),
            target_words: 0,
            notes: None,
        });
        idx += 1;
    }

    let assigned = points.iter().map(|p| p.target_words).sum::<usize>();
    if assigned == 0 || points.iter().any(|p| p.target_words == 0) {
        let count = points.len();
        let base = target_words / count;
        let extra = target_words % count;
        for (idx, point) in points.iter_mut().enumerate() {
            point.target_words = base + usize::from(idx < extra);
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::manuscript::tests::sample_manuscript;
    use crate::phases::tests::{context_with, counting, noop_context};

    #[tokio::test]
    async fn outlines_every_section_with_fallback_points() -> anyhow::Result<()> {
        let ctx = noop_context();
        let mut manuscript = sample_manuscript();

        let outcome = run(&ctx, &mut manuscript).await?;
        assert_eq!(outcome.processed, 5);
        for section in manuscript.all_sections() {
            assert_eq!(section.status, SectionStatus::Outlined);
            assert!(section.outline.len() >= MIN_OUTLINE_POINTS);
            let total = section.outline.iter().map(|p| p.target_words).sum::<usize>();
            assert_eq!(total, section.target_words);
            assert!(!section.outline_summary.is_empty());
        }
        Ok(())
    }

    #[tokio::test]
    async fn parses_json_outline() -> anyhow::Result<()> {
        let (generator, _) = counting(|_| {
            Ok(r#"{"summary":"Covers drift.","points":[
                {"content":"What drift is","target_words":40},
                {"content":"Spotting drift","target_words":30,"notes":"use a story"},
                {"content":"Fixing drift","target_words":30}]}"#
                .to_owned())
        });
        let ctx = context_with(generator);
        let mut manuscript = sample_manuscript();

        run(&ctx, &mut manuscript).await?;
        let section = manuscript.get_section("ch01-s01").expect("section");
        assert_eq!(section.outline_summary, "Covers drift.");
        assert_eq!(section.outline[1].notes.as_deref(), Some("use a story"));
        assert_eq!(
            section.outline.iter().map(|p| p.target_words).collect::<Vec<_>>(),
            vec![40, 30, 30]
        );
        Ok(())
    }

    #[tokio::test]
    async fn already_outlined_sections_are_skipped() -> anyhow::Result<()> {
        let (generator, calls) = counting(|_| Ok("- one\n- two\n- three".to_owned()));
        let ctx = context_with(generator);
        let mut manuscript = sample_manuscript();
        for section in manuscript.sections_mut() {
            section.outline.push(OutlinePoint {
                content: "existing".to_owned(),
                target_words: 100,
                notes: None,
            });
        }
        manuscript
            .get_section_mut("ch02-s01")
            .expect("section")
            .outline
            .clear();

        let outcome = run(&ctx, &mut manuscript).await?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.skipped, 4);
        let redone = manuscript.get_section("ch02-s01").expect("section");
        assert_eq!(redone.outline[0].content, "one");
        Ok(())
    }

    #[tokio::test]
    async fn failure_marks_section_and_keeps_tree_intact() {
        let (generator, _) = counting(|request| {
            if request.prompt.contains("Section: C\n") {
                anyhow::bail!("provider down")
            }
            Ok("- a\n- b\n- c".to_owned())
        });
        let ctx = context_with(generator);
        let mut manuscript = sample_manuscript();

        let err = run(&ctx, &mut manuscript).await.unwrap_err();
        let agent = err.downcast_ref::<crate::error::AgentError>().expect("agent error");
        assert_eq!(agent.phase, PipelinePhase::Outline);
        assert_eq!(manuscript.section_count(), 5);
        assert_eq!(
            manuscript.get_section("ch02-s01").map(|s| s.status),
            Some(SectionStatus::Failed)
        );
        assert_eq!(
            manuscript.get_section("ch03-s02").map(|s| s.status),
            Some(SectionStatus::Outlined)
        );
    }

    #[test]
    fn balance_points_pads_and_spreads_targets() {
        let points = balance_points(Vec::new(), "Drift", 100);
        assert_eq!(points.len(), 3);
        assert_eq!(
            points.iter().map(|p| p.target_words).collect::<Vec<_>>(),
            vec![34, 33, 33]
        );
    }
}
