//! Page/word targets → book skeleton.
//!
//! The skeleton computed here is the contract every later phase fills. Titles
//! proposed by the model are applied positionally; they never change the shape.

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::StructureError;
use crate::manuscript::{Chapter, MatterKind, MatterRecord, Part, Section};
use crate::parse::{RawText, parse_json_reply};

pub const MIN_CHAPTERS: usize = 3;
pub const MAX_PARTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureParams {
    pub target_pages: usize,
    pub words_per_page: usize,
    pub front_matter_pages: usize,
    pub back_matter_pages: usize,
    pub target_words_per_section: usize,
    pub default_sections_per_chapter: usize,
}

impl StructureParams {
    pub fn from_config(target_pages: usize, config: &PipelineConfig) -> Self {
        Self {
            target_pages,
            words_per_page: config.words_per_page,
            front_matter_pages: config.front_matter_pages,
            back_matter_pages: config.back_matter_pages,
            target_words_per_section: config.target_words_per_section,
            default_sections_per_chapter: config.default_sections_per_chapter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructurePlan {
    pub content_words: usize,
    pub total_sections: usize,
    pub total_chapters: usize,
    pub num_parts: usize,
    pub chapters_per_part: usize,
    pub front_matter_words: usize,
    pub back_matter_words: usize,
}

pub fn num_parts_for(target_pages: usize) -> usize {
    match target_pages {
        0..100 => 1,
        100..200 => 2,
        200..400 => 3,
        _ => MAX_PARTS.min(target_pages / 100),
    }
}

pub fn calculate(params: &StructureParams) -> Result<StructurePlan, StructureError> {
    if params.words_per_page == 0 {
        return Err(StructureError::ZeroParameter {
            field: "words_per_page",
        });
    }
    if params.target_words_per_section == 0 {
        return Err(StructureError::ZeroParameter {
            field: "target_words_per_section",
        });
    }
    if params.default_sections_per_chapter == 0 {
        return Err(StructureError::ZeroParameter {
            field: "default_sections_per_chapter",
        });
    }

    let reserved_pages = params.front_matter_pages + params.back_matter_pages;
    if params.target_pages <= reserved_pages {
        return Err(StructureError::NoContentPages {
            target_pages: params.target_pages,
            reserved_pages,
        });
    }

    let content_words = (params.target_pages - reserved_pages) * params.words_per_page;
    let total_sections = content_words / params.target_words_per_section;
    let total_chapters = (total_sections / params.default_sections_per_chapter).max(MIN_CHAPTERS);
    let num_parts = num_parts_for(params.target_pages);
    let chapters_per_part = total_chapters / num_parts;

    Ok(StructurePlan {
        content_words,
        total_sections,
        total_chapters,
        num_parts,
        chapters_per_part,
        front_matter_words: params.front_matter_pages * params.words_per_page,
        back_matter_words: params.back_matter_pages * params.words_per_page,
    })
}

impl StructurePlan {
    /// Sections actually laid out: every chapter gets at least one.
    pub fn effective_sections(&self) -> usize {
        self.total_sections.max(self.total_chapters)
    }

    pub fn words_per_section(&self) -> usize {
        self.content_words / self.effective_sections()
    }

    /// Chapters per part; the remainder goes to the leading parts.
    pub fn chapter_layout(&self) -> Vec<usize> {
        spread(self.total_chapters, self.num_parts)
    }

    /// Sections per chapter in book order; the remainder goes to the leading chapters.
    pub fn section_layout(&self) -> Vec<usize> {
        spread(self.effective_sections(), self.total_chapters)
    }
}

fn spread(total: usize, buckets: usize) -> Vec<usize> {
    if buckets == 0 {
        return Vec::new();
    }
    let base = total / buckets;
    let extra = total % buckets;
    (0..buckets)
        .map(|idx| base + usize::from(idx < extra))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedStructure {
    pub parts: Vec<ProposedPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedPart {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub chapters: Vec<ProposedChapter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedChapter {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sections: Vec<String>,
}

impl ProposedStructure {
    /// The skeleton's shape with every title left blank, used as a fill-in template.
    pub fn blank(plan: &StructurePlan) -> Self {
        let mut sections = plan.section_layout().into_iter();
        let parts = plan
            .chapter_layout()
            .into_iter()
            .map(|chapters| ProposedPart {
                title: String::new(),
                chapters: (0..chapters)
                    .map(|_| ProposedChapter {
                        title: String::new(),
                        sections: vec![String::new(); sections.next().unwrap_or(1)],
                    })
                    .collect(),
            })
            .collect();
        Self { parts }
    }
}

pub fn parse_proposal(raw: &str) -> Result<ProposedStructure, RawText> {
    let proposal: ProposedStructure = parse_json_reply(raw)?;
    if proposal.parts.is_empty() {
        return Err(RawText(raw.to_owned()));
    }
    Ok(proposal)
}

/// Lays out parts, chapters and sections for `plan`.
///
/// With `proposal == None` (or wherever a proposed title is missing or blank)
/// generic numbered titles are used.
pub fn build_skeleton(
    plan: &StructurePlan,
    proposal: Option<&ProposedStructure>,
    max_expansion_attempts: usize,
) -> Vec<Part> {
    let section_layout = plan.section_layout();
    let words_per_section = plan.words_per_section();
    let mut chapter_number = 0usize;
    let mut parts = Vec::with_capacity(plan.num_parts);

    for (part_idx, chapter_count) in plan.chapter_layout().into_iter().enumerate() {
        let part_number = part_idx + 1;
        let proposed_part = proposal.and_then(|p| p.parts.get(part_idx));
        let part_id = format!("pt{part_number:02}");
        let part_title = pick_title(
            proposed_part.map(|p| p.title.as_str()),
            || format!("Part {part_number}"),
        );
        let mut part = Part::new(&part_id, part_number, part_title);

        for chapter_idx in 0..chapter_count {
            let proposed_chapter = proposed_part.and_then(|p| p.chapters.get(chapter_idx));
            let chapter_ordinal = chapter_number + 1;
            let chapter_id = format!("ch{chapter_ordinal:02}");
            let chapter_title = pick_title(
                proposed_chapter.map(|c| c.title.as_str()),
                || format!("Chapter {chapter_ordinal}"),
            );
            let mut chapter = Chapter::new(&chapter_id, chapter_ordinal, chapter_title, &part_id);

            let section_count = section_layout.get(chapter_number).copied().unwrap_or(1);
            for section_idx in 0..section_count {
                let section_number = section_idx + 1;
                let section_title = pick_title(
                    proposed_chapter
                        .and_then(|c| c.sections.get(section_idx))
                        .map(String::as_str),
                    || format!("Section {section_number}"),
                );
                let mut section = Section::new(
                    format!("{chapter_id}-s{section_number:02}"),
                    section_number,
                    section_title,
                    &chapter_id,
                    words_per_section,
                );
                section.max_expansion_attempts = max_expansion_attempts;
                chapter.sections.push(section);
            }

            part.chapters.push(chapter);
            chapter_number += 1;
        }

        parts.push(part);
    }

    parts
}

fn pick_title(proposed: Option<&str>, fallback: impl FnOnce() -> String) -> String {
    match proposed.map(str::trim) {
        Some(title) if !title.is_empty() => title.to_owned(),
        _ => fallback(),
    }
}

/// Front and back matter records with their word budgets.
///
/// The title page and copyright notice are filled deterministically here; the
/// remaining records are written by the matter phase.
pub fn build_matter(
    plan: &StructurePlan,
    title: &str,
    subtitle: Option<&str>,
    year: i32,
) -> (Vec<MatterRecord>, Vec<MatterRecord>) {
    let mut title_page = MatterRecord::new(MatterKind::TitlePage, "Title Page", 0);
    title_page.content = match subtitle {
        Some(subtitle) => format!("# {title}\n\n## {subtitle}\n"),
        None => format!("# {title}\n"),
    };

    let mut copyright = MatterRecord::new(MatterKind::Copyright, "Copyright", 0);
    copyright.content = format!(
        "Copyright © {year}. All rights reserved.\n\nNo part of \"{title}\" may be reproduced without permission."
    );

    let preface_words = plan.front_matter_words / 2;
    let front = vec![
        title_page,
        copyright,
        MatterRecord::new(MatterKind::Preface, "Preface", preface_words),
        MatterRecord::new(
            MatterKind::Introduction,
            "Introduction",
            plan.front_matter_words - preface_words,
        ),
    ];

    let conclusion_words = plan.back_matter_words / 2;
    let back = vec![
        MatterRecord::new(MatterKind::Conclusion, "Conclusion", conclusion_words),
        MatterRecord::new(
            MatterKind::Resources,
            "Resources and Further Reading",
            plan.back_matter_words - conclusion_words,
        ),
    ];

    (front, back)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(target_pages: usize) -> StructureParams {
        StructureParams {
            target_pages,
            words_per_page: 300,
            front_matter_pages: 10,
            back_matter_pages: 15,
            target_words_per_section: 1500,
            default_sections_per_chapter: 4,
        }
    }

    #[test]
    fn calculate_three_hundred_page_book() -> anyhow::Result<()> {
        let plan = calculate(&params(300))?;
        assert_eq!(plan.content_words, 82_500);
        assert_eq!(plan.total_sections, 55);
        assert_eq!(plan.total_chapters, 13);
        assert_eq!(plan.num_parts, 3);
        assert_eq!(plan.chapters_per_part, 4);
        assert_eq!(plan.front_matter_words, 3_000);
        assert_eq!(plan.back_matter_words, 4_500);
        Ok(())
    }

    #[test]
    fn num_parts_follows_page_bands() {
        let cases = [
            (50, 1),
            (99, 1),
            (100, 2),
            (199, 2),
            (200, 3),
            (399, 3),
            (400, 4),
            (900, 4),
        ];
        for (pages, expected) in cases {
            assert_eq!(num_parts_for(pages), expected, "pages={pages}");
        }
    }

    #[test]
    fn small_books_still_get_three_chapters() -> anyhow::Result<()> {
        let plan = calculate(&params(50))?;
        assert_eq!(plan.content_words, 7_500);
        assert_eq!(plan.total_sections, 5);
        assert_eq!(plan.total_chapters, 3);
        assert_eq!(plan.section_layout(), vec![2, 2, 1]);
        Ok(())
    }

    #[test]
    fn calculate_rejects_books_without_content_pages() {
        let err = calculate(&params(25)).unwrap_err();
        assert_eq!(
            err,
            StructureError::NoContentPages {
                target_pages: 25,
                reserved_pages: 25
            }
        );
    }

    #[test]
    fn skeleton_keeps_calculated_shape() -> anyhow::Result<()> {
        let plan = calculate(&params(300))?;
        let parts = build_skeleton(&plan, None, 3);

        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts.iter().map(|p| p.chapters.len()).collect::<Vec<_>>(),
            vec![5, 4, 4]
        );
        let sections = parts
            .iter()
            .flat_map(|p| p.chapters.iter())
            .map(|c| c.sections.len())
            .sum::<usize>();
        assert_eq!(sections, 55);

        let first = &parts[0].chapters[0];
        assert_eq!(first.title, "Chapter 1");
        assert_eq!(first.sections[0].title, "Section 1");
        assert_eq!(first.sections[0].target_words, 1500);
        assert_eq!(first.sections[0].chapter_id, first.id);
        assert_eq!(parts[2].chapters[3].title, "Chapter 13");
        Ok(())
    }

    #[test]
    fn skeleton_applies_proposed_titles_positionally() -> anyhow::Result<()> {
        let plan = calculate(&params(50))?;
        let proposal = ProposedStructure {
            parts: vec![ProposedPart {
                title: "Foundations".to_owned(),
                chapters: vec![
                    ProposedChapter {
                        title: "Getting Started".to_owned(),
                        sections: vec!["Install".to_owned(), " ".to_owned(), "Extra".to_owned()],
                    },
                    ProposedChapter {
                        title: String::new(),
                        sections: vec![],
                    },
                ],
            }],
        };

        let parts = build_skeleton(&plan, Some(&proposal), 3);
        assert_eq!(parts[0].title, "Foundations");
        let chapters = &parts[0].chapters;
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].title, "Getting Started");
        assert_eq!(chapters[0].sections.len(), 2);
        assert_eq!(chapters[0].sections[0].title, "Install");
        assert_eq!(chapters[0].sections[1].title, "Section 2");
        assert_eq!(chapters[1].title, "Chapter 2");
        assert_eq!(chapters[2].title, "Chapter 3");
        Ok(())
    }

    #[test]
    fn parse_proposal_falls_back_to_raw_text() {
        let raw = "I cannot produce JSON today.";
        assert_eq!(parse_proposal(raw).unwrap_err(), RawText(raw.to_owned()));
        assert!(parse_proposal("{\"parts\": []}").is_err());

        let ok = parse_proposal(
            "{\"parts\":[{\"title\":\"P\",\"chapters\":[{\"title\":\"C\",\"sections\":[\"S\"]}]}]}",
        )
        .expect("parse");
        assert_eq!(ok.parts[0].chapters[0].sections, vec!["S"]);
    }

    #[test]
    fn blank_proposal_mirrors_layout() -> anyhow::Result<()> {
        let plan = calculate(&params(50))?;
        let blank = ProposedStructure::blank(&plan);
        assert_eq!(blank.parts.len(), 1);
        assert_eq!(
            blank.parts[0]
                .chapters
                .iter()
                .map(|c| c.sections.len())
                .collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        Ok(())
    }

    #[test]
    fn matter_budgets_split_reserved_pages() -> anyhow::Result<()> {
        let plan = calculate(&params(300))?;
        let (front, back) = build_matter(&plan, "Title", Some("Sub"), 2026);
        let front_budget = front.iter().map(|m| m.target_words).sum::<usize>();
        let back_budget = back.iter().map(|m| m.target_words).sum::<usize>();
        assert_eq!(front_budget, 3_000);
        assert_eq!(back_budget, 4_500);
        assert!(front[0].content.contains("## Sub"));
        assert!(front[1].content.contains("2026"));
        assert!(front.iter().filter(|m| m.kind.is_generated()).all(|m| m.content.is_empty()));
        Ok(())
    }
}
