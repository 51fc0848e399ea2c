use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::wordcount::{WordCountTarget, count_words};

pub const DEFAULT_MAX_EXPANSION_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    #[default]
    Pending,
    Outlined,
    Writing,
    Written,
    NeedsExpansion,
    Expanding,
    Editing,
    Complete,
    Failed,
}

impl SectionStatus {
    /// Content exists and is accepted; the write phase leaves these alone.
    pub fn is_written(self) -> bool {
        matches!(self, Self::Written | Self::Complete)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlinePoint {
    pub content: String,
    pub target_words: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The atomic unit of generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub ordinal: usize,
    pub title: String,
    pub chapter_id: String,
    pub target_words: usize,
    #[serde(default)]
    pub outline: Vec<OutlinePoint>,
    #[serde(default)]
    pub outline_summary: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: SectionStatus,
    #[serde(default)]
    pub expansion_attempts: usize,
    #[serde(default = "default_max_expansion_attempts")]
    pub max_expansion_attempts: usize,
}

fn default_max_expansion_attempts() -> usize {
    DEFAULT_MAX_EXPANSION_ATTEMPTS
}

impl Section {
    pub fn new(
        id: impl Into<String>,
        ordinal: usize,
        title: impl Into<String>,
        chapter_id: impl Into<String>,
        target_words: usize,
    ) -> Self {
        Self {
            id: id.into(),
            ordinal,
            title: title.into(),
            chapter_id: chapter_id.into(),
            target_words,
            outline: Vec::new(),
            outline_summary: String::new(),
            content: String::new(),
            status: SectionStatus::Pending,
            expansion_attempts: 0,
            max_expansion_attempts: DEFAULT_MAX_EXPANSION_ATTEMPTS,
        }
    }

    pub fn word_count(&self) -> WordCountTarget {
        WordCountTarget::measure(self.target_words, &self.content)
    }

    pub fn has_outline(&self) -> bool {
        !self.outline.is_empty()
    }

    pub fn attempts_left(&self) -> bool {
        self.expansion_attempts < self.max_expansion_attempts
    }

    pub fn is_expandable(&self) -> bool {
        self.word_count().needs_expansion() && self.attempts_left()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub ordinal: usize,
    pub title: String,
    pub part_id: String,
    pub sections: Vec<Section>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introduction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_takeaways: Vec<String>,
}

impl Chapter {
    pub fn new(
        id: impl Into<String>,
        ordinal: usize,
        title: impl Into<String>,
        part_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ordinal,
            title: title.into(),
            part_id: part_id.into(),
            sections: Vec::new(),
            introduction: None,
            summary: None,
            key_takeaways: Vec::new(),
        }
    }

    /// Section targets and section text only; the chapter apparatus is excluded.
    pub fn word_count(&self) -> WordCountTarget {
        self.sections.iter().map(Section::word_count).sum()
    }

    /// Words in the introduction, summary and takeaways.
    pub fn apparatus_words(&self) -> usize {
        self.introduction.as_deref().map(count_words).unwrap_or(0)
            + self.summary.as_deref().map(count_words).unwrap_or(0)
            + self
                .key_takeaways
                .iter()
                .map(|t| count_words(t))
                .sum::<usize>()
    }

    /// Percentage of sections that reached `Complete`.
    pub fn progress(&self) -> f64 {
        if self.sections.is_empty() {
            return 0.0;
        }
        let complete = self
            .sections
            .iter()
            .filter(|s| s.status == SectionStatus::Complete)
            .count();
        complete as f64 / self.sections.len() as f64 * 100.0
    }

    pub fn needs_enrichment(&self) -> bool {
        self.introduction.is_none() || self.summary.is_none() || self.key_takeaways.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub ordinal: usize,
    pub title: String,
    pub chapters: Vec<Chapter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introduction: Option<String>,
}

impl Part {
    pub fn new(id: impl Into<String>, ordinal: usize, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ordinal,
            title: title.into(),
            chapters: Vec::new(),
            introduction: None,
        }
    }

    pub fn word_count(&self) -> WordCountTarget {
        self.chapters.iter().map(Chapter::word_count).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatterKind {
    TitlePage,
    Copyright,
    Preface,
    Introduction,
    Conclusion,
    Resources,
}

impl MatterKind {
    /// Whether the record's text comes from a generation call.
    pub fn is_generated(self) -> bool {
        !matches!(self, Self::TitlePage | Self::Copyright)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatterRecord {
    pub kind: MatterKind,
    pub title: String,
    pub target_words: usize,
    #[serde(default)]
    pub content: String,
}

impl MatterRecord {
    pub fn new(kind: MatterKind, title: impl Into<String>, target_words: usize) -> Self {
        Self {
            kind,
            title: title.into(),
            target_words,
            content: String::new(),
        }
    }

    pub fn is_present(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// The whole book tree. Word totals are recomputed on every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manuscript {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub target_pages: usize,
    pub words_per_page: usize,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub front_matter: Vec<MatterRecord>,
    #[serde(default)]
    pub back_matter: Vec<MatterRecord>,
}

impl Manuscript {
    pub fn new(
        title: impl Into<String>,
        subtitle: Option<String>,
        target_pages: usize,
        words_per_page: usize,
    ) -> Self {
        Self {
            title: title.into(),
            subtitle,
            target_pages,
            words_per_page,
            parts: Vec::new(),
            front_matter: Vec::new(),
            back_matter: Vec::new(),
        }
    }

    pub fn target_words(&self) -> usize {
        self.target_pages * self.words_per_page
    }

    /// Every word that ends up in the book: sections, chapter and part
    /// apparatus, and front/back matter.
    pub fn actual_words(&self) -> usize {
        let body = self
            .parts
            .iter()
            .map(|part| {
                part.introduction.as_deref().map(count_words).unwrap_or(0)
                    + part
                        .chapters
                        .iter()
                        .map(|ch| ch.word_count().actual + ch.apparatus_words())
                        .sum::<usize>()
            })
            .sum::<usize>();
        let matter = self
            .front_matter
            .iter()
            .chain(self.back_matter.iter())
            .map(|m| count_words(&m.content))
            .sum::<usize>();
        body + matter
    }

    pub fn word_count(&self) -> WordCountTarget {
        WordCountTarget::new(self.target_words(), self.actual_words())
    }

    pub fn completion(&self) -> f64 {
        self.word_count().completion()
    }

    pub fn is_populated(&self) -> bool {
        !self.parts.is_empty()
    }

    pub fn all_chapters(&self) -> Vec<&Chapter> {
        self.parts.iter().flat_map(|p| p.chapters.iter()).collect()
    }

    pub fn all_sections(&self) -> Vec<&Section> {
        self.parts
            .iter()
            .flat_map(|p| p.chapters.iter())
            .flat_map(|c| c.sections.iter())
            .collect()
    }

    pub fn sections_mut(&mut self) -> impl Iterator<Item = &mut Section> {
        self.parts
            .iter_mut()
            .flat_map(|p| p.chapters.iter_mut())
            .flat_map(|c| c.sections.iter_mut())
    }

    pub fn section_count(&self) -> usize {
        self.parts
            .iter()
            .flat_map(|p| p.chapters.iter())
            .map(|c| c.sections.len())
            .sum()
    }

    pub fn chapter_count(&self) -> usize {
        self.parts.iter().map(|p| p.chapters.len()).sum()
    }

    pub fn get_part(&self, id: &str) -> Option<&Part> {
        self.parts.iter().find(|p| p.id == id)
    }

    pub fn get_chapter(&self, id: &str) -> Option<&Chapter> {
        self.parts
            .iter()
            .flat_map(|p| p.chapters.iter())
            .find(|c| c.id == id)
    }

    pub fn get_chapter_mut(&mut self, id: &str) -> Option<&mut Chapter> {
        self.parts
            .iter_mut()
            .flat_map(|p| p.chapters.iter_mut())
            .find(|c| c.id == id)
    }

    pub fn get_section(&self, id: &str) -> Option<&Section> {
        self.all_sections().into_iter().find(|s| s.id == id)
    }

    pub fn get_section_mut(&mut self, id: &str) -> Option<&mut Section> {
        self.sections_mut().find(|s| s.id == id)
    }

    /// Moves every section out of the tree, in document order.
    ///
    /// Chapters are left with empty section lists until
    /// [`Manuscript::restore_sections`] puts the sections back.
    pub fn take_sections(&mut self) -> Vec<Section> {
        self.parts
            .iter_mut()
            .flat_map(|p| p.chapters.iter_mut())
            .flat_map(|c| std::mem::take(&mut c.sections))
            .collect()
    }

    /// Returns sections to their owning chapters and restores ordinal order.
    pub fn restore_sections(&mut self, sections: Vec<Section>) -> anyhow::Result<()> {
        let mut index = HashMap::new();
        for (pi, part) in self.parts.iter().enumerate() {
            for (ci, chapter) in part.chapters.iter().enumerate() {
                index.insert(chapter.id.clone(), (pi, ci));
            }
        }

        for section in sections {
            let Some(&(pi, ci)) = index.get(&section.chapter_id) else {
                anyhow::bail!(
                    "section {} refers to unknown chapter {}",
                    section.id,
                    section.chapter_id
                );
            };
            self.parts[pi].chapters[ci].sections.push(section);
        }

        for chapter in self.parts.iter_mut().flat_map(|p| p.chapters.iter_mut()) {
            chapter.sections.sort_by_key(|s| s.ordinal);
        }
        Ok(())
    }

    /// Moves every chapter out of the tree, in document order.
    pub fn take_chapters(&mut self) -> Vec<Chapter> {
        self.parts
            .iter_mut()
            .flat_map(|p| std::mem::take(&mut p.chapters))
            .collect()
    }

    pub fn restore_chapters(&mut self, chapters: Vec<Chapter>) -> anyhow::Result<()> {
        let index = self
            .parts
            .iter()
            .enumerate()
            .map(|(pi, p)| (p.id.clone(), pi))
            .collect::<HashMap<_, _>>();

        for chapter in chapters {
            let Some(&pi) = index.get(&chapter.part_id) else {
                anyhow::bail!(
                    "chapter {} refers to unknown part {}",
                    chapter.id,
                    chapter.part_id
                );
            };
            self.parts[pi].chapters.push(chapter);
        }

        for part in &mut self.parts {
            part.chapters.sort_by_key(|c| c.ordinal);
        }
        Ok(())
    }
}
