use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::epub::EpubRenderer;
use crate::error::OutputError;
use crate::manuscript::{Chapter, Manuscript, MatterKind, MatterRecord, Part};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Markdown,
    Json,
    Epub,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Json => "json",
            Self::Epub => "epub",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Markdown => "book.md",
            Self::Json => "manuscript.json",
            Self::Epub => "book.epub",
        }
    }
}

/// Turns a finished manuscript into one output file.
pub trait Renderer: Send + Sync {
    fn format(&self) -> OutputFormat;
    fn render(&self, manuscript: &Manuscript, out_dir: &Path) -> anyhow::Result<PathBuf>;
}

pub fn renderer_for(format: OutputFormat) -> Arc<dyn Renderer> {
    match format {
        OutputFormat::Markdown => Arc::new(MarkdownRenderer),
        OutputFormat::Json => Arc::new(JsonRenderer),
        OutputFormat::Epub => Arc::new(EpubRenderer::default()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownRenderer;

impl Renderer for MarkdownRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Markdown
    }

    fn render(&self, manuscript: &Manuscript, out_dir: &Path) -> anyhow::Result<PathBuf> {
        let path = out_dir.join(self.format().file_name());
        fs::write(&path, book_markdown(manuscript))
            .with_context(|| format!("write markdown: {}", path.display()))?;
        Ok(path)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn render(&self, manuscript: &Manuscript, out_dir: &Path) -> anyhow::Result<PathBuf> {
        let path = out_dir.join(self.format().file_name());
        let data = serde_json::to_vec_pretty(manuscript).context("serialize manuscript")?;
        fs::write(&path, data).with_context(|| format!("write json: {}", path.display()))?;
        Ok(path)
    }
}

/// Files written and formats that failed. A failed format never stops the
/// others.
#[derive(Debug, Default)]
pub struct PublishReport {
    pub files: BTreeMap<String, PathBuf>,
    pub failures: Vec<OutputError>,
}

#[derive(Clone, Default)]
pub struct Publisher {
    renderers: Vec<Arc<dyn Renderer>>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.renderers.iter().map(|r| r.format()))
            .finish()
    }
}

impl Publisher {
    pub fn for_formats(formats: &[OutputFormat]) -> Self {
        let mut publisher = Self::default();
        for format in formats {
            if publisher.renderers.iter().all(|r| r.format() != *format) {
                publisher.renderers.push(renderer_for(*format));
            }
        }
        publisher
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderers.push(renderer);
        self
    }

    pub fn formats(&self) -> Vec<OutputFormat> {
        self.renderers.iter().map(|r| r.format()).collect()
    }

    pub fn publish(&self, manuscript: &Manuscript, out_dir: &Path) -> PublishReport {
        let mut report = PublishReport::default();
        if let Err(err) = fs::create_dir_all(out_dir) {
            for renderer in &self.renderers {
                report.failures.push(OutputError {
                    format: renderer.format().as_str().to_owned(),
                    reason: format!("create output dir {}: {err}", out_dir.display()),
                });
            }
            return report;
        }

        for renderer in &self.renderers {
            let format = renderer.format().as_str();
            match renderer.render(manuscript, out_dir) {
                Ok(path) => {
                    tracing::info!(format, path = %path.display(), "rendered");
                    report.files.insert(format.to_owned(), path);
                }
                Err(err) => {
                    let err = OutputError {
                        format: format.to_owned(),
                        reason: format!("{err:#}"),
                    };
                    tracing::warn!(error = %err, "render failed; continuing with other formats");
                    report.failures.push(err);
                }
            }
        }
        report
    }
}

/// The whole book as one Markdown document.
pub fn book_markdown(manuscript: &Manuscript) -> String {
    let mut out = String::new();
    let (opening, rest): (Vec<_>, Vec<_>) = manuscript
        .front_matter
        .iter()
        .partition(|r| matches!(r.kind, MatterKind::TitlePage | MatterKind::Copyright));

    if opening.iter().all(|r| r.kind != MatterKind::TitlePage) {
        out.push_str(&format!("# {}\n\n", manuscript.title));
        if let Some(subtitle) = &manuscript.subtitle {
            out.push_str(&format!("## {subtitle}\n\n"));
        }
    }
    for record in opening {
        push_block(&mut out, record.content.trim());
    }

    out.push_str("## Contents\n\n");
    out.push_str(&table_of_contents(manuscript));
    out.push('\n');

    for record in rest {
        push_block(&mut out, &matter_markdown(record));
    }
    for part in &manuscript.parts {
        push_block(&mut out, &part_markdown(part));
        for chapter in &part.chapters {
            push_block(&mut out, &chapter_markdown(chapter));
        }
    }
    for record in &manuscript.back_matter {
        push_block(&mut out, &matter_markdown(record));
    }
    out
}

fn push_block(out: &mut String, block: &str) {
    if block.is_empty() {
        return;
    }
    out.push_str(block.trim_end());
    out.push_str("\n\n");
}

fn table_of_contents(manuscript: &Manuscript) -> String {
    let mut toc = String::new();
    let matter = |toc: &mut String, records: &[MatterRecord]| {
        for record in records.iter().filter(|r| r.kind.is_generated()) {
            toc.push_str(&format!("- {}\n", record.title));
        }
    };
    matter(&mut toc, &manuscript.front_matter);
    for part in &manuscript.parts {
        toc.push_str(&format!("- {}\n", part.title));
        for chapter in &part.chapters {
            toc.push_str(&format!("  - {}\n", chapter.title));
        }
    }
    matter(&mut toc, &manuscript.back_matter);
    toc
}

/// A front or back matter record with its heading. Title page and copyright
/// carry their own layout.
pub fn matter_markdown(record: &MatterRecord) -> String {
    match record.kind {
        MatterKind::TitlePage | MatterKind::Copyright => record.content.trim().to_owned(),
        _ => format!("## {}\n\n{}", record.title, record.content.trim()),
    }
}

pub fn part_markdown(part: &Part) -> String {
    let mut out = format!("# {}\n", part.title);
    if let Some(intro) = part.introduction.as_deref().filter(|i| !i.trim().is_empty()) {
        out.push('\n');
        out.push_str(intro.trim());
        out.push('\n');
    }
    out
}

/// A chapter with its introduction, sections, summary and takeaways.
pub fn chapter_markdown(chapter: &Chapter) -> String {
    let mut out = format!("## {}\n\n", chapter.title);
    if let Some(intro) = chapter.introduction.as_deref().filter(|i| !i.trim().is_empty()) {
        out.push_str(intro.trim());
        out.push_str("\n\n");
    }
    for section in &chapter.sections {
        out.push_str(&format!("### {}\n\n", section.title));
        if !section.content.trim().is_empty() {
            out.push_str(section.content.trim());
            out.push_str("\n\n");
        }
    }
    if let Some(summary) = chapter.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        out.push_str("### Summary\n\n");
        out.push_str(summary.trim());
        out.push_str("\n\n");
    }
    if !chapter.key_takeaways.is_empty() {
        out.push_str("### Key Takeaways\n\n");
        for takeaway in &chapter.key_takeaways {
            out.push_str(&format!("- {takeaway}\n"));
        }
        out.push('\n');
    }
    out.truncate(out.trim_end().len());
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manuscript::tests::sample_manuscript;

    fn finished() -> Manuscript {
        let mut manuscript = sample_manuscript();
        for section in manuscript.sections_mut() {
            section.content = format!("Body of {}.", section.title);
        }
        if let Some(chapter) = manuscript.get_chapter_mut("ch01") {
            chapter.introduction = Some("Chapter one opens.".to_owned());
            chapter.summary = Some("Chapter one closes.".to_owned());
            chapter.key_takeaways = vec!["First point".to_owned(), "Second point".to_owned()];
        }
        let mut title = MatterRecord::new(MatterKind::TitlePage, "Title Page", 0);
        title.content = "# Sample\n".to_owned();
        let mut preface = MatterRecord::new(MatterKind::Preface, "Preface", 10);
        preface.content = "Why this book.".to_owned();
        let mut conclusion = MatterRecord::new(MatterKind::Conclusion, "Conclusion", 10);
        conclusion.content = "Where next.".to_owned();
        manuscript.front_matter = vec![title, preface];
        manuscript.back_matter = vec![conclusion];
        manuscript
    }

    struct Broken;

    impl Renderer for Broken {
        fn format(&self) -> OutputFormat {
            OutputFormat::Epub
        }

        fn render(&self, _: &Manuscript, _: &Path) -> anyhow::Result<PathBuf> {
            anyhow::bail!("disk full")
        }
    }

    #[test]
    fn markdown_follows_document_order() {
        let md = book_markdown(&finished());
        let order = [
            "# Sample",
            "## Contents",
            "## Preface",
            "# Part One",
            "## Chapter One",
            "Chapter one opens.",
            "### A",
            "### B",
            "### Summary",
            "- Second point",
            "## Chapter Two",
            "# Part Two",
            "### E",
            "## Conclusion",
        ];
        let mut cursor = 0;
        for needle in order {
            let found = md[cursor..]
                .find(needle)
                .unwrap_or_else(|| panic!("missing {needle:?} after byte {cursor}:\n{md}"));
            cursor += found + needle.len();
        }
        assert!(md.contains("  - Chapter Three\n"));
    }

    #[test]
    fn chapter_markdown_skips_absent_apparatus() {
        let manuscript = finished();
        let chapter = manuscript.get_chapter("ch02").expect("chapter");
        let md = chapter_markdown(chapter);
        assert_eq!(md, "## Chapter Two\n\n### C\n\nBody of C.\n");
    }

    #[test]
    fn publish_isolates_failing_formats() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let publisher =
            Publisher::for_formats(&[OutputFormat::Markdown, OutputFormat::Json, OutputFormat::Json])
                .with_renderer(Arc::new(Broken));
        assert_eq!(
            publisher.formats(),
            vec![OutputFormat::Markdown, OutputFormat::Json, OutputFormat::Epub]
        );

        let report = publisher.publish(&finished(), dir.path());
        assert_eq!(report.files.len(), 2);
        assert!(report.files["markdown"].ends_with("book.md"));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].format, "epub");
        assert!(report.failures[0].reason.contains("disk full"));

        let json = fs::read_to_string(&report.files["json"])?;
        let back: Manuscript = serde_json::from_str(&json)?;
        assert_eq!(back.section_count(), 5);
        Ok(())
    }
}
