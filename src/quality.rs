//! Structural and statistical checks run before publication. Nothing here
//! calls a generator.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QualityConfig;
use crate::error::QualityGateFailedError;
use crate::manuscript::{Manuscript, MatterRecord};
use crate::wordcount::count_words;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    WordCount,
    ChapterBalance,
    SectionCoverage,
    ContentQuality,
    StructuralIntegrity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl CheckResult {
    fn new(kind: CheckKind, issues: Vec<String>, recommendation: &str) -> Self {
        let passed = issues.is_empty();
        Self {
            kind,
            passed,
            recommendations: if passed {
                Vec::new()
            } else {
                vec![recommendation.to_owned()]
            },
            issues,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub total_words: usize,
    pub target_words: usize,
    pub completion: f64,
    pub evaluated_at: DateTime<Utc>,
}

impl QualityReport {
    pub fn check(&self, kind: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.kind == kind)
    }

    pub fn word_count_failed(&self) -> bool {
        self.check(CheckKind::WordCount).is_some_and(|c| !c.passed)
    }

    pub fn to_error(&self) -> Option<QualityGateFailedError> {
        (!self.passed).then(|| QualityGateFailedError {
            issues: self.issues.clone(),
            recommendations: self.recommendations.clone(),
        })
    }
}

/// Runs every check; all of them are evaluated even when an earlier one fails.
pub fn evaluate(manuscript: &Manuscript, config: &QualityConfig) -> QualityReport {
    let checks = vec![
        check_word_count(manuscript, config),
        check_chapter_balance(manuscript, config),
        check_section_coverage(manuscript, config),
        check_content_quality(manuscript, config),
        check_structure(manuscript, config),
    ];

    let issues = checks
        .iter()
        .flat_map(|c| c.issues.iter().cloned())
        .collect::<Vec<_>>();
    let recommendations = checks
        .iter()
        .flat_map(|c| c.recommendations.iter().cloned())
        .collect::<Vec<_>>();
    let words = manuscript.word_count();

    let report = QualityReport {
        passed: issues.is_empty(),
        checks,
        issues,
        recommendations,
        total_words: words.actual,
        target_words: words.target,
        completion: words.completion(),
        evaluated_at: Utc::now(),
    };
    tracing::info!(
        passed = report.passed,
        issues = report.issues.len(),
        completion = format!("{:.1}", report.completion),
        "quality gate evaluated"
    );
    report
}

fn check_word_count(manuscript: &Manuscript, config: &QualityConfig) -> CheckResult {
    let words = manuscript.word_count();
    let completion = words.completion();
    let mut issues = Vec::new();
    if completion < config.min_total_completion || completion > config.max_total_completion {
        issues.push(format!(
            "total word count {} is {completion:.1}% of the {}-word target (allowed {:.0}%-{:.0}%)",
            words.actual, words.target, config.min_total_completion, config.max_total_completion
        ));
    }
    CheckResult::new(
        CheckKind::WordCount,
        issues,
        "Run another expansion pass on sections below target.",
    )
}

fn check_chapter_balance(manuscript: &Manuscript, config: &QualityConfig) -> CheckResult {
    let issues = manuscript
        .all_chapters()
        .into_iter()
        .filter_map(|chapter| {
            let completion = chapter.word_count().completion();
            (completion < config.chapter_balance_threshold).then(|| {
                format!(
                    "chapter {} ({}) is at {completion:.1}% of its target",
                    chapter.id, chapter.title
                )
            })
        })
        .collect();
    CheckResult::new(
        CheckKind::ChapterBalance,
        issues,
        "Expand the under-length chapters so the book reads evenly.",
    )
}

fn check_section_coverage(manuscript: &Manuscript, config: &QualityConfig) -> CheckResult {
    let issues = manuscript
        .all_sections()
        .into_iter()
        .filter(|s| s.content.trim().chars().count() <= config.min_section_chars)
        .map(|s| format!("section {} ({}) has little or no content", s.id, s.title))
        .collect();
    CheckResult::new(
        CheckKind::SectionCoverage,
        issues,
        "Regenerate the empty or near-empty sections.",
    )
}

fn check_content_quality(manuscript: &Manuscript, config: &QualityConfig) -> CheckResult {
    let mut issues = Vec::new();
    let mut short_paragraphs = 0usize;

    for section in manuscript.all_sections() {
        if let Some((phrase, count)) = most_repeated_phrase(&section.content, 4)
            && count > config.max_phrase_repetitions
        {
            issues.push(format!(
                "section {} repeats \"{phrase}\" {count} times",
                section.id
            ));
        }
        short_paragraphs += paragraphs(&section.content)
            .filter(|p| !p.starts_with('#') && count_words(p) < config.short_paragraph_words)
            .count();
    }

    if short_paragraphs > config.max_short_paragraphs {
        issues.push(format!(
            "{short_paragraphs} paragraphs are shorter than {} words",
            config.short_paragraph_words
        ));
    }
    CheckResult::new(
        CheckKind::ContentQuality,
        issues,
        "Vary repeated phrasing and merge or develop very short paragraphs.",
    )
}

fn check_structure(manuscript: &Manuscript, config: &QualityConfig) -> CheckResult {
    let mut issues = Vec::new();
    if manuscript.parts.is_empty() {
        issues.push("manuscript has no parts".to_owned());
    }
    if manuscript.chapter_count() == 0 {
        issues.push("manuscript has no chapters".to_owned());
    }
    if manuscript.section_count() == 0 {
        issues.push("manuscript has no sections".to_owned());
    }
    if config.require_front_matter && !matter_complete(&manuscript.front_matter) {
        issues.push("front matter is missing or incomplete".to_owned());
    }
    if config.require_back_matter && !matter_complete(&manuscript.back_matter) {
        issues.push("back matter is missing or incomplete".to_owned());
    }
    CheckResult::new(
        CheckKind::StructuralIntegrity,
        issues,
        "Rebuild the missing structure or matter before publishing.",
    )
}

fn matter_complete(records: &[MatterRecord]) -> bool {
    !records.is_empty() && records.iter().all(MatterRecord::is_present)
}

fn paragraphs(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n\n").map(str::trim).filter(|p| !p.is_empty())
}

/// The most frequent `n`-word phrase, compared case- and punctuation-insensitively.
fn most_repeated_phrase(text: &str, n: usize) -> Option<(String, usize)> {
    let words = text
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    if words.len() < n {
        return None;
    }

    let mut counts: HashMap<&[String], usize> = HashMap::new();
    for window in words.windows(n) {
        *counts.entry(window).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(phrase, count)| (phrase.join(" "), count))
}
