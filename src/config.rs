use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::publish::OutputFormat;

/// Knobs for one pipeline run. Every field has a default, so a YAML file only
/// needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub words_per_page: usize,
    pub front_matter_pages: usize,
    pub back_matter_pages: usize,
    pub target_words_per_section: usize,
    pub default_sections_per_chapter: usize,

    /// Concurrent generation calls within one phase.
    pub concurrency: usize,
    pub max_expansion_attempts: usize,
    pub max_total_expansion_rounds: usize,

    /// Entries kept in the project's recent-error log.
    pub error_log_capacity: usize,

    pub generation: GenerationConfig,
    pub edit: EditConfig,
    pub quality: QualityConfig,
    pub formats: Vec<OutputFormat>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            words_per_page: 300,
            front_matter_pages: 10,
            back_matter_pages: 15,
            target_words_per_section: 1500,
            default_sections_per_chapter: 4,
            concurrency: 5,
            max_expansion_attempts: 3,
            max_total_expansion_rounds: 5,
            error_log_capacity: 20,
            generation: GenerationConfig::default(),
            edit: EditConfig::default(),
            quality: QualityConfig::default(),
            formats: vec![OutputFormat::Markdown, OutputFormat::Json, OutputFormat::Epub],
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&yaml)
            .with_context(|| format!("parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.words_per_page == 0 {
            anyhow::bail!("words_per_page must be > 0");
        }
        if self.target_words_per_section == 0 {
            anyhow::bail!("target_words_per_section must be > 0");
        }
        if self.default_sections_per_chapter == 0 {
            anyhow::bail!("default_sections_per_chapter must be > 0");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be > 0");
        }
        if !(0.0..=1.0).contains(&self.edit.min_preserved_ratio) {
            anyhow::bail!("edit.min_preserved_ratio must be within 0.0..=1.0");
        }
        if self.quality.min_total_completion > self.quality.max_total_completion {
            anyhow::bail!("quality.min_total_completion must not exceed max_total_completion");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Attempts for one unit call, each of which already tries primary then fallback.
    pub retry_attempts: usize,
    pub retry_base_delay_ms: u64,
    /// Upper bound on `max_tokens` for any single call.
    pub max_tokens_cap: u32,
    pub outline_temperature: f32,
    pub write_temperature: f32,
    pub expand_temperature: f32,
    pub enrich_temperature: f32,
    pub edit_temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 2,
            retry_base_delay_ms: 1000,
            max_tokens_cap: 8192,
            outline_temperature: 0.5,
            write_temperature: 0.7,
            expand_temperature: 0.7,
            enrich_temperature: 0.6,
            edit_temperature: 0.3,
        }
    }
}

impl GenerationConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Rough token allowance for a reply of `words` words.
    pub fn tokens_for_words(&self, words: usize) -> u32 {
        let estimate = (words as f64 * 1.5).ceil() as u64 + 256;
        estimate.min(u64::from(self.max_tokens_cap)) as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditConfig {
    pub min_preserved_ratio: f64,
    pub neighbor_context_words: usize,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            min_preserved_ratio: 0.9,
            neighbor_context_words: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub min_total_completion: f64,
    pub max_total_completion: f64,
    pub chapter_balance_threshold: f64,
    /// Sections at or below this many characters count as uncovered.
    pub min_section_chars: usize,
    pub max_phrase_repetitions: usize,
    pub short_paragraph_words: usize,
    pub max_short_paragraphs: usize,
    pub require_front_matter: bool,
    pub require_back_matter: bool,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_total_completion: 95.0,
            max_total_completion: 105.0,
            chapter_balance_threshold: 80.0,
            min_section_chars: 100,
            max_phrase_repetitions: 5,
            short_paragraph_words: 20,
            max_short_paragraphs: 20,
            require_front_matter: true,
            require_back_matter: true,
        }
    }
}
