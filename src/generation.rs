//! Text generation providers and the primary/fallback unit every phase calls.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash as _, Hasher as _};
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;

use crate::config::GenerationConfig;
use crate::error::AgentError;
use crate::project::PipelinePhase;

const LENGTH_DIRECTIVE: &str = "Target length: approximately";
const NOOP_DEFAULT_WORDS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationRequest {
    pub fn new(system_prompt: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: system_prompt.into(),
            max_tokens: 1024,
            temperature: 0.7,
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// The line prompts use to ask for a reply length.
pub fn length_directive(words: usize) -> String {
    format!("{LENGTH_DIRECTIVE} {words} words.")
}

/// Reads the word count requested via [`length_directive`], if any.
pub fn requested_words(prompt: &str) -> Option<usize> {
    let idx = prompt.find(LENGTH_DIRECTIVE)?;
    prompt[idx + LENGTH_DIRECTIVE.len()..]
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String>;
}

/// A primary provider, an optional fallback, and a retry budget.
///
/// One call tries the primary, then the fallback; an empty reply counts as a
/// failure. The whole pair is retried with exponential backoff.
#[derive(Clone)]
pub struct GenerationUnit {
    primary: Arc<dyn TextGenerator>,
    fallback: Option<Arc<dyn TextGenerator>>,
    retry_attempts: usize,
    retry_base_delay: Duration,
}

impl std::fmt::Debug for GenerationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationUnit")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|g| g.name()))
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_base_delay", &self.retry_base_delay)
            .finish()
    }
}

impl GenerationUnit {
    pub fn new(primary: Arc<dyn TextGenerator>) -> Self {
        Self {
            primary,
            fallback: None,
            retry_attempts: 1,
            retry_base_delay: Duration::ZERO,
        }
    }

    pub fn from_config(
        primary: Arc<dyn TextGenerator>,
        fallback: Option<Arc<dyn TextGenerator>>,
        config: &GenerationConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: config.retry_base_delay(),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn TextGenerator>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_retry(mut self, attempts: usize, base_delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_base_delay = base_delay;
        self
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    pub async fn generate(
        &self,
        phase: PipelinePhase,
        request: &GenerationRequest,
    ) -> Result<String, AgentError> {
        retry_with_backoff(phase, self.retry_attempts, self.retry_base_delay, move |_| {
            self.generate_once(request)
        })
        .await
    }

    async fn generate_once(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        let primary_err = match self.primary.generate(request).await {
            Ok(text) if !text.trim().is_empty() => return Ok(text),
            Ok(_) => anyhow::anyhow!("{} returned empty output", self.primary.name()),
            Err(err) => err.context(format!("{} generate", self.primary.name())),
        };

        let Some(fallback) = self.fallback.as_ref() else {
            return Err(primary_err);
        };
        tracing::warn!(
            primary = self.primary.name(),
            fallback = fallback.name(),
            error = %format!("{primary_err:#}"),
            "primary generator failed; trying fallback"
        );

        match fallback.generate(request).await {
            Ok(text) if !text.trim().is_empty() => Ok(text),
            Ok(_) => anyhow::bail!(
                "{primary_err:#}; fallback {} returned empty output",
                fallback.name()
            ),
            Err(err) => anyhow::bail!("{primary_err:#}; fallback {}: {err:#}", fallback.name()),
        }
    }
}

/// Runs `op` up to `max_attempts` times, sleeping `base_delay * 2^n` between
/// attempts. Exhaustion becomes a fatal [`AgentError`] for `phase`.
pub async fn retry_with_backoff<T, F, Fut>(
    phase: PipelinePhase,
    max_attempts: usize,
    base_delay: Duration,
    mut op: F,
) -> Result<T, AgentError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = max_attempts.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(
                    phase = %phase,
                    attempt = attempt + 1,
                    attempts,
                    error = %format!("{err:#}"),
                    "generation attempt failed"
                );
                last_err = Some(err);
            }
        }

        if attempt + 1 < attempts {
            let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
            tokio::time::sleep(base_delay.saturating_mul(factor)).await;
        }
    }

    let message = match last_err {
        Some(err) => format!("{attempts} attempt(s) exhausted: {err:#}"),
        None => format!("{attempts} attempt(s) exhausted"),
    };
    Err(AgentError::fatal(phase, message))
}

/// Deterministic offline generator.
///
/// Emits plain prose of the length named by the prompt's length directive,
/// seeded from the prompt so reruns reproduce the same text. It never returns
/// JSON, so every structured caller exercises its fallback path.
#[derive(Debug, Clone, Default)]
pub struct NoopGenerator;

#[async_trait]
impl TextGenerator for NoopGenerator {
    fn name(&self) -> &str {
        "noop"
    }

    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        let words = requested_words(&request.prompt).unwrap_or(NOOP_DEFAULT_WORDS);
        let mut hasher = DefaultHasher::new();
        request.prompt.hash(&mut hasher);
        Ok(filler_text(hasher.finish(), words))
    }
}

const VOCABULARY: [&str; 60] = [
    "practice", "system", "design", "reader", "approach", "detail", "example", "method",
    "pattern", "result", "context", "change", "decision", "process", "model", "value",
    "structure", "problem", "solution", "insight", "principle", "step", "outcome", "feedback",
    "careful", "simple", "useful", "clear", "steady", "common", "practical", "important",
    "builds", "explains", "shows", "supports", "guides", "connects", "reveals", "shapes",
    "often", "gradually", "together", "clearly", "usually", "directly", "finally", "again",
    "with", "through", "across", "within", "before", "after", "because", "while", "every",
    "each", "this", "that",
];

fn filler_text(seed: u64, words: usize) -> String {
    let mut state = seed | 1;
    let mut next = move || {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (state >> 33) as usize
    };

    let mut paragraphs = Vec::new();
    let mut remaining = words;
    while remaining > 0 {
        let mut len = 60 + next() % 41;
        if remaining < len + 20 {
            len = remaining;
        }
        remaining -= len;

        let mut paragraph = String::new();
        let mut sentence_len = 0usize;
        for idx in 0..len {
            let word = VOCABULARY[next() % VOCABULARY.len()];
            if sentence_len == 0 {
                let mut chars = word.chars();
                if let Some(first) = chars.next() {
                    paragraph.extend(first.to_uppercase());
                    paragraph.push_str(chars.as_str());
                }
            } else {
                paragraph.push(' ');
                paragraph.push_str(word);
            }
            sentence_len += 1;
            if sentence_len >= 8 + next() % 8 || idx + 1 == len {
                paragraph.push('.');
                if idx + 1 < len {
                    paragraph.push(' ');
                }
                sentence_len = 0;
            }
        }
        paragraphs.push(paragraph);
    }
    paragraphs.join("\n\n")
}

/// Adapts a closure into a generator.
pub struct FnGenerator<F> {
    name: String,
    f: F,
}

impl<F> FnGenerator<F>
where
    F: Fn(&GenerationRequest) -> anyhow::Result<String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> TextGenerator for FnGenerator<F>
where
    F: Fn(&GenerationRequest) -> anyhow::Result<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        (self.f)(request)
    }
}

/// Runs an external program per call: the prompt goes to stdin, the reply is
/// read from stdout. The system prompt and sampling knobs travel as env vars.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl TextGenerator for CommandGenerator {
    fn name(&self) -> &str {
        &self.program
    }

    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        let command = self.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || command.run(&request))
            .await
            .context("join generator command task")?
    }
}

impl CommandGenerator {
    fn run(&self, request: &GenerationRequest) -> anyhow::Result<String> {
        let program = &self.program;
        tracing::debug!(engine = "command", command = %program, "generate");

        let mut child = Command::new(program)
            .args(&self.args)
            .env("PAGEWRIGHT_SYSTEM_PROMPT", &request.system_prompt)
            .env("PAGEWRIGHT_MAX_TOKENS", request.max_tokens.to_string())
            .env("PAGEWRIGHT_TEMPERATURE", request.temperature.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn generator command: {program}"))?;

        {
            let mut stdin = child.stdin.take().context("open generator stdin")?;
            stdin
                .write_all(request.prompt.as_bytes())
                .context("write generator stdin")?;
        }

        let output = child.wait_with_output().context("wait generator process")?;
        if !output.status.success() {
            anyhow::bail!("generator command failed: {program} ({})", output.status);
        }

        String::from_utf8(output.stdout).context("generator stdout is not valid UTF-8")
    }
}
