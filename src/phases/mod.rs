//! Phase executors. Each one takes disjoint units out of the manuscript, runs
//! them with bounded concurrency, joins, and puts them back.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::error::AgentError;
use crate::generation::GenerationUnit;
use crate::progress::ProgressReporter;
use crate::project::{BookBrief, PipelinePhase};

pub mod edit;
pub mod enrich;
pub mod expand;
pub mod matter;
pub mod outline;
pub mod structure;
pub mod write;

/// Everything a phase task needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct PhaseContext {
    pub unit: GenerationUnit,
    pub config: Arc<PipelineConfig>,
    pub brief: Arc<BookBrief>,
    pub progress: Arc<dyn ProgressReporter>,
}

impl PhaseContext {
    pub fn new(
        unit: GenerationUnit,
        config: Arc<PipelineConfig>,
        brief: Arc<BookBrief>,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            unit,
            config,
            brief,
            progress,
        }
    }

    /// Shared opening for every prompt.
    pub(crate) fn book_context(&self) -> String {
        let brief = &self.brief;
        let mut context = format!("Book title: {}\n", brief.title);
        if let Some(subtitle) = brief.subtitle.as_deref() {
            context.push_str(&format!("Subtitle: {subtitle}\n"));
        }
        context.push_str(&format!(
            "Genre: {}\nAudience: {}\nDescription: {}\n",
            brief.genre,
            brief.audience_or_default(),
            brief.description
        ));
        context
    }

    pub(crate) fn system_prompt(&self, role: &str) -> String {
        format!(
            "You are {role} working on a {genre} book for {audience}. \
Write in clear, engaging prose. Output only the requested text.",
            genre = self.brief.genre,
            audience = self.brief.audience_or_default(),
        )
    }
}

/// What a phase did, beyond mutating the manuscript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub processed: usize,
    pub skipped: usize,
    /// Non-fatal rejections, already logged.
    pub warnings: Vec<String>,
}

impl PhaseOutcome {
    pub(crate) fn absorb(&mut self, other: PhaseOutcome) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.warnings.extend(other.warnings);
    }
}

/// Result of one unit task. The unit always comes back so it can be restored.
pub(crate) struct UnitResult<U> {
    pub unit: U,
    pub warnings: Vec<String>,
    pub error: Option<AgentError>,
}

impl<U> UnitResult<U> {
    pub(crate) fn ok(unit: U) -> Self {
        Self {
            unit,
            warnings: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn warn(unit: U, warning: impl ToString) -> Self {
        Self::ok(unit).with_warnings(vec![warning.to_string()])
    }

    pub(crate) fn failed(unit: U, error: AgentError) -> Self {
        Self {
            unit,
            warnings: Vec::new(),
            error: Some(error),
        }
    }

    pub(crate) fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}

/// Runs `task` over `units` with at most `concurrency` in flight and returns
/// the results in input order. Reports progress as tasks finish.
///
/// Every unit comes back. A task that panics or is lost yields
/// [`UnitResult::failed`] holding a copy of the unit as it went in, and the
/// remaining tasks still run to completion.
pub(crate) async fn fan_out<U, F, Fut>(
    progress: &dyn ProgressReporter,
    phase: PipelinePhase,
    concurrency: usize,
    units: Vec<U>,
    task: F,
) -> Vec<UnitResult<U>>
where
    U: Clone + Send + 'static,
    F: Fn(U) -> Fut,
    Fut: Future<Output = UnitResult<U>> + Send + 'static,
{
    let total = units.len();
    let concurrency = concurrency.max(1).min(total.max(1));
    let mut pending = units.into_iter().enumerate();
    let mut inputs: Vec<Option<U>> = std::iter::repeat_with(|| None).take(total).collect();
    let mut results: Vec<Option<UnitResult<U>>> =
        std::iter::repeat_with(|| None).take(total).collect();
    let mut join_set = tokio::task::JoinSet::new();
    let mut done = 0usize;
    let started_at = std::time::Instant::now();
    let mut last_progress_log_at = started_at;

    loop {
        while join_set.len() < concurrency {
            let Some((idx, unit)) = pending.next() else {
                break;
            };
            inputs[idx] = Some(unit.clone());
            // The inner task isolates panics: its handle reports them as a JoinError.
            let handle = tokio::spawn(task(unit));
            join_set.spawn(async move { (idx, handle.await) });
        }

        let Some(joined) = join_set.join_next().await else {
            break;
        };
        let (idx, outcome) = match joined {
            Ok(pair) => pair,
            Err(err) => {
                tracing::error!(phase = %phase, error = %err, "phase task lost");
                continue;
            }
        };
        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(phase = %phase, unit = idx, error = %err, "unit task failed");
                let Some(unit) = inputs[idx].take() else {
                    continue;
                };
                UnitResult::failed(
                    unit,
                    AgentError::fatal(phase, format!("unit task failed: {err}")),
                )
            }
        };
        inputs[idx] = None;
        results[idx] = Some(result);

        done += 1;
        progress.report(
            &format!("{phase}: {done}/{total}"),
            phase.progress_at(done, total),
        );
        if done == total || last_progress_log_at.elapsed() >= Duration::from_secs(2) {
            tracing::debug!(
                phase = %phase,
                done,
                total,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "phase progress"
            );
            last_progress_log_at = std::time::Instant::now();
        }
    }

    results
        .into_iter()
        .zip(inputs)
        .filter_map(|(result, input)| {
            result.or_else(|| {
                input.map(|unit| {
                    UnitResult::failed(unit, AgentError::fatal(phase, "unit task did not finish"))
                })
            })
        })
        .collect()
}

/// Splits unit results into restored units, the outcome, and the first fatal error.
pub(crate) fn settle<U>(
    results: Vec<UnitResult<U>>,
    outcome: &mut PhaseOutcome,
) -> (Vec<U>, Option<AgentError>) {
    let mut units = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        outcome.warnings.extend(result.warnings);
        match result.error {
            Some(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            None => outcome.processed += 1,
        }
        units.push(result.unit);
    }
    (units, first_error)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::generation::{FnGenerator, GenerationRequest, NoopGenerator, TextGenerator};
    use crate::progress::RecordingProgress;

    pub(crate) fn brief() -> BookBrief {
        BookBrief {
            title: "Field Notes on Systems".to_owned(),
            subtitle: None,
            description: "How small teams build reliable systems.".to_owned(),
            target_pages: 50,
            genre: "technical".to_owned(),
            audience: Some("engineers".to_owned()),
        }
    }

    pub(crate) fn context_with(generator: Arc<dyn TextGenerator>) -> PhaseContext {
        PhaseContext::new(
            GenerationUnit::new(generator),
            Arc::new(PipelineConfig::default()),
            Arc::new(brief()),
            Arc::new(RecordingProgress::new()),
        )
    }

    pub(crate) fn noop_context() -> PhaseContext {
        context_with(Arc::new(NoopGenerator))
    }

    /// A generator that counts calls and replies with `reply(request)`.
    pub(crate) fn counting<F>(reply: F) -> (Arc<dyn TextGenerator>, Arc<AtomicUsize>)
    where
        F: Fn(&GenerationRequest) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let generator = FnGenerator::new("counting", move |request: &GenerationRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            reply(request)
        });
        (Arc::new(generator), calls)
    }

    pub(crate) fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[tokio::test]
    async fn fan_out_keeps_input_order_and_respects_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let progress = RecordingProgress::new();

        let results = fan_out(&progress, PipelinePhase::Write, 2, (0..6).collect(), |n: u64| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 * (6 - n))).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                UnitResult::ok(n * 10)
            }
        })
        .await;

        let units = results.iter().map(|r| r.unit).collect::<Vec<_>>();
        assert_eq!(units, vec![0, 10, 20, 30, 40, 50]);
        assert!(results.iter().all(|r| r.error.is_none()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        let updates = progress.updates();
        assert_eq!(updates.len(), 6);
        assert_eq!(updates.last().map(|(_, pct)| *pct), Some(45));
    }

    #[tokio::test]
    async fn fan_out_over_nothing_returns_nothing() {
        let progress = RecordingProgress::new();
        let results = fan_out(&progress, PipelinePhase::Edit, 5, Vec::<u8>::new(), |n| async move {
            UnitResult::ok(n)
        })
        .await;
        assert!(results.is_empty());
        assert!(progress.updates().is_empty());
    }

    #[tokio::test]
    async fn panicking_task_returns_its_unit_and_siblings_finish() {
        let progress = RecordingProgress::new();
        let results = fan_out(&progress, PipelinePhase::Write, 2, (0..5).collect(), |n: u32| async move {
            if n == 1 {
                panic!("unit {n} blew up");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            UnitResult::ok(n + 100)
        })
        .await;

        let units = results.iter().map(|r| r.unit).collect::<Vec<_>>();
        assert_eq!(units, vec![100, 1, 102, 103, 104]);
        let failed = results[1].error.as_ref().map(|e| (e.phase, e.recoverable));
        assert_eq!(failed, Some((PipelinePhase::Write, false)));
        assert_eq!(results.iter().filter(|r| r.error.is_some()).count(), 1);
        assert_eq!(progress.updates().len(), 5);
    }
}
