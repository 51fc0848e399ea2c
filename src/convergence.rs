//! Repeats expansion rounds until every section meets its target or the
//! budget runs out.

use tokio_util::sync::CancellationToken;

use crate::error::ExpansionLimitError;
use crate::manuscript::Manuscript;
use crate::phases::expand::{self, Selection};
use crate::phases::{PhaseContext, PhaseOutcome};

#[derive(Debug, Default)]
pub struct ConvergenceReport {
    pub rounds: usize,
    pub outcome: PhaseOutcome,
    /// Set when the budget ran out with sections still below target.
    pub limit: Option<ExpansionLimitError>,
}

/// Runs up to `max_rounds` rounds. Cancellation is checked between rounds.
pub async fn converge(
    ctx: &PhaseContext,
    manuscript: &mut Manuscript,
    max_rounds: usize,
    cancel: &CancellationToken,
) -> anyhow::Result<ConvergenceReport> {
    let mut report = ConvergenceReport::default();

    while report.rounds < max_rounds {
        if cancel.is_cancelled() {
            tracing::info!(rounds = report.rounds, "expansion cancelled between rounds");
            break;
        }
        let eligible = expand::eligible_count(manuscript, Selection::NeedsExpansion);
        if eligible == 0 {
            break;
        }

        report.rounds += 1;
        tracing::info!(
            round = report.rounds,
            max_rounds,
            eligible,
            completion = manuscript.completion(),
            "expansion round starting"
        );
        let outcome = expand::run_round(ctx, manuscript, Selection::NeedsExpansion).await?;
        report.outcome.absorb(outcome);
    }

    let below = manuscript
        .all_sections()
        .into_iter()
        .filter(|s| s.word_count().needs_expansion())
        .count();
    if below > 0 {
        let err = ExpansionLimitError {
            rounds: report.rounds,
            sections_below_target: below,
        };
        tracing::warn!(
            error = %err,
            attempts_left = expand::eligible_count(manuscript, Selection::NeedsExpansion),
            "expansion did not converge"
        );
        report.limit = Some(err);
    }

    Ok(report)
}
