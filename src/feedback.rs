//! Feedback loop: turns the trailing window of attempt outcomes into
//! updated site weights and variant/tag statistics.
//!
//! This is the only mutation path for priority weights, and it runs
//! between sessions only, so a session's behavior stays deterministic
//! given its starting plan.

use anyhow::Result;
use std::collections::HashMap;
use tracing::info;

use crate::db::Database;
use crate::models::{AttemptStatus, WindowedOutcome};
use crate::planner::VariantStats;

#[derive(Debug, Clone, Copy)]
pub struct FeedbackConfig {
    pub learning_rate: f64,
    pub target_rate: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    pub window_attempts: usize,
    pub window_days: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightChange {
    pub site: String,
    pub old_weight: f64,
    pub new_weight: f64,
    pub success_rate: f64,
    pub attempts: u32,
}

/// Per-site (attempts, successes) over the window. Success at the site
/// level means the application went through; duplicates and parked
/// attempts count as neither.
pub fn site_outcome_counts(outcomes: &[WindowedOutcome]) -> HashMap<String, (u32, u32)> {
    let mut counts: HashMap<String, (u32, u32)> = HashMap::new();
    for outcome in outcomes {
        if matches!(
            outcome.status,
            AttemptStatus::Duplicate | AttemptStatus::ManualIntervention
        ) {
            continue;
        }
        let entry = counts.entry(outcome.site.clone()).or_insert((0, 0));
        entry.0 += 1;
        if outcome.status.was_submitted() {
            entry.1 += 1;
        }
    }
    counts
}

/// Smoothed multiplier update, clamped to the configured bounds.
pub fn updated_weight(old_weight: f64, success_rate: f64, cfg: &FeedbackConfig) -> f64 {
    let new_weight = old_weight * (1.0 + cfg.learning_rate * (success_rate - cfg.target_rate));
    new_weight.clamp(cfg.min_weight, cfg.max_weight)
}

/// Variant/tag success counts for the planner's resume selection.
/// Here success means the application earned a positive response;
/// that is the signal a resume variant can actually influence.
pub fn variant_stats(outcomes: &[WindowedOutcome]) -> VariantStats {
    let mut stats = VariantStats::default();
    for outcome in outcomes {
        let Some(variant_id) = outcome.resume_variant_id else {
            continue;
        };
        if !outcome.status.was_submitted() {
            continue;
        }
        let positive = matches!(
            outcome.status,
            AttemptStatus::Interview | AttemptStatus::Offer
        );
        for tag in &outcome.tags {
            stats.record(variant_id, tag, positive);
        }
    }
    stats
}

/// Recompute and persist every site weight from the trailing window.
/// Sites with no outcomes in the window keep their current weight.
pub fn update_site_weights(db: &Database, cfg: &FeedbackConfig) -> Result<Vec<WeightChange>> {
    let outcomes = db.windowed_outcomes(cfg.window_days, cfg.window_attempts)?;
    let counts = site_outcome_counts(&outcomes);
    let current = db.site_weights()?;
    let mut changes = Vec::new();

    for (site, (attempts, successes)) in counts {
        if attempts == 0 {
            continue;
        }
        let success_rate = successes as f64 / attempts.max(1) as f64;
        let old_weight = current.get(&site).copied().unwrap_or(1.0);
        let new_weight = updated_weight(old_weight, success_rate, cfg);

        db.set_site_weight(&site, new_weight)?;
        info!(%site, old_weight, new_weight, success_rate, "weight updated");
        changes.push(WeightChange {
            site,
            old_weight,
            new_weight,
            success_rate,
            attempts,
        });
    }

    changes.sort_by(|a, b| a.site.cmp(&b.site));
    Ok(changes)
}
