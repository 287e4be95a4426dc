//! Application planner.
//!
//! Purely derives an ordered plan list from scored postings, the profile
//! budget, and the current priority weights. No side effects; attempt
//! rows only come into existence when the coordinator hands a plan to
//! the state machine.

use std::collections::{HashMap, HashSet};

use crate::config::UserProfile;
use crate::models::{ApplicationPlan, JobPosting, ResumeVariant};

/// Historical success counts per (resume variant, requirement tag),
/// built by the feedback loop from the trailing outcome window.
#[derive(Debug, Default)]
pub struct VariantStats {
    per_tag: HashMap<(i64, String), (u32, u32)>, // (attempts, successes)
}

impl VariantStats {
    pub fn record(&mut self, variant_id: i64, tag: &str, success: bool) {
        let entry = self.per_tag.entry((variant_id, tag.to_string())).or_insert((0, 0));
        entry.0 += 1;
        if success {
            entry.1 += 1;
        }
    }

    /// Mean success rate of this variant across the given tags, using
    /// only tags with history. None when no tag has any.
    pub fn success_rate(&self, variant_id: i64, tags: &[String]) -> Option<f64> {
        let rates: Vec<f64> = tags
            .iter()
            .filter_map(|tag| {
                self.per_tag
                    .get(&(variant_id, tag.clone()))
                    .map(|(attempts, successes)| *successes as f64 / (*attempts).max(1) as f64)
            })
            .collect();
        if rates.is_empty() {
            None
        } else {
            Some(rates.iter().sum::<f64>() / rates.len() as f64)
        }
    }
}

pub struct PlanningContext<'a> {
    pub profile: &'a UserProfile,
    pub today_submitted: u32,
    /// Posting ids with an attempt past `pending` for this profile.
    pub attempted: &'a HashSet<i64>,
    pub weights: &'a HashMap<String, f64>,
    pub variants: &'a [ResumeVariant],
    pub stats: &'a VariantStats,
    pub min_score: f64,
}

/// Build today's plan: filter, prioritize, order, truncate to the
/// remaining daily budget. Deterministic for identical inputs.
pub fn plan(candidates: &[JobPosting], ctx: &PlanningContext) -> Vec<ApplicationPlan> {
    let budget = ctx
        .profile
        .max_applications_per_day
        .saturating_sub(ctx.today_submitted) as usize;
    if budget == 0 {
        return Vec::new();
    }

    let planned_at = chrono::Utc::now().to_rfc3339();
    let mut plans: Vec<ApplicationPlan> = candidates
        .iter()
        .filter(|p| p.is_active)
        .filter(|p| !ctx.attempted.contains(&p.id))
        .filter(|p| p.match_score.unwrap_or(0.0) >= ctx.min_score)
        .filter(|p| {
            ctx.profile.preferred_sites.is_empty()
                || ctx.profile.preferred_sites.contains(&p.site)
        })
        .filter_map(|p| {
            let (variant, affinity) = select_variant(ctx.variants, &p.requirement_tags, ctx.stats)?;
            let site_weight = ctx.weights.get(&p.site).copied().unwrap_or(1.0);
            let priority = p.match_score.unwrap_or(0.0) * site_weight * affinity;
            Some(ApplicationPlan {
                posting: p.clone(),
                resume_variant_id: variant.id,
                resume_path: variant.file_path.clone(),
                priority,
                planned_at: planned_at.clone(),
            })
        })
        .collect();

    plans.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            // Older postings first on ties (deadline risk).
            .then_with(|| match (&a.posting.posted_date, &b.posting.posted_date) {
                (Some(x), Some(y)) => x.cmp(y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.posting.id.cmp(&b.posting.id))
    });

    plans.truncate(budget);
    plans
}

/// Pick the variant with the best historical success rate for these
/// tags; with no history anywhere, fall back to the default variant
/// (or the first registered one). Returns the variant and its affinity
/// multiplier. None when no variants are registered at all.
pub fn select_variant<'a>(
    variants: &'a [ResumeVariant],
    tags: &[String],
    stats: &VariantStats,
) -> Option<(&'a ResumeVariant, f64)> {
    let best = variants
        .iter()
        .filter_map(|v| stats.success_rate(v.id, tags).map(|rate| (v, rate)))
        .max_by(|(va, ra), (vb, rb)| {
            ra.partial_cmp(rb)
                .unwrap_or(std::cmp::Ordering::Equal)
                // Lower id wins ties so the choice is stable.
                .then_with(|| vb.id.cmp(&va.id))
        });

    if let Some((variant, rate)) = best {
        // Map the rate into [0.5, 1.5] so history nudges priority
        // without zeroing it out.
        return Some((variant, 0.5 + rate));
    }

    variants
        .iter()
        .find(|v| v.is_default)
        .or_else(|| variants.first())
        .map(|v| (v, 1.0))
}
