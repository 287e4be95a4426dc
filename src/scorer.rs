//! Match scorer adapter.
//!
//! The similarity service is a black box behind HTTP: we send a profile
//! summary and the posting text, it returns a bounded score plus the
//! requirement tags it extracted. Every transport, timeout, or parse
//! failure collapses to `ScoreError::Unavailable`, and the planner
//! treats the posting as score 0 (excluded) instead of blocking the
//! pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::UserProfile;
use crate::db::Database;
use crate::models::JobPosting;

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("scoring service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Fit score in [0, 1].
    pub score: f64,
    pub tags: Vec<String>,
}

/// Condensed profile sent to the scoring service.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSummary {
    pub skills: Vec<String>,
    pub experience_years: u32,
    pub location: Option<String>,
}

impl ProfileSummary {
    pub fn from_profile(profile: &UserProfile) -> Self {
        Self {
            skills: profile.skills.clone(),
            experience_years: profile.experience_years,
            location: profile.location.clone(),
        }
    }
}

#[async_trait]
pub trait MatchScorer: Send + Sync {
    async fn score(
        &self,
        profile: &ProfileSummary,
        posting: &JobPosting,
    ) -> Result<MatchResult, ScoreError>;
}

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    profile: &'a ProfileSummary,
    posting: PostingPayload<'a>,
}

#[derive(Debug, Serialize)]
struct PostingPayload<'a> {
    title: &'a str,
    company: &'a str,
    description: &'a str,
    requirements: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: f64,
    #[serde(default)]
    tags: Vec<String>,
}

pub struct HttpScorer {
    client: reqwest::Client,
    url: String,
}

impl HttpScorer {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ScoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl MatchScorer for HttpScorer {
    async fn score(
        &self,
        profile: &ProfileSummary,
        posting: &JobPosting,
    ) -> Result<MatchResult, ScoreError> {
        let request = ScoreRequest {
            profile,
            posting: PostingPayload {
                title: &posting.title,
                company: &posting.company,
                description: posting.description.as_deref().unwrap_or(""),
                requirements: posting.requirements.as_deref().unwrap_or(""),
            },
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ScoreError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ScoreError::Unavailable(format!(
                "status {}",
                response.status()
            )));
        }

        let parsed: ScoreResponse = response
            .json()
            .await
            .map_err(|e| ScoreError::Unavailable(format!("bad response: {e}")))?;

        Ok(MatchResult {
            score: parsed.score.clamp(0.0, 1.0),
            tags: parsed.tags,
        })
    }
}

#[derive(Debug, Default)]
pub struct ScoreStats {
    pub scored: usize,
    pub unavailable: usize,
}

/// Score every active posting whose cached score is missing or stale
/// for this profile version. Failures skip the posting and move on.
pub async fn score_pending(
    db: &Database,
    scorer: &dyn MatchScorer,
    profile: &UserProfile,
    limit: usize,
) -> anyhow::Result<ScoreStats> {
    let summary = ProfileSummary::from_profile(profile);
    let pending = db.postings_needing_score(profile.profile_version, limit)?;
    let mut stats = ScoreStats::default();

    for posting in &pending {
        match scorer.score(&summary, posting).await {
            Ok(result) => {
                db.set_match_score(posting.id, result.score, &result.tags, profile.profile_version)?;
                info!(posting = posting.id, score = result.score, "scored");
                stats.scored += 1;
            }
            Err(ScoreError::Unavailable(reason)) => {
                warn!(posting = posting.id, %reason, "scoring unavailable, skipping");
                stats.unavailable += 1;
            }
        }
    }

    Ok(stats)
}
