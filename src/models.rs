use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of one application attempt.
///
/// `pending` → `in_progress` → one of the terminal automation outcomes
/// (`submitted`, `failed`, `duplicate`, `manual_intervention`), then
/// optionally a post-submission outcome recorded by the operator
/// (`rejected`, `interview`, `offer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptStatus {
    Pending,
    InProgress,
    Submitted,
    Failed,
    Duplicate,
    ManualIntervention,
    Rejected,
    Interview,
    Offer,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Duplicate => "duplicate",
            AttemptStatus::ManualIntervention => "manual_intervention",
            AttemptStatus::Rejected => "rejected",
            AttemptStatus::Interview => "interview",
            AttemptStatus::Offer => "offer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptStatus::Pending),
            "in_progress" => Some(AttemptStatus::InProgress),
            "submitted" => Some(AttemptStatus::Submitted),
            "failed" => Some(AttemptStatus::Failed),
            "duplicate" => Some(AttemptStatus::Duplicate),
            "manual_intervention" => Some(AttemptStatus::ManualIntervention),
            "rejected" => Some(AttemptStatus::Rejected),
            "interview" => Some(AttemptStatus::Interview),
            "offer" => Some(AttemptStatus::Offer),
            _ => None,
        }
    }

    /// The application went through (whatever the employer said afterwards).
    pub fn was_submitted(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Submitted
                | AttemptStatus::Rejected
                | AttemptStatus::Interview
                | AttemptStatus::Offer
        )
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            "cancelled" => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A discovered job posting, unique per (site, external_id).
/// Created on first sight, updated on re-scrape, never deleted, only
/// deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: i64,
    pub site: String,
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub job_type: Option<String>,
    pub experience_level: Option<String>,
    pub description: Option<String>,
    pub requirements: Option<String>,
    pub salary_range: Option<String>,
    pub posted_date: Option<String>,
    pub content_hash: String,
    pub match_score: Option<f64>,
    pub requirement_tags: Vec<String>,
    pub scored_profile_version: Option<i64>,
    pub scored_content_hash: Option<String>,
    pub is_active: bool,
    pub discovered_at: String,
    pub updated_at: String,
}

/// A registered resume variant. The files themselves come from the
/// document collaborator; we only keep the lookup data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeVariant {
    pub id: i64,
    pub name: String,
    pub file_path: String,
    pub tags: Vec<String>,
    pub is_default: bool,
    pub created_at: String,
}

/// One planned application. Ephemeral: produced fresh each planning
/// cycle and never mutated after handoff to the coordinator.
#[derive(Debug, Clone)]
pub struct ApplicationPlan {
    pub posting: JobPosting,
    pub resume_variant_id: i64,
    pub resume_path: String,
    pub priority: f64,
    pub planned_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationAttempt {
    pub id: i64,
    pub profile: String,
    pub posting_id: i64,
    pub session_id: Option<i64>,
    pub status: AttemptStatus,
    pub resume_variant_id: Option<i64>,
    pub resume_path: Option<String>,
    pub retry_count: u32,
    pub last_retry_at: Option<String>,
    pub last_state: Option<String>,
    pub confirmation_ref: Option<String>,
    pub error_message: Option<String>,
    pub screenshot_path: Option<String>,
    pub submitted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One coordinator run. Counters always equal the sum of attempt
/// outcomes recorded under this session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationSession {
    pub id: i64,
    pub profile: String,
    pub status: SessionStatus,
    pub target_sites: Vec<String>,
    pub attempted: i64,
    pub successful: i64,
    pub failed: i64,
    pub duplicates: i64,
    pub manual: i64,
    pub site_counts: HashMap<String, i64>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub notes: Option<String>,
}

/// Append-only error log row; only `resolved_at` is ever set after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub attempt_id: Option<i64>,
    pub session_id: Option<i64>,
    pub error_type: String,
    pub category: String,
    pub site: Option<String>,
    pub message: String,
    pub url: Option<String>,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
    pub screenshot_path: Option<String>,
    pub occurred_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteWeight {
    pub site: String,
    pub weight: f64,
    pub updated_at: String,
}

/// One terminal attempt outcome inside the feedback loop's trailing
/// window, joined with the posting's site and requirement tags.
#[derive(Debug, Clone)]
pub struct WindowedOutcome {
    pub site: String,
    pub status: AttemptStatus,
    pub resume_variant_id: Option<i64>,
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_status_roundtrip() {
        for status in [
            AttemptStatus::Pending,
            AttemptStatus::InProgress,
            AttemptStatus::Submitted,
            AttemptStatus::Failed,
            AttemptStatus::Duplicate,
            AttemptStatus::ManualIntervention,
            AttemptStatus::Rejected,
            AttemptStatus::Interview,
            AttemptStatus::Offer,
        ] {
            assert_eq!(AttemptStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AttemptStatus::parse("bogus"), None);
    }

    #[test]
    fn was_submitted_covers_post_submission_outcomes() {
        assert!(AttemptStatus::Submitted.was_submitted());
        assert!(AttemptStatus::Rejected.was_submitted());
        assert!(AttemptStatus::Interview.was_submitted());
        assert!(AttemptStatus::Offer.was_submitted());
        assert!(!AttemptStatus::Failed.was_submitted());
        assert!(!AttemptStatus::Duplicate.was_submitted());
        assert!(!AttemptStatus::ManualIntervention.was_submitted());
    }

    #[test]
    fn session_status_roundtrip() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Cancelled,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
    }
}
