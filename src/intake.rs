//! Job intake normalizer.
//!
//! Raw posting records arrive from the scraping collaborator as JSON in
//! whatever shape each site produces; extra fields are ignored. A record
//! missing its mandatory fields (title, company, url) is skipped with a
//! `NormalizationError`, never fatal to the rest of the batch.

use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::{Database, UpsertOutcome};

#[derive(Debug, Error)]
#[error("normalization failed: {0}")]
pub struct NormalizationError(pub String);

/// Raw record as scraped. Field aliases cover the shapes the supported
/// sites emit; anything else is ignored by serde.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPosting {
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default, alias = "id", alias = "job_id", alias = "jk")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "company_name", alias = "employer")]
    pub company: Option<String>,
    #[serde(default, alias = "link", alias = "job_url")]
    pub url: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "employment_type")]
    pub job_type: Option<String>,
    #[serde(default)]
    pub experience_level: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default, alias = "salary")]
    pub salary_range: Option<String>,
    #[serde(default, alias = "date_posted")]
    pub posted_date: Option<String>,
    /// Scrapers set this to false when a posting has closed. Postings
    /// are never deleted, only deactivated.
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Canonical posting ready for the store.
#[derive(Debug, Clone)]
pub struct NormalizedPosting {
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
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

pub fn normalize(raw: &RawPosting) -> Result<NormalizedPosting, NormalizationError> {
    let title = mandatory(&raw.title, "title")?;
    let company = mandatory(&raw.company, "company")?;
    let url = mandatory(&raw.url, "url")?;

    let site = match &raw.site {
        Some(s) if !s.trim().is_empty() => s.trim().to_lowercase(),
        _ => site_from_url(&url)
            .ok_or_else(|| NormalizationError(format!("cannot infer site from url: {url}")))?,
    };

    let hash = content_hash(
        &title,
        &company,
        raw.location.as_deref().unwrap_or(""),
        raw.description.as_deref().unwrap_or(""),
        raw.requirements.as_deref().unwrap_or(""),
        raw.salary_range.as_deref().unwrap_or(""),
    );

    let external_id = match &raw.external_id {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        // Last resort: the hash prefix keeps (site, external_id) unique.
        _ => external_id_from_url(&site, &url).unwrap_or_else(|| hash[..16].to_string()),
    };

    Ok(NormalizedPosting {
        site,
        external_id,
        url,
        title,
        company,
        location: clean_opt(&raw.location),
        job_type: clean_opt(&raw.job_type),
        experience_level: clean_opt(&raw.experience_level),
        description: clean_opt(&raw.description),
        requirements: clean_opt(&raw.requirements),
        salary_range: clean_opt(&raw.salary_range),
        posted_date: clean_opt(&raw.posted_date),
        content_hash: hash,
    })
}

/// Run a batch of raw JSON records through the normalizer and the store.
pub fn ingest_records(
    db: &Database,
    records: &[serde_json::Value],
    dry_run: bool,
) -> anyhow::Result<IngestStats> {
    let mut stats = IngestStats::default();

    for value in records {
        stats.seen += 1;

        let raw: RawPosting = match serde_json::from_value(value.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "skipping malformed record");
                stats.skipped += 1;
                continue;
            }
        };

        let normalized = match normalize(&raw) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "skipping record");
                stats.skipped += 1;
                continue;
            }
        };

        if dry_run {
            debug!(site = %normalized.site, external_id = %normalized.external_id, "dry run, not storing");
            continue;
        }

        let posting_id = match db.upsert_posting(&normalized)? {
            UpsertOutcome::Inserted(id) => {
                stats.inserted += 1;
                id
            }
            UpsertOutcome::Updated(id) => {
                stats.updated += 1;
                id
            }
            UpsertOutcome::Unchanged(id) => {
                stats.unchanged += 1;
                id
            }
        };

        // Seeing a record at all means the posting is live, unless the
        // scraper explicitly says otherwise.
        db.set_posting_active(posting_id, raw.is_active != Some(false))?;
    }

    Ok(stats)
}

pub fn content_hash(
    title: &str,
    company: &str,
    location: &str,
    description: &str,
    requirements: &str,
    salary_range: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [title, company, location, description, requirements, salary_range] {
        hasher.update(part.trim().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn mandatory(field: &Option<String>, name: &str) -> Result<String, NormalizationError> {
    match field {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(NormalizationError(format!("missing mandatory field: {name}"))),
    }
}

fn clean_opt(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn site_from_url(url: &str) -> Option<String> {
    let lower = url.to_lowercase();
    for site in ["linkedin", "indeed", "dice"] {
        if lower.contains(&format!("{site}.com")) {
            return Some(site.to_string());
        }
    }
    None
}

fn external_id_from_url(site: &str, url: &str) -> Option<String> {
    static LINKEDIN: OnceLock<Regex> = OnceLock::new();
    static INDEED: OnceLock<Regex> = OnceLock::new();
    static DICE: OnceLock<Regex> = OnceLock::new();

    let re = match site {
        "linkedin" => LINKEDIN.get_or_init(|| Regex::new(r"/jobs/view/(\d+)").unwrap()),
        "indeed" => INDEED.get_or_init(|| Regex::new(r"[?&]jk=([A-Za-z0-9]+)").unwrap()),
        "dice" => DICE.get_or_init(|| Regex::new(r"/job-detail/([A-Za-z0-9-]+)").unwrap()),
        _ => return None,
    };
    re.captures(url).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, UpsertOutcome};

    fn raw(title: &str, company: &str, url: &str) -> RawPosting {
        RawPosting {
            title: Some(title.to_string()),
            company: Some(company.to_string()),
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn missing_mandatory_field_is_an_error() {
        let mut record = raw("Engineer", "Acme", "https://linkedin.com/jobs/view/1");
        record.title = None;
        assert!(normalize(&record).is_err());

        let mut record = raw("Engineer", "Acme", "https://linkedin.com/jobs/view/1");
        record.company = Some("   ".to_string());
        assert!(normalize(&record).is_err());

        let mut record = raw("Engineer", "Acme", "https://linkedin.com/jobs/view/1");
        record.url = None;
        assert!(normalize(&record).is_err());
    }

    #[test]
    fn site_inferred_from_url_host() {
        let record = raw("Engineer", "Acme", "https://www.indeed.com/viewjob?jk=abc123");
        let normalized = normalize(&record).unwrap();
        assert_eq!(normalized.site, "indeed");
        assert_eq!(normalized.external_id, "abc123");
    }

    #[test]
    fn external_id_extracted_per_site() {
        let n = normalize(&raw("E", "A", "https://www.linkedin.com/jobs/view/4242?refId=x")).unwrap();
        assert_eq!(n.external_id, "4242");

        let n = normalize(&raw("E", "A", "https://www.dice.com/job-detail/ab-12-cd")).unwrap();
        assert_eq!(n.external_id, "ab-12-cd");
    }

    #[test]
    fn external_id_falls_back_to_hash_prefix() {
        let mut record = raw("E", "A", "https://www.linkedin.com/jobs/somewhere-else");
        record.site = Some("linkedin".to_string());
        let n = normalize(&record).unwrap();
        assert_eq!(n.external_id.len(), 16);
        assert!(n.content_hash.starts_with(&n.external_id));
    }

    #[test]
    fn unknown_host_without_site_is_an_error() {
        let record = raw("E", "A", "https://jobs.example.com/123");
        assert!(normalize(&record).is_err());
    }

    #[test]
    fn explicit_site_field_wins() {
        let mut record = raw("E", "A", "https://jobs.example.com/123");
        record.site = Some("Dice".to_string());
        let n = normalize(&record).unwrap();
        assert_eq!(n.site, "dice");
    }

    #[test]
    fn content_hash_is_stable_and_sensitive() {
        let a = content_hash("T", "C", "L", "D", "R", "S");
        let b = content_hash("T", "C", "L", "D", "R", "S");
        let c = content_hash("T", "C", "L", "D2", "R", "S");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ingest_skips_bad_records_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        db.init().unwrap();

        let records = vec![
            serde_json::json!({
                "site": "linkedin",
                "title": "Engineer",
                "company": "Acme",
                "url": "https://www.linkedin.com/jobs/view/99",
                "some_site_specific_noise": {"ignored": true},
            }),
            serde_json::json!({ "title": "No company or url" }),
        ];

        let stats = ingest_records(&db, &records, false).unwrap();
        assert_eq!(stats.seen, 2);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.skipped, 1);

        // Re-ingesting the identical record is a no-op.
        let stats = ingest_records(&db, &records, false).unwrap();
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.inserted, 0);

        // Changed content for the same (site, external_id) updates in place.
        let changed = vec![serde_json::json!({
            "site": "linkedin",
            "title": "Staff Engineer",
            "company": "Acme",
            "url": "https://www.linkedin.com/jobs/view/99",
        })];
        let stats = ingest_records(&db, &changed, false).unwrap();
        assert_eq!(stats.updated, 1);

        let row = db.find_posting("linkedin", "99").unwrap().unwrap();
        assert_eq!(row.title, "Staff Engineer");
    }

    #[test]
    fn closed_posting_is_deactivated_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        db.init().unwrap();

        let open = vec![serde_json::json!({
            "site": "dice",
            "title": "SRE",
            "company": "Acme",
            "url": "https://www.dice.com/job-detail/x1",
        })];
        ingest_records(&db, &open, false).unwrap();
        assert!(db.find_posting("dice", "x1").unwrap().unwrap().is_active);

        let closed = vec![serde_json::json!({
            "site": "dice",
            "title": "SRE",
            "company": "Acme",
            "url": "https://www.dice.com/job-detail/x1",
            "is_active": false,
        })];
        ingest_records(&db, &closed, false).unwrap();
        let row = db.find_posting("dice", "x1").unwrap().unwrap();
        assert!(!row.is_active);
        assert_eq!(row.title, "SRE");

        // Seen again without the flag: live again.
        ingest_records(&db, &open, false).unwrap();
        assert!(db.find_posting("dice", "x1").unwrap().unwrap().is_active);
    }
}
