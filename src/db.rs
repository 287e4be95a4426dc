use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::intake::NormalizedPosting;
use crate::models::{
    ApplicationAttempt, AttemptStatus, AutomationSession, ErrorRecord, JobPosting, ResumeVariant,
    SessionStatus, SiteWeight, WindowedOutcome,
};

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

/// Result of handing a normalized posting to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    Updated(i64),
    /// Same (site, external_id) with an unchanged content hash.
    Unchanged(i64),
}

/// Fields for one appended error-log row.
#[derive(Debug, Default)]
pub struct NewError {
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
}

impl Database {
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "pursuit") {
            Ok(proj_dirs.data_dir().join("pursuit.db"))
        } else {
            Ok(PathBuf::from("pursuit.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS postings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site TEXT NOT NULL,
                external_id TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                company TEXT NOT NULL,
                location TEXT,
                job_type TEXT,
                experience_level TEXT,
                description TEXT,
                requirements TEXT,
                salary_range TEXT,
                posted_date TEXT,
                content_hash TEXT NOT NULL,
                match_score REAL,
                requirement_tags TEXT NOT NULL DEFAULT '[]',
                scored_profile_version INTEGER,
                scored_content_hash TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                discovered_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (site, external_id)
            );

            CREATE TABLE IF NOT EXISTS resume_variants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                file_path TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                profile TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
                    CHECK (status IN ('active', 'completed', 'failed', 'cancelled')),
                target_sites TEXT NOT NULL DEFAULT '[]',
                attempted INTEGER NOT NULL DEFAULT 0,
                successful INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                duplicates INTEGER NOT NULL DEFAULT 0,
                manual INTEGER NOT NULL DEFAULT 0,
                site_counts TEXT NOT NULL DEFAULT '{}',
                started_at TEXT NOT NULL DEFAULT (datetime('now')),
                ended_at TEXT,
                notes TEXT
            );

            CREATE TABLE IF NOT EXISTS attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                profile TEXT NOT NULL,
                posting_id INTEGER NOT NULL REFERENCES postings(id),
                session_id INTEGER REFERENCES sessions(id),
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'in_progress', 'submitted', 'failed',
                                      'duplicate', 'manual_intervention',
                                      'rejected', 'interview', 'offer')),
                resume_variant_id INTEGER REFERENCES resume_variants(id),
                resume_path TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_retry_at TEXT,
                last_state TEXT,
                confirmation_ref TEXT,
                error_message TEXT,
                screenshot_path TEXT,
                submitted_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (profile, posting_id)
            );

            CREATE TABLE IF NOT EXISTS errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                attempt_id INTEGER REFERENCES attempts(id),
                session_id INTEGER REFERENCES sessions(id),
                error_type TEXT NOT NULL,
                category TEXT,
                site TEXT,
                message TEXT NOT NULL,
                url TEXT,
                recovery_attempted INTEGER NOT NULL DEFAULT 0,
                recovery_successful INTEGER NOT NULL DEFAULT 0,
                screenshot_path TEXT,
                occurred_at TEXT NOT NULL DEFAULT (datetime('now')),
                resolved_at TEXT
            );

            CREATE TABLE IF NOT EXISTS site_weights (
                site TEXT PRIMARY KEY,
                weight REAL NOT NULL DEFAULT 1.0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_postings_site ON postings(site);
            CREATE INDEX IF NOT EXISTS idx_postings_active ON postings(is_active);
            CREATE INDEX IF NOT EXISTS idx_attempts_status ON attempts(status);
            CREATE INDEX IF NOT EXISTS idx_attempts_session ON attempts(session_id);
            CREATE INDEX IF NOT EXISTS idx_errors_site ON errors(site);
            CREATE INDEX IF NOT EXISTS idx_errors_session ON errors(session_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='postings'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'pursuit init' first."));
        }
        Ok(())
    }

    // --- Posting operations ---

    pub fn upsert_posting(&self, np: &NormalizedPosting) -> Result<UpsertOutcome> {
        if let Some(existing) = self.find_posting(&np.site, &np.external_id)? {
            if existing.content_hash == np.content_hash {
                return Ok(UpsertOutcome::Unchanged(existing.id));
            }
            self.conn.execute(
                "UPDATE postings SET url = ?1, title = ?2, company = ?3, location = ?4,
                        job_type = ?5, experience_level = ?6, description = ?7,
                        requirements = ?8, salary_range = ?9, posted_date = ?10,
                        content_hash = ?11, is_active = 1, updated_at = datetime('now')
                 WHERE id = ?12",
                params![
                    np.url,
                    np.title,
                    np.company,
                    np.location,
                    np.job_type,
                    np.experience_level,
                    np.description,
                    np.requirements,
                    np.salary_range,
                    np.posted_date,
                    np.content_hash,
                    existing.id
                ],
            )?;
            return Ok(UpsertOutcome::Updated(existing.id));
        }

        self.conn.execute(
            "INSERT INTO postings (site, external_id, url, title, company, location,
                    job_type, experience_level, description, requirements, salary_range,
                    posted_date, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                np.site,
                np.external_id,
                np.url,
                np.title,
                np.company,
                np.location,
                np.job_type,
                np.experience_level,
                np.description,
                np.requirements,
                np.salary_range,
                np.posted_date,
                np.content_hash
            ],
        )?;
        Ok(UpsertOutcome::Inserted(self.conn.last_insert_rowid()))
    }

    pub fn find_posting(&self, site: &str, external_id: &str) -> Result<Option<JobPosting>> {
        let result = self.conn.query_row(
            &format!(
                "SELECT {POSTING_COLUMNS} FROM postings WHERE site = ?1 AND external_id = ?2"
            ),
            params![site, external_id],
            row_to_posting,
        );
        optional(result)
    }

    pub fn get_posting(&self, id: i64) -> Result<Option<JobPosting>> {
        let result = self.conn.query_row(
            &format!("SELECT {POSTING_COLUMNS} FROM postings WHERE id = ?1"),
            [id],
            row_to_posting,
        );
        optional(result)
    }

    pub fn list_active_postings(&self) -> Result<Vec<JobPosting>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE is_active = 1 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], row_to_posting)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list postings")
    }

    /// Active postings whose cached score is missing or stale for the
    /// given profile version.
    pub fn postings_needing_score(&self, profile_version: i64, limit: usize) -> Result<Vec<JobPosting>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings
             WHERE is_active = 1
               AND (match_score IS NULL
                    OR scored_profile_version IS NOT ?1
                    OR scored_content_hash IS NOT content_hash)
             ORDER BY id LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![profile_version, limit as i64], row_to_posting)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list unscored postings")
    }

    pub fn set_match_score(
        &self,
        posting_id: i64,
        score: f64,
        tags: &[String],
        profile_version: i64,
    ) -> Result<()> {
        let tags_json = serde_json::to_string(tags)?;
        self.conn.execute(
            "UPDATE postings SET match_score = ?1, requirement_tags = ?2,
                    scored_profile_version = ?3, scored_content_hash = content_hash,
                    updated_at = datetime('now')
             WHERE id = ?4",
            params![score, tags_json, profile_version, posting_id],
        )?;
        Ok(())
    }

    pub fn set_posting_active(&self, posting_id: i64, active: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE postings SET is_active = ?1, updated_at = datetime('now')
             WHERE id = ?2 AND is_active != ?1",
            params![active, posting_id],
        )?;
        Ok(())
    }

    // --- Attempt operations ---

    /// Create the attempt row for (profile, posting) or return the
    /// existing one. The UNIQUE constraint is what makes duplicate
    /// submissions structurally impossible.
    pub fn create_or_get_attempt(&self, profile: &str, posting_id: i64) -> Result<ApplicationAttempt> {
        self.conn.execute(
            "INSERT INTO attempts (profile, posting_id) VALUES (?1, ?2)
             ON CONFLICT (profile, posting_id) DO NOTHING",
            params![profile, posting_id],
        )?;
        self.find_attempt(profile, posting_id)?
            .ok_or_else(|| anyhow!("attempt row missing after insert"))
    }

    pub fn find_attempt(&self, profile: &str, posting_id: i64) -> Result<Option<ApplicationAttempt>> {
        let result = self.conn.query_row(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE profile = ?1 AND posting_id = ?2"
            ),
            params![profile, posting_id],
            row_to_attempt,
        );
        optional(result)
    }

    pub fn get_attempt(&self, id: i64) -> Result<Option<ApplicationAttempt>> {
        let result = self.conn.query_row(
            &format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE id = ?1"),
            [id],
            row_to_attempt,
        );
        optional(result)
    }

    pub fn list_attempts(&self, status: Option<AttemptStatus>) -> Result<Vec<ApplicationAttempt>> {
        let mut sql = format!("SELECT {ATTEMPT_COLUMNS} FROM attempts");
        if status.is_some() {
            sql.push_str(" WHERE status = ?1");
        }
        sql.push_str(" ORDER BY updated_at DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = if let Some(s) = status {
            stmt.query_map([s.as_str()], row_to_attempt)?
        } else {
            stmt.query_map([], row_to_attempt)?
        };
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list attempts")
    }

    /// Posting ids this profile has already attempted (anything past
    /// `pending`; pending rows are requeued plans and stay plannable).
    pub fn attempted_posting_ids(&self, profile: &str) -> Result<HashSet<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT posting_id FROM attempts WHERE profile = ?1 AND status != 'pending'",
        )?;
        let rows = stmt.query_map([profile], |row| row.get::<_, i64>(0))?;
        rows.collect::<Result<HashSet<_>, _>>()
            .context("Failed to collect attempted postings")
    }

    pub fn mark_attempt_in_progress(
        &self,
        id: i64,
        session_id: i64,
        resume_variant_id: i64,
        resume_path: &str,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE attempts SET status = 'in_progress', session_id = ?1,
                    resume_variant_id = ?2, resume_path = ?3, updated_at = datetime('now')
             WHERE id = ?4",
            params![session_id, resume_variant_id, resume_path, id],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_attempt_outcome(
        &self,
        id: i64,
        status: AttemptStatus,
        retry_count: u32,
        last_state: Option<&str>,
        confirmation_ref: Option<&str>,
        error_message: Option<&str>,
        screenshot_path: Option<&str>,
    ) -> Result<()> {
        let submitted_clause = if status == AttemptStatus::Submitted {
            ", submitted_at = datetime('now')"
        } else {
            ""
        };
        self.conn.execute(
            &format!(
                "UPDATE attempts SET status = ?1, retry_count = ?2, last_state = ?3,
                        confirmation_ref = ?4, error_message = ?5, screenshot_path = ?6,
                        last_retry_at = CASE WHEN ?2 > 0 THEN datetime('now') ELSE last_retry_at END,
                        updated_at = datetime('now'){submitted_clause}
                 WHERE id = ?7"
            ),
            params![
                status.as_str(),
                retry_count,
                last_state,
                confirmation_ref,
                error_message,
                screenshot_path,
                id
            ],
        )?;
        Ok(())
    }

    pub fn set_attempt_status(&self, id: i64, status: AttemptStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE attempts SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    /// Put a dispatched-but-not-run attempt back into the plannable pool
    /// (circuit breaker requeue).
    pub fn requeue_attempt(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE attempts SET status = 'pending', session_id = NULL,
                    updated_at = datetime('now')
             WHERE id = ?1 AND status = 'in_progress'",
            [id],
        )?;
        Ok(())
    }

    pub fn today_submitted_count(&self, profile: &str) -> Result<u32> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM attempts
             WHERE profile = ?1 AND submitted_at IS NOT NULL
               AND date(submitted_at) = date('now')",
            [profile],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // --- Session operations ---

    pub fn create_session(&self, profile: &str, target_sites: &[String]) -> Result<i64> {
        let sites_json = serde_json::to_string(target_sites)?;
        self.conn.execute(
            "INSERT INTO sessions (profile, target_sites) VALUES (?1, ?2)",
            params![profile, sites_json],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_session_counters(
        &self,
        id: i64,
        attempted: i64,
        successful: i64,
        failed: i64,
        duplicates: i64,
        manual: i64,
        site_counts: &HashMap<String, i64>,
    ) -> Result<()> {
        let counts_json = serde_json::to_string(site_counts)?;
        self.conn.execute(
            "UPDATE sessions SET attempted = ?1, successful = ?2, failed = ?3,
                    duplicates = ?4, manual = ?5, site_counts = ?6
             WHERE id = ?7",
            params![attempted, successful, failed, duplicates, manual, counts_json, id],
        )?;
        Ok(())
    }

    pub fn finish_session(&self, id: i64, status: SessionStatus, notes: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE sessions SET status = ?1, ended_at = datetime('now'), notes = ?2
             WHERE id = ?3",
            params![status.as_str(), notes, id],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: i64) -> Result<Option<AutomationSession>> {
        let result = self.conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            [id],
            row_to_session,
        );
        optional(result)
    }

    // --- Error log ---

    pub fn append_error(&self, e: &NewError) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO errors (attempt_id, session_id, error_type, category, site,
                    message, url, recovery_attempted, recovery_successful, screenshot_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                e.attempt_id,
                e.session_id,
                e.error_type,
                e.category,
                e.site,
                e.message,
                e.url,
                e.recovery_attempted,
                e.recovery_successful,
                e.screenshot_path
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_errors(&self, site: Option<&str>, limit: usize) -> Result<Vec<ErrorRecord>> {
        let mut sql = format!("SELECT {ERROR_COLUMNS} FROM errors");
        if site.is_some() {
            sql.push_str(" WHERE site = ?1");
        }
        sql.push_str(" ORDER BY occurred_at DESC LIMIT ");
        sql.push_str(&limit.to_string());

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = if let Some(s) = site {
            stmt.query_map([s], row_to_error)?
        } else {
            stmt.query_map([], row_to_error)?
        };
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list errors")
    }

    pub fn resolve_error(&self, id: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE errors SET resolved_at = datetime('now') WHERE id = ?1",
            [id],
        )?;
        Ok(affected > 0)
    }

    // --- Site weights ---

    /// All persisted weights. Sites with no row implicitly weigh 1.0.
    pub fn site_weights(&self) -> Result<HashMap<String, f64>> {
        let mut stmt = self.conn.prepare("SELECT site, weight FROM site_weights")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;
        rows.collect::<Result<HashMap<_, _>, _>>()
            .context("Failed to load site weights")
    }

    pub fn list_site_weights(&self) -> Result<Vec<SiteWeight>> {
        let mut stmt = self
            .conn
            .prepare("SELECT site, weight, updated_at FROM site_weights ORDER BY site")?;
        let rows = stmt.query_map([], |row| {
            Ok(SiteWeight {
                site: row.get(0)?,
                weight: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list site weights")
    }

    pub fn set_site_weight(&self, site: &str, weight: f64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO site_weights (site, weight, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT (site) DO UPDATE SET weight = ?2, updated_at = datetime('now')",
            params![site, weight],
        )?;
        Ok(())
    }

    // --- Resume variants ---

    pub fn create_resume_variant(
        &self,
        name: &str,
        file_path: &str,
        tags: &[String],
        is_default: bool,
    ) -> Result<i64> {
        if is_default {
            self.conn.execute("UPDATE resume_variants SET is_default = 0", [])?;
        }
        let tags_json = serde_json::to_string(tags)?;
        self.conn.execute(
            "INSERT INTO resume_variants (name, file_path, tags, is_default)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, file_path, tags_json, is_default],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_resume_variants(&self) -> Result<Vec<ResumeVariant>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, file_path, tags, is_default, created_at
             FROM resume_variants ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_variant)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list resume variants")
    }

    // --- Trailing-window history for the feedback loop ---

    /// Terminal attempt outcomes joined with posting site and tags,
    /// newest first, bounded by both the day window and the row count.
    pub fn windowed_outcomes(&self, window_days: i64, window_attempts: usize) -> Result<Vec<WindowedOutcome>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.site, a.status, a.resume_variant_id, p.requirement_tags
             FROM attempts a
             JOIN postings p ON p.id = a.posting_id
             WHERE a.status NOT IN ('pending', 'in_progress')
               AND a.updated_at >= datetime('now', ?1)
             ORDER BY a.updated_at DESC
             LIMIT ?2",
        )?;
        let offset = format!("-{window_days} days");
        let rows = stmt.query_map(params![offset, window_attempts as i64], |row| {
            let status_str: String = row.get(1)?;
            let tags_json: String = row.get(3)?;
            Ok(WindowedOutcome {
                site: row.get(0)?,
                status: parse_attempt_status(&status_str, 1)?,
                resume_variant_id: row.get(2)?,
                tags: serde_json::from_str(&tags_json).unwrap_or_default(),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to load outcome window")
    }
}

const POSTING_COLUMNS: &str = "id, site, external_id, url, title, company, location, job_type, \
     experience_level, description, requirements, salary_range, posted_date, content_hash, \
     match_score, requirement_tags, scored_profile_version, scored_content_hash, is_active, \
     discovered_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, profile, posting_id, session_id, status, resume_variant_id, \
     resume_path, retry_count, last_retry_at, last_state, confirmation_ref, error_message, \
     screenshot_path, submitted_at, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, profile, status, target_sites, attempted, successful, failed, \
     duplicates, manual, site_counts, started_at, ended_at, notes";

const ERROR_COLUMNS: &str = "id, attempt_id, session_id, error_type, category, site, message, \
     url, recovery_attempted, recovery_successful, screenshot_path, occurred_at, resolved_at";

fn optional<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_attempt_status(s: &str, idx: usize) -> rusqlite::Result<AttemptStatus> {
    AttemptStatus::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown attempt status '{s}'").into(),
        )
    })
}

fn row_to_posting(row: &rusqlite::Row) -> rusqlite::Result<JobPosting> {
    let tags_json: String = row.get(15)?;
    Ok(JobPosting {
        id: row.get(0)?,
        site: row.get(1)?,
        external_id: row.get(2)?,
        url: row.get(3)?,
        title: row.get(4)?,
        company: row.get(5)?,
        location: row.get(6)?,
        job_type: row.get(7)?,
        experience_level: row.get(8)?,
        description: row.get(9)?,
        requirements: row.get(10)?,
        salary_range: row.get(11)?,
        posted_date: row.get(12)?,
        content_hash: row.get(13)?,
        match_score: row.get(14)?,
        requirement_tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        scored_profile_version: row.get(16)?,
        scored_content_hash: row.get(17)?,
        is_active: row.get(18)?,
        discovered_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

fn row_to_attempt(row: &rusqlite::Row) -> rusqlite::Result<ApplicationAttempt> {
    let status_str: String = row.get(4)?;
    Ok(ApplicationAttempt {
        id: row.get(0)?,
        profile: row.get(1)?,
        posting_id: row.get(2)?,
        session_id: row.get(3)?,
        status: parse_attempt_status(&status_str, 4)?,
        resume_variant_id: row.get(5)?,
        resume_path: row.get(6)?,
        retry_count: row.get(7)?,
        last_retry_at: row.get(8)?,
        last_state: row.get(9)?,
        confirmation_ref: row.get(10)?,
        error_message: row.get(11)?,
        screenshot_path: row.get(12)?,
        submitted_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<AutomationSession> {
    let status_str: String = row.get(2)?;
    let sites_json: String = row.get(3)?;
    let counts_json: String = row.get(9)?;
    Ok(AutomationSession {
        id: row.get(0)?,
        profile: row.get(1)?,
        status: SessionStatus::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown session status '{status_str}'").into(),
            )
        })?,
        target_sites: serde_json::from_str(&sites_json).unwrap_or_default(),
        attempted: row.get(4)?,
        successful: row.get(5)?,
        failed: row.get(6)?,
        duplicates: row.get(7)?,
        manual: row.get(8)?,
        site_counts: serde_json::from_str(&counts_json).unwrap_or_default(),
        started_at: row.get(10)?,
        ended_at: row.get(11)?,
        notes: row.get(12)?,
    })
}

fn row_to_variant(row: &rusqlite::Row) -> rusqlite::Result<ResumeVariant> {
    let tags_json: String = row.get(3)?;
    Ok(ResumeVariant {
        id: row.get(0)?,
        name: row.get(1)?,
        file_path: row.get(2)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        is_default: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_error(row: &rusqlite::Row) -> rusqlite::Result<ErrorRecord> {
    Ok(ErrorRecord {
        id: row.get(0)?,
        attempt_id: row.get(1)?,
        session_id: row.get(2)?,
        error_type: row.get(3)?,
        category: row.get(4)?,
        site: row.get(5)?,
        message: row.get(6)?,
        url: row.get(7)?,
        recovery_attempted: row.get(8)?,
        recovery_successful: row.get(9)?,
        screenshot_path: row.get(10)?,
        occurred_at: row.get(11)?,
        resolved_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::NormalizedPosting;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        db.init().unwrap();
        (dir, db)
    }

    fn posting(site: &str, external_id: &str, title: &str) -> NormalizedPosting {
        NormalizedPosting {
            site: site.to_string(),
            external_id: external_id.to_string(),
            url: format!("https://{site}.example/jobs/{external_id}"),
            title: title.to_string(),
            company: "Acme".to_string(),
            location: None,
            job_type: None,
            experience_level: None,
            description: Some("build things".to_string()),
            requirements: None,
            salary_range: None,
            posted_date: None,
            content_hash: crate::intake::content_hash(title, "Acme", "", "build things", "", ""),
        }
    }

    #[test]
    fn upsert_insert_unchanged_update() {
        let (_dir, db) = test_db();

        let np = posting("linkedin", "j1", "Engineer");
        let first = db.upsert_posting(&np).unwrap();
        let id = match first {
            UpsertOutcome::Inserted(id) => id,
            other => panic!("expected insert, got {other:?}"),
        };

        // Same content hash: no-op.
        assert_eq!(db.upsert_posting(&np).unwrap(), UpsertOutcome::Unchanged(id));

        // Changed content: update in place, same row.
        let changed = posting("linkedin", "j1", "Senior Engineer");
        assert_eq!(db.upsert_posting(&changed).unwrap(), UpsertOutcome::Updated(id));
        let row = db.get_posting(id).unwrap().unwrap();
        assert_eq!(row.title, "Senior Engineer");
        assert!(row.is_active);
    }

    #[test]
    fn attempt_row_is_unique_per_pair() {
        let (_dir, db) = test_db();
        let id = match db.upsert_posting(&posting("indeed", "j2", "Analyst")).unwrap() {
            UpsertOutcome::Inserted(id) => id,
            other => panic!("unexpected {other:?}"),
        };

        let a = db.create_or_get_attempt("default", id).unwrap();
        let b = db.create_or_get_attempt("default", id).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, AttemptStatus::Pending);
    }

    #[test]
    fn submitted_outcome_counts_toward_today() {
        let (_dir, db) = test_db();
        let id = match db.upsert_posting(&posting("dice", "j3", "SRE")).unwrap() {
            UpsertOutcome::Inserted(id) => id,
            other => panic!("unexpected {other:?}"),
        };
        let attempt = db.create_or_get_attempt("default", id).unwrap();

        assert_eq!(db.today_submitted_count("default").unwrap(), 0);
        db.record_attempt_outcome(
            attempt.id,
            AttemptStatus::Submitted,
            1,
            Some("verified"),
            Some("conf-123"),
            None,
            None,
        )
        .unwrap();
        assert_eq!(db.today_submitted_count("default").unwrap(), 1);

        let row = db.get_attempt(attempt.id).unwrap().unwrap();
        assert_eq!(row.status, AttemptStatus::Submitted);
        assert_eq!(row.retry_count, 1);
        assert_eq!(row.confirmation_ref.as_deref(), Some("conf-123"));
        assert!(row.submitted_at.is_some());
    }

    #[test]
    fn attempted_ids_exclude_pending() {
        let (_dir, db) = test_db();
        let p1 = match db.upsert_posting(&posting("linkedin", "a", "One")).unwrap() {
            UpsertOutcome::Inserted(id) => id,
            other => panic!("unexpected {other:?}"),
        };
        let p2 = match db.upsert_posting(&posting("linkedin", "b", "Two")).unwrap() {
            UpsertOutcome::Inserted(id) => id,
            other => panic!("unexpected {other:?}"),
        };

        let a1 = db.create_or_get_attempt("default", p1).unwrap();
        db.create_or_get_attempt("default", p2).unwrap();
        db.record_attempt_outcome(a1.id, AttemptStatus::Failed, 3, None, None, Some("boom"), None)
            .unwrap();

        let attempted = db.attempted_posting_ids("default").unwrap();
        assert!(attempted.contains(&p1));
        assert!(!attempted.contains(&p2)); // still pending, plannable
    }

    #[test]
    fn requeue_resets_only_in_progress() {
        let (_dir, db) = test_db();
        let id = match db.upsert_posting(&posting("dice", "r1", "Dev")).unwrap() {
            UpsertOutcome::Inserted(id) => id,
            other => panic!("unexpected {other:?}"),
        };
        let session = db.create_session("default", &["dice".to_string()]).unwrap();
        let variant = db
            .create_resume_variant("general", "/resumes/general.pdf", &[], true)
            .unwrap();
        let attempt = db.create_or_get_attempt("default", id).unwrap();
        db.mark_attempt_in_progress(attempt.id, session, variant, "/tmp/resume.pdf")
            .unwrap();

        db.requeue_attempt(attempt.id).unwrap();
        let row = db.get_attempt(attempt.id).unwrap().unwrap();
        assert_eq!(row.status, AttemptStatus::Pending);
        assert_eq!(row.session_id, None);

        // A terminal attempt is not requeueable.
        db.record_attempt_outcome(attempt.id, AttemptStatus::Submitted, 0, None, None, None, None)
            .unwrap();
        db.requeue_attempt(attempt.id).unwrap();
        let row = db.get_attempt(attempt.id).unwrap().unwrap();
        assert_eq!(row.status, AttemptStatus::Submitted);
    }

    #[test]
    fn site_weights_default_and_update() {
        let (_dir, db) = test_db();
        assert!(db.site_weights().unwrap().is_empty());

        db.set_site_weight("linkedin", 1.2).unwrap();
        db.set_site_weight("linkedin", 1.4).unwrap();
        db.set_site_weight("indeed", 0.8).unwrap();

        let weights = db.site_weights().unwrap();
        assert_eq!(weights.get("linkedin"), Some(&1.4));
        assert_eq!(weights.get("indeed"), Some(&0.8));
    }

    #[test]
    fn error_log_appends_and_lists() {
        let (_dir, db) = test_db();
        db.append_error(&NewError {
            error_type: "element_not_found".to_string(),
            category: "element_not_found".to_string(),
            site: Some("indeed".to_string()),
            message: "no apply button".to_string(),
            ..Default::default()
        })
        .unwrap();
        db.append_error(&NewError {
            error_type: "timeout".to_string(),
            category: "timeout".to_string(),
            site: Some("dice".to_string()),
            message: "navigate".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(db.list_errors(None, 10).unwrap().len(), 2);
        let dice_only = db.list_errors(Some("dice"), 10).unwrap();
        assert_eq!(dice_only.len(), 1);
        assert_eq!(dice_only[0].message, "navigate");
    }

    #[test]
    fn windowed_outcomes_join_site_and_tags() {
        let (_dir, db) = test_db();
        let id = match db.upsert_posting(&posting("linkedin", "w1", "Rust Dev")).unwrap() {
            UpsertOutcome::Inserted(id) => id,
            other => panic!("unexpected {other:?}"),
        };
        db.set_match_score(id, 0.9, &["rust".to_string(), "backend".to_string()], 1)
            .unwrap();
        let attempt = db.create_or_get_attempt("default", id).unwrap();
        db.record_attempt_outcome(attempt.id, AttemptStatus::Submitted, 0, None, None, None, None)
            .unwrap();

        let outcomes = db.windowed_outcomes(30, 200).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].site, "linkedin");
        assert_eq!(outcomes[0].status, AttemptStatus::Submitted);
        assert_eq!(outcomes[0].tags, vec!["rust", "backend"]);
    }

    #[test]
    fn default_variant_flag_is_exclusive() {
        let (_dir, db) = test_db();
        db.create_resume_variant("general", "/resumes/general.pdf", &[], true)
            .unwrap();
        db.create_resume_variant("backend", "/resumes/backend.pdf", &["rust".to_string()], true)
            .unwrap();

        let variants = db.list_resume_variants().unwrap();
        let defaults: Vec<_> = variants.iter().filter(|v| v.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "backend");
    }
}
