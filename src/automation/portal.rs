//! Site capability interface.
//!
//! Each supported job site implements the same narrow surface
//! (navigate, detect, fill, submit, verify) and the registry picks the
//! implementation by `posting.site`. The runner and coordinator only
//! ever see this trait, which is what lets them be tested with stub
//! portals and no browser.

use async_trait::async_trait;

use crate::config::UserProfile;
use crate::error::StepError;

/// What form detection established about the page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormSnapshot {
    /// Logical field names the page marks required.
    pub required_fields: Vec<String>,
    /// Whether the form takes a document upload.
    pub has_upload: bool,
}

/// Result of a fill pass over the detected form.
#[derive(Debug, Clone, Default)]
pub struct FillReport {
    pub filled: Vec<String>,
    /// Required fields that did not receive a value; fatal to the
    /// attempt, not the session.
    pub missing_required: Vec<String>,
}

#[async_trait]
pub trait SitePortal: Send {
    fn site(&self) -> &str;

    async fn navigate(&mut self, url: &str) -> Result<(), StepError>;

    /// The site reports a prior application for this job.
    async fn already_applied(&mut self) -> Result<bool, StepError>;

    /// CAPTCHA or an unexpected auth challenge on the current page.
    async fn challenge_present(&mut self) -> Result<bool, StepError>;

    /// `alternate` selects the fallback detection strategy on the one
    /// permitted re-try.
    async fn detect_form(&mut self, alternate: bool) -> Result<FormSnapshot, StepError>;

    async fn fill_form(
        &mut self,
        profile: &UserProfile,
        resume_path: &str,
    ) -> Result<FillReport, StepError>;

    async fn upload_resume(&mut self, resume_path: &str) -> Result<(), StepError>;

    async fn submit(&mut self) -> Result<(), StepError>;

    /// Explicit post-submit confirmation signal (receipt id, confirmation
    /// text, or URL change). `None` when no signal is present yet.
    async fn verify_submission(&mut self) -> Result<Option<String>, StepError>;

    /// Best-effort artifact capture; never fails the attempt.
    async fn screenshot(&mut self, label: &str) -> Option<String>;

    async fn close(&mut self);
}

/// Opens one portal (one browser context) per attempt. Failures here
/// mean the engine itself is unavailable and end the session.
#[async_trait]
pub trait PortalFactory: Send + Sync {
    async fn open(&self, site: &str) -> Result<Box<dyn SitePortal>, StepError>;
}
