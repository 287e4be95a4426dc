//! Drives one application attempt through the state machine.
//!
//! The runner executes each phase against a `SitePortal`, feeds the
//! outcome to the machine, and honors its transition decisions. It
//! returns a report; all persistence stays with the coordinator.

use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::automation::machine::{AttemptState, Machine, RetryPolicy, StepOutcome, Transition};
use crate::automation::portal::{FormSnapshot, SitePortal};
use crate::config::UserProfile;
use crate::error::StepError;
use crate::models::AttemptStatus;

/// One recorded failure during the attempt, destined for the error log.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: StepError,
    pub state: AttemptState,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
}

#[derive(Debug)]
pub struct AttemptReport {
    pub status: AttemptStatus,
    /// State to resume from when parked; terminal state otherwise.
    pub last_state: AttemptState,
    pub retry_count: u32,
    pub confirmation_ref: Option<String>,
    pub error_message: Option<String>,
    pub screenshot_path: Option<String>,
    pub errors: Vec<ErrorEvent>,
    /// Set when the browser engine itself died; ends the session.
    pub fatal_engine: bool,
}

pub struct AttemptContext<'a> {
    pub profile: &'a UserProfile,
    pub url: &'a str,
    pub resume_path: &'a str,
    pub policy: RetryPolicy,
    /// Resume point for a previously parked attempt.
    pub start_state: AttemptState,
}

/// How long to wait before the one verification re-check.
const VERIFY_RECHECK_DELAY: Duration = Duration::from_secs(5);

pub async fn run_attempt(
    portal: &mut dyn SitePortal,
    ctx: &AttemptContext<'_>,
    cancel: &watch::Receiver<bool>,
) -> AttemptReport {
    let mut machine = Machine::resume_from(ctx.policy, ctx.start_state);
    let mut errors: Vec<ErrorEvent> = Vec::new();
    let mut snapshot = FormSnapshot::default();
    let mut confirmation: Option<String> = None;
    let mut fatal_engine = false;
    let mut retrying = false;
    // A parked attempt resumes mid-flow in a fresh browser context; the
    // page has to come back before the resumed phase runs. Completed
    // form steps themselves are not repeated.
    let mut needs_renavigation = !matches!(
        ctx.start_state,
        AttemptState::Init | AttemptState::Navigating
    );

    let (status, last_state) = loop {
        let phase = machine.state;

        // Cooperative cancellation: the current transition finishes,
        // nothing is killed mid-submit.
        let outcome = if *cancel.borrow() {
            StepOutcome::Fail(StepError::Cancelled)
        } else if needs_renavigation {
            match portal.navigate(ctx.url).await {
                Ok(()) => {
                    needs_renavigation = false;
                    execute_step(
                        portal,
                        phase,
                        ctx,
                        machine.element_retry_used,
                        &mut snapshot,
                        &mut confirmation,
                    )
                    .await
                }
                Err(e) => StepOutcome::Fail(e),
            }
        } else {
            execute_step(
                portal,
                phase,
                ctx,
                machine.element_retry_used,
                &mut snapshot,
                &mut confirmation,
            )
            .await
        };

        let failure = match &outcome {
            StepOutcome::Fail(e) => Some(e.clone()),
            _ => None,
        };
        if let Some(e) = &failure {
            fatal_engine = fatal_engine || e.is_fatal_to_session();
        }

        match machine.next(outcome) {
            Transition::Next(state) => {
                debug!(from = %phase, to = %state, "advancing");
                if retrying {
                    // The step came back after a retry.
                    if let Some(last) = errors.last_mut() {
                        last.recovery_successful = true;
                    }
                    retrying = false;
                }
            }
            Transition::Retry { state, error, delay_ms } => {
                warn!(state = %state, %error, delay_ms, "step failed, retrying");
                errors.push(ErrorEvent {
                    error,
                    state,
                    recovery_attempted: true,
                    recovery_successful: false,
                });
                retrying = true;
                sleep(Duration::from_millis(ctx.policy.with_jitter(delay_ms))).await;
            }
            Transition::Park => {
                break (AttemptStatus::ManualIntervention, phase);
            }
            Transition::Complete(terminal) => {
                if terminal == AttemptState::Failed
                    && let Some(error) = failure
                {
                    // An unverified submission already had its re-check.
                    let recovery_attempted = matches!(error, StepError::Unverified);
                    errors.push(ErrorEvent {
                        error,
                        state: phase,
                        recovery_attempted,
                        recovery_successful: false,
                    });
                }
                let status = match terminal {
                    AttemptState::Verified => AttemptStatus::Submitted,
                    AttemptState::Duplicate => AttemptStatus::Duplicate,
                    _ => AttemptStatus::Failed,
                };
                break (status, terminal);
            }
        }
    };

    // Artifact reference regardless of outcome, for audit.
    let screenshot_path = portal.screenshot(&format!("attempt_{last_state}")).await;

    let error_message = errors.last().map(|e| e.error.to_string());
    AttemptReport {
        status,
        last_state,
        retry_count: machine.retry_count,
        confirmation_ref: confirmation,
        error_message,
        screenshot_path,
        errors,
        fatal_engine,
    }
}

async fn execute_step(
    portal: &mut dyn SitePortal,
    state: AttemptState,
    ctx: &AttemptContext<'_>,
    alternate_detection: bool,
    snapshot: &mut FormSnapshot,
    confirmation: &mut Option<String>,
) -> StepOutcome {
    match state {
        AttemptState::Init => {
            if ctx.resume_path.trim().is_empty() {
                return StepOutcome::Fail(StepError::FieldUnfilled("resume path".into()));
            }
            StepOutcome::Advance
        }

        AttemptState::Navigating => {
            if let Err(e) = portal.navigate(ctx.url).await {
                return StepOutcome::Fail(e);
            }
            check_page_state(portal).await.unwrap_or(StepOutcome::Advance)
        }

        AttemptState::FormDetected => {
            if let Some(interrupt) = check_page_state(portal).await {
                return interrupt;
            }
            match portal.detect_form(alternate_detection).await {
                Ok(s) => {
                    *snapshot = s;
                    StepOutcome::Advance
                }
                Err(e) => StepOutcome::Fail(e),
            }
        }

        AttemptState::FormFilled => {
            match portal.fill_form(ctx.profile, ctx.resume_path).await {
                Ok(report) if report.missing_required.is_empty() => StepOutcome::Advance,
                Ok(report) => StepOutcome::Fail(StepError::FieldUnfilled(
                    report.missing_required.join(", "),
                )),
                Err(e) => StepOutcome::Fail(e),
            }
        }

        AttemptState::DocumentUploaded => {
            if !snapshot.has_upload {
                // Pass-through when the site takes no file.
                return StepOutcome::Advance;
            }
            match portal.upload_resume(ctx.resume_path).await {
                Ok(()) => StepOutcome::Advance,
                Err(e) => StepOutcome::Fail(e),
            }
        }

        AttemptState::Submitted => {
            if let Some(interrupt) = check_page_state(portal).await {
                return interrupt;
            }
            match portal.submit().await {
                Ok(()) => StepOutcome::Advance,
                Err(e) => StepOutcome::Fail(e),
            }
        }

        AttemptState::Verified => {
            match portal.verify_submission().await {
                Ok(Some(reference)) => {
                    *confirmation = Some(reference);
                    StepOutcome::Advance
                }
                Ok(None) => {
                    // A re-check, never a resubmission: resubmitting
                    // risks a duplicate application.
                    sleep(VERIFY_RECHECK_DELAY).await;
                    match portal.verify_submission().await {
                        Ok(Some(reference)) => {
                            *confirmation = Some(reference);
                            StepOutcome::Advance
                        }
                        Ok(None) => StepOutcome::Fail(StepError::Unverified),
                        Err(e) => StepOutcome::Fail(e),
                    }
                }
                Err(e) => StepOutcome::Fail(e),
            }
        }

        // Terminal states never reach execute_step.
        _ => StepOutcome::Advance,
    }
}

/// Challenge and duplicate signals preempt whatever phase we are in.
async fn check_page_state(portal: &mut dyn SitePortal) -> Option<StepOutcome> {
    match portal.challenge_present().await {
        Ok(true) => return Some(StepOutcome::Challenge),
        Ok(false) => {}
        Err(e) => return Some(StepOutcome::Fail(e)),
    }
    match portal.already_applied().await {
        Ok(true) => Some(StepOutcome::Duplicate),
        Ok(false) => None,
        Err(e) => Some(StepOutcome::Fail(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::portal::FillReport;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Scripted portal: each call pops the next canned response.
    #[derive(Default)]
    struct StubPortal {
        navigate_results: VecDeque<Result<(), StepError>>,
        already_applied: VecDeque<bool>,
        challenges: VecDeque<bool>,
        detect_results: VecDeque<Result<FormSnapshot, StepError>>,
        fill_results: VecDeque<Result<FillReport, StepError>>,
        submit_results: VecDeque<Result<(), StepError>>,
        verify_results: VecDeque<Result<Option<String>, StepError>>,
        detect_alternate_flags: Vec<bool>,
        navigations: usize,
    }

    impl StubPortal {
        fn happy() -> Self {
            let mut s = Self::default();
            s.navigate_results.push_back(Ok(()));
            s.detect_results.push_back(Ok(FormSnapshot::default()));
            s.fill_results.push_back(Ok(FillReport::default()));
            s.submit_results.push_back(Ok(()));
            s.verify_results.push_back(Ok(Some("conf-1".into())));
            s
        }
    }

    #[async_trait]
    impl SitePortal for StubPortal {
        fn site(&self) -> &str {
            "stub"
        }
        async fn navigate(&mut self, _url: &str) -> Result<(), StepError> {
            self.navigations += 1;
            self.navigate_results.pop_front().unwrap_or(Ok(()))
        }
        async fn already_applied(&mut self) -> Result<bool, StepError> {
            Ok(self.already_applied.pop_front().unwrap_or(false))
        }
        async fn challenge_present(&mut self) -> Result<bool, StepError> {
            Ok(self.challenges.pop_front().unwrap_or(false))
        }
        async fn detect_form(&mut self, alternate: bool) -> Result<FormSnapshot, StepError> {
            self.detect_alternate_flags.push(alternate);
            self.detect_results
                .pop_front()
                .unwrap_or(Ok(FormSnapshot::default()))
        }
        async fn fill_form(
            &mut self,
            _profile: &UserProfile,
            _resume_path: &str,
        ) -> Result<FillReport, StepError> {
            self.fill_results.pop_front().unwrap_or(Ok(FillReport::default()))
        }
        async fn upload_resume(&mut self, _resume_path: &str) -> Result<(), StepError> {
            Ok(())
        }
        async fn submit(&mut self) -> Result<(), StepError> {
            self.submit_results.pop_front().unwrap_or(Ok(()))
        }
        async fn verify_submission(&mut self) -> Result<Option<String>, StepError> {
            self.verify_results.pop_front().unwrap_or(Ok(None))
        }
        async fn screenshot(&mut self, _label: &str) -> Option<String> {
            Some("/tmp/shot.png".to_string())
        }
        async fn close(&mut self) {}
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn ctx<'a>(profile: &'a UserProfile) -> AttemptContext<'a> {
        AttemptContext {
            profile,
            url: "https://stub.example/jobs/1",
            resume_path: "/resumes/general.pdf",
            policy: fast_policy(),
            start_state: AttemptState::Init,
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        // The receiver keeps the last value after the sender drops.
        watch::channel(false).1
    }

    #[tokio::test]
    async fn happy_path_submits_and_verifies() {
        let mut portal = StubPortal::happy();
        let profile = UserProfile::default();
        let report = run_attempt(&mut portal, &ctx(&profile), &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::Submitted);
        assert_eq!(report.last_state, AttemptState::Verified);
        assert_eq!(report.retry_count, 0);
        assert_eq!(report.confirmation_ref.as_deref(), Some("conf-1"));
        assert!(report.errors.is_empty());
        assert!(report.screenshot_path.is_some());
        assert!(!report.fatal_engine);
    }

    #[tokio::test]
    async fn navigation_fails_twice_then_succeeds() {
        let mut portal = StubPortal::happy();
        portal.navigate_results.clear();
        portal
            .navigate_results
            .push_back(Err(StepError::Network("reset".into())));
        portal
            .navigate_results
            .push_back(Err(StepError::Timeout("navigate".into())));
        portal.navigate_results.push_back(Ok(()));

        let profile = UserProfile::default();
        let report = run_attempt(&mut portal, &ctx(&profile), &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::Submitted);
        assert_eq!(report.retry_count, 2);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().all(|e| e.recovery_attempted));
        assert!(report.errors[1].recovery_successful);
        assert_eq!(portal.navigations, 3);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails() {
        let mut portal = StubPortal::default();
        for _ in 0..4 {
            portal
                .navigate_results
                .push_back(Err(StepError::Network("down".into())));
        }

        let profile = UserProfile::default();
        let report = run_attempt(&mut portal, &ctx(&profile), &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::Failed);
        assert_eq!(report.retry_count, 3);
        // Three retry events plus the terminal failure.
        assert_eq!(report.errors.len(), 4);
    }

    #[tokio::test]
    async fn duplicate_detected_after_navigation_skips_submission() {
        let mut portal = StubPortal::happy();
        portal.already_applied.push_back(true);

        let profile = UserProfile::default();
        let report = run_attempt(&mut portal, &ctx(&profile), &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::Duplicate);
        assert!(report.confirmation_ref.is_none());
        // Never reached detect/fill/submit.
        assert!(portal.detect_alternate_flags.is_empty());
    }

    #[tokio::test]
    async fn challenge_parks_the_attempt_with_resume_state() {
        let mut portal = StubPortal::happy();
        // First challenge probe (Navigating) is clean, second (FormDetected) hits.
        portal.challenges.push_back(false);
        portal.challenges.push_back(true);

        let profile = UserProfile::default();
        let report = run_attempt(&mut portal, &ctx(&profile), &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::ManualIntervention);
        assert_eq!(report.last_state, AttemptState::FormDetected);
    }

    #[tokio::test]
    async fn parked_attempt_resumes_where_it_stopped() {
        let mut portal = StubPortal::happy();
        let profile = UserProfile::default();
        let mut context = ctx(&profile);
        context.start_state = AttemptState::FormDetected;

        let report = run_attempt(&mut portal, &context, &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::Submitted);
        // One navigation to restore the page, then straight into
        // detection; the earlier phases are not re-run.
        assert_eq!(portal.navigations, 1);
        assert_eq!(portal.detect_alternate_flags.len(), 1);
    }

    #[tokio::test]
    async fn element_not_found_uses_alternate_strategy_once() {
        let mut portal = StubPortal::happy();
        portal.detect_results.clear();
        portal
            .detect_results
            .push_back(Err(StepError::ElementNotFound("form".into())));
        portal.detect_results.push_back(Ok(FormSnapshot::default()));

        let profile = UserProfile::default();
        let report = run_attempt(&mut portal, &ctx(&profile), &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::Submitted);
        assert_eq!(portal.detect_alternate_flags, vec![false, true]);
    }

    #[tokio::test]
    async fn missing_required_field_is_fatal_to_the_attempt() {
        let mut portal = StubPortal::happy();
        portal.fill_results.clear();
        portal.fill_results.push_back(Ok(FillReport {
            filled: vec!["email".into()],
            missing_required: vec!["phone".into()],
        }));

        let profile = UserProfile::default();
        let report = run_attempt(&mut portal, &ctx(&profile), &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::Failed);
        assert!(report.error_message.unwrap().contains("phone"));
    }

    #[tokio::test(start_paused = true)]
    async fn unverified_submission_rechecks_then_fails_without_resubmitting() {
        let mut portal = StubPortal::happy();
        portal.verify_results.clear();
        portal.verify_results.push_back(Ok(None));
        portal.verify_results.push_back(Ok(None));

        let profile = UserProfile::default();
        let report = run_attempt(&mut portal, &ctx(&profile), &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::Failed);
        let last = report.errors.last().unwrap();
        assert_eq!(last.error, StepError::Unverified);
        assert!(last.recovery_attempted);
        // Exactly one submit click.
        assert!(portal.submit_results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recheck_can_still_verify() {
        let mut portal = StubPortal::happy();
        portal.verify_results.clear();
        portal.verify_results.push_back(Ok(None));
        portal.verify_results.push_back(Ok(Some("conf-late".into())));

        let profile = UserProfile::default();
        let report = run_attempt(&mut portal, &ctx(&profile), &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::Submitted);
        assert_eq!(report.confirmation_ref.as_deref(), Some("conf-late"));
    }

    #[tokio::test]
    async fn cancellation_aborts_to_failed() {
        let mut portal = StubPortal::happy();
        let profile = UserProfile::default();
        let (tx, rx) = watch::channel(true);

        let report = run_attempt(&mut portal, &ctx(&profile), &rx).await;
        drop(tx);

        assert_eq!(report.status, AttemptStatus::Failed);
        assert_eq!(
            report.errors.last().unwrap().error,
            StepError::Cancelled
        );
    }

    #[tokio::test]
    async fn missing_resume_path_fails_in_init() {
        let mut portal = StubPortal::happy();
        let profile = UserProfile::default();
        let mut context = ctx(&profile);
        context.resume_path = "";

        let report = run_attempt(&mut portal, &context, &no_cancel()).await;

        assert_eq!(report.status, AttemptStatus::Failed);
        assert_eq!(portal.navigations, 0);
    }
}
