//! The application attempt state machine.
//!
//! One attempt flows Init → Navigating → FormDetected → FormFilled →
//! DocumentUploaded → Submitted → Verified. Retry policy and suspension
//! points are data here, not control flow, so the whole thing is
//! testable without a browser; executing the steps is the runner's job.

use rand::Rng;

use crate::error::StepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Init,
    Navigating,
    FormDetected,
    FormFilled,
    DocumentUploaded,
    Submitted,
    Verified,
    Duplicate,
    Failed,
    ManualIntervention,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Init => "init",
            AttemptState::Navigating => "navigating",
            AttemptState::FormDetected => "form_detected",
            AttemptState::FormFilled => "form_filled",
            AttemptState::DocumentUploaded => "document_uploaded",
            AttemptState::Submitted => "submitted",
            AttemptState::Verified => "verified",
            AttemptState::Duplicate => "duplicate",
            AttemptState::Failed => "failed",
            AttemptState::ManualIntervention => "manual_intervention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "init" => Some(AttemptState::Init),
            "navigating" => Some(AttemptState::Navigating),
            "form_detected" => Some(AttemptState::FormDetected),
            "form_filled" => Some(AttemptState::FormFilled),
            "document_uploaded" => Some(AttemptState::DocumentUploaded),
            "submitted" => Some(AttemptState::Submitted),
            "verified" => Some(AttemptState::Verified),
            "duplicate" => Some(AttemptState::Duplicate),
            "failed" => Some(AttemptState::Failed),
            "manual_intervention" => Some(AttemptState::ManualIntervention),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Verified | AttemptState::Duplicate | AttemptState::Failed
        )
    }

    /// The next phase on success. None from `Verified` (the happy-path
    /// terminal) and from the other terminals.
    fn successor(&self) -> Option<AttemptState> {
        match self {
            AttemptState::Init => Some(AttemptState::Navigating),
            AttemptState::Navigating => Some(AttemptState::FormDetected),
            AttemptState::FormDetected => Some(AttemptState::FormFilled),
            AttemptState::FormFilled => Some(AttemptState::DocumentUploaded),
            AttemptState::DocumentUploaded => Some(AttemptState::Submitted),
            AttemptState::Submitted => Some(AttemptState::Verified),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened while executing the current phase.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Advance,
    /// The site signalled a prior application for this job.
    Duplicate,
    /// CAPTCHA or unexpected auth challenge.
    Challenge,
    Fail(StepError),
}

/// The machine's decision after feeding it a step outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Next(AttemptState),
    Retry {
        state: AttemptState,
        error: StepError,
        delay_ms: u64,
    },
    /// Parked for a human. The in-flight state is preserved so a
    /// resumed attempt picks up where it stopped.
    Park,
    Complete(AttemptState),
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given 1-based attempt, capped at
    /// `max_delay_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms)
    }

    /// Add a little jitter to a computed delay, still bounded by
    /// `max_delay_ms`.
    pub fn with_jitter(&self, delay_ms: u64) -> u64 {
        let jitter = rand::thread_rng().gen_range(0..=250);
        delay_ms.saturating_add(jitter).min(self.max_delay_ms)
    }
}

#[derive(Debug)]
pub struct Machine {
    pub state: AttemptState,
    pub retry_count: u32,
    /// The one alternate-strategy retry granted for form detection.
    pub element_retry_used: bool,
    pub history: Vec<AttemptState>,
    policy: RetryPolicy,
}

impl Machine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::resume_from(policy, AttemptState::Init)
    }

    /// Start at a persisted state. Used when a parked attempt is
    /// resumed, so completed phases are not repeated.
    pub fn resume_from(policy: RetryPolicy, state: AttemptState) -> Self {
        Self {
            state,
            retry_count: 0,
            element_retry_used: false,
            history: Vec::new(),
            policy,
        }
    }

    pub fn next(&mut self, outcome: StepOutcome) -> Transition {
        match outcome {
            StepOutcome::Advance => match self.state.successor() {
                Some(next) => {
                    self.history.push(self.state);
                    self.state = next;
                    Transition::Next(next)
                }
                None => self.complete(AttemptState::Verified),
            },
            StepOutcome::Duplicate => self.complete(AttemptState::Duplicate),
            StepOutcome::Challenge => {
                // State stays put; the runner persists it for resume.
                Transition::Park
            }
            StepOutcome::Fail(error) => self.handle_failure(error),
        }
    }

    fn handle_failure(&mut self, error: StepError) -> Transition {
        if matches!(error, StepError::Cancelled) || error.is_fatal_to_session() {
            return self.complete(AttemptState::Failed);
        }

        if error.is_retryable() && self.retry_count < self.policy.max_retries {
            self.retry_count += 1;
            return Transition::Retry {
                state: self.state,
                delay_ms: self.policy.backoff_ms(self.retry_count),
                error,
            };
        }

        if matches!(error, StepError::ElementNotFound(_)) && !self.element_retry_used {
            self.element_retry_used = true;
            return Transition::Retry {
                state: self.state,
                delay_ms: self.policy.base_delay_ms,
                error,
            };
        }

        self.complete(AttemptState::Failed)
    }

    fn complete(&mut self, terminal: AttemptState) -> Transition {
        self.history.push(self.state);
        self.state = terminal;
        Transition::Complete(terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        }
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut m = Machine::new(policy(3));
        let expected = [
            AttemptState::Navigating,
            AttemptState::FormDetected,
            AttemptState::FormFilled,
            AttemptState::DocumentUploaded,
            AttemptState::Submitted,
            AttemptState::Verified,
        ];
        for state in expected {
            assert_eq!(m.next(StepOutcome::Advance), Transition::Next(state));
        }
        // Verification succeeded; terminal.
        assert_eq!(
            m.next(StepOutcome::Advance),
            Transition::Complete(AttemptState::Verified)
        );
        assert!(m.state.is_terminal());
        assert_eq!(m.retry_count, 0);
    }

    #[test]
    fn navigation_fails_twice_then_succeeds() {
        let mut m = Machine::new(policy(3));
        m.next(StepOutcome::Advance); // → Navigating

        let t = m.next(StepOutcome::Fail(StepError::Network("reset".into())));
        assert!(matches!(t, Transition::Retry { delay_ms: 100, .. }));
        let t = m.next(StepOutcome::Fail(StepError::Timeout("navigate".into())));
        assert!(matches!(t, Transition::Retry { delay_ms: 200, .. }));

        let t = m.next(StepOutcome::Advance);
        assert_eq!(t, Transition::Next(AttemptState::FormDetected));
        assert_eq!(m.retry_count, 2);
    }

    #[test]
    fn retry_budget_exhaustion_fails_the_attempt() {
        let mut m = Machine::new(policy(2));
        m.next(StepOutcome::Advance); // → Navigating

        m.next(StepOutcome::Fail(StepError::Network("1".into())));
        m.next(StepOutcome::Fail(StepError::Network("2".into())));
        let t = m.next(StepOutcome::Fail(StepError::Network("3".into())));
        assert_eq!(t, Transition::Complete(AttemptState::Failed));
        assert_eq!(m.retry_count, 2);
    }

    #[test]
    fn element_not_found_retries_once_with_alternate_strategy() {
        let mut m = Machine::new(policy(3));
        m.next(StepOutcome::Advance); // → Navigating
        m.next(StepOutcome::Advance); // → FormDetected

        let t = m.next(StepOutcome::Fail(StepError::ElementNotFound("form".into())));
        assert!(matches!(t, Transition::Retry { .. }));
        assert!(m.element_retry_used);

        let t = m.next(StepOutcome::Fail(StepError::ElementNotFound("form".into())));
        assert_eq!(t, Transition::Complete(AttemptState::Failed));
        // The bounded retry budget was not consumed by the alternate try.
        assert_eq!(m.retry_count, 0);
    }

    #[test]
    fn duplicate_short_circuits_from_any_state() {
        for advances in 0..5 {
            let mut m = Machine::new(policy(3));
            for _ in 0..advances {
                m.next(StepOutcome::Advance);
            }
            let t = m.next(StepOutcome::Duplicate);
            assert_eq!(t, Transition::Complete(AttemptState::Duplicate));
        }
    }

    #[test]
    fn challenge_parks_without_losing_state() {
        let mut m = Machine::new(policy(3));
        m.next(StepOutcome::Advance); // → Navigating
        m.next(StepOutcome::Advance); // → FormDetected

        let t = m.next(StepOutcome::Challenge);
        assert_eq!(t, Transition::Park);
        assert_eq!(m.state, AttemptState::FormDetected);
    }

    #[test]
    fn resumed_machine_skips_completed_phases() {
        let mut m = Machine::resume_from(policy(3), AttemptState::FormFilled);
        assert_eq!(m.state, AttemptState::FormFilled);
        let t = m.next(StepOutcome::Advance);
        assert_eq!(t, Transition::Next(AttemptState::DocumentUploaded));
    }

    #[test]
    fn cancellation_and_unverified_are_fatal_to_the_attempt() {
        let mut m = Machine::new(policy(3));
        m.next(StepOutcome::Advance);
        let t = m.next(StepOutcome::Fail(StepError::Cancelled));
        assert_eq!(t, Transition::Complete(AttemptState::Failed));

        let mut m = Machine::new(policy(3));
        for _ in 0..6 {
            m.next(StepOutcome::Advance);
        }
        assert_eq!(m.state, AttemptState::Verified);
        let t = m.next(StepOutcome::Fail(StepError::Unverified));
        assert_eq!(t, Transition::Complete(AttemptState::Failed));
    }

    #[test]
    fn backoff_is_nondecreasing_and_bounded() {
        let p = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 500,
            max_delay_ms: 8000,
        };
        let mut last = 0;
        for attempt in 1..=10 {
            let delay = p.backoff_ms(attempt);
            assert!(delay >= last);
            assert!(delay <= p.max_delay_ms);
            last = delay;
        }
        assert_eq!(p.backoff_ms(1), 500);
        assert_eq!(p.backoff_ms(2), 1000);
        assert_eq!(p.backoff_ms(3), 2000);
        assert_eq!(p.backoff_ms(5), 8000);
        assert_eq!(p.backoff_ms(9), 8000);

        for attempt in 1..=10 {
            assert!(p.with_jitter(p.backoff_ms(attempt)) <= p.max_delay_ms);
        }
    }

    #[test]
    fn state_labels_roundtrip() {
        for state in [
            AttemptState::Init,
            AttemptState::Navigating,
            AttemptState::FormDetected,
            AttemptState::FormFilled,
            AttemptState::DocumentUploaded,
            AttemptState::Submitted,
            AttemptState::Verified,
            AttemptState::Duplicate,
            AttemptState::Failed,
            AttemptState::ManualIntervention,
        ] {
            assert_eq!(AttemptState::parse(state.as_str()), Some(state));
        }
    }
}
