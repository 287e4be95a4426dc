//! Session coordinator.
//!
//! Owns one automation session: a bounded pool of workers (one browser
//! context each), per-site rate limiting, a consecutive-failure circuit
//! breaker, and the session counters. Workers only execute and report;
//! every counter mutation and database write happens in this task, so
//! no two workers ever race on the budget.

use anyhow::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::automation::machine::{AttemptState, RetryPolicy};
use crate::automation::portal::PortalFactory;
use crate::automation::runner::{run_attempt, AttemptContext, AttemptReport};
use crate::config::UserProfile;
use crate::db::{Database, NewError};
use crate::error::StepError;
use crate::models::{ApplicationPlan, AttemptStatus, AutomationSession, SessionStatus};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Remaining daily budget when the session starts.
    pub budget: u32,
    pub concurrency: usize,
    /// Minimum spacing between attempts on the same site.
    pub site_delay: Duration,
    /// Consecutive failures on one site before it is suspended.
    pub breaker_threshold: u32,
}

#[derive(Debug)]
pub struct SessionSummary {
    pub session: AutomationSession,
    /// Attempt ids parked for a human.
    pub manual_attempts: Vec<i64>,
    /// Plans requeued as pending (suspended site, budget, or shutdown).
    pub deferred: usize,
    pub fatal: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    attempted: i64,
    successful: i64,
    failed: i64,
    duplicates: i64,
    manual: i64,
    site_counts: HashMap<String, i64>,
}

struct WorkerOutput {
    attempt_id: i64,
    site: String,
    result: Result<AttemptReport, StepError>,
}

pub struct Coordinator<'a> {
    pub db: &'a Database,
    pub profile: &'a UserProfile,
    pub factory: Arc<dyn PortalFactory>,
    pub policy: RetryPolicy,
}

impl Coordinator<'_> {
    pub async fn run(
        &self,
        plans: Vec<ApplicationPlan>,
        cfg: &SessionConfig,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SessionSummary> {
        let target_sites: Vec<String> = {
            let mut sites: Vec<String> = plans.iter().map(|p| p.posting.site.clone()).collect();
            sites.sort();
            sites.dedup();
            sites
        };
        let session_id = self.db.create_session(&self.profile.name, &target_sites)?;
        info!(session_id, plans = plans.len(), budget = cfg.budget, "session started");

        // Workers get their own cancel signal so a fatal engine error
        // can drain the pool even without outside cancellation.
        let (worker_cancel_tx, worker_cancel_rx) = watch::channel(false);

        let mut queue: VecDeque<ApplicationPlan> = plans.into();
        let mut deferred: Vec<ApplicationPlan> = Vec::new();
        let mut counters = Counters::default();
        let mut breaker: HashMap<String, u32> = HashMap::new();
        let mut suspended: HashSet<String> = HashSet::new();
        let mut next_slot: HashMap<String, Instant> = HashMap::new();
        let mut manual_attempts: Vec<i64> = Vec::new();
        let mut workers: JoinSet<WorkerOutput> = JoinSet::new();
        let mut in_flight: u32 = 0;
        let mut submitted: u32 = 0;
        let mut fatal: Option<String> = None;
        let mut cancelled = false;
        let mut cancel_closed = false;

        loop {
            let stop_dispatch = fatal.is_some() || cancelled;

            // Dispatch while there is budget headroom and a free slot.
            while !stop_dispatch
                && in_flight < cfg.concurrency as u32
                && submitted + in_flight < cfg.budget
            {
                let Some(plan) = queue.pop_front() else { break };
                let site = plan.posting.site.clone();

                if suspended.contains(&site) {
                    deferred.push(plan);
                    continue;
                }

                let attempt = self
                    .db
                    .create_or_get_attempt(&self.profile.name, plan.posting.id)?;

                // Duplicate resolution happens here, with zero browser
                // interaction: a pair that already reached submitted
                // stays submitted forever.
                if attempt.status.was_submitted() {
                    info!(posting = plan.posting.id, "already submitted, resolving as duplicate");
                    counters.attempted += 1;
                    counters.duplicates += 1;
                    *counters.site_counts.entry(site).or_insert(0) += 1;
                    continue;
                }
                if attempt.status == AttemptStatus::Duplicate {
                    counters.attempted += 1;
                    counters.duplicates += 1;
                    *counters.site_counts.entry(site).or_insert(0) += 1;
                    continue;
                }

                // A parked attempt resumes at its persisted state.
                let start_state = if attempt.status == AttemptStatus::ManualIntervention {
                    attempt
                        .last_state
                        .as_deref()
                        .and_then(AttemptState::parse)
                        .unwrap_or(AttemptState::Init)
                } else {
                    AttemptState::Init
                };

                self.db.mark_attempt_in_progress(
                    attempt.id,
                    session_id,
                    plan.resume_variant_id,
                    &plan.resume_path,
                )?;

                // Per-site spacing is reserved at dispatch so the slot
                // bookkeeping stays with the single owner.
                let now = Instant::now();
                let not_before = next_slot.get(&site).copied().unwrap_or(now).max(now);
                next_slot.insert(site.clone(), not_before + cfg.site_delay);

                let factory = Arc::clone(&self.factory);
                let profile = self.profile.clone();
                let policy = self.policy;
                let url = plan.posting.url.clone();
                let resume_path = plan.resume_path.clone();
                let worker_cancel = worker_cancel_rx.clone();
                let attempt_id = attempt.id;
                let worker_site = site.clone();

                workers.spawn(async move {
                    tokio::time::sleep_until(not_before).await;
                    let mut portal = match factory.open(&worker_site).await {
                        Ok(portal) => portal,
                        Err(e) => {
                            return WorkerOutput {
                                attempt_id,
                                site: worker_site,
                                result: Err(e),
                            }
                        }
                    };
                    let ctx = AttemptContext {
                        profile: &profile,
                        url: &url,
                        resume_path: &resume_path,
                        policy,
                        start_state,
                    };
                    let report = run_attempt(portal.as_mut(), &ctx, &worker_cancel).await;
                    portal.close().await;
                    WorkerOutput {
                        attempt_id,
                        site: worker_site,
                        result: Ok(report),
                    }
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let output = tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok(output)) => output,
                    Some(Err(e)) => {
                        error!(%e, "worker panicked");
                        fatal = Some(format!("worker panicked: {e}"));
                        in_flight -= 1;
                        continue;
                    }
                    None => break,
                },
                changed = cancel.changed(), if !cancel_closed => {
                    match changed {
                        Ok(()) => {
                            if *cancel.borrow() {
                                warn!("cancellation requested, draining in-flight attempts");
                                cancelled = true;
                                let _ = worker_cancel_tx.send(true);
                            }
                        }
                        // Sender gone; nothing further to listen for.
                        Err(_) => cancel_closed = true,
                    }
                    continue;
                }
            };
            in_flight -= 1;

            match output.result {
                Ok(ref report) => {
                    self.record_report(session_id, &output, report, &mut counters)?;
                    if report.status == AttemptStatus::Submitted {
                        submitted += 1;
                    }
                    if report.status == AttemptStatus::ManualIntervention {
                        manual_attempts.push(output.attempt_id);
                    }

                    // Circuit breaker: consecutive failures per site.
                    if report.status == AttemptStatus::Failed {
                        let streak = breaker.entry(output.site.clone()).or_insert(0);
                        *streak += 1;
                        if *streak >= cfg.breaker_threshold && !suspended.contains(&output.site) {
                            warn!(site = %output.site, streak = *streak, "suspending site for the rest of the session");
                            suspended.insert(output.site.clone());
                        }
                    } else {
                        breaker.insert(output.site.clone(), 0);
                    }

                    if report.fatal_engine && fatal.is_none() {
                        fatal = Some(
                            report
                                .error_message
                                .clone()
                                .unwrap_or_else(|| "browser engine lost".to_string()),
                        );
                        let _ = worker_cancel_tx.send(true);
                    }
                }
                Err(e) => {
                    // The portal never opened.
                    if e.is_fatal_to_session() {
                        error!(%e, "browser engine unavailable, ending session");
                        if fatal.is_none() {
                            fatal = Some(e.to_string());
                            let _ = worker_cancel_tx.send(true);
                        }
                        self.db.requeue_attempt(output.attempt_id)?;
                    } else {
                        counters.attempted += 1;
                        counters.failed += 1;
                        *counters.site_counts.entry(output.site.clone()).or_insert(0) += 1;
                        self.db.record_attempt_outcome(
                            output.attempt_id,
                            AttemptStatus::Failed,
                            0,
                            None,
                            None,
                            Some(&e.to_string()),
                            None,
                        )?;
                        self.db.append_error(&NewError {
                            attempt_id: Some(output.attempt_id),
                            session_id: Some(session_id),
                            error_type: e.category().as_str().to_string(),
                            category: e.category().as_str().to_string(),
                            site: Some(output.site.clone()),
                            message: e.to_string(),
                            ..Default::default()
                        })?;
                    }
                }
            }

            self.db.update_session_counters(
                session_id,
                counters.attempted,
                counters.successful,
                counters.failed,
                counters.duplicates,
                counters.manual,
                &counters.site_counts,
            )?;
        }

        // Anything never dispatched is requeued, not dropped.
        deferred.extend(queue.drain(..));
        for plan in &deferred {
            self.db
                .create_or_get_attempt(&self.profile.name, plan.posting.id)?;
        }

        self.db.update_session_counters(
            session_id,
            counters.attempted,
            counters.successful,
            counters.failed,
            counters.duplicates,
            counters.manual,
            &counters.site_counts,
        )?;

        let status = if fatal.is_some() {
            SessionStatus::Failed
        } else if cancelled {
            SessionStatus::Cancelled
        } else {
            SessionStatus::Completed
        };
        self.db.finish_session(session_id, status, fatal.as_deref())?;
        info!(session_id, status = %status, attempted = counters.attempted, "session ended");

        let session = self
            .db
            .get_session(session_id)?
            .ok_or_else(|| anyhow::anyhow!("session row vanished"))?;
        Ok(SessionSummary {
            session,
            manual_attempts,
            deferred: deferred.len(),
            fatal,
        })
    }

    fn record_report(
        &self,
        session_id: i64,
        output: &WorkerOutput,
        report: &AttemptReport,
        counters: &mut Counters,
    ) -> Result<()> {
        self.db.record_attempt_outcome(
            output.attempt_id,
            report.status,
            report.retry_count,
            Some(report.last_state.as_str()),
            report.confirmation_ref.as_deref(),
            report.error_message.as_deref(),
            report.screenshot_path.as_deref(),
        )?;

        for event in &report.errors {
            self.db.append_error(&NewError {
                attempt_id: Some(output.attempt_id),
                session_id: Some(session_id),
                error_type: event.error.category().as_str().to_string(),
                category: event.error.category().as_str().to_string(),
                site: Some(output.site.clone()),
                message: format!("{} (state: {})", event.error, event.state),
                recovery_attempted: event.recovery_attempted,
                recovery_successful: event.recovery_successful,
                screenshot_path: report.screenshot_path.clone(),
                ..Default::default()
            })?;
        }

        counters.attempted += 1;
        match report.status {
            AttemptStatus::Submitted => counters.successful += 1,
            AttemptStatus::Failed => counters.failed += 1,
            AttemptStatus::Duplicate => counters.duplicates += 1,
            AttemptStatus::ManualIntervention => counters.manual += 1,
            _ => {}
        }
        *counters
            .site_counts
            .entry(output.site.clone())
            .or_insert(0) += 1;
        Ok(())
    }
}
