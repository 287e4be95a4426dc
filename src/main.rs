mod automation;
mod config;
mod coordinator;
mod db;
mod error;
mod feedback;
mod intake;
mod models;
mod planner;
mod scorer;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use automation::machine::RetryPolicy;
use automation::sites::{supported_sites, WebPortalFactory};
use config::{Settings, UserProfile};
use coordinator::{Coordinator, SessionConfig};
use db::Database;
use feedback::FeedbackConfig;
use models::{ApplicationPlan, AttemptStatus, JobPosting};
use planner::PlanningContext;
use scorer::HttpScorer;

#[derive(Parser)]
#[command(name = "pursuit")]
#[command(about = "Job application automation - score, plan, apply, and learn from outcomes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Normalize raw posting records (JSON file, or '-' for stdin)
    Ingest {
        /// Path to a JSON array or JSON-lines file of raw postings
        file: String,

        /// Show what would be stored without storing
        #[arg(long)]
        dry_run: bool,
    },

    /// Score postings against the profile via the scoring service
    Score {
        /// Maximum postings to score this run
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },

    /// Show today's application plan without executing it
    Plan {
        /// Show at most this many entries
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Execute an application session
    Run {
        /// Restrict to these sites (comma-separated)
        #[arg(long, value_delimiter = ',')]
        sites: Vec<String>,

        /// Cap submissions this session (bounded by the daily budget)
        #[arg(long)]
        cap: Option<u32>,

        /// Parallel browser contexts
        #[arg(long)]
        concurrency: Option<usize>,

        /// Resolve duplicates and print the dispatch order, no browser
        #[arg(long)]
        dry_run: bool,
    },

    /// List application attempts
    Attempts {
        #[command(subcommand)]
        command: Option<AttemptCommands>,

        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// List recorded errors
    Errors {
        #[command(subcommand)]
        command: Option<ErrorCommands>,

        /// Filter by site
        #[arg(short, long)]
        site: Option<String>,

        /// Number of rows to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show or update site priority weights
    Weights {
        #[command(subcommand)]
        command: Option<WeightCommands>,
    },

    /// Manage resume variants
    Variants {
        #[command(subcommand)]
        command: VariantCommands,
    },
}

#[derive(Subcommand)]
enum AttemptCommands {
    /// Record a post-submission outcome (rejected, interview, offer)
    Mark {
        /// Attempt ID
        id: i64,

        /// New status
        status: String,
    },
}

#[derive(Subcommand)]
enum ErrorCommands {
    /// Mark an error record as resolved after triage
    Resolve {
        /// Error ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum WeightCommands {
    /// Recompute weights from the trailing outcome window
    Update,
}

#[derive(Subcommand)]
enum VariantCommands {
    /// Register a resume variant produced by the document pipeline
    Add {
        /// Name for this variant
        name: String,

        /// Path to the resume file
        file: PathBuf,

        /// Requirement tags this variant targets (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Use as the fallback when no history matches
        #[arg(long)]
        default: bool,
    },

    /// List registered variants
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let settings = Settings::load()?;
    let db = Database::open()?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Ingest { file, dry_run } => {
            db.ensure_initialized()?;
            let records = read_raw_records(&file)?;
            let stats = intake::ingest_records(&db, &records, dry_run)?;
            println!("Records seen: {}", stats.seen);
            println!("  Inserted:  {}", stats.inserted);
            println!("  Updated:   {}", stats.updated);
            println!("  Unchanged: {}", stats.unchanged);
            println!("  Skipped:   {}", stats.skipped);
            if dry_run {
                println!("\n(Dry run - nothing was stored)");
            }
        }

        Commands::Score { limit } => {
            db.ensure_initialized()?;
            let url = settings
                .scorer_url
                .as_deref()
                .ok_or_else(|| anyhow!("No scorer_url configured. Set it in pursuit.toml or PURSUIT_SCORER_URL."))?;
            let scorer = HttpScorer::new(url, Duration::from_secs(settings.scorer_timeout_secs))
                .map_err(|e| anyhow!("{e}"))?;
            let stats = scorer::score_pending(&db, &scorer, &settings.profile, limit).await?;
            println!("Scored:      {}", stats.scored);
            if stats.unavailable > 0 {
                println!("Unavailable: {} (left unscored)", stats.unavailable);
            }
        }

        Commands::Plan { limit } => {
            db.ensure_initialized()?;
            let mut plans = build_plans(&db, &settings)?;
            if let Some(n) = limit {
                plans.truncate(n);
            }
            if plans.is_empty() {
                println!("Nothing to plan - no eligible postings or budget exhausted.");
            } else {
                print_plan_table(&plans);
            }
        }

        Commands::Run {
            sites,
            cap,
            concurrency,
            dry_run,
        } => {
            db.ensure_initialized()?;
            run_session(&db, &settings, sites, cap, concurrency, dry_run).await?;
        }

        Commands::Attempts { command, status } => {
            db.ensure_initialized()?;
            match command {
                Some(AttemptCommands::Mark { id, status }) => {
                    let parsed = AttemptStatus::parse(&status)
                        .ok_or_else(|| anyhow!("Unknown status '{}'", status))?;
                    if !matches!(
                        parsed,
                        AttemptStatus::Rejected | AttemptStatus::Interview | AttemptStatus::Offer
                    ) {
                        bail!("Only post-submission outcomes (rejected, interview, offer) can be marked.");
                    }
                    let attempt = db
                        .get_attempt(id)?
                        .ok_or_else(|| anyhow!("Attempt #{} not found", id))?;
                    if !attempt.status.was_submitted() {
                        bail!(
                            "Attempt #{} is '{}' - only submitted applications take a response outcome.",
                            id,
                            attempt.status
                        );
                    }
                    db.set_attempt_status(id, parsed)?;
                    println!("Attempt #{} marked {}.", id, parsed);
                }
                None => {
                    let filter = match status.as_deref() {
                        Some(s) => Some(
                            AttemptStatus::parse(s)
                                .ok_or_else(|| anyhow!("Unknown status '{}'", s))?,
                        ),
                        None => None,
                    };
                    let attempts = db.list_attempts(filter)?;
                    if attempts.is_empty() {
                        println!("No attempts found.");
                    } else {
                        println!(
                            "{:<6} {:<20} {:<10} {:<30} {:<8} {:<20}",
                            "ID", "STATUS", "SITE", "TITLE", "RETRIES", "UPDATED"
                        );
                        println!("{}", "-".repeat(98));
                        for attempt in attempts {
                            let posting = db.get_posting(attempt.posting_id)?;
                            let (site, title) = posting
                                .map(|p| (p.site, p.title))
                                .unwrap_or_default();
                            println!(
                                "{:<6} {:<20} {:<10} {:<30} {:<8} {:<20}",
                                attempt.id,
                                attempt.status.as_str(),
                                truncate(&site, 8),
                                truncate(&title, 28),
                                attempt.retry_count,
                                truncate(&attempt.updated_at, 18)
                            );
                        }
                    }
                }
            }
        }

        Commands::Errors { command, site, limit } => {
            db.ensure_initialized()?;
            if let Some(ErrorCommands::Resolve { id }) = command {
                if db.resolve_error(id)? {
                    println!("Error #{} marked resolved.", id);
                } else {
                    println!("Error #{} not found.", id);
                }
                return Ok(());
            }
            let errors = db.list_errors(site.as_deref(), limit)?;
            if errors.is_empty() {
                println!("No errors recorded.");
            } else {
                println!(
                    "{:<6} {:<18} {:<10} {:<44} {:<20}",
                    "ID", "CATEGORY", "SITE", "MESSAGE", "OCCURRED"
                );
                println!("{}", "-".repeat(100));
                for e in errors {
                    println!(
                        "{:<6} {:<18} {:<10} {:<44} {:<20}",
                        e.id,
                        truncate(&e.category, 16),
                        truncate(&e.site.unwrap_or_default(), 8),
                        truncate(&e.message, 42),
                        truncate(&e.occurred_at, 18)
                    );
                }
            }
        }

        Commands::Weights { command } => {
            db.ensure_initialized()?;
            match command {
                Some(WeightCommands::Update) => {
                    let changes = feedback::update_site_weights(&db, &feedback_config(&settings))?;
                    if changes.is_empty() {
                        println!("No outcomes in the window - weights unchanged.");
                    } else {
                        println!("{:<12} {:>10} {:>10} {:>8} {:>9}", "SITE", "OLD", "NEW", "RATE", "ATTEMPTS");
                        println!("{}", "-".repeat(52));
                        for c in changes {
                            println!(
                                "{:<12} {:>10.3} {:>10.3} {:>8.2} {:>9}",
                                c.site, c.old_weight, c.new_weight, c.success_rate, c.attempts
                            );
                        }
                    }
                }
                None => {
                    let weights = db.list_site_weights()?;
                    if weights.is_empty() {
                        println!("No weights recorded yet - all sites weigh 1.0.");
                    } else {
                        println!("{:<12} {:>10} {:<20}", "SITE", "WEIGHT", "UPDATED");
                        println!("{}", "-".repeat(44));
                        for w in weights {
                            println!("{:<12} {:>10.3} {:<20}", w.site, w.weight, truncate(&w.updated_at, 18));
                        }
                    }
                }
            }
        }

        Commands::Variants { command } => {
            db.ensure_initialized()?;
            match command {
                VariantCommands::Add {
                    name,
                    file,
                    tags,
                    default,
                } => {
                    if !file.exists() {
                        bail!("Resume file not found: {}", file.display());
                    }
                    let id = db.create_resume_variant(
                        &name,
                        &file.to_string_lossy(),
                        &tags,
                        default,
                    )?;
                    println!("Registered variant '{}' (ID: {})", name, id);
                }
                VariantCommands::List => {
                    let variants = db.list_resume_variants()?;
                    if variants.is_empty() {
                        println!("No resume variants registered.");
                    } else {
                        println!("{:<6} {:<16} {:<8} {:<30} {:<24}", "ID", "NAME", "DEFAULT", "FILE", "TAGS");
                        println!("{}", "-".repeat(86));
                        for v in variants {
                            println!(
                                "{:<6} {:<16} {:<8} {:<30} {:<24}",
                                v.id,
                                truncate(&v.name, 14),
                                if v.is_default { "yes" } else { "" },
                                truncate(&v.file_path, 28),
                                truncate(&v.tags.join(","), 22)
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn read_raw_records(file: &str) -> Result<Vec<serde_json::Value>> {
    let contents = if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {file}"))?
    };

    // A JSON array, or one JSON object per line.
    if let Ok(records) = serde_json::from_str::<Vec<serde_json::Value>>(&contents) {
        return Ok(records);
    }
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).with_context(|| format!("Bad JSON line: {l}")))
        .collect()
}

/// Scores are cached per (profile_version, content_hash); a stale cache
/// entry is the same as no score at all.
fn effective_candidates(mut postings: Vec<JobPosting>, profile: &UserProfile) -> Vec<JobPosting> {
    for p in &mut postings {
        let fresh = p.scored_profile_version == Some(profile.profile_version)
            && p.scored_content_hash.as_deref() == Some(p.content_hash.as_str());
        if !fresh {
            p.match_score = None;
        }
    }
    postings
}

fn build_plans(db: &Database, settings: &Settings) -> Result<Vec<ApplicationPlan>> {
    let candidates = effective_candidates(db.list_active_postings()?, &settings.profile);
    let attempted = db.attempted_posting_ids(&settings.profile.name)?;
    let weights = db.site_weights()?;
    let variants = db.list_resume_variants()?;
    let outcomes = db.windowed_outcomes(settings.window_days, settings.window_attempts)?;
    let stats = feedback::variant_stats(&outcomes);
    let today_submitted = db.today_submitted_count(&settings.profile.name)?;

    let ctx = PlanningContext {
        profile: &settings.profile,
        today_submitted,
        attempted: &attempted,
        weights: &weights,
        variants: &variants,
        stats: &stats,
        min_score: settings.min_match_score,
    };
    Ok(planner::plan(&candidates, &ctx))
}

fn feedback_config(settings: &Settings) -> FeedbackConfig {
    FeedbackConfig {
        learning_rate: settings.learning_rate,
        target_rate: settings.target_rate,
        min_weight: settings.min_weight,
        max_weight: settings.max_weight,
        window_attempts: settings.window_attempts,
        window_days: settings.window_days,
    }
}

async fn run_session(
    db: &Database,
    settings: &Settings,
    sites: Vec<String>,
    cap: Option<u32>,
    concurrency: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    let mut plans = build_plans(db, settings)?;
    if !sites.is_empty() {
        for site in &sites {
            if !supported_sites().contains(&site.as_str()) {
                bail!("Unsupported site '{}'. Supported: {}", site, supported_sites().join(", "));
            }
        }
        let wanted: HashSet<&str> = sites.iter().map(String::as_str).collect();
        plans.retain(|p| wanted.contains(p.posting.site.as_str()));
    }

    let today_submitted = db.today_submitted_count(&settings.profile.name)?;
    let remaining = settings
        .profile
        .max_applications_per_day
        .saturating_sub(today_submitted);
    let budget = cap.map_or(remaining, |c| c.min(remaining));

    if dry_run {
        if plans.is_empty() {
            println!("Nothing to dispatch.");
            return Ok(());
        }
        println!("Dispatch order (budget {}):", budget);
        for (i, plan) in plans.iter().enumerate() {
            let duplicate = db
                .find_attempt(&settings.profile.name, plan.posting.id)?
                .map(|a| a.status.was_submitted())
                .unwrap_or(false);
            println!(
                "{:>3}. [{:<8}] {:<40} priority {:.3}{}",
                i + 1,
                plan.posting.site,
                truncate(&plan.posting.title, 38),
                plan.priority,
                if duplicate { "  (duplicate - would skip)" } else { "" }
            );
        }
        println!("\n(Dry run - no browser was launched)");
        return Ok(());
    }

    if plans.is_empty() {
        println!("Nothing to do - no eligible plans for this session.");
        return Ok(());
    }

    let factory = Arc::new(WebPortalFactory {
        webdriver_url: settings.webdriver_url.clone(),
        headless: settings.headless,
        timeout: Duration::from_secs(settings.browser_timeout_secs),
        screenshot_dir: settings.screenshot_dir.clone(),
    });

    let coordinator = Coordinator {
        db,
        profile: &settings.profile,
        factory,
        policy: RetryPolicy {
            max_retries: settings.max_retries,
            base_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
        },
    };

    let session_config = SessionConfig {
        budget,
        concurrency: concurrency.unwrap_or(settings.concurrency),
        site_delay: Duration::from_secs(settings.profile.application_delay_seconds),
        breaker_threshold: settings.breaker_threshold,
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received - finishing in-flight attempts...");
            let _ = cancel_tx.send(true);
        }
    });

    let summary = coordinator.run(plans, &session_config, cancel_rx).await?;
    let s = &summary.session;

    println!("\nSession #{} {}", s.id, s.status);
    println!("  Attempted:  {}", s.attempted);
    println!("  Submitted:  {}", s.successful);
    println!("  Failed:     {}", s.failed);
    println!("  Duplicates: {}", s.duplicates);
    println!("  Manual:     {}", s.manual);
    if summary.deferred > 0 {
        println!("  Deferred:   {} (requeued as pending)", summary.deferred);
    }
    if !s.site_counts.is_empty() {
        let mut sites: Vec<_> = s.site_counts.iter().collect();
        sites.sort();
        for (site, count) in sites {
            println!("    {:<10} {}", site, count);
        }
    }
    if !summary.manual_attempts.is_empty() {
        println!(
            "\n{} attempt(s) need manual intervention: {:?}",
            summary.manual_attempts.len(),
            summary.manual_attempts
        );
        println!("Resolve in the browser, then re-run to resume them.");
    }

    if let Some(reason) = summary.fatal {
        bail!("Session ended with a fatal error: {reason}");
    }
    Ok(())
}

fn print_plan_table(plans: &[ApplicationPlan]) {
    println!(
        "{:<4} {:<10} {:<32} {:<18} {:>8} {:>8}",
        "#", "SITE", "TITLE", "COMPANY", "SCORE", "PRIORITY"
    );
    println!("{}", "-".repeat(84));
    for (i, plan) in plans.iter().enumerate() {
        println!(
            "{:<4} {:<10} {:<32} {:<18} {:>8.2} {:>8.3}",
            i + 1,
            truncate(&plan.posting.site, 8),
            truncate(&plan.posting.title, 30),
            truncate(&plan.posting.company, 16),
            plan.posting.match_score.unwrap_or(0.0),
            plan.priority
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max.saturating_sub(3)])
    }
}
