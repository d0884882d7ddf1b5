//! Ralph Fleet - operator CLI
//!
//! Inspect and steer the loops supervised under a project's fleet root.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::mpsc;

use ralph_fleet::state::LoopStatus;
use ralph_fleet::{
    ControlAction, Fleet, FleetConfig, FleetError, IterationOutcome, LivenessSignal, LoopConfig,
    LoopRecord, Priority, RecoveryResult,
};

#[derive(Parser)]
#[command(name = "ralph-fleet")]
#[command(version)]
#[command(about = "Supervise concurrent autonomous Claude Code loops", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the concurrent loop limit
    #[arg(long, global = true, env = "RALPH_FLEET_MAX_LOOPS")]
    max_loops: Option<usize>,

    /// Use the per-user fleet root instead of the project's
    #[arg(long, global = true)]
    global: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List loops
    List {
        /// Include completed and aborted loops
        #[arg(short, long)]
        all: bool,
    },

    /// Show one loop
    Show {
        loop_id: String,

        /// Print the raw record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create and register a loop
    Create {
        /// Display name, slugified into the loop id
        name: String,

        /// Iteration budget
        #[arg(short, long, default_value = "50")]
        max_iterations: u32,

        /// Definition of done
        #[arg(short, long, default_value = "")]
        criteria: String,

        #[arg(long, value_enum, default_value = "normal")]
        priority: Priority,

        /// Tag, may be repeated
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Owner pid (defaults to the parent of this process)
        #[arg(long)]
        pid: Option<u32>,

        /// Register even when the fleet is at capacity
        #[arg(long)]
        allow_over_capacity: bool,
    },

    /// Set a loop's status
    SetStatus {
        loop_id: String,

        #[arg(value_enum)]
        status: LoopStatus,
    },

    /// Record a heartbeat for a loop
    Heartbeat {
        loop_id: String,
    },

    /// Feed one iteration outcome through the loop's controller
    Iterate {
        loop_id: String,

        /// Completion in [0, 1]
        #[arg(long)]
        completion: f64,

        /// Quality in [0, 1]
        #[arg(long, default_value = "1.0")]
        quality: f64,

        /// Error message, may be repeated
        #[arg(long = "error")]
        errors: Vec<String>,

        /// Blocker, may be repeated
        #[arg(long = "blocker")]
        blockers: Vec<String>,

        /// Learning, may be repeated
        #[arg(long = "learning")]
        learnings: Vec<String>,
    },

    /// Check every active loop for crashes and stale heartbeats
    Sweep {
        /// Stale threshold in seconds (defaults to config)
        #[arg(long)]
        threshold_secs: Option<u64>,

        /// Recover crashed loops found by the sweep
        #[arg(long)]
        recover: bool,
    },

    /// Sweep on an interval until interrupted, recovering crashed loops
    Monitor {
        /// Sweep interval in seconds (defaults to config)
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// Recover a crashed loop
    Recover {
        loop_id: String,

        /// Hand the recovering loop to this live pid
        #[arg(long)]
        resume_pid: Option<u32>,
    },

    /// Restore a loop from a checkpoint
    Restore {
        loop_id: String,

        /// Checkpoint id (defaults to the newest)
        #[arg(short, long)]
        checkpoint: Option<String>,
    },

    /// List or prune a loop's checkpoints
    Checkpoints {
        loop_id: String,

        /// Keep only the newest N checkpoints
        #[arg(long)]
        prune: Option<usize>,
    },

    /// Archive a completed or aborted loop
    Archive {
        loop_id: String,
    },

    /// Drop registry entries whose loop state is gone
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "ralph_fleet=debug,info"
    } else {
        "ralph_fleet=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    if let Err(e) = run(cli, &project_path).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }
    Ok(())
}

fn load_config(cli: &Cli, project_path: &Path) -> ralph_fleet::Result<FleetConfig> {
    let mut config = FleetConfig::load(project_path)?;
    if let Some(max) = cli.max_loops {
        config = config.with_max_concurrent_loops(max);
    }
    if cli.global {
        let dir = FleetConfig::global_state_dir()
            .ok_or_else(|| FleetError::config("No home directory for the global fleet root"))?;
        config.state_dir = Some(dir);
    }
    Ok(config)
}

async fn run(cli: Cli, project_path: &Path) -> ralph_fleet::Result<()> {
    let config = load_config(&cli, project_path)?;
    let fleet = Fleet::open(project_path, config)?;

    match cli.command {
        Commands::List { all } => {
            let loops: Vec<LoopRecord> = fleet
                .state()
                .list_loops()?
                .into_iter()
                .filter(|r| all || !r.status.is_terminal())
                .collect();
            let snapshot = fleet.registry().snapshot()?;

            if loops.is_empty() {
                println!("No loops");
            }
            for record in &loops {
                println!(
                    "{:<32} {:<11} {:>4}/{:<4} pid {:<7} {}",
                    record.id.bold(),
                    colored_status(record.status),
                    record.iteration,
                    record.max_iterations,
                    record.pid,
                    record.priority
                );
            }
            println!(
                "\n{} active / {} max, {} coordination paths (created {}, completed {}, aborted {})",
                snapshot.active_count(),
                fleet.registry().max_concurrent_loops(),
                snapshot.coordination_paths(),
                snapshot.counters.created,
                snapshot.counters.completed,
                snapshot.counters.aborted
            );
        }

        Commands::Show { loop_id, json } => {
            let record = fleet.state().get_loop(&loop_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
                return Ok(());
            }

            println!("{}", record.id.bold());
            println!("  Status:     {}", colored_status(record.status));
            println!(
                "  Iteration:  {}/{} ({:.0}%)",
                record.iteration,
                record.max_iterations,
                record.progress() * 100.0
            );
            println!("  Pid:        {}", record.pid);
            println!("  Priority:   {}", record.priority);
            println!("  Started:    {}", record.started_at.to_rfc3339());
            println!("  Updated:    {}", record.updated_at.to_rfc3339());
            if !record.completion_criteria.is_empty() {
                println!("  Criteria:   {}", record.completion_criteria);
            }
            if !record.tags.is_empty() {
                let tags: Vec<&str> = record.tags.iter().map(String::as_str).collect();
                println!("  Tags:       {}", tags.join(", "));
            }
            if record.recovery_attempts > 0 {
                println!("  Recoveries: {}", record.recovery_attempts);
            }
            if let Some(hb) = fleet.liveness().read_heartbeat(&record.id)? {
                println!(
                    "  Heartbeat:  {} (iteration {})",
                    hb.timestamp.to_rfc3339(),
                    hb.iteration
                );
            }
            if !record.learnings.is_empty() {
                println!("  Learnings:");
                for learning in &record.learnings {
                    println!("    - {learning}");
                }
            }
        }

        Commands::Create {
            name,
            max_iterations,
            criteria,
            priority,
            tags,
            pid,
            allow_over_capacity,
        } => {
            let mut request = LoopConfig::new(name)
                .with_max_iterations(max_iterations)
                .with_completion_criteria(criteria)
                .with_priority(priority)
                .allow_over_capacity(allow_over_capacity)
                .with_pid(pid.unwrap_or_else(owner_pid));
            for tag in tags {
                request = request.with_tag(tag);
            }

            let record = fleet.create_loop(&request)?;
            println!("{} Created loop {}", "OK".green().bold(), record.id.bold());
        }

        Commands::SetStatus { loop_id, status } => {
            let record = fleet.state().update_loop(&loop_id, |r| r.status = status)?;
            println!(
                "{} {} is now {}",
                "OK".green().bold(),
                record.id,
                colored_status(record.status)
            );
        }

        Commands::Heartbeat { loop_id } => {
            let record = fleet.state().get_loop(&loop_id)?;
            let hb = fleet
                .liveness()
                .record_heartbeat(&loop_id, record.iteration, record.status)?;
            println!(
                "{} Heartbeat recorded for {} at {}",
                "OK".green(),
                loop_id,
                hb.timestamp.to_rfc3339()
            );
        }

        Commands::Iterate {
            loop_id,
            completion,
            quality,
            errors,
            blockers,
            learnings,
        } => {
            let outcome = IterationOutcome::new(completion, quality)
                .with_errors(errors)
                .with_blockers(blockers)
                .with_learnings(learnings);
            let decision = fleet.process_iteration(&loop_id, &outcome)?;

            let action = match decision.action {
                ControlAction::Continue => decision.action.to_string().green(),
                ControlAction::Adjust => decision.action.to_string().yellow(),
                ControlAction::Pause | ControlAction::Abort => decision.action.to_string().red(),
            };
            println!(
                "{} signal {:.3} urgency {:?} trend {:?}",
                action.bold(),
                decision.control_signal,
                decision.urgency,
                decision.trend
            );
            for alarm in &decision.alarms.fired {
                println!("  {} {}", format!("[{:?}]", alarm.severity).red(), alarm.message);
            }
            for recommendation in &decision.recommendations {
                println!("  - {recommendation}");
            }
        }

        Commands::Sweep {
            threshold_secs,
            recover,
        } => {
            let threshold = threshold_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| fleet.config().liveness.stale_threshold());
            let signals = fleet.liveness().sweep_registry(threshold)?;

            if signals.is_empty() {
                println!("{} All active loops healthy", "OK".green().bold());
            }
            for signal in &signals {
                print_signal(signal);
            }

            if recover {
                let (results, stats) = fleet.recovery().recover_all(&signals);
                for result in &results {
                    print_recovery(result);
                }
                println!(
                    "\nRecovered {}, aborted {}, failed {}",
                    stats.recovered, stats.aborted, stats.failed
                );
            }
        }

        Commands::Monitor { interval_secs } => {
            let interval = interval_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| fleet.config().liveness.sweep_interval());
            let threshold = fleet.config().liveness.stale_threshold();
            let (tx, mut rx) = mpsc::channel(64);
            let handle = Arc::clone(fleet.liveness()).spawn_monitor(interval, threshold, tx);

            println!(
                "Monitoring every {}s, press Ctrl-C to stop",
                interval.as_secs()
            );
            loop {
                tokio::select! {
                    signal = rx.recv() => {
                        let Some(signal) = signal else { break };
                        print_signal(&signal);
                        if matches!(signal, LivenessSignal::Crashed { .. }) {
                            let (results, _) = fleet.recovery().recover_all(std::slice::from_ref(&signal));
                            for result in &results {
                                print_recovery(result);
                            }
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            drop(rx);
            handle.abort();
        }

        Commands::Recover {
            loop_id,
            resume_pid,
        } => {
            if let Some(pid) = resume_pid {
                let record = fleet.recovery().mark_recovered(&loop_id, pid)?;
                println!(
                    "{} {} running again under pid {}",
                    "OK".green().bold(),
                    record.id,
                    record.pid
                );
                return Ok(());
            }

            let result = fleet.recovery().recover(&loop_id)?;
            print_recovery(&result);
            if let RecoveryResult::Recovered(plan) = result {
                println!("\n{}", plan.context);
            }
        }

        Commands::Restore {
            loop_id,
            checkpoint,
        } => {
            let restored = fleet
                .recovery()
                .restore_from_checkpoint(&loop_id, checkpoint.as_deref())?;
            println!(
                "{} Restored {} from {} (iteration {})",
                "OK".green().bold(),
                loop_id,
                restored.checkpoint_id,
                restored.record.iteration
            );
        }

        Commands::Checkpoints { loop_id, prune } => {
            if !fleet.state().exists(&loop_id) {
                return Err(FleetError::not_found(loop_id));
            }
            if let Some(keep) = prune {
                let removed = fleet.checkpoints().prune(&loop_id, keep)?;
                println!("{} Pruned {} checkpoint(s)", "OK".green(), removed);
            }
            let checkpoints = fleet.checkpoints().list(&loop_id)?;
            if checkpoints.is_empty() {
                println!("No checkpoints");
            }
            for checkpoint in &checkpoints {
                println!("  {}", checkpoint.summary());
            }
        }

        Commands::Archive { loop_id } => {
            let dest = fleet.archive_loop(&loop_id)?;
            println!(
                "{} Archived {} to {}",
                "OK".green().bold(),
                loop_id,
                dest.display()
            );
        }

        Commands::Reconcile => {
            let dropped = fleet.reconcile()?;
            if dropped.is_empty() {
                println!("{} Registry consistent", "OK".green().bold());
            }
            for id in dropped {
                println!("  dropped {}", id.yellow());
            }
        }
    }

    Ok(())
}

/// The CLI exits immediately, so the shell or orchestrator that invoked it
/// owns the loop.
fn owner_pid() -> u32 {
    #[cfg(unix)]
    {
        std::os::unix::process::parent_id()
    }
    #[cfg(not(unix))]
    {
        std::process::id()
    }
}

fn colored_status(status: LoopStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        LoopStatus::Running | LoopStatus::Completing => text.green(),
        LoopStatus::Completed => text.blue(),
        LoopStatus::Paused | LoopStatus::Waiting | LoopStatus::Recovering => text.yellow(),
        LoopStatus::Aborted => text.red(),
    }
}

fn print_signal(signal: &LivenessSignal) {
    match signal {
        LivenessSignal::Crashed { loop_id, pid } => {
            println!("{} {} (pid {} gone)", "CRASHED".red().bold(), loop_id, pid);
        }
        LivenessSignal::Stale { loop_id, pid, age } => {
            let age = age.map_or_else(|| "never".to_string(), |a| format!("{}s ago", a.as_secs()));
            println!(
                "{} {} (pid {}, last heartbeat {})",
                "STALE".yellow().bold(),
                loop_id,
                pid,
                age
            );
        }
    }
}

fn print_recovery(result: &RecoveryResult) {
    match result {
        RecoveryResult::Recovered(plan) => println!(
            "{} {} via {} (attempt {}{})",
            "RECOVERED".green().bold(),
            plan.loop_id,
            plan.strategy.name(),
            plan.attempt,
            plan.checkpoint
                .as_ref()
                .map(|c| format!(", checkpoint {c}"))
                .unwrap_or_default()
        ),
        RecoveryResult::NotCrashed { loop_id } => {
            println!("{} {} has a live owner", "SKIPPED".dimmed(), loop_id);
        }
        RecoveryResult::Aborted { loop_id, attempts } => println!(
            "{} {} after {} recovery attempts",
            "ABORTED".red().bold(),
            loop_id,
            attempts
        ),
        RecoveryResult::Failed { loop_id, error } => {
            println!("{} {}: {}", "FAILED".red().bold(), loop_id, error);
        }
    }
}
