mod sim;

use clap::{Parser, Subcommand};
use cohort_core::{Department, Severity};
use cohort_orchestrator::{
    EngineEvent, MemoryStateStore, Orchestrator, OrchestratorConfig, Topic,
};
use sim::{SimProfile, SimulatedAgent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cohort", about = "Cohort multi-agent task orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "cohort.toml", global = true)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated workload and print the final status as JSON
    Run {
        /// Number of simulated agents, spread across departments
        #[arg(long, default_value_t = 8)]
        agents: usize,
        /// Number of tasks to enqueue
        #[arg(long, default_value_t = 40)]
        tasks: usize,
        /// Concurrent tasks per agent
        #[arg(long, default_value_t = 2)]
        capacity: u32,
        /// Probability that a simulated agent reports a task as failed
        #[arg(long, default_value_t = 0.1, value_parser = parse_probability)]
        failure_rate: f64,
        /// Give up waiting for the workload after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn parse_probability(raw: &str) -> Result<f64, String> {
    let value: f64 = raw.parse().map_err(|e| format!("not a number: {e}"))?;
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("expected a probability between 0 and 1, got {raw}"))
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = OrchestratorConfig::load(path).await?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(OrchestratorConfig::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
        Commands::Run {
            agents,
            tasks,
            capacity,
            failure_rate,
            timeout_secs,
        } => {
            let profile = SimProfile {
                failure_rate,
                ..SimProfile::default()
            };
            run_workload(config, agents, tasks, capacity, profile, timeout_secs).await?;
        }
    }

    Ok(())
}

async fn run_workload(
    config: OrchestratorConfig,
    agent_count: usize,
    task_count: usize,
    capacity: u32,
    profile: SimProfile,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    if agent_count == 0 {
        anyhow::bail!("--agents must be at least 1");
    }

    let heartbeat_every = Duration::from_millis((config.scheduler.liveness_timeout_ms / 3).max(1));
    let store = Arc::new(MemoryStateStore::new());
    let orch = Orchestrator::start_with_store(config, store.clone()).await?;

    let mut alerts = orch.subscribe(&[Topic::Alerts]);
    let alert_log = tokio::spawn(async move {
        while let Some(envelope) = alerts.recv().await {
            if let EngineEvent::Alert { alert } = envelope.event {
                if alert.severity == Severity::Critical {
                    warn!(alert = %alert.message, "Critical alert");
                }
            }
        }
    });

    let mut agent_ids = Vec::with_capacity(agent_count);
    for i in 0..agent_count {
        let department = Department::ALL[i % Department::ALL.len()];
        let id = orch.register_agent(department, capacity)?;
        orch.attach_agent(
            id,
            Arc::new(SimulatedAgent::new(id, orch.bus().clone(), profile)),
        )?;
        agent_ids.push(id);
    }
    info!(agents = agent_ids.len(), "Simulated agents registered");

    for n in 0..task_count {
        // Every fifth task can go to any department.
        let hint = (n % 5 != 0).then(|| Department::ALL[n % Department::ALL.len()]);
        orch.enqueue_task(hint, serde_json::json!({ "job": n }))?;
    }
    info!(tasks = task_count, "Workload enqueued");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    let mut ticker = tokio::time::interval(heartbeat_every.min(Duration::from_millis(250)));
    loop {
        ticker.tick().await;
        for id in &agent_ids {
            orch.heartbeat(*id)?;
        }
        let counts = orch.status().counts;
        if counts.completed + counts.failed == task_count {
            info!(completed = counts.completed, failed = counts.failed, "Workload finished");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                queued = counts.queued,
                assigned = counts.assigned,
                "Workload timed out, shutting down"
            );
            break;
        }
    }

    let report = orch.shutdown().await;
    info!(
        drained = report.drained.len(),
        timed_out = report.timed_out.len(),
        cancelled = report.cancelled.len(),
        replicated_keys = store.keys().len(),
        "Shutdown complete"
    );

    let status = orch.status();
    drop(orch);
    alert_log.abort();

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
