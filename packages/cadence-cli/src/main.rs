use anyhow::{Context, Result};
use cadence_scheduler::{
    CallError, CallbackTask, ChainConfig, ManagerConfig, ManualClock, OwnerError, TaskManager,
    TaskOwner, TaskRef, Value, callable, new_task,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Cadence task scheduler CLI", long_about = None)]
struct Cli {
    /// Log every scheduling decision
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a set of demo tasks on a simulated clock
    Simulate {
        /// Number of frames to run
        #[arg(long, default_value_t = 10)]
        frames: u32,
        /// Seconds of simulated time per frame
        #[arg(long, default_value_t = 0.25)]
        dt: f64,
        /// Manager config (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Run chains on scoped threads
        #[arg(long)]
        parallel: bool,
    },
    /// Print the effective manager config
    ShowConfig {
        /// Manager config (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Logs lifecycle notifications for the tasks it owns.
struct LoggingOwner;

impl TaskOwner for LoggingOwner {
    fn add_task(&self, task: &TaskRef) -> Result<(), OwnerError> {
        tracing::info!("owner took {}", task);
        Ok(())
    }

    fn clear_task(&self, task: &TaskRef) -> Result<(), OwnerError> {
        tracing::info!("owner released {}", task);
        Ok(())
    }

    fn describe(&self) -> String {
        "LoggingOwner".to_string()
    }
}

fn load_config(path: Option<&Path>) -> Result<ManagerConfig> {
    let Some(path) = path else {
        return Ok(ManagerConfig::default()
            .with_name("cadence")
            .with_chain(ChainConfig::new("background").with_frame_budget(0.05)));
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ManagerConfig::from_json(&json)?)
}

fn countdown(from: i64) -> Result<CallbackTask> {
    let task = new_task(
        callable(|args| {
            let me = args
                .last()
                .and_then(Value::as_task)
                .and_then(CallbackTask::from_task)
                .ok_or_else(|| CallError::new("countdown expects itself as the last argument"))?;
            let remaining = me.get_attr("remaining")?.as_int().unwrap_or(0) - 1;
            me.set_attr("remaining", Value::Int(remaining))?;
            Ok(Value::Int(if remaining > 0 { 1 } else { 0 }))
        }),
        "countdown",
    )?;
    task.set_args(Value::None, true)?;
    task.set_attr("remaining", Value::Int(from))?;
    task.set_owner(Some(Arc::new(LoggingOwner)));
    Ok(task)
}

fn heartbeat(every: f64) -> Result<CallbackTask> {
    let task = new_task(
        callable(|args| {
            if let Some(me) = args.last().and_then(Value::as_task) {
                tracing::info!("{} beat at {:.2}s", me, me.start_time());
            }
            Ok(Value::Int(2))
        }),
        "heartbeat",
    )?;
    task.set_args(Value::None, true)?;
    task.set_attr("delayTime", Value::Float(every))?;
    task.set_priority(10);
    Ok(task)
}

fn delayed(after: f64) -> Result<CallbackTask> {
    let task = new_task(callable(|_| Ok(Value::None)), "delayed")?;
    task.set_delay(after);
    task.set_task_chain("background")?;
    task.set_upon_death(callable(|args| {
        if let Some(me) = args.first().and_then(Value::as_task) {
            tracing::info!("{} finished after {} run(s)", me, me.run_count());
        }
        Ok(Value::None)
    }))?;
    Ok(task)
}

fn failing() -> Result<CallbackTask> {
    let task = new_task(
        callable(|_| Err(CallError::new("simulated failure"))),
        "failing",
    )?;
    task.set_task_chain("background")?;
    Ok(task)
}

fn simulate(config: ManagerConfig, frames: u32, dt: f64) -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let manager = TaskManager::with_clock(config, clock.clone());

    for task in [countdown(5)?, heartbeat(0.5)?, delayed(1.0)?, failing()?] {
        manager.add(task.task())?;
    }

    for frame in 0..frames {
        let stats = manager.poll();
        tracing::debug!(
            "frame {} at {:.2}s: ran {}, finished {}, deferred {}",
            frame,
            manager.now(),
            stats.executed,
            stats.finished,
            stats.deferred
        );
        clock.advance(dt);
    }

    println!("{}", manager.snapshot().export_json_pretty());
    manager.remove_all();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Simulate {
            frames,
            dt,
            config,
            parallel,
        } => {
            if !(dt > 0.0) {
                anyhow::bail!("--dt must be positive, got {}", dt);
            }
            let mut config = load_config(config.as_deref())?;
            if parallel {
                config = config.parallel(true);
            }
            simulate(config, frames, dt)?;
        }
        Commands::ShowConfig { config } => {
            let config = load_config(config.as_deref())?;
            println!("{:#?}", config);
        }
    }

    Ok(())
}
