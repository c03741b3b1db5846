mod config;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use connection::{
    ConnectOutcome, HttpConnector, ReconnectCommand, ReconnectOutcome, ReconnectRoutine,
    RetryConfig, ScriptedConnector,
};
use events::{Event, EventBus};
use orchestrator::{
    ActivityGate, AsyncCommand, Command, CommandParameter, CommandSequence, Notifier,
    ObservableCommandQueue,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{config_path, CmdseqConfig, CMDSEQ_DIR, CONFIG_FILE};

const PRINTER_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "cmdseq")]
#[command(about = "Command sequencing with connection recovery", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .cmdseq/config.toml in the current directory
    Init,
    /// Poll the configured endpoint until it answers or the attempts run out
    Reconnect {
        /// Overrides connection.base_url from the config file
        #[arg(long)]
        base_url: Option<String>,

        #[command(flatten)]
        retry: RetryArgs,
    },
    /// Run the reboot pipeline against a scripted connection
    Simulate {
        /// Unreachable answers before the device comes back
        #[arg(long, default_value_t = 0)]
        failures: usize,

        /// Reject the credentials once the failures are used up
        #[arg(long)]
        unauthorized: bool,

        #[command(flatten)]
        retry: RetryArgs,
    },
}

#[derive(Args, Debug)]
struct RetryArgs {
    #[arg(long)]
    max_attempts: Option<u32>,

    #[arg(long)]
    retry_delay_ms: Option<u64>,
}

impl RetryArgs {
    fn apply(&self, mut config: RetryConfig) -> RetryConfig {
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(retry_delay_ms) = self.retry_delay_ms {
            config.retry_delay_ms = retry_delay_ms;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cwd = std::env::current_dir()?;
    match cli.command {
        Commands::Init => init_project(&cwd).await,
        Commands::Reconnect { base_url, retry } => reconnect(&cwd, base_url, &retry).await,
        Commands::Simulate {
            failures,
            unauthorized,
            retry,
        } => simulate(&cwd, failures, unauthorized, &retry).await,
    }
}

async fn init_project(root: &Path) -> Result<()> {
    if !CmdseqConfig::init(root).await? {
        println!(
            "Already initialized at {}",
            config_path(root).display()
        );
        return Ok(());
    }

    println!("Initialized cmdseq in {}", root.display());
    println!();
    println!("Created:");
    println!("  {}/", CMDSEQ_DIR);
    println!("  └── {}", CONFIG_FILE);
    println!();
    println!("Next steps:");
    println!("  1. Set connection.base_url (and token) in {}/{}", CMDSEQ_DIR, CONFIG_FILE);
    println!("  2. Run 'cmdseq reconnect'");

    Ok(())
}

async fn reconnect(root: &Path, base_url: Option<String>, args: &RetryArgs) -> Result<()> {
    let config = CmdseqConfig::load(root).await?;
    let retry = args.apply(config.retry);
    let base_url = base_url.unwrap_or(config.connection.base_url);

    let mut connector = HttpConnector::new(&base_url)?;
    if let Some(token) = config.connection.token {
        connector = connector.with_token(token);
    }

    let bus = EventBus::new();
    let printer = spawn_printer(&bus);
    let slot = ObservableCommandQueue::new();
    let gate = ActivityGate::new("transport");

    let routine = Arc::new(ReconnectRoutine::new(Arc::new(connector)).with_event_bus(bus.clone()));
    let reconnect = ReconnectCommand::builder(routine.clone())
        .config(retry.clone())
        .gated_by(gate.clone())
        .abort_on_failure(slot.clone())
        .build();

    let announce_url = base_url.clone();
    let max_attempts = retry.max_attempts;
    let report_routine = routine.clone();

    let pipeline = CommandSequence::named("reconnect", slot.clone());
    pipeline.attach_event_bus(bus.clone());
    pipeline.register_command(AsyncCommand::from_fn("announce", move |_| {
        tracing::info!(base_url = %announce_url, max_attempts, "Reconnecting");
    }))?;
    pipeline.register_command(reconnect.clone())?;
    pipeline.register_command(AsyncCommand::from_fn("report", move |_| {
        let state = report_routine.state();
        tracing::info!(
            status = state.status.as_str(),
            attempts = state.attempt,
            "Connection restored"
        );
    }))?;

    let outcome = drive(&pipeline, &reconnect, &slot, &gate).await?;
    drop((pipeline, reconnect, routine));
    finish_events(bus, outcome, printer).await;

    match outcome {
        ReconnectOutcome::Connected { attempts } => {
            println!("Connected to {} after {} attempt(s)", base_url, attempts);
            Ok(())
        }
        ReconnectOutcome::Rejected => bail!("{} rejected the credentials", base_url),
        ReconnectOutcome::GaveUp { attempts } => {
            bail!("{} unreachable after {} attempt(s)", base_url, attempts)
        }
    }
}

async fn simulate(root: &Path, failures: usize, unauthorized: bool, args: &RetryArgs) -> Result<()> {
    let config = CmdseqConfig::load(root).await?;
    let retry = args.apply(config.retry);

    let connector = if unauthorized {
        let mut script: Vec<ConnectOutcome> = (0..failures)
            .map(|n| ConnectOutcome::unreachable(format!("device booting ({})", n + 1)))
            .collect();
        script.push(ConnectOutcome::Unauthorized);
        ScriptedConnector::new(script)
    } else {
        ScriptedConnector::flaky(failures)
    };

    let bus = EventBus::new();
    let printer = spawn_printer(&bus);
    let slot = ObservableCommandQueue::new();
    let gate = ActivityGate::new("transport");

    let routine = Arc::new(ReconnectRoutine::new(Arc::new(connector)).with_event_bus(bus.clone()));
    let reconnect = ReconnectCommand::builder(routine)
        .config(retry)
        .gated_by(gate.clone())
        .abort_on_failure(slot.clone())
        .build();

    let pipeline = CommandSequence::named("reboot", slot.clone());
    pipeline.attach_event_bus(bus.clone());
    pipeline.register_command(device_step("stop-telemetry", 100, &gate))?;
    pipeline.register_command(device_step("reboot", 500, &gate))?;
    pipeline.register_command(reconnect.clone())?;
    pipeline.register_command(device_step("refresh-name", 50, &gate))?;
    pipeline.register_command(device_step("resume-telemetry", 100, &gate))?;

    let outcome = drive(&pipeline, &reconnect, &slot, &gate).await?;
    drop((pipeline, reconnect));
    finish_events(bus, outcome, printer).await;

    match outcome {
        ReconnectOutcome::Connected { attempts } => {
            println!("Pipeline finished, reconnected after {} attempt(s)", attempts);
            Ok(())
        }
        ReconnectOutcome::Rejected => bail!("Credentials rejected, pipeline abandoned"),
        ReconnectOutcome::GaveUp { attempts } => {
            bail!("Device unreachable after {} attempt(s), pipeline abandoned", attempts)
        }
    }
}

/// Run `pipeline` and wait until the reconnect step has an outcome and the
/// slot and transport are both idle again.
async fn drive(
    pipeline: &Arc<CommandSequence>,
    reconnect: &ReconnectCommand,
    slot: &ObservableCommandQueue,
    gate: &ActivityGate,
) -> Result<ReconnectOutcome> {
    if !pipeline.can_run(&CommandParameter::Null) {
        bail!("Pipeline '{}' is not ready to run", pipeline.name());
    }

    let wake = Arc::new(Notify::new());
    let watched: Vec<(&Notifier, _)> = [slot.changed(), gate.changed(), reconnect.readiness()]
        .into_iter()
        .map(|notifier| {
            let wake = wake.clone();
            (notifier, notifier.subscribe(move || wake.notify_one()))
        })
        .collect();

    pipeline.run(&CommandParameter::Null);

    let outcome = loop {
        if let Some(outcome) = reconnect.last_outcome() {
            if slot.is_empty() && gate.is_idle() {
                break outcome;
            }
        }
        wake.notified().await;
    };

    for (notifier, id) in watched {
        notifier.unsubscribe(id);
    }
    Ok(outcome)
}

/// Report an abandoned pipeline on the bus, then let the printer drain.
async fn finish_events(bus: EventBus, outcome: ReconnectOutcome, printer: JoinHandle<()>) {
    if !outcome.is_connected() {
        bus.emit(Event::Error {
            message: "Pipeline abandoned".to_string(),
            context: Some(format!("{:?}", outcome)),
        });
    }
    drop(bus);
    // A task that is still winding down may hold a bus clone.
    let _ = tokio::time::timeout(PRINTER_GRACE, printer).await;
}

/// A device operation that holds the transport for `millis`.
fn device_step(name: &'static str, millis: u64, gate: &ActivityGate) -> Arc<AsyncCommand> {
    AsyncCommand::builder(name, move |_| async move {
        tracing::info!(step = name, "Step started");
        tokio::time::sleep(Duration::from_millis(millis)).await;
        tracing::info!(step = name, "Step finished");
    })
    .gated_by(gate.clone())
    .build()
}

fn spawn_printer(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => println!(
                    "{}  {}",
                    envelope.timestamp.format("%H:%M:%S%.3f"),
                    describe(&envelope.event)
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn describe(event: &Event) -> String {
    match event {
        Event::SequenceStarted { sequence, steps } => {
            format!("[{}] started with {} step(s)", sequence, steps)
        }
        Event::SequenceBlocked { sequence, command } => {
            format!("[{}] waiting on {}", sequence, command)
        }
        Event::SequenceDrained { sequence } => format!("[{}] drained", sequence),
        Event::ConnectionStatusChanged {
            attempt,
            max_attempts,
            status,
        } => format!(
            "connection {} (attempt {}/{})",
            status.as_str(),
            attempt,
            max_attempts
        ),
        Event::ConnectionPhaseChanged { attempt, phase } => {
            format!("recovery {} (attempt {})", phase.as_str(), attempt)
        }
        Event::Error { message, context } => match context {
            Some(context) => format!("error: {} ({})", message, context),
            None => format!("error: {}", message),
        },
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cmdseq=info,orchestrator=info,connection=info".into()),
        )
        .init();
}
