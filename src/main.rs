//! StepRunner CLI Entry Point
//!
//! Provides command-line interface for running the built-in flows.
//!
//! # Usage
//!
//! ```bash
//! # Run the flow named in the config file
//! steprunner run.yaml
//!
//! # Pick a flow and override the timeout
//! steprunner run.yaml --flow handoff --timeout 10
//!
//! # Print the step graph without running it
//! steprunner run.yaml --describe
//!
//! # Keep the final shared state for inspection
//! steprunner run.yaml --dump-state /tmp/state.json
//! ```

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{debug, error, info, warn};

use steprunner::environment::{
    HumanInput, ScriptedCompletion, ScriptedHuman, Services, StdinHuman,
};
use steprunner::execution::{Engine, RunOutcome};
use steprunner::flows::{self, FLOW_NAMES};
use steprunner::monitoring::{LifecycleKind, RunStatus};
use steprunner::workflow::parser::load_run_config;
use steprunner::workflow::{Payload, RunConfig};
use steprunner::{APP_NAME, VERSION};

/// Default run config file used when none is specified.
const DEFAULT_CONFIG: &str = "run.yaml";

/// Flow used when neither the command line nor the config names one.
const DEFAULT_FLOW: &str = "reflection";

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    config_path: String,
    flow: Option<String>,
    timeout: Option<Duration>,
    dump_state: Option<String>,
    describe: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: DEFAULT_CONFIG.to_string(),
            flow: None,
            timeout: None,
            dump_state: None,
            describe: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Event-Driven Step Scheduler");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: steprunner [OPTIONS] <CONFIG_FILE>");
    println!();
    println!("Arguments:");
    println!("  <CONFIG_FILE>       Path to run config YAML file");
    println!();
    println!("Options:");
    println!("  --flow NAME         Flow to run ({})", FLOW_NAMES.join(", "));
    println!("  --timeout SECS      Run timeout in seconds");
    println!("  --dump-state PATH   Write final shared state as JSON");
    println!("  --describe          Print the step graph and exit");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  steprunner run.yaml");
    println!("  steprunner run.yaml --flow story");
    println!("  steprunner run.yaml --timeout 5 --dump-state state.json");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--describe" => {
                config.describe = true;
            }
            "--flow" => {
                i += 1;
                if i >= args.len() {
                    return Err("--flow requires a name argument".to_string());
                }
                config.flow = Some(args[i].clone());
            }
            "--timeout" => {
                i += 1;
                if i >= args.len() {
                    return Err("--timeout requires a number argument".to_string());
                }
                config.timeout = Some(parse_timeout(&args[i])?);
            }
            "--dump-state" => {
                i += 1;
                if i >= args.len() {
                    return Err("--dump-state requires a path argument".to_string());
                }
                config.dump_state = Some(args[i].clone());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // Positional argument
                match positional_index {
                    0 => config.config_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Parses a positive, representable number of seconds.
fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("Invalid timeout value: {}", value))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("Timeout must be positive: {}", value));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| format!("Timeout is out of range: {}", value))
}

/// Builds the collaborators steps call, from the canned data in the config.
fn build_services(run_config: &RunConfig) -> Services {
    let mut services = Services::new();

    if run_config.responses.is_empty() {
        warn!("No completion responses configured; steps that call the model will fail");
    } else {
        info!("Using {} scripted completions", run_config.responses.len());
        services = services.with_completion(ScriptedCompletion::new(run_config.responses.clone()));
    }

    let human: Arc<dyn HumanInput> = if run_config.human_replies.is_empty() {
        Arc::new(StdinHuman::new())
    } else {
        info!("Using {} scripted human replies", run_config.human_replies.len());
        Arc::new(ScriptedHuman::new(run_config.human_replies.clone()))
    };

    services.with_shared_human(human)
}

/// Prints the run result, iteration count and timeline.
fn print_outcome(outcome: &RunOutcome) {
    println!();

    let label = match outcome.status() {
        RunStatus::Stopped => "STOPPED".green().bold(),
        RunStatus::Failed => "FAILED".red().bold(),
        RunStatus::TimedOut => "TIMED OUT".yellow().bold(),
        RunStatus::Cancelled => "CANCELLED".yellow().bold(),
    };
    println!("Run {}: {}", outcome.run_id, label);

    match &outcome.result {
        Ok(value) => {
            let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            println!("Result:");
            println!("{}", rendered);
        }
        Err(e) => println!("Reason: {}", e),
    }

    println!("Step invocations: {}", outcome.iterations);
    println!("{}", outcome.timeline.gantt_chart());
}

/// Main application entry point.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    print_banner();

    // Load run config
    info!("Loading run config: {}", config.config_path);
    let mut run_config = load_run_config(&config.config_path).map_err(|e| {
        error!("Failed to load run config: {}", e);
        format!(
            "Could not load run config from '{}': {}",
            config.config_path, e
        )
    })?;

    if let Some(timeout) = config.timeout {
        run_config = run_config.with_timeout(timeout);
    }

    let flow = config
        .flow
        .clone()
        .or_else(|| run_config.flow.clone())
        .unwrap_or_else(|| DEFAULT_FLOW.to_string());

    let workflow = flows::build(&flow, &run_config)?;
    info!("Workflow '{}' loaded: {} steps", workflow.name(), workflow.len());

    if config.describe {
        println!("{}", workflow.describe());
        return Ok(true);
    }

    // Create and configure engine
    let services = build_services(&run_config);
    let mut engine = Engine::new(workflow);
    engine.set_config(run_config);
    engine.set_services(services);

    let mut events = engine.stream_events();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event.kind {
                LifecycleKind::StepStarted { step, event_kind } => {
                    debug!("[{}] {} <- {}", event.at.format("%H:%M:%S%.3f"), step, event_kind)
                }
                other => debug!("[{}] {:?}", event.at.format("%H:%M:%S%.3f"), other),
            }
        }
    });

    // Execute workflow
    let handle = engine.start(Payload::new());
    let canceller = handle.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted - cancelling run");
            canceller.cancel();
        }
    });

    let outcome = handle.outcome().await;
    print_outcome(&outcome);

    if let Some(path) = config.dump_state {
        outcome.state.save(&path)?;
        info!("Shared state written to {}", path);
    }

    Ok(outcome.status() == RunStatus::Stopped)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
