//! `simbridge` – headless simulator-to-bus bridge node.
//!
//! The binary:
//!
//! 1. Loads `simbridge.toml` (robot descriptor, world, scheduler and plugin
//!    settings), applying `SIMBRIDGE_*` overrides.
//! 2. Builds the in-process simulation engine from the `[world]` table.
//! 3. Registers the built-in plugins and, when a manifest is configured, the
//!    dynamic plugin loader.
//! 4. Resolves the robot descriptor, reports skipped devices, and runs the
//!    step scheduler until the step limit, the end of the simulation, or
//!    Ctrl-C.
//! 5. Prints a per-device summary and every diagnostic raised.

mod config;
mod telemetry;
mod world;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use colored::Colorize;
use tracing::{info, warn};

use simbridge_driver::{
    InstanceStatus, ManifestLoader, PluginRegistry, Resolution, SchedulerState, StepScheduler,
    register_builtins,
};
use simbridge_hal::SimulationEngine;
use simbridge_middleware::EventBus;
use simbridge_types::{BridgeError, Diagnostic, ErrorKind};

use crate::config::Config;

#[derive(Debug, Parser, Clone)]
#[command(name = "simbridge")]
#[command(about = "Publish simulated robot devices on a message bus, step by step")]
struct Cli {
    /// Path to the node configuration file.
    #[arg(long, default_value = "simbridge.toml")]
    config: PathBuf,

    /// Stop after this many steps (overrides `max_steps`; 0 = no limit).
    #[arg(long)]
    max_steps: Option<u64>,

    /// Sleep between steps so simulated time follows wall-clock time.
    #[arg(long)]
    realtime: bool,

    /// Print the registered device-type tags and exit.
    #[arg(long)]
    list_plugins: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG selects the filter; SIMBRIDGE_LOG_FORMAT=json switches to
    // newline-delimited JSON.  User-facing output still uses println!.
    let _tracing = telemetry::init_tracing("simbridge");

    print_banner();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    // ── Configuration ─────────────────────────────────────────────────────
    let mut cfg = match config::load_from(&cli.config)? {
        Some(cfg) => {
            println!("  Config loaded from {}", cli.config.display().to_string().bold());
            cfg
        }
        None => {
            println!(
                "  {} {} not found; using defaults.",
                "!".yellow().bold(),
                cli.config.display()
            );
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    if let Some(max) = cli.max_steps {
        cfg.max_steps = max;
    }
    cfg.realtime |= cli.realtime;
    cfg.validate()?;

    // ── Plugin registry ───────────────────────────────────────────────────
    let mut registry = build_registry(&cfg)?;
    if cli.list_plugins {
        for tag in registry.type_tags() {
            println!("    • {}", tag.bold());
        }
        return Ok(());
    }

    // ── Engine and session ────────────────────────────────────────────────
    let engine = world::build_engine(cfg.time_step(), &cfg.world.devices)?;
    let bus = EventBus::default();
    let mut scheduler = StepScheduler::new(engine, Arc::new(bus.clone()), cfg.scheduler);

    let robot = if cfg.robot.name.is_empty() { "robot" } else { cfg.robot.name.as_str() };
    info!(robot, devices = cfg.robot.devices.len(), "resolving descriptor");
    let resolution = scheduler.resolve(&mut registry, &cfg.robot.devices);
    print_resolution(robot, &resolution);

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let stop = scheduler.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping after the current step …".yellow().bold());
        stop.request_stop();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will end the process without device shutdown");
    }

    scheduler.start(resolution).map_err(|e| e.to_string())?;
    let topics = bus.published_topics();

    // ── Run loop ──────────────────────────────────────────────────────────
    let started = Instant::now();
    let outcome = if cfg.realtime {
        run_realtime(&mut scheduler, cfg.step_limit(), cfg.time_step())
    } else {
        scheduler.run(cfg.step_limit())
    };
    scheduler.stop();

    match &outcome {
        Ok(ticks) => println!(
            "\n  {} {} step(s) in {:.2?}",
            "✓".green().bold(),
            ticks,
            started.elapsed()
        ),
        Err(BridgeError::SimulationEnded(reason)) => println!(
            "\n  {} simulation ended at step {} ({})",
            "■".yellow().bold(),
            scheduler.step_index(),
            reason
        ),
        Err(e) => println!("\n  {} session aborted: {}", "✗".red().bold(), e),
    }

    print_summary(&scheduler, &topics);
    session_result(outcome)
}

/// A session ends cleanly on the step limit, Ctrl-C, or the simulation
/// reaching its end; any other engine error fails the run.
fn session_result(outcome: Result<u64, BridgeError>) -> Result<(), String> {
    match outcome {
        Ok(_) | Err(BridgeError::SimulationEnded(_)) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// Built-in plugins, plus the manifest loader when `[plugins].manifest` is set.
fn build_registry(cfg: &Config) -> Result<PluginRegistry, String> {
    let mut registry = match &cfg.plugins.manifest {
        Some(path) => {
            let loader = ManifestLoader::from_file(path, cfg.plugins.search_dirs.clone())
                .map_err(|e| e.to_string())?;
            info!(manifest = %path.display(), entries = loader.manifest().plugins.len(), "plugin manifest loaded");
            PluginRegistry::new().with_loader(Box::new(loader))
        }
        None => PluginRegistry::new(),
    };
    register_builtins(&mut registry).map_err(|e| format!("plugin registration failed: {e}"))?;
    Ok(registry)
}

/// Step the session in real time: each tick is followed by a sleep for the
/// remainder of the basic time step.
fn run_realtime<E: SimulationEngine>(
    scheduler: &mut StepScheduler<E>,
    max_ticks: Option<u64>,
    time_step: Duration,
) -> Result<u64, BridgeError> {
    let mut ticks = 0u64;
    while scheduler.state() == SchedulerState::Running && max_ticks.is_none_or(|max| ticks < max) {
        let tick_started = Instant::now();
        let report = scheduler.tick()?;
        if report.stopped {
            break;
        }
        ticks += 1;
        if let Some(rest) = time_step.checked_sub(tick_started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    Ok(ticks)
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}",
        "simbridge".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Simulated devices → message bus");
    println!();
}

fn print_resolution(robot: &str, resolution: &Resolution) {
    println!(
        "\n  {} {} device(s) resolved for {}",
        "✓".green().bold(),
        resolution.instances.len(),
        robot.bold()
    );
    for instance in &resolution.instances {
        println!(
            "    • {} {} every {} step(s)",
            instance.name().bold(),
            format!("({})", instance.type_tag()).dimmed(),
            instance.period_steps()
        );
    }
    for diagnostic in &resolution.diagnostics {
        print_diagnostic(diagnostic);
    }
}

fn print_summary<E: SimulationEngine>(scheduler: &StepScheduler<E>, topics: &[String]) {
    println!("\n  Devices:");
    for summary in scheduler.summaries() {
        let status = match summary.status {
            InstanceStatus::Active => "active".green(),
            InstanceStatus::Suspended => "suspended".red(),
        };
        println!(
            "    • {:<20} {:<12} {:<8} {:>6} step(s) {:>4} failure(s)  {}",
            summary.name,
            summary.type_tag,
            format!("{:?}", summary.origin).to_lowercase(),
            summary.invocations,
            summary.failures,
            status
        );
    }
    println!("  Topics: {}", topics.join(", ").dimmed());

    let diagnostics = scheduler.diagnostics();
    if !diagnostics.is_empty() {
        println!("\n  Diagnostics ({}):", diagnostics.len());
        for diagnostic in diagnostics {
            print_diagnostic(diagnostic);
        }
    }
}

fn print_diagnostic(diagnostic: &Diagnostic) {
    let marker = match diagnostic.kind {
        ErrorKind::StepError | ErrorKind::ShutdownError => "!".yellow().bold(),
        _ => "✗".red().bold(),
    };
    println!("    {} {}", marker, diagnostic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use simbridge_driver::FactoryOrigin;
    use simbridge_hal::SimEngine;
    use simbridge_types::DeviceDeclaration;

    use crate::world::WorldDevice;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["simbridge"]);
        assert_eq!(cli.config, PathBuf::from("simbridge.toml"));
        assert_eq!(cli.max_steps, None);
        assert!(!cli.realtime);
        assert!(!cli.list_plugins);
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from(["simbridge", "--config", "robot.toml", "--max-steps", "50", "--realtime"]);
        assert_eq!(cli.config, PathBuf::from("robot.toml"));
        assert_eq!(cli.max_steps, Some(50));
        assert!(cli.realtime);
    }

    #[test]
    fn only_a_simulation_end_counts_as_clean() {
        assert!(session_result(Ok(12)).is_ok());
        assert!(session_result(Err(BridgeError::SimulationEnded("after 4 steps".into()))).is_ok());

        let err = session_result(Err(BridgeError::Engine("simulator crashed".into()))).unwrap_err();
        assert!(err.contains("simulator crashed"));
        assert!(session_result(Err(BridgeError::InvalidState("idle".into()))).is_err());
    }

    #[test]
    fn engine_end_after_run_is_clean() {
        let engine = SimEngine::builder().with_range("ps0", 0.1).end_after(2).build();
        let mut registry = build_registry(&Config::default()).unwrap();
        let mut scheduler =
            StepScheduler::new(engine, Arc::new(EventBus::default()), Config::default().scheduler);
        let resolution = scheduler.resolve(&mut registry, &[DeviceDeclaration::new("range", "ps0")]);
        scheduler.start(resolution).unwrap();

        let outcome = scheduler.run(None);
        assert!(matches!(outcome, Err(BridgeError::SimulationEnded(_))));
        assert_eq!(scheduler.step_index(), 2);
        assert!(session_result(outcome).is_ok());
    }

    #[test]
    fn registry_without_manifest_holds_builtins() {
        let mut registry = build_registry(&Config::default()).unwrap();
        assert_eq!(registry.type_tags(), vec!["diff_drive", "image", "imu", "led", "range"]);
        assert_eq!(registry.origin("range"), Some(FactoryOrigin::Static));
        assert!(registry.get("lidar").is_none());
    }

    #[test]
    fn registry_with_missing_manifest_fails() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut cfg = Config::default();
        cfg.plugins.manifest = Some(dir.path().join("absent.toml"));
        assert!(build_registry(&cfg).is_err());
    }

    #[test]
    fn realtime_run_honours_step_limit() {
        let mut cfg = Config::default();
        cfg.world.devices = vec![WorldDevice {
            device_type: "range".to_string(),
            name: "ps0".to_string(),
            value: Some(0.1),
            width: None,
            height: None,
            fault: None,
        }];
        cfg.robot.devices = vec![DeviceDeclaration::new("range", "ps0")];

        let engine: SimEngine =
            world::build_engine(Duration::from_millis(1), &cfg.world.devices).unwrap();
        let bus = EventBus::default();
        let mut registry = build_registry(&cfg).unwrap();
        let mut scheduler = StepScheduler::new(engine, Arc::new(bus.clone()), cfg.scheduler);
        let resolution = scheduler.resolve(&mut registry, &cfg.robot.devices);
        scheduler.start(resolution).unwrap();

        let mut tap = bus.subscribe_all();
        let ticks = run_realtime(&mut scheduler, Some(3), Duration::from_millis(1)).unwrap();
        assert_eq!(ticks, 3);
        assert_eq!(scheduler.step_index(), 3);
        assert_eq!(tap.drain().len(), 3);
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }
}
