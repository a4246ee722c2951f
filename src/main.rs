//! swpll - software PLL clock recovery CLI

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use swpll::audio::EngineEvent;
use swpll::clock::Fraction;
use swpll::config::{Args, ClockConfig, Command, PpmStep, DEFAULT_STEPS};
use swpll::sim::SimulatedSystem;
use swpll::sync::TimestampSampler;
use swpll::VERSION;

fn main() -> Result<()> {
    let args = Args::parse();

    // Configuration first: it may carry the log level
    let (config, source) = load_config(&args)?;

    // Initialize logging
    init_logging(&args, &config)?;
    if let Some(path) = &source {
        debug!("Configuration loaded from {}", path.display());
    }

    // Execute command
    match args.command.unwrap_or_default() {
        Command::Simulate {
            iterations,
            initial_ppm,
            steps,
            steady,
            threaded,
        } => cmd_simulate(&config, iterations, initial_ppm, steps, steady, threaded),
        Command::Table { entries } => cmd_table(&config, entries),
        Command::Config { sample, write } => {
            cmd_config(&config, source.as_deref(), sample, write.as_deref())
        }
    }
}

fn load_config(args: &Args) -> Result<(ClockConfig, Option<PathBuf>)> {
    match &args.config {
        Some(path) => Ok((ClockConfig::load(path)?, Some(path.clone()))),
        None => Ok(ClockConfig::load_default()?),
    }
}

fn init_logging(args: &Args, config: &ClockConfig) -> Result<()> {
    let level = if args.has_level_flags() {
        args.log_level().to_string()
    } else {
        config.log_level.clone()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if let Some(log_file) = &args.log {
        let file = std::fs::File::create(log_file)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Run the control loop on simulated hardware
fn cmd_simulate(
    config: &ClockConfig,
    iterations: u64,
    initial_ppm: f64,
    steps: Vec<PpmStep>,
    steady: bool,
    threaded: bool,
) -> Result<()> {
    println!(
        "swpll {} - software PLL clock recovery (simulated hardware)\n",
        VERSION
    );

    let steps = if steady {
        Vec::new()
    } else if steps.is_empty() {
        DEFAULT_STEPS.to_vec()
    } else {
        steps
    };

    if threaded {
        let mut system = SimulatedSystem::threaded(config).context("invalid configuration")?;
        simulate(&mut system, config, iterations, initial_ppm, &steps)?;
        println!(
            "  Edges captured:  {}",
            system.engine.recovery().sampler().edges_captured()
        );
    } else {
        let mut system = SimulatedSystem::build(config).context("invalid configuration")?;
        simulate(&mut system, config, iterations, initial_ppm, &steps)?;
    }
    Ok(())
}

fn simulate<S: TimestampSampler>(
    system: &mut SimulatedSystem<S>,
    config: &ClockConfig,
    iterations: u64,
    initial_ppm: f64,
    steps: &[PpmStep],
) -> Result<()> {
    let (event_tx, event_rx) = bounded(64);
    system.engine.set_event_channel(event_tx);
    system.engine.interface_mut().set_reference_ppm(initial_ppm);

    if let Err(e) = system.engine.initialize() {
        error!("Failed to start engine: {}", e);
        return Err(e.into());
    }

    let (nominal, range) = {
        let state = system.engine.recovery().state();
        (state.nominal_index(), state.index_range())
    };
    let (lock_low, lock_high) = config.lock_range_ppm(&system.table)?;
    println!("Stream format:   {}", system.engine.format());
    println!(
        "Divider table:   {} entries, nominal {}, clamp {}..={} (+-{} ppm)",
        system.table.len(),
        nominal,
        range.start(),
        range.end(),
        config.ppm_range
    );
    println!(
        "Lockable range:  {:+.3} to {:+.3} ppm",
        lock_low, lock_high
    );
    println!(
        "Recovered clock: MCLK / {} = {:.3} Hz",
        system.output.divider(),
        system.recovered_clock_hz().unwrap_or(0.0)
    );
    println!("Reference:       {:+.3} ppm\n", initial_ppm);

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let realtime = iterations == 0;
    if realtime {
        let r = running.clone();
        let engine_state = system.engine.state_handle();
        ctrlc::set_handler(move || {
            println!(
                "\nReceived Ctrl+C (engine {:?}), stopping...",
                *engine_state.lock()
            );
            r.store(false, Ordering::SeqCst);
        })
        .context("failed to install Ctrl+C handler")?;
        println!("Running in real time. Press Ctrl+C to stop.\n");
    }
    let pace = system.engine.format().frame_period() * config.control_period;

    let mut iteration = 0u64;
    while running.load(Ordering::SeqCst) && (realtime || iteration < iterations) {
        for step in steps.iter().filter(|s| s.iteration == iteration) {
            system.engine.interface_mut().set_reference_ppm(step.ppm);
            println!("[{:>6}] reference {:+.3} ppm", iteration, step.ppm);
        }

        system.run_iterations(1)?;
        iteration += 1;

        for event in event_rx.try_iter() {
            if let EngineEvent::LockStatusChanged(status) = event {
                println!(
                    "[{:>6}] {:<13} index {} ({:+.3} ppm)",
                    iteration,
                    status.message(),
                    system.engine.recovery().state().current_index(),
                    system.master_offset_ppm()
                );
            }
        }

        if realtime {
            std::thread::sleep(pace.min(Duration::from_secs(1)));
        }
    }

    let recovery = system.engine.recovery();
    let stats = recovery.stats();
    let state = recovery.state();
    println!("\nSummary:");
    println!("  Iterations:      {}", stats.iterations);
    println!("  Lock status:     {}", state.lock_status());
    println!(
        "  Divider index:   {} ({:+.3} ppm from nominal)",
        state.current_index(),
        system.master_offset_ppm()
    );
    println!(
        "  Reference:       {:+.3} ppm",
        system.engine.interface().reference_ppm()
    );
    println!("  Missed samples:  {}", stats.missed_samples);
    println!("  Status changes:  {}", stats.status_changes);
    println!("  Divider writes:  {}", system.divider.writes());
    if let Some(hz) = system.recovered_clock_hz() {
        println!("  Recovered clock: {:.3} Hz", hz);
    }

    system.engine.stop();
    Ok(())
}

/// Show divider table statistics
fn cmd_table(config: &ClockConfig, entries: bool) -> Result<()> {
    let table = config.build_table().context("failed to build divider table")?;
    let nominal = config.nominal_index(&table)?;
    let range = table.bounded_range(nominal, f64::from(config.ppm_range))?;

    println!("{}", table.stats());
    println!();

    if let Some(entry) = table.get(nominal) {
        println!(
            "Nominal entry:     {} (0x{:08X}) {:.3} Hz",
            nominal, entry.register, entry.frequency_hz
        );
    }
    println!(
        "Clamp range:       {}..={} ({:+.3} to {:+.3} ppm, bound +-{} ppm)",
        range.start(),
        range.end(),
        table.ppm_offset(*range.start(), nominal)?,
        table.ppm_offset(*range.end(), nominal)?,
        config.ppm_range
    );
    let (lock_low, lock_high) = config.lock_range_ppm(&table)?;
    println!(
        "Lockable range:    {:+.3} to {:+.3} ppm from {} Hz",
        lock_low, lock_high, config.master_clock_hz
    );

    if entries {
        println!();
        println!("Index  Register    Fraction  Frequency (Hz)      Offset (ppm)");
        for index in range {
            let Some(entry) = table.get(index) else {
                continue;
            };
            let fraction = Fraction::from_register(entry.register)
                .map(|f| f.to_string())
                .unwrap_or_else(|_| "-".to_string());
            let marker = if index == nominal { "  <- nominal" } else { "" };
            println!(
                "{:>5}  0x{:08X}  {:>8}  {:>16.3}  {:>+12.3}{}",
                index,
                entry.register,
                fraction,
                entry.frequency_hz,
                table.ppm_offset(index, nominal)?,
                marker
            );
        }
    }

    Ok(())
}

/// Show, check or write the configuration
fn cmd_config(
    config: &ClockConfig,
    source: Option<&Path>,
    sample: bool,
    write: Option<&Path>,
) -> Result<()> {
    if sample {
        print!("{}", ClockConfig::sample_config());
        return Ok(());
    }

    match source {
        Some(path) => println!("# Loaded from {}", path.display()),
        None => println!("# Built-in defaults (no configuration file found)"),
    }
    config.validate().context("configuration is invalid")?;
    print!("{}", config.to_toml()?);

    if let Some(path) = write {
        config.save(path)?;
        println!("\nConfiguration written to {}", path.display());
    }

    Ok(())
}
