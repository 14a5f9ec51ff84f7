//! Intermittent inference engine - Command Line Interface
//!
//! Runs a quantized CNN over a file-backed NVM arena so that inference
//! survives power failures at any write. The reference platform simulates
//! those failures with `--power-cut-after`.
//!
//! ## Commands
//!
//! - `init` - Create the NVM file and install the model image
//! - `run` - Boot (first run or resume) and run samples
//! - `status` - Show the committed run state, slot metadata and counters
//! - `reset` - Make the next boot start from scratch
//!
//! Exit codes: 0 on normal termination (a simulated power cut included),
//! 1 when storage cannot be brought up, 2 on any other fatal error.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intermittent_engine::checkpoint::{inspect, BootKind, BootOptions, Controller};
use intermittent_engine::model::image;
use intermittent_engine::storage::self_test;
use intermittent_engine::{
    init_production_logging, init_simple_logging, EngineConfig, EngineError, FileStorage,
    LogSink, ModelGraph, ModelSpec, PowerCut, RecordingSink, RecoveryMode,
};
use intermittent_engine::observability::Tee;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// Power-failure resilient CNN inference over NVM
#[derive(Parser, Debug)]
#[command(name = "intermittent")]
#[command(about = "Intermittent-power CNN inference engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.intermittent/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// NVM backing file, overrides the configuration
    #[arg(long, global = true)]
    nvm: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or erase the NVM file and install the model image
    Init {
        /// Model description (JSON); the built-in demo model when omitted
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Recovery mode the image is built for
        #[arg(short, long)]
        recovery: Option<RecoveryMode>,

        /// Number of intermediate slots
        #[arg(long)]
        slots: Option<u8>,
    },

    /// Boot and run samples, resuming an interrupted run
    Run {
        /// Samples to run; 0 runs one pass over the test set
        #[arg(default_value_t = 0)]
        samples: usize,

        /// Model description (JSON); the built-in demo model when omitted
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Recovery mode; must match the installed image
        #[arg(short, long)]
        recovery: Option<RecoveryMode>,

        /// Number of intermediate slots; must match the installed image
        #[arg(long)]
        slots: Option<u8>,

        /// Simulate a power failure after this many NVM writes
        #[arg(long)]
        power_cut_after: Option<u64>,
    },

    /// Show the committed run state, slot metadata and counters
    Status {
        /// Model description (JSON); the built-in demo model when omitted
        #[arg(short, long)]
        model: Option<PathBuf>,
    },

    /// Make the next boot start from scratch
    Reset {
        /// Model description (JSON); the built-in demo model when omitted
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
}

/// Storage could not be opened or failed its self-test.
#[derive(Debug, thiserror::Error)]
#[error("storage initialization failed: {0}")]
struct StorageInitError(#[source] EngineError);

fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = if e.downcast_ref::<StorageInitError>().is_some() {
                1
            } else {
                2
            };
            error!(error = %e, code, "Fatal error");
            eprintln!("\n✗ {:#}", e);
            ExitCode::from(code)
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Init {
            model,
            recovery,
            slots,
        } => {
            apply_overrides(&mut config, recovery, slots)?;
            init_logging(&config)?;
            cmd_init(&config, model)
        }

        Commands::Run {
            samples,
            model,
            recovery,
            slots,
            power_cut_after,
        } => {
            apply_overrides(&mut config, recovery, slots)?;
            init_logging(&config)?;
            cmd_run(&config, model, samples, power_cut_after)
        }

        // No logging for status (pure display)
        Commands::Status { model } => cmd_status(&config, model),

        Commands::Reset { model } => {
            init_simple_logging(&config.logging.level)?;
            cmd_reset(&config, model)
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => EngineConfig::default_path()?,
    };
    let mut config = EngineConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if let Some(nvm) = &cli.nvm {
        config.storage.nvm_path = nvm.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

fn apply_overrides(
    config: &mut EngineConfig,
    recovery: Option<RecoveryMode>,
    slots: Option<u8>,
) -> Result<()> {
    if let Some(mode) = recovery {
        config.recovery.mode = mode;
    }
    if let Some(slots) = slots {
        config.runtime.num_slots = slots;
    }
    config.validate()?;
    Ok(())
}

fn init_logging(config: &EngineConfig) -> Result<()> {
    match &config.logging.dir {
        Some(_) => init_production_logging(config),
        None => init_simple_logging(&config.logging.level),
    }
}

fn load_graph(config: &EngineConfig, model: Option<PathBuf>) -> Result<ModelGraph> {
    let spec = match model {
        Some(path) => ModelSpec::load(&path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?,
        None => ModelSpec::demo(),
    };
    Ok(ModelGraph::load(&spec, &config.graph_options())?)
}

fn open_storage(config: &EngineConfig) -> Result<FileStorage> {
    let storage = FileStorage::open(
        &config.storage.nvm_path,
        config.storage.nvm_size,
        config.storage.max_transfer,
    )
    .map_err(StorageInitError)?;
    Ok(storage)
}

/// Create the NVM file and install the model image
fn cmd_init(config: &EngineConfig, model: Option<PathBuf>) -> Result<()> {
    println!("🔧 Installing model image...\n");

    let graph = load_graph(config, model)?;
    let mut storage = FileStorage::init(
        &config.storage.nvm_path,
        config.storage.nvm_size,
        config.storage.max_transfer,
    )
    .map_err(StorageInitError)?;
    self_test(&mut storage, config.storage.self_test_retries).map_err(StorageInitError)?;

    let layout = graph.layout(config.storage.nvm_size)?;
    image::install(&mut storage, &graph, &layout, config.recovery.mode)?;
    storage.sync()?;

    println!("✅ Model '{}' installed", graph.name);
    println!("   NVM file: {}", storage.path().display());
    println!("   Recovery mode: {}", config.recovery.mode);
    println!("   Operations: {}", graph.nodes_len());
    println!("   Samples: {}", graph.n_samples());
    println!(
        "   Slots: {} x {} bytes",
        layout.num_slots, layout.slot_size
    );
    println!(
        "   Free NVM: {} bytes",
        layout.control_start.saturating_sub(layout.bulk_end)
    );
    println!("\nRun 'intermittent run' to start inference.");
    Ok(())
}

/// Boot and run samples
fn cmd_run(
    config: &EngineConfig,
    model: Option<PathBuf>,
    samples: usize,
    power_cut_after: Option<u64>,
) -> Result<()> {
    let graph = load_graph(config, model)?;
    let count = if samples == 0 {
        graph.n_samples() as usize
    } else {
        samples
    };

    let mut storage = PowerCut::new(open_storage(config)?);
    if let Some(writes) = power_cut_after {
        info!(writes, "Simulated power failure armed");
        storage.arm(writes);
    }

    let (mut controller, kind) = match Controller::boot(storage, graph, BootOptions::from(config)) {
        Ok(booted) => booted,
        Err(e) if e.is_power_loss() => {
            power_lost(&e, 0);
            return Ok(());
        }
        Err(e @ EngineError::SelfTest { .. }) => return Err(StorageInitError(e).into()),
        Err(e) => return Err(e.into()),
    };

    match &kind {
        BootKind::FirstRun => println!("🔋 First run, starting from sample 0"),
        BootKind::Resumed {
            layer_idx,
            sample_idx,
            interrupted,
            reconciled,
        } => {
            println!(
                "🔋 Resuming sample {} at layer {}{}",
                sample_idx,
                layer_idx,
                if *interrupted { " (after power failure)" } else { "" }
            );
            if !reconciled.is_empty() {
                println!("   Recomputing slots {:?}", reconciled);
            }
        }
    }

    let mut log_sink = LogSink;
    let mut recording = RecordingSink::new();
    let outcome = controller.run_samples(count, &mut Tee(&mut log_sink, &mut recording));

    for report in &recording.reports {
        let verdict = match report.is_correct() {
            Some(true) => "✓",
            Some(false) => "✗",
            None => "-",
        };
        println!(
            "   {} sample {:>4}  predicted {}  label {}{}",
            verdict,
            report.sample_idx,
            report.predicted,
            report
                .label
                .map_or_else(|| "-".to_string(), |l| l.to_string()),
            if report.recovered { "  (recovered)" } else { "" }
        );
    }

    match outcome {
        Ok(_) => {}
        Err(e) if e.is_power_loss() => {
            power_lost(&e, recording.reports.len());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let counters = *controller.counters();
    let mut storage = controller.into_storage().into_inner();
    if let Err(e) = storage.sync() {
        warn!(error = %e, "Failed to sync NVM file");
    }

    let (correct, labelled) = recording.accuracy();
    println!();
    if labelled > 0 {
        println!(
            "📊 Accuracy: {}/{} ({:.1}%)",
            correct,
            labelled,
            correct as f64 * 100.0 / labelled as f64
        );
    }
    println!(
        "   Power cycles: {}  Samples completed: {}  Fallbacks: {}",
        counters.power_cycles, counters.samples_completed, counters.fallbacks
    );
    Ok(())
}

fn power_lost(e: &EngineError, finished: usize) {
    warn!(error = %e, finished, "Simulated power failure");
    println!(
        "\n⚡ Power lost after {} finished sample(s); run again to resume",
        finished
    );
}

/// Show the committed run state, slot metadata and counters
fn cmd_status(config: &EngineConfig, model: Option<PathBuf>) -> Result<()> {
    println!("📊 Intermittent Engine Status\n");

    let graph = load_graph(config, model)?;
    let mut storage = open_storage(config)?;
    let snapshot = inspect(&mut storage, &graph)?;

    match &snapshot.header {
        Some(header) => {
            println!("✅ Image installed");
            println!(
                "   Recovery mode: {}",
                RecoveryMode::from_tag(header.recovery_mode)
                    .map_or_else(|| format!("unknown ({})", header.recovery_mode), |m| m.to_string())
            );
            println!("   Operations: {}", header.nodes_len);
            println!("   Samples: {}", header.n_samples);
            println!("   Slots: {}", header.num_slots);
        }
        None => {
            println!("⚠️  No model image installed");
            println!("\nRun 'intermittent init' to install one.");
            return Ok(());
        }
    }

    if snapshot.first_run_pending {
        println!("\n🔄 First run pending");
    }

    match &snapshot.state {
        Some(state) => {
            let rs = &state.run_state;
            println!("\n📍 Run state (commit #{})", snapshot.sequence);
            println!("   Sample: {}", rs.sample_idx);
            println!("   Next layer: {} of {}", rs.layer_idx, rs.nodes_len);
            match rs.last_committed_layer() {
                Some(layer) => println!("   Last committed layer: {}", layer),
                None => println!("   Last committed layer: none"),
            }
            println!("   Running: {}  Recovery: {}", rs.running, rs.recovery);
            println!("   Run counter: {}", rs.run_counter);

            println!("\n   Slots:");
            for (s, info) in state.slots.iter().enumerate() {
                println!(
                    "     [{}] state_bit={} turning_points={:?} epoch={}{}",
                    s,
                    info.state_bit as u8,
                    info.turning_points.as_slice(),
                    info.footprint_epoch,
                    if info.untrusted { " untrusted" } else { "" }
                );
            }
        }
        None => println!("\n⚠️  No valid commit record"),
    }

    let c = &snapshot.counters;
    println!("\n📈 Counters");
    println!("   Power cycles: {}", c.power_cycles);
    println!("   Samples completed: {}", c.samples_completed);
    println!("   Elements computed: {}", c.elements_computed);
    println!("   Elements skipped: {}", c.elements_skipped);
    println!("   Fallbacks: {}", c.fallbacks);
    Ok(())
}

/// Make the next boot start from scratch
fn cmd_reset(config: &EngineConfig, model: Option<PathBuf>) -> Result<()> {
    let graph = load_graph(config, model)?;
    let mut storage = open_storage(config)?;
    let layout = graph.layout(config.storage.nvm_size)?;
    image::request_first_run(&mut storage, &layout)?;
    storage.sync()?;

    info!(path = %storage.path().display(), "First run requested");
    println!("✅ Next boot starts from scratch");
    Ok(())
}
