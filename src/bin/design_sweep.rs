use clap::Parser;
use rfsynth::config::sweep_config::SweepConfig;
use rfsynth::utils::logger::{self, LogFormat};
use rfsynth::utils::validation::Validate;
use rfsynth::{BatchSweep, LocalStorage};

#[derive(Parser)]
#[command(name = "design-sweep")]
#[command(about = "Run a batch of independent RF designs in parallel")]
struct Args {
    /// Path to sweep configuration file
    #[arg(short, long, default_value = "configs/sweep.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON log lines instead of the compact format
    #[arg(long)]
    json_logs: bool,

    /// Override monitoring setting from config
    #[arg(long)]
    monitor: Option<bool>,

    /// Override max_parallel from config
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Output directory override
    #[arg(short, long)]
    output: Option<String>,

    /// Run identifier, defaults to a timestamp
    #[arg(long)]
    execution_id: Option<String>,

    /// Show the plan without running anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    logger::init_logger(LogFormat::from_flag(args.json_logs), args.verbose);

    tracing::info!("🚀 Starting design sweep");
    tracing::info!("📁 Loading sweep configuration from: {}", args.config);

    let mut config = match SweepConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load sweep config file '{}': {}", args.config, e);
            eprintln!("💡 Make sure the file exists and is valid TOML format");
            std::process::exit(1);
        }
    };

    if let Some(monitor) = args.monitor {
        config.monitoring.enabled = monitor;
        tracing::info!("🔧 Monitoring overridden to: {}", monitor);
    }
    if let Some(max_parallel) = args.max_parallel {
        config.sweep.max_parallel = max_parallel;
        tracing::info!("🔧 max_parallel overridden to: {}", max_parallel);
    }
    if let Some(output) = &args.output {
        config.output.path = output.clone();
    }

    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(e.exit_code());
    }

    tracing::info!(
        "✅ Sweep '{}' with {} designs loaded",
        config.sweep.name,
        config.designs.len()
    );

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - No designs will be produced");
        for design in &config.designs {
            println!(
                "  • {} ({}): {:.2} Ω @ {:.4} GHz, solver: {}",
                design.design.name,
                design.design.structure,
                design.target.impedance_ohms,
                design.target.frequency_hz / 1e9,
                design
                    .solver
                    .as_ref()
                    .map(|s| format!("{:?}", s.backend).to_lowercase())
                    .unwrap_or_else(|| "none".to_string())
            );
        }
        return Ok(());
    }

    let run_id = args
        .execution_id
        .clone()
        .unwrap_or_else(|| chrono::Local::now().format("run_%Y%m%d_%H%M%S").to_string());
    let storage = LocalStorage::new(format!("{}/{}", config.output.path, config.sweep.name));
    let sweep = BatchSweep::new(config, storage.clone(), run_id);

    let cancel = sweep.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Interrupted, cancelling the sweep");
            cancel.cancel();
        }
    });

    let report = match sweep.execute().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("❌ Sweep failed: {}", e);
            eprintln!("❌ {}", e.user_friendly_message());
            std::process::exit(e.exit_code());
        }
    };

    println!(
        "📊 {}/{} designs succeeded, {} converged",
        report.summary.succeeded, report.summary.total_designs, report.summary.converged
    );
    for design in &report.summary.designs {
        match &design.error {
            None => println!("  ✅ {} ({} ms)", design.name, design.duration_ms),
            Some(error) => println!("  ❌ {}: {}", design.name, error),
        }
    }
    println!(
        "📁 Summary saved to: {}",
        storage.resolve(&report.summary_path).display()
    );

    if let Some(e) = report.first_error() {
        std::process::exit(e.exit_code());
    }
    Ok(())
}
