use clap::Parser;
use rfsynth::core::context::{cancellation, ExecutionContext};
use rfsynth::utils::{logger, validation::Validate};
use rfsynth::{CliConfig, LocalStorage, RfError};

fn fail(e: &RfError) -> ! {
    tracing::error!(
        "❌ Design failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    if let Some(diagnostics) = e.diagnostics().filter(|d| !d.is_empty()) {
        tracing::error!("🧾 Solver diagnostics:\n{}", diagnostics);
    }
    if let Some(best) = e.best_iteration() {
        tracing::error!(
            "🏁 Best iteration {}: measured {:.4} (error {:.4})",
            best.iteration,
            best.measured,
            best.error
        );
    }
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 {}", e.recovery_suggestion());
    std::process::exit(e.exit_code());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliConfig::parse();

    logger::init_cli_logger(cli.verbose);

    tracing::info!("Starting rfsynth");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    let config = match cli.to_design_config() {
        Ok(config) => config,
        Err(e) => fail(&e),
    };
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        fail(&e);
    }

    if config.monitoring.enabled {
        tracing::info!("🔍 System monitoring enabled");
    }

    let run_id = chrono::Local::now().format("run_%Y%m%d_%H%M%S").to_string();
    let storage = LocalStorage::new(config.output.path.clone());
    let engine = match config.build_engine(storage) {
        Ok(engine) => engine,
        Err(e) => fail(&e),
    };
    let ctx = match ExecutionContext::init(run_id.clone(), None) {
        Ok(ctx) => ctx,
        Err(e) => fail(&e),
    };

    let (cancel, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Interrupted, stopping the solver");
            cancel.cancel();
        }
    });

    let result = engine.run(&config.to_request(), &ctx, &signal).await;
    if let Err(e) = ctx.teardown() {
        tracing::warn!("⚠️ Could not remove execution context: {}", e);
    }

    match result {
        Ok(outcome) => {
            let layout = engine.storage().resolve(&outcome.layout_path);
            tracing::info!("✅ Design '{}' completed ({})", outcome.name, run_id);
            println!("✅ Design '{}' completed", outcome.name);
            println!("📁 Layout saved to: {}", layout.display());
            if let Some(metrics) = &outcome.metrics {
                println!(
                    "📈 min S11 {:.2} dB at {:.4} GHz, VSWR {:.2} at target",
                    metrics.min_s11_db,
                    metrics.resonant_frequency_hz / 1e9,
                    metrics.vswr_at_target
                );
                if let Some(z) = metrics.line_impedance_ohms {
                    println!("📏 Line impedance {:.2} Ω", z);
                }
                if let Some(ff) = &metrics.far_field {
                    println!(
                        "📡 Peak gain {:.2} dBi at θ={:.0}° φ={:.0}°",
                        ff.peak_gain_dbi, ff.peak_theta_deg, ff.peak_phi_deg
                    );
                }
            }
            if outcome.converged == Some(true) {
                println!("🎯 Converged after {} iterations", outcome.history.len());
            }
        }
        Err(e) => fail(&e),
    }

    Ok(())
}
