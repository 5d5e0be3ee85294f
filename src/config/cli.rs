use crate::config::toml_config::DesignConfig;
use crate::core::driver::{SolverKind, SolverSettings};
use crate::domain::model::{ElectricalTarget, StructureKind, SubstrateStack};
use crate::utils::error::{Result, RfError};
use crate::utils::validation::validate_required_field;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(name = "rfsynth")]
#[command(about = "Synthesize, simulate and lay out RF PCB structures from electrical targets")]
pub struct CliConfig {
    #[arg(long, short, help = "TOML design file; flags below override it")]
    pub config: Option<String>,

    #[arg(long, help = "microstrip, patch or gcpw")]
    pub structure: Option<String>,

    #[arg(long, help = "Design name, used for the output directory")]
    pub name: Option<String>,

    #[arg(long, help = "Target impedance in ohms")]
    pub impedance: Option<f64>,

    #[arg(long, help = "Target frequency in Hz, e.g. 2.4e9")]
    pub frequency: Option<f64>,

    #[arg(long, default_value = "4.3", help = "Substrate relative permittivity")]
    pub er: f64,

    #[arg(long, default_value = "1.6")]
    pub height_mm: f64,

    #[arg(long, default_value = "35")]
    pub copper_um: f64,

    #[arg(long, default_value = "0.02")]
    pub loss_tangent: f64,

    #[arg(long, short)]
    pub output: Option<String>,

    #[arg(long, help = "Run the solver and feedback loop after synthesis")]
    pub simulate: bool,

    #[arg(long, help = "Solver backend: analytic or process")]
    pub solver: Option<String>,

    #[arg(long, help = "External solver command line, with {config} and {output} placeholders")]
    pub solver_command: Option<String>,

    #[arg(long, help = "Log CPU and memory per phase")]
    pub monitor: bool,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,
}

impl CliConfig {
    /// Design file merged with the command-line overrides.
    pub fn to_design_config(&self) -> Result<DesignConfig> {
        let mut config = match &self.config {
            Some(path) => DesignConfig::from_file(path)?,
            None => {
                let structure: StructureKind =
                    validate_required_field("structure", &self.structure)?.parse()?;
                let impedance = *validate_required_field("impedance", &self.impedance)?;
                let frequency = *validate_required_field("frequency", &self.frequency)?;
                let name = self
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}_{:.0}ohm", structure, impedance));
                DesignConfig::two_layer(
                    name,
                    structure,
                    ElectricalTarget::new(impedance, frequency),
                    SubstrateStack::two_layer(self.er, self.height_mm, self.copper_um, self.loss_tangent),
                )
            }
        };

        if let Some(name) = &self.name {
            config.design.name = name.clone();
        }
        if let Some(output) = &self.output {
            config.output.path = output.clone();
        }
        if self.monitor {
            config.monitoring.enabled = true;
        }

        let wants_solver = self.simulate || self.solver.is_some() || self.solver_command.is_some();
        if wants_solver {
            let solver = config.solver.get_or_insert_with(SolverSettings::default);
            if let Some(kind) = &self.solver {
                solver.backend = parse_solver_kind(kind)?;
            }
            if let Some(command) = &self.solver_command {
                solver.command = command.split_whitespace().map(str::to_string).collect();
                if self.solver.is_none() {
                    solver.backend = SolverKind::Process;
                }
            }
        }

        Ok(config)
    }
}

fn parse_solver_kind(value: &str) -> Result<SolverKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "analytic" => Ok(SolverKind::Analytic),
        "process" => Ok(SolverKind::Process),
        other => Err(RfError::InvalidConfigValueError {
            field: "solver".to_string(),
            value: other.to_string(),
            reason: "expected analytic or process".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_build_two_layer_design() {
        let cli = CliConfig::parse_from([
            "rfsynth",
            "--structure",
            "microstrip",
            "--impedance",
            "50",
            "--frequency",
            "2.4e9",
            "--height-mm",
            "0.8",
        ]);
        let config = cli.to_design_config().unwrap();

        assert_eq!(config.design.structure, StructureKind::Microstrip);
        assert_eq!(config.design.name, "microstrip_50ohm");
        assert_eq!(config.target.frequency_hz, 2.4e9);
        assert_eq!(config.stack.substrate_under_top().unwrap().height_mm, 0.8);
        assert!(!config.simulation_enabled());
    }

    #[test]
    fn test_missing_target_is_reported() {
        let cli = CliConfig::parse_from(["rfsynth", "--structure", "patch"]);
        assert!(matches!(
            cli.to_design_config(),
            Err(RfError::MissingConfigError { field }) if field == "impedance"
        ));
    }

    #[test]
    fn test_solver_command_selects_process_backend() {
        let cli = CliConfig::parse_from([
            "rfsynth",
            "--structure",
            "gcpw",
            "--impedance",
            "50",
            "--frequency",
            "10e9",
            "--solver-command",
            "fdtd-run {config} {output}",
        ]);
        let config = cli.to_design_config().unwrap();
        let solver = config.solver.unwrap();

        assert_eq!(solver.backend, SolverKind::Process);
        assert_eq!(solver.command, vec!["fdtd-run", "{config}", "{output}"]);
    }

    #[test]
    fn test_unknown_solver_rejected() {
        let cli = CliConfig::parse_from([
            "rfsynth",
            "--structure",
            "patch",
            "--impedance",
            "50",
            "--frequency",
            "2.4e9",
            "--solver",
            "magic",
        ]);
        assert!(cli.to_design_config().is_err());
    }
}
