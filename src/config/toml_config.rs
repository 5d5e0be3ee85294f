use crate::adapters::solver::build_backend;
use crate::core::driver::{SimulationDriver, SolverKind, SolverSettings};
use crate::core::engine::{DesignEngine, DesignRequest};
use crate::core::feedback::FeedbackConfig;
use crate::core::mesh::{MeshConfig, MeshConverter};
use crate::core::synthesis::{GeometrySynthesizer, SynthesisConfig};
use crate::domain::model::{ElectricalTarget, StructureKind, SubstrateStack};
use crate::domain::ports::Storage;
use crate::utils::error::{Result, RfError};
use crate::utils::monitor::SystemMonitor;
use crate::utils::validation::{
    validate_non_empty_string, validate_path, validate_positive_number, validate_positive_real,
    validate_range, Validate,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One design file: what to build, on which stack-up, and how hard to try.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignConfig {
    pub design: DesignSection,
    pub target: ElectricalTarget,
    pub stack: SubstrateStack,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    /// Without a `[solver]` section the run stops after the layout.
    #[serde(default)]
    pub solver: Option<SolverSettings>,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSection {
    pub name: String,
    pub structure: StructureKind,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: "./output".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub json_logs: bool,
}

impl DesignConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| RfError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// Minimal configuration for a two-layer board, used when the CLI runs without a file.
    pub fn two_layer(
        name: impl Into<String>,
        structure: StructureKind,
        target: ElectricalTarget,
        stack: SubstrateStack,
    ) -> Self {
        Self {
            design: DesignSection {
                name: name.into(),
                structure,
                description: None,
            },
            target,
            stack,
            synthesis: SynthesisConfig::default(),
            mesh: MeshConfig::default(),
            solver: None,
            feedback: FeedbackConfig::default(),
            output: OutputConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }

    pub fn validate_config(&self) -> Result<()> {
        validate_non_empty_string("design.name", &self.design.name)?;
        if self.design.name.contains(['/', '\\']) {
            return Err(RfError::InvalidConfigValueError {
                field: "design.name".to_string(),
                value: self.design.name.clone(),
                reason: "Design names become directory names and cannot contain path separators"
                    .to_string(),
            });
        }
        validate_path("output.path", &self.output.path)?;

        self.target.validate()?;
        self.stack.validate()?;

        let synthesis = &self.synthesis;
        validate_positive_real("synthesis.impedance_tolerance_ohms", synthesis.impedance_tolerance_ohms)?;
        validate_positive_real("synthesis.frequency_tolerance_rel", synthesis.frequency_tolerance_rel)?;
        validate_positive_number("synthesis.max_iterations", synthesis.max_iterations, 1)?;
        validate_range("synthesis.electrical_length_deg", synthesis.electrical_length_deg, 1.0, 720.0)?;
        if synthesis.via_drill_mm >= synthesis.via_diameter_mm {
            return Err(RfError::InvalidConfigValueError {
                field: "synthesis.via_drill_mm".to_string(),
                value: synthesis.via_drill_mm.to_string(),
                reason: format!(
                    "Drill must be smaller than the via diameter ({} mm)",
                    synthesis.via_diameter_mm
                ),
            });
        }

        validate_positive_real("mesh.metal_resolution", self.mesh.metal_resolution)?;
        validate_positive_real("mesh.air_resolution", self.mesh.air_resolution)?;
        validate_positive_real("mesh.min_spacing_mm", self.mesh.min_spacing_mm)?;
        validate_range("mesh.grading_ratio", self.mesh.grading_ratio, 1.0, 3.0)?;

        if let Some(solver) = &self.solver {
            validate_range("solver.frequency_span_rel", solver.frequency_span_rel, 0.01, 0.9)?;
            validate_positive_number("solver.frequency_points", solver.frequency_points, 2)?;
            validate_positive_number("solver.timeout_secs", solver.timeout_secs as usize, 1)?;
            if solver.backend == SolverKind::Process && solver.command.is_empty() {
                return Err(RfError::MissingConfigError {
                    field: "solver.command".to_string(),
                });
            }
            if let Some(step) = solver.far_field_step_deg {
                validate_range("solver.far_field_step_deg", step, 0.5, 45.0)?;
            }
        }

        let feedback = &self.feedback;
        validate_positive_number("feedback.max_iterations", feedback.max_iterations, 1)?;
        validate_positive_real("feedback.impedance_tolerance_ohms", feedback.impedance_tolerance_ohms)?;
        validate_positive_real("feedback.frequency_tolerance_rel", feedback.frequency_tolerance_rel)?;
        validate_range("feedback.max_step_fraction", feedback.max_step_fraction, 0.01, 1.0)?;
        validate_range("feedback.damping", feedback.damping, 0.01, 1.0)?;

        Ok(())
    }

    pub fn to_request(&self) -> DesignRequest {
        DesignRequest {
            name: self.design.name.clone(),
            target: self.target,
            stack: self.stack.clone(),
        }
    }

    pub fn simulation_enabled(&self) -> bool {
        self.solver.is_some()
    }

    /// Engine wired with every section of this file.
    pub fn build_engine<S: Storage>(&self, storage: S) -> Result<DesignEngine<S>> {
        let synthesizer = GeometrySynthesizer::new(self.design.structure, self.synthesis.clone());
        let mesher = MeshConverter::new(self.mesh.clone());
        let mut engine = DesignEngine::new(storage, synthesizer, mesher)
            .with_feedback(self.feedback.clone())
            .with_monitor(SystemMonitor::new(self.monitoring.enabled));

        if let Some(solver) = &self.solver {
            let backend = build_backend(solver)?;
            engine = engine
                .with_sweep(solver.frequency_span_rel, solver.frequency_points)
                .with_driver(SimulationDriver::new(backend, solver));
        }
        Ok(engine)
    }
}

impl Validate for DesignConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

/// Replaces `${VAR}` with the environment value. Unknown variables are left as written.
pub(crate) fn substitute_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| RfError::ConfigValidationError {
        field: "environment".to_string(),
        message: e.to_string(),
    })?;

    let result = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    });

    Ok(result.to_string())
}
