use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::board::{Orientation, Point};
use crate::domain::model::StructureKind;
use crate::utils::error::{Result, RfError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub start_hz: f64,
    pub stop_hz: f64,
    pub points: usize,
}

impl FrequencyRange {
    pub fn new(start_hz: f64, stop_hz: f64, points: usize) -> Self {
        Self {
            start_hz,
            stop_hz,
            points,
        }
    }

    /// `center ± relative_span·center`.
    pub fn around(center_hz: f64, relative_span: f64, points: usize) -> Self {
        Self::new(
            center_hz * (1.0 - relative_span),
            center_hz * (1.0 + relative_span),
            points,
        )
    }

    pub fn center_hz(&self) -> f64 {
        0.5 * (self.start_hz + self.stop_hz)
    }

    pub fn half_span_hz(&self) -> f64 {
        0.5 * (self.stop_hz - self.start_hz)
    }

    /// Linearly spaced sample frequencies, both ends included.
    pub fn samples(&self) -> Vec<f64> {
        match self.points {
            0 => Vec::new(),
            1 => vec![self.start_hz],
            n => {
                let step = (self.stop_hz - self.start_hz) / (n as f64 - 1.0);
                (0..n).map(|i| self.start_hz + step * i as f64).collect()
            }
        }
    }

    pub fn contains(&self, hz: f64) -> bool {
        hz >= self.start_hz && hz <= self.stop_hz
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.start_hz.is_finite() && self.start_hz > 0.0) || !(self.stop_hz > self.start_hz) {
            return Err(RfError::InvalidConfigValueError {
                field: "frequency_range".to_string(),
                value: format!("{}..{}", self.start_hz, self.stop_hz),
                reason: "start must be positive and below stop".to_string(),
            });
        }
        if self.points < 2 {
            return Err(RfError::InvalidConfigValueError {
                field: "frequency_range.points".to_string(),
                value: self.points.to_string(),
                reason: "at least two frequency points are required".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Non-uniform rectilinear grid, coordinates in millimetres, each axis strictly increasing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshLines {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

impl MeshLines {
    pub fn axis(&self, axis: Axis) -> &[f64] {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }

    pub fn cell_count(&self) -> usize {
        let cells = |lines: &[f64]| lines.len().saturating_sub(1);
        cells(&self.x) * cells(&self.y) * cells(&self.z)
    }

    pub fn min_spacing(&self, axis: Axis) -> Option<f64> {
        self.axis(axis)
            .windows(2)
            .map(|w| w[1] - w[0])
            .reduce(f64::min)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Material {
    Air,
    Dielectric {
        name: String,
        permittivity: f64,
        loss_tangent: f64,
        /// Equivalent conductivity reproducing the loss tangent at the excitation centre.
        conductivity_s_per_m: f64,
    },
    Conductor {
        name: String,
        conductivity_s_per_m: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum RegionShape {
    Box {
        min: [f64; 3],
        max: [f64; 3],
    },
    ExtrudedPolygon {
        vertices: Vec<Point>,
        z_min: f64,
        z_max: f64,
    },
    Cylinder {
        center: Point,
        radius: f64,
        z_min: f64,
        z_max: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialRegion {
    pub name: String,
    /// Stack layer the region was generated from.
    pub layer: Option<String>,
    pub material: Material,
    pub shape: RegionShape,
    /// Higher priority wins where regions overlap.
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundaryCondition {
    Pec,
    Pmc,
    Pml { cells: u8 },
    Periodic,
}

impl BoundaryCondition {
    pub fn is_absorbing(&self) -> bool {
        matches!(self, BoundaryCondition::Pml { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundaries {
    pub x_min: BoundaryCondition,
    pub x_max: BoundaryCondition,
    pub y_min: BoundaryCondition,
    pub y_max: BoundaryCondition,
    pub z_min: BoundaryCondition,
    pub z_max: BoundaryCondition,
}

impl Boundaries {
    pub fn uniform(condition: BoundaryCondition) -> Self {
        Self {
            x_min: condition,
            x_max: condition,
            y_min: condition,
            y_max: condition,
            z_min: condition,
            z_max: condition,
        }
    }

    pub fn faces(&self) -> [BoundaryCondition; 6] {
        [
            self.x_min, self.x_max, self.y_min, self.y_max, self.z_min, self.z_max,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    Lumped,
    Waveguide,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Waveform {
    Gaussian { f0_hz: f64, fc_hz: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcitationPort {
    pub number: u32,
    pub kind: PortKind,
    pub layer: String,
    pub reference_layer: String,
    pub reference_impedance: f64,
    pub direction: Orientation,
    /// Opposite corners of the port volume in millimetres.
    pub start: [f64; 3],
    pub stop: [f64; 3],
    pub excite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationDomain {
    pub name: String,
    pub structure: StructureKind,
    /// Drawing unit in metres.
    pub unit_m: f64,
    pub mesh: MeshLines,
    pub regions: Vec<MaterialRegion>,
    pub boundaries: Boundaries,
    pub ports: Vec<ExcitationPort>,
    pub waveform: Waveform,
    pub frequency_range: FrequencyRange,
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
}

impl SimulationDomain {
    /// Stack layers that own at least one material region.
    pub fn grid_layers(&self) -> BTreeSet<&str> {
        self.regions
            .iter()
            .filter_map(|r| r.layer.as_deref())
            .collect()
    }

    pub fn excited_ports(&self) -> impl Iterator<Item = &ExcitationPort> {
        self.ports.iter().filter(|p| p.excite)
    }
}

/// When the time-domain solver may stop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Termination {
    /// Stop once field energy decays this far below its peak.
    pub energy_decay_db: f64,
    /// Hard cap on time steps.
    pub max_timesteps: u64,
}

impl Default for Termination {
    fn default() -> Self {
        Self {
            energy_decay_db: -40.0,
            max_timesteps: 1_000_000,
        }
    }
}

/// Everything handed across the solver boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfiguration {
    pub domain: SimulationDomain,
    pub termination: Termination,
    /// Far-field sampling step in degrees, when a radiation pattern is wanted.
    pub far_field_step_deg: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SParameterTrace {
    /// Receiving port.
    pub port_out: u32,
    /// Excited port.
    pub port_in: u32,
    pub values: Vec<Complex64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FarFieldSample {
    pub theta_deg: f64,
    pub phi_deg: f64,
    pub gain_dbi: f64,
}

/// Output of one solver invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub frequencies_hz: Vec<f64>,
    pub reference_impedance: f64,
    pub s_parameters: Vec<SParameterTrace>,
    #[serde(default)]
    pub far_field: Option<Vec<FarFieldSample>>,
    #[serde(default)]
    pub solver_log: String,
}

impl SimulationResult {
    pub fn s(&self, port_out: u32, port_in: u32) -> Option<&[Complex64]> {
        self.s_parameters
            .iter()
            .find(|t| t.port_out == port_out && t.port_in == port_in)
            .map(|t| t.values.as_slice())
    }

    pub fn port_pairs(&self) -> Vec<(u32, u32)> {
        self.s_parameters
            .iter()
            .map(|t| (t.port_out, t.port_in))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FarFieldMetrics {
    pub peak_gain_dbi: f64,
    pub peak_theta_deg: f64,
    pub peak_phi_deg: f64,
    /// -3 dB beamwidth in the phi = 0° plane.
    pub beamwidth_phi0_deg: Option<f64>,
    /// -3 dB beamwidth in the phi = 90° plane.
    pub beamwidth_phi90_deg: Option<f64>,
}

/// Derived figures of merit for one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignMetrics {
    pub target_frequency_hz: f64,
    pub min_s11_db: f64,
    pub resonant_frequency_hz: f64,
    pub return_loss_at_target_db: f64,
    pub input_impedance_at_target: Complex64,
    pub vswr_at_target: f64,
    pub line_impedance_ohms: Option<f64>,
    pub bandwidth_hz: Option<f64>,
    pub band_edges_hz: Option<(f64, f64)>,
    pub far_field: Option<FarFieldMetrics>,
}
