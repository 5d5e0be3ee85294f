use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::simulation::DesignMetrics;
use crate::utils::error::{Result, RfError};

pub const DEFAULT_COPPER_CONDUCTIVITY: f64 = 5.8e7;

fn default_copper_conductivity() -> f64 {
    DEFAULT_COPPER_CONDUCTIVITY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarization {
    Linear,
    RightHandCircular,
    LeftHandCircular,
}

/// What the user asks for. Replaced, never mutated, between feedback iterations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElectricalTarget {
    pub impedance_ohms: f64,
    pub frequency_hz: f64,
    #[serde(default)]
    pub bandwidth_hz: Option<f64>,
    #[serde(default)]
    pub polarization: Option<Polarization>,
}

impl ElectricalTarget {
    pub fn new(impedance_ohms: f64, frequency_hz: f64) -> Self {
        Self {
            impedance_ohms,
            frequency_hz,
            bandwidth_hz: None,
            polarization: None,
        }
    }

    pub fn with_bandwidth(mut self, bandwidth_hz: f64) -> Self {
        self.bandwidth_hz = Some(bandwidth_hz);
        self
    }

    pub fn with_polarization(mut self, polarization: Polarization) -> Self {
        self.polarization = Some(polarization);
        self
    }

    /// Copy of this target with the controlled parameter replaced.
    pub fn with_parameter(&self, parameter: TargetParameter, value: f64) -> Self {
        let mut next = *self;
        match parameter {
            TargetParameter::Impedance => next.impedance_ohms = value,
            TargetParameter::ResonantFrequency => next.frequency_hz = value,
        }
        next
    }

    pub fn parameter(&self, parameter: TargetParameter) -> f64 {
        match parameter {
            TargetParameter::Impedance => self.impedance_ohms,
            TargetParameter::ResonantFrequency => self.frequency_hz,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("target.impedance_ohms", self.impedance_ohms),
            ("target.frequency_hz", self.frequency_hz),
        ];
        for (parameter, value) in checks {
            if !value.is_finite() || value <= 0.0 {
                return Err(RfError::UnachievableTarget {
                    parameter: parameter.to_string(),
                    value: value.to_string(),
                    reason: "must be a finite positive number".to_string(),
                });
            }
        }
        if let Some(bandwidth) = self.bandwidth_hz {
            if !bandwidth.is_finite() || bandwidth <= 0.0 || bandwidth >= 2.0 * self.frequency_hz {
                return Err(RfError::UnachievableTarget {
                    parameter: "target.bandwidth_hz".to_string(),
                    value: bandwidth.to_string(),
                    reason: "must be positive and narrower than twice the centre frequency"
                        .to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureKind {
    Microstrip,
    Patch,
    Gcpw,
}

impl StructureKind {
    /// The electrical parameter the feedback loop drives towards the target.
    pub fn controlled_parameter(&self) -> TargetParameter {
        match self {
            StructureKind::Microstrip | StructureKind::Gcpw => TargetParameter::Impedance,
            StructureKind::Patch => TargetParameter::ResonantFrequency,
        }
    }

    pub fn is_radiator(&self) -> bool {
        matches!(self, StructureKind::Patch)
    }
}

impl fmt::Display for StructureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StructureKind::Microstrip => "microstrip",
            StructureKind::Patch => "patch",
            StructureKind::Gcpw => "gcpw",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for StructureKind {
    type Err = RfError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "microstrip" | "msl" => Ok(StructureKind::Microstrip),
            "patch" => Ok(StructureKind::Patch),
            "gcpw" | "cpwg" => Ok(StructureKind::Gcpw),
            other => Err(RfError::InvalidConfigValueError {
                field: "structure".to_string(),
                value: other.to_string(),
                reason: "expected one of microstrip, patch, gcpw".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetParameter {
    Impedance,
    ResonantFrequency,
}

impl fmt::Display for TargetParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetParameter::Impedance => f.write_str("impedance_ohms"),
            TargetParameter::ResonantFrequency => f.write_str("frequency_hz"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConductorRole {
    Top,
    Inner,
    Bottom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConductorLayer {
    pub name: String,
    pub role: ConductorRole,
    pub thickness_mm: f64,
    #[serde(default = "default_copper_conductivity")]
    pub conductivity_s_per_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DielectricLayer {
    pub material: String,
    pub thickness_mm: f64,
    pub permittivity: f64,
    #[serde(default)]
    pub loss_tangent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StackLayer {
    Conductor(ConductorLayer),
    Dielectric(DielectricLayer),
}

impl StackLayer {
    pub fn thickness_mm(&self) -> f64 {
        match self {
            StackLayer::Conductor(c) => c.thickness_mm,
            StackLayer::Dielectric(d) => d.thickness_mm,
        }
    }
}

/// Vertical extent of one stack layer, z = 0 at the bottom of the board.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerExtent {
    pub index: usize,
    pub z_bottom: f64,
    pub z_top: f64,
}

/// The substrate as seen by a trace on the top conductor.
#[derive(Debug, Clone, PartialEq)]
pub struct SubstrateView {
    pub signal_layer: String,
    pub reference_layer: String,
    pub height_mm: f64,
    pub permittivity: f64,
    pub loss_tangent: f64,
    pub copper_thickness_mm: f64,
}

/// Layers ordered from the top of the board downwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstrateStack {
    pub layers: Vec<StackLayer>,
}

impl SubstrateStack {
    /// Top copper, one dielectric, bottom copper.
    pub fn two_layer(permittivity: f64, height_mm: f64, copper_um: f64, loss_tangent: f64) -> Self {
        let copper_mm = copper_um * 1e-3;
        Self {
            layers: vec![
                StackLayer::Conductor(ConductorLayer {
                    name: "F.Cu".to_string(),
                    role: ConductorRole::Top,
                    thickness_mm: copper_mm,
                    conductivity_s_per_m: DEFAULT_COPPER_CONDUCTIVITY,
                }),
                StackLayer::Dielectric(DielectricLayer {
                    material: "FR4".to_string(),
                    thickness_mm: height_mm,
                    permittivity,
                    loss_tangent,
                }),
                StackLayer::Conductor(ConductorLayer {
                    name: "B.Cu".to_string(),
                    role: ConductorRole::Bottom,
                    thickness_mm: copper_mm,
                    conductivity_s_per_m: DEFAULT_COPPER_CONDUCTIVITY,
                }),
            ],
        }
    }

    /// Checks physical plausibility. Runs before any geometry computation.
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(invalid_stackup("stack.layers", "[]", "stack-up has no layers"));
        }

        let mut seen_names = std::collections::HashSet::new();
        for (i, layer) in self.layers.iter().enumerate() {
            let thickness = layer.thickness_mm();
            if !thickness.is_finite() || thickness <= 0.0 {
                return Err(invalid_stackup(
                    &format!("stack.layers[{}].thickness_mm", i),
                    &thickness.to_string(),
                    "thickness must be positive",
                ));
            }
            match layer {
                StackLayer::Dielectric(d) => {
                    if !d.permittivity.is_finite() || d.permittivity < 1.0 {
                        return Err(invalid_stackup(
                            &format!("stack.layers[{}].permittivity", i),
                            &d.permittivity.to_string(),
                            "relative permittivity must be at least 1",
                        ));
                    }
                    if !d.loss_tangent.is_finite() || d.loss_tangent < 0.0 {
                        return Err(invalid_stackup(
                            &format!("stack.layers[{}].loss_tangent", i),
                            &d.loss_tangent.to_string(),
                            "loss tangent must be non-negative",
                        ));
                    }
                }
                StackLayer::Conductor(c) => {
                    if !c.conductivity_s_per_m.is_finite() || c.conductivity_s_per_m <= 0.0 {
                        return Err(invalid_stackup(
                            &format!("stack.layers[{}].conductivity_s_per_m", i),
                            &c.conductivity_s_per_m.to_string(),
                            "conductivity must be positive",
                        ));
                    }
                    if !seen_names.insert(c.name.as_str()) {
                        return Err(invalid_stackup(
                            &format!("stack.layers[{}].name", i),
                            &c.name,
                            "conductor names must be unique",
                        ));
                    }
                }
            }
        }

        if self.dielectrics().next().is_none() {
            return Err(invalid_stackup(
                "stack.layers",
                &self.layers.len().to_string(),
                "stack-up needs at least one dielectric layer",
            ));
        }

        for (i, pair) in self.layers.windows(2).enumerate() {
            if let [StackLayer::Conductor(_), StackLayer::Conductor(_)] = pair {
                return Err(invalid_stackup(
                    &format!("stack.layers[{}]", i + 1),
                    "conductor",
                    "two conductor layers must be separated by a dielectric",
                ));
            }
        }

        Ok(())
    }

    pub fn conductors(&self) -> impl Iterator<Item = &ConductorLayer> {
        self.layers.iter().filter_map(|layer| match layer {
            StackLayer::Conductor(c) => Some(c),
            _ => None,
        })
    }

    pub fn dielectrics(&self) -> impl Iterator<Item = &DielectricLayer> {
        self.layers.iter().filter_map(|layer| match layer {
            StackLayer::Dielectric(d) => Some(d),
            _ => None,
        })
    }

    pub fn conductor(&self, name: &str) -> Option<&ConductorLayer> {
        self.conductors().find(|c| c.name == name)
    }

    pub fn conductor_with_role(&self, role: ConductorRole) -> Option<&ConductorLayer> {
        self.conductors().find(|c| c.role == role)
    }

    pub fn total_thickness_mm(&self) -> f64 {
        self.layers.iter().map(StackLayer::thickness_mm).sum()
    }

    pub fn max_permittivity(&self) -> f64 {
        self.dielectrics()
            .map(|d| d.permittivity)
            .fold(1.0_f64, f64::max)
    }

    /// z extents of every layer, in stack order.
    pub fn extents(&self) -> Vec<LayerExtent> {
        let mut z_top = self.total_thickness_mm();
        self.layers
            .iter()
            .enumerate()
            .map(|(index, layer)| {
                let z_bottom = z_top - layer.thickness_mm();
                let extent = LayerExtent {
                    index,
                    z_bottom,
                    z_top,
                };
                z_top = z_bottom;
                extent
            })
            .collect()
    }

    pub fn conductor_extent(&self, name: &str) -> Option<LayerExtent> {
        let index = self.layers.iter().position(|layer| match layer {
            StackLayer::Conductor(c) => c.name == name,
            _ => false,
        })?;
        self.extents().get(index).copied()
    }

    /// Dielectric seen by the top conductor down to the next conductor. Several dielectric
    /// layers in between are merged with a thickness-weighted permittivity.
    pub fn substrate_under_top(&self) -> Result<SubstrateView> {
        let (top_index, top) = self
            .layers
            .iter()
            .enumerate()
            .find_map(|(i, layer)| match layer {
                StackLayer::Conductor(c) if c.role == ConductorRole::Top => Some((i, c)),
                _ => None,
            })
            .ok_or_else(|| invalid_stackup("stack.layers", "-", "no conductor with role 'top'"))?;

        let mut height = 0.0;
        let mut weighted_er = 0.0;
        let mut weighted_tan = 0.0;
        for layer in &self.layers[top_index + 1..] {
            match layer {
                StackLayer::Dielectric(d) => {
                    height += d.thickness_mm;
                    weighted_er += d.permittivity * d.thickness_mm;
                    weighted_tan += d.loss_tangent * d.thickness_mm;
                }
                StackLayer::Conductor(reference) => {
                    if height <= 0.0 {
                        break;
                    }
                    return Ok(SubstrateView {
                        signal_layer: top.name.clone(),
                        reference_layer: reference.name.clone(),
                        height_mm: height,
                        permittivity: weighted_er / height,
                        loss_tangent: weighted_tan / height,
                        copper_thickness_mm: top.thickness_mm,
                    });
                }
            }
        }

        Err(invalid_stackup(
            "stack.layers",
            &top.name,
            "no reference conductor below the top conductor",
        ))
    }
}

fn invalid_stackup(parameter: &str, value: &str, reason: &str) -> RfError {
    RfError::InvalidStackup {
        parameter: parameter.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    TraceWidth,
    TraceLength,
    GapWidth,
    PatchWidth,
    PatchLength,
    FeedWidth,
    FeedLength,
    FeedInsetLength,
    NotchGap,
    GroundPlaneWidth,
    GroundPlaneLength,
    ViaDiameter,
    ViaDrill,
    ViaPitch,
    ViaOffset,
}

impl Dimension {
    pub fn name(&self) -> &'static str {
        match self {
            Dimension::TraceWidth => "trace_width",
            Dimension::TraceLength => "trace_length",
            Dimension::GapWidth => "gap_width",
            Dimension::PatchWidth => "patch_width",
            Dimension::PatchLength => "patch_length",
            Dimension::FeedWidth => "feed_width",
            Dimension::FeedLength => "feed_length",
            Dimension::FeedInsetLength => "feed_inset_length",
            Dimension::NotchGap => "notch_gap",
            Dimension::GroundPlaneWidth => "ground_plane_width",
            Dimension::GroundPlaneLength => "ground_plane_length",
            Dimension::ViaDiameter => "via_diameter",
            Dimension::ViaDrill => "via_drill",
            Dimension::ViaPitch => "via_pitch",
            Dimension::ViaOffset => "via_offset",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SynthesisWarning {
    BelowManufacturingLimit {
        dimension: Dimension,
        value_mm: f64,
        limit_mm: f64,
    },
}

impl fmt::Display for SynthesisWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisWarning::BelowManufacturingLimit {
                dimension,
                value_mm,
                limit_mm,
            } => write!(
                f,
                "{} = {:.4} mm is below the manufacturing limit of {:.4} mm",
                dimension, value_mm, limit_mm
            ),
        }
    }
}

/// Physical dimensions in millimetres, as produced by one synthesis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub structure: StructureKind,
    pub target: ElectricalTarget,
    pub signal_layer: String,
    pub reference_layer: String,
    pub dimensions: BTreeMap<Dimension, f64>,
    /// Electrical parameter recomputed from the final dimensions.
    pub achieved: f64,
    pub iterations: usize,
    #[serde(default)]
    pub warnings: Vec<SynthesisWarning>,
}

impl Geometry {
    pub fn get(&self, dimension: Dimension) -> Option<f64> {
        self.dimensions.get(&dimension).copied()
    }

    /// A dimension the caller cannot work without.
    pub fn require(&self, dimension: Dimension) -> Result<f64> {
        self.get(dimension).ok_or_else(|| RfError::DegenerateGeometry {
            reason: format!("{} geometry has no '{}' dimension", self.structure, dimension),
        })
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedbackDecision {
    pub converged: bool,
    pub updated_target: Option<ElectricalTarget>,
    pub iteration_count: usize,
}

/// One pass of the feedback loop, kept for inspection after the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub synthesis_target: ElectricalTarget,
    pub geometry: Geometry,
    pub parameter: TargetParameter,
    pub measured: f64,
    /// measured − desired
    pub error: f64,
    /// False when the error grew compared to the previous accepted iteration.
    pub accepted: bool,
    pub metrics: DesignMetrics,
}
