use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::equations::{self, Refinement};
use crate::domain::model::{
    Dimension, ElectricalTarget, Geometry, StructureKind, SubstrateStack, SubstrateView,
    SynthesisWarning,
};
use crate::utils::error::{Result, RfError};

/// Synthesis tolerances and manufacturing rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub impedance_tolerance_ohms: f64,
    /// Relative tolerance on the resonant frequency.
    pub frequency_tolerance_rel: f64,
    pub max_iterations: usize,
    pub min_trace_width_mm: f64,
    pub min_gap_mm: f64,
    /// Line length for microstrip and GCPW, in degrees of the guided wavelength.
    pub electrical_length_deg: f64,
    pub gcpw_gap_mm: f64,
    pub via_diameter_mm: f64,
    pub via_drill_mm: f64,
    /// Copper between the coplanar gap and the via pad.
    pub via_clearance_mm: f64,
    pub block_on_manufacturing_limit: bool,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            impedance_tolerance_ohms: 0.1,
            frequency_tolerance_rel: 1e-3,
            max_iterations: 50,
            min_trace_width_mm: 0.15,
            min_gap_mm: 0.15,
            electrical_length_deg: 90.0,
            gcpw_gap_mm: 0.25,
            via_diameter_mm: 0.6,
            via_drill_mm: 0.3,
            via_clearance_mm: 0.25,
            block_on_manufacturing_limit: false,
        }
    }
}

/// Turns electrical targets into physical dimensions for one structure kind.
#[derive(Debug, Clone)]
pub struct GeometrySynthesizer {
    kind: StructureKind,
    config: SynthesisConfig,
}

impl GeometrySynthesizer {
    pub fn new(kind: StructureKind, config: SynthesisConfig) -> Self {
        Self { kind, config }
    }

    pub fn kind(&self) -> StructureKind {
        self.kind
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    pub fn synthesize(&self, target: &ElectricalTarget, stack: &SubstrateStack) -> Result<Geometry> {
        stack.validate()?;
        target.validate()?;
        let view = stack.substrate_under_top()?;

        tracing::debug!(
            "Synthesizing {} for {:.3} Ω @ {:.4} GHz on h = {} mm, εr = {:.3}",
            self.kind,
            target.impedance_ohms,
            target.frequency_hz / 1e9,
            view.height_mm,
            view.permittivity
        );

        let (dimensions, achieved, iterations) = match self.kind {
            StructureKind::Microstrip => self.microstrip(target, &view)?,
            StructureKind::Patch => self.patch(target, &view)?,
            StructureKind::Gcpw => self.gcpw(target, &view)?,
        };

        let warnings = self.check_manufacturing(&dimensions)?;
        for warning in &warnings {
            tracing::warn!("⚠️ {}", warning);
        }

        tracing::info!(
            "✅ {} synthesized in {} iterations, achieved {:.4}",
            self.kind,
            iterations,
            achieved
        );

        Ok(Geometry {
            structure: self.kind,
            target: *target,
            signal_layer: view.signal_layer,
            reference_layer: view.reference_layer,
            dimensions,
            achieved,
            iterations,
            warnings,
        })
    }

    fn solve_microstrip_width(&self, impedance: f64, view: &SubstrateView) -> Result<Refinement> {
        let h = view.height_mm;
        let (er, t) = (view.permittivity, view.copper_thickness_mm);
        let w0 = equations::microstrip_initial_ratio(impedance, er) * h;
        equations::refine(
            "target.impedance_ohms",
            |w| equations::microstrip(w, h, t, er).impedance_ohms,
            impedance,
            w0,
            (
                equations::MICROSTRIP_MIN_RATIO * h,
                equations::MICROSTRIP_MAX_RATIO * h,
            ),
            self.config.impedance_tolerance_ohms,
            self.config.max_iterations,
        )
    }

    fn line_length(&self, frequency_hz: f64, eeff: f64) -> f64 {
        self.config.electrical_length_deg / 360.0 * equations::wavelength_mm(frequency_hz, eeff)
    }

    fn microstrip(
        &self,
        target: &ElectricalTarget,
        view: &SubstrateView,
    ) -> Result<(BTreeMap<Dimension, f64>, f64, usize)> {
        let solved = self.solve_microstrip_width(target.impedance_ohms, view)?;
        let width = solved.value;
        let line = equations::microstrip(
            width,
            view.height_mm,
            view.copper_thickness_mm,
            view.permittivity,
        );
        let length = self.line_length(target.frequency_hz, line.effective_permittivity);

        let dimensions = BTreeMap::from([
            (Dimension::TraceWidth, width),
            (Dimension::TraceLength, length),
            (
                Dimension::GroundPlaneWidth,
                width + 10.0 * view.height_mm,
            ),
            (Dimension::GroundPlaneLength, length),
        ]);
        Ok((dimensions, line.impedance_ohms, solved.iterations))
    }

    fn patch(
        &self,
        target: &ElectricalTarget,
        view: &SubstrateView,
    ) -> Result<(BTreeMap<Dimension, f64>, f64, usize)> {
        let f = target.frequency_hz;
        let h = view.height_mm;
        let dims = equations::patch_dimensions(f, h, view.permittivity);
        let l0 = equations::patch_length(f, &dims);
        if l0 <= 0.0 {
            return Err(RfError::UnachievableTarget {
                parameter: "target.frequency_hz".to_string(),
                value: f.to_string(),
                reason: "fringing extension exceeds the half-wave length; use a thinner substrate"
                    .to_string(),
            });
        }

        let solved = equations::refine(
            "target.frequency_hz",
            |l| equations::patch_resonance(l, &dims),
            f,
            l0,
            (0.5 * l0, 1.5 * l0),
            self.config.frequency_tolerance_rel * f,
            self.config.max_iterations,
        )?;
        let length = solved.value;
        let width = dims.width_mm;

        let edge = equations::patch_edge_resistance(f, width, length);
        let inset = equations::inset_depth(length, edge, target.impedance_ohms).ok_or_else(|| {
            RfError::UnachievableTarget {
                parameter: "target.impedance_ohms".to_string(),
                value: target.impedance_ohms.to_string(),
                reason: format!(
                    "feed impedance must not exceed the patch edge resistance of {:.1} Ω",
                    edge
                ),
            }
        })?;

        let feed = self.solve_microstrip_width(target.impedance_ohms, view)?;
        let notch = equations::notch_gap_mm(f, dims.effective_permittivity);
        if feed.value + 2.0 * notch >= width {
            return Err(RfError::UnachievableTarget {
                parameter: "target.impedance_ohms".to_string(),
                value: target.impedance_ohms.to_string(),
                reason: "feed line and notch clearance are wider than the patch".to_string(),
            });
        }

        let ground_length = length + 6.0 * h;
        let ground_width = width + 6.0 * h;
        let feed_length = (ground_length - length) / 2.0 + inset;

        tracing::debug!(
            "Patch edge resistance {:.1} Ω, inset {:.3} mm, notch {:.3} mm",
            edge,
            inset,
            notch
        );

        let dimensions = BTreeMap::from([
            (Dimension::PatchWidth, width),
            (Dimension::PatchLength, length),
            (Dimension::FeedWidth, feed.value),
            (Dimension::FeedLength, feed_length),
            (Dimension::FeedInsetLength, inset),
            (Dimension::NotchGap, notch),
            (Dimension::GroundPlaneWidth, ground_width),
            (Dimension::GroundPlaneLength, ground_length),
        ]);
        let achieved = equations::patch_resonance(length, &dims);
        Ok((dimensions, achieved, solved.iterations + feed.iterations))
    }

    fn gcpw(
        &self,
        target: &ElectricalTarget,
        view: &SubstrateView,
    ) -> Result<(BTreeMap<Dimension, f64>, f64, usize)> {
        let h = view.height_mm;
        let er = view.permittivity;
        let gap = self.config.gcpw_gap_mm;
        let model = |w: f64| equations::gcpw(w, gap, h, er).impedance_ohms;
        let lo = equations::GCPW_MIN_RATIO * h;
        let hi = equations::GCPW_MAX_RATIO * h;
        // The microstrip width is a good start: the coplanar grounds only pull it narrower.
        let w0 = equations::microstrip_initial_ratio(target.impedance_ohms, er) * h;
        let solved = equations::refine(
            "target.impedance_ohms",
            model,
            target.impedance_ohms,
            w0.clamp(lo, hi),
            (lo, hi),
            self.config.impedance_tolerance_ohms,
            self.config.max_iterations,
        )?;
        let width = solved.value;
        let line = equations::gcpw(width, gap, h, er);
        let length = self.line_length(target.frequency_hz, line.effective_permittivity);

        let diameter = self.config.via_diameter_mm;
        let pitch = equations::wavelength_mm(target.frequency_hz, view.permittivity) / 10.0;
        if pitch <= diameter {
            return Err(RfError::UnachievableTarget {
                parameter: "target.frequency_hz".to_string(),
                value: target.frequency_hz.to_string(),
                reason: format!(
                    "via fence pitch λ/10 = {:.3} mm does not fit vias of {:.3} mm",
                    pitch, diameter
                ),
            });
        }
        let via_offset = width / 2.0 + gap + self.config.via_clearance_mm + diameter / 2.0;
        let side_ground = width.max(2.0 * (self.config.via_clearance_mm + diameter));

        let dimensions = BTreeMap::from([
            (Dimension::TraceWidth, width),
            (Dimension::TraceLength, length),
            (Dimension::GapWidth, gap),
            (Dimension::ViaDiameter, diameter),
            (Dimension::ViaDrill, self.config.via_drill_mm),
            (Dimension::ViaPitch, pitch),
            (Dimension::ViaOffset, via_offset),
            (
                Dimension::GroundPlaneWidth,
                width + 2.0 * gap + 2.0 * side_ground,
            ),
            (Dimension::GroundPlaneLength, length),
        ]);
        Ok((dimensions, line.impedance_ohms, solved.iterations))
    }

    fn check_manufacturing(
        &self,
        dimensions: &BTreeMap<Dimension, f64>,
    ) -> Result<Vec<SynthesisWarning>> {
        let limits = [
            (Dimension::TraceWidth, self.config.min_trace_width_mm),
            (Dimension::FeedWidth, self.config.min_trace_width_mm),
            (Dimension::GapWidth, self.config.min_gap_mm),
            (Dimension::NotchGap, self.config.min_gap_mm),
        ];

        let mut warnings = Vec::new();
        for (dimension, limit) in limits {
            let Some(&value) = dimensions.get(&dimension) else {
                continue;
            };
            if value >= limit {
                continue;
            }
            if self.config.block_on_manufacturing_limit {
                return Err(RfError::BelowManufacturingLimit {
                    dimension: dimension.to_string(),
                    value_mm: value,
                    limit_mm: limit,
                });
            }
            warnings.push(SynthesisWarning::BelowManufacturingLimit {
                dimension,
                value_mm: value,
                limit_mm: limit,
            });
        }
        Ok(warnings)
    }
}

/// Recomputes the controlled electrical parameter from a geometry.
pub fn evaluate(geometry: &Geometry, stack: &SubstrateStack) -> Result<f64> {
    let view = stack.substrate_under_top()?;
    let value = match geometry.structure {
        StructureKind::Microstrip => {
            equations::microstrip(
                geometry.require(Dimension::TraceWidth)?,
                view.height_mm,
                view.copper_thickness_mm,
                view.permittivity,
            )
            .impedance_ohms
        }
        StructureKind::Gcpw => {
            equations::gcpw(
                geometry.require(Dimension::TraceWidth)?,
                geometry.require(Dimension::GapWidth)?,
                view.height_mm,
                view.permittivity,
            )
            .impedance_ohms
        }
        StructureKind::Patch => {
            let dims = equations::patch_dimensions(
                geometry.target.frequency_hz,
                view.height_mm,
                view.permittivity,
            );
            equations::patch_resonance(geometry.require(Dimension::PatchLength)?, &dims)
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fr4() -> SubstrateStack {
        SubstrateStack::two_layer(4.3, 1.6, 35.0, 0.02)
    }

    #[test]
    fn test_microstrip_hits_tolerance() {
        let synth = GeometrySynthesizer::new(StructureKind::Microstrip, SynthesisConfig::default());
        let geometry = synth.synthesize(&ElectricalTarget::new(50.0, 2.4e9), &fr4()).unwrap();
        assert!((geometry.achieved - 50.0).abs() <= 0.1);
        assert!(!geometry.has_warnings());
        let length = geometry.get(Dimension::TraceLength).unwrap();
        assert!(length > 14.0 && length < 20.0, "length = {}", length);
    }

    #[test]
    fn test_patch_resonance_and_inset() {
        let synth = GeometrySynthesizer::new(StructureKind::Patch, SynthesisConfig::default());
        let geometry = synth.synthesize(&ElectricalTarget::new(50.0, 2.45e9), &fr4()).unwrap();
        assert_relative_eq!(geometry.achieved, 2.45e9, max_relative = 1e-3);
        let length = geometry.get(Dimension::PatchLength).unwrap();
        let inset = geometry.get(Dimension::FeedInsetLength).unwrap();
        assert!(inset > 0.0 && inset < length / 2.0);
        assert_relative_eq!(
            geometry.get(Dimension::GroundPlaneLength).unwrap(),
            length + 9.6,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_gcpw_fence_pitch_within_tenth_wavelength() {
        let synth = GeometrySynthesizer::new(StructureKind::Gcpw, SynthesisConfig::default());
        let target = ElectricalTarget::new(50.0, 5.0e9);
        let geometry = synth.synthesize(&target, &fr4()).unwrap();
        assert!((geometry.achieved - 50.0).abs() <= 0.1);
        let lambda = equations::wavelength_mm(5.0e9, 4.3);
        assert!(geometry.get(Dimension::ViaPitch).unwrap() <= lambda / 10.0 + 1e-12);
        assert_relative_eq!(
            evaluate(&geometry, &fr4()).unwrap(),
            geometry.achieved,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_narrow_trace_warns_by_default() {
        let thin = SubstrateStack::two_layer(4.3, 0.2, 35.0, 0.02);
        let target = ElectricalTarget::new(120.0, 2.4e9);
        let synth = GeometrySynthesizer::new(StructureKind::Microstrip, SynthesisConfig::default());
        let geometry = synth.synthesize(&target, &thin).unwrap();
        assert!(matches!(
            geometry.warnings.as_slice(),
            [SynthesisWarning::BelowManufacturingLimit { dimension: Dimension::TraceWidth, .. }]
        ));

        let blocking = SynthesisConfig {
            block_on_manufacturing_limit: true,
            ..SynthesisConfig::default()
        };
        let synth = GeometrySynthesizer::new(StructureKind::Microstrip, blocking);
        assert!(matches!(
            synth.synthesize(&target, &thin),
            Err(RfError::BelowManufacturingLimit { .. })
        ));
    }

    #[test]
    fn test_impedance_outside_model_range_is_unachievable() {
        let synth = GeometrySynthesizer::new(StructureKind::Microstrip, SynthesisConfig::default());
        let err = synth
            .synthesize(&ElectricalTarget::new(1000.0, 2.4e9), &fr4())
            .unwrap_err();
        assert!(matches!(err, RfError::UnachievableTarget { ref parameter, .. } if parameter == "target.impedance_ohms"));
    }

    #[test]
    fn test_synthesis_is_deterministic() {
        let synth = GeometrySynthesizer::new(StructureKind::Patch, SynthesisConfig::default());
        let target = ElectricalTarget::new(50.0, 2.45e9);
        assert_eq!(
            synth.synthesize(&target, &fr4()).unwrap(),
            synth.synthesize(&target, &fr4()).unwrap()
        );
    }
}
