use approx::assert_relative_eq;
use rfsynth::core::synthesis::{evaluate, GeometrySynthesizer, SynthesisConfig};
use rfsynth::domain::model::{Dimension, SynthesisWarning};
use rfsynth::{ElectricalTarget, RfError, StructureKind, SubstrateStack};

fn fr4() -> SubstrateStack {
    SubstrateStack::two_layer(4.3, 1.6, 35.0, 0.02)
}

fn synthesize(kind: StructureKind, target: ElectricalTarget, stack: &SubstrateStack) -> rfsynth::Result<rfsynth::core::Geometry> {
    GeometrySynthesizer::new(kind, SynthesisConfig::default()).synthesize(&target, stack)
}

#[test]
fn test_microstrip_50_ohm_on_fr4() {
    let stack = fr4();
    let geometry = synthesize(StructureKind::Microstrip, ElectricalTarget::new(50.0, 2.4e9), &stack).unwrap();

    let width = geometry.get(Dimension::TraceWidth).unwrap();
    assert!(width > 2.5 && width < 3.5, "width {} mm", width);
    let z = evaluate(&geometry, &stack).unwrap();
    assert!((49.5..=50.5).contains(&z), "impedance {}", z);
    assert!(!geometry.has_warnings());
}

#[test]
fn test_higher_impedance_gives_narrower_trace() {
    let stack = fr4();
    let w50 = synthesize(StructureKind::Microstrip, ElectricalTarget::new(50.0, 2.4e9), &stack)
        .unwrap()
        .require(Dimension::TraceWidth)
        .unwrap();
    let w75 = synthesize(StructureKind::Microstrip, ElectricalTarget::new(75.0, 2.4e9), &stack)
        .unwrap()
        .require(Dimension::TraceWidth)
        .unwrap();
    assert!(w75 < w50);
}

#[test]
fn test_patch_resonates_at_target() {
    let stack = fr4();
    let geometry = synthesize(StructureKind::Patch, ElectricalTarget::new(50.0, 2.4e9), &stack).unwrap();

    let resonance = evaluate(&geometry, &stack).unwrap();
    assert_relative_eq!(resonance, 2.4e9, max_relative = 1e-3);
    let width = geometry.require(Dimension::PatchWidth).unwrap();
    let length = geometry.require(Dimension::PatchLength).unwrap();
    let inset = geometry.require(Dimension::FeedInsetLength).unwrap();
    assert!(length < width);
    assert!(inset > 0.0 && inset < length / 2.0);
    assert!(geometry.require(Dimension::GroundPlaneWidth).unwrap() > width);
}

#[test]
fn test_gcpw_on_rogers() {
    let stack = SubstrateStack::two_layer(3.66, 0.508, 35.0, 0.0037);
    let geometry = synthesize(StructureKind::Gcpw, ElectricalTarget::new(50.0, 10e9), &stack).unwrap();

    let z = evaluate(&geometry, &stack).unwrap();
    assert!((z - 50.0).abs() <= 0.1, "impedance {}", z);
    assert!(geometry.get(Dimension::ViaPitch).is_some());
}

#[test]
fn test_zero_thickness_dielectric_is_invalid_stackup() {
    let stack = SubstrateStack::two_layer(4.3, 0.0, 35.0, 0.02);
    let err = synthesize(StructureKind::Microstrip, ElectricalTarget::new(50.0, 2.4e9), &stack).unwrap_err();
    assert!(matches!(err, RfError::InvalidStackup { .. }));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn test_non_positive_target_is_unachievable() {
    let err = synthesize(StructureKind::Patch, ElectricalTarget::new(50.0, 0.0), &fr4()).unwrap_err();
    assert!(matches!(err, RfError::UnachievableTarget { .. }));
}

#[test]
fn test_manufacturing_limit_policy() {
    let thin = SubstrateStack::two_layer(4.3, 0.2, 35.0, 0.02);
    let target = ElectricalTarget::new(120.0, 2.4e9);

    let geometry = synthesize(StructureKind::Microstrip, target, &thin).unwrap();
    assert!(geometry.warnings.iter().any(|w| matches!(
        w,
        SynthesisWarning::BelowManufacturingLimit { dimension: Dimension::TraceWidth, .. }
    )));

    let strict = SynthesisConfig {
        block_on_manufacturing_limit: true,
        ..SynthesisConfig::default()
    };
    let err = GeometrySynthesizer::new(StructureKind::Microstrip, strict)
        .synthesize(&target, &thin)
        .unwrap_err();
    assert!(matches!(err, RfError::BelowManufacturingLimit { .. }));
}
