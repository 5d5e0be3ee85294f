//! Closed-form RF design equations.
//!
//! All lengths are in millimetres unless a name says otherwise. Microstrip formulas are
//! Hammerstad–Jensen with a Bahl–Garg strip-thickness correction, patch formulas follow the
//! transmission-line and cavity models, and the coplanar formulas use complete elliptic
//! integral ratios evaluated through the arithmetic-geometric mean.

use std::f64::consts::PI;

use crate::utils::error::{Result, RfError};

/// Speed of light in vacuum, m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;
/// Impedance of free space, Ω.
pub const FREE_SPACE_IMPEDANCE: f64 = 376.730_313_668;

/// Validity range of the Hammerstad–Jensen fit in `W/h`.
pub const MICROSTRIP_MIN_RATIO: f64 = 0.01;
pub const MICROSTRIP_MAX_RATIO: f64 = 100.0;
/// Range searched for the GCPW strip width, as multiples of the substrate height.
pub const GCPW_MIN_RATIO: f64 = 0.02;
pub const GCPW_MAX_RATIO: f64 = 20.0;

pub fn wavelength_mm(frequency_hz: f64, permittivity: f64) -> f64 {
    SPEED_OF_LIGHT / (frequency_hz * permittivity.sqrt()) * 1e3
}

fn hammerstad_z01(u: f64) -> f64 {
    let f = 6.0 + (2.0 * PI - 6.0) * (-(30.666 / u).powf(0.7528)).exp();
    FREE_SPACE_IMPEDANCE / (2.0 * PI) * (f / u + (1.0 + (2.0 / u).powi(2)).sqrt()).ln()
}

fn hammerstad_eeff(u: f64, er: f64) -> f64 {
    let a = 1.0
        + ((u.powi(4) + (u / 52.0).powi(2)) / (u.powi(4) + 0.432)).ln() / 49.0
        + (1.0 + (u / 18.1).powi(3)).ln() / 18.7;
    let b = 0.564 * ((er - 0.9) / (er + 3.0)).powf(0.053);
    (er + 1.0) / 2.0 + (er - 1.0) / 2.0 * (1.0 + 10.0 / u).powf(-a * b)
}

/// Strip width widened for copper thickness `t` (Bahl–Garg).
fn effective_width(w: f64, h: f64, t: f64) -> f64 {
    if t <= 0.0 {
        return w;
    }
    if w / h >= 1.0 / (2.0 * PI) {
        w + 1.25 * t / PI * (1.0 + (2.0 * h / t).ln())
    } else {
        w + 1.25 * t / PI * (1.0 + (4.0 * PI * w / t).ln())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineParameters {
    pub impedance_ohms: f64,
    pub effective_permittivity: f64,
}

pub fn microstrip(width_mm: f64, height_mm: f64, thickness_mm: f64, er: f64) -> LineParameters {
    let u = effective_width(width_mm, height_mm, thickness_mm) / height_mm;
    let eeff = hammerstad_eeff(u, er);
    LineParameters {
        impedance_ohms: hammerstad_z01(u) / eeff.sqrt(),
        effective_permittivity: eeff,
    }
}

/// Wheeler/Pozar `W/h` for a zero-thickness strip.
pub fn microstrip_initial_ratio(z0: f64, er: f64) -> f64 {
    let a = z0 / 60.0 * ((er + 1.0) / 2.0).sqrt() + (er - 1.0) / (er + 1.0) * (0.23 + 0.11 / er);
    let narrow = 8.0 * a.exp() / ((2.0 * a).exp() - 2.0);
    if narrow < 2.0 {
        return narrow;
    }
    let b = FREE_SPACE_IMPEDANCE * PI / (2.0 * z0 * er.sqrt());
    2.0 / PI
        * (b - 1.0 - (2.0 * b - 1.0).ln()
            + (er - 1.0) / (2.0 * er) * ((b - 1.0).ln() + 0.39 - 0.61 / er))
}

/// Dielectric attenuation of a microstrip line in Np/m.
pub fn microstrip_dielectric_loss(frequency_hz: f64, er: f64, eeff: f64, loss_tangent: f64) -> f64 {
    if er <= 1.0 {
        return 0.0;
    }
    let k0 = 2.0 * PI * frequency_hz / SPEED_OF_LIGHT;
    k0 * er * (eeff - 1.0) * loss_tangent / (2.0 * eeff.sqrt() * (er - 1.0))
}

/// Arithmetic-geometric mean.
pub fn agm(mut a: f64, mut b: f64) -> f64 {
    for _ in 0..64 {
        if (a - b).abs() <= 1e-15 * a.abs() {
            break;
        }
        let next = 0.5 * (a + b);
        b = (a * b).sqrt();
        a = next;
    }
    a
}

/// `K(k) / K(k')` with `k' = √(1 − k²)`.
pub fn elliptic_ratio(k: f64) -> f64 {
    let kp = (1.0 - k * k).sqrt();
    agm(1.0, k) / agm(1.0, kp)
}

/// Conductor-backed coplanar waveguide.
pub fn gcpw(width_mm: f64, gap_mm: f64, height_mm: f64, er: f64) -> LineParameters {
    let k = width_mm / (width_mm + 2.0 * gap_mm);
    let k3 = (PI * width_mm / (4.0 * height_mm)).tanh()
        / (PI * (width_mm + 2.0 * gap_mm) / (4.0 * height_mm)).tanh();
    let r1 = elliptic_ratio(k);
    let r3 = elliptic_ratio(k3);
    let q = r3 / r1;
    let eeff = (1.0 + er * q) / (1.0 + q);
    LineParameters {
        impedance_ohms: 60.0 * PI / eeff.sqrt() / (r1 + r3),
        effective_permittivity: eeff,
    }
}

/// Bessel function of the first kind, order zero, from its integral representation.
pub fn bessel_j0(x: f64) -> f64 {
    // The integrand is smooth and periodic, so the trapezoid rule converges quickly.
    const STEPS: usize = 256;
    let h = PI / STEPS as f64;
    let interior: f64 = (1..STEPS).map(|i| (x * (i as f64 * h).sin()).cos()).sum();
    (interior + 1.0) * h / PI
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatchDimensions {
    pub width_mm: f64,
    pub effective_permittivity: f64,
    pub length_extension_mm: f64,
}

pub fn patch_width(frequency_hz: f64, er: f64) -> f64 {
    SPEED_OF_LIGHT / (2.0 * frequency_hz) * (2.0 / (er + 1.0)).sqrt() * 1e3
}

/// Width, effective permittivity and fringing extension ΔL for a patch at `frequency_hz`.
pub fn patch_dimensions(frequency_hz: f64, height_mm: f64, er: f64) -> PatchDimensions {
    patch_fringing(patch_width(frequency_hz, er), height_mm, er)
}

/// Effective permittivity and fringing extension for a patch of given width.
pub fn patch_fringing(w: f64, height_mm: f64, er: f64) -> PatchDimensions {
    let eeff = (er + 1.0) / 2.0 + (er - 1.0) / 2.0 * (1.0 + 12.0 * height_mm / w).powf(-0.5);
    let wh = w / height_mm;
    let dl = 0.412 * height_mm * (eeff + 0.3) * (wh + 0.264) / ((eeff - 0.258) * (wh + 0.8));
    PatchDimensions {
        width_mm: w,
        effective_permittivity: eeff,
        length_extension_mm: dl,
    }
}

/// First-order length estimate.
pub fn patch_length(frequency_hz: f64, dims: &PatchDimensions) -> f64 {
    SPEED_OF_LIGHT / (2.0 * frequency_hz * dims.effective_permittivity.sqrt()) * 1e3
        - 2.0 * dims.length_extension_mm
}

/// TM010 resonance of a patch of physical length `length_mm`.
pub fn patch_resonance(length_mm: f64, dims: &PatchDimensions) -> f64 {
    SPEED_OF_LIGHT
        / (2.0 * (length_mm + 2.0 * dims.length_extension_mm) * 1e-3
            * dims.effective_permittivity.sqrt())
}

fn simpson(n: usize, a: f64, b: f64, f: impl Fn(f64) -> f64) -> f64 {
    let n = if n % 2 == 0 { n } else { n + 1 };
    let h = (b - a) / n as f64;
    let mut sum = f(a) + f(b);
    for i in 1..n {
        let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += weight * f(a + i as f64 * h);
    }
    sum * h / 3.0
}

/// Radiating-slot conductance G1 and mutual conductance G12, in siemens.
pub fn slot_conductances(frequency_hz: f64, width_mm: f64, length_mm: f64) -> (f64, f64) {
    let k0 = 2.0 * PI * frequency_hz / SPEED_OF_LIGHT;
    let half_kw = k0 * width_mm * 1e-3 / 2.0;
    let kl = k0 * length_mm * 1e-3;
    let slot = move |theta: f64| {
        let c = theta.cos();
        let term = if c.abs() < 1e-12 {
            half_kw
        } else {
            (half_kw * c).sin() / c
        };
        term * term * theta.sin().powi(3)
    };
    let scale = 1.0 / (120.0 * PI * PI);
    let g1 = scale * simpson(400, 0.0, PI, slot);
    let g12 = scale * simpson(400, 0.0, PI, |theta| slot(theta) * bessel_j0(kl * theta.sin()));
    (g1, g12)
}

/// Input resistance at the radiating edge.
pub fn patch_edge_resistance(frequency_hz: f64, width_mm: f64, length_mm: f64) -> f64 {
    let (g1, g12) = slot_conductances(frequency_hz, width_mm, length_mm);
    1.0 / (2.0 * (g1 + g12))
}

/// Inset depth at which the input resistance drops to `feed_impedance`.
pub fn inset_depth(length_mm: f64, edge_resistance: f64, feed_impedance: f64) -> Option<f64> {
    if feed_impedance <= 0.0 || feed_impedance > edge_resistance {
        return None;
    }
    Some(length_mm / PI * (feed_impedance / edge_resistance).sqrt().acos())
}

/// Input resistance at inset depth `y0`.
pub fn inset_resistance(length_mm: f64, edge_resistance: f64, y0_mm: f64) -> f64 {
    edge_resistance * (PI * y0_mm / length_mm).cos().powi(2)
}

/// Clearance between the inset feed and the patch.
pub fn notch_gap_mm(frequency_hz: f64, eeff: f64) -> f64 {
    SPEED_OF_LIGHT / (2.0 * eeff).sqrt() * 4.65e-12 / (frequency_hz * 1e-9) * 1e3
}

/// Radiation quality factor of a thin patch.
pub fn patch_radiation_q(frequency_hz: f64, height_mm: f64, eeff: f64) -> f64 {
    SPEED_OF_LIGHT * eeff.sqrt() / (4.0 * frequency_hz * height_mm * 1e-3)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refinement {
    pub value: f64,
    pub iterations: usize,
    pub residual: f64,
}

/// Solves `model(x) = target` on `[lo, hi]`, starting at `x0`.
///
/// Newton steps use a central-difference slope. A step that leaves the current bracket, or a
/// flat slope, falls back to bisection. The bracket is tightened every iteration, so the
/// method cannot cycle.
pub fn refine(
    parameter: &str,
    model: impl Fn(f64) -> f64,
    target: f64,
    x0: f64,
    (mut lo, mut hi): (f64, f64),
    tolerance: f64,
    max_iterations: usize,
) -> Result<Refinement> {
    let residual = |x: f64| model(x) - target;
    let r_lo = residual(lo);
    let r_hi = residual(hi);
    if !(r_lo.is_finite() && r_hi.is_finite()) || r_lo.signum() == r_hi.signum() {
        return Err(RfError::UnachievableTarget {
            parameter: parameter.to_string(),
            value: format!("{}", target),
            reason: format!(
                "model range is {:.4}..{:.4}",
                model(lo).min(model(hi)),
                model(lo).max(model(hi))
            ),
        });
    }
    let lo_sign = r_lo.signum();

    let mut x = x0.clamp(lo, hi);
    let mut r = residual(x);
    for iteration in 0..=max_iterations {
        if r.abs() <= tolerance {
            return Ok(Refinement {
                value: x,
                iterations: iteration,
                residual: r,
            });
        }
        if iteration == max_iterations {
            break;
        }
        if r.signum() == lo_sign {
            lo = x;
        } else {
            hi = x;
        }

        let step = 1e-6 * x.abs().max(1e-9);
        let slope = (residual(x + step) - residual(x - step)) / (2.0 * step);
        let newton = x - r / slope;
        x = if slope != 0.0 && newton.is_finite() && newton > lo && newton < hi {
            newton
        } else {
            0.5 * (lo + hi)
        };
        r = residual(x);
    }

    Err(RfError::ConvergenceFailure {
        parameter: parameter.to_string(),
        iterations: max_iterations,
        best_estimate: x,
        residual: r,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bessel_j0_known_values() {
        assert_relative_eq!(bessel_j0(0.0), 1.0, epsilon = 1e-12);
        assert!(bessel_j0(2.404_825_557_7).abs() < 1e-9);
        assert_relative_eq!(bessel_j0(1.0), 0.765_197_686_6, epsilon = 1e-9);
    }

    #[test]
    fn test_elliptic_ratio_symmetric_point() {
        assert_relative_eq!(elliptic_ratio(std::f64::consts::FRAC_1_SQRT_2), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_fr4_microstrip_width_is_about_three_mm() {
        let ratio = microstrip_initial_ratio(50.0, 4.3);
        let w = ratio * 1.6;
        assert!(w > 2.8 && w < 3.4, "w = {}", w);
        let line = microstrip(w, 1.6, 0.035, 4.3);
        assert!((line.impedance_ohms - 50.0).abs() < 3.0);
        assert!(line.effective_permittivity > 1.0 && line.effective_permittivity < 4.3);
    }

    #[test]
    fn test_microstrip_impedance_falls_with_width() {
        let narrow = microstrip(0.5, 1.6, 0.035, 4.3).impedance_ohms;
        let wide = microstrip(5.0, 1.6, 0.035, 4.3).impedance_ohms;
        assert!(narrow > wide);
    }

    #[test]
    fn test_gcpw_impedance_falls_with_width() {
        let narrow = gcpw(0.3, 0.2, 1.6, 4.3).impedance_ohms;
        let wide = gcpw(3.0, 0.2, 1.6, 4.3).impedance_ohms;
        assert!(narrow > wide);
        assert!(wide > 10.0 && narrow < 200.0);
    }

    #[test]
    fn test_patch_dimensions_at_2g45_on_fr4() {
        let dims = patch_dimensions(2.45e9, 1.6, 4.3);
        assert_relative_eq!(dims.width_mm, 37.58, epsilon = 0.05);
        let length = patch_length(2.45e9, &dims);
        assert!(length > 28.5 && length < 29.8, "length = {}", length);
        assert_relative_eq!(patch_resonance(length, &dims), 2.45e9, max_relative = 1e-9);
    }

    #[test]
    fn test_inset_depth_matches_requested_resistance() {
        let dims = patch_dimensions(2.45e9, 1.6, 4.3);
        let length = patch_length(2.45e9, &dims);
        let edge = patch_edge_resistance(2.45e9, dims.width_mm, length);
        assert!(edge > 100.0 && edge < 600.0, "edge = {}", edge);
        let y0 = inset_depth(length, edge, 50.0).unwrap();
        assert!(y0 > 0.0 && y0 < length / 2.0);
        assert_relative_eq!(inset_resistance(length, edge, y0), 50.0, epsilon = 1e-9);
        assert!(inset_depth(length, edge, edge * 2.0).is_none());
    }

    #[test]
    fn test_refine_solves_monotone_model() {
        let result = refine("x", |x| x * x, 2.0, 1.0, (0.0, 4.0), 1e-10, 50).unwrap();
        assert_relative_eq!(result.value, 2f64.sqrt(), epsilon = 1e-9);
        assert!(result.iterations < 10);
    }

    #[test]
    fn test_refine_rejects_target_outside_bracket() {
        let err = refine("x", |x| x, 10.0, 1.0, (0.0, 4.0), 1e-6, 50).unwrap_err();
        assert!(matches!(err, RfError::UnachievableTarget { .. }));
    }

    #[test]
    fn test_refine_reports_budget_exhaustion() {
        let err = refine("x", |x| x.powi(3), 2.0, 0.1, (0.0, 4.0), 0.0, 2).unwrap_err();
        match err {
            RfError::ConvergenceFailure { iterations, .. } => assert_eq!(iterations, 2),
            other => panic!("unexpected {:?}", other),
        }
    }
}
