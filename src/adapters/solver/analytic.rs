use async_trait::async_trait;
use num_complex::Complex64;
use std::f64::consts::PI;

use crate::core::context::{CancelSignal, ExecutionContext};
use crate::core::equations::{
    gcpw, inset_resistance, microstrip, microstrip_dielectric_loss, patch_edge_resistance,
    patch_fringing, patch_radiation_q, patch_resonance, SPEED_OF_LIGHT,
};
use crate::domain::model::StructureKind;
use crate::domain::ports::SolverBackend;
use crate::domain::simulation::{
    FarFieldSample, SParameterTrace, SimulationDomain, SimulationResult, SolverConfiguration,
};
use crate::utils::error::{Result, RfError};

/// Relative power radiated behind the ground plane.
const BACK_LOBE_LEVEL: f64 = 1e-2;
/// Grid used to integrate the pattern for directivity, in degrees.
const INTEGRATION_STEP_DEG: f64 = 1.0;

/// Reduced-order backend: lines as lossy transmission-line two-ports, the patch as a
/// parallel RLC resonator with a cavity-model pattern.
///
/// The scale factors stand in for the discrepancy between closed-form design equations and a
/// full-wave solution, so the feedback loop has something to correct.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyticSolver {
    impedance_scale: f64,
    frequency_scale: f64,
}

impl Default for AnalyticSolver {
    fn default() -> Self {
        Self::new(1.0, 1.0)
    }
}

fn attribute(domain: &SimulationDomain, key: &str) -> Result<f64> {
    domain
        .attributes
        .get(key)
        .copied()
        .ok_or_else(|| RfError::DegenerateGeometry {
            reason: format!("domain '{}' has no '{}' attribute", domain.name, key),
        })
}

impl AnalyticSolver {
    pub fn new(impedance_scale: f64, frequency_scale: f64) -> Self {
        Self {
            impedance_scale,
            frequency_scale,
        }
    }

    fn line(&self, domain: &SimulationDomain, freqs: &[f64], z0: f64, input: u32) -> Result<Vec<SParameterTrace>> {
        let h = attribute(domain, "substrate_height_mm")?;
        let er = attribute(domain, "substrate_permittivity")?;
        let tan_d = attribute(domain, "substrate_loss_tangent")?;
        let width = attribute(domain, "trace_width_mm")?;
        let length_m = attribute(domain, "trace_length_mm")? * 1e-3;
        let params = match domain.structure {
            StructureKind::Gcpw => gcpw(width, attribute(domain, "gap_width_mm")?, h, er),
            _ => microstrip(width, h, attribute(domain, "copper_thickness_mm")?, er),
        };
        let zc = params.impedance_ohms * self.impedance_scale;
        let eeff = params.effective_permittivity;

        let (mut s11, mut s21) = (Vec::with_capacity(freqs.len()), Vec::with_capacity(freqs.len()));
        for &f in freqs {
            let alpha = microstrip_dielectric_loss(f, er, eeff, tan_d);
            let beta = 2.0 * PI * f * eeff.sqrt() / SPEED_OF_LIGHT;
            let gl = Complex64::new(alpha, beta) * length_m;
            let (a, b, c) = (gl.cosh(), zc * gl.sinh(), gl.sinh() / zc);
            let denom = 2.0 * a + b / z0 + c * z0;
            s11.push((b / z0 - c * z0) / denom);
            s21.push(Complex64::new(2.0, 0.0) / denom);
        }

        let mut traces = vec![SParameterTrace {
            port_out: input,
            port_in: input,
            values: s11,
        }];
        for port in domain.ports.iter().filter(|p| p.number != input) {
            traces.push(SParameterTrace {
                port_out: port.number,
                port_in: input,
                values: s21.clone(),
            });
        }
        Ok(traces)
    }

    fn patch(
        &self,
        config: &SolverConfiguration,
        freqs: &[f64],
        z0: f64,
        input: u32,
    ) -> Result<(Vec<SParameterTrace>, Option<Vec<FarFieldSample>>)> {
        let domain = &config.domain;
        let h = attribute(domain, "substrate_height_mm")?;
        let er = attribute(domain, "substrate_permittivity")?;
        let tan_d = attribute(domain, "substrate_loss_tangent")?;
        let w = attribute(domain, "patch_width_mm")?;
        let l = attribute(domain, "patch_length_mm")?;
        let inset = attribute(domain, "feed_inset_length_mm")?;

        let dims = patch_fringing(w, h, er);
        let fr = patch_resonance(l, &dims) * self.frequency_scale;
        let rin = inset_resistance(l, patch_edge_resistance(fr, w, l), inset);
        let q_rad = patch_radiation_q(fr, h, dims.effective_permittivity);
        let q = 1.0 / (1.0 / q_rad + tan_d);
        tracing::debug!(
            "Patch model: f_r = {:.4} GHz, R_in = {:.2} Ω, Q = {:.1}",
            fr / 1e9,
            rin,
            q
        );

        let values = freqs
            .iter()
            .map(|&f| {
                let detune = Complex64::new(1.0, q * (f / fr - fr / f));
                let zin = rin / detune;
                (zin - z0) / (zin + z0)
            })
            .collect();
        let traces = vec![SParameterTrace {
            port_out: input,
            port_in: input,
            values,
        }];

        let far_field = config
            .far_field_step_deg
            .map(|step| patch_pattern(fr, w, l + 2.0 * dims.length_extension_mm, q / q_rad, step));
        Ok((traces, far_field))
    }
}

/// Normalized radiated power of two slots of width `w` spaced `l` apart over a ground plane.
fn slot_pair_power(k0: f64, w_m: f64, l_m: f64, theta: f64, phi: f64) -> f64 {
    if theta > PI / 2.0 {
        return BACK_LOBE_LEVEL;
    }
    let (st, ct) = theta.sin_cos();
    let (sp, cp) = phi.sin_cos();
    let x = k0 * w_m / 2.0 * st * sp;
    let aperture = if x.abs() < 1e-12 { 1.0 } else { x.sin() / x };
    let array = (k0 * l_m / 2.0 * st * cp).cos();
    let e = aperture * array;
    (e * e * (cp * cp + ct * ct * sp * sp)).max(BACK_LOBE_LEVEL * 1e-4)
}

/// Gain samples on a regular theta/phi grid. The peak sits at broadside with power 1.
pub fn patch_pattern(
    frequency_hz: f64,
    width_mm: f64,
    effective_length_mm: f64,
    efficiency: f64,
    step_deg: f64,
) -> Vec<FarFieldSample> {
    let k0 = 2.0 * PI * frequency_hz / SPEED_OF_LIGHT;
    let (w, l) = (width_mm * 1e-3, effective_length_mm * 1e-3);
    let power = |theta: f64, phi: f64| slot_pair_power(k0, w, l, theta, phi);

    let d = INTEGRATION_STEP_DEG.to_radians();
    let n_theta = (180.0 / INTEGRATION_STEP_DEG).round() as usize;
    let n_phi = (360.0 / INTEGRATION_STEP_DEG).round() as usize;
    let mut total = 0.0;
    for i in 0..n_theta {
        let theta = (i as f64 + 0.5) * d;
        for j in 0..n_phi {
            let phi = (j as f64 + 0.5) * d;
            total += power(theta, phi) * theta.sin() * d * d;
        }
    }
    let directivity = 4.0 * PI * power(0.0, 0.0) / total;

    let step = step_deg.clamp(0.5, 90.0);
    let steps_theta = (180.0 / step).round() as usize;
    let steps_phi = (360.0 / step).round() as usize;
    let mut samples = Vec::with_capacity((steps_theta + 1) * steps_phi);
    for i in 0..=steps_theta {
        let theta_deg = i as f64 * 180.0 / steps_theta as f64;
        for j in 0..steps_phi {
            let phi_deg = j as f64 * 360.0 / steps_phi as f64;
            let p = power(theta_deg.to_radians(), phi_deg.to_radians());
            samples.push(FarFieldSample {
                theta_deg,
                phi_deg,
                gain_dbi: 10.0 * (efficiency * directivity * p).log10(),
            });
        }
    }
    samples
}

#[async_trait]
impl SolverBackend for AnalyticSolver {
    fn name(&self) -> &str {
        "analytic"
    }

    async fn invoke(
        &self,
        config: &SolverConfiguration,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> Result<SimulationResult> {
        if cancel.is_cancelled() {
            return Err(RfError::SolverInvocationError {
                message: "cancelled before start".to_string(),
                diagnostics: String::new(),
            });
        }
        let domain = &config.domain;
        let excited = domain
            .excited_ports()
            .next()
            .ok_or_else(|| RfError::DegenerateGeometry {
                reason: format!("domain '{}' has no excited port", domain.name),
            })?;
        let z0 = excited.reference_impedance;
        let freqs = domain.frequency_range.samples();

        let (s_parameters, far_field) = match domain.structure {
            StructureKind::Microstrip | StructureKind::Gcpw => {
                (self.line(domain, &freqs, z0, excited.number)?, None)
            }
            StructureKind::Patch => self.patch(config, &freqs, z0, excited.number)?,
        };

        let solver_log = format!(
            "analytic model for '{}' ({}), {} samples, impedance scale {}, frequency scale {}",
            domain.name,
            domain.structure,
            freqs.len(),
            self.impedance_scale,
            self.frequency_scale
        );
        tracing::debug!("{} [run {}]", solver_log, ctx.run_id());

        Ok(SimulationResult {
            frequencies_hz: freqs,
            reference_impedance: z0,
            s_parameters,
            far_field,
            solver_log,
        })
    }
}
