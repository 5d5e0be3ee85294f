use num_complex::Complex64;

use crate::domain::model::TargetParameter;
use crate::domain::simulation::{DesignMetrics, FarFieldMetrics, FarFieldSample, SimulationResult};
use crate::utils::error::{Result, RfError};

/// Largest VSWR reported; total reflection maps here instead of infinity.
pub const VSWR_CAP: f64 = 1e6;

/// Turns raw S-parameters into figures of merit.
#[derive(Debug, Clone, Copy)]
pub struct ResultAnalyzer {
    /// Bandwidth is the span where |S11| stays below `-return_loss_threshold_db`.
    return_loss_threshold_db: f64,
}

impl Default for ResultAnalyzer {
    fn default() -> Self {
        Self::new(10.0)
    }
}

pub fn to_db(magnitude: f64) -> f64 {
    20.0 * magnitude.max(1e-15).log10()
}

impl ResultAnalyzer {
    pub fn new(return_loss_threshold_db: f64) -> Self {
        Self {
            return_loss_threshold_db,
        }
    }

    pub fn analyze(&self, result: &SimulationResult, target_frequency_hz: f64) -> Result<DesignMetrics> {
        let port = input_port(result)?;
        let s11 = result.s(port, port).ok_or_else(|| incomplete(result, "no reflection trace"))?;
        let freqs = &result.frequencies_hz;
        if freqs.len() < 2 {
            return Err(incomplete(result, "fewer than two frequency samples"));
        }
        if let Some(trace) = result.s_parameters.iter().find(|t| t.values.len() != freqs.len()) {
            return Err(incomplete(
                result,
                &format!(
                    "S{}{} has {} of {} samples",
                    trace.port_out,
                    trace.port_in,
                    trace.values.len(),
                    freqs.len()
                ),
            ));
        }
        let z0 = result.reference_impedance;
        let s11_db: Vec<f64> = s11.iter().map(|s| to_db(s.norm())).collect();

        let (min_index, min_db) = s11_db
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| incomplete(result, "empty reflection trace"))?;
        let (resonant_frequency_hz, min_s11_db) = parabolic_minimum(freqs, &s11_db, min_index)
            .unwrap_or((freqs[min_index], min_db));

        let gamma = interpolate(freqs, s11, target_frequency_hz);
        let input_impedance = z0 * (Complex64::new(1.0, 0.0) + gamma) / (Complex64::new(1.0, 0.0) - gamma);
        let magnitude = gamma.norm();
        let vswr = if magnitude >= 1.0 {
            VSWR_CAP
        } else {
            ((1.0 + magnitude) / (1.0 - magnitude)).min(VSWR_CAP)
        };

        let line_impedance_ohms = other_port(result, port).and_then(|other| {
            let s21 = result.s(other, port)?;
            let t = interpolate(freqs, s21, target_frequency_hz);
            Some(line_impedance(gamma, t, z0))
        });

        let band_edges_hz = self.band_edges(freqs, &s11_db, min_index);

        Ok(DesignMetrics {
            target_frequency_hz,
            min_s11_db,
            resonant_frequency_hz,
            return_loss_at_target_db: -to_db(magnitude),
            input_impedance_at_target: input_impedance,
            vswr_at_target: vswr,
            line_impedance_ohms,
            bandwidth_hz: band_edges_hz.map(|(lo, hi)| hi - lo),
            band_edges_hz,
            far_field: result.far_field.as_deref().and_then(far_field_metrics),
        })
    }

    /// Contiguous span around the S11 minimum that meets the return-loss threshold.
    fn band_edges(&self, freqs: &[f64], s11_db: &[f64], min_index: usize) -> Option<(f64, f64)> {
        let limit = -self.return_loss_threshold_db;
        if s11_db[min_index] > limit {
            return None;
        }
        let crossing = |i: usize, j: usize| {
            let t = (limit - s11_db[i]) / (s11_db[j] - s11_db[i]);
            freqs[i] + t * (freqs[j] - freqs[i])
        };

        let mut lo = min_index;
        while lo > 0 && s11_db[lo - 1] <= limit {
            lo -= 1;
        }
        let low_edge = if lo == 0 { freqs[0] } else { crossing(lo - 1, lo) };

        let mut hi = min_index;
        while hi + 1 < s11_db.len() && s11_db[hi + 1] <= limit {
            hi += 1;
        }
        let high_edge = if hi + 1 == s11_db.len() {
            freqs[hi]
        } else {
            crossing(hi, hi + 1)
        };
        Some((low_edge, high_edge))
    }
}

/// Value of the controlled parameter in a set of metrics.
pub fn measured_parameter(metrics: &DesignMetrics, parameter: TargetParameter) -> Result<f64> {
    match parameter {
        TargetParameter::ResonantFrequency => Ok(metrics.resonant_frequency_hz),
        TargetParameter::Impedance => metrics.line_impedance_ohms.ok_or_else(|| {
            RfError::IncompleteResult {
                message: "line impedance needs a transmission trace".to_string(),
                diagnostics: String::new(),
            }
        }),
    }
}

fn incomplete(result: &SimulationResult, message: &str) -> RfError {
    RfError::IncompleteResult {
        message: message.to_string(),
        diagnostics: result.solver_log.clone(),
    }
}

fn input_port(result: &SimulationResult) -> Result<u32> {
    result
        .s_parameters
        .iter()
        .filter(|t| t.port_in == t.port_out)
        .map(|t| t.port_in)
        .min()
        .ok_or_else(|| incomplete(result, "no reflection trace"))
}

fn other_port(result: &SimulationResult, port: u32) -> Option<u32> {
    result
        .s_parameters
        .iter()
        .filter(|t| t.port_in == port && t.port_out != port)
        .map(|t| t.port_out)
        .min()
}

/// Characteristic impedance of a symmetric line from its two-port S-parameters.
pub fn line_impedance(s11: Complex64, s21: Complex64, z0: f64) -> f64 {
    let one = Complex64::new(1.0, 0.0);
    let num = (one + s11).powi(2) - s21.powi(2);
    let den = (one - s11).powi(2) - s21.powi(2);
    (z0 * (num / den).sqrt()).re
}

fn interpolate(freqs: &[f64], values: &[Complex64], f: f64) -> Complex64 {
    if f <= freqs[0] {
        return values[0];
    }
    let last = freqs.len() - 1;
    if f >= freqs[last] {
        return values[last];
    }
    let i = freqs.partition_point(|x| *x <= f).saturating_sub(1).min(last - 1);
    let t = (f - freqs[i]) / (freqs[i + 1] - freqs[i]);
    values[i] + (values[i + 1] - values[i]) * t
}

/// Vertex of the parabola through the minimum and its neighbours.
fn parabolic_minimum(freqs: &[f64], db: &[f64], i: usize) -> Option<(f64, f64)> {
    if i == 0 || i + 1 >= db.len() {
        return None;
    }
    let (y0, y1, y2) = (db[i - 1], db[i], db[i + 1]);
    let denom = y0 - 2.0 * y1 + y2;
    if denom <= 0.0 {
        return None;
    }
    let h = freqs[i + 1] - freqs[i];
    let offset = 0.5 * (y0 - y2) / denom;
    Some((freqs[i] + offset * h, y1 - 0.25 * (y0 - y2) * offset))
}

fn far_field_metrics(samples: &[FarFieldSample]) -> Option<FarFieldMetrics> {
    let peak = samples
        .iter()
        .filter(|s| s.gain_dbi.is_finite())
        .max_by(|a, b| a.gain_dbi.total_cmp(&b.gain_dbi))?;
    Some(FarFieldMetrics {
        peak_gain_dbi: peak.gain_dbi,
        peak_theta_deg: peak.theta_deg,
        peak_phi_deg: peak.phi_deg,
        beamwidth_phi0_deg: plane_beamwidth(samples, 0.0),
        beamwidth_phi90_deg: plane_beamwidth(samples, 90.0),
    })
}

/// -3 dB beamwidth in the plane `phi` / `phi + 180°`, theta signed across the zenith.
fn plane_beamwidth(samples: &[FarFieldSample], phi: f64) -> Option<f64> {
    let same = |a: f64, b: f64| ((a - b).rem_euclid(360.0)).min((b - a).rem_euclid(360.0)) < 1e-6;
    let mut cut: Vec<(f64, f64)> = samples
        .iter()
        .filter_map(|s| {
            if same(s.phi_deg, phi) {
                Some((s.theta_deg, s.gain_dbi))
            } else if same(s.phi_deg, phi + 180.0) {
                Some((-s.theta_deg, s.gain_dbi))
            } else {
                None
            }
        })
        .collect();
    cut.sort_by(|a, b| a.0.total_cmp(&b.0));
    cut.dedup_by(|a, b| (a.0 - b.0).abs() < 1e-9);

    let (peak_index, &(_, peak)) = cut
        .iter()
        .enumerate()
        .max_by(|a, b| a.1 .1.total_cmp(&b.1 .1))?;
    let level = peak - 3.0;
    let edge = |i: usize, j: usize| {
        let (t0, g0) = cut[i];
        let (t1, g1) = cut[j];
        t0 + (level - g0) / (g1 - g0) * (t1 - t0)
    };

    let left = (0..peak_index).rev().find(|&i| cut[i].1 < level)?;
    let right = (peak_index + 1..cut.len()).find(|&i| cut[i].1 < level)?;
    Some(edge(right - 1, right) - edge(left + 1, left))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::simulation::SParameterTrace;
    use approx::assert_relative_eq;

    fn one_port(freqs: Vec<f64>, gammas: Vec<Complex64>) -> SimulationResult {
        SimulationResult {
            frequencies_hz: freqs,
            reference_impedance: 50.0,
            s_parameters: vec![SParameterTrace {
                port_out: 1,
                port_in: 1,
                values: gammas,
            }],
            far_field: None,
            solver_log: String::new(),
        }
    }

    #[test]
    fn test_matched_load_metrics() {
        let freqs = vec![1.0e9, 2.0e9, 3.0e9];
        let result = one_port(freqs, vec![Complex64::new(0.0, 0.0); 3]);
        let metrics = ResultAnalyzer::default().analyze(&result, 2.0e9).unwrap();
        assert_relative_eq!(metrics.input_impedance_at_target.re, 50.0, epsilon = 1e-9);
        assert_relative_eq!(metrics.vswr_at_target, 1.0, epsilon = 1e-12);
        assert_eq!(metrics.bandwidth_hz, Some(2.0e9));
    }

    #[test]
    fn test_resonance_is_interpolated_between_samples() {
        // |S11| in dB is a parabola with its vertex at 2.05 GHz.
        let freqs: Vec<f64> = (0..11).map(|i| 1.5e9 + 0.1e9 * i as f64).collect();
        let gammas = freqs
            .iter()
            .map(|f| {
                let x = (f - 2.05e9) / 1e8;
                Complex64::new(10f64.powf((-30.0 + 4.0 * x * x) / 20.0), 0.0)
            })
            .collect();
        let metrics = ResultAnalyzer::default().analyze(&one_port(freqs, gammas), 2.0e9).unwrap();
        assert_relative_eq!(metrics.resonant_frequency_hz, 2.05e9, max_relative = 1e-9);
        assert_relative_eq!(metrics.min_s11_db, -30.0, epsilon = 1e-9);
        let (lo, hi) = metrics.band_edges_hz.unwrap();
        assert!(lo < 2.05e9 && hi > 2.05e9);
    }

    #[test]
    fn test_line_impedance_of_mismatched_line() {
        // Quarter-wave 75 Ω line between 50 Ω ports.
        let z0 = 50.0;
        let zc: f64 = 75.0;
        let one = Complex64::new(1.0, 0.0);
        let j = Complex64::new(0.0, 1.0);
        let (a, b, c, d) = (0.0 * one, j * zc, j / zc, 0.0 * one);
        let denom = a + b / z0 + c * z0 + d;
        let s11 = (a + b / z0 - c * z0 - d) / denom;
        let s21 = 2.0 / denom;
        assert_relative_eq!(line_impedance(s11, s21, z0), 75.0, epsilon = 1e-9);
    }

    #[test]
    fn test_beamwidth_of_cosine_pattern() {
        let mut samples = Vec::new();
        for phi in [0.0, 90.0, 180.0, 270.0] {
            for step in 0..=18 {
                let theta = 5.0 * step as f64;
                let power = (theta.to_radians().cos()).powi(2).max(1e-12);
                samples.push(FarFieldSample {
                    theta_deg: theta,
                    phi_deg: phi,
                    gain_dbi: 6.0 + 10.0 * power.log10(),
                });
            }
        }
        let metrics = far_field_metrics(&samples).unwrap();
        assert_relative_eq!(metrics.peak_gain_dbi, 6.0, epsilon = 1e-12);
        let bw = metrics.beamwidth_phi0_deg.unwrap();
        assert!((bw - 90.0).abs() < 2.0, "beamwidth {}", bw);
    }

    #[test]
    fn test_truncated_transmission_trace_is_incomplete() {
        let freqs = vec![2.3e9, 2.4e9, 2.5e9];
        let mut result = one_port(freqs, vec![Complex64::new(0.1, 0.0); 3]);
        result.s_parameters.push(SParameterTrace {
            port_out: 2,
            port_in: 1,
            values: vec![Complex64::new(0.0, -0.9)],
        });
        let err = ResultAnalyzer::default().analyze(&result, 2.4e9).unwrap_err();
        match err {
            RfError::IncompleteResult { message, .. } => assert!(message.contains("S21"), "{}", message),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_single_sample_is_incomplete() {
        let result = one_port(vec![2.4e9], vec![Complex64::new(0.1, 0.0)]);
        assert!(matches!(
            ResultAnalyzer::default().analyze(&result, 2.4e9),
            Err(RfError::IncompleteResult { .. })
        ));
    }

    #[test]
    fn test_missing_transmission_has_no_line_impedance() {
        let result = one_port(vec![2.3e9, 2.4e9, 2.5e9], vec![Complex64::new(0.1, 0.0); 3]);
        let metrics = ResultAnalyzer::default().analyze(&result, 2.4e9).unwrap();
        assert!(metrics.line_impedance_ohms.is_none());
        assert!(matches!(
            measured_parameter(&metrics, TargetParameter::Impedance),
            Err(RfError::IncompleteResult { .. })
        ));
    }
}
