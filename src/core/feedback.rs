use serde::{Deserialize, Serialize};

use crate::core::analysis::{measured_parameter, ResultAnalyzer};
use crate::domain::model::{
    ElectricalTarget, FeedbackDecision, Geometry, IterationRecord, StructureKind, TargetParameter,
};
use crate::domain::simulation::SimulationResult;
use crate::utils::error::{Result, RfError};

/// The `[feedback]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub enabled: bool,
    pub max_iterations: usize,
    pub impedance_tolerance_ohms: f64,
    pub frequency_tolerance_rel: f64,
    /// Largest change of the synthesis target per iteration, relative to its current value.
    pub max_step_fraction: f64,
    /// Step scale used when restarting from the best iteration after the error grew.
    pub damping: f64,
    pub return_loss_threshold_db: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: 8,
            impedance_tolerance_ohms: 0.5,
            frequency_tolerance_rel: 0.005,
            max_step_fraction: 0.2,
            damping: 0.5,
            return_loss_threshold_db: 10.0,
        }
    }
}

/// Bounded correction loop between simulation and synthesis.
///
/// Each evaluation compares the simulated value of the controlled parameter with the desired
/// one and proposes the next synthesis target. An iteration whose error grew compared to the
/// best accepted one is kept in the history but not accepted.
#[derive(Debug, Clone)]
pub struct FeedbackLoop {
    config: FeedbackConfig,
    analyzer: ResultAnalyzer,
    desired: ElectricalTarget,
    parameter: TargetParameter,
    history: Vec<IterationRecord>,
    consecutive_growths: usize,
}

impl FeedbackLoop {
    pub fn new(desired: ElectricalTarget, structure: StructureKind, config: FeedbackConfig) -> Self {
        Self {
            analyzer: ResultAnalyzer::new(config.return_loss_threshold_db),
            config,
            desired,
            parameter: structure.controlled_parameter(),
            history: Vec::new(),
            consecutive_growths: 0,
        }
    }

    pub fn parameter(&self) -> TargetParameter {
        self.parameter
    }

    pub fn desired(&self) -> &ElectricalTarget {
        &self.desired
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn into_history(self) -> Vec<IterationRecord> {
        self.history
    }

    /// Accepted iteration with the smallest error.
    pub fn best(&self) -> Option<&IterationRecord> {
        self.history
            .iter()
            .filter(|r| r.accepted)
            .min_by(|a, b| a.error.abs().total_cmp(&b.error.abs()))
    }

    fn tolerance(&self) -> f64 {
        match self.parameter {
            TargetParameter::Impedance => self.config.impedance_tolerance_ohms,
            TargetParameter::ResonantFrequency => {
                self.config.frequency_tolerance_rel * self.desired.frequency_hz
            }
        }
    }

    pub fn evaluate(
        &mut self,
        result: &SimulationResult,
        synthesis_target: ElectricalTarget,
        geometry: Geometry,
    ) -> Result<FeedbackDecision> {
        let metrics = self.analyzer.analyze(result, self.desired.frequency_hz)?;
        let measured = measured_parameter(&metrics, self.parameter)?;
        let desired = self.desired.parameter(self.parameter);
        let error = measured - desired;

        let grew = self
            .best()
            .is_some_and(|best| error.abs() > best.error.abs());
        let iteration = self.history.len() + 1;
        self.history.push(IterationRecord {
            iteration,
            synthesis_target,
            geometry,
            parameter: self.parameter,
            measured,
            error,
            accepted: !grew,
            metrics,
        });

        tracing::info!(
            "🔁 Iteration {}: {} measured {:.6}, desired {:.6}, error {:+.6}{}",
            iteration,
            self.parameter,
            measured,
            desired,
            error,
            if grew { " (error grew, not accepted)" } else { "" }
        );

        if !grew && error.abs() <= self.tolerance() {
            return Ok(FeedbackDecision {
                converged: true,
                updated_target: None,
                iteration_count: iteration,
            });
        }

        if grew {
            self.consecutive_growths += 1;
            if self.consecutive_growths >= 2 {
                return Err(RfError::FeedbackDivergence {
                    parameter: self.parameter.to_string(),
                    iterations: iteration,
                    best: self.best().cloned().map(Box::new),
                });
            }
        } else {
            self.consecutive_growths = 0;
        }

        if iteration >= self.config.max_iterations {
            return Err(RfError::FeedbackNotConverged {
                parameter: self.parameter.to_string(),
                iterations: iteration,
                best: self.best().cloned().map(Box::new),
            });
        }

        let next = self.next_target(grew);
        Ok(FeedbackDecision {
            converged: false,
            updated_target: Some(next),
            iteration_count: iteration,
        })
    }

    fn next_target(&self, grew: bool) -> ElectricalTarget {
        let latest = &self.history[self.history.len() - 1];
        // Non-empty: the first iteration is always accepted.
        let best = self.best().unwrap_or(latest);
        let base = best.synthesis_target.parameter(self.parameter);

        let proposed = if grew {
            let overshoot = latest.synthesis_target.parameter(self.parameter) - base;
            base + self.config.damping * overshoot
        } else {
            self.secant(best)
                .unwrap_or_else(|| self.proportional(base, best.measured))
        };

        let limit = self.config.max_step_fraction * base.abs();
        let next = base + (proposed - base).clamp(-limit, limit);
        best.synthesis_target.with_parameter(self.parameter, next)
    }

    /// Additive for impedance, multiplicative for frequency.
    fn proportional(&self, base: f64, measured: f64) -> f64 {
        let desired = self.desired.parameter(self.parameter);
        match self.parameter {
            TargetParameter::Impedance => base - (measured - desired),
            TargetParameter::ResonantFrequency => base * desired / measured,
        }
    }

    /// Secant through the two most recent accepted iterations.
    fn secant(&self, best: &IterationRecord) -> Option<f64> {
        let previous = self
            .history
            .iter()
            .rev()
            .find(|r| r.accepted && r.iteration != best.iteration)?;
        let t1 = best.synthesis_target.parameter(self.parameter);
        let t0 = previous.synthesis_target.parameter(self.parameter);
        let dt = t1 - t0;
        if dt.abs() <= f64::EPSILON * t1.abs() {
            return None;
        }
        let slope = (best.error - previous.error) / dt;
        if !slope.is_finite() || slope <= 0.0 {
            return None;
        }
        Some(t1 - best.error / slope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::synthesis::{GeometrySynthesizer, SynthesisConfig};
    use crate::domain::model::SubstrateStack;
    use crate::domain::simulation::SParameterTrace;
    use num_complex::Complex64;

    /// Two-port result of an ideal quarter-wave line of impedance `zc`.
    fn line_result(zc: f64) -> SimulationResult {
        let z0 = 50.0;
        let freqs = vec![2.3e9, 2.4e9, 2.5e9];
        let one = Complex64::new(1.0, 0.0);
        let j = Complex64::new(0.0, 1.0);
        let (a, b, c, d) = (0.0 * one, j * zc, j / zc, 0.0 * one);
        let denom = a + b / z0 + c * z0 + d;
        let s11 = (a + b / z0 - c * z0 - d) / denom;
        let s21 = 2.0 / denom;
        SimulationResult {
            frequencies_hz: freqs,
            reference_impedance: z0,
            s_parameters: vec![
                SParameterTrace { port_out: 1, port_in: 1, values: vec![s11; 3] },
                SParameterTrace { port_out: 2, port_in: 1, values: vec![s21; 3] },
            ],
            far_field: None,
            solver_log: String::new(),
        }
    }

    fn geometry(target: &ElectricalTarget) -> Geometry {
        GeometrySynthesizer::new(StructureKind::Microstrip, SynthesisConfig::default())
            .synthesize(target, &SubstrateStack::two_layer(4.3, 1.6, 35.0, 0.02))
            .unwrap()
    }

    #[test]
    fn test_first_step_is_proportional() {
        let desired = ElectricalTarget::new(50.0, 2.4e9);
        let mut fb = FeedbackLoop::new(desired, StructureKind::Microstrip, FeedbackConfig::default());
        let decision = fb.evaluate(&line_result(53.0), desired, geometry(&desired)).unwrap();
        assert!(!decision.converged);
        let next = decision.updated_target.unwrap();
        assert!((next.impedance_ohms - 47.0).abs() < 1e-6);
        assert_eq!(fb.history().len(), 1);
        assert!(fb.history()[0].accepted);
    }

    #[test]
    fn test_converges_within_tolerance() {
        let desired = ElectricalTarget::new(50.0, 2.4e9);
        let mut fb = FeedbackLoop::new(desired, StructureKind::Microstrip, FeedbackConfig::default());
        let decision = fb.evaluate(&line_result(50.2), desired, geometry(&desired)).unwrap();
        assert!(decision.converged);
        assert_eq!(decision.iteration_count, 1);
    }

    #[test]
    fn test_two_growths_diverge_with_best_attached() {
        let desired = ElectricalTarget::new(50.0, 2.4e9);
        let mut fb = FeedbackLoop::new(desired, StructureKind::Microstrip, FeedbackConfig::default());
        let mut target = desired;
        for zc in [52.0, 54.0] {
            let decision = fb.evaluate(&line_result(zc), target, geometry(&target)).unwrap();
            target = decision.updated_target.unwrap();
        }
        let err = fb.evaluate(&line_result(56.0), target, geometry(&target)).unwrap_err();
        let best = err.best_iteration().unwrap();
        assert_eq!(best.iteration, 1);
        assert!(matches!(err, RfError::FeedbackDivergence { .. }));
        assert!(!fb.history()[1].accepted && !fb.history()[2].accepted);
    }

    #[test]
    fn test_growth_restarts_from_best_with_damped_step() {
        let desired = ElectricalTarget::new(50.0, 2.4e9);
        let mut fb = FeedbackLoop::new(desired, StructureKind::Microstrip, FeedbackConfig::default());
        let first = fb.evaluate(&line_result(52.0), desired, geometry(&desired)).unwrap();
        let second_target = first.updated_target.unwrap();
        assert!((second_target.impedance_ohms - 48.0).abs() < 1e-6);
        let second = fb
            .evaluate(&line_result(47.0), second_target, geometry(&second_target))
            .unwrap();
        let third = second.updated_target.unwrap();
        assert!((third.impedance_ohms - 49.0).abs() < 1e-6);
    }

    #[test]
    fn test_budget_exhaustion_reports_best() {
        let desired = ElectricalTarget::new(50.0, 2.4e9);
        let config = FeedbackConfig {
            max_iterations: 2,
            ..FeedbackConfig::default()
        };
        let mut fb = FeedbackLoop::new(desired, StructureKind::Microstrip, config);
        let mut target = desired;
        let first = fb.evaluate(&line_result(53.0), target, geometry(&target)).unwrap();
        target = first.updated_target.unwrap();
        let err = fb.evaluate(&line_result(52.0), target, geometry(&target)).unwrap_err();
        assert!(matches!(err, RfError::FeedbackNotConverged { iterations: 2, .. }));
        assert_eq!(err.best_iteration().unwrap().iteration, 2);
    }

    #[test]
    fn test_accepted_errors_never_increase() {
        let desired = ElectricalTarget::new(50.0, 2.4e9);
        let mut fb = FeedbackLoop::new(desired, StructureKind::Microstrip, FeedbackConfig::default());
        let mut target = desired;
        for zc in [55.0, 52.0, 53.0, 51.0, 50.1] {
            match fb.evaluate(&line_result(zc), target, geometry(&target)) {
                Ok(decision) if decision.converged => break,
                Ok(decision) => target = decision.updated_target.unwrap(),
                Err(_) => break,
            }
        }
        let accepted: Vec<f64> = fb
            .history()
            .iter()
            .filter(|r| r.accepted)
            .map(|r| r.error.abs())
            .collect();
        assert!(accepted.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_truncated_result_is_rejected_without_a_record() {
        let desired = ElectricalTarget::new(50.0, 2.4e9);
        let mut fb = FeedbackLoop::new(desired, StructureKind::Microstrip, FeedbackConfig::default());
        let mut result = line_result(53.0);
        result.s_parameters[1].values.truncate(1);
        let err = fb.evaluate(&result, desired, geometry(&desired)).unwrap_err();
        assert!(matches!(err, RfError::IncompleteResult { .. }));
        assert!(fb.history().is_empty());
    }
}
