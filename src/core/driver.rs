use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::context::{CancelSignal, ExecutionContext};
use crate::domain::ports::SolverBackend;
use crate::domain::simulation::{SimulationDomain, SimulationResult, SolverConfiguration, Termination};
use crate::utils::error::{Result, RfError};

/// Which backend sits behind the solver boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    Analytic,
    Process,
}

/// The `[solver]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub backend: SolverKind,
    /// Program and arguments for the process backend. `{config}` and `{output}` are replaced
    /// with the configuration file and the output directory.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub energy_decay_db: f64,
    pub max_timesteps: u64,
    /// Far-field sampling step for radiating structures. `None` skips the pattern.
    pub far_field_step_deg: Option<f64>,
    /// Sweep half-width relative to the target frequency.
    pub frequency_span_rel: f64,
    pub frequency_points: usize,
    /// Analytic backend: ratio of simulated to closed-form line impedance.
    pub impedance_scale: f64,
    /// Analytic backend: ratio of simulated to closed-form resonance.
    pub frequency_scale: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        let termination = Termination::default();
        Self {
            backend: SolverKind::Analytic,
            command: Vec::new(),
            timeout_secs: 3600,
            energy_decay_db: termination.energy_decay_db,
            max_timesteps: termination.max_timesteps,
            far_field_step_deg: Some(5.0),
            frequency_span_rel: 0.2,
            frequency_points: 101,
            impedance_scale: 1.0,
            frequency_scale: 1.0,
        }
    }
}

impl SolverSettings {
    pub fn termination(&self) -> Termination {
        Termination {
            energy_decay_db: self.energy_decay_db,
            max_timesteps: self.max_timesteps,
        }
    }
}

/// Hands a discretized domain to the solver and checks what comes back.
#[derive(Clone)]
pub struct SimulationDriver {
    backend: Arc<dyn SolverBackend>,
    termination: Termination,
    far_field_step_deg: Option<f64>,
}

impl SimulationDriver {
    pub fn new(backend: Arc<dyn SolverBackend>, settings: &SolverSettings) -> Self {
        Self {
            backend,
            termination: settings.termination(),
            far_field_step_deg: settings.far_field_step_deg,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn configure(&self, domain: &SimulationDomain) -> SolverConfiguration {
        SolverConfiguration {
            domain: domain.clone(),
            termination: self.termination,
            far_field_step_deg: if domain.structure.is_radiator() {
                self.far_field_step_deg
            } else {
                None
            },
        }
    }

    /// Runs the solver, retrying one external tool failure with the same configuration.
    pub async fn run(
        &self,
        domain: &SimulationDomain,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> Result<SimulationResult> {
        let config = self.configure(domain);
        let mut attempt = 1;
        loop {
            tracing::info!(
                "🚀 Invoking solver '{}' for '{}' (attempt {})",
                self.backend.name(),
                domain.name,
                attempt
            );
            let outcome = self
                .backend
                .invoke(&config, ctx, cancel)
                .await
                .and_then(|result| check_complete(&config, result));

            match outcome {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt == 1 && !cancel.is_cancelled() => {
                    tracing::warn!("⚠️ Solver attempt failed, retrying once: {}", e);
                    attempt += 1;
                }
                Err(e) => {
                    if let Some(diagnostics) = e.diagnostics() {
                        tracing::error!("❌ Solver diagnostics:\n{}", diagnostics);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Rejects results with missing frequency samples or port data.
pub fn check_complete(
    config: &SolverConfiguration,
    result: SimulationResult,
) -> Result<SimulationResult> {
    let expected = config.domain.frequency_range.points;
    let incomplete = |message: String| RfError::IncompleteResult {
        message,
        diagnostics: result.solver_log.clone(),
    };

    if result.frequencies_hz.len() != expected {
        return Err(incomplete(format!(
            "expected {} frequency samples, got {}",
            expected,
            result.frequencies_hz.len()
        )));
    }
    if result.frequencies_hz.iter().any(|f| !f.is_finite())
        || result.frequencies_hz.windows(2).any(|w| w[1] <= w[0])
    {
        return Err(incomplete(
            "frequency samples are not finite and strictly increasing".to_string(),
        ));
    }

    for excited in config.domain.excited_ports() {
        for port in &config.domain.ports {
            let Some(values) = result.s(port.number, excited.number) else {
                return Err(incomplete(format!(
                    "missing S{}{}",
                    port.number, excited.number
                )));
            };
            if values.len() != expected {
                return Err(incomplete(format!(
                    "S{}{} has {} of {} samples",
                    port.number,
                    excited.number,
                    values.len(),
                    expected
                )));
            }
            if values.iter().any(|v| !v.re.is_finite() || !v.im.is_finite()) {
                return Err(incomplete(format!(
                    "S{}{} contains non-finite values",
                    port.number, excited.number
                )));
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::board::BoardModelBuilder;
    use crate::core::context::cancellation;
    use crate::core::mesh::MeshConverter;
    use crate::core::synthesis::{GeometrySynthesizer, SynthesisConfig};
    use crate::domain::model::{ElectricalTarget, StructureKind, SubstrateStack};
    use crate::domain::simulation::{FrequencyRange, SParameterTrace};
    use async_trait::async_trait;
    use num_complex::Complex64;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then answers with a flat reflection.
    struct ScriptedBackend {
        failures: usize,
        calls: AtomicUsize,
        drop_samples: bool,
    }

    #[async_trait]
    impl SolverBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn invoke(
            &self,
            config: &SolverConfiguration,
            _ctx: &ExecutionContext,
            _cancel: &CancelSignal,
        ) -> Result<SimulationResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(RfError::SolverInvocationError {
                    message: "exit status 1".to_string(),
                    diagnostics: "license server unreachable".to_string(),
                });
            }
            let mut frequencies = config.domain.frequency_range.samples();
            if self.drop_samples {
                frequencies.pop();
            }
            let values = vec![Complex64::new(0.1, 0.0); frequencies.len()];
            let s_parameters = config
                .domain
                .ports
                .iter()
                .map(|p| SParameterTrace {
                    port_out: p.number,
                    port_in: 1,
                    values: values.clone(),
                })
                .collect();
            Ok(SimulationResult {
                frequencies_hz: frequencies,
                reference_impedance: 50.0,
                s_parameters,
                far_field: None,
                solver_log: String::new(),
            })
        }
    }

    fn domain() -> SimulationDomain {
        let stack = SubstrateStack::two_layer(4.3, 1.6, 35.0, 0.02);
        let geometry = GeometrySynthesizer::new(StructureKind::Microstrip, SynthesisConfig::default())
            .synthesize(&ElectricalTarget::new(50.0, 2.4e9), &stack)
            .unwrap();
        let board = BoardModelBuilder::new(50.0).build(&geometry, &stack).unwrap();
        MeshConverter::default()
            .convert(&board, &FrequencyRange::around(2.4e9, 0.2, 11))
            .unwrap()
    }

    fn driver(backend: ScriptedBackend) -> (SimulationDriver, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        let driver = SimulationDriver::new(backend.clone(), &SolverSettings::default());
        (driver, backend)
    }

    #[tokio::test]
    async fn test_external_failure_is_retried_once() {
        let (driver, backend) = driver(ScriptedBackend {
            failures: 1,
            calls: AtomicUsize::new(0),
            drop_samples: false,
        });
        let ctx = ExecutionContext::init("driver_retry", None).unwrap();
        let result = driver.run(&domain(), &ctx, &CancelSignal::never()).await.unwrap();
        assert_eq!(result.frequencies_hz.len(), 11);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_failure_surfaces_with_diagnostics() {
        let (driver, backend) = driver(ScriptedBackend {
            failures: 2,
            calls: AtomicUsize::new(0),
            drop_samples: false,
        });
        let ctx = ExecutionContext::init("driver_fail", None).unwrap();
        let err = driver
            .run(&domain(), &ctx, &CancelSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.diagnostics(), Some("license server unreachable"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_not_retried() {
        let (driver, backend) = driver(ScriptedBackend {
            failures: 1,
            calls: AtomicUsize::new(0),
            drop_samples: false,
        });
        let (handle, signal) = cancellation();
        handle.cancel();
        let ctx = ExecutionContext::init("driver_cancel", None).unwrap();
        assert!(driver.run(&domain(), &ctx, &signal).await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_samples_are_incomplete() {
        let (driver, _) = driver(ScriptedBackend {
            failures: 0,
            calls: AtomicUsize::new(0),
            drop_samples: true,
        });
        let ctx = ExecutionContext::init("driver_incomplete", None).unwrap();
        let err = driver
            .run(&domain(), &ctx, &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, RfError::IncompleteResult { .. }));
    }

    #[test]
    fn test_far_field_only_requested_for_radiators() {
        let (driver, _) = driver(ScriptedBackend {
            failures: 0,
            calls: AtomicUsize::new(0),
            drop_samples: false,
        });
        assert_eq!(driver.configure(&domain()).far_field_step_deg, None);
    }
}
