use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::analysis::to_db;
use crate::core::engine::DesignRequest;
use crate::domain::model::{ElectricalTarget, IterationRecord, TargetParameter};
use crate::domain::simulation::SimulationResult;
use crate::utils::error::Result;

/// `s21_re` while both ports are single digits, `s10_2_re` once either is not.
fn sparam_column(out: u32, inp: u32, part: &str) -> String {
    if out < 10 && inp < 10 {
        format!("s{}{}_{}", out, inp, part)
    } else {
        format!("s{}_{}_{}", out, inp, part)
    }
}

/// Frequency table of a simulation: input impedance magnitude and S11 in dB, followed by the
/// raw real and imaginary parts of every trace.
pub fn sparams_csv(result: &SimulationResult) -> Result<Vec<u8>> {
    let pairs = result.port_pairs();
    let input = pairs.iter().find(|(o, i)| o == i).map(|(o, _)| *o);
    let reflection = input.and_then(|p| result.s(p, p));
    let z0 = result.reference_impedance;
    let one = Complex64::new(1.0, 0.0);

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec![
        "frequency_hz".to_string(),
        "z_in_magnitude_ohms".to_string(),
        "s11_db".to_string(),
    ];
    for (out, inp) in &pairs {
        header.push(sparam_column(*out, *inp, "re"));
        header.push(sparam_column(*out, *inp, "im"));
    }
    writer.write_record(&header)?;

    for (k, f) in result.frequencies_hz.iter().enumerate() {
        let mut row = vec![f.to_string()];
        match reflection.and_then(|s| s.get(k)) {
            Some(&gamma) => {
                let z = z0 * (one + gamma) / (one - gamma);
                row.push(z.norm().to_string());
                row.push(to_db(gamma.norm()).to_string());
            }
            None => {
                row.push(String::new());
                row.push(String::new());
            }
        }
        for (out, inp) in &pairs {
            match result.s(*out, *inp).and_then(|s| s.get(k)) {
                Some(v) => {
                    row.push(v.re.to_string());
                    row.push(v.im.to_string());
                }
                None => {
                    row.push(String::new());
                    row.push(String::new());
                }
            }
        }
        writer.write_record(&row)?;
    }

    writer
        .into_inner()
        .map_err(|e| std::io::Error::other(e.to_string()).into())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: usize,
    pub synthesis_target: ElectricalTarget,
    pub parameter: TargetParameter,
    pub measured: f64,
    pub error: f64,
    pub accepted: bool,
    pub min_s11_db: f64,
    pub resonant_frequency_hz: f64,
    pub line_impedance_ohms: Option<f64>,
    pub dimensions_mm: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub design: String,
    pub target: ElectricalTarget,
    pub converged: bool,
    pub iterations: usize,
    pub best_iteration: Option<usize>,
    pub generated_at: String,
    pub records: Vec<HistoryEntry>,
}

pub fn summarize(request: &DesignRequest, history: &[IterationRecord], converged: bool) -> HistorySummary {
    let best_iteration = history
        .iter()
        .filter(|r| r.accepted)
        .min_by(|a, b| a.error.abs().total_cmp(&b.error.abs()))
        .map(|r| r.iteration);
    let records = history
        .iter()
        .map(|r| HistoryEntry {
            iteration: r.iteration,
            synthesis_target: r.synthesis_target,
            parameter: r.parameter,
            measured: r.measured,
            error: r.error,
            accepted: r.accepted,
            min_s11_db: r.metrics.min_s11_db,
            resonant_frequency_hz: r.metrics.resonant_frequency_hz,
            line_impedance_ohms: r.metrics.line_impedance_ohms,
            dimensions_mm: r
                .geometry
                .dimensions
                .iter()
                .map(|(d, v)| (d.name().to_string(), *v))
                .collect(),
        })
        .collect();
    HistorySummary {
        design: request.name.clone(),
        target: request.target,
        converged,
        iterations: history.len(),
        best_iteration,
        generated_at: chrono::Utc::now().to_rfc3339(),
        records,
    }
}

pub fn history_summary(
    request: &DesignRequest,
    history: &[IterationRecord],
    converged: bool,
) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(&summarize(request, history, converged))?)
}
