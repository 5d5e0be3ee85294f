use async_trait::async_trait;
use num_complex::Complex64;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::core::context::{CancelSignal, ExecutionContext};
use crate::domain::ports::SolverBackend;
use crate::domain::simulation::{
    FarFieldSample, SParameterTrace, SimulationDomain, SimulationResult, SolverConfiguration,
};
use crate::utils::error::{Result, RfError};

const CONFIG_FILE: &str = "config.json";
const SPARAMS_FILE: &str = "sparams.csv";
const PORTS_FILE: &str = "ports.csv";
const FARFIELD_FILE: &str = "farfield.csv";
/// Diagnostics keep the tail of the tool output.
const DIAGNOSTIC_LINES: usize = 200;

/// Runs an external field solver on a configuration file.
///
/// The command template may use `{config}` and `{output}`, replaced with the configuration
/// file and the directory the tool must write its results into. The tool answers with either
/// `sparams.csv` (columns `frequency_hz`, `sXY_re`, `sXY_im`) or `ports.csv` (columns
/// `frequency_hz`, `vN_re`, `vN_im`, `iN_re`, `iN_im`, current flowing into the structure),
/// plus an optional `farfield.csv` (`theta_deg`, `phi_deg`, `gain_dbi`).
#[derive(Debug, Clone)]
pub struct ProcessSolver {
    command: Vec<String>,
    timeout: Duration,
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

fn invocation_error(message: impl Into<String>, diagnostics: impl Into<String>) -> RfError {
    RfError::SolverInvocationError {
        message: message.into(),
        diagnostics: diagnostics.into(),
    }
}

fn incomplete(message: impl Into<String>, diagnostics: &str) -> RfError {
    RfError::IncompleteResult {
        message: message.into(),
        diagnostics: diagnostics.to_string(),
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            tracing::debug!("Solver output stream closed early: {}", e);
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    lines[start..].join("\n")
}

impl ProcessSolver {
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self> {
        if command.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(RfError::MissingConfigError {
                field: "solver.command".to_string(),
            });
        }
        Ok(Self { command, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn render(&self, config: &Path, output: &Path) -> Vec<String> {
        let config = config.to_string_lossy();
        let output = output.to_string_lossy();
        self.command
            .iter()
            .map(|arg| arg.replace("{config}", &config).replace("{output}", &output))
            .collect()
    }

    async fn read_optional(path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn collect(&self, config: &SolverConfiguration, output: &Path, log: String) -> Result<SimulationResult> {
        let domain = &config.domain;
        let reference_impedance = domain
            .excited_ports()
            .next()
            .or(domain.ports.first())
            .map(|p| p.reference_impedance)
            .ok_or_else(|| incomplete("domain has no ports", &log))?;

        let (frequencies_hz, s_parameters) =
            if let Some(text) = Self::read_optional(&output.join(SPARAMS_FILE)).await? {
                parse_sparams_csv(&text).map_err(|e| incomplete(e, &log))?
            } else if let Some(text) = Self::read_optional(&output.join(PORTS_FILE)).await? {
                let (freqs, ports) = parse_ports_csv(&text).map_err(|e| incomplete(e, &log))?;
                let traces = port_waves_to_s(domain, &ports).map_err(|e| incomplete(e, &log))?;
                (freqs, traces)
            } else {
                return Err(incomplete(
                    format!("solver wrote neither {} nor {}", SPARAMS_FILE, PORTS_FILE),
                    &log,
                ));
            };

        let far_field = match Self::read_optional(&output.join(FARFIELD_FILE)).await? {
            Some(text) if config.far_field_step_deg.is_some() => {
                Some(parse_farfield_csv(&text).map_err(|e| incomplete(e, &log))?)
            }
            _ => None,
        };

        Ok(SimulationResult {
            frequencies_hz,
            reference_impedance,
            s_parameters,
            far_field,
            solver_log: log,
        })
    }
}

#[async_trait]
impl SolverBackend for ProcessSolver {
    fn name(&self) -> &str {
        "process"
    }

    async fn invoke(
        &self,
        config: &SolverConfiguration,
        ctx: &ExecutionContext,
        cancel: &CancelSignal,
    ) -> Result<SimulationResult> {
        let work = ctx.scratch_dir("solver")?;
        let config_path = work.path().join(CONFIG_FILE);
        let output_dir = work.path().join("output");
        tokio::fs::create_dir_all(&output_dir).await?;
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(config)?).await?;

        let args = self.render(&config_path, &output_dir);
        let program = ctx.resolve_executable(&args[0]);
        tracing::debug!("Solver command: {} {:?}", program.display(), &args[1..]);

        let mut child = Command::new(&program)
            .args(&args[1..])
            .current_dir(work.path())
            .envs(ctx.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                invocation_error(format!("failed to start '{}': {}", program.display(), e), "")
            })?;
        let guard = ctx.ledger().track_process(child.id());
        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status),
            _ = tokio::time::sleep(self.timeout) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        if !matches!(exit, Exit::Finished(_)) {
            if let Err(e) = child.kill().await {
                tracing::warn!("⚠️ Could not kill solver process {:?}: {}", guard.pid(), e);
            }
        }
        drop(guard);

        let grace = Duration::from_secs(1);
        let out = tokio::time::timeout(grace, stdout).await.ok().and_then(|r| r.ok()).unwrap_or_default();
        let err = tokio::time::timeout(grace, stderr).await.ok().and_then(|r| r.ok()).unwrap_or_default();
        let log = format!("--- stdout ---\n{}\n--- stderr ---\n{}", tail(&out), tail(&err));

        let status = match exit {
            Exit::TimedOut => {
                tracing::error!("⏱️ Solver timed out after {:?}", self.timeout);
                return Err(invocation_error(
                    format!("solver timed out after {} s", self.timeout.as_secs_f64()),
                    log,
                ));
            }
            Exit::Cancelled => {
                tracing::warn!("🛑 Solver run cancelled");
                return Err(invocation_error("solver run cancelled", log));
            }
            Exit::Finished(status) => {
                status.map_err(|e| invocation_error(format!("waiting for solver failed: {}", e), log.clone()))?
            }
        };
        if !status.success() {
            return Err(invocation_error(format!("solver exited with {}", status), log));
        }

        let result = self.collect(config, &output_dir, log).await;
        tracing::debug!("Solver work dir {} released", work.path().display());
        result
    }
}

fn header_regex(pattern: &str) -> std::result::Result<Regex, String> {
    Regex::new(pattern).map_err(|e| e.to_string())
}

fn field(record: &csv::StringRecord, index: usize, row: usize) -> std::result::Result<f64, String> {
    let text = record.get(index).unwrap_or("").trim();
    text.parse()
        .map_err(|_| format!("row {}: '{}' in column {} is not a number", row + 1, text, index + 1))
}

fn frequency_column(headers: &csv::StringRecord) -> std::result::Result<usize, String> {
    headers
        .iter()
        .position(|h| h.trim() == "frequency_hz")
        .ok_or_else(|| "missing frequency_hz column".to_string())
}

/// S-parameter table with `sXY_re`/`sXY_im` column pairs. Port numbers above 9 are
/// written with separators, as in `s10_2_re`.
pub fn parse_sparams_csv(text: &str) -> std::result::Result<(Vec<f64>, Vec<SParameterTrace>), String> {
    let re = header_regex(r"^s(?:(\d)(\d)|(\d+)_(\d+))_(re|im)$")?;
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let freq_col = frequency_column(&headers)?;

    let mut columns: BTreeMap<(u32, u32), [Option<usize>; 2]> = BTreeMap::new();
    for (i, h) in headers.iter().enumerate() {
        if let Some(c) = re.captures(h.trim()) {
            let port = |compact: usize, separated: usize| {
                c.get(compact)
                    .or_else(|| c.get(separated))
                    .and_then(|m| m.as_str().parse::<u32>().ok())
                    .ok_or_else(|| format!("bad port in '{}'", h))
            };
            let (out, inp) = (port(1, 3)?, port(2, 4)?);
            let slot = usize::from(&c[5] == "im");
            columns.entry((out, inp)).or_default()[slot] = Some(i);
        }
    }
    if columns.is_empty() {
        return Err("no S-parameter columns".to_string());
    }

    let mut freqs = Vec::new();
    let mut values: BTreeMap<(u32, u32), Vec<Complex64>> = BTreeMap::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| e.to_string())?;
        freqs.push(field(&record, freq_col, row)?);
        for (pair, [re_col, im_col]) in &columns {
            let (Some(re_col), Some(im_col)) = (re_col, im_col) else {
                return Err(format!("S{}{} lacks a real or imaginary column", pair.0, pair.1));
            };
            let v = Complex64::new(field(&record, *re_col, row)?, field(&record, *im_col, row)?);
            values.entry(*pair).or_default().push(v);
        }
    }

    let traces = values
        .into_iter()
        .map(|((port_out, port_in), values)| SParameterTrace {
            port_out,
            port_in,
            values,
        })
        .collect();
    Ok((freqs, traces))
}

/// Voltage and current phasors of every port, per frequency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortSamples {
    pub voltage: Vec<Complex64>,
    pub current: Vec<Complex64>,
}

pub fn parse_ports_csv(text: &str) -> std::result::Result<(Vec<f64>, BTreeMap<u32, PortSamples>), String> {
    let re = header_regex(r"^([vi])(\d+)_(re|im)$")?;
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let headers = reader.headers().map_err(|e| e.to_string())?.clone();
    let freq_col = frequency_column(&headers)?;

    // port -> [v_re, v_im, i_re, i_im]
    let mut columns: BTreeMap<u32, [Option<usize>; 4]> = BTreeMap::new();
    for (i, h) in headers.iter().enumerate() {
        if let Some(c) = re.captures(h.trim()) {
            let port: u32 = c[2].parse().map_err(|_| format!("bad port in '{}'", h))?;
            let slot = match (&c[1], &c[3]) {
                ("v", "re") => 0,
                ("v", _) => 1,
                (_, "re") => 2,
                _ => 3,
            };
            columns.entry(port).or_default()[slot] = Some(i);
        }
    }
    if columns.is_empty() {
        return Err("no port voltage/current columns".to_string());
    }

    let mut freqs = Vec::new();
    let mut ports: BTreeMap<u32, PortSamples> = BTreeMap::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| e.to_string())?;
        freqs.push(field(&record, freq_col, row)?);
        for (port, cols) in &columns {
            let [Some(vr), Some(vi), Some(ir), Some(ii)] = *cols else {
                return Err(format!("port {} lacks voltage or current columns", port));
            };
            let samples = ports.entry(*port).or_default();
            samples
                .voltage
                .push(Complex64::new(field(&record, vr, row)?, field(&record, vi, row)?));
            samples
                .current
                .push(Complex64::new(field(&record, ir, row)?, field(&record, ii, row)?));
        }
    }
    Ok((freqs, ports))
}

/// S-parameters from port voltages and currents through power waves
/// `a = (V + Z I) / 2√Z`, `b = (V − Z I) / 2√Z`, normalized to the excited port's incident wave.
pub fn port_waves_to_s(
    domain: &SimulationDomain,
    ports: &BTreeMap<u32, PortSamples>,
) -> std::result::Result<Vec<SParameterTrace>, String> {
    let excited = domain
        .excited_ports()
        .next()
        .ok_or_else(|| "domain has no excited port".to_string())?;
    let wave = |number: u32, z: f64| -> std::result::Result<(Vec<Complex64>, Vec<Complex64>), String> {
        let samples = ports
            .get(&number)
            .ok_or_else(|| format!("no voltage/current data for port {}", number))?;
        let scale = 2.0 * z.sqrt();
        let a = samples
            .voltage
            .iter()
            .zip(&samples.current)
            .map(|(v, i)| (*v + *i * z) / scale)
            .collect();
        let b = samples
            .voltage
            .iter()
            .zip(&samples.current)
            .map(|(v, i)| (*v - *i * z) / scale)
            .collect();
        Ok((a, b))
    };

    let (incident, _) = wave(excited.number, excited.reference_impedance)?;
    domain
        .ports
        .iter()
        .map(|port| {
            let (_, reflected) = wave(port.number, port.reference_impedance)?;
            let values = reflected
                .iter()
                .zip(&incident)
                .map(|(b, a)| if a.norm() > 0.0 { *b / *a } else { Complex64::new(f64::NAN, f64::NAN) })
                .collect();
            Ok(SParameterTrace {
                port_out: port.number,
                port_in: excited.number,
                values,
            })
        })
        .collect()
}

pub fn parse_farfield_csv(text: &str) -> std::result::Result<Vec<FarFieldSample>, String> {
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    reader
        .deserialize::<FarFieldSample>()
        .map(|r| r.map_err(|e| e.to_string()))
        .collect()
}
