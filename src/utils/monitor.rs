use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[cfg(feature = "cli")]
use sysinfo::{Pid, ProcessStatus, RefreshKind, System};

/// Stage of a design run, as reported in the timing breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Synthesis,
    Layout,
    Meshing,
    Simulation,
    Artifacts,
    Sweep,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Synthesis => "synthesis",
            Phase::Layout => "layout",
            Phase::Meshing => "meshing",
            Phase::Simulation => "simulation",
            Phase::Artifacts => "artifacts",
            Phase::Sweep => "sweep",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseTiming {
    pub runs: u32,
    pub total: Duration,
}

#[cfg(feature = "cli")]
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub cpu_usage: f32,
    pub memory_mb: u64,
    pub memory_percent: f32,
    pub peak_memory_mb: u64,
}

#[cfg(feature = "cli")]
struct Sampler {
    system: System,
    pid: Pid,
    peak_memory_mb: u64,
}

#[cfg(feature = "cli")]
impl Sampler {
    fn new() -> Option<Self> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = System::new_with_specifics(RefreshKind::everything());
        system.refresh_all();
        Some(Self {
            system,
            pid,
            peak_memory_mb: 0,
        })
    }

    fn snapshot(&mut self) -> Option<ResourceSnapshot> {
        self.system.refresh_all();
        let process = self.system.process(self.pid)?;
        let memory_mb = process.memory() / 1024 / 1024;
        let total_mb = self.system.total_memory() / 1024 / 1024;
        self.peak_memory_mb = self.peak_memory_mb.max(memory_mb);
        Some(ResourceSnapshot {
            cpu_usage: process.cpu_usage(),
            memory_mb,
            memory_percent: if total_mb > 0 {
                memory_mb as f32 / total_mb as f32 * 100.0
            } else {
                0.0
            },
            peak_memory_mb: self.peak_memory_mb,
        })
    }
}

/// Wall time per pipeline phase, plus CPU and memory of this process when enabled.
///
/// Timings are always collected. Logging and the sysinfo sampler only run when monitoring is
/// switched on.
pub struct SystemMonitor {
    enabled: bool,
    started: Instant,
    timings: Mutex<BTreeMap<Phase, PhaseTiming>>,
    #[cfg(feature = "cli")]
    sampler: Option<Mutex<Sampler>>,
}

impl SystemMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            started: Instant::now(),
            timings: Mutex::new(BTreeMap::new()),
            #[cfg(feature = "cli")]
            sampler: if enabled { Sampler::new().map(Mutex::new) } else { None },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Times `phase` until the returned guard is dropped.
    pub fn phase(&self, phase: Phase) -> PhaseGuard<'_> {
        PhaseGuard {
            monitor: self,
            phase,
            started: Instant::now(),
        }
    }

    pub fn timings(&self) -> BTreeMap<Phase, PhaseTiming> {
        self.timings
            .lock()
            .map(|timings| timings.clone())
            .unwrap_or_default()
    }

    fn record(&self, phase: Phase, elapsed: Duration) {
        if let Ok(mut timings) = self.timings.lock() {
            let entry = timings.entry(phase).or_default();
            entry.runs += 1;
            entry.total += elapsed;
        }
        if self.enabled {
            self.log_phase(phase, elapsed);
        }
    }

    #[cfg(feature = "cli")]
    pub fn snapshot(&self) -> Option<ResourceSnapshot> {
        self.sampler.as_ref()?.lock().ok()?.snapshot()
    }

    #[cfg(feature = "cli")]
    fn log_phase(&self, phase: Phase, elapsed: Duration) {
        match self.snapshot() {
            Some(s) => tracing::info!(
                "📊 {} took {:?} - CPU: {:.1}%, Memory: {}MB ({:.1}%), Peak: {}MB",
                phase,
                elapsed,
                s.cpu_usage,
                s.memory_mb,
                s.memory_percent,
                s.peak_memory_mb
            ),
            None => tracing::info!("📊 {} took {:?}", phase, elapsed),
        }
    }

    #[cfg(not(feature = "cli"))]
    fn log_phase(&self, phase: Phase, elapsed: Duration) {
        tracing::info!("📊 {} took {:?}", phase, elapsed);
    }

    /// Logs the per-phase breakdown and hands it back.
    pub fn log_final_stats(&self) -> BTreeMap<Phase, PhaseTiming> {
        let timings = self.timings();
        if self.enabled {
            let breakdown: Vec<String> = timings
                .iter()
                .map(|(phase, t)| format!("{} {:?} ({}x)", phase, t.total, t.runs))
                .collect();
            tracing::info!(
                "📊 Final Stats - Total Time: {:?}; {}",
                self.started.elapsed(),
                breakdown.join(", ")
            );
        }
        timings
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

pub struct PhaseGuard<'a> {
    monitor: &'a SystemMonitor,
    phase: Phase,
    started: Instant,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.monitor.record(self.phase, self.started.elapsed());
    }
}

/// Whether a process with this id is still present (zombies count as gone).
#[cfg(feature = "cli")]
pub fn is_process_alive(pid: u32) -> bool {
    let system = System::new_all();
    system
        .process(Pid::from_u32(pid))
        .map(|process| process.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_are_timed_when_disabled() {
        let monitor = SystemMonitor::new(false);
        for _ in 0..2 {
            let _timer = monitor.phase(Phase::Meshing);
            std::thread::sleep(Duration::from_millis(2));
        }
        {
            let _timer = monitor.phase(Phase::Synthesis);
        }

        let timings = monitor.log_final_stats();
        assert_eq!(timings[&Phase::Meshing].runs, 2);
        assert!(timings[&Phase::Meshing].total >= Duration::from_millis(4));
        assert_eq!(timings[&Phase::Synthesis].runs, 1);
        assert!(!timings.contains_key(&Phase::Simulation));
    }

    #[test]
    fn test_phase_order_follows_the_pipeline() {
        let phases: Vec<String> = [Phase::Artifacts, Phase::Synthesis, Phase::Simulation]
            .into_iter()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(phases, ["synthesis", "simulation", "artifacts"]);
    }

    #[cfg(feature = "cli")]
    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        let monitor = SystemMonitor::new(true);
        let snapshot = monitor.snapshot().unwrap();
        assert!(snapshot.peak_memory_mb >= snapshot.memory_mb);
    }
}
