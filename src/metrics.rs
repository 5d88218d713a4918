/// Live progress snapshots and the final JSON report.
///
/// With `--live`, the harness writes a snapshot after every phase change
/// (device opened, kernel compiling, variant running, result, done). The viz
/// binary polls the file and re-renders its dashboard. Writes are atomic
/// (write to .tmp then rename) to avoid torn reads.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capability::Skipped;
use crate::config::BenchConfig;
use crate::error::Result;
use crate::gpu::DeviceId;
use crate::stats::BenchmarkResult;
use crate::variant::VariantDescriptor;

pub const LIVE_PATH: &str = "/tmp/coopmat_bench_live.json";

/// Result of one benchmarked variant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VariantReport {
    pub device: DeviceId,
    pub descriptor: VariantDescriptor,
    pub subgroup_size: u32,
    pub result: BenchmarkResult,
    /// Queue waits that timed out and were retried
    #[serde(default)]
    pub wait_retries: u32,
}

/// Everything known about one device after its run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeviceReport {
    pub id: DeviceId,
    pub name: String,
    pub device_type: String,
    pub driver: String,
    pub subgroup_size: u32,
    pub timestamp_period_ns: f32,
    pub advertised: usize,
    pub results: Vec<VariantReport>,
    pub skipped: Vec<Skipped>,
}

/// Final report written by `--report`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BenchReport {
    pub config: BenchConfig,
    pub devices: Vec<DeviceReport>,
    /// Unix timestamp in ms when the run finished
    pub finished_ms: u64,
}

impl BenchReport {
    pub fn new(config: BenchConfig) -> Self {
        BenchReport {
            config,
            devices: Vec::new(),
            finished_ms: 0,
        }
    }

    pub fn results(&self) -> impl Iterator<Item = &VariantReport> {
        self.devices.iter().flat_map(|d| d.results.iter())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Current phase of the harness.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Compiling,
    Running,
    Complete,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Compiling => "compiling",
            Phase::Running => "running",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct LiveMetrics {
    pub phase: Phase,
    /// Device currently being benchmarked, e.g. "gpu0"
    pub device: String,
    pub device_name: String,
    /// Variant currently compiling or running
    pub current_variant: String,
    pub num_groups: u32,
    pub inner_iterations: u32,
    pub outer_iterations: u32,
    /// Eligible variants across all devices seen so far
    pub variants_total: usize,
    pub variants_done: usize,
    pub variants_skipped: usize,
    pub kernels_compiled: usize,
    pub results: Vec<VariantReport>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

impl LiveMetrics {
    pub fn new(config: &BenchConfig) -> Self {
        LiveMetrics {
            num_groups: config.num_groups,
            inner_iterations: config.inner_iterations,
            outer_iterations: config.outer_iterations,
            ..Default::default()
        }
    }

    /// Fraction of eligible variants finished, in [0, 1].
    pub fn progress(&self) -> f64 {
        if self.variants_total == 0 {
            return 0.0;
        }
        (self.variants_done as f64 / self.variants_total as f64).min(1.0)
    }
}

/// Atomically write a snapshot to `path`.
pub fn write_metrics(path: &Path, metrics: &LiveMetrics) -> Result<()> {
    let json = serde_json::to_string(metrics)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read the latest snapshot. Returns None if the file doesn't exist or
/// can't be parsed (e.g. no run has started yet).
pub fn read_metrics(path: &Path) -> Option<LiveMetrics> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
