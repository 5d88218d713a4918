/// Statistics reducer: timestamp pairs -> latency and throughput.
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BenchError, Result};
use crate::variant::{ComponentType, Tile};

/// Whether operations are counted as floating-point or integer ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Float,
    Integer,
}

impl OpKind {
    /// Classified by the accumulator type.
    pub fn for_accumulator(c_type: ComponentType) -> Self {
        if c_type.is_float() {
            OpKind::Float
        } else {
            OpKind::Integer
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            OpKind::Float => "FL",
            OpKind::Integer => "I",
        }
    }

    /// Rate unit, e.g. "FLOP/s".
    pub fn unit(self) -> String {
        format!("{}OP/s", self.prefix())
    }
}

/// Operations performed by one dispatch:
/// G * inner * (M*N*K*2) * insts_in_block * blocks_in_kernel.
/// Fails with a configuration error when the count does not fit a u64.
pub fn ops_per_dispatch(
    groups: u32,
    inner_iterations: u32,
    tile: Tile,
    insts_in_block: u32,
    blocks_in_kernel: u32,
) -> Result<u64> {
    let tile_ops = tile.ops();
    [inner_iterations as u64, insts_in_block as u64, blocks_in_kernel as u64]
        .into_iter()
        .try_fold(groups as u64, u64::checked_mul)
        .zip(tile_ops)
        .and_then(|(count, ops)| count.checked_mul(ops))
        .ok_or_else(|| {
            BenchError::Configuration(format!(
                "operation count of {tile} with {groups} groups x {inner_iterations} iterations \
                 x {insts_in_block} insts x {blocks_in_kernel} blocks overflows 64 bits"
            ))
        })
}

/// Per-iteration durations in ticks from `[start0, end0, start1, end1, ...]`.
pub fn durations(timestamps: &[u64]) -> Result<Vec<u64>> {
    if timestamps.is_empty() {
        return Err(BenchError::Timestamps("no timestamps recorded".into()));
    }
    if timestamps.len() % 2 != 0 {
        return Err(BenchError::Timestamps(format!(
            "odd number of timestamps ({})",
            timestamps.len()
        )));
    }
    timestamps
        .chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| {
            pair[1].checked_sub(pair[0]).ok_or_else(|| {
                BenchError::Timestamps(format!(
                    "iteration {i} ends before it starts ({} < {})",
                    pair[1], pair[0]
                ))
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub min_ticks: u64,
    pub mean_ticks: u64,
    pub min_ns: f64,
    pub mean_ns: f64,
    /// Ops per second at the fastest iteration; `None` when it took zero
    /// ticks and the rate is unbounded
    pub max_throughput: Option<f64>,
    /// Ops per second at the mean iteration
    pub mean_throughput: Option<f64>,
    pub ops_per_dispatch: u64,
    pub op_kind: OpKind,
}

impl BenchmarkResult {
    pub fn max_giga(&self) -> Option<f64> {
        self.max_throughput.map(|r| r / 1e9)
    }

    pub fn mean_giga(&self) -> Option<f64> {
        self.mean_throughput.map(|r| r / 1e9)
    }

    /// e.g. "Max. 512.34 GFLOP/s"
    pub fn max_line(&self) -> String {
        giga_line("Max.", self.max_giga(), self.op_kind)
    }

    pub fn avg_line(&self) -> String {
        giga_line("Avg.", self.mean_giga(), self.op_kind)
    }

    /// Human readable rate with an SI prefix, e.g. "1.23 TFLOP/s".
    pub fn throughput_string(&self) -> String {
        rate_string(self.max_throughput, self.op_kind)
    }

    pub fn mean_throughput_string(&self) -> String {
        rate_string(self.mean_throughput, self.op_kind)
    }

    /// Peak rate for ranking; an unbounded peak sorts above every measured one.
    pub fn peak_for_ranking(&self) -> f64 {
        self.max_throughput.unwrap_or(f64::INFINITY)
    }
}

fn giga_line(label: &str, giga: Option<f64>, kind: OpKind) -> String {
    match giga {
        Some(g) => format!("{label} {g:.2} G{}", kind.unit()),
        None => format!("{label} unbounded G{} (zero-tick iteration)", kind.unit()),
    }
}

fn rate_string(ops_per_second: Option<f64>, kind: OpKind) -> String {
    match ops_per_second {
        Some(rate) => human_rate(rate, kind),
        None => format!("unbounded {}", kind.unit()),
    }
}

pub fn human_rate(ops_per_second: f64, kind: OpKind) -> String {
    let (scale, prefix) = [(1e15, "P"), (1e12, "T"), (1e9, "G"), (1e6, "M"), (1e3, "K")]
        .into_iter()
        .find(|(scale, _)| ops_per_second >= *scale)
        .unwrap_or((1.0, ""));
    format!("{:.2} {}{}", ops_per_second / scale, prefix, kind.unit())
}

/// Reduce raw timestamps into min/mean latency and throughput.
/// The minimum is seeded from the first iteration; the mean is the tick sum
/// divided by the iteration count with integer truncation. A zero-tick
/// minimum (or mean) leaves the matching rate unbounded instead of failing;
/// only malformed timestamp arrays are errors.
pub fn reduce(
    timestamps: &[u64],
    period_ns: f64,
    ops_per_dispatch: u64,
    op_kind: OpKind,
) -> Result<BenchmarkResult> {
    let durations = durations(timestamps)?;
    let mut min_ticks = durations[0];
    let mut total: u128 = 0;
    for &d in &durations {
        min_ticks = min_ticks.min(d);
        total += d as u128;
    }
    let mean_ticks = (total / durations.len() as u128) as u64;
    if min_ticks == 0 {
        warn!(
            "an iteration took zero ticks (mean {mean_ticks}); the timestamp period is too \
             coarse for this workload, peak throughput is unbounded"
        );
    }

    let min_ns = min_ticks as f64 * period_ns;
    let mean_ns = mean_ticks as f64 * period_ns;
    let per_second = |ns: f64| (ns > 0.0).then(|| ops_per_dispatch as f64 / ns * 1e9);

    Ok(BenchmarkResult {
        min_ticks,
        mean_ticks,
        min_ns,
        mean_ns,
        max_throughput: per_second(min_ns),
        mean_throughput: per_second(mean_ns),
        ops_per_dispatch,
        op_kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_and_truncated_mean() {
        let r = reduce(&[10, 30, 10, 50, 10, 20], 1.0, 1000, OpKind::Float).unwrap();
        assert_eq!(r.min_ticks, 10);
        assert_eq!(r.mean_ticks, 23);
        assert_eq!(r.min_ns, 10.0);
        assert_eq!(r.mean_ns, 23.0);
    }

    #[test]
    fn period_scales_ticks_to_nanoseconds() {
        let r = reduce(&[0, 100], 2.5, 1_000_000, OpKind::Integer).unwrap();
        assert_eq!(r.min_ns, 250.0);
        // 1e6 ops / 250 ns = 4000 Gops/s
        assert!((r.max_giga().unwrap() - 4000.0).abs() < 1e-6);
        assert_eq!(r.max_line(), "Max. 4000.00 GIOP/s");
    }

    #[test]
    fn malformed_timestamps_are_errors() {
        assert!(reduce(&[], 1.0, 1, OpKind::Float).is_err());
        assert!(reduce(&[1, 2, 3], 1.0, 1, OpKind::Float).is_err());
        let err = reduce(&[50, 10], 1.0, 1, OpKind::Float).unwrap_err();
        assert!(err.to_string().contains("ends before it starts"));
    }

    #[test]
    fn op_kind_follows_accumulator() {
        assert_eq!(OpKind::for_accumulator(ComponentType::F16), OpKind::Float);
        assert_eq!(OpKind::for_accumulator(ComponentType::F64), OpKind::Float);
        assert_eq!(OpKind::for_accumulator(ComponentType::S32), OpKind::Integer);
        assert_eq!(OpKind::Float.unit(), "FLOP/s");
        assert_eq!(OpKind::Integer.unit(), "IOP/s");
    }

    #[test]
    fn ops_model_multiplies_every_factor() {
        let ops = ops_per_dispatch(1056, 256, Tile::new(16, 16, 16), 8, 4).unwrap();
        assert_eq!(ops, 1056 * 256 * 16 * 16 * 16 * 2 * 8 * 4);
    }

    #[test]
    fn zero_tick_iteration_keeps_the_mean() {
        let r = reduce(&[5, 5, 5, 9], 1.0, 100, OpKind::Float).unwrap();
        assert_eq!(r.min_ticks, 0);
        assert_eq!(r.mean_ticks, 2);
        assert_eq!(r.max_throughput, None);
        // 100 ops / 2 ns
        assert!((r.mean_throughput.unwrap() - 50e9).abs() < 1e-3);
        assert_eq!(r.max_line(), "Max. unbounded GFLOP/s (zero-tick iteration)");
        assert_eq!(r.avg_line(), "Avg. 50.00 GFLOP/s");
        assert_eq!(r.peak_for_ranking(), f64::INFINITY);
    }

    #[test]
    fn all_zero_ticks_leave_both_rates_unbounded() {
        let r = reduce(&[7, 7, 9, 9], 1.0, 100, OpKind::Integer).unwrap();
        assert_eq!(r.mean_throughput, None);
        assert_eq!(r.mean_throughput_string(), "unbounded IOP/s");
    }

    #[test]
    fn unbounded_peak_survives_json() {
        let r = reduce(&[5, 5, 5, 9], 1.0, 100, OpKind::Float).unwrap();
        let back: BenchmarkResult =
            serde_json::from_str(&serde_json::to_string(&r).unwrap()).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn oversized_ops_count_is_a_configuration_error() {
        let err = ops_per_dispatch(1 << 20, 1 << 20, Tile::new(16, 16, 16), 1 << 12, 1 << 12)
            .unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn human_rate_picks_prefix() {
        assert_eq!(human_rate(1.5e12, OpKind::Float), "1.50 TFLOP/s");
        assert_eq!(human_rate(12.0, OpKind::Integer), "12.00 IOP/s");
    }
}
