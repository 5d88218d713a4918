//! Cooperative matrix throughput benchmark.
//!
//! Enumerates every Vulkan device exposing `VK_KHR_cooperative_matrix`,
//! benchmarks each supported subgroup-scope variant and prints the peak and
//! average throughput per variant.
//!
//! ```bash
//! coopmat-bench                           # all devices, GH200-tuned sizes
//! coopmat-bench --device 1 --groups 512   # one device, fewer work-groups
//! coopmat-bench --report out.json --live  # JSON report + dashboard feed
//! cargo run --bin viz                     # in a second terminal
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use coopmat_bench::config::{BenchConfig, SubgroupSizePolicy};
use coopmat_bench::gpu::Vulkan;
use coopmat_bench::harness::Harness;
use coopmat_bench::metrics::{BenchReport, LIVE_PATH};
use coopmat_bench::trace::{self, TraceOptions};

#[derive(Parser, Debug)]
#[command(name = "coopmat-bench")]
#[command(about = "Measure VK_KHR_cooperative_matrix throughput on every device")]
#[command(version)]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only benchmark these device indices (repeatable)
    #[arg(short, long)]
    device: Vec<usize>,

    /// Kernel template to use instead of the embedded one
    #[arg(long)]
    template: Option<PathBuf>,

    /// Write a JSON report of every result and skip
    #[arg(long)]
    report: Option<PathBuf>,

    /// Publish live snapshots for the viz dashboard
    #[arg(long, num_args = 0..=1, default_missing_value = LIVE_PATH)]
    live: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Use the tiny smoke-test preset as the base configuration
    #[arg(long, conflicts_with = "config")]
    smoke: bool,

    #[arg(long, value_enum)]
    subgroup_size: Option<SubgroupSizePolicy>,

    /// Work-groups per dispatch
    #[arg(long)]
    groups: Option<u32>,

    /// Kernel loop count per dispatch
    #[arg(long)]
    inner_iterations: Option<u32>,

    /// Timed dispatches per variant
    #[arg(long)]
    outer_iterations: Option<u32>,

    #[arg(long)]
    insts_in_block: Option<u32>,

    #[arg(long)]
    blocks_in_kernel: Option<u32>,
}

impl Args {
    fn bench_config(&self) -> Result<BenchConfig> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None if self.smoke => BenchConfig::smoke(),
            None => BenchConfig::default(),
        };
        if let Some(v) = self.subgroup_size {
            config.subgroup_size = v;
        }
        if let Some(v) = self.groups {
            config.num_groups = v;
        }
        if let Some(v) = self.inner_iterations {
            config.inner_iterations = v;
        }
        if let Some(v) = self.outer_iterations {
            config.outer_iterations = v;
        }
        if let Some(v) = self.insts_in_block {
            config.insts_in_block = v;
        }
        if let Some(v) = self.blocks_in_kernel {
            config.blocks_in_kernel = v;
        }
        if self.template.is_some() {
            config.template = self.template.clone();
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    trace::init(if args.quiet {
        TraceOptions::quiet()
    } else {
        TraceOptions::default()
    });

    let config = args.bench_config()?;
    let mut harness = Harness::new(config, args.live.clone())?;

    // Declared before the devices so the instance is destroyed last.
    let vulkan = Vulkan::new().context("failed to initialize Vulkan")?;
    let mut gpus = vulkan
        .open_devices(&args.device)
        .context("failed to open devices")?;

    let outcome = harness.run(&mut gpus);
    harness.shutdown(&mut gpus);
    drop(gpus);

    if let Err(e) = &outcome {
        error!("{}", e);
    }
    print_summary(harness.report());

    if let Some(path) = &args.report {
        harness
            .report()
            .write(path)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    outcome.context("benchmark run aborted")?;
    Ok(())
}

fn print_summary(report: &BenchReport) {
    for device in &report.devices {
        println!();
        println!(
            "{} {} ({}, driver {})",
            device.id, device.name, device.device_type, device.driver
        );
        println!(
            "  {:<16} {:>4} {:>4} {:>4} {:>12} {:>12} {:>20}",
            "M x N x K", "A", "B", "C", "min ns", "mean ns", "peak"
        );
        for r in &device.results {
            let d = &r.descriptor;
            println!(
                "  {:<16} {:>4} {:>4} {:>4} {:>12.0} {:>12.0} {:>20}",
                d.tile.to_string(),
                coopmat_bench::variant::component_name(d.a_type),
                coopmat_bench::variant::component_name(d.b_type),
                coopmat_bench::variant::component_name(d.c_type),
                r.result.min_ns,
                r.result.mean_ns,
                r.result.throughput_string(),
            );
            println!("      {}   {}", r.result.max_line(), r.result.avg_line());
        }
        if !device.skipped.is_empty() {
            println!(
                "  skipped {} of {} advertised variants",
                device.skipped.len(),
                device.advertised
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke_and_config_file_are_exclusive() {
        let err = Args::try_parse_from(["coopmat-bench", "--smoke", "--config", "c.json"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn smoke_preset_takes_flag_overrides() {
        let args = Args::try_parse_from(["coopmat-bench", "--smoke", "--groups", "3"]).unwrap();
        let config = args.bench_config().unwrap();
        assert_eq!(config.num_groups, 3);
        assert_eq!(config.outer_iterations, BenchConfig::smoke().outer_iterations);
    }
}
