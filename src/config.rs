/// Harness configuration: work sizes per dispatch and measurement counts.
/// Loaded from defaults, an optional JSON file and command-line overrides,
/// in that order of precedence.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};
use crate::kernel::STORE_SENTINEL_ITERATIONS;

/// Which subgroup width the kernel is compiled and pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SubgroupSizePolicy {
    /// The device's default subgroup size.
    #[default]
    Default,
    /// The smallest size in the subgroup size control range.
    Min,
    /// The largest size in the subgroup size control range.
    Max,
}

impl SubgroupSizePolicy {
    pub fn resolve(self, default: u32, min: u32, max: u32) -> u32 {
        match self {
            SubgroupSizePolicy::Default => default,
            SubgroupSizePolicy::Min => min,
            SubgroupSizePolicy::Max => max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Unrolled multiply-accumulate blocks per kernel loop iteration
    pub blocks_in_kernel: u32,
    /// Independent accumulators (MMA instructions) per block
    pub insts_in_block: u32,
    /// Work-groups per dispatch
    pub num_groups: u32,
    /// Loop count inside the kernel, passed as a push constant
    pub inner_iterations: u32,
    /// Timed dispatches per benchmark
    pub outer_iterations: u32,
    pub subgroup_size: SubgroupSizePolicy,
    /// Kernel template override; the embedded template is used when unset
    pub template: Option<PathBuf>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self::gh200()
    }
}

impl BenchConfig {
    /// Sizes that reach roughly 95% of the Vulkan-attainable peak on GH200.
    /// The group count is 132 SMs x 8 resident work-groups.
    pub fn gh200() -> Self {
        BenchConfig {
            blocks_in_kernel: 4,
            insts_in_block: 8,
            num_groups: 132 * 8,
            inner_iterations: 256,
            outer_iterations: 10,
            subgroup_size: SubgroupSizePolicy::Default,
            template: None,
        }
    }

    /// A tiny configuration for smoke runs on slow or emulated devices.
    pub fn smoke() -> Self {
        BenchConfig {
            blocks_in_kernel: 1,
            insts_in_block: 1,
            num_groups: 8,
            inner_iterations: 4,
            outer_iterations: 2,
            subgroup_size: SubgroupSizePolicy::Default,
            template: None,
        }
    }

    /// Load a JSON config file; missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: BenchConfig = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("blocks_in_kernel", self.blocks_in_kernel),
            ("insts_in_block", self.insts_in_block),
            ("num_groups", self.num_groups),
            ("inner_iterations", self.inner_iterations),
            ("outer_iterations", self.outer_iterations),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(BenchError::Configuration(format!("{name} must be at least 1")));
            }
        }
        // Two timestamp queries per outer iteration must fit a u32 query count.
        if self.outer_iterations > u32::MAX / 2 {
            return Err(BenchError::Configuration(format!(
                "outer_iterations {} exceeds the timestamp query limit",
                self.outer_iterations
            )));
        }
        if self.inner_iterations == STORE_SENTINEL_ITERATIONS {
            return Err(BenchError::Configuration(format!(
                "inner_iterations {} is reserved by the kernel",
                self.inner_iterations
            )));
        }
        // Tile-independent part of the per-dispatch operation count; the
        // tile factor is checked per variant.
        let factors = [self.inner_iterations, self.insts_in_block, self.blocks_in_kernel];
        if factors
            .into_iter()
            .try_fold(self.num_groups as u64, |acc, f| acc.checked_mul(f as u64))
            .is_none()
        {
            return Err(BenchError::Configuration(format!(
                "num_groups x inner_iterations x insts_in_block x blocks_in_kernel \
                 ({} x {} x {} x {}) overflows 64 bits",
                self.num_groups, self.inner_iterations, self.insts_in_block, self.blocks_in_kernel
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_gh200_preset() {
        let c = BenchConfig::default();
        assert_eq!(c.num_groups, 1056);
        assert_eq!(c.inner_iterations, 256);
        assert_eq!(c.outer_iterations, 10);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn zero_outer_iterations_rejected() {
        let c = BenchConfig {
            outer_iterations: 0,
            ..BenchConfig::default()
        };
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("outer_iterations"));
    }

    #[test]
    fn reserved_iteration_count_rejected() {
        let c = BenchConfig {
            inner_iterations: STORE_SENTINEL_ITERATIONS,
            ..BenchConfig::default()
        };
        assert!(c.validate().unwrap_err().to_string().contains("reserved"));
    }

    #[test]
    fn overflowing_dispatch_shape_rejected() {
        let c = BenchConfig {
            num_groups: 1 << 20,
            inner_iterations: 1 << 20,
            insts_in_block: 1 << 12,
            blocks_in_kernel: 1 << 12,
            ..BenchConfig::default()
        };
        let err = c.validate().unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let c: BenchConfig =
            serde_json::from_str(r#"{ "num_groups": 64, "subgroup_size": "min" }"#).unwrap();
        assert_eq!(c.num_groups, 64);
        assert_eq!(c.subgroup_size, SubgroupSizePolicy::Min);
        assert_eq!(c.blocks_in_kernel, 4);
    }

    #[test]
    fn subgroup_policy_resolution() {
        assert_eq!(SubgroupSizePolicy::Default.resolve(64, 32, 64), 64);
        assert_eq!(SubgroupSizePolicy::Min.resolve(64, 32, 64), 32);
        assert_eq!(SubgroupSizePolicy::Max.resolve(32, 32, 64), 64);
    }
}
