/// One benchmark instance: a (device, variant) pair.
///
/// The kernel is resolved through the cache before anything is allocated,
/// so a compile error never leaves device resources behind. A run allocates
/// its resource set and pipeline, executes, and tears them down in reverse
/// order before returning.
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::config::BenchConfig;
use crate::error::{BenchError, Result};
use crate::executor::{ExecutionEngine, ExecutionPlan};
use crate::gpu::Gpu;
use crate::kernel::{CacheKey, GlslCompiler, KernelCache, KernelHandle, KernelParams};
use crate::memory::ResourceSet;
use crate::pipeline::SpecializedPipeline;
use crate::stats::{self, BenchmarkResult, OpKind};
use crate::variant::EligibleVariant;

pub type ShaderCache = KernelCache<vk::ShaderModule>;
pub type CompiledKernel = KernelHandle<vk::ShaderModule>;

/// Look up or build the kernel for `variant` on `gpu`.
pub fn resolve_kernel(
    gpu: &Gpu,
    cache: &ShaderCache,
    compiler: &GlslCompiler,
    template: &Arc<str>,
    variant: &EligibleVariant,
    config: &BenchConfig,
) -> Result<CompiledKernel> {
    let key = CacheKey::new(gpu.id, variant);
    let params = KernelParams {
        subgroup_size: variant.subgroup_size,
        insts_in_block: config.insts_in_block,
        blocks_in_kernel: config.blocks_in_kernel,
    };
    cache.get_or_compile(key, params, template, |source| {
        let spirv = compiler.compile(source)?;
        gpu.create_shader_module(&spirv)
    })
}

/// Outcome of one run with its diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub result: BenchmarkResult,
    pub wait_retries: u32,
}

pub struct Benchmark<'a> {
    gpu: &'a Gpu,
    variant: EligibleVariant,
    kernel: CompiledKernel,
    plan: ExecutionPlan,
    insts_in_block: u32,
    ops_per_dispatch: u64,
}

impl<'a> Benchmark<'a> {
    /// Fails without touching the device when the operation count of one
    /// dispatch does not fit a u64.
    pub fn new(
        gpu: &'a Gpu,
        variant: EligibleVariant,
        kernel: CompiledKernel,
        config: &BenchConfig,
    ) -> Result<Self> {
        let ops_per_dispatch = stats::ops_per_dispatch(
            config.num_groups,
            config.inner_iterations,
            variant.tile(),
            config.insts_in_block,
            config.blocks_in_kernel,
        )?;
        Ok(Benchmark {
            gpu,
            variant,
            kernel,
            plan: ExecutionPlan {
                groups: config.num_groups,
                inner_iterations: config.inner_iterations,
                outer_iterations: config.outer_iterations,
            },
            insts_in_block: config.insts_in_block,
            ops_per_dispatch,
        })
    }

    pub fn run(&self) -> Result<RunOutcome> {
        let configuration = self.gpu.configuration().ok_or_else(|| {
            BenchError::Configuration(format!(
                "{} has no binding configuration; it is created after the first compile",
                self.gpu.id
            ))
        })?;

        let resources =
            ResourceSet::allocate(self.gpu, &self.variant, self.plan.groups, self.insts_in_block)?;
        let pipeline = SpecializedPipeline::build(
            self.gpu.device(),
            configuration,
            &self.kernel,
            self.variant.tile(),
        )?;

        let sample =
            ExecutionEngine::new(self.gpu).run(configuration, &resources, &pipeline, &self.plan)?;
        drop(pipeline);
        drop(resources);
        debug!("{} timestamps read for {}", sample.timestamps.len(), self.variant.descriptor);

        let result = stats::reduce(
            &sample.timestamps,
            self.gpu.caps.timestamp_period as f64,
            self.ops_per_dispatch,
            OpKind::for_accumulator(self.variant.c_type),
        )?;
        info!(
            "{}: {} -> min {:.0} ns, mean {:.0} ns",
            self.gpu.id, self.variant.descriptor, result.min_ns, result.mean_ns
        );
        Ok(RunOutcome {
            result,
            wait_retries: sample.wait_retries,
        })
    }
}
