/// Harness: drives every device and eligible variant sequentially.
///
/// Per device: filter the advertised variants, then for each eligible one
/// resolve its kernel, create the device's binding configuration on first
/// use, and run a benchmark instance. Compiled kernels and configurations
/// outlive the runs and are released in one sweep by [`Harness::shutdown`].
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::benchmark::{resolve_kernel, Benchmark, ShaderCache};
use crate::capability;
use crate::config::BenchConfig;
use crate::error::Result;
use crate::gpu::{device_type_name, Gpu};
use crate::kernel::{GlslCompiler, COOPMAT_TEMPLATE};
use crate::metrics::{
    now_ms, write_metrics, BenchReport, DeviceReport, LiveMetrics, Phase, VariantReport,
};

pub struct Harness {
    config: BenchConfig,
    template: Arc<str>,
    compiler: GlslCompiler,
    cache: ShaderCache,
    live: Option<PathBuf>,
    metrics: LiveMetrics,
    report: BenchReport,
}

impl Harness {
    /// Validate the configuration and load the kernel template.
    /// `live` enables snapshot publishing to the given path.
    pub fn new(config: BenchConfig, live: Option<PathBuf>) -> Result<Self> {
        config.validate()?;
        let template: Arc<str> = match &config.template {
            Some(path) => {
                info!("Using kernel template {}", path.display());
                Arc::from(std::fs::read_to_string(path)?)
            }
            None => Arc::from(COOPMAT_TEMPLATE),
        };
        Ok(Harness {
            metrics: LiveMetrics::new(&config),
            report: BenchReport::new(config.clone()),
            config,
            template,
            compiler: GlslCompiler::new()?,
            cache: ShaderCache::new(),
            live,
        })
    }

    pub fn report(&self) -> &BenchReport {
        &self.report
    }

    /// Benchmark every device in order. The first fatal error stops the run.
    pub fn run(&mut self, gpus: &mut [Gpu]) -> Result<()> {
        self.publish();
        for gpu in gpus.iter_mut() {
            if let Err(e) = self.run_device(gpu) {
                self.metrics.phase = Phase::Failed;
                self.metrics.last_error = Some(e.to_string());
                self.publish();
                return Err(e);
            }
        }
        self.report.finished_ms = now_ms();
        self.metrics.phase = Phase::Complete;
        self.metrics.current_variant.clear();
        self.publish();
        info!(
            "Finished: {} variants benchmarked, {} kernels compiled",
            self.metrics.variants_done,
            self.cache.compile_count()
        );
        Ok(())
    }

    fn run_device(&mut self, gpu: &mut Gpu) -> Result<()> {
        let subgroup_size = gpu.caps.resolve_subgroup_size(self.config.subgroup_size);
        info!(
            "{}: benchmarking {} with subgroup size {}",
            gpu.id, gpu.caps.name, subgroup_size
        );
        let outcome = capability::filter(&gpu.variants, subgroup_size);

        self.metrics.device = gpu.id.to_string();
        self.metrics.device_name = gpu.caps.name.clone();
        self.metrics.variants_total += outcome.eligible.len();
        self.metrics.variants_skipped += outcome.skipped.len();
        self.report.devices.push(DeviceReport {
            id: gpu.id,
            name: gpu.caps.name.clone(),
            device_type: device_type_name(gpu.caps.device_type).to_string(),
            driver: format!("{} {}", gpu.caps.driver_name, gpu.caps.driver_version),
            subgroup_size,
            timestamp_period_ns: gpu.caps.timestamp_period,
            advertised: gpu.variants.len(),
            results: Vec::new(),
            skipped: outcome.skipped,
        });

        for variant in &outcome.eligible {
            self.metrics.phase = Phase::Compiling;
            self.metrics.current_variant = variant.descriptor.to_string();
            self.publish();

            let kernel = resolve_kernel(
                gpu,
                &self.cache,
                &self.compiler,
                &self.template,
                variant,
                &self.config,
            )?;
            gpu.ensure_configuration()?;

            self.metrics.phase = Phase::Running;
            self.publish();

            let run = Benchmark::new(gpu, *variant, kernel, &self.config)?.run()?;
            let result = run.result;
            info!(
                "{}: {}  {}  {}",
                gpu.id,
                variant.descriptor,
                result.max_line(),
                result.avg_line()
            );

            let entry = VariantReport {
                device: gpu.id,
                descriptor: variant.descriptor,
                subgroup_size: variant.subgroup_size,
                result,
                wait_retries: run.wait_retries,
            };
            self.metrics.results.push(entry.clone());
            self.metrics.variants_done += 1;
            if let Some(device) = self.report.devices.last_mut() {
                device.results.push(entry);
            }
            self.publish();
        }
        Ok(())
    }

    /// Destroy every cached shader module and every device configuration.
    /// Must run before the devices are dropped. Returns the number of
    /// modules destroyed.
    pub fn shutdown(&mut self, gpus: &mut [Gpu]) -> usize {
        let released = self.cache.release_all(|key, module| {
            match gpus.iter().find(|g| g.id == key.device) {
                Some(gpu) => gpu.destroy_shader_module(module),
                None => warn!("no device {} for cached kernel, leaking it", key.device),
            }
        });
        for gpu in gpus.iter_mut() {
            gpu.release_configuration();
        }
        debug!("released {} shader modules", released);
        released
    }

    fn publish(&mut self) {
        let Some(path) = &self.live else {
            return;
        };
        self.metrics.kernels_compiled = self.cache.compile_count();
        self.metrics.timestamp_ms = now_ms();
        if let Err(e) = write_metrics(path, &self.metrics) {
            warn!("failed to write live snapshot {}: {}", path.display(), e);
        }
    }
}
