/// Execution engine.
/// Records one command buffer with `outer_iterations` timestamp-bracketed
/// dispatches, submits it once, waits for the queue and reads the
/// timestamps back.
use ash::vk;
use tracing::{debug, warn};

use crate::error::{BenchError, Result};
use crate::gpu::Gpu;
use crate::kernel::STORE_SENTINEL_ITERATIONS;
use crate::memory::ResourceSet;
use crate::pipeline::{DeviceConfiguration, SpecializedPipeline};

/// Dispatch shape and iteration counts of one benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Work-groups per dispatch
    pub groups: u32,
    /// Kernel loop count, pushed as a constant
    pub inner_iterations: u32,
    /// Timed dispatches
    pub outer_iterations: u32,
}

impl ExecutionPlan {
    pub fn query_count(&self) -> u32 {
        self.outer_iterations * 2
    }

    /// Rejects plans the kernel or the query pool cannot run.
    pub fn check(&self) -> Result<()> {
        if self.groups == 0 || self.outer_iterations == 0 {
            return Err(BenchError::Configuration(format!(
                "empty plan: {} groups x {} timed dispatches",
                self.groups, self.outer_iterations
            )));
        }
        if self.outer_iterations > u32::MAX / 2 {
            return Err(BenchError::Configuration(format!(
                "{} timed dispatches exceed the timestamp query limit",
                self.outer_iterations
            )));
        }
        if self.inner_iterations == STORE_SENTINEL_ITERATIONS {
            return Err(BenchError::Configuration(
                "inner iteration count is reserved by the kernel".into(),
            ));
        }
        Ok(())
    }
}

/// Raw timestamps of one run: `[start0, end0, start1, end1, ...]` in ticks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimingSample {
    pub timestamps: Vec<u64>,
    /// Times the queue wait timed out before completing
    pub wait_retries: u32,
}

/// Wait until `wait` succeeds. Timeouts and not-ready statuses are retried
/// without limit; any other status is returned as a wait error. Returns the
/// number of retries.
pub fn wait_idle_with_retry<F>(mut wait: F) -> Result<u32>
where
    F: FnMut() -> std::result::Result<(), vk::Result>,
{
    let mut retries = 0;
    loop {
        match wait() {
            Ok(()) => return Ok(retries),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                warn!("Timed out, waiting again");
                retries += 1;
            }
            Err(status) => return Err(BenchError::Wait(status)),
        }
    }
}

/// Timestamp query pool destroyed when dropped.
struct QueryPool<'a> {
    device: &'a ash::Device,
    pool: vk::QueryPool,
}

impl<'a> QueryPool<'a> {
    fn new(device: &'a ash::Device, count: u32) -> Result<Self> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        // SAFETY: valid device and create info.
        let pool = unsafe { device.create_query_pool(&info, None) }
            .map_err(BenchError::resource("vkCreateQueryPool"))?;
        Ok(QueryPool { device, pool })
    }
}

impl Drop for QueryPool<'_> {
    fn drop(&mut self) {
        // SAFETY: results were read, or the submission never happened.
        unsafe { self.device.destroy_query_pool(self.pool, None) };
    }
}

/// Drives timed runs on one device's queue and command buffer.
pub struct ExecutionEngine<'a> {
    gpu: &'a Gpu,
}

impl<'a> ExecutionEngine<'a> {
    pub fn new(gpu: &'a Gpu) -> Self {
        ExecutionEngine { gpu }
    }

    pub fn run(
        &self,
        config: &DeviceConfiguration,
        resources: &ResourceSet,
        pipeline: &SpecializedPipeline,
        plan: &ExecutionPlan,
    ) -> Result<TimingSample> {
        plan.check()?;
        if self.gpu.caps.timestamp_valid_bits == 0 {
            return Err(BenchError::Configuration(format!(
                "{} does not support timestamps on its compute queue",
                self.gpu.id
            )));
        }
        let device = self.gpu.device();

        config.bind_address_table(resources.table_buffer());
        let queries = QueryPool::new(device, plan.query_count())?;

        self.record(config, pipeline, queries.pool, plan)?;

        let command_buffers = [self.gpu.command_buffer()];
        let submit = vk::SubmitInfo::default().command_buffers(&command_buffers);
        debug!(
            "{}: submitting {} dispatches of {} groups",
            self.gpu.id, plan.outer_iterations, plan.groups
        );
        // SAFETY: the command buffer is fully recorded and the queue is idle.
        unsafe { device.queue_submit(self.gpu.queue(), &[submit], vk::Fence::null()) }
            .map_err(BenchError::Submission)?;

        // SAFETY: the queue belongs to this device.
        let wait_retries =
            wait_idle_with_retry(|| unsafe { device.queue_wait_idle(self.gpu.queue()) })?;

        let mut timestamps = vec![0u64; plan.query_count() as usize];
        // SAFETY: every query was written by the completed submission.
        unsafe {
            device.get_query_pool_results(
                queries.pool,
                0,
                &mut timestamps,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }
        .map_err(BenchError::resource("vkGetQueryPoolResults"))?;

        let bits = self.gpu.caps.timestamp_valid_bits;
        if bits < 64 {
            let mask = (1u64 << bits) - 1;
            timestamps.iter_mut().for_each(|t| *t &= mask);
        }
        Ok(TimingSample {
            timestamps,
            wait_retries,
        })
    }

    fn record(
        &self,
        config: &DeviceConfiguration,
        pipeline: &SpecializedPipeline,
        queries: vk::QueryPool,
        plan: &ExecutionPlan,
    ) -> Result<()> {
        let device = self.gpu.device();
        let cmd = self.gpu.command_buffer();
        let layout = config.pipeline_layout();

        // SAFETY: the previous submission on this command buffer has completed
        // and its pool allows individual resets.
        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(BenchError::resource("vkResetCommandBuffer"))?;
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin)
                .map_err(BenchError::resource("vkBeginCommandBuffer"))?;

            device.cmd_reset_query_pool(cmd, queries, 0, plan.query_count());
            device.cmd_push_constants(
                cmd,
                layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                &plan.inner_iterations.to_ne_bytes(),
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                layout,
                0,
                &[config.descriptor_set()],
                &[],
            );
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.handle());

            for i in 0..plan.outer_iterations {
                device.cmd_write_timestamp(
                    cmd,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    queries,
                    2 * i,
                );
                device.cmd_dispatch(cmd, plan.groups, 1, 1);
                device.cmd_write_timestamp(
                    cmd,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    queries,
                    2 * i + 1,
                );
            }

            device
                .end_command_buffer(cmd)
                .map_err(BenchError::resource("vkEndCommandBuffer"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_are_retried_until_success() {
        let mut statuses = vec![
            Err(vk::Result::TIMEOUT),
            Err(vk::Result::NOT_READY),
            Err(vk::Result::TIMEOUT),
            Ok(()),
        ]
        .into_iter();
        let retries = wait_idle_with_retry(|| statuses.next().unwrap()).unwrap();
        assert_eq!(retries, 3);
    }

    #[test]
    fn device_lost_is_surfaced_with_raw_status() {
        let mut calls = 0;
        let err = wait_idle_with_retry(|| {
            calls += 1;
            if calls < 2 {
                Err(vk::Result::TIMEOUT)
            } else {
                Err(vk::Result::ERROR_DEVICE_LOST)
            }
        })
        .unwrap_err();
        assert!(matches!(err, BenchError::Wait(vk::Result::ERROR_DEVICE_LOST)));
        assert!(err.to_string().contains("ERROR_DEVICE_LOST"));
        assert_eq!(calls, 2);
    }

    #[test]
    fn two_queries_per_outer_iteration() {
        let plan = ExecutionPlan {
            groups: 8,
            inner_iterations: 4,
            outer_iterations: 10,
        };
        assert_eq!(plan.query_count(), 20);
        assert!(plan.check().is_ok());
    }

    #[test]
    fn sentinel_iteration_count_is_never_dispatched() {
        let plan = ExecutionPlan {
            groups: 1,
            inner_iterations: STORE_SENTINEL_ITERATIONS,
            outer_iterations: 1,
        };
        let err = plan.check().unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));

        let empty = ExecutionPlan {
            groups: 0,
            ..plan
        };
        assert!(empty.check().is_err());
    }
}
