/// Error taxonomy for the benchmark harness.
///
/// Every variant except the transient wait statuses (which are retried inside
/// the executor and never surface) is fatal: it unwinds out of the benchmark
/// instance and stops the run.
use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Debug, Error)]
pub enum BenchError {
    /// Invalid harness configuration or a capability invariant violation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Sibling operand buffers resolved to different memory types.
    #[error(
        "{region} buffers resolved to different memory types (A={a}, B={b}, C={c}); \
         heterogeneous heaps are not supported"
    )]
    HeterogeneousMemory {
        region: &'static str,
        a: u32,
        b: u32,
        c: u32,
    },

    /// No memory type satisfies the requested property flags.
    #[error("no memory type with filter={type_bits:#x} flags={flags:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// The shader compiler rejected the specialized kernel source.
    #[error("GLSL->SPIR-V compilation of kernel '{kernel}' failed: {message}")]
    Compile { kernel: String, message: String },

    /// A Vulkan creation, allocation, binding or lookup call failed.
    #[error("{operation} failed: {status:?}")]
    Resource {
        operation: &'static str,
        status: vk::Result,
    },

    #[error("failed submitting command buffer to queue: {0:?}")]
    Submission(vk::Result),

    #[error("failed waiting until queue idle: {0:?}")]
    Wait(vk::Result),

    /// Timestamp data that cannot be reduced into durations.
    #[error("invalid timestamp data: {0}")]
    Timestamps(String),

    #[error("failed to load the Vulkan loader: {0}")]
    Loader(#[from] ash::LoadingError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    /// Shorthand for wrapping a failed Vulkan call.
    pub fn resource(operation: &'static str) -> impl FnOnce(vk::Result) -> BenchError {
        move |status| BenchError::Resource { operation, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_error_names_operation_and_status() {
        let err = BenchError::resource("vkCreateBuffer")(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let msg = err.to_string();
        assert!(msg.contains("vkCreateBuffer"));
        assert!(msg.contains("ERROR_OUT_OF_DEVICE_MEMORY"));
    }

    #[test]
    fn heterogeneous_memory_has_distinct_diagnostic() {
        let err = BenchError::HeterogeneousMemory {
            region: "device-local",
            a: 0,
            b: 1,
            c: 0,
        };
        assert!(err.to_string().contains("heterogeneous heaps"));
    }
}
