/// Vulkan devices.
/// `Vulkan` owns the loader and instance and enumerates physical devices;
/// `Gpu` is one opened logical device with cooperative matrices enabled,
/// its capability record, a compute queue and one reusable command buffer.
use std::ffi::CStr;

use ash::vk;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SubgroupSizePolicy;
use crate::error::{BenchError, Result};
use crate::pipeline::DeviceConfiguration;
use crate::variant::VariantDescriptor;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Index of a physical device in enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gpu{}", self.0)
    }
}

/// Physical capabilities the benchmark depends on.
#[derive(Debug, Clone)]
pub struct DeviceCaps {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub driver_name: String,
    pub driver_version: String,
    pub api_version: u32,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    /// Nanoseconds per timestamp tick
    pub timestamp_period: f32,
    /// Valid timestamp bits of the chosen queue family
    pub timestamp_valid_bits: u32,
    pub subgroup_size: u32,
    pub min_subgroup_size: u32,
    pub max_subgroup_size: u32,
    /// Stages in which cooperative matrices are usable
    pub coopmat_stages: vk::ShaderStageFlags,
}

impl DeviceCaps {
    pub fn resolve_subgroup_size(&self, policy: SubgroupSizePolicy) -> u32 {
        policy.resolve(self.subgroup_size, self.min_subgroup_size, self.max_subgroup_size)
    }
}

pub fn device_type_name(device_type: vk::PhysicalDeviceType) -> &'static str {
    match device_type {
        vk::PhysicalDeviceType::CPU => "CPU",
        vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
        vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
        vk::PhysicalDeviceType::OTHER => "Other",
        _ => "Unknown",
    }
}

/// Decode a vendor-encoded driver version the way vulkaninfo does.
pub fn driver_version_string(version: u32, driver_id: vk::DriverId, device_id: u32) -> String {
    if driver_id == vk::DriverId::NVIDIA_PROPRIETARY || device_id == 4318 {
        format!(
            "{}.{}.{}.{}",
            (version >> 22) & 0x3ff,
            (version >> 14) & 0x0ff,
            (version >> 6) & 0x0ff,
            version & 0x003f
        )
    } else if driver_id == vk::DriverId::INTEL_PROPRIETARY_WINDOWS {
        format!("{}.{}", version >> 14, version & 0x3fff)
    } else {
        format!(
            "{}.{}.{}",
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version)
        )
    }
}

/// Names of the shader stages set in `stages`.
pub fn stage_names(stages: vk::ShaderStageFlags) -> Vec<&'static str> {
    const STAGES: [(vk::ShaderStageFlags, &str); 14] = [
        (vk::ShaderStageFlags::COMPUTE, "compute"),
        (vk::ShaderStageFlags::VERTEX, "vertex"),
        (vk::ShaderStageFlags::GEOMETRY, "geometry"),
        (vk::ShaderStageFlags::FRAGMENT, "fragment"),
        (vk::ShaderStageFlags::TESSELLATION_CONTROL, "tess. control"),
        (vk::ShaderStageFlags::TESSELLATION_EVALUATION, "tess. evaluation"),
        (vk::ShaderStageFlags::RAYGEN_KHR, "raygen"),
        (vk::ShaderStageFlags::MISS_KHR, "miss"),
        (vk::ShaderStageFlags::ANY_HIT_KHR, "any hit"),
        (vk::ShaderStageFlags::CLOSEST_HIT_KHR, "closest hit"),
        (vk::ShaderStageFlags::INTERSECTION_KHR, "intersection"),
        (vk::ShaderStageFlags::CALLABLE_KHR, "callable"),
        (vk::ShaderStageFlags::TASK_EXT, "task"),
        (vk::ShaderStageFlags::MESH_EXT, "mesh"),
    ];
    STAGES
        .iter()
        .filter(|(flag, _)| stages.contains(*flag))
        .map(|(_, name)| *name)
        .collect()
}

fn c_str_lossy(s: std::result::Result<&CStr, std::ffi::FromBytesUntilNulError>) -> String {
    s.map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Loader, instance and the cooperative matrix instance functions.
pub struct Vulkan {
    // Keeps the loader library mapped for the instance's lifetime.
    _entry: ash::Entry,
    instance: ash::Instance,
    coopmat: ash::khr::cooperative_matrix::Instance,
}

impl Vulkan {
    /// Load the Vulkan loader and create a 1.3 instance. Debug builds enable
    /// the Khronos validation layer when it is installed.
    pub fn new() -> Result<Self> {
        // SAFETY: loads the system Vulkan loader; no other Vulkan state exists yet.
        let entry = unsafe { ash::Entry::load()? };

        let mut layers = Vec::new();
        if cfg!(debug_assertions) {
            // SAFETY: entry is a freshly loaded, valid loader.
            let available = unsafe { entry.enumerate_instance_layer_properties() }
                .map_err(BenchError::resource("vkEnumerateInstanceLayerProperties"))?;
            debug!("{} instance layers available", available.len());
            if available
                .iter()
                .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER))
            {
                layers.push(VALIDATION_LAYER.as_ptr());
            }
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"coopmat-bench")
            .application_version(2)
            .engine_name(c"no-engine")
            .engine_version(1)
            .api_version(vk::API_VERSION_1_3);
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers);

        // SAFETY: create_info and everything it points to outlive the call.
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(BenchError::resource("vkCreateInstance"))?;
        info!(
            "Vulkan instance created ({} layer(s) enabled)",
            layers.len()
        );

        let coopmat = ash::khr::cooperative_matrix::Instance::new(&entry, &instance);
        Ok(Vulkan {
            _entry: entry,
            instance,
            coopmat,
        })
    }

    pub fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        // SAFETY: valid instance.
        unsafe { self.instance.enumerate_physical_devices() }
            .map_err(BenchError::resource("vkEnumeratePhysicalDevices"))
    }

    fn supports_coopmat(&self, physical: vk::PhysicalDevice) -> Result<bool> {
        // SAFETY: physical was enumerated from this instance.
        let extensions = unsafe { self.instance.enumerate_device_extension_properties(physical) }
            .map_err(BenchError::resource("vkEnumerateDeviceExtensionProperties"))?;
        Ok(extensions
            .iter()
            .any(|e| e.extension_name_as_c_str() == Ok(ash::khr::cooperative_matrix::NAME)))
    }

    /// Read the capability record. Cooperative matrix properties are only
    /// chained when the extension is present.
    fn describe(&self, physical: vk::PhysicalDevice, coopmat: bool) -> DeviceCaps {
        let mut subgroup_control = vk::PhysicalDeviceSubgroupSizeControlProperties::default();
        let mut vk11 = vk::PhysicalDeviceVulkan11Properties::default();
        let mut vk12 = vk::PhysicalDeviceVulkan12Properties::default();
        let mut coopmat_props = vk::PhysicalDeviceCooperativeMatrixPropertiesKHR::default();

        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut subgroup_control)
            .push_next(&mut vk11)
            .push_next(&mut vk12);
        if coopmat {
            props2 = props2.push_next(&mut coopmat_props);
        }
        // SAFETY: every chained struct lives until after the call.
        unsafe { self.instance.get_physical_device_properties2(physical, &mut props2) };
        let props = props2.properties;

        // SAFETY: physical was enumerated from this instance.
        let memory = unsafe { self.instance.get_physical_device_memory_properties(physical) };
        let timestamp_valid_bits = compute_queue_family(&self.instance, physical)
            .map(|(_, bits)| bits)
            .unwrap_or(0);

        DeviceCaps {
            name: c_str_lossy(props.device_name_as_c_str()),
            device_type: props.device_type,
            driver_name: c_str_lossy(vk12.driver_name_as_c_str()),
            driver_version: driver_version_string(
                props.driver_version,
                vk12.driver_id,
                props.device_id,
            ),
            api_version: props.api_version,
            memory,
            timestamp_period: props.limits.timestamp_period,
            timestamp_valid_bits,
            subgroup_size: vk11.subgroup_size,
            min_subgroup_size: subgroup_control.min_subgroup_size,
            max_subgroup_size: subgroup_control.max_subgroup_size,
            coopmat_stages: coopmat_props.cooperative_matrix_supported_stages,
        }
    }

    /// Enumerate devices, log them, and open every device that exposes
    /// VK_KHR_cooperative_matrix on Vulkan 1.3. `only` restricts the
    /// selection to the given enumeration indices.
    pub fn open_devices(&self, only: &[usize]) -> Result<Vec<Gpu>> {
        let physical = self.physical_devices()?;
        let mut gpus = Vec::new();

        for (index, &pd) in physical.iter().enumerate() {
            let coopmat = self.supports_coopmat(pd)?;
            let caps = self.describe(pd, coopmat);
            info!(
                "Physical device {}: {} ({}), driver {} {}",
                index,
                caps.name,
                device_type_name(caps.device_type),
                caps.driver_name,
                caps.driver_version
            );

            if !only.is_empty() && !only.contains(&index) {
                debug!("device {} not selected, skipping", index);
                continue;
            }
            if !coopmat {
                info!("device {} does not support VK_KHR_cooperative_matrix", index);
                continue;
            }
            if caps.api_version < vk::API_VERSION_1_3 {
                warn!(
                    "device {} only supports Vulkan {}.{}, 1.3 required",
                    index,
                    vk::api_version_major(caps.api_version),
                    vk::api_version_minor(caps.api_version)
                );
                continue;
            }
            gpus.push(self.open(DeviceId(index), pd, caps)?);
        }

        if gpus.is_empty() {
            warn!("No device supports VK_KHR_cooperative_matrix!");
        }
        Ok(gpus)
    }

    fn open(&self, id: DeviceId, physical: vk::PhysicalDevice, caps: DeviceCaps) -> Result<Gpu> {
        let (queue_family, _) = compute_queue_family(&self.instance, physical).ok_or_else(|| {
            BenchError::Configuration(format!("{id} has no compute queue family"))
        })?;

        // Supported features, to enable optional ones only where present.
        let mut s_coopmat = vk::PhysicalDeviceCooperativeMatrixFeaturesKHR::default();
        let mut s11 = vk::PhysicalDeviceVulkan11Features::default();
        let mut s12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut s13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut supported = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut s_coopmat)
            .push_next(&mut s11)
            .push_next(&mut s12)
            .push_next(&mut s13);
        // SAFETY: every chained struct lives until after the call.
        unsafe { self.instance.get_physical_device_features2(physical, &mut supported) };
        let base = supported.features;

        let required = [
            ("cooperativeMatrix", s_coopmat.cooperative_matrix),
            ("bufferDeviceAddress", s12.buffer_device_address),
            ("vulkanMemoryModel", s12.vulkan_memory_model),
            ("subgroupSizeControl", s13.subgroup_size_control),
            ("computeFullSubgroups", s13.compute_full_subgroups),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| *v != vk::TRUE) {
            return Err(BenchError::Configuration(format!(
                "{id} ({}) lacks required feature {name}",
                caps.name
            )));
        }

        let on = |v: vk::Bool32| v == vk::TRUE;
        let mut coopmat = vk::PhysicalDeviceCooperativeMatrixFeaturesKHR::default()
            .cooperative_matrix(true)
            .cooperative_matrix_robust_buffer_access(false);
        let mut vk11 = vk::PhysicalDeviceVulkan11Features::default()
            .storage_buffer16_bit_access(on(s11.storage_buffer16_bit_access));
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default()
            .storage_buffer8_bit_access(on(s12.storage_buffer8_bit_access))
            .shader_float16(on(s12.shader_float16))
            .shader_int8(on(s12.shader_int8))
            .buffer_device_address(true)
            .vulkan_memory_model(true)
            .vulkan_memory_model_device_scope(on(s12.vulkan_memory_model_device_scope));
        let mut vk13 = vk::PhysicalDeviceVulkan13Features::default()
            .subgroup_size_control(true)
            .compute_full_subgroups(true);
        let enabled_base = vk::PhysicalDeviceFeatures::default()
            .shader_float64(on(base.shader_float64))
            .shader_int64(on(base.shader_int64))
            .shader_int16(on(base.shader_int16));
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .features(enabled_base)
            .push_next(&mut coopmat)
            .push_next(&mut vk11)
            .push_next(&mut vk12)
            .push_next(&mut vk13);

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities);
        let extensions = [ash::khr::cooperative_matrix::NAME.as_ptr()];
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut features);

        // SAFETY: create_info and its chain outlive the call.
        let device = unsafe { self.instance.create_device(physical, &create_info, None) }
            .map_err(BenchError::resource("vkCreateDevice"))?;
        info!("Device created for {} ({})", id, caps.name);

        let (command_pool, command_buffer) = match create_command_buffer(&device, queue_family) {
            Ok(pair) => pair,
            Err(e) => {
                // SAFETY: nothing else was created from this device.
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };
        // SAFETY: queue family and index 0 were requested at device creation.
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        // SAFETY: the extension is enabled on this device's physical device.
        let variants = match unsafe {
            self.coopmat
                .get_physical_device_cooperative_matrix_properties(physical)
        } {
            Ok(props) => props.iter().map(VariantDescriptor::from).collect(),
            Err(status) => {
                // SAFETY: pool belongs to this device; nothing is in flight.
                unsafe {
                    device.destroy_command_pool(command_pool, None);
                    device.destroy_device(None);
                }
                return Err(BenchError::Resource {
                    operation: "vkGetPhysicalDeviceCooperativeMatrixPropertiesKHR",
                    status,
                });
            }
        };

        let gpu = Gpu {
            id,
            caps,
            variants,
            device,
            queue,
            command_pool,
            command_buffer,
            configuration: None,
        };
        gpu.log_capabilities();
        Ok(gpu)
    }
}

impl Drop for Vulkan {
    fn drop(&mut self) {
        // SAFETY: every Gpu borrows nothing from the instance and is dropped first.
        unsafe { self.instance.destroy_instance(None) };
        info!("Vulkan instance destroyed");
    }
}

/// First queue family with compute support, with its timestamp valid bits.
fn compute_queue_family(
    instance: &ash::Instance,
    physical: vk::PhysicalDevice,
) -> Option<(u32, u32)> {
    // SAFETY: physical was enumerated from this instance.
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical) };
    families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| (i as u32, families[i].timestamp_valid_bits))
}

fn create_command_buffer(
    device: &ash::Device,
    queue_family: u32,
) -> Result<(vk::CommandPool, vk::CommandBuffer)> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .flags(
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
        .queue_family_index(queue_family);
    // SAFETY: valid device and create info.
    let pool = unsafe { device.create_command_pool(&pool_info, None) }
        .map_err(BenchError::resource("vkCreateCommandPool"))?;

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    // SAFETY: pool was just created from this device.
    match unsafe { device.allocate_command_buffers(&alloc_info) } {
        Ok(buffers) => Ok((pool, buffers[0])),
        Err(status) => {
            // SAFETY: pool has no allocated buffers.
            unsafe { device.destroy_command_pool(pool, None) };
            Err(BenchError::Resource {
                operation: "vkAllocateCommandBuffers",
                status,
            })
        }
    }
}

/// An opened device ready to run benchmarks.
pub struct Gpu {
    pub id: DeviceId,
    pub caps: DeviceCaps,
    /// Raw cooperative matrix variants as advertised by the driver
    pub variants: Vec<VariantDescriptor>,
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    configuration: Option<DeviceConfiguration>,
}

impl Gpu {
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// The device's single command buffer, reused by every benchmark run.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn configuration(&self) -> Option<&DeviceConfiguration> {
        self.configuration.as_ref()
    }

    /// Create the binding configuration on first use.
    pub fn ensure_configuration(&mut self) -> Result<&DeviceConfiguration> {
        if self.configuration.is_none() {
            debug!("creating binding configuration for {}", self.id);
            self.configuration = Some(DeviceConfiguration::new(&self.device)?);
        }
        self.configuration
            .as_ref()
            .ok_or_else(|| BenchError::Configuration(format!("{} has no configuration", self.id)))
    }

    pub fn release_configuration(&mut self) {
        if self.configuration.take().is_some() {
            debug!("released binding configuration for {}", self.id);
        }
    }

    pub fn create_shader_module(&self, spirv: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        // SAFETY: spirv is a complete module produced by the compiler.
        let module = unsafe { self.device.create_shader_module(&info, None) }
            .map_err(BenchError::resource("vkCreateShaderModule"))?;
        debug!("Shader module {:?} created for {}", module, self.id);
        Ok(module)
    }

    /// Destroy a module created by [`Gpu::create_shader_module`].
    /// Pipelines built from it may outlive it; modules are only needed
    /// while a pipeline is being created.
    pub fn destroy_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: called once per module from the kernel cache's bulk release.
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn log_capabilities(&self) {
        let c = &self.caps;
        info!(
            "{}: subgroup size default {} (min {}, max {}), timestamp period {} ns, {} valid bits",
            self.id,
            c.subgroup_size,
            c.min_subgroup_size,
            c.max_subgroup_size,
            c.timestamp_period,
            c.timestamp_valid_bits
        );
        info!(
            "{}: cooperative matrices supported in stages: {}",
            self.id,
            stage_names(c.coopmat_stages).join(", ")
        );
        info!("{}: supported cooperative matrices:", self.id);
        info!("        M  x  N x  K,   A,   B,   C,   D,  scope, sat");
        for v in &self.variants {
            info!("        {}", v.table_row());
        }
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        // SAFETY: the harness has finished every submission on this device;
        // the configuration is dropped before the device that owns it.
        unsafe {
            if let Err(status) = self.device.device_wait_idle() {
                warn!("{}: vkDeviceWaitIdle failed during shutdown: {:?}", self.id, status);
            }
            self.configuration = None;
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
        debug!("{} destroyed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nvidia_driver_version_decoding() {
        let v = (535 << 22) | (104 << 14) | (5 << 6);
        assert_eq!(
            driver_version_string(v, vk::DriverId::NVIDIA_PROPRIETARY, 0x2330),
            "535.104.5.0"
        );
    }

    #[test]
    fn intel_windows_driver_version_decoding() {
        let v = (101 << 14) | 5186;
        assert_eq!(
            driver_version_string(v, vk::DriverId::INTEL_PROPRIETARY_WINDOWS, 0x56a0),
            "101.5186"
        );
    }

    #[test]
    fn standard_driver_version_decoding() {
        let v = vk::make_api_version(0, 2, 0, 279);
        assert_eq!(
            driver_version_string(v, vk::DriverId::AMD_PROPRIETARY, 0x744c),
            "2.0.279"
        );
    }

    #[test]
    fn stage_names_lists_set_flags_only() {
        let names = stage_names(vk::ShaderStageFlags::COMPUTE | vk::ShaderStageFlags::MESH_EXT);
        assert_eq!(names, vec!["compute", "mesh"]);
        assert!(stage_names(vk::ShaderStageFlags::empty()).is_empty());
    }

    #[test]
    fn device_ids_display_as_gpu_index() {
        assert_eq!(DeviceId(2).to_string(), "gpu2");
        assert_eq!(device_type_name(vk::PhysicalDeviceType::DISCRETE_GPU), "Discrete GPU");
    }
}
